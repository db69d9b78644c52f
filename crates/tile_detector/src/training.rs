//! Loads georeferenced training chips and their YOLO label files.
//!
//! Chips are GeoTIFFs found anywhere under a search directory. A chip at
//! `<dir>/<name>.tif` has its labels at `<dir><suffix>/<name>.txt`; a chip
//! without a label file is stored with a label count of zero.

use futures::stream::{self, StreamExt};
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tiff::decoder::Decoder;
use tiff::tags::Tag;
use tilegeo::{parse_lines, GeoExtent, GeometryError, ImageRecord, LabelEncoding, LabelError, LabelRecord, PixelSize};
use walkdir::WalkDir;

use crate::metrics::Metrics;
use crate::orchestrator::{label_records, BatchTotals, TileOutcome, TileProcessor};

#[derive(Debug, thiserror::Error)]
pub enum ChipError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("decoding GeoTIFF failed: {0}")]
    Tiff(#[from] tiff::TiffError),
    #[error("GeoTIFF has no {0} tag")]
    MissingTag(&'static str),
    #[error("{tag} has {got} values, expected at least {expected}")]
    ShortTag {
        tag: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("invalid chip bounds: {0}")]
    Geometry(#[from] GeometryError),
    #[error("invalid label file {}: {source}", path.display())]
    Label {
        path: PathBuf,
        #[source]
        source: LabelError,
    },
    #[error("chip task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Bounds of a north-up raster from its GeoTIFF pixel scale
/// (`[sx, sy, sz]`) and tiepoint (`[i, j, k, x, y, z]`).
pub fn chip_extent(width: u32, height: u32, scale: &[f64], tiepoint: &[f64]) -> Result<GeoExtent, ChipError> {
    if scale.len() < 2 {
        return Err(ChipError::ShortTag { tag: "ModelPixelScale", expected: 2, got: scale.len() });
    }
    if tiepoint.len() < 6 {
        return Err(ChipError::ShortTag { tag: "ModelTiepoint", expected: 6, got: tiepoint.len() });
    }

    let (sx, sy) = (scale[0], scale[1]);
    let x_min = tiepoint[3] - tiepoint[0] * sx;
    let y_max = tiepoint[4] + tiepoint[1] * sy;
    Ok(GeoExtent::new(
        x_min,
        y_max - f64::from(height) * sy,
        x_min + f64::from(width) * sx,
        y_max,
    )?)
}

fn f64_tag<R: Read + Seek>(decoder: &mut Decoder<R>, tag: Tag, name: &'static str) -> Result<Vec<f64>, ChipError> {
    match decoder.find_tag(tag)? {
        Some(value) => Ok(value.into_f64_vec()?),
        None => Err(ChipError::MissingTag(name)),
    }
}

/// Reads a chip's georeferenced bounds and pixel size. Blocking.
pub fn read_chip(path: &Path) -> Result<(GeoExtent, PixelSize), ChipError> {
    let mut decoder = Decoder::new(BufReader::new(File::open(path)?))?;
    let (width, height) = decoder.dimensions()?;
    let scale = f64_tag(&mut decoder, Tag::ModelPixelScaleTag, "ModelPixelScale")?;
    let tiepoint = f64_tag(&mut decoder, Tag::ModelTiepointTag, "ModelTiepoint")?;
    Ok((chip_extent(width, height, &scale, &tiepoint)?, PixelSize::new(width, height)?))
}

pub fn label_path(chip: &Path, suffix: &str) -> Option<PathBuf> {
    let mut labels_dir = chip.parent()?.as_os_str().to_owned();
    labels_dir.push(suffix);
    let mut file_name = chip.file_stem()?.to_owned();
    file_name.push(".txt");
    Some(PathBuf::from(labels_dir).join(file_name))
}

/// Chip files under `dir` with `extension` (case-insensitive), in file name order.
pub fn find_chips(dir: &Path, extension: &str) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping unreadable directory entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .is_some_and(|ext| ext.to_string_lossy().eq_ignore_ascii_case(extension))
        })
        .map(|entry| entry.into_path())
        .collect()
}

pub struct TrainingLoader {
    processor: Arc<TileProcessor>,
    metrics: Arc<Metrics>,
    labels_dir_suffix: String,
    concurrency: usize,
}

impl TrainingLoader {
    pub fn new(processor: Arc<TileProcessor>, metrics: Arc<Metrics>, labels_dir_suffix: impl Into<String>, concurrency: usize) -> Self {
        Self {
            processor,
            metrics,
            labels_dir_suffix: labels_dir_suffix.into(),
            concurrency: concurrency.max(1),
        }
    }

    pub async fn run(&self, chips: Vec<PathBuf>) -> BatchTotals {
        let mut totals = BatchTotals {
            tiles_requested: chips.len() as u64,
            ..BatchTotals::default()
        };
        self.metrics.tiles_requested_total.inc_by(chips.len() as u64);
        tracing::info!(chips = chips.len(), concurrency = self.concurrency, "Loading training chips");

        let outcomes: Vec<TileOutcome> = stream::iter(chips)
            .map(|chip| self.load_chip(chip))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        for outcome in outcomes {
            totals.absorb(outcome);
        }
        totals
    }

    async fn load_chip(&self, chip: PathBuf) -> TileOutcome {
        match self.prepare(&chip).await {
            Ok((image, labels)) => TileOutcome::Processed(self.processor.process(image, labels).await),
            Err(e) => {
                tracing::warn!(chip = %chip.display(), error = %e, "Skipping training chip");
                TileOutcome::Skipped
            }
        }
    }

    async fn prepare(&self, chip: &Path) -> Result<(ImageRecord, Vec<LabelRecord>), ChipError> {
        let path = chip.to_path_buf();
        let (extent, pixel_size) = tokio::task::spawn_blocking(move || read_chip(&path)).await??;

        let raw = match label_path(chip, &self.labels_dir_suffix) {
            Some(labels) => match tokio::fs::read_to_string(&labels).await {
                Ok(text) => parse_lines(&text, LabelEncoding::Training)
                    .map_err(|source| ChipError::Label { path: labels, source })?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
                Err(e) => return Err(e.into()),
            },
            None => Vec::new(),
        };

        let file_path = chip.to_string_lossy().into_owned();
        let labels = label_records(&file_path, &extent, pixel_size, &raw);
        let image = ImageRecord::new(file_path, extent, labels.len() as u32);
        Ok((image, labels))
    }
}
