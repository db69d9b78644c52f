use clap::{ArgGroup, Args, Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tilegeo::{GeoExtent, PixelSize, TileFootprint};

use crate::orchestrator::BatchConfig;
use crate::wms::WmsConfig;

/// `tile_detector` - detects features in aerial imagery tiles and stores them
/// as geographic labels in PostGIS.
///
/// Every option can also be supplied through the environment variable named
/// in its help text.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Listen address for a Prometheus `/metrics` endpoint. Disabled when unset.
    #[arg(long, env = "METRICS_LISTEN_ADDR", global = true)]
    pub metrics_listen_addr: Option<SocketAddr>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download WMS tiles over an area, run the detector and store labels.
    Detect(DetectArgs),
    /// Load georeferenced training chips and their YOLO label files.
    LoadTraining(TrainingArgs),
}

#[derive(Args, Clone)]
pub struct DatabaseArgs {
    /// PostgreSQL connection string.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    #[arg(long, env = "LABEL_TABLE", default_value = "data_science.pool_labels")]
    pub label_table: String,

    #[arg(long, env = "IMAGE_TABLE", default_value = "data_science.pool_images")]
    pub image_table: String,

    /// Cadastral parcel polygons used for the parcel join.
    #[arg(long, env = "CADASTRE_TABLE", default_value = "data_science.aus_cadastre_boundaries_nsw")]
    pub cadastre_table: String,

    /// Address points used for the address join.
    #[arg(long, env = "ADDRESS_TABLE", default_value = "data_science.address_principals_nsw")]
    pub address_table: String,

    /// SRID of stored geometries and reference tables (4283 = GDA94).
    #[arg(long, env = "GEOMETRY_SRID", default_value_t = 4283)]
    pub srid: i32,

    /// Empty the label and image tables before loading.
    #[arg(long, env = "TRUNCATE_OUTPUT", default_value_t = false)]
    pub truncate: bool,

    /// Seconds to wait for a pooled connection before failing a statement.
    #[arg(long, env = "DB_ACQUIRE_TIMEOUT_SECS", default_value_t = 30)]
    pub acquire_timeout_secs: u64,
}

// Hand-written so the connection string (and its password) stays out of logs.
impl std::fmt::Debug for DatabaseArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseArgs")
            .field("database_url", &"<redacted>")
            .field("label_table", &self.label_table)
            .field("image_table", &self.image_table)
            .field("cadastre_table", &self.cadastre_table)
            .field("address_table", &self.address_table)
            .field("srid", &self.srid)
            .field("truncate", &self.truncate)
            .field("acquire_timeout_secs", &self.acquire_timeout_secs)
            .finish()
    }
}

impl DatabaseArgs {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum DetectorKind {
    /// POST tiles to one model-serving endpoint per accelerator.
    Http,
    /// Read precomputed detector output files from a directory.
    LabelDir,
}

#[derive(Args, Debug, Clone)]
#[command(group(ArgGroup::new("coverage").required(true).args(["area", "grid_table"])))]
pub struct DetectArgs {
    #[command(flatten)]
    pub db: DatabaseArgs,

    /// Area to cover as `x_min,y_min,x_max,y_max` in degrees.
    #[arg(long, env = "AREA_BOUNDS", value_parser = parse_area, allow_hyphen_values = true)]
    pub area: Option<GeoExtent>,

    /// Table of precomputed `latitude, longitude` tile origins, used instead of `--area`.
    #[arg(long, env = "GRID_TABLE")]
    pub grid_table: Option<String>,

    /// Tile width in degrees.
    #[arg(long, env = "TILE_WIDTH_DEG", default_value_t = 0.0014272)]
    pub tile_width: f64,

    /// Tile height in degrees. Defaults to the tile width.
    #[arg(long, env = "TILE_HEIGHT_DEG")]
    pub tile_height: Option<f64>,

    /// Requested image width in pixels (the detector's input size).
    #[arg(long, env = "IMAGE_WIDTH_PX", default_value_t = 640)]
    pub image_width: u32,

    /// Requested image height in pixels. Defaults to the image width.
    #[arg(long, env = "IMAGE_HEIGHT_PX")]
    pub image_height: Option<u32>,

    /// Base URL of the WMS endpoint.
    #[arg(long, env = "WMS_URL")]
    pub wms_url: String,

    #[arg(long, env = "WMS_LAYERS", default_value = "0")]
    pub wms_layers: String,

    #[arg(long, env = "WMS_VERSION", default_value = "1.3.0")]
    pub wms_version: String,

    #[arg(long, env = "WMS_CRS", default_value = "EPSG:4326")]
    pub wms_crs: String,

    #[arg(long, env = "WMS_FORMAT", default_value = "image/jpeg")]
    pub wms_format: String,

    /// Per-request timeout for tile downloads, in seconds.
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    pub request_timeout_secs: u64,

    /// Attempts per tile before it is counted as a failed download.
    #[arg(long, env = "DOWNLOAD_ATTEMPTS", default_value_t = 3)]
    pub download_attempts: u32,

    /// Initial backoff between download attempts; doubles on each retry.
    #[arg(long, env = "RETRY_BACKOFF_MS", default_value_t = 500)]
    pub retry_backoff_ms: u64,

    /// Concurrent downloads per worker. Defaults to twice the CPU count,
    /// divided across accelerators when there are several.
    #[arg(long, env = "MAX_CONCURRENT_DOWNLOADS")]
    pub max_concurrent_downloads: Option<usize>,

    /// Number of accelerators (GPUs); 0 runs a single CPU worker.
    #[arg(long, env = "ACCELERATOR_COUNT", default_value_t = 0)]
    pub accelerators: usize,

    /// Tiles per inference batch. Sized to the accelerator's memory ceiling.
    #[arg(long, env = "INFERENCE_CHUNK_SIZE")]
    pub chunk_size: usize,

    #[arg(long, env = "DETECTOR", value_enum, default_value_t = DetectorKind::Http)]
    pub detector: DetectorKind,

    /// Model-serving endpoints, comma separated; assigned to accelerators round-robin.
    #[arg(long, env = "DETECTOR_URLS", value_delimiter = ',')]
    pub detector_urls: Vec<String>,

    /// Model artifact to request from the serving endpoint.
    #[arg(long, env = "MODEL_PATH")]
    pub model_path: Option<PathBuf>,

    /// Directory of precomputed detections for `--detector label-dir`.
    #[arg(long, env = "DETECTIONS_DIR")]
    pub detections_dir: Option<PathBuf>,

    /// Write the run totals as JSON to this path.
    #[arg(long, env = "SUMMARY_PATH")]
    pub summary_path: Option<PathBuf>,
}

impl DetectArgs {
    pub fn footprint(&self) -> anyhow::Result<TileFootprint> {
        Ok(TileFootprint::new(
            self.tile_width,
            self.tile_height.unwrap_or(self.tile_width),
        )?)
    }

    pub fn pixel_size(&self) -> anyhow::Result<PixelSize> {
        Ok(PixelSize::new(
            self.image_width,
            self.image_height.unwrap_or(self.image_width),
        )?)
    }

    /// One worker per accelerator, or a single worker on CPU-only hosts.
    pub fn worker_count(&self) -> usize {
        self.accelerators.max(1)
    }

    pub fn download_concurrency(&self) -> usize {
        match self.max_concurrent_downloads {
            Some(n) => n.max(1),
            None => {
                let base = cpu_count() * 2;
                (base / self.worker_count()).max(1)
            }
        }
    }

    /// Every worker may hold one connection per in-flight tile, plus one for setup.
    pub fn max_db_connections(&self) -> u32 {
        (self.download_concurrency() * self.worker_count() + 1) as u32
    }

    pub fn batch_config(&self) -> anyhow::Result<BatchConfig> {
        if self.chunk_size == 0 {
            anyhow::bail!("INFERENCE_CHUNK_SIZE must be greater than zero");
        }
        Ok(BatchConfig {
            footprint: self.footprint()?,
            pixel_size: self.pixel_size()?,
            max_concurrent_downloads: self.download_concurrency(),
            chunk_size: self.chunk_size,
            workers: self.worker_count(),
        })
    }

    pub fn wms_config(&self) -> anyhow::Result<WmsConfig> {
        if self.download_attempts == 0 {
            anyhow::bail!("DOWNLOAD_ATTEMPTS must be at least 1");
        }
        Ok(WmsConfig {
            base_url: self.wms_url.clone(),
            layers: self.wms_layers.clone(),
            version: self.wms_version.clone(),
            crs: self.wms_crs.clone(),
            format: self.wms_format.clone(),
            timeout: Duration::from_secs(self.request_timeout_secs),
            attempts: self.download_attempts,
            backoff: Duration::from_millis(self.retry_backoff_ms),
        })
    }
}

#[derive(Args, Debug, Clone)]
pub struct TrainingArgs {
    #[command(flatten)]
    pub db: DatabaseArgs,

    /// Directory searched recursively for training chips.
    #[arg(long, env = "TRAINING_DIR")]
    pub search_dir: PathBuf,

    /// File extension of training chips.
    #[arg(long, env = "CHIP_EXTENSION", default_value = "tif")]
    pub extension: String,

    /// Label files live in a sibling of each chip's directory with this suffix.
    #[arg(long, env = "LABELS_DIR_SUFFIX", default_value = "_labels")]
    pub labels_dir_suffix: String,

    /// Chips processed concurrently. Defaults to the CPU count.
    #[arg(long, env = "LOAD_CONCURRENCY")]
    pub concurrency: Option<usize>,

    /// Write the run totals as JSON to this path.
    #[arg(long, env = "SUMMARY_PATH")]
    pub summary_path: Option<PathBuf>,
}

impl TrainingArgs {
    pub fn concurrency(&self) -> usize {
        self.concurrency.unwrap_or_else(cpu_count).max(1)
    }
}

fn cpu_count() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

/// Parses `x_min,y_min,x_max,y_max`.
pub fn parse_area(s: &str) -> Result<GeoExtent, String> {
    let parts: Vec<f64> = s
        .split(',')
        .map(|p| p.trim().parse::<f64>().map_err(|e| format!("'{p}': {e}")))
        .collect::<Result<_, _>>()?;
    match parts.as_slice() {
        [x_min, y_min, x_max, y_max] => {
            GeoExtent::new(*x_min, *y_min, *x_max, *y_max).map_err(|e| e.to_string())
        }
        _ => Err(format!(
            "expected x_min,y_min,x_max,y_max; got {} values",
            parts.len()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("tile_detector").chain(args.iter().copied()))
    }

    const DETECT: &[&str] = &[
        "detect",
        "--database-url",
        "postgres://u:p@localhost/geo",
        "--wms-url",
        "http://wms.example/WMSServer",
        "--chunk-size",
        "250",
    ];

    #[test]
    fn parses_area_bounds() {
        let area = parse_area("151.1331,-33.8912,151.1703,-33.8672").unwrap();
        assert_eq!(area.x_min, 151.1331);
        assert_eq!(area.y_max, -33.8672);
        assert!(parse_area("1,2,3").is_err());
        assert!(parse_area("3,0,1,1").is_err());
        assert!(parse_area("a,0,1,1").is_err());
    }

    #[test]
    fn detect_requires_a_coverage_source() {
        assert!(parse(DETECT).is_err());

        let mut args = DETECT.to_vec();
        args.extend(["--grid-table", "data_science.sydney_grid"]);
        let cli = parse(&args).unwrap();
        let Command::Detect(detect) = cli.command else { panic!("expected detect") };
        assert_eq!(detect.grid_table.as_deref(), Some("data_science.sydney_grid"));
        assert!(detect.area.is_none());
    }

    #[test]
    fn detect_defaults_and_derived_sizes() {
        let mut args = DETECT.to_vec();
        args.extend([
            "--area=151.1331,-33.8912,151.1703,-33.8672",
            "--accelerators",
            "4",
            "--max-concurrent-downloads",
            "8",
            "--detector-urls",
            "http://a/predict,http://b/predict",
        ]);
        let Command::Detect(detect) = parse(&args).unwrap().command else {
            panic!("expected detect")
        };

        let batch = detect.batch_config().unwrap();
        assert_eq!(batch.chunk_size, 250);
        assert_eq!(batch.workers, 4);
        assert_eq!(batch.max_concurrent_downloads, 8);
        assert_eq!(batch.footprint.width, batch.footprint.height);
        assert_eq!(batch.pixel_size, PixelSize::new(640, 640).unwrap());
        assert_eq!(detect.max_db_connections(), 33);
        assert_eq!(detect.detector_urls.len(), 2);
        assert_eq!(detect.detector, DetectorKind::Http);
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let mut args = DETECT.to_vec();
        args[6] = "0";
        args.extend(["--grid-table", "g"]);
        let Command::Detect(detect) = parse(&args).unwrap().command else {
            panic!("expected detect")
        };
        assert!(detect.batch_config().is_err());
    }

    #[test]
    fn database_url_is_redacted_in_debug_output() {
        let mut args = DETECT.to_vec();
        args.extend(["--grid-table", "g"]);
        let cli = parse(&args).unwrap();
        let rendered = format!("{cli:?}");
        assert!(!rendered.contains("u:p@"));
        assert!(rendered.contains("<redacted>"));
    }
}
