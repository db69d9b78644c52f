use bytes::Bytes;
use futures::future::{try_join_all, BoxFuture};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tilegeo::{parse_lines, Detection, GeoExtent, LabelEncoding, PixelSize, RawLabel};

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("detector request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("detector answered HTTP {0}")]
    Status(u16),
    #[error("malformed detector output for {tile_id}: {reason}")]
    Malformed { tile_id: String, reason: String },
    #[error("detector returned {got} results for {expected} images")]
    BatchSize { expected: usize, got: usize },
    #[error("reading detections failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A downloaded tile ready for inference.
#[derive(Debug, Clone)]
pub struct TileImage {
    pub tile_id: String,
    pub extent: GeoExtent,
    pub bytes: Bytes,
    pub pixel_size: PixelSize,
}

/// Batched object detector.
///
/// Returns one detection list per input image, in input order. Any error
/// fails the whole batch.
pub trait Detector: Send + Sync {
    fn detect<'a>(&'a self, batch: &'a [TileImage]) -> BoxFuture<'a, Result<Vec<Vec<Detection>>, InferenceError>>;
}

fn rows_to_detections(tile_id: &str, rows: Vec<[f64; 6]>) -> Result<Vec<Detection>, InferenceError> {
    rows.into_iter()
        .map(|row| {
            Detection::from_row(row).map_err(|e| InferenceError::Malformed {
                tile_id: tile_id.to_string(),
                reason: e.to_string(),
            })
        })
        .collect()
}

/// Sends each tile to a model-serving endpoint.
///
/// The request body is the encoded image; the response is a JSON array of
/// `[left, top, right, bottom, confidence, class]` rows in pixels. Requests
/// for a batch go out one at a time, so an endpoint never has more than one
/// inference in flight per worker.
pub struct HttpDetector {
    client: reqwest::Client,
    url: String,
    model: Option<String>,
}

impl HttpDetector {
    pub fn new(url: impl Into<String>, model: Option<&Path>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            model: model.map(|p| p.to_string_lossy().into_owned()),
        })
    }

    async fn detect_one(&self, image: &TileImage) -> Result<Vec<Detection>, InferenceError> {
        let mut request = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .query(&[
                ("width", image.pixel_size.width.to_string()),
                ("height", image.pixel_size.height.to_string()),
            ]);
        if let Some(model) = &self.model {
            request = request.query(&[("model", model)]);
        }

        let response = request.body(image.bytes.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(InferenceError::Status(status.as_u16()));
        }

        let body = response.bytes().await?;
        let rows: Vec<[f64; 6]> = serde_json::from_slice(&body).map_err(|e| InferenceError::Malformed {
            tile_id: image.tile_id.clone(),
            reason: e.to_string(),
        })?;
        rows_to_detections(&image.tile_id, rows)
    }
}

impl Detector for HttpDetector {
    fn detect<'a>(&'a self, batch: &'a [TileImage]) -> BoxFuture<'a, Result<Vec<Vec<Detection>>, InferenceError>> {
        Box::pin(
            stream::iter(batch)
                .then(|image| self.detect_one(image))
                .try_collect(),
        )
    }
}

/// Reads detector output produced ahead of time.
///
/// Each tile's detections live in `<dir>/<tile id stem>.txt`, one
/// inference-encoded row per line. A missing file means no detections.
pub struct LabelDirDetector {
    dir: PathBuf,
}

impl LabelDirDetector {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, tile_id: &str) -> PathBuf {
        let stem = Path::new(tile_id)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| tile_id.to_string());
        self.dir.join(format!("{stem}.txt"))
    }

    async fn read_one(&self, image: &TileImage) -> Result<Vec<Detection>, InferenceError> {
        let text = match tokio::fs::read_to_string(self.path_for(&image.tile_id)).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let labels = parse_lines(&text, LabelEncoding::Inference).map_err(|e| InferenceError::Malformed {
            tile_id: image.tile_id.clone(),
            reason: e.to_string(),
        })?;

        Ok(labels
            .into_iter()
            .filter_map(|label| match label {
                RawLabel::Inference(d) => Some(d),
                RawLabel::Training(_) => None,
            })
            .collect())
    }
}

impl Detector for LabelDirDetector {
    fn detect<'a>(&'a self, batch: &'a [TileImage]) -> BoxFuture<'a, Result<Vec<Vec<Detection>>, InferenceError>> {
        Box::pin(try_join_all(batch.iter().map(|image| self.read_one(image))))
    }
}
