use bytes::Bytes;
use futures::future::BoxFuture;
use serde::Serialize;
use std::time::Duration;
use tilegeo::{GeoExtent, PixelSize};

/// Why a tile could not be obtained.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("request timed out")]
    Timeout,
    #[error("server answered HTTP {0}")]
    Status(u16),
    #[error("malformed image: {0}")]
    Malformed(String),
    #[error("request failed: {0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadErrorKind {
    Timeout,
    Status,
    Malformed,
    Other,
}

impl DownloadErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadErrorKind::Timeout => "timeout",
            DownloadErrorKind::Status => "status",
            DownloadErrorKind::Malformed => "malformed",
            DownloadErrorKind::Other => "other",
        }
    }
}

impl DownloadError {
    pub fn kind(&self) -> DownloadErrorKind {
        match self {
            DownloadError::Timeout => DownloadErrorKind::Timeout,
            DownloadError::Status(_) => DownloadErrorKind::Status,
            DownloadError::Malformed(_) => DownloadErrorKind::Malformed,
            DownloadError::Other(_) => DownloadErrorKind::Other,
        }
    }

    /// Client errors (4xx) will not change on retry; everything else might.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, DownloadError::Status(code) if (400..500).contains(code))
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            DownloadError::Timeout
        } else if let Some(status) = e.status() {
            DownloadError::Status(status.as_u16())
        } else {
            DownloadError::Other(e.to_string())
        }
    }
}

/// An encoded tile image and its decoded dimensions.
#[derive(Debug, Clone)]
pub struct FetchedTile {
    pub bytes: Bytes,
    pub pixel_size: PixelSize,
}

/// Source of tile images: "given a bounding box and a pixel size, return an image".
pub trait TileFetcher: Send + Sync {
    fn fetch(&self, extent: GeoExtent, size: PixelSize) -> BoxFuture<'_, Result<FetchedTile, DownloadError>>;
}

/// Checks that `bytes` hold a decodable raster and reads its size.
pub fn decode_tile(bytes: Bytes) -> Result<FetchedTile, DownloadError> {
    let image = image::load_from_memory(&bytes).map_err(|e| DownloadError::Malformed(e.to_string()))?;
    let pixel_size = PixelSize::new(image.width(), image.height())
        .map_err(|e| DownloadError::Malformed(e.to_string()))?;
    Ok(FetchedTile { bytes, pixel_size })
}

#[derive(Debug, Clone)]
pub struct WmsConfig {
    pub base_url: String,
    pub layers: String,
    pub version: String,
    pub crs: String,
    pub format: String,
    pub timeout: Duration,
    pub attempts: u32,
    pub backoff: Duration,
}

/// GetMap client with bounded retries.
pub struct WmsClient {
    client: reqwest::Client,
    config: WmsConfig,
}

impl WmsClient {
    pub fn new(config: WmsConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { client, config })
    }

    /// GetMap query parameters. The bbox is written longitude first.
    pub fn query(&self, extent: &GeoExtent, size: PixelSize) -> Vec<(&'static str, String)> {
        vec![
            ("service", "WMS".to_string()),
            ("request", "GetMap".to_string()),
            ("version", self.config.version.clone()),
            ("layers", self.config.layers.clone()),
            ("styles", String::new()),
            ("crs", self.config.crs.clone()),
            ("bbox", extent.to_bbox_param()),
            ("width", size.width.to_string()),
            ("height", size.height.to_string()),
            ("format", self.config.format.clone()),
        ]
    }

    async fn fetch_once(&self, extent: &GeoExtent, size: PixelSize) -> Result<FetchedTile, DownloadError> {
        let response = self
            .client
            .get(&self.config.base_url)
            .query(&self.query(extent, size))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status(status.as_u16()));
        }

        let bytes = response.bytes().await?;
        tokio::task::spawn_blocking(move || decode_tile(bytes))
            .await
            .map_err(|e| DownloadError::Other(e.to_string()))?
    }

    async fn fetch_with_retry(&self, extent: GeoExtent, size: PixelSize) -> Result<FetchedTile, DownloadError> {
        let mut delay = self.config.backoff;
        let mut attempt = 1;
        loop {
            match self.fetch_once(&extent, size).await {
                Ok(tile) => return Ok(tile),
                Err(e) if attempt < self.config.attempts && e.is_retryable() => {
                    tracing::debug!(
                        bbox = %extent.to_bbox_param(),
                        attempt,
                        error = %e,
                        "Tile download failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl TileFetcher for WmsClient {
    fn fetch(&self, extent: GeoExtent, size: PixelSize) -> BoxFuture<'_, Result<FetchedTile, DownloadError>> {
        Box::pin(self.fetch_with_retry(extent, size))
    }
}
