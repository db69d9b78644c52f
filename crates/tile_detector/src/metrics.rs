use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Prometheus collectors for one run. Shared behind an `Arc` by every worker.
pub struct Metrics {
    pub registry: Registry,
    /// Tiles handed to workers.
    pub tiles_requested_total: IntCounter,
    /// Tiles skipped because the download failed, by error kind.
    pub downloads_failed_total: IntCounterVec,
    pub images_recorded_total: IntCounter,
    pub labels_recorded_total: IntCounter,
    /// Labels stored without a parcel or address id, by `field`.
    pub reference_misses_total: IntCounterVec,
    /// Lookups that failed outright (database errors), not misses.
    pub reference_errors_total: IntCounter,
    pub persist_failures_total: IntCounter,
    pub inference_batches_total: IntCounter,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("tile_detector".into()), None)?;

        macro_rules! reg {
            ($metric:expr) => {{
                let collector = $metric;
                registry.register(Box::new(collector.clone()))?;
                collector
            }};
        }

        Ok(Self {
            tiles_requested_total: reg!(IntCounter::new(
                "tiles_requested_total",
                "Tiles scheduled for download"
            )?),
            downloads_failed_total: reg!(IntCounterVec::new(
                Opts::new("downloads_failed_total", "Tiles skipped after a failed download"),
                &["kind"]
            )?),
            images_recorded_total: reg!(IntCounter::new(
                "images_recorded_total",
                "Image rows written"
            )?),
            labels_recorded_total: reg!(IntCounter::new(
                "labels_recorded_total",
                "Label rows written"
            )?),
            reference_misses_total: reg!(IntCounterVec::new(
                Opts::new("reference_misses_total", "Labels stored without a reference id"),
                &["field"]
            )?),
            reference_errors_total: reg!(IntCounter::new(
                "reference_errors_total",
                "Reference lookups that failed with an error"
            )?),
            persist_failures_total: reg!(IntCounter::new(
                "persist_failures_total",
                "Rows that could not be written"
            )?),
            inference_batches_total: reg!(IntCounter::new(
                "inference_batches_total",
                "Batched detector calls completed"
            )?),
            registry,
        })
    }

    /// Serves the registry on `/metrics`.
    pub fn router(&self) -> Router {
        let registry = self.registry.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let registry = registry.clone();
                async move {
                    match TextEncoder::new().encode_to_string(&registry.gather()) {
                        Ok(body) => body.into_response(),
                        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
                    }
                }
            }),
        )
    }
}
