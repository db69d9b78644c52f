use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tilegeo::{
    project_label, split_even, Detection, GeoExtent, ImageRecord, LabelRecord, PixelSize, RawLabel,
    TileFootprint, TileOrigin,
};
use tokio::task::JoinSet;

use crate::detector::{Detector, InferenceError, TileImage};
use crate::metrics::Metrics;
use crate::reference::ReferenceLookup;
use crate::store::RecordSink;
use crate::wms::{DownloadErrorKind, TileFetcher};

/// Everything a batch run needs to know up front.
#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    pub footprint: TileFootprint,
    pub pixel_size: PixelSize,
    /// Downloads (and tile writes) in flight per worker.
    pub max_concurrent_downloads: usize,
    /// Tiles per inference call.
    pub chunk_size: usize,
    /// One per accelerator.
    pub workers: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("no detector configured")]
    NoDetector,
    #[error("inference failed on worker {worker}, chunk {chunk}: {source}")]
    Inference {
        worker: usize,
        chunk: usize,
        #[source]
        source: InferenceError,
    },
    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// What happened to one processed tile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TileReport {
    pub labels: u32,
    pub labels_recorded: u32,
    pub image_recorded: bool,
    pub parcel_misses: u32,
    pub address_misses: u32,
    /// Labels stored without reference ids because the lookup itself failed.
    pub reference_errors: u32,
    pub persist_failures: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileOutcome {
    Processed(TileReport),
    DownloadFailed(DownloadErrorKind),
    /// Input could not be read (training chips only).
    Skipped,
}

/// Run counters. Each worker keeps its own and they are merged once the
/// worker finishes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchTotals {
    pub tiles_requested: u64,
    pub tiles_processed: u64,
    pub tiles_skipped: u64,
    pub tiles_with_labels: u64,
    pub images_recorded: u64,
    pub labels_detected: u64,
    pub labels_recorded: u64,
    pub parcel_misses: u64,
    pub address_misses: u64,
    pub reference_errors: u64,
    pub persist_failures: u64,
    pub downloads_failed: BTreeMap<DownloadErrorKind, u64>,
}

impl BatchTotals {
    pub fn absorb(&mut self, outcome: TileOutcome) {
        match outcome {
            TileOutcome::Processed(report) => {
                self.tiles_processed += 1;
                self.tiles_with_labels += u64::from(report.labels > 0);
                self.images_recorded += u64::from(report.image_recorded);
                self.labels_detected += u64::from(report.labels);
                self.labels_recorded += u64::from(report.labels_recorded);
                self.parcel_misses += u64::from(report.parcel_misses);
                self.address_misses += u64::from(report.address_misses);
                self.reference_errors += u64::from(report.reference_errors);
                self.persist_failures += u64::from(report.persist_failures);
            }
            TileOutcome::DownloadFailed(kind) => {
                *self.downloads_failed.entry(kind).or_default() += 1;
            }
            TileOutcome::Skipped => self.tiles_skipped += 1,
        }
    }

    pub fn merge(&mut self, other: BatchTotals) {
        self.tiles_requested += other.tiles_requested;
        self.tiles_processed += other.tiles_processed;
        self.tiles_skipped += other.tiles_skipped;
        self.tiles_with_labels += other.tiles_with_labels;
        self.images_recorded += other.images_recorded;
        self.labels_detected += other.labels_detected;
        self.labels_recorded += other.labels_recorded;
        self.parcel_misses += other.parcel_misses;
        self.address_misses += other.address_misses;
        self.reference_errors += other.reference_errors;
        self.persist_failures += other.persist_failures;
        for (kind, count) in other.downloads_failed {
            *self.downloads_failed.entry(kind).or_default() += count;
        }
    }

    pub fn downloads_failed_total(&self) -> u64 {
        self.downloads_failed.values().sum()
    }
}

/// Geographic label rows for a tile's parsed labels.
pub fn label_records(file_path: &str, extent: &GeoExtent, pixel_size: PixelSize, labels: &[RawLabel]) -> Vec<LabelRecord> {
    labels
        .iter()
        .map(|label| {
            let geo = project_label(extent, pixel_size, label);
            LabelRecord::new(file_path, label.encoding(), label.confidence(), &geo)
        })
        .collect()
}

/// Joins and stores one tile's labels and its image row.
///
/// A failed lookup stores the label without reference ids and is counted
/// apart from genuine misses. Write errors are counted. Neither stops the
/// tile, and the image row is written even when label writes fail.
pub struct TileProcessor {
    reference: Arc<dyn ReferenceLookup>,
    sink: Arc<dyn RecordSink>,
    metrics: Arc<Metrics>,
}

impl TileProcessor {
    pub fn new(reference: Arc<dyn ReferenceLookup>, sink: Arc<dyn RecordSink>, metrics: Arc<Metrics>) -> Self {
        Self { reference, sink, metrics }
    }

    pub async fn process(&self, image: ImageRecord, labels: Vec<LabelRecord>) -> TileReport {
        let mut report = TileReport {
            labels: labels.len() as u32,
            ..TileReport::default()
        };

        for label in labels {
            let label = match self.reference.lookup(label.latitude, label.longitude).await {
                Ok(found) => {
                    let label = label.with_reference(found);
                    if label.legal_parcel_id.is_none() {
                        report.parcel_misses += 1;
                        self.metrics.reference_misses_total.with_label_values(&["parcel"]).inc();
                    }
                    if label.gnaf_pid.is_none() {
                        report.address_misses += 1;
                        self.metrics.reference_misses_total.with_label_values(&["address"]).inc();
                    }
                    label
                }
                Err(e) => {
                    tracing::error!(tile_id = %label.file_path, error = %e, "Reference lookup failed");
                    report.reference_errors += 1;
                    self.metrics.reference_errors_total.inc();
                    label.with_reference(None)
                }
            };

            match self.sink.insert_label(&label).await {
                Ok(()) => {
                    report.labels_recorded += 1;
                    self.metrics.labels_recorded_total.inc();
                }
                Err(e) => {
                    tracing::error!(tile_id = %label.file_path, error = %e, "Failed to store label");
                    report.persist_failures += 1;
                    self.metrics.persist_failures_total.inc();
                }
            }
        }

        match self.sink.insert_image(&image).await {
            Ok(()) => {
                report.image_recorded = true;
                self.metrics.images_recorded_total.inc();
            }
            Err(e) => {
                tracing::error!(tile_id = %image.file_path, error = %e, "Failed to store image");
                report.persist_failures += 1;
                self.metrics.persist_failures_total.inc();
            }
        }

        tracing::debug!(tile_id = %image.file_path, labels = report.labels, "Tile processed");
        report
    }
}

/// Drives download, inference and persistence over a set of tiles.
///
/// Tiles are split evenly across workers. Each worker walks its share in
/// chunks: downloads run concurrently, the chunk goes to the worker's
/// detector in one call, then tiles are processed concurrently. Failed
/// downloads are counted and skipped; an inference error stops the run.
#[derive(Clone)]
pub struct Orchestrator {
    config: BatchConfig,
    fetcher: Arc<dyn TileFetcher>,
    detectors: Vec<Arc<dyn Detector>>,
    processor: Arc<TileProcessor>,
    metrics: Arc<Metrics>,
}

impl Orchestrator {
    /// Worker `i` uses `detectors[i % detectors.len()]`.
    pub fn new(
        config: BatchConfig,
        fetcher: Arc<dyn TileFetcher>,
        detectors: Vec<Arc<dyn Detector>>,
        processor: Arc<TileProcessor>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, BatchError> {
        if detectors.is_empty() {
            return Err(BatchError::NoDetector);
        }
        Ok(Self {
            config: BatchConfig {
                max_concurrent_downloads: config.max_concurrent_downloads.max(1),
                chunk_size: config.chunk_size.max(1),
                workers: config.workers.max(1),
                ..config
            },
            fetcher,
            detectors,
            processor,
            metrics,
        })
    }

    pub async fn run(&self, origins: impl IntoIterator<Item = TileOrigin>) -> Result<BatchTotals, BatchError> {
        let origins: Vec<TileOrigin> = origins.into_iter().collect();
        tracing::info!(
            tiles = origins.len(),
            workers = self.config.workers,
            chunk_size = self.config.chunk_size,
            max_concurrent_downloads = self.config.max_concurrent_downloads,
            "Starting batch"
        );

        let mut workers = JoinSet::new();
        for (worker, share) in split_even(&origins, self.config.workers).enumerate() {
            let this = self.clone();
            let share = share.to_vec();
            workers.spawn(async move { this.run_worker(worker, share).await });
        }

        let mut totals = BatchTotals::default();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(worker_totals)) => totals.merge(worker_totals),
                Ok(Err(e)) => {
                    workers.abort_all();
                    return Err(e);
                }
                Err(e) => {
                    workers.abort_all();
                    return Err(e.into());
                }
            }
        }
        Ok(totals)
    }

    async fn run_worker(&self, worker: usize, tiles: Vec<TileOrigin>) -> Result<BatchTotals, BatchError> {
        let detector = &self.detectors[worker % self.detectors.len()];
        let mut totals = BatchTotals::default();

        for (chunk, origins) in tiles.chunks(self.config.chunk_size).enumerate() {
            totals.tiles_requested += origins.len() as u64;
            self.metrics.tiles_requested_total.inc_by(origins.len() as u64);

            let images = self.download_chunk(origins, &mut totals).await;
            if images.is_empty() {
                tracing::warn!(worker, chunk, "No tiles downloaded in chunk");
                continue;
            }

            let detections = detector
                .detect(&images)
                .await
                .and_then(|d| {
                    if d.len() == images.len() {
                        Ok(d)
                    } else {
                        Err(InferenceError::BatchSize {
                            expected: images.len(),
                            got: d.len(),
                        })
                    }
                })
                .map_err(|source| BatchError::Inference { worker, chunk, source })?;
            self.metrics.inference_batches_total.inc();

            let reports: Vec<TileReport> = stream::iter(images.into_iter().zip(detections))
                .map(|(image, found)| self.persist_tile(image, found))
                .buffer_unordered(self.config.max_concurrent_downloads)
                .collect()
                .await;
            for report in reports {
                totals.absorb(TileOutcome::Processed(report));
            }

            tracing::info!(
                worker,
                chunk,
                tiles = origins.len(),
                processed = totals.tiles_processed,
                labels = totals.labels_recorded,
                "Chunk complete"
            );
        }

        Ok(totals)
    }

    async fn download_chunk(&self, origins: &[TileOrigin], totals: &mut BatchTotals) -> Vec<TileImage> {
        let footprint = self.config.footprint;
        let pixel_size = self.config.pixel_size;

        let results: Vec<_> = stream::iter(origins.iter().copied())
            .map(|origin| async move {
                let extent = origin.extent(footprint);
                (origin, extent, self.fetcher.fetch(extent, pixel_size).await)
            })
            .buffer_unordered(self.config.max_concurrent_downloads)
            .collect()
            .await;

        let mut images = Vec::with_capacity(results.len());
        for (origin, extent, result) in results {
            match result {
                Ok(tile) => images.push(TileImage {
                    tile_id: origin.tile_id(),
                    extent,
                    bytes: tile.bytes,
                    pixel_size: tile.pixel_size,
                }),
                Err(e) => {
                    let kind = e.kind();
                    tracing::warn!(tile_id = %origin.tile_id(), error = %e, "Tile download failed, skipping");
                    self.metrics.downloads_failed_total.with_label_values(&[kind.as_str()]).inc();
                    totals.absorb(TileOutcome::DownloadFailed(kind));
                }
            }
        }
        images
    }

    async fn persist_tile(&self, image: TileImage, detections: Vec<Detection>) -> TileReport {
        let raw: Vec<RawLabel> = detections.into_iter().map(RawLabel::Inference).collect();
        let labels = label_records(&image.tile_id, &image.extent, image.pixel_size, &raw);
        let record = ImageRecord::for_tile(&image.tile_id, image.extent, self.config.footprint, labels.len() as u32);
        self.processor.process(record, labels).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeReference, MemorySink};
    use crate::wms::{DownloadError, FetchedTile};
    use bytes::Bytes;
    use futures::future::BoxFuture;
    use parking_lot::Mutex;
    use tilegeo::{LabelEncoding, TileGrid};

    struct FakeFetcher {
        fail_longitude: Option<f64>,
    }

    impl TileFetcher for FakeFetcher {
        fn fetch(&self, extent: GeoExtent, _size: PixelSize) -> BoxFuture<'_, Result<FetchedTile, DownloadError>> {
            let fail = self.fail_longitude == Some(extent.x_min);
            Box::pin(async move {
                if fail {
                    return Err(DownloadError::Status(503));
                }
                Ok(FetchedTile {
                    bytes: Bytes::new(),
                    pixel_size: PixelSize::new(100, 100).unwrap(),
                })
            })
        }
    }

    #[derive(Default)]
    struct FakeDetector {
        per_tile: usize,
        fail: bool,
        drop_one: bool,
        batches: Mutex<Vec<usize>>,
    }

    impl Detector for FakeDetector {
        fn detect<'a>(&'a self, batch: &'a [TileImage]) -> BoxFuture<'a, Result<Vec<Vec<Detection>>, InferenceError>> {
            self.batches.lock().push(batch.len());
            Box::pin(async move {
                if self.fail {
                    return Err(InferenceError::Status(500));
                }
                let row = Detection::from_row([25.0, 25.0, 75.0, 75.0, 0.9, 0.0]).unwrap();
                let mut out = vec![vec![row; self.per_tile]; batch.len()];
                if self.drop_one {
                    out.pop();
                }
                Ok(out)
            })
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        sink: Arc<MemorySink>,
        detectors: Vec<Arc<FakeDetector>>,
    }

    fn harness(workers: usize, chunk_size: usize, fetcher: FakeFetcher, detectors: Vec<FakeDetector>, reference: FakeReference) -> Harness {
        let metrics = Arc::new(Metrics::new().unwrap());
        let sink = Arc::new(MemorySink::default());
        let processor = Arc::new(TileProcessor::new(
            Arc::new(reference),
            sink.clone(),
            metrics.clone(),
        ));
        let detectors: Vec<Arc<FakeDetector>> = detectors.into_iter().map(Arc::new).collect();
        let config = BatchConfig {
            footprint: TileFootprint::square(1.0).unwrap(),
            pixel_size: PixelSize::new(100, 100).unwrap(),
            max_concurrent_downloads: 4,
            chunk_size,
            workers,
        };
        let orchestrator = Orchestrator::new(
            config,
            Arc::new(fetcher),
            detectors.iter().map(|d| d.clone() as Arc<dyn Detector>).collect(),
            processor,
            metrics,
        )
        .unwrap();
        Harness { orchestrator, sink, detectors }
    }

    /// 3 columns by 2 rows of unit tiles.
    fn six_tiles() -> TileGrid {
        TileGrid::new(
            GeoExtent::new(0.0, 0.0, 3.0, 2.0).unwrap(),
            TileFootprint::square(1.0).unwrap(),
        )
    }

    #[tokio::test]
    async fn tiles_without_detections_still_get_image_rows() {
        let h = harness(1, 10, FakeFetcher { fail_longitude: None }, vec![FakeDetector::default()], FakeReference::Miss);
        let totals = h.orchestrator.run(six_tiles().iter()).await.unwrap();

        assert_eq!(totals.tiles_requested, 6);
        assert_eq!(totals.tiles_processed, 6);
        assert_eq!(totals.images_recorded, 6);
        assert_eq!(totals.labels_recorded, 0);
        assert!(h.sink.labels.lock().is_empty());
        assert!(h.sink.images.lock().iter().all(|i| i.label_count == 0));
    }

    #[tokio::test]
    async fn failed_downloads_are_counted_and_skipped() {
        let detector = FakeDetector { per_tile: 1, ..Default::default() };
        let h = harness(1, 10, FakeFetcher { fail_longitude: Some(1.0) }, vec![detector], FakeReference::Hit);
        let totals = h.orchestrator.run(six_tiles().iter()).await.unwrap();

        assert_eq!(totals.downloads_failed.get(&DownloadErrorKind::Status), Some(&2));
        assert_eq!(totals.downloads_failed_total(), 2);
        assert_eq!(totals.tiles_processed, 4);
        let images = h.sink.images.lock();
        assert_eq!(images.len(), 4);
        assert!(images.iter().all(|i| i.extent.x_min != 1.0));
        assert!(h.sink.labels.lock().iter().all(|l| l.extent.x_min < 1.0 || l.extent.x_min >= 2.0));
    }

    #[tokio::test]
    async fn inference_failure_aborts_the_run() {
        let detector = FakeDetector { fail: true, ..Default::default() };
        let h = harness(1, 10, FakeFetcher { fail_longitude: None }, vec![detector], FakeReference::Miss);
        let err = h.orchestrator.run(six_tiles().iter()).await.unwrap_err();
        assert!(matches!(err, BatchError::Inference { worker: 0, chunk: 0, .. }));
        assert!(h.sink.images.lock().is_empty());
    }

    #[tokio::test]
    async fn short_detector_output_is_an_inference_error() {
        let detector = FakeDetector { drop_one: true, ..Default::default() };
        let h = harness(1, 10, FakeFetcher { fail_longitude: None }, vec![detector], FakeReference::Miss);
        let err = h.orchestrator.run(six_tiles().iter()).await.unwrap_err();
        assert!(matches!(
            err,
            BatchError::Inference { source: InferenceError::BatchSize { expected: 6, got: 5 }, .. }
        ));
    }

    #[tokio::test]
    async fn chunks_bound_each_inference_call() {
        let origins: Vec<TileOrigin> = (0..7).map(|i| TileOrigin::new(0.0, f64::from(i))).collect();
        let h = harness(1, 3, FakeFetcher { fail_longitude: None }, vec![FakeDetector::default()], FakeReference::Miss);
        let totals = h.orchestrator.run(origins).await.unwrap();

        assert_eq!(*h.detectors[0].batches.lock(), vec![3, 3, 1]);
        assert_eq!(totals.images_recorded, 7);
    }

    #[tokio::test]
    async fn worker_totals_are_merged() {
        let detectors = (0..3)
            .map(|_| FakeDetector { per_tile: 2, ..Default::default() })
            .collect();
        let origins: Vec<TileOrigin> = (0..10).map(|i| TileOrigin::new(-33.0, 151.0 + f64::from(i))).collect();
        let h = harness(3, 2, FakeFetcher { fail_longitude: None }, detectors, FakeReference::Hit);
        let totals = h.orchestrator.run(origins).await.unwrap();

        assert_eq!(totals.tiles_requested, 10);
        assert_eq!(totals.images_recorded, 10);
        assert_eq!(totals.labels_detected, 20);
        assert_eq!(totals.labels_recorded, 20);
        assert_eq!(totals.parcel_misses, 0);
        for detector in &h.detectors {
            assert!(!detector.batches.lock().is_empty());
        }

        let labels = h.sink.labels.lock();
        assert!(labels.iter().all(|l| l.label_type == LabelEncoding::Inference));
        assert!(labels.iter().all(|l| l.gnaf_pid.as_deref() == Some("GANSW7")));
        assert!(h.sink.images.lock().iter().all(|i| i.label_count == 2));
    }

    #[tokio::test]
    async fn detections_land_inside_their_tile() {
        let detector = FakeDetector { per_tile: 1, ..Default::default() };
        let h = harness(1, 10, FakeFetcher { fail_longitude: None }, vec![detector], FakeReference::Miss);
        let totals = h.orchestrator.run([TileOrigin::new(2.0, 0.0)]).await.unwrap();
        assert_eq!(totals.parcel_misses, 1);
        assert_eq!(totals.address_misses, 1);

        let labels = h.sink.labels.lock();
        let label = &labels[0];
        assert_eq!(label.file_path, "image_2_0.jpg");
        assert_eq!(label.extent, GeoExtent::new(0.25, 1.25, 0.75, 1.75).unwrap());
        assert_eq!((label.longitude, label.latitude), (0.5, 1.5));
        assert_eq!(label.confidence, Some(0.9));
        assert!(label.legal_parcel_id.is_none());
    }

    fn one_label_tile() -> (ImageRecord, Vec<LabelRecord>) {
        let footprint = TileFootprint::square(1.0).unwrap();
        let origin = TileOrigin::new(2.0, 0.0);
        let extent = origin.extent(footprint);
        let raw = [RawLabel::Inference(Detection::from_row([25.0, 25.0, 75.0, 75.0, 0.9, 0.0]).unwrap())];
        let labels = label_records(&origin.tile_id(), &extent, PixelSize::new(100, 100).unwrap(), &raw);
        let image = ImageRecord::for_tile(&origin.tile_id(), extent, footprint, labels.len() as u32);
        (image, labels)
    }

    fn processor(reference: FakeReference, sink: Arc<MemorySink>) -> (TileProcessor, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new().unwrap());
        (TileProcessor::new(Arc::new(reference), sink, metrics.clone()), metrics)
    }

    #[tokio::test]
    async fn image_row_is_written_when_label_writes_fail() {
        let sink = Arc::new(MemorySink::failing(false, true));
        let (processor, metrics) = processor(FakeReference::Hit, sink.clone());
        let (image, labels) = one_label_tile();
        let report = processor.process(image, labels).await;

        assert_eq!(report.labels, 1);
        assert_eq!(report.labels_recorded, 0);
        assert_eq!(report.persist_failures, 1);
        assert!(report.image_recorded);
        assert_eq!(metrics.persist_failures_total.get(), 1);
        assert_eq!(metrics.images_recorded_total.get(), 1);

        let images = sink.images.lock();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].label_count, 1);
    }

    #[tokio::test]
    async fn failed_image_write_is_counted() {
        let sink = Arc::new(MemorySink::failing(true, false));
        let (processor, metrics) = processor(FakeReference::Hit, sink.clone());
        let (image, labels) = one_label_tile();
        let report = processor.process(image, labels).await;

        assert_eq!(*sink.image_attempts.lock(), 1);
        assert!(!report.image_recorded);
        assert_eq!(report.labels_recorded, 1);
        assert_eq!(report.persist_failures, 1);
        assert_eq!(metrics.images_recorded_total.get(), 0);

        let mut totals = BatchTotals::default();
        totals.absorb(TileOutcome::Processed(report));
        assert_eq!(totals.tiles_processed, 1);
        assert_eq!(totals.images_recorded, 0);
        assert_eq!(totals.persist_failures, 1);
    }

    #[tokio::test]
    async fn lookup_errors_are_not_counted_as_misses() {
        let sink = Arc::new(MemorySink::default());
        let (processor, metrics) = processor(FakeReference::Unavailable, sink.clone());
        let (image, labels) = one_label_tile();
        let report = processor.process(image, labels).await;

        assert_eq!(report.reference_errors, 1);
        assert_eq!(report.parcel_misses, 0);
        assert_eq!(report.address_misses, 0);
        assert_eq!(report.labels_recorded, 1);
        assert!(report.image_recorded);
        assert_eq!(metrics.reference_errors_total.get(), 1);
        assert_eq!(metrics.reference_misses_total.with_label_values(&["parcel"]).get(), 0);

        let labels = sink.labels.lock();
        assert!(labels[0].legal_parcel_id.is_none());
        assert!(labels[0].gnaf_pid.is_none());
    }

    #[tokio::test]
    async fn lookup_errors_reach_run_totals() {
        let detector = FakeDetector { per_tile: 2, ..Default::default() };
        let h = harness(1, 10, FakeFetcher { fail_longitude: None }, vec![detector], FakeReference::Unavailable);
        let totals = h.orchestrator.run(six_tiles().iter()).await.unwrap();

        assert_eq!(totals.reference_errors, 12);
        assert_eq!(totals.parcel_misses, 0);
        assert_eq!(totals.labels_recorded, 12);
        assert_eq!(totals.images_recorded, 6);
    }

    #[test]
    fn totals_merge_sums_every_counter() {
        let mut a = BatchTotals::default();
        a.absorb(TileOutcome::DownloadFailed(DownloadErrorKind::Timeout));
        a.absorb(TileOutcome::Processed(TileReport {
            labels: 2,
            labels_recorded: 2,
            image_recorded: true,
            reference_errors: 1,
            ..TileReport::default()
        }));
        let mut b = a.clone();
        b.absorb(TileOutcome::Skipped);
        a.merge(b);

        assert_eq!(a.tiles_processed, 2);
        assert_eq!(a.tiles_with_labels, 2);
        assert_eq!(a.labels_recorded, 4);
        assert_eq!(a.tiles_skipped, 1);
        assert_eq!(a.reference_errors, 2);
        assert_eq!(a.downloads_failed.get(&DownloadErrorKind::Timeout), Some(&2));
    }

    #[test]
    fn orchestrator_needs_a_detector() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let processor = Arc::new(TileProcessor::new(
            Arc::new(FakeReference::Miss),
            Arc::new(MemorySink::default()),
            metrics.clone(),
        ));
        let config = BatchConfig {
            footprint: TileFootprint::square(1.0).unwrap(),
            pixel_size: PixelSize::new(10, 10).unwrap(),
            max_concurrent_downloads: 1,
            chunk_size: 1,
            workers: 1,
        };
        let result = Orchestrator::new(config, Arc::new(FakeFetcher { fail_longitude: None }), Vec::new(), processor, metrics);
        assert!(matches!(result, Err(BatchError::NoDetector)));
    }
}
