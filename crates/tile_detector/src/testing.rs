//! In-memory collaborators shared by unit tests.

use axum::Router;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::net::SocketAddr;
use tilegeo::{ImageRecord, LabelRecord, ReferenceMatch};

use crate::reference::ReferenceLookup;
use crate::store::{RecordSink, StoreError};

/// Answers every lookup with the same parcel and address, a miss, or an error.
#[derive(Debug, Clone, Copy)]
pub enum FakeReference {
    Hit,
    Miss,
    /// Behaves like an exhausted connection pool.
    Unavailable,
}

impl ReferenceLookup for FakeReference {
    fn lookup(&self, _latitude: f64, _longitude: f64) -> BoxFuture<'_, Result<Option<ReferenceMatch>, StoreError>> {
        let mode = *self;
        Box::pin(async move {
            match mode {
                FakeReference::Hit => Ok(Some(ReferenceMatch {
                    parcel_id: Some("7//DP1234".into()),
                    address_id: Some("GANSW7".into()),
                    address_text: Some("7 POOL ST, SYDNEY NSW 2000".into()),
                })),
                FakeReference::Miss => Ok(None),
                FakeReference::Unavailable => Err(StoreError::Database(sqlx::Error::PoolTimedOut)),
            }
        })
    }
}

/// Keeps every row it is given. Rows of a failing kind are counted as
/// attempts and rejected.
#[derive(Default)]
pub struct MemorySink {
    pub images: Mutex<Vec<ImageRecord>>,
    pub labels: Mutex<Vec<LabelRecord>>,
    pub fail_images: bool,
    pub fail_labels: bool,
    pub image_attempts: Mutex<usize>,
}

impl MemorySink {
    pub fn failing(fail_images: bool, fail_labels: bool) -> Self {
        Self {
            fail_images,
            fail_labels,
            ..Self::default()
        }
    }
}

fn rejected() -> StoreError {
    StoreError::Database(sqlx::Error::PoolTimedOut)
}

impl RecordSink for MemorySink {
    fn insert_image<'a>(&'a self, record: &'a ImageRecord) -> BoxFuture<'a, Result<(), StoreError>> {
        *self.image_attempts.lock() += 1;
        let result = if self.fail_images {
            Err(rejected())
        } else {
            self.images.lock().push(record.clone());
            Ok(())
        };
        Box::pin(async move { result })
    }

    fn insert_label<'a>(&'a self, record: &'a LabelRecord) -> BoxFuture<'a, Result<(), StoreError>> {
        let result = if self.fail_labels {
            Err(rejected())
        } else {
            self.labels.lock().push(record.clone());
            Ok(())
        };
        Box::pin(async move { result })
    }
}

/// Serves `router` on an ephemeral local port.
pub async fn serve(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
    addr
}
