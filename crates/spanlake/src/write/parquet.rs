//! Partitioned columnar writer with timer rotation.
//!
//! One parquet file is kept open per hourly partition. Opening a file starts
//! a streaming multipart upload; rotation swaps the whole open-writer set and
//! finalizes the swapped files (columnar footer + upload completion) outside
//! the writer lock, so appends only ever contend with the map swap itself.
//!
//! There is no read-your-writes guarantee: rows become queryable once their
//! file has been finalized to the object store. If finalizing a rotated file
//! fails, the rows in that file are lost; upstream collectors retry.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use object_store::ObjectStore;
use parquet::arrow::async_writer::ParquetObjectWriter;
use parquet::arrow::AsyncArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::schema::{object_key, partition_key};
use crate::SpanlakeError;

/// A row type that can be appended to a columnar partition file.
pub trait RowRecord: Send + Sync + 'static {
    /// Arrow schema of the dataset this record belongs to.
    fn schema() -> SchemaRef;

    /// Convert a slice of records into one record batch.
    fn to_batch(rows: &[Self]) -> Result<RecordBatch, SpanlakeError>
    where
        Self: Sized;
}

const SUFFIX_LENGTH: usize = 32;
const SUFFIX_LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

type OpenWriter = AsyncArrowWriter<ParquetObjectWriter>;

struct WriterState {
    /// `None` once the writer has been closed.
    open: Option<HashMap<String, OpenWriter>>,
    rng: StdRng,
}

struct RotationTask {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Writes rows into one open parquet file per hourly partition, rotating the
/// whole set on a timer.
pub struct PartitionedWriter<R: RowRecord> {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    state: Arc<Mutex<WriterState>>,
    rotation: Mutex<Option<RotationTask>>,
    record: PhantomData<fn(&R)>,
}

impl<R: RowRecord> PartitionedWriter<R> {
    /// Create a writer rotating every `buffer_duration`.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        prefix: impl Into<String>,
        buffer_duration: Duration,
    ) -> Self {
        let prefix = prefix.into();
        let state = Arc::new(Mutex::new(WriterState {
            open: Some(HashMap::new()),
            rng: StdRng::from_entropy(),
        }));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let rotation_state = state.clone();
        let rotation_prefix = prefix.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + buffer_duration,
                buffer_duration,
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = rotate(&rotation_state).await {
                            tracing::error!(
                                prefix = %rotation_prefix,
                                error = %e,
                                "failed to rotate partition writers"
                            );
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Self {
            store,
            prefix,
            state,
            rotation: Mutex::new(Some(RotationTask {
                shutdown: shutdown_tx,
                task,
            })),
            record: PhantomData,
        }
    }

    /// Append one row to the partition file derived from `row_time`, opening
    /// the file (and its multipart upload) on first write to that partition.
    ///
    /// Fails with [`SpanlakeError::WriterClosed`] after [`close`](Self::close).
    pub async fn write(&self, row_time: DateTime<Utc>, row: &R) -> Result<(), SpanlakeError> {
        let batch = R::to_batch(std::slice::from_ref(row))?;
        let partition = partition_key(row_time);

        let mut guard = self.state.lock().await;
        let WriterState { open, rng } = &mut *guard;
        let open = open.as_mut().ok_or(SpanlakeError::WriterClosed)?;

        let writer = match open.entry(partition) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let path = object_key(&self.prefix, entry.key(), &random_suffix(rng));
                tracing::debug!(path = %path, "opening partition file");
                let object_writer = ParquetObjectWriter::new(self.store.clone(), path);
                let writer =
                    AsyncArrowWriter::try_new(object_writer, R::schema(), Some(writer_properties()))?;
                entry.insert(writer)
            }
        };

        writer.write(&batch).await?;
        Ok(())
    }

    /// Stop the rotation timer, then finalize every open partition file.
    ///
    /// Upload failures are aggregated into the returned error; subsequent
    /// writes fail with [`SpanlakeError::WriterClosed`].
    pub async fn close(&self) -> Result<(), SpanlakeError> {
        if let Some(rotation) = self.rotation.lock().await.take() {
            let _ = rotation.shutdown.send(());
            let _ = rotation.task.await;
        }

        let swapped = { self.state.lock().await.open.take() };
        match swapped {
            Some(writers) => close_writers(writers).await,
            None => Ok(()),
        }
    }
}

/// Swap the open-writer set for an empty one and finalize the swapped files.
///
/// The swap holds the writer lock; finalizing does not.
async fn rotate(state: &Mutex<WriterState>) -> Result<(), SpanlakeError> {
    let swapped = {
        let mut guard = state.lock().await;
        match guard.open.as_mut() {
            Some(open) if !open.is_empty() => std::mem::take(open),
            _ => return Ok(()),
        }
    };

    tracing::debug!(files = swapped.len(), "rotating partition writers");
    close_writers(swapped).await
}

async fn close_writers(writers: HashMap<String, OpenWriter>) -> Result<(), SpanlakeError> {
    let mut first_error = None;
    for (partition, writer) in writers {
        match writer.close().await {
            Ok(metadata) => {
                tracing::debug!(
                    partition = %partition,
                    rows = metadata.num_rows,
                    "finalized partition file"
                );
            }
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e.into());
                }
            }
        }
    }
    first_error.map_or(Ok(()), Err)
}

fn writer_properties() -> WriterProperties {
    WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::default()))
        .build()
}

fn random_suffix(rng: &mut StdRng) -> String {
    (0..SUFFIX_LENGTH)
        .map(|_| SUFFIX_LETTERS[rng.gen_range(0..SUFFIX_LETTERS.len())] as char)
        .collect()
}
