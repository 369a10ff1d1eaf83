//! Deduplicating wrapper over the partitioned writer.
//!
//! Operation rows are a low-cardinality fact; without suppression every span
//! would emit one, multiplying storage and fragmenting partition files. The
//! wrapper keeps a bounded LRU of dedup key to next-accept-time and silently
//! discards rows that land inside the window.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use lru::LruCache;

use super::parquet::{PartitionedWriter, RowRecord};
use crate::SpanlakeError;

/// A row with a logical identity for dedup purposes.
pub trait DeduplicatableRow {
    fn dedupe_key(&self) -> String;
}

/// Suppresses re-writes of rows with identical dedup keys within a TTL.
pub struct DedupeWriter<R: RowRecord + DeduplicatableRow> {
    cache: Mutex<LruCache<String, DateTime<Utc>>>,
    dedupe_duration: Duration,
    inner: PartitionedWriter<R>,
}

impl<R: RowRecord + DeduplicatableRow> DedupeWriter<R> {
    pub fn new(
        dedupe_duration: std::time::Duration,
        cache_size: usize,
        inner: PartitionedWriter<R>,
    ) -> Result<Self, SpanlakeError> {
        let capacity = NonZeroUsize::new(cache_size).ok_or_else(|| {
            SpanlakeError::Config("operations dedupe cache size must be positive".to_owned())
        })?;
        let dedupe_duration = Duration::from_std(dedupe_duration).map_err(|e| {
            SpanlakeError::Config(format!("operations dedupe duration out of range: {e}"))
        })?;

        Ok(Self {
            cache: Mutex::new(LruCache::new(capacity)),
            dedupe_duration,
            inner,
        })
    }

    /// Write `row` unless an identical key was accepted less than the dedup
    /// duration before `row_time`. Discards return `Ok`.
    ///
    /// Rows arriving out of row-time order only extend the window when their
    /// row-time advances past the cached next-accept-time.
    pub async fn write(&self, row_time: DateTime<Utc>, row: &R) -> Result<(), SpanlakeError> {
        let key = row.dedupe_key();

        let suppressed = self
            .cache
            .lock()
            .map(|mut cache| matches!(cache.get(&key), Some(next_accept) if row_time < *next_accept))
            .unwrap_or(false);
        if suppressed {
            return Ok(());
        }

        self.inner.write(row_time, row).await?;

        if let Ok(mut cache) = self.cache.lock() {
            cache.put(key, row_time + self.dedupe_duration);
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<(), SpanlakeError> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::OperationRecord;
    use chrono::TimeZone;
    use futures::TryStreamExt;
    use object_store::memory::InMemory;
    use object_store::ObjectStore;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use std::sync::Arc;

    fn operation_row(name: &str) -> OperationRecord {
        OperationRecord {
            operation_name: name.to_owned(),
            span_kind: "server".to_owned(),
            service_name: "svc".to_owned(),
        }
    }

    fn writer(store: Arc<InMemory>, dedupe: std::time::Duration) -> DedupeWriter<OperationRecord> {
        let inner = PartitionedWriter::new(store, "operations", std::time::Duration::from_secs(3600));
        DedupeWriter::new(dedupe, 100, inner).unwrap()
    }

    async fn persisted_rows(store: &InMemory) -> usize {
        let mut total = 0;
        for meta in store.list(None).try_collect::<Vec<_>>().await.unwrap() {
            let data = store.get(&meta.location).await.unwrap().bytes().await.unwrap();
            let reader = ParquetRecordBatchReaderBuilder::try_new(data)
                .unwrap()
                .build()
                .unwrap();
            total += reader.map(|batch| batch.unwrap().num_rows()).sum::<usize>();
        }
        total
    }

    #[tokio::test]
    async fn identical_rows_are_written_once() {
        let store = Arc::new(InMemory::new());
        let writer = writer(store.clone(), std::time::Duration::from_millis(100));
        let time = Utc.with_ymd_and_hms(2021, 1, 30, 6, 10, 0).unwrap();

        writer.write(time, &operation_row("op")).await.unwrap();
        writer.write(time, &operation_row("op")).await.unwrap();
        writer.close().await.unwrap();

        assert_eq!(persisted_rows(&store).await, 1);
    }

    #[tokio::test]
    async fn key_is_re_emitted_after_the_window() {
        let store = Arc::new(InMemory::new());
        let writer = writer(store.clone(), std::time::Duration::from_millis(100));
        let time = Utc.with_ymd_and_hms(2021, 1, 30, 6, 10, 0).unwrap();

        writer.write(time, &operation_row("op")).await.unwrap();
        writer.write(time, &operation_row("op")).await.unwrap();
        writer
            .write(time + Duration::milliseconds(200), &operation_row("op"))
            .await
            .unwrap();
        writer.close().await.unwrap();

        assert_eq!(persisted_rows(&store).await, 2);
    }

    #[tokio::test]
    async fn earlier_row_time_stays_inside_the_window() {
        let store = Arc::new(InMemory::new());
        let writer = writer(store.clone(), std::time::Duration::from_secs(60));
        let time = Utc.with_ymd_and_hms(2021, 1, 30, 6, 10, 0).unwrap();

        writer.write(time, &operation_row("op")).await.unwrap();
        // An out-of-order row predating the accepted one is already covered.
        writer
            .write(time - Duration::seconds(30), &operation_row("op"))
            .await
            .unwrap();
        writer.close().await.unwrap();

        assert_eq!(persisted_rows(&store).await, 1);
    }

    #[tokio::test]
    async fn distinct_keys_are_not_suppressed() {
        let store = Arc::new(InMemory::new());
        let writer = writer(store.clone(), std::time::Duration::from_secs(60));
        let time = Utc.with_ymd_and_hms(2021, 1, 30, 6, 10, 0).unwrap();

        writer.write(time, &operation_row("a")).await.unwrap();
        writer.write(time, &operation_row("b")).await.unwrap();
        writer.close().await.unwrap();

        assert_eq!(persisted_rows(&store).await, 2);
    }

    #[tokio::test]
    async fn eviction_forgets_old_keys() {
        let store = Arc::new(InMemory::new());
        let inner = PartitionedWriter::new(store.clone(), "operations", std::time::Duration::from_secs(3600));
        let writer = DedupeWriter::new(std::time::Duration::from_secs(3600), 1, inner).unwrap();
        let time = Utc.with_ymd_and_hms(2021, 1, 30, 6, 10, 0).unwrap();

        writer.write(time, &operation_row("a")).await.unwrap();
        writer.write(time, &operation_row("b")).await.unwrap();
        // "a" was evicted by "b", so it is accepted again.
        writer.write(time, &operation_row("a")).await.unwrap();
        writer.close().await.unwrap();

        assert_eq!(persisted_rows(&store).await, 3);
    }

    #[test]
    fn zero_cache_size_is_a_config_error() {
        let store = Arc::new(InMemory::new());
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let inner: PartitionedWriter<OperationRecord> =
                PartitionedWriter::new(store, "operations", std::time::Duration::from_secs(60));
            let result = DedupeWriter::new(std::time::Duration::from_secs(60), 0, inner);
            assert!(matches!(result, Err(SpanlakeError::Config(_))));
        });
    }
}
