//! Write path: spans and operations streams over the partitioned writer.

pub mod dedupe;
pub mod parquet;

pub use dedupe::{DedupeWriter, DeduplicatableRow};
pub use parquet::{PartitionedWriter, RowRecord};

use std::sync::Arc;

use object_store::ObjectStore;

use crate::config::{
    parse_duration_with_default, S3Config, DEFAULT_BUFFER_DURATION,
    DEFAULT_OPERATIONS_DEDUPE_DURATION,
};
use crate::model::Span;
use crate::record::{OperationRecord, SpanRecord};
use crate::SpanlakeError;

/// The write half of the span store: every span lands in the spans dataset,
/// and its `(service, operation, kind)` fact in the deduplicated operations
/// dataset. Both streams rotate on the configured buffer duration.
pub struct Writer {
    spans: PartitionedWriter<SpanRecord>,
    operations: DedupeWriter<OperationRecord>,
}

impl Writer {
    pub fn new(store: Arc<dyn ObjectStore>, config: &S3Config) -> Result<Self, SpanlakeError> {
        let buffer_duration =
            parse_duration_with_default(&config.buffer_duration, DEFAULT_BUFFER_DURATION)?;
        let dedupe_duration = parse_duration_with_default(
            &config.operations_dedupe_duration,
            DEFAULT_OPERATIONS_DEDUPE_DURATION,
        )?;

        let spans = PartitionedWriter::new(store.clone(), &config.spans_prefix, buffer_duration);
        let operations = DedupeWriter::new(
            dedupe_duration,
            config.operations_dedupe_cache_size,
            PartitionedWriter::new(store, &config.operations_prefix, buffer_duration),
        )?;

        Ok(Self { spans, operations })
    }

    /// Route one span to both datasets, keyed by its start time.
    pub async fn write_span(&self, span: &Span) -> Result<(), SpanlakeError> {
        let span_record = SpanRecord::from_span(span)?;
        let operation_record = OperationRecord::from_span(span);

        tokio::try_join!(
            self.spans.write(span.start_time, &span_record),
            self.operations.write(span.start_time, &operation_record),
        )?;
        Ok(())
    }

    /// Shut both streams down concurrently, aggregating errors.
    pub async fn close(&self) -> Result<(), SpanlakeError> {
        let (spans, operations) = tokio::join!(self.spans.close(), self.operations.close());
        spans.and(operations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::test_span;
    use futures::TryStreamExt;
    use object_store::memory::InMemory;

    fn test_config() -> S3Config {
        S3Config {
            bucket_name: "spans-test".to_owned(),
            ..S3Config::default()
        }
    }

    #[tokio::test]
    async fn write_span_lands_in_both_datasets() {
        let store = Arc::new(InMemory::new());
        let writer = Writer::new(store.clone(), &test_config()).unwrap();

        let span = test_span();
        writer.write_span(&span).await.unwrap();
        writer.write_span(&span).await.unwrap();
        writer.close().await.unwrap();

        let paths: Vec<String> = store
            .list(None)
            .try_collect::<Vec<_>>()
            .await
            .unwrap()
            .into_iter()
            .map(|meta| meta.location.to_string())
            .collect();

        assert_eq!(paths.len(), 2);
        assert!(paths.iter().any(|p| p.starts_with("spans/2017/01/26/16/")));
        assert!(paths
            .iter()
            .any(|p| p.starts_with("operations/2017/01/26/16/")));
    }

    #[tokio::test]
    async fn invalid_buffer_duration_is_fatal() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let config = S3Config {
            buffer_duration: "sixty".to_owned(),
            ..test_config()
        };
        assert!(matches!(
            Writer::new(store, &config),
            Err(SpanlakeError::Config(_))
        ));
    }
}
