//! Facade wiring the write and read paths behind the storage interfaces
//! consumed by the RPC adapter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use object_store::ObjectStore;

use crate::config::{parse_duration_with_default, Config, DEFAULT_DEPENDENCIES_QUERY_TTL};
use crate::maintenance;
use crate::model::{DependencyLink, Operation, OperationQuery, Span, Trace, TraceId, TraceQuery};
use crate::query::{DependenciesPrefetch, QueryEngine, Reader};
use crate::write::Writer;
use crate::SpanlakeError;

/// Write surface consumed by the RPC adapter.
#[async_trait]
pub trait SpanWriter: Send + Sync {
    async fn write_span(&self, span: &Span) -> Result<(), SpanlakeError>;
}

/// Read surface consumed by the RPC adapter.
#[async_trait]
pub trait SpanReader: Send + Sync {
    async fn get_trace(&self, trace_id: TraceId) -> Result<Trace, SpanlakeError>;
    async fn get_services(&self) -> Result<Vec<String>, SpanlakeError>;
    async fn get_operations(&self, query: &OperationQuery)
        -> Result<Vec<Operation>, SpanlakeError>;
    async fn find_traces(&self, query: &TraceQuery) -> Result<Vec<Trace>, SpanlakeError>;
    async fn find_trace_ids(&self, query: &TraceQuery) -> Result<Vec<TraceId>, SpanlakeError>;
}

/// Dependency-graph surface consumed by the RPC adapter.
#[async_trait]
pub trait DependencyReader: Send + Sync {
    async fn get_dependencies(
        &self,
        end_ts: DateTime<Utc>,
        lookback: Duration,
    ) -> Result<Vec<DependencyLink>, SpanlakeError>;
}

#[async_trait]
impl SpanWriter for Writer {
    async fn write_span(&self, span: &Span) -> Result<(), SpanlakeError> {
        Writer::write_span(self, span).await
    }
}

#[async_trait]
impl SpanReader for Reader {
    async fn get_trace(&self, trace_id: TraceId) -> Result<Trace, SpanlakeError> {
        Reader::get_trace(self, trace_id).await
    }

    async fn get_services(&self) -> Result<Vec<String>, SpanlakeError> {
        Reader::get_services(self).await
    }

    async fn get_operations(
        &self,
        query: &OperationQuery,
    ) -> Result<Vec<Operation>, SpanlakeError> {
        Reader::get_operations(self, query).await
    }

    async fn find_traces(&self, query: &TraceQuery) -> Result<Vec<Trace>, SpanlakeError> {
        Reader::find_traces(self, query).await
    }

    async fn find_trace_ids(&self, query: &TraceQuery) -> Result<Vec<TraceId>, SpanlakeError> {
        Reader::find_trace_ids(self, query).await
    }
}

#[async_trait]
impl DependencyReader for Reader {
    async fn get_dependencies(
        &self,
        end_ts: DateTime<Utc>,
        lookback: Duration,
    ) -> Result<Vec<DependencyLink>, SpanlakeError> {
        Reader::get_dependencies(self, end_ts, lookback).await
    }
}

/// The wired span store.
pub struct SpanStore {
    writer: Arc<Writer>,
    reader: Arc<Reader>,
    prefetch: DependenciesPrefetch,
}

impl SpanStore {
    /// Wire the store against the given object store and query engine.
    ///
    /// Empties the bucket first when configured, then starts the rotation
    /// timers and, if enabled, the dependencies prefetcher.
    pub async fn new(
        store: Arc<dyn ObjectStore>,
        engine: Arc<dyn QueryEngine>,
        config: &Config,
    ) -> Result<Self, SpanlakeError> {
        if config.s3.empty_bucket {
            maintenance::empty_bucket(store.clone()).await?;
        }

        let writer = Arc::new(Writer::new(store, &config.s3)?);
        let reader = Arc::new(Reader::new(engine, &config.athena)?);

        let prefetch_interval = parse_duration_with_default(
            &config.athena.dependencies_query_ttl,
            DEFAULT_DEPENDENCIES_QUERY_TTL,
        )?;
        let prefetch = DependenciesPrefetch::new(
            reader.clone(),
            prefetch_interval,
            config.athena.dependencies_prefetch,
        );
        prefetch.start().await;

        Ok(Self {
            writer,
            reader,
            prefetch,
        })
    }

    pub fn span_writer(&self) -> Arc<dyn SpanWriter> {
        self.writer.clone()
    }

    pub fn span_reader(&self) -> Arc<dyn SpanReader> {
        self.reader.clone()
    }

    pub fn dependency_reader(&self) -> Arc<dyn DependencyReader> {
        self.reader.clone()
    }

    /// Shut down the writer streams and the prefetcher concurrently,
    /// aggregating errors. In-flight uploads and queries complete.
    pub async fn close(&self) -> Result<(), SpanlakeError> {
        let (write_result, ()) = tokio::join!(self.writer.close(), self.prefetch.stop());
        write_result
    }
}
