//! spanlake - distributed-tracing span storage over object storage and
//! serverless SQL.
//!
//! Spans arriving from a tracing collector are buffered into hourly
//! partitioned parquet files streamed to an object bucket; trace queries run
//! as SQL against an external serverless engine over that bucket, with
//! recent engine executions reused as a distributed result cache.
//!
//! ## Architecture
//!
//! ```text
//! spans → partitioned parquet writer → s3://bucket/spans/yyyy/MM/dd/HH/
//!       → dedup → operations writer  → s3://bucket/operations/yyyy/MM/dd/HH/
//!                                            ↓
//!                        serverless SQL engine (partition projection)
//!                                            ↓
//!                      query runner + execution cache + prefetcher
//! ```
//!
//! The RPC surface adapting this core to a tracing daemon, the concrete
//! engine client, and the tracing UI all live outside this crate; the seams
//! are [`plugin::SpanWriter`], [`plugin::SpanReader`],
//! [`plugin::DependencyReader`], and [`query::QueryEngine`].

pub mod config;
pub mod error;
pub mod maintenance;
pub mod model;
pub mod plugin;
pub mod query;
pub mod record;
pub mod schema;
pub mod storage;
pub mod write;

#[cfg(test)]
pub(crate) mod test_fixtures;

pub use config::Config;
pub use error::SpanlakeError;
pub use plugin::{DependencyReader, SpanReader, SpanStore, SpanWriter};
