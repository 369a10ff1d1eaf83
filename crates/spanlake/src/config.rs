//! Configuration types for the span store.
//!
//! Durations are text values (`"60s"`, `"1h"`, `"24h"`) parsed with
//! [`humantime`] at component construction; an unparseable duration or a
//! missing required value is fatal at startup.

use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

use crate::SpanlakeError;

// ============================================================================
// Default configuration constants
// ============================================================================

/// Default rotation interval for open partition files.
pub const DEFAULT_BUFFER_DURATION: Duration = Duration::from_secs(60);

/// Default suppression window for duplicate operation rows.
pub const DEFAULT_OPERATIONS_DEDUPE_DURATION: Duration = Duration::from_secs(60 * 60);

/// Default bound of the operations dedup cache.
pub const DEFAULT_OPERATIONS_DEDUPE_CACHE_SIZE: usize = 10_000;

/// Default reuse window for dependency-graph query executions.
pub const DEFAULT_DEPENDENCIES_QUERY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default reuse window for services/operations query executions.
pub const DEFAULT_SERVICES_QUERY_TTL: Duration = Duration::from_secs(60);

/// Default partition-window expansion for trace-search span fetches.
pub const DEFAULT_MAX_TRACE_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Span store configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Object storage and writer configuration.
    pub s3: S3Config,
    /// Query engine configuration.
    pub athena: AthenaConfig,
}

impl Config {
    /// Load configuration from files and environment.
    ///
    /// Configuration is loaded in order (later sources override earlier):
    /// 1. Default values
    /// 2. `spanlake.toml` in the current directory
    /// 3. Environment variables prefixed with `SPANLAKE_`
    pub fn load() -> Result<Self, SpanlakeError> {
        Figment::new()
            .merge(Toml::file("spanlake.toml"))
            .merge(Env::prefixed("SPANLAKE_").split("_"))
            .extract()
            .map_err(|e| SpanlakeError::Config(e.to_string()))
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &str) -> Result<Self, SpanlakeError> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("SPANLAKE_").split("_"))
            .extract()
            .map_err(|e| SpanlakeError::Config(e.to_string()))
    }
}

/// Object storage and writer configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct S3Config {
    /// Target object bucket.
    pub bucket_name: String,
    /// Key prefix of the spans dataset.
    pub spans_prefix: String,
    /// Key prefix of the operations dataset.
    pub operations_prefix: String,
    /// Rotation interval for open partition files (default 60s).
    pub buffer_duration: String,
    /// Delete every object in the bucket at startup. Only intended for
    /// ephemeral test buckets.
    pub empty_bucket: bool,
    /// Suppression window for duplicate operation rows (default 1h).
    pub operations_dedupe_duration: String,
    /// Bound of the operations dedup cache (default 10000).
    pub operations_dedupe_cache_size: usize,
    /// AWS region or custom region for S3-compatible services.
    pub region: Option<String>,
    /// Custom endpoint URL for S3-compatible services.
    pub endpoint: Option<String>,
    /// Allow HTTP (non-TLS) connections (for local development).
    pub allow_http: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket_name: String::new(),
            spans_prefix: "spans".to_owned(),
            operations_prefix: "operations".to_owned(),
            buffer_duration: String::new(),
            empty_bucket: false,
            operations_dedupe_duration: String::new(),
            operations_dedupe_cache_size: DEFAULT_OPERATIONS_DEDUPE_CACHE_SIZE,
            region: None,
            endpoint: None,
            allow_http: false,
        }
    }
}

/// Query engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AthenaConfig {
    /// Database holding the external tables.
    pub database_name: String,
    /// External table over the spans dataset.
    pub spans_table_name: String,
    /// External table over the operations dataset.
    pub operations_table_name: String,
    /// Workgroup queries run in; also the scope of execution reuse.
    pub work_group: String,
    /// Result output location for started queries.
    pub output_location: String,
    /// Default read window when a query carries no time bounds. Required.
    pub max_span_age: String,
    /// Reuse window for dependency-graph executions and the prefetch
    /// interval (default 24h).
    pub dependencies_query_ttl: String,
    /// Reuse window for services/operations executions (default 60s).
    pub services_query_ttl: String,
    /// Partition-window expansion when fetching spans of matched traces
    /// (default 24h).
    pub max_trace_duration: String,
    /// Keep the dependency-graph query warm with a background task.
    pub dependencies_prefetch: bool,
}

impl Default for AthenaConfig {
    fn default() -> Self {
        Self {
            database_name: String::new(),
            spans_table_name: String::new(),
            operations_table_name: String::new(),
            work_group: String::new(),
            output_location: String::new(),
            max_span_age: String::new(),
            dependencies_query_ttl: String::new(),
            services_query_ttl: String::new(),
            max_trace_duration: String::new(),
            dependencies_prefetch: false,
        }
    }
}

/// Parse a text duration, falling back to a default when unset.
pub fn parse_duration_with_default(
    text: &str,
    default: Duration,
) -> Result<Duration, SpanlakeError> {
    if text.is_empty() {
        return Ok(default);
    }
    humantime::parse_duration(text)
        .map_err(|e| SpanlakeError::Config(format!("invalid duration {text:?}: {e}")))
}

/// Parse a text duration that has no default.
pub fn parse_required_duration(name: &str, text: &str) -> Result<Duration, SpanlakeError> {
    if text.is_empty() {
        return Err(SpanlakeError::Config(format!("{name} must be set")));
    }
    humantime::parse_duration(text)
        .map_err(|e| SpanlakeError::Config(format!("invalid {name} {text:?}: {e}")))
}
