//! Domain model for trace spans.
//!
//! Spans arrive from the tracing collector as structured records; everything
//! in this module round-trips through the binary span payload persisted in
//! the `span_payload` column, so all types derive serde traits.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::SpanlakeError;

/// Tag key carrying the span kind, set by instrumentation libraries.
pub const SPAN_KIND_TAG: &str = "span.kind";

/// A 128-bit trace identifier.
///
/// Rendered as lowercase hex. When the high 64 bits are zero the short
/// 16-character form is used, matching the collector's canonical rendering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TraceId {
    pub high: u64,
    pub low: u64,
}

impl TraceId {
    pub const fn new(high: u64, low: u64) -> Self {
        Self { high, low }
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.high == 0 {
            write!(f, "{:016x}", self.low)
        } else {
            write!(f, "{:016x}{:016x}", self.high, self.low)
        }
    }
}

impl FromStr for TraceId {
    type Err = SpanlakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > 32 {
            return Err(SpanlakeError::Decode(format!("invalid trace id {s:?}")));
        }
        let parse = |hex: &str| {
            u64::from_str_radix(hex, 16)
                .map_err(|e| SpanlakeError::Decode(format!("invalid trace id {s:?}: {e}")))
        };
        if s.len() <= 16 {
            Ok(Self::new(0, parse(s)?))
        } else {
            let (high, low) = s.split_at(s.len() - 16);
            Ok(Self::new(parse(high)?, parse(low)?))
        }
    }
}

/// A 64-bit span identifier, rendered as 16 lowercase hex characters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SpanId(pub u64);

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for SpanId {
    type Err = SpanlakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > 16 {
            return Err(SpanlakeError::Decode(format!("invalid span id {s:?}")));
        }
        u64::from_str_radix(s, 16)
            .map(Self)
            .map_err(|e| SpanlakeError::Decode(format!("invalid span id {s:?}: {e}")))
    }
}

/// A typed tag value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TagValue {
    String(String),
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Binary(Vec<u8>),
}

impl TagValue {
    /// Canonical text rendering used for the searchable `tags` column.
    pub fn as_string(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Bool(b) => b.to_string(),
            Self::Int64(i) => i.to_string(),
            Self::Float64(f) => f.to_string(),
            Self::Binary(b) => hex::encode(b),
        }
    }
}

/// A key/value tag attached to a span, process, or log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: TagValue,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: TagValue) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// A timed log entry attached to a span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Log {
    pub timestamp: DateTime<Utc>,
    pub fields: Vec<KeyValue>,
}

/// The process that emitted a span.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Process {
    pub service_name: String,
    pub tags: Vec<KeyValue>,
}

/// How a span relates to another span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanRefType {
    ChildOf,
    FollowsFrom,
}

impl SpanRefType {
    pub const fn as_i64(self) -> i64 {
        match self {
            Self::ChildOf => 0,
            Self::FollowsFrom => 1,
        }
    }
}

/// A reference from one span to another.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpanRef {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub ref_type: SpanRefType,
}

/// One span of a trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub operation_name: String,
    pub references: Vec<SpanRef>,
    pub flags: u32,
    pub start_time: DateTime<Utc>,
    pub duration: Duration,
    pub tags: Vec<KeyValue>,
    pub logs: Vec<Log>,
    pub process: Process,
}

impl Span {
    /// The span kind carried in the `span.kind` tag, or `""` when unset.
    pub fn span_kind(&self) -> &str {
        self.tags
            .iter()
            .find(|kv| kv.key == SPAN_KIND_TAG)
            .and_then(|kv| match &kv.value {
                TagValue::String(s) => Some(s.as_str()),
                _ => None,
            })
            .unwrap_or("")
    }
}

/// A trace assembled from its spans.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trace {
    pub spans: Vec<Span>,
}

/// One edge of the inter-service dependency graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyLink {
    pub parent: String,
    pub child: String,
    pub call_count: u64,
}

/// A distinct operation offered by a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub name: String,
    pub span_kind: String,
}

/// Parameters for an operations listing.
#[derive(Debug, Clone, Default)]
pub struct OperationQuery {
    pub service_name: String,
    pub span_kind: Option<String>,
}

/// Parameters for a trace search.
#[derive(Debug, Clone, Default)]
pub struct TraceQuery {
    pub service_name: String,
    pub operation_name: Option<String>,
    pub tags: Vec<(String, String)>,
    pub start_time_min: Option<DateTime<Utc>>,
    pub start_time_max: Option<DateTime<Utc>>,
    pub duration_min: Option<Duration>,
    pub duration_max: Option<Duration>,
    pub num_traces: usize,
}
