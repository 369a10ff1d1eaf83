//! Columnar schemas and partition-key helpers.
//!
//! Both datasets are partitioned by the hour of the row's logical time. The
//! external table projects a `datehour` partition column over the object key
//! layout, so the writer must produce exactly
//! `<prefix>/<yyyy/MM/dd/HH>/<suffix>.parquet` and the query runner prunes
//! with `datehour BETWEEN` predicates over the same format. The partition
//! value is never materialized inside the files.

use std::sync::Arc;

use arrow::datatypes::{DataType, Field, Fields, Schema, SchemaRef, TimeUnit};
use chrono::{DateTime, Utc};
use object_store::path::Path;

/// Hourly partition key format.
pub const PARTITION_FORMAT: &str = "%Y/%m/%d/%H";

/// Derive the partition key for a row time.
pub fn partition_key(time: DateTime<Utc>) -> String {
    time.format(PARTITION_FORMAT).to_string()
}

/// Build the object key for one partition file.
pub fn object_key(prefix: &str, partition: &str, suffix: &str) -> Path {
    Path::from(format!("{prefix}/{partition}/{suffix}.parquet"))
}

/// Schema of the spans dataset.
///
/// `start_time` is physically INT64 milliseconds, annotated as a millisecond
/// timestamp so the engine can compare it against `timestamp` literals.
/// `duration` stays a plain INT64 of nanoseconds. Low-cardinality text
/// columns rely on the writer's dictionary encoding.
pub fn spans_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("trace_id", DataType::Utf8, false),
        Field::new("span_id", DataType::Utf8, false),
        Field::new("operation_name", DataType::Utf8, false),
        Field::new("span_kind", DataType::Utf8, false),
        Field::new("service_name", DataType::Utf8, false),
        Field::new(
            "start_time",
            DataType::Timestamp(TimeUnit::Millisecond, None),
            false,
        ),
        Field::new("duration", DataType::Int64, false),
        tags_field(),
        Field::new("span_payload", DataType::Utf8, false),
        references_field(),
    ]))
}

/// Schema of the operations dataset.
pub fn operations_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("operation_name", DataType::Utf8, false),
        Field::new("span_kind", DataType::Utf8, false),
        Field::new("service_name", DataType::Utf8, false),
    ]))
}

/// Entry fields of the `tags` map column.
pub(crate) fn tag_entry_fields() -> Fields {
    Fields::from(vec![
        Field::new("key", DataType::Utf8, false),
        Field::new("value", DataType::Utf8, true),
    ])
}

/// Entries field of the `tags` map column.
pub(crate) fn tags_entry_field() -> Field {
    Field::new("key_value", DataType::Struct(tag_entry_fields()), false)
}

fn tags_field() -> Field {
    Field::new(
        "tags",
        DataType::Map(Arc::new(tags_entry_field()), false),
        false,
    )
}

/// Struct fields of one element of the `references` column.
pub(crate) fn reference_fields() -> Fields {
    Fields::from(vec![
        Field::new("trace_id", DataType::Utf8, false),
        Field::new("span_id", DataType::Utf8, false),
        Field::new("ref_type", DataType::Int64, false),
    ])
}

/// Element field of the `references` list column.
pub(crate) fn reference_element_field() -> Field {
    Field::new("element", DataType::Struct(reference_fields()), true)
}

fn references_field() -> Field {
    Field::new(
        "references",
        DataType::List(Arc::new(reference_element_field())),
        false,
    )
}
