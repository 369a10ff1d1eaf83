//! Flattened records persisted to the spans and operations datasets.
//!
//! A [`SpanRecord`] carries the searchable properties of a span plus the
//! whole span as an opaque payload; the payload is the source of truth when
//! traces are reconstructed on read. An [`OperationRecord`] is the
//! low-cardinality `(service, operation, kind)` fact used to answer the
//! services and operations listings.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;

use arrow::array::{
    ArrayRef, Int64Array, ListArray, MapArray, RecordBatch, StringArray, StructArray,
    TimestampMillisecondArray,
};
use arrow::buffer::OffsetBuffer;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::model::Span;
use crate::schema;
use crate::write::{DeduplicatableRow, RowRecord};
use crate::SpanlakeError;

/// One row of the spans dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanRecord {
    pub trace_id: String,
    pub span_id: String,
    pub operation_name: String,
    pub span_kind: String,
    pub service_name: String,
    /// Milliseconds since the Unix epoch.
    pub start_time: i64,
    /// Nanoseconds.
    pub duration: i64,
    pub tags: BTreeMap<String, String>,
    pub span_payload: String,
    pub references: Vec<SpanRecordReference>,
}

/// One element of a span record's `references` column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanRecordReference {
    pub trace_id: String,
    pub span_id: String,
    pub ref_type: i64,
}

impl SpanRecord {
    /// Flatten a span into its persisted row.
    ///
    /// The searchable `tags` map is the union of span tags, process tags and
    /// log fields, each value in its canonical text rendering. Later sources
    /// win on key collision.
    pub fn from_span(span: &Span) -> Result<Self, SpanlakeError> {
        let mut searchable = Vec::with_capacity(span.tags.len() + span.process.tags.len());
        searchable.extend(span.tags.iter());
        searchable.extend(span.process.tags.iter());
        for log in &span.logs {
            searchable.extend(log.fields.iter());
        }
        let tags = searchable
            .into_iter()
            .map(|kv| (kv.key.clone(), kv.value.as_string()))
            .collect();

        Ok(Self {
            trace_id: span.trace_id.to_string(),
            span_id: span.span_id.to_string(),
            operation_name: span.operation_name.clone(),
            span_kind: span.span_kind().to_owned(),
            service_name: span.process.service_name.clone(),
            start_time: span.start_time.timestamp_millis(),
            duration: i64::try_from(span.duration.as_nanos()).unwrap_or(i64::MAX),
            tags,
            span_payload: encode_span_payload(span)?,
            references: span
                .references
                .iter()
                .map(|r| SpanRecordReference {
                    trace_id: r.trace_id.to_string(),
                    span_id: r.span_id.to_string(),
                    ref_type: r.ref_type.as_i64(),
                })
                .collect(),
        })
    }
}

impl RowRecord for SpanRecord {
    fn schema() -> arrow::datatypes::SchemaRef {
        schema::spans_schema()
    }

    fn to_batch(rows: &[Self]) -> Result<RecordBatch, SpanlakeError> {
        let trace_ids: ArrayRef = Arc::new(StringArray::from_iter_values(
            rows.iter().map(|r| r.trace_id.as_str()),
        ));
        let span_ids: ArrayRef = Arc::new(StringArray::from_iter_values(
            rows.iter().map(|r| r.span_id.as_str()),
        ));
        let operation_names: ArrayRef = Arc::new(StringArray::from_iter_values(
            rows.iter().map(|r| r.operation_name.as_str()),
        ));
        let span_kinds: ArrayRef = Arc::new(StringArray::from_iter_values(
            rows.iter().map(|r| r.span_kind.as_str()),
        ));
        let service_names: ArrayRef = Arc::new(StringArray::from_iter_values(
            rows.iter().map(|r| r.service_name.as_str()),
        ));
        let start_times: ArrayRef = Arc::new(TimestampMillisecondArray::from_iter_values(
            rows.iter().map(|r| r.start_time),
        ));
        let durations: ArrayRef = Arc::new(Int64Array::from_iter_values(
            rows.iter().map(|r| r.duration),
        ));
        let payloads: ArrayRef = Arc::new(StringArray::from_iter_values(
            rows.iter().map(|r| r.span_payload.as_str()),
        ));

        let mut tag_offsets = vec![0_i32];
        let mut tag_keys: Vec<&str> = Vec::new();
        let mut tag_values: Vec<&str> = Vec::new();
        for row in rows {
            for (key, value) in &row.tags {
                tag_keys.push(key);
                tag_values.push(value);
            }
            tag_offsets.push(offset_from(tag_keys.len())?);
        }
        let tag_entries = StructArray::try_new(
            schema::tag_entry_fields(),
            vec![
                Arc::new(StringArray::from(tag_keys)) as ArrayRef,
                Arc::new(StringArray::from(tag_values)) as ArrayRef,
            ],
            None,
        )?;
        let tags: ArrayRef = Arc::new(MapArray::try_new(
            Arc::new(schema::tags_entry_field()),
            OffsetBuffer::new(tag_offsets.into()),
            tag_entries,
            None,
            false,
        )?);

        let mut reference_offsets = vec![0_i32];
        let mut ref_trace_ids: Vec<&str> = Vec::new();
        let mut ref_span_ids: Vec<&str> = Vec::new();
        let mut ref_types: Vec<i64> = Vec::new();
        for row in rows {
            for reference in &row.references {
                ref_trace_ids.push(&reference.trace_id);
                ref_span_ids.push(&reference.span_id);
                ref_types.push(reference.ref_type);
            }
            reference_offsets.push(offset_from(ref_trace_ids.len())?);
        }
        let reference_values = StructArray::try_new(
            schema::reference_fields(),
            vec![
                Arc::new(StringArray::from(ref_trace_ids)) as ArrayRef,
                Arc::new(StringArray::from(ref_span_ids)) as ArrayRef,
                Arc::new(Int64Array::from(ref_types)) as ArrayRef,
            ],
            None,
        )?;
        let references: ArrayRef = Arc::new(ListArray::try_new(
            Arc::new(schema::reference_element_field()),
            OffsetBuffer::new(reference_offsets.into()),
            Arc::new(reference_values),
            None,
        )?);

        RecordBatch::try_new(
            Self::schema(),
            vec![
                trace_ids,
                span_ids,
                operation_names,
                span_kinds,
                service_names,
                start_times,
                durations,
                tags,
                payloads,
                references,
            ],
        )
        .map_err(Into::into)
    }
}

/// One row of the operations dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRecord {
    pub operation_name: String,
    pub span_kind: String,
    pub service_name: String,
}

impl OperationRecord {
    pub fn from_span(span: &Span) -> Self {
        Self {
            operation_name: span.operation_name.clone(),
            span_kind: span.span_kind().to_owned(),
            service_name: span.process.service_name.clone(),
        }
    }
}

impl DeduplicatableRow for OperationRecord {
    fn dedupe_key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.operation_name, self.span_kind, self.service_name
        )
    }
}

impl RowRecord for OperationRecord {
    fn schema() -> arrow::datatypes::SchemaRef {
        schema::operations_schema()
    }

    fn to_batch(rows: &[Self]) -> Result<RecordBatch, SpanlakeError> {
        let operation_names: ArrayRef = Arc::new(StringArray::from_iter_values(
            rows.iter().map(|r| r.operation_name.as_str()),
        ));
        let span_kinds: ArrayRef = Arc::new(StringArray::from_iter_values(
            rows.iter().map(|r| r.span_kind.as_str()),
        ));
        let service_names: ArrayRef = Arc::new(StringArray::from_iter_values(
            rows.iter().map(|r| r.service_name.as_str()),
        ));
        RecordBatch::try_new(
            Self::schema(),
            vec![operation_names, span_kinds, service_names],
        )
        .map_err(Into::into)
    }
}

/// Encode a span for the `span_payload` column.
///
/// The pipeline is binary encode (CBOR), gzip, then base64 so the result
/// fits a text column. [`decode_span_payload`] inverts it exactly.
pub fn encode_span_payload(span: &Span) -> Result<String, SpanlakeError> {
    let mut encoded = Vec::new();
    ciborium::ser::into_writer(span, &mut encoded)
        .map_err(|e| SpanlakeError::Encode(e.to_string()))?;

    let mut compressor = GzEncoder::new(Vec::new(), Compression::default());
    compressor
        .write_all(&encoded)
        .map_err(|e| SpanlakeError::Encode(e.to_string()))?;
    let compressed = compressor
        .finish()
        .map_err(|e| SpanlakeError::Encode(e.to_string()))?;

    Ok(BASE64.encode(compressed))
}

/// Decode a `span_payload` column value back into a span.
pub fn decode_span_payload(payload: &str) -> Result<Span, SpanlakeError> {
    let compressed = BASE64
        .decode(payload)
        .map_err(|e| SpanlakeError::Decode(format!("payload base64: {e}")))?;

    let mut encoded = Vec::new();
    GzDecoder::new(compressed.as_slice())
        .read_to_end(&mut encoded)
        .map_err(|e| SpanlakeError::Decode(format!("payload decompress: {e}")))?;

    ciborium::de::from_reader(encoded.as_slice())
        .map_err(|e| SpanlakeError::Decode(format!("payload decode: {e}")))
}

fn offset_from(len: usize) -> Result<i32, SpanlakeError> {
    i32::try_from(len).map_err(|_| SpanlakeError::Encode("record batch too large".to_owned()))
}
