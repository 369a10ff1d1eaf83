//! Error types for the spanlake crate.

use std::io;

/// Errors that can occur on the ingest or query path.
///
/// Large foreign error types are boxed to keep the enum size small, which
/// improves performance when passing `Result<T, SpanlakeError>` on the stack.
#[derive(Debug, thiserror::Error)]
pub enum SpanlakeError {
    /// Configuration error. Always fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Arrow error (boxed - large type).
    #[error("Arrow error: {0}")]
    Arrow(Box<arrow::error::ArrowError>),

    /// Parquet error (boxed - large type).
    #[error("Parquet error: {0}")]
    Parquet(Box<parquet::errors::ParquetError>),

    /// Object store error (boxed - large type).
    #[error("object store error: {0}")]
    ObjectStore(Box<object_store::Error>),

    /// The query engine rejected or failed a request.
    #[error("query engine error: {0}")]
    Engine(String),

    /// No spans exist for the requested trace id.
    #[error("trace not found")]
    TraceNotFound,

    /// A persisted value could not be decoded back into its domain form.
    #[error("decode error: {0}")]
    Decode(String),

    /// A span could not be encoded into its payload form.
    #[error("failed to encode span payload: {0}")]
    Encode(String),

    /// A result row did not carry the expected column.
    #[error("result row is missing column {0}")]
    MissingColumn(usize),

    /// Write attempted after the writer was closed.
    #[error("writer is closed")]
    WriterClosed,
}

// Manual From implementations for boxed error types
impl From<arrow::error::ArrowError> for SpanlakeError {
    fn from(err: arrow::error::ArrowError) -> Self {
        Self::Arrow(Box::new(err))
    }
}

impl From<parquet::errors::ParquetError> for SpanlakeError {
    fn from(err: parquet::errors::ParquetError) -> Self {
        Self::Parquet(Box::new(err))
    }
}

impl From<object_store::Error> for SpanlakeError {
    fn from(err: object_store::Error) -> Self {
        Self::ObjectStore(Box::new(err))
    }
}
