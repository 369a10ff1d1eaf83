//! Client abstraction over the external serverless query engine.
//!
//! The engine runs SQL over the partitioned datasets and retains finished
//! executions for a while; that retention is what the execution cache builds
//! on. The concrete client (an AWS SDK in production) lives outside this
//! crate and implements [`QueryEngine`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::SpanlakeError;

/// Terminal and in-flight states of a query execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// One submitted SQL statement, inspectable for the engine's retention
/// period.
#[derive(Debug, Clone)]
pub struct QueryExecution {
    pub id: String,
    /// The submitted query text.
    pub query: String,
    pub state: ExecutionState,
    /// Engine-provided explanation for FAILED or CANCELLED executions.
    pub state_reason: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    /// Set once the execution reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

/// One result row. Every column is a text scalar.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultRow {
    pub columns: Vec<Option<String>>,
}

impl ResultRow {
    pub fn new(columns: Vec<Option<String>>) -> Self {
        Self { columns }
    }

    /// Column access by index. A missing value is a contract violation and
    /// surfaces as a fatal decode error.
    pub fn column(&self, index: usize) -> Result<&str, SpanlakeError> {
        self.columns
            .get(index)
            .and_then(|value| value.as_deref())
            .ok_or(SpanlakeError::MissingColumn(index))
    }
}

/// One page of result rows.
#[derive(Debug, Clone, Default)]
pub struct ResultPage {
    pub rows: Vec<ResultRow>,
    pub next_token: Option<String>,
}

/// One page of recent execution ids, newest first.
#[derive(Debug, Clone, Default)]
pub struct ExecutionIdPage {
    pub ids: Vec<String>,
    pub next_token: Option<String>,
}

/// Result of a batched execution-metadata fetch.
#[derive(Debug, Clone, Default)]
pub struct BatchExecutions {
    pub executions: Vec<QueryExecution>,
    /// Ids the engine refused to resolve (typically a permissions problem).
    pub unprocessed: Vec<String>,
}

/// Parameters for starting a query execution.
#[derive(Debug, Clone)]
pub struct StartQueryRequest {
    pub sql: String,
    pub database: String,
    pub output_location: String,
    pub work_group: String,
    /// Positional execution parameters substituted for `?` placeholders.
    pub parameters: Vec<String>,
}

/// Operations the external query engine must provide.
#[async_trait]
pub trait QueryEngine: Send + Sync + 'static {
    /// Submit a query, returning its execution id.
    async fn start_query(&self, request: StartQueryRequest) -> Result<String, SpanlakeError>;

    /// Fetch the current metadata of one execution.
    async fn get_execution(&self, execution_id: &str) -> Result<QueryExecution, SpanlakeError>;

    /// Fetch one page of result rows. The first row of the first page is the
    /// header row.
    async fn get_results(
        &self,
        execution_id: &str,
        page_token: Option<&str>,
    ) -> Result<ResultPage, SpanlakeError>;

    /// List recent execution ids in a workgroup, newest first, in pages of
    /// up to `max_results`.
    async fn list_recent_executions(
        &self,
        work_group: &str,
        max_results: usize,
        page_token: Option<&str>,
    ) -> Result<ExecutionIdPage, SpanlakeError>;

    /// Fetch metadata for up to 50 executions in one call.
    async fn batch_get_executions(
        &self,
        execution_ids: &[String],
    ) -> Result<BatchExecutions, SpanlakeError>;

    /// Cancel an in-flight execution.
    async fn stop_query(&self, execution_id: &str) -> Result<(), SpanlakeError>;
}
