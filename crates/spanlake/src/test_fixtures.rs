//! Shared fixtures for unit tests: canned spans and an in-memory query
//! engine that records the calls made against it.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};

use crate::model::{KeyValue, Log, Process, Span, SpanId, SpanRef, SpanRefType, TagValue, TraceId};
use crate::query::engine::{
    BatchExecutions, ExecutionIdPage, ExecutionState, QueryEngine, QueryExecution, ResultPage,
    ResultRow, StartQueryRequest,
};
use crate::SpanlakeError;

/// A minimal span: no tags, no references, two empty logs.
pub fn test_span() -> Span {
    let start_time =
        Utc.with_ymd_and_hms(2017, 1, 26, 16, 46, 31).unwrap() + Duration::microseconds(639_875);
    Span {
        trace_id: TraceId::new(0, 0x11),
        span_id: SpanId(0x3),
        operation_name: "example-operation-1".to_owned(),
        references: Vec::new(),
        flags: 0,
        start_time,
        duration: std::time::Duration::from_nanos(100_000),
        tags: Vec::new(),
        logs: vec![
            Log {
                timestamp: start_time,
                fields: Vec::new(),
            },
            Log {
                timestamp: start_time,
                fields: Vec::new(),
            },
        ],
        process: Process {
            service_name: "example-service-1".to_owned(),
            tags: Vec::new(),
        },
    }
}

/// A span exercising every tag value type plus a reference.
pub fn test_span_with_tags_and_references() -> Span {
    let start_time =
        Utc.with_ymd_and_hms(2017, 1, 26, 16, 46, 31).unwrap() + Duration::microseconds(639_875);
    Span {
        trace_id: TraceId::new(0, 0x12),
        span_id: SpanId(0x4),
        operation_name: "query12-operation".to_owned(),
        references: vec![SpanRef {
            trace_id: TraceId::new(0, 0xff),
            span_id: SpanId(0xff),
            ref_type: SpanRefType::ChildOf,
        }],
        flags: 0,
        start_time,
        duration: std::time::Duration::from_nanos(2_000),
        tags: vec![
            KeyValue::new("sameplacetag1", TagValue::String("sameplacevalue".to_owned())),
            KeyValue::new("sameplacetag2", TagValue::Int64(123)),
            KeyValue::new("sameplacetag4", TagValue::Bool(true)),
            KeyValue::new("sameplacetag3", TagValue::Float64(72.5)),
            KeyValue::new("blob", TagValue::Binary(vec![0x00, 0x00, 0x30, 0x39])),
        ],
        logs: Vec::new(),
        process: Process {
            service_name: "query12-service".to_owned(),
            tags: Vec::new(),
        },
    }
}

/// A successful execution submitted and completed just now.
pub fn succeeded_execution(id: &str, query: &str) -> QueryExecution {
    QueryExecution {
        id: id.to_owned(),
        query: query.to_owned(),
        state: ExecutionState::Succeeded,
        state_reason: None,
        submitted_at: Some(Utc::now()),
        completed_at: Some(Utc::now()),
    }
}

fn to_rows(rows: Vec<Vec<&str>>) -> Vec<ResultRow> {
    rows.into_iter()
        .map(|row| ResultRow::new(row.into_iter().map(|col| Some(col.to_owned())).collect()))
        .collect()
}

#[derive(Default)]
struct FakeState {
    /// Executions in listing order (newest first) with their data rows.
    history: Vec<(QueryExecution, Vec<ResultRow>)>,
    /// `(query substring, data rows)` served to newly started queries.
    canned: Vec<(String, Vec<ResultRow>)>,
    unprocessed: Vec<String>,
    failures: Vec<String>,
    pending_polls: HashMap<String, usize>,
    result_page_size: Option<usize>,
    started: Vec<StartQueryRequest>,
    next_id: usize,
    list_calls: usize,
    batch_calls: usize,
}

/// In-memory [`QueryEngine`] with canned results and call accounting.
#[derive(Default)]
pub struct FakeQueryEngine {
    state: Mutex<FakeState>,
}

impl FakeQueryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an execution to the listing (earlier pushes are listed first,
    /// i.e. are newer).
    pub fn push_history(&self, execution: QueryExecution, rows: Vec<Vec<&str>>) {
        let mut state = self.state.lock().unwrap();
        state.history.push((execution, to_rows(rows)));
    }

    /// Serve `rows` to any started query whose text contains `pattern`.
    pub fn respond_with(&self, pattern: &str, rows: Vec<Vec<&str>>) {
        let mut state = self.state.lock().unwrap();
        state.canned.push((pattern.to_owned(), to_rows(rows)));
    }

    /// Report these ids as unprocessed from every batch-metadata fetch.
    pub fn set_unprocessed(&self, ids: Vec<String>) {
        self.state.lock().unwrap().unprocessed = ids;
    }

    /// Fail any started query whose text contains `pattern`.
    pub fn fail_started(&self, pattern: &str) {
        self.state.lock().unwrap().failures.push(pattern.to_owned());
    }

    /// Split result sets into pages of `size` rows.
    pub fn set_result_page_size(&self, size: usize) {
        self.state.lock().unwrap().result_page_size = Some(size);
    }

    /// Report the execution as still running for the next `polls` metadata
    /// fetches.
    pub fn complete_after(&self, execution_id: &str, polls: usize) {
        self.state
            .lock()
            .unwrap()
            .pending_polls
            .insert(execution_id.to_owned(), polls);
    }

    pub fn started(&self) -> Vec<StartQueryRequest> {
        self.state.lock().unwrap().started.clone()
    }

    pub fn list_calls(&self) -> usize {
        self.state.lock().unwrap().list_calls
    }

    pub fn batch_calls(&self) -> usize {
        self.state.lock().unwrap().batch_calls
    }
}

#[async_trait]
impl QueryEngine for FakeQueryEngine {
    async fn start_query(&self, request: StartQueryRequest) -> Result<String, SpanlakeError> {
        let mut state = self.state.lock().unwrap();
        let id = format!("exec-{}", state.next_id);
        state.next_id += 1;

        let rows = state
            .canned
            .iter()
            .find(|(pattern, _)| request.sql.contains(pattern))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default();

        let mut execution = succeeded_execution(&id, &request.sql);
        if state
            .failures
            .iter()
            .any(|pattern| request.sql.contains(pattern))
        {
            execution.state = ExecutionState::Failed;
            execution.state_reason = Some("mock failure".to_owned());
        }
        state.history.insert(0, (execution, rows));
        state.started.push(request);
        Ok(id)
    }

    async fn get_execution(&self, execution_id: &str) -> Result<QueryExecution, SpanlakeError> {
        let mut state = self.state.lock().unwrap();
        let still_running = match state.pending_polls.get_mut(execution_id) {
            Some(polls) if *polls > 0 => {
                *polls -= 1;
                true
            }
            _ => false,
        };
        let mut execution = find_execution(&state, execution_id)?;
        if still_running {
            execution.state = ExecutionState::Running;
            execution.completed_at = None;
        }
        Ok(execution)
    }

    async fn get_results(
        &self,
        execution_id: &str,
        page_token: Option<&str>,
    ) -> Result<ResultPage, SpanlakeError> {
        let state = self.state.lock().unwrap();
        let data = state
            .history
            .iter()
            .find(|(execution, _)| execution.id == execution_id)
            .map(|(_, rows)| rows.clone())
            .ok_or_else(|| SpanlakeError::Engine(format!("unknown execution {execution_id}")))?;

        // The engine always leads with a header row.
        let mut all = vec![ResultRow::default()];
        all.extend(data);

        let page_size = state.result_page_size.unwrap_or(usize::MAX);
        let offset: usize = page_token.map_or(Ok(0), str::parse).map_err(|_| {
            SpanlakeError::Engine(format!("bad page token {page_token:?}"))
        })?;
        let end = offset.saturating_add(page_size).min(all.len());
        let next_token = (end < all.len()).then(|| end.to_string());

        Ok(ResultPage {
            rows: all[offset..end].to_vec(),
            next_token,
        })
    }

    async fn list_recent_executions(
        &self,
        _work_group: &str,
        max_results: usize,
        page_token: Option<&str>,
    ) -> Result<ExecutionIdPage, SpanlakeError> {
        let mut state = self.state.lock().unwrap();
        state.list_calls += 1;

        let ids: Vec<String> = state
            .history
            .iter()
            .map(|(execution, _)| execution.id.clone())
            .collect();
        let offset: usize = page_token.map_or(Ok(0), str::parse).map_err(|_| {
            SpanlakeError::Engine(format!("bad page token {page_token:?}"))
        })?;
        let end = offset.saturating_add(max_results).min(ids.len());
        let next_token = (end < ids.len()).then(|| end.to_string());

        Ok(ExecutionIdPage {
            ids: ids[offset..end].to_vec(),
            next_token,
        })
    }

    async fn batch_get_executions(
        &self,
        execution_ids: &[String],
    ) -> Result<BatchExecutions, SpanlakeError> {
        let mut state = self.state.lock().unwrap();
        state.batch_calls += 1;

        let executions = state
            .history
            .iter()
            .filter(|(execution, _)| execution_ids.contains(&execution.id))
            .map(|(execution, _)| execution.clone())
            .collect();

        Ok(BatchExecutions {
            executions,
            unprocessed: state.unprocessed.clone(),
        })
    }

    async fn stop_query(&self, _execution_id: &str) -> Result<(), SpanlakeError> {
        Ok(())
    }
}

fn find_execution(state: &FakeState, execution_id: &str) -> Result<QueryExecution, SpanlakeError> {
    state
        .history
        .iter()
        .find(|(execution, _)| execution.id == execution_id)
        .map(|(execution, _)| execution.clone())
        .ok_or_else(|| SpanlakeError::Engine(format!("unknown execution {execution_id}")))
}
