//! Query-execution cache over the engine's retention of recent executions.
//!
//! Re-submitting an identical query costs seconds and money; fetching the
//! results of a recent execution is sub-second. The cache therefore looks
//! up recent executions by query-text substring instead of keeping any
//! local state.
//!
//! The lookup key is a stable query-shape prefix (the text up to `WHERE`,
//! or the leading CTE clause) rather than the full query, which varies by
//! partition range. That keeps the cache robust to time-window drift while
//! still separating different query shapes.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::engine::{ExecutionState, QueryEngine, QueryExecution};
use crate::SpanlakeError;

/// Recent executions are listed in pages of up to this many ids, which is
/// also the batch-metadata fetch limit.
const LIST_PAGE_SIZE: usize = 50;

/// Id pages buffered between the listing task and the lookup worker.
const ID_CHUNK_BUFFER: usize = 3;

/// Looks up reusable query executions in the configured workgroup.
pub struct QueryCache {
    engine: Arc<dyn QueryEngine>,
    work_group: String,
}

impl QueryCache {
    pub fn new(engine: Arc<dyn QueryEngine>, work_group: impl Into<String>) -> Self {
        Self {
            engine,
            work_group: work_group.into(),
        }
    }

    /// Find the most recent successful-or-running execution whose query text
    /// contains `key` and whose submission is younger than `ttl`.
    ///
    /// Listing and metadata fetching run concurrently: the listing task
    /// pushes id pages into a bounded channel and the worker consumes them.
    /// Either side cancels the other on a match, at the TTL boundary, or
    /// when an empty page signals exhaustion. Executions are listed newest
    /// first, so the first expired execution ends the whole search.
    pub async fn lookup(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<QueryExecution>, SpanlakeError> {
        let expiry = Utc::now() - ttl;
        let cancel = CancellationToken::new();
        let (chunk_tx, mut chunk_rx) = mpsc::channel::<Vec<String>>(ID_CHUNK_BUFFER);

        let lister = self.spawn_lister(chunk_tx, cancel.clone());

        let worker = async {
            let mut executions_fetched = 0_usize;
            'chunks: while let Some(ids) = chunk_rx.recv().await {
                if ids.is_empty() {
                    // No more candidates.
                    cancel.cancel();
                    break;
                }

                let batch = self.engine.batch_get_executions(&ids).await?;
                if !batch.unprocessed.is_empty() {
                    // Likely a permissions issue, so log and bail.
                    tracing::warn!(
                        first = %batch.unprocessed[0],
                        "batch execution fetch left ids unprocessed"
                    );
                    return Err(SpanlakeError::Engine(
                        "batch execution fetch left ids unprocessed".to_owned(),
                    ));
                }

                executions_fetched += batch.executions.len();
                for execution in batch.executions {
                    if matches!(
                        execution.state,
                        ExecutionState::Failed | ExecutionState::Cancelled
                    ) {
                        continue;
                    }

                    if let Some(submitted) = execution.submitted_at {
                        if submitted < expiry {
                            // Everything after this is older still.
                            cancel.cancel();
                            break 'chunks;
                        }
                    }

                    if execution.query.contains(key) {
                        tracing::debug!(
                            execution = %execution.id,
                            executions_fetched,
                            "query cache hit"
                        );
                        cancel.cancel();
                        return Ok(Some(execution));
                    }
                }
            }

            tracing::debug!(executions_fetched, "query cache lookup found no match");
            Ok(None)
        };

        let found = worker.await;
        cancel.cancel();
        let listed = lister.await;

        let found = found?;
        match listed {
            Ok(result) => result?,
            Err(e) => {
                return Err(SpanlakeError::Engine(format!(
                    "execution listing task failed: {e}"
                )))
            }
        }
        Ok(found)
    }

    fn spawn_lister(
        &self,
        chunk_tx: mpsc::Sender<Vec<String>>,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<(), SpanlakeError>> {
        let engine = self.engine.clone();
        let work_group = self.work_group.clone();

        tokio::spawn(async move {
            let mut page_token: Option<String> = None;
            let mut pages = 0_usize;
            let mut early_exit = false;

            loop {
                let page = tokio::select! {
                    _ = cancel.cancelled() => {
                        early_exit = true;
                        break;
                    }
                    page = engine.list_recent_executions(
                        &work_group,
                        LIST_PAGE_SIZE,
                        page_token.as_deref(),
                    ) => page?,
                };
                pages += 1;

                let next_token = page.next_token;
                tokio::select! {
                    _ = cancel.cancelled() => {
                        early_exit = true;
                        break;
                    }
                    sent = chunk_tx.send(page.ids) => {
                        if sent.is_err() {
                            early_exit = true;
                            break;
                        }
                    }
                }

                match next_token {
                    Some(token) => page_token = Some(token),
                    None => break,
                }
            }

            tracing::debug!(pages, early_exit, "execution listing finished");
            Ok(())
        })
    }
}
