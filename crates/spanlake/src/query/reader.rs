//! Query runner: translates trace queries into partition-pruned SQL and
//! drives executions on the external engine.
//!
//! Every query carries a `datehour BETWEEN` predicate computed from the
//! caller's time window or the configured max span age; the engine can only
//! prune partitions on that projected column. User-supplied strings travel
//! as execution parameters; partition and timestamp predicates are formatted
//! inline because they derive from clock and configuration only.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};

use super::cache::QueryCache;
use super::engine::{ExecutionState, QueryEngine, ResultRow, StartQueryRequest};
use crate::config::{
    parse_duration_with_default, parse_required_duration, AthenaConfig,
    DEFAULT_DEPENDENCIES_QUERY_TTL, DEFAULT_MAX_TRACE_DURATION, DEFAULT_SERVICES_QUERY_TTL,
};
use crate::model::{DependencyLink, Operation, OperationQuery, Trace, TraceId, TraceQuery};
use crate::record::decode_span_payload;
use crate::schema::partition_key;
use crate::SpanlakeError;

/// Completion poll interval for in-flight executions.
const POLL_INTERVAL: StdDuration = StdDuration::from_millis(100);

/// Timestamp literal format understood by the engine.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Cache key of the dependency-graph query shape.
const DEPENDENCIES_CACHE_KEY: &str = "WITH spans_with_reference";

/// The read half of the span store.
pub struct Reader {
    engine: Arc<dyn QueryEngine>,
    cache: QueryCache,
    database: String,
    spans_table: String,
    operations_table: String,
    output_location: String,
    work_group: String,
    max_span_age: Duration,
    max_trace_duration: Duration,
    services_query_ttl: Duration,
    dependencies_query_ttl: Duration,
}

struct ServiceOperation {
    service_name: String,
    operation_name: String,
    span_kind: String,
}

impl Reader {
    pub fn new(engine: Arc<dyn QueryEngine>, config: &AthenaConfig) -> Result<Self, SpanlakeError> {
        let max_span_age = to_chrono(
            "athena.maxSpanAge",
            parse_required_duration("athena.maxSpanAge", &config.max_span_age)?,
        )?;
        let max_trace_duration = to_chrono(
            "athena.maxTraceDuration",
            parse_duration_with_default(&config.max_trace_duration, DEFAULT_MAX_TRACE_DURATION)?,
        )?;
        let services_query_ttl = to_chrono(
            "athena.servicesQueryTtl",
            parse_duration_with_default(&config.services_query_ttl, DEFAULT_SERVICES_QUERY_TTL)?,
        )?;
        let dependencies_query_ttl = to_chrono(
            "athena.dependenciesQueryTtl",
            parse_duration_with_default(
                &config.dependencies_query_ttl,
                DEFAULT_DEPENDENCIES_QUERY_TTL,
            )?,
        )?;

        Ok(Self {
            cache: QueryCache::new(engine.clone(), config.work_group.clone()),
            engine,
            database: config.database_name.clone(),
            spans_table: config.spans_table_name.clone(),
            operations_table: config.operations_table_name.clone(),
            output_location: config.output_location.clone(),
            work_group: config.work_group.clone(),
            max_span_age,
            max_trace_duration,
            services_query_ttl,
            dependencies_query_ttl,
        })
    }

    /// Fetch all spans of one trace.
    pub async fn get_trace(&self, trace_id: TraceId) -> Result<Trace, SpanlakeError> {
        tracing::debug!(trace_id = %trace_id, "get trace");
        let (start, end) = self.default_window();
        let sql = format!(
            r#"SELECT DISTINCT span_payload FROM "{}" WHERE datehour BETWEEN '{}' AND '{}' AND trace_id = ?"#,
            self.spans_table,
            partition_key(start),
            partition_key(end),
        );

        let rows = self
            .run_query(sql, vec![quoted(&trace_id.to_string())])
            .await?;
        if rows.is_empty() {
            return Err(SpanlakeError::TraceNotFound);
        }

        let spans = rows
            .iter()
            .map(|row| decode_span_payload(row.column(0)?))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Trace { spans })
    }

    /// Distinct service names seen within the max span age.
    pub async fn get_services(&self) -> Result<Vec<String>, SpanlakeError> {
        tracing::debug!("get services");
        let mut services: Vec<String> = self
            .service_operations()
            .await?
            .into_iter()
            .map(|row| row.service_name)
            .collect();
        // Rows are grouped and ordered, so duplicates are adjacent.
        services.dedup();
        Ok(services)
    }

    /// Operations of one service, optionally narrowed to a span kind.
    pub async fn get_operations(
        &self,
        query: &OperationQuery,
    ) -> Result<Vec<Operation>, SpanlakeError> {
        tracing::debug!(service = %query.service_name, "get operations");
        Ok(self
            .service_operations()
            .await?
            .into_iter()
            .filter(|row| row.service_name == query.service_name)
            .filter(|row| {
                query
                    .span_kind
                    .as_deref()
                    .map_or(true, |kind| kind.is_empty() || row.span_kind == kind)
            })
            .map(|row| Operation {
                name: row.operation_name,
                span_kind: row.span_kind,
            })
            .collect())
    }

    /// Trace search: find matching trace ids, then fetch their spans.
    pub async fn find_traces(&self, query: &TraceQuery) -> Result<Vec<Trace>, SpanlakeError> {
        let trace_ids = self.find_trace_ids(query).await?;
        if trace_ids.is_empty() {
            return Ok(Vec::new());
        }

        // Expand the partition window on both sides so spans of a
        // long-running trace that crossed partition boundaries are included.
        let (start, end) = self.search_window(query);
        let lower = start - self.max_trace_duration;
        let upper = end + self.max_trace_duration;
        let id_list = trace_ids
            .iter()
            .map(|id| format!("'{id}'"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            r#"SELECT DISTINCT trace_id, span_payload FROM "{}" WHERE datehour BETWEEN '{}' AND '{}' AND trace_id IN ({})"#,
            self.spans_table,
            partition_key(lower),
            partition_key(upper),
            id_list,
        );

        let rows = self.run_query(sql, Vec::new()).await?;
        let mut grouped: BTreeMap<String, Vec<_>> = BTreeMap::new();
        for row in &rows {
            grouped
                .entry(row.column(0)?.to_owned())
                .or_default()
                .push(decode_span_payload(row.column(1)?)?);
        }
        Ok(grouped
            .into_values()
            .map(|spans| Trace { spans })
            .collect())
    }

    /// Trace search phase one only: the matching trace ids.
    pub async fn find_trace_ids(&self, query: &TraceQuery) -> Result<Vec<TraceId>, SpanlakeError> {
        tracing::debug!(service = %query.service_name, "find trace ids");
        let (start, end) = self.search_window(query);

        let mut conditions = vec!["service_name = ?".to_owned()];
        let mut parameters = vec![quoted(&query.service_name)];

        if let Some(operation) = query.operation_name.as_deref().filter(|op| !op.is_empty()) {
            conditions.push("operation_name = ?".to_owned());
            parameters.push(quoted(operation));
        }
        for (key, value) in &query.tags {
            conditions.push("tags[?] = ?".to_owned());
            parameters.push(quoted(key));
            parameters.push(quoted(value));
        }
        conditions.push(format!(
            "datehour BETWEEN '{}' AND '{}'",
            partition_key(start),
            partition_key(end),
        ));
        conditions.push(format!(
            "start_time BETWEEN timestamp '{}' AND timestamp '{}'",
            start.format(TIMESTAMP_FORMAT),
            end.format(TIMESTAMP_FORMAT),
        ));
        if let Some(min) = query.duration_min.filter(|d| !d.is_zero()) {
            conditions.push("duration >= ?".to_owned());
            parameters.push(min.as_nanos().to_string());
        }
        if let Some(max) = query.duration_max.filter(|d| !d.is_zero()) {
            conditions.push("duration <= ?".to_owned());
            parameters.push(max.as_nanos().to_string());
        }

        let sql = format!(
            r#"SELECT trace_id FROM "{}" WHERE {} GROUP BY 1 LIMIT {}"#,
            self.spans_table,
            conditions.join(" AND "),
            query.num_traces,
        );

        let rows = self.run_query(sql, parameters).await?;
        rows.iter().map(|row| row.column(0)?.parse()).collect()
    }

    /// The inter-service dependency graph over `[end_ts - lookback, end_ts]`.
    ///
    /// The execution is reused for the dependencies query TTL; the prefetcher
    /// exists to keep it warm.
    pub async fn get_dependencies(
        &self,
        end_ts: DateTime<Utc>,
        lookback: StdDuration,
    ) -> Result<Vec<DependencyLink>, SpanlakeError> {
        tracing::debug!("get dependencies");
        let lookback = to_chrono("lookback", lookback)?;
        let start_ts = end_ts - lookback;

        let sql = format!(
            r#"WITH spans_with_reference AS (
    SELECT base.service_name, base.trace_id, base.span_id,
           r.reference.trace_id AS ref_trace_id,
           r.reference.span_id AS ref_span_id
    FROM "{spans}" AS base
    CROSS JOIN UNNEST(base.references) AS r (reference)
)
SELECT joined.service_name AS parent, spans_with_reference.service_name AS child, COUNT(*) AS callcount
FROM spans_with_reference
JOIN "{spans}" AS joined
  ON spans_with_reference.ref_trace_id = joined.trace_id AND spans_with_reference.ref_span_id = joined.span_id
WHERE datehour BETWEEN '{start}' AND '{end}'
GROUP BY 1, 2"#,
            spans = self.spans_table,
            start = partition_key(start_ts),
            end = partition_key(end_ts),
        );

        let rows = self
            .run_cached_query(DEPENDENCIES_CACHE_KEY, self.dependencies_query_ttl, sql)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(DependencyLink {
                    parent: row.column(0)?.to_owned(),
                    child: row.column(1)?.to_owned(),
                    call_count: row
                        .column(2)?
                        .parse()
                        .map_err(|e| SpanlakeError::Decode(format!("call count: {e}")))?,
                })
            })
            .collect()
    }

    /// Shared inner query behind `get_services` and `get_operations`,
    /// reused through the execution cache for the services query TTL.
    async fn service_operations(&self) -> Result<Vec<ServiceOperation>, SpanlakeError> {
        let (start, end) = self.default_window();
        let cache_key = format!(
            r#"SELECT service_name, operation_name, span_kind FROM "{}" WHERE"#,
            self.operations_table,
        );
        let sql = format!(
            "{cache_key} datehour BETWEEN '{}' AND '{}' GROUP BY 1, 2, 3 ORDER BY 1, 2, 3",
            partition_key(start),
            partition_key(end),
        );

        let rows = self
            .run_cached_query(&cache_key, self.services_query_ttl, sql)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(ServiceOperation {
                    service_name: row.column(0)?.to_owned(),
                    operation_name: row.column(1)?.to_owned(),
                    span_kind: row.column(2)?.to_owned(),
                })
            })
            .collect()
    }

    fn default_window(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let now = Utc::now();
        (now - self.max_span_age, now)
    }

    fn search_window(&self, query: &TraceQuery) -> (DateTime<Utc>, DateTime<Utc>) {
        let now = Utc::now();
        (
            query.start_time_min.unwrap_or(now - self.max_span_age),
            query.start_time_max.unwrap_or(now),
        )
    }

    async fn run_cached_query(
        &self,
        cache_key: &str,
        ttl: Duration,
        sql: String,
    ) -> Result<Vec<ResultRow>, SpanlakeError> {
        if let Some(execution) = self.cache.lookup(cache_key, ttl).await? {
            tracing::debug!(execution = %execution.id, "reusing recent query execution");
            return self.collect_results(&execution.id).await;
        }
        self.run_query(sql, Vec::new()).await
    }

    async fn run_query(
        &self,
        sql: String,
        parameters: Vec<String>,
    ) -> Result<Vec<ResultRow>, SpanlakeError> {
        tracing::debug!(sql = %sql, "starting query execution");
        let execution_id = self
            .engine
            .start_query(StartQueryRequest {
                sql,
                database: self.database.clone(),
                output_location: self.output_location.clone(),
                work_group: self.work_group.clone(),
                parameters,
            })
            .await?;
        self.collect_results(&execution_id).await
    }

    /// Poll the execution to completion, then paginate its result set,
    /// dropping the header row.
    async fn collect_results(&self, execution_id: &str) -> Result<Vec<ResultRow>, SpanlakeError> {
        loop {
            let execution = self.engine.get_execution(execution_id).await?;
            if matches!(
                execution.state,
                ExecutionState::Failed | ExecutionState::Cancelled
            ) {
                return Err(SpanlakeError::Engine(format!(
                    "query execution {execution_id} {:?}: {}",
                    execution.state,
                    execution.state_reason.unwrap_or_default(),
                )));
            }
            if execution.completed_at.is_some() {
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        let mut rows = Vec::new();
        let mut page_token: Option<String> = None;
        let mut first_page = true;
        loop {
            let page = self
                .engine
                .get_results(execution_id, page_token.as_deref())
                .await?;
            let mut page_rows = page.rows;
            if first_page {
                if !page_rows.is_empty() {
                    page_rows.remove(0);
                }
                first_page = false;
            }
            rows.extend(page_rows);
            match page.next_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(rows)
    }
}

#[async_trait::async_trait]
impl super::prefetch::DependenciesSource for Reader {
    async fn get_dependencies(
        &self,
        end_ts: DateTime<Utc>,
        lookback: StdDuration,
    ) -> Result<Vec<DependencyLink>, SpanlakeError> {
        Reader::get_dependencies(self, end_ts, lookback).await
    }
}

/// Render a string execution parameter: single-quoted, internal quotes
/// doubled. The engine substitutes parameters textually.
fn quoted(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn to_chrono(name: &str, duration: StdDuration) -> Result<Duration, SpanlakeError> {
    Duration::from_std(duration)
        .map_err(|e| SpanlakeError::Config(format!("{name} out of range: {e}")))
}
