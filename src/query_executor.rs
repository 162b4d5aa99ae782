// Query Executor - runs validated statements against the graph store
//
// The executor re-validates every statement it is handed and refuses anything
// not read-only. The per-statement timeout is enforced by dropping the store
// future and asking the store to cancel the query id.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::contracts::{GraphStore, StoreError, StoreRequest, StoreResponse};
use crate::errors::QueryError;
use crate::observability::{
    log_operation, record_metric, record_store_error, record_timeout, MetricType, Operation,
    OperationContext,
};
use crate::query_validation::{referenced_parameters, QueryValidator, ViolationReason};
use crate::types::{
    ExecutionStats, GraphQueryStatement, QueryResult, RequestDeadline, TruncationReason,
    DEFAULT_QUERY_TIMEOUT, DEFAULT_RESULT_LIMIT,
};

static URL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[A-Za-z][A-Za-z0-9+.\-]*://\S+").expect("Invalid URL pattern")
});

static PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:[A-Za-z]:\\|/)[\w.\-]+(?:[/\\][\w.\-]+)+").expect("Invalid path pattern")
});

static ADDRESS_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b\d{1,3}(?:\.\d{1,3}){3}(?::\d+)?\b").expect("Invalid address pattern")
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Timeout applied to statements built by the engine
    #[serde(with = "crate::config::duration_string")]
    pub default_timeout: Duration,
    /// Result limit applied to statements built by the engine
    pub default_result_limit: usize,
    /// Attempts per statement, counting the first, for transient store errors
    pub max_attempts: u32,
    #[serde(with = "crate::config::duration_string")]
    pub initial_backoff: Duration,
    #[serde(with = "crate::config::duration_string")]
    pub max_backoff: Duration,
    /// How long to wait for the store to acknowledge a cancel
    #[serde(with = "crate::config::duration_string")]
    pub cancel_grace: Duration,
    pub max_error_message_len: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_QUERY_TIMEOUT,
            default_result_limit: DEFAULT_RESULT_LIMIT,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
            cancel_grace: Duration::from_millis(250),
            max_error_message_len: 240,
        }
    }
}

enum Interrupt {
    Done(Result<StoreResponse, StoreError>),
    TimedOut,
    Cancelled,
}

pub struct QueryExecutor {
    store: Arc<dyn GraphStore>,
    validator: QueryValidator,
    config: ExecutorConfig,
}

impl QueryExecutor {
    pub fn new(store: Arc<dyn GraphStore>, validator: QueryValidator, config: ExecutorConfig) -> Self {
        Self {
            store,
            validator,
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn validator(&self) -> &QueryValidator {
        &self.validator
    }

    /// Execute with no request-level deadline
    pub async fn execute(&self, statement: &GraphQueryStatement) -> Result<QueryResult, QueryError> {
        self.execute_until(statement, &RequestDeadline::unbounded()).await
    }

    /// Execute a statement within its own timeout and the request deadline
    ///
    /// # Errors
    /// - `ValidationRejected` if the statement is not read-only or fails validation
    /// - `UnboundParameter` if a referenced `$name` has no value
    /// - `ExecutionTimeout` once the effective timeout elapses
    /// - `ExecutionError` for store faults, after retries for transient ones
    /// - `Cancelled` if the request is cancelled before or during the call
    ///
    /// Rows beyond `result_limit` are not an error: the result is cut to the
    /// limit and marked truncated.
    pub async fn execute_until(
        &self,
        statement: &GraphQueryStatement,
        deadline: &RequestDeadline,
    ) -> Result<QueryResult, QueryError> {
        self.execute_after_wait(statement, deadline, Duration::ZERO)
            .await
    }

    /// [`execute_until`](Self::execute_until) for a caller that already spent
    /// `waited` of the statement timeout queued behind another load
    #[instrument(skip(self, statement, deadline), fields(query_id))]
    pub async fn execute_after_wait(
        &self,
        statement: &GraphQueryStatement,
        deadline: &RequestDeadline,
        waited: Duration,
    ) -> Result<QueryResult, QueryError> {
        let options = statement.options();
        if options.allow_writes {
            return Err(QueryError::ValidationRejected {
                violations: vec![ViolationReason::WritesNotPermitted],
            });
        }
        let verdict = self.validator.validate(statement);
        if !verdict.allowed {
            return Err(QueryError::ValidationRejected {
                violations: verdict.violations,
            });
        }
        if let Some(name) = referenced_parameters(statement.text())
            .into_iter()
            .find(|name| !statement.parameters().contains_key(name))
        {
            return Err(QueryError::UnboundParameter { name });
        }
        deadline.check("execution")?;

        let query_id = Uuid::new_v4().to_string();
        tracing::Span::current().record("query_id", query_id.as_str());
        let mut ctx = OperationContext::new("statement.execute");
        ctx.add_attribute("query_id", query_id.clone());

        let timeout = match deadline.remaining() {
            Some(remaining) => options.timeout.min(remaining.saturating_add(waited)),
            None => options.timeout,
        };
        let row_limit = self
            .store
            .supports_limit_pushdown()
            .then(|| options.result_limit.saturating_add(1));

        let started = Instant::now();
        // The timeout window opened when the wait began
        let window_opened = started.checked_sub(waited).unwrap_or(started);
        let (response, attempts) = match self
            .call_store(statement, &query_id, timeout, row_limit, window_opened, deadline)
            .await
        {
            Ok(done) => done,
            Err(err) => {
                log_operation(
                    &ctx,
                    &Operation::StatementExecute {
                        query_id: query_id.clone(),
                        rows: 0,
                        truncated: false,
                    },
                    Err(&err),
                );
                return Err(err);
            }
        };

        let mut rows = response.rows;
        let mut truncation = response.timed_out.then_some(TruncationReason::Timeout);
        if rows.len() > options.result_limit {
            warn!(
                query_id = %query_id,
                limit = options.result_limit,
                "ResultTooLarge: returning the first {} rows", options.result_limit
            );
            rows.truncate(options.result_limit);
            truncation.get_or_insert(TruncationReason::ResultLimit);
        }

        let elapsed = started.elapsed();
        record_metric(MetricType::Histogram {
            name: "executor.duration",
            value: elapsed.as_millis() as f64,
            unit: "ms",
        });

        let statistics = ExecutionStats {
            query_id: query_id.clone(),
            attempts,
            rows_returned: rows.len(),
            nodes_touched: response.nodes_touched,
            relationships_touched: response.relationships_touched,
        };
        let result = QueryResult::new(rows, elapsed.as_millis() as u64, truncation, statistics);

        log_operation::<QueryError>(
            &ctx,
            &Operation::StatementExecute {
                query_id,
                rows: result.len(),
                truncated: result.truncated,
            },
            Ok(()),
        );
        Ok(result)
    }

    async fn call_store(
        &self,
        statement: &GraphQueryStatement,
        query_id: &str,
        timeout: Duration,
        row_limit: Option<usize>,
        started: Instant,
        deadline: &RequestDeadline,
    ) -> Result<(StoreResponse, u32), QueryError> {
        let timeout_error = || QueryError::ExecutionTimeout {
            timeout_ms: timeout.as_millis() as u64,
            query_id: query_id.to_string(),
        };

        let mut attempt = 0;
        let mut delay = self.config.initial_backoff;

        loop {
            attempt += 1;
            let remaining = timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                record_timeout();
                return Err(timeout_error());
            }

            let request = StoreRequest {
                query_id: query_id.to_string(),
                text: statement.text().to_string(),
                parameters: statement.parameters().clone(),
                timeout: remaining,
                row_limit,
                read_only: true,
            };

            let interrupt = tokio::select! {
                biased;
                _ = deadline.cancellation().cancelled() => Interrupt::Cancelled,
                outcome = tokio::time::timeout(remaining, self.store.execute(request)) => match outcome {
                    Ok(done) => Interrupt::Done(done),
                    Err(_) => Interrupt::TimedOut,
                },
            };

            match interrupt {
                Interrupt::Done(Ok(response)) => {
                    if attempt > 1 {
                        info!("Statement {} succeeded after {} attempts", query_id, attempt);
                    }
                    return Ok((response, attempt));
                }
                Interrupt::Cancelled => {
                    self.cancel_in_store(query_id).await;
                    return Err(QueryError::cancelled("execution"));
                }
                Interrupt::TimedOut => {
                    warn!(query_id = %query_id, "Statement exceeded {:?}", timeout);
                    self.cancel_in_store(query_id).await;
                    record_timeout();
                    return Err(timeout_error());
                }
                Interrupt::Done(Err(err)) if err.is_transient() && attempt < self.config.max_attempts => {
                    warn!(
                        "Statement {} failed (attempt {}/{}): {}",
                        query_id, attempt, self.config.max_attempts, err
                    );
                    let pause = delay.min(timeout.saturating_sub(started.elapsed()));
                    tokio::select! {
                        biased;
                        _ = deadline.cancellation().cancelled() => {
                            return Err(QueryError::cancelled("execution"));
                        }
                        _ = tokio::time::sleep(pause) => {}
                    }

                    // Exponential backoff with jitter
                    delay = std::cmp::min(delay * 2, self.config.max_backoff);
                    let jitter = Duration::from_millis(rand::random::<u64>() % 100);
                    delay += jitter;
                }
                Interrupt::Done(Err(err)) => {
                    error!(
                        "Statement {} failed after {} attempts: {}",
                        query_id, attempt, err
                    );
                    record_store_error();
                    return Err(QueryError::ExecutionError {
                        message: sanitize_store_message(&err.message, self.config.max_error_message_len),
                    });
                }
            }
        }
    }

    async fn cancel_in_store(&self, query_id: &str) {
        match tokio::time::timeout(self.config.cancel_grace, self.store.cancel(query_id)).await {
            Ok(true) => debug!(query_id = %query_id, "Store acknowledged cancellation"),
            Ok(false) => debug!(query_id = %query_id, "Store does not support cancellation"),
            Err(_) => warn!(query_id = %query_id, "Store cancel did not return within grace period"),
        }
    }
}

/// Strip internal details from a store message: paths, URLs, addresses and
/// anything after the first line. Caps the length at `max_len` characters.
pub fn sanitize_store_message(message: &str, max_len: usize) -> String {
    let first_line = message
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("");

    let cleaned = URL_PATTERN.replace_all(first_line, "<url>");
    let cleaned = PATH_PATTERN.replace_all(&cleaned, "<path>");
    let cleaned = ADDRESS_PATTERN.replace_all(&cleaned, "<address>");
    let cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");

    if cleaned.is_empty() {
        return "graph store reported an error".to_string();
    }
    if cleaned.chars().count() > max_len {
        let mut truncated: String = cleaned.chars().take(max_len.saturating_sub(3)).collect();
        truncated.push_str("...");
        truncated
    } else {
        cleaned
    }
}
