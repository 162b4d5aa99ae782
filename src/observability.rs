// Observability - structured logging, trace contexts and engine counters
// Counters are process-wide and exposed as JSON through `get_metrics`.

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);
static ERROR_COUNTER: AtomicU64 = AtomicU64::new(0);
static CACHE_HIT_COUNTER: AtomicU64 = AtomicU64::new(0);
static CACHE_MISS_COUNTER: AtomicU64 = AtomicU64::new(0);
static REJECTION_COUNTER: AtomicU64 = AtomicU64::new(0);
static TIMEOUT_COUNTER: AtomicU64 = AtomicU64::new(0);
static STORE_ERROR_COUNTER: AtomicU64 = AtomicU64::new(0);
static UNRESOLVED_COUNTER: AtomicU64 = AtomicU64::new(0);
static CACHE_ENTRIES_GAUGE: AtomicU64 = AtomicU64::new(0);

pub const DEFAULT_FILTER: &str = "coderag=warn,error";
pub const VERBOSE_FILTER: &str = "coderag=debug,info";
pub const QUIET_FILTER: &str = "error";

/// Initialize logging with the default filter
pub fn init_logging() -> Result<()> {
    init_logging_with_level(false, false)
}

/// Initialize logging with configurable verbosity
///
/// `RUST_LOG` overrides the flag-derived filter unless `quiet` is set.
/// Calling this more than once is a no-op.
pub fn init_logging_with_level(verbose: bool, quiet: bool) -> Result<()> {
    let filter_level = if quiet {
        EnvFilter::new(QUIET_FILTER)
    } else if verbose {
        EnvFilter::new(VERBOSE_FILTER)
    } else {
        EnvFilter::new(DEFAULT_FILTER)
    };

    let env_filter = if quiet {
        EnvFilter::new(QUIET_FILTER)
    } else if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::try_from_default_env().unwrap_or(filter_level)
    } else {
        filter_level
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(!quiet)
        .with_thread_ids(!quiet)
        .with_line_number(!quiet)
        .with_file(!quiet)
        .with_writer(std::io::stderr)
        .with_ansi(true);

    if tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .is_ok()
        && !quiet
    {
        info!("coderag observability initialized");
    }
    Ok(())
}

/// Pipeline stages recorded through [`log_operation`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Operation {
    StatementValidate {
        allowed: bool,
        complexity: u32,
    },
    CacheLookup {
        hit: bool,
    },
    StatementExecute {
        query_id: String,
        rows: usize,
        truncated: bool,
    },
    PromptTranslate {
        candidates: usize,
    },
    ContextAssemble {
        items: usize,
        unresolved: usize,
        truncated: bool,
    },
    CacheInvalidate {
        entries: usize,
    },
    Startup {
        version: String,
    },
}

/// Metric types for performance monitoring
#[derive(Debug, Clone)]
pub enum MetricType {
    Counter { name: &'static str, value: u64 },
    Gauge { name: &'static str, value: f64 },
    Histogram { name: &'static str, value: f64, unit: &'static str },
    Timer { name: &'static str, duration: Duration },
}

/// Operation context for tracing one request through the pipeline
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub trace_id: Uuid,
    pub span_id: Uuid,
    pub parent_span_id: Option<Uuid>,
    pub operation: String,
    pub start_time: Instant,
    pub attributes: Vec<(String, String)>,
}

impl OperationContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            span_id: Uuid::new_v4(),
            parent_span_id: None,
            operation: operation.into(),
            start_time: Instant::now(),
            attributes: Vec::new(),
        }
    }

    pub fn child(&self, operation: impl Into<String>) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: Uuid::new_v4(),
            parent_span_id: Some(self.span_id),
            operation: operation.into(),
            start_time: Instant::now(),
            attributes: Vec::new(),
        }
    }

    pub fn add_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.push((key.into(), value.into()));
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// Log a pipeline stage with its context and bump the matching counters
#[instrument(skip(ctx, op, outcome))]
pub fn log_operation<E: std::fmt::Display>(
    ctx: &OperationContext,
    op: &Operation,
    outcome: Result<(), &E>,
) {
    let elapsed = ctx.elapsed();
    let attrs = ctx
        .attributes
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(", ");

    match outcome {
        Ok(()) => {
            debug!(
                trace_id = %ctx.trace_id,
                span_id = %ctx.span_id,
                parent_span_id = ?ctx.parent_span_id,
                operation = %ctx.operation,
                elapsed_ms = elapsed.as_millis(),
                attributes = %attrs,
                "Operation completed: {:?}", op
            );
        }
        Err(e) => {
            error!(
                trace_id = %ctx.trace_id,
                span_id = %ctx.span_id,
                parent_span_id = ?ctx.parent_span_id,
                operation = %ctx.operation,
                elapsed_ms = elapsed.as_millis(),
                attributes = %attrs,
                error = %e,
                "Operation failed: {:?}", op
            );
            ERROR_COUNTER.fetch_add(1, Ordering::Relaxed);
        }
    }

    match op {
        Operation::StatementValidate { allowed: false, .. } => {
            REJECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        }
        Operation::CacheLookup { hit: true } => {
            CACHE_HIT_COUNTER.fetch_add(1, Ordering::Relaxed);
        }
        Operation::CacheLookup { hit: false } => {
            CACHE_MISS_COUNTER.fetch_add(1, Ordering::Relaxed);
        }
        Operation::ContextAssemble { unresolved, .. } => {
            UNRESOLVED_COUNTER.fetch_add(*unresolved as u64, Ordering::Relaxed);
        }
        _ => {}
    }
}

/// Record a metric
pub fn record_metric(metric: MetricType) {
    match metric {
        MetricType::Counter { name, value } => {
            debug!("metric.counter {} = {}", name, value);
        }
        MetricType::Gauge { name, value } => {
            debug!("metric.gauge {} = {}", name, value);
        }
        MetricType::Histogram { name, value, unit } => {
            debug!("metric.histogram {} = {} {}", name, value, unit);
        }
        MetricType::Timer { name, duration } => {
            debug!("metric.timer {} = {:?}", name, duration);
        }
    }
}

pub fn record_request() {
    REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
}

pub fn record_timeout() {
    TIMEOUT_COUNTER.fetch_add(1, Ordering::Relaxed);
    record_metric(MetricType::Counter {
        name: "executor.timeouts",
        value: 1,
    });
}

/// Last reported number of live cache entries
pub fn record_cache_entries(entries: usize) {
    CACHE_ENTRIES_GAUGE.store(entries as u64, Ordering::Relaxed);
    record_metric(MetricType::Gauge {
        name: "cache.entries",
        value: entries as f64,
    });
}

pub fn record_store_error() {
    STORE_ERROR_COUNTER.fetch_add(1, Ordering::Relaxed);
    record_metric(MetricType::Counter {
        name: "executor.store_errors",
        value: 1,
    });
}

/// Run a future inside a fresh trace context, logging its outcome
pub async fn with_trace_id<F, T, E>(operation: &str, f: F) -> std::result::Result<T, E>
where
    F: std::future::Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    let ctx = OperationContext::new(operation);
    let trace_id = ctx.trace_id;
    let span_id = ctx.span_id;

    debug!(
        trace_id = %trace_id,
        span_id = %span_id,
        "Starting operation: {}", operation
    );

    let start = Instant::now();
    let result = f.await;
    let elapsed = start.elapsed();

    match &result {
        Ok(_) => {
            info!(
                trace_id = %trace_id,
                span_id = %span_id,
                elapsed_ms = elapsed.as_millis(),
                "Operation completed successfully: {}", operation
            );
            record_metric(MetricType::Timer {
                name: "operation.duration",
                duration: elapsed,
            });
        }
        Err(e) => {
            error!(
                trace_id = %trace_id,
                span_id = %span_id,
                elapsed_ms = elapsed.as_millis(),
                error = %e,
                "Operation failed: {}", operation
            );
            ERROR_COUNTER.fetch_add(1, Ordering::Relaxed);
            record_metric(MetricType::Counter {
                name: "operation.errors",
                value: 1,
            });
        }
    }

    result
}

/// Current counter snapshot
pub fn get_metrics() -> serde_json::Value {
    serde_json::json!({
        "requests": {
            "total": REQUEST_COUNTER.load(Ordering::Relaxed),
            "errors": ERROR_COUNTER.load(Ordering::Relaxed),
            "validation_rejections": REJECTION_COUNTER.load(Ordering::Relaxed),
        },
        "cache": {
            "hits": CACHE_HIT_COUNTER.load(Ordering::Relaxed),
            "misses": CACHE_MISS_COUNTER.load(Ordering::Relaxed),
            "entries": CACHE_ENTRIES_GAUGE.load(Ordering::Relaxed),
        },
        "executor": {
            "timeouts": TIMEOUT_COUNTER.load(Ordering::Relaxed),
            "store_errors": STORE_ERROR_COUNTER.load(Ordering::Relaxed),
        },
        "assembler": {
            "unresolved_locations": UNRESOLVED_COUNTER.load(Ordering::Relaxed),
        },
        "timestamp": Utc::now().to_rfc3339(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_context_creation() {
        let ctx = OperationContext::new("answer_prompt");
        assert_eq!(ctx.operation, "answer_prompt");
        assert!(ctx.parent_span_id.is_none());

        let child = ctx.child("translate");
        assert_eq!(child.trace_id, ctx.trace_id);
        assert_eq!(child.parent_span_id, Some(ctx.span_id));
    }

    #[test]
    fn test_counters_follow_operations() {
        let before = get_metrics()["cache"]["hits"].as_u64().unwrap();
        let ctx = OperationContext::new("lookup");
        log_operation::<String>(&ctx, &Operation::CacheLookup { hit: true }, Ok(()));
        let after = get_metrics()["cache"]["hits"].as_u64().unwrap();
        assert!(after > before);
        assert!(get_metrics()["timestamp"].is_string());
    }

    #[test]
    fn test_cache_entries_gauge_is_exported() {
        // Caches in concurrently running tests overwrite the same gauge
        record_cache_entries(7);
        assert!(get_metrics()["cache"]["entries"].is_u64());
    }

    #[tokio::test]
    async fn test_with_trace_id() {
        let result = with_trace_id("test_async_op", async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok::<_, anyhow::Error>(42)
        })
        .await;

        assert_eq!(result.expect("Test operation should succeed"), 42);
    }

    #[test]
    fn test_logging_level_configurations() {
        for (mode, filter_str) in [
            ("quiet", QUIET_FILTER),
            ("verbose", VERBOSE_FILTER),
            ("default", DEFAULT_FILTER),
        ] {
            assert!(
                EnvFilter::try_new(filter_str).is_ok(),
                "Failed to create filter for {} mode with filter: {}",
                mode,
                filter_str
            );
        }
    }
}
