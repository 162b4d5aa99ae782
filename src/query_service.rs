// Query Service - the engine's two entry points
//
// execute_statement: Validator -> Cache -> (miss) Executor
// answer_prompt:     Translator -> per candidate execute_statement -> Assembler
//
// Every stage checks the request deadline before it starts; a cancelled
// request never populates the cache.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::context_assembler::ContextAssembler;
use crate::contracts::GraphMutationListener;
use crate::errors::QueryError;
use crate::intent_translator::{IntentTemplate, IntentTranslator, SlotSource, TranslatedCandidate, TranslationContext};
use crate::observability::{log_operation, record_request, with_trace_id, Operation, OperationContext};
use crate::query_cache::{CacheStatus, QueryCache};
use crate::query_executor::QueryExecutor;
use crate::query_validation::QueryValidator;
use crate::types::{
    ContextBudget, GraphQueryStatement, GraphValue, QueryResult, RankedContextSet, Record,
    RequestDeadline, StatementOptions,
};

/// What happened to one translated candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CandidateOutcome {
    Accepted { rows: usize, cache: CacheStatus },
    NoRows,
    Rejected { violations: Vec<String> },
    TimedOut { timeout_ms: u64 },
    /// An earlier candidate was accepted
    NotTried,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateReport {
    pub template: IntentTemplate,
    pub statement: String,
    pub confidence: f32,
    pub source: SlotSource,
    #[serde(flatten)]
    pub outcome: CandidateOutcome,
}

impl CandidateReport {
    fn new(candidate: &TranslatedCandidate, outcome: CandidateOutcome) -> Self {
        Self {
            template: candidate.template,
            statement: candidate.statement.to_string(),
            confidence: candidate.confidence,
            source: candidate.source,
            outcome,
        }
    }
}

/// Result of [`QueryService::answer_prompt`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptAnswer {
    pub context: RankedContextSet,
    /// Every candidate in the order tried, with its outcome
    pub candidates: Vec<CandidateReport>,
    /// Set when no candidate produced rows
    pub explanation: Option<String>,
    /// Rows without graph nodes, e.g. counts, which carry no source context
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub summary_rows: Vec<Record>,
}

impl PromptAnswer {
    fn unanswered(budget: ContextBudget, candidates: Vec<CandidateReport>, explanation: String) -> Self {
        Self {
            context: RankedContextSet::empty(budget),
            candidates,
            explanation: Some(explanation),
            summary_rows: Vec::new(),
        }
    }

    pub fn is_answered(&self) -> bool {
        self.explanation.is_none()
    }

    /// Render as markdown for prompt augmentation or terminal output
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        if let Some(explanation) = &self.explanation {
            let _ = writeln!(out, "_{}_\n", explanation);
        }

        for item in &self.context.items {
            let _ = writeln!(
                out,
                "### {}:{}-{} (score {:.2})\n\n```\n{}\n```\n",
                item.file_path, item.line_start, item.line_end, item.relevance_score, item.snippet_text
            );
        }
        if self.context.truncated {
            let _ = writeln!(
                out,
                "_{} more item(s) omitted to fit the {} budget_\n",
                self.context.stats.dropped_by_budget, self.context.budget.limit
            );
        }

        if let Some(first) = self.summary_rows.first() {
            let columns: Vec<&String> = first.keys().collect();
            let _ = writeln!(out, "| {} |", columns.iter().map(|c| c.as_str()).collect::<Vec<_>>().join(" | "));
            let _ = writeln!(out, "|{}", " --- |".repeat(columns.len()));
            for row in &self.summary_rows {
                let cells: Vec<String> = columns
                    .iter()
                    .map(|c| row.get(*c).map(ToString::to_string).unwrap_or_default())
                    .collect();
                let _ = writeln!(out, "| {} |", cells.join(" | "));
            }
            out.push('\n');
        }

        if !self.candidates.is_empty() {
            let _ = writeln!(out, "Candidates:");
            for report in &self.candidates {
                let _ = writeln!(
                    out,
                    "- [{:.2}] {} `{}` -> {:?}",
                    report.confidence,
                    report.template.name(),
                    report.statement,
                    report.outcome
                );
            }
        }
        out
    }
}

pub struct QueryService {
    validator: QueryValidator,
    cache: Arc<QueryCache>,
    executor: QueryExecutor,
    translator: IntentTranslator,
    assembler: ContextAssembler,
}

impl QueryService {
    pub fn new(
        validator: QueryValidator,
        cache: Arc<QueryCache>,
        executor: QueryExecutor,
        translator: IntentTranslator,
        assembler: ContextAssembler,
    ) -> Self {
        Self {
            validator,
            cache,
            executor,
            translator,
            assembler,
        }
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    pub fn translator(&self) -> &IntentTranslator {
        &self.translator
    }

    pub fn assembler(&self) -> &ContextAssembler {
        &self.assembler
    }

    /// Hook for the ingestion side: invalidates the cache on every mutation
    pub fn mutation_listener(&self) -> Arc<dyn GraphMutationListener> {
        self.cache.clone()
    }

    pub fn invalidate_cache(&self) -> usize {
        self.cache.invalidate_all()
    }

    pub fn start_expiration_sweeper(&self) -> JoinHandle<()> {
        self.cache.spawn_expiration_sweeper()
    }

    /// Options given to translated statements
    pub fn default_options(&self) -> StatementOptions {
        let config = self.executor.config();
        StatementOptions {
            timeout: config.default_timeout,
            result_limit: config.default_result_limit,
            allow_writes: false,
        }
    }

    /// Validate, then serve from cache or execute
    ///
    /// # Errors
    /// - `ValidationRejected` when the statement fails validation, even if
    ///   an earlier result for it is still cached
    /// - any executor error on a miss
    #[instrument(skip(self, statement, deadline))]
    pub async fn execute_statement(
        &self,
        statement: &GraphQueryStatement,
        deadline: &RequestDeadline,
    ) -> Result<QueryResult, QueryError> {
        record_request();
        with_trace_id("query_service.execute_statement", async {
            self.run_statement(statement, deadline)
                .await
                .map(|(result, _)| result)
        })
        .await
    }

    async fn run_statement(
        &self,
        statement: &GraphQueryStatement,
        deadline: &RequestDeadline,
    ) -> Result<(QueryResult, CacheStatus), QueryError> {
        deadline.check("validation")?;
        let ctx = OperationContext::new("statement.validate");
        let verdict = self.validator.validate(statement);
        log_operation::<QueryError>(
            &ctx,
            &Operation::StatementValidate {
                allowed: verdict.allowed,
                complexity: verdict.estimated_complexity,
            },
            Ok(()),
        );
        if !verdict.allowed {
            debug!("Rejected statement: {}", statement);
            return Err(QueryError::ValidationRejected {
                violations: verdict.violations,
            });
        }

        let ctx = OperationContext::new("cache.lookup");
        let (result, status) = self
            .cache
            .get_or_load(statement, deadline, |waited| {
                self.executor.execute_after_wait(statement, deadline, waited)
            })
            .await?;
        if status != CacheStatus::Bypassed {
            log_operation::<QueryError>(
                &ctx,
                &Operation::CacheLookup {
                    hit: status == CacheStatus::Hit,
                },
                Ok(()),
            );
        }
        Ok((result, status))
    }

    /// Answer a natural-language prompt with ranked code context
    ///
    /// Candidates are tried best first. The first one that passes validation
    /// and returns rows is assembled. A timeout moves on to the next candidate
    /// once; a second timeout, or one on the last candidate, is surfaced.
    /// A prompt matching no template is not an error: the answer is empty and
    /// carries an explanation.
    #[instrument(skip(self, budget, deadline))]
    pub async fn answer_prompt(
        &self,
        prompt: &str,
        budget: ContextBudget,
        deadline: &RequestDeadline,
    ) -> Result<PromptAnswer, QueryError> {
        record_request();
        with_trace_id("query_service.answer_prompt", async {
            let context = TranslationContext {
                options: self.default_options(),
                deadline: deadline.clone(),
            };
            let candidates = match self.translator.translate(prompt, &context).await {
                Ok(candidates) => candidates,
                Err(QueryError::NoMatchingIntent { reason }) => {
                    info!("No intent matched prompt: {}", reason);
                    return Ok(PromptAnswer::unanswered(budget, Vec::new(), reason));
                }
                Err(err) => return Err(err),
            };
            self.try_candidates(candidates, budget, deadline).await
        })
        .await
    }

    async fn try_candidates(
        &self,
        candidates: Vec<TranslatedCandidate>,
        budget: ContextBudget,
        deadline: &RequestDeadline,
    ) -> Result<PromptAnswer, QueryError> {
        let total = candidates.len();
        let mut reports = Vec::with_capacity(total);
        let mut retried_after_timeout = false;

        for (position, candidate) in candidates.iter().enumerate() {
            let outcome = match self.run_statement(&candidate.statement, deadline).await {
                Ok((result, _)) if result.is_empty() => CandidateOutcome::NoRows,
                Ok((result, cache)) => {
                    let context = self.assembler.assemble(&result, budget, deadline).await?;
                    reports.push(CandidateReport::new(
                        candidate,
                        CandidateOutcome::Accepted {
                            rows: result.len(),
                            cache,
                        },
                    ));
                    reports.extend(
                        candidates[position + 1..]
                            .iter()
                            .map(|rest| CandidateReport::new(rest, CandidateOutcome::NotTried)),
                    );
                    let summary_rows = result
                        .rows
                        .iter()
                        .filter(|row| !row.values().any(|v| matches!(v, GraphValue::Node(_) | GraphValue::List(_))))
                        .cloned()
                        .collect();
                    return Ok(PromptAnswer {
                        context,
                        candidates: reports,
                        explanation: None,
                        summary_rows,
                    });
                }
                Err(QueryError::ValidationRejected { violations }) => {
                    warn!(
                        "Translated statement rejected ({} violations): {}",
                        violations.len(),
                        candidate.statement
                    );
                    CandidateOutcome::Rejected {
                        violations: violations.iter().map(ToString::to_string).collect(),
                    }
                }
                Err(QueryError::ExecutionTimeout { timeout_ms, query_id }) => {
                    if retried_after_timeout || position + 1 == total {
                        return Err(QueryError::ExecutionTimeout { timeout_ms, query_id });
                    }
                    retried_after_timeout = true;
                    warn!(
                        "Statement {} timed out after {}ms, trying the next candidate",
                        query_id, timeout_ms
                    );
                    CandidateOutcome::TimedOut { timeout_ms }
                }
                Err(err) => return Err(err),
            };
            reports.push(CandidateReport::new(candidate, outcome));
        }

        let best = candidates
            .iter()
            .map(|c| c.confidence)
            .fold(0.0_f32, f32::max);
        let explanation = format!(
            "None of {} candidate statement(s) returned rows (best confidence {:.2})",
            total, best
        );
        Ok(PromptAnswer::unanswered(budget, reports, explanation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::QueryServiceBuilder;
    use crate::contracts::SourceLocation;
    use crate::memory_graph::InMemoryGraphStore;
    use crate::source_resolver::StaticSourceResolver;
    use crate::types::{GraphNode, ParamValue};
    use pretty_assertions::assert_eq;

    fn service() -> (QueryService, Arc<InMemoryGraphStore>) {
        let store = Arc::new(InMemoryGraphStore::new());
        store
            .add_node(
                GraphNode::new("m1", "Method")
                    .with_property("name", "persist")
                    .with_property("visibility", "PUBLIC"),
            )
            .unwrap();
        store
            .add_node(
                GraphNode::new("m2", "Method")
                    .with_property("name", "save")
                    .with_property("visibility", "PUBLIC"),
            )
            .unwrap();
        store.add_relationship("m1", "CALLS", "m2").unwrap();

        let resolver = StaticSourceResolver::new()
            .with_file("Repo.java", "class Repo {\n  void persist() { save(); }\n  void save() {}\n}\n")
            .with_location("m1", SourceLocation::new("Repo.java", 2, 2))
            .with_location("m2", SourceLocation::new("Repo.java", 3, 3));
        let service = QueryServiceBuilder::new(store.clone(), Arc::new(resolver))
            .build()
            .unwrap();
        store.subscribe(service.mutation_listener());
        (service, store)
    }

    #[tokio::test]
    async fn test_answer_prompt_scenario() {
        let (service, _) = service();
        let answer = service
            .answer_prompt(
                "find all public methods that call save",
                ContextBudget::characters(1000),
                &RequestDeadline::unbounded(),
            )
            .await
            .unwrap();
        assert!(answer.is_answered());
        assert_eq!(answer.context.len(), 1);
        let item = &answer.context.items[0];
        assert_eq!((item.file_path.as_str(), item.line_start, item.line_end), ("Repo.java", 2, 2));
        assert!(matches!(answer.candidates[0].outcome, CandidateOutcome::Accepted { rows: 1, .. }));
        assert!(answer.to_markdown().contains("Repo.java:2-2"));
    }

    #[tokio::test]
    async fn test_cached_result_served_then_invalidated_by_mutation() {
        let (service, store) = service();
        let statement = GraphQueryStatement::new("MATCH (n:Method {name: $name}) RETURN n")
            .unwrap()
            .with_param("name", "save")
            .unwrap();
        let deadline = RequestDeadline::unbounded();

        let first = service.execute_statement(&statement, &deadline).await.unwrap();
        let second = service.execute_statement(&statement, &deadline).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.execution_count(), 1);

        store
            .add_node(GraphNode::new("m3", "Method").with_property("name", "load"))
            .unwrap();
        assert!(service.cache().is_empty());
        service.execute_statement(&statement, &deadline).await.unwrap();
        assert_eq!(store.execution_count(), 2);
    }

    #[tokio::test]
    async fn test_rejection_and_no_match() {
        let (service, _) = service();
        let statement = GraphQueryStatement::new("MATCH (n) DETACH DELETE n").unwrap();
        let err = service
            .execute_statement(&statement, &RequestDeadline::unbounded())
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::ValidationRejected { .. }));

        let answer = service
            .answer_prompt("hello there", ContextBudget::characters(100), &RequestDeadline::unbounded())
            .await
            .unwrap();
        assert!(answer.context.is_empty());
        assert!(answer.explanation.is_some());
    }

    #[tokio::test]
    async fn test_no_rows_reports_every_candidate() {
        let (service, _) = service();
        let answer = service
            .answer_prompt(
                "what calls nothingAtAll",
                ContextBudget::characters(100),
                &RequestDeadline::unbounded(),
            )
            .await
            .unwrap();
        assert!(!answer.is_answered());
        assert!(!answer.candidates.is_empty());
        assert!(answer
            .candidates
            .iter()
            .all(|c| c.outcome == CandidateOutcome::NoRows));
    }

    #[tokio::test]
    async fn test_count_prompt_returns_summary_rows() {
        let (service, _) = service();
        let answer = service
            .answer_prompt(
                "count methods grouped by visibility",
                ContextBudget::characters(100),
                &RequestDeadline::unbounded(),
            )
            .await
            .unwrap();
        assert!(answer.context.is_empty());
        assert_eq!(answer.summary_rows.len(), 1);
        assert_eq!(answer.summary_rows[0].get("total"), Some(&GraphValue::Int(2)));
        assert_eq!(
            answer.summary_rows[0].get("group"),
            Some(&GraphValue::from(&ParamValue::from("PUBLIC")))
        );
    }

    #[tokio::test]
    async fn test_cancelled_request_does_not_run() {
        let (service, store) = service();
        let deadline = RequestDeadline::unbounded();
        deadline.cancel();
        let statement = GraphQueryStatement::new("MATCH (n:Method) RETURN n").unwrap();
        let err = service.execute_statement(&statement, &deadline).await.unwrap_err();
        assert!(matches!(err, QueryError::Cancelled { .. }));
        assert_eq!(store.execution_count(), 0);
        assert!(service.cache().is_empty());
    }
}
