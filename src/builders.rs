// Builder Patterns - statements and the assembled query service
// Fluent builders with sensible defaults. Validation happens as values are
// supplied and once more in build().

use anyhow::{ensure, Context, Result};
use std::sync::Arc;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::context_assembler::ContextAssembler;
use crate::contracts::{GraphStore, SlotFiller, SourceLocationResolver};
use crate::intent_translator::IntentTranslator;
use crate::query_cache::QueryCache;
use crate::query_executor::QueryExecutor;
use crate::query_service::QueryService;
use crate::query_validation::QueryValidator;
use crate::types::{GraphQueryStatement, ParamValue, StatementOptions};

/// Fluent builder for [`GraphQueryStatement`]
#[derive(Debug, Default)]
pub struct StatementBuilder {
    text: Option<String>,
    parameters: Vec<(String, ParamValue)>,
    options: StatementOptions,
}

impl StatementBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the statement text (required)
    pub fn text(mut self, text: impl Into<String>) -> Result<Self> {
        let text = text.into();
        ensure!(!text.trim().is_empty(), "Statement text cannot be empty");
        self.text = Some(text);
        Ok(self)
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Result<Self> {
        let name = name.into();
        ensure!(!name.is_empty(), "Parameter name cannot be empty");
        self.parameters.push((name, value.into()));
        Ok(self)
    }

    /// Bind a `name=value` assignment as typed on a command line
    ///
    /// Integers, floats, `true`/`false` and `null` keep their type; anything
    /// else is bound as a string.
    pub fn assignment(self, assignment: &str) -> Result<Self> {
        let (name, raw) = assignment
            .split_once('=')
            .with_context(|| format!("Expected name=value, got '{}'", assignment))?;
        self.param(name.trim(), parse_param_value(raw))
    }

    pub fn timeout(mut self, timeout: Duration) -> Result<Self> {
        ensure!(!timeout.is_zero(), "Timeout must be greater than zero");
        self.options.timeout = timeout;
        Ok(self)
    }

    pub fn result_limit(mut self, limit: usize) -> Result<Self> {
        ensure!(limit > 0, "Result limit must be greater than zero");
        self.options.result_limit = limit;
        Ok(self)
    }

    /// Base options, e.g. the executor defaults; later setters override them
    pub fn options(mut self, options: StatementOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> Result<GraphQueryStatement> {
        let text = self
            .text
            .ok_or_else(|| anyhow::anyhow!("Statement text is required"))?;
        let mut statement = GraphQueryStatement::new(text)?.with_options(self.options);
        for (name, value) in self.parameters {
            statement = statement.with_param(name, value)?;
        }
        Ok(statement)
    }
}

fn parse_param_value(raw: &str) -> ParamValue {
    let trimmed = raw.trim();
    if let Ok(n) = trimmed.parse::<i64>() {
        return ParamValue::Int(n);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if f.is_finite() {
            return ParamValue::Float(f);
        }
    }
    match trimmed {
        "true" => ParamValue::Bool(true),
        "false" => ParamValue::Bool(false),
        "null" => ParamValue::Null,
        _ => ParamValue::String(raw.to_string()),
    }
}

/// Wires validator, cache, executor, translator and assembler together
pub struct QueryServiceBuilder {
    store: Arc<dyn GraphStore>,
    resolver: Arc<dyn SourceLocationResolver>,
    config: EngineConfig,
    slot_filler: Option<Arc<dyn SlotFiller>>,
    cache: Option<Arc<QueryCache>>,
}

impl QueryServiceBuilder {
    pub fn new(store: Arc<dyn GraphStore>, resolver: Arc<dyn SourceLocationResolver>) -> Self {
        Self {
            store,
            resolver,
            config: EngineConfig::default(),
            slot_filler: None,
            cache: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Fallback used when no template matches confidently
    pub fn slot_filler(mut self, filler: Arc<dyn SlotFiller>) -> Self {
        self.slot_filler = Some(filler);
        self
    }

    /// Share an existing cache instead of creating one from the config
    pub fn cache(mut self, cache: Arc<QueryCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn build(self) -> Result<QueryService> {
        let config = self.config;
        ensure!(
            config.executor.max_attempts >= 1,
            "executor.max_attempts must be at least 1"
        );
        ensure!(
            !config.executor.default_timeout.is_zero(),
            "executor.default_timeout must be greater than zero"
        );
        ensure!(
            config.executor.default_result_limit > 0,
            "executor.default_result_limit must be greater than zero"
        );
        ensure!(
            (0.0..=1.0).contains(&config.translator.confidence_threshold),
            "translator.confidence_threshold must be within [0, 1]"
        );
        ensure!(
            config.ranking.transitive_decay > 0.0 && config.ranking.transitive_decay <= 1.0,
            "ranking.transitive_decay must be within (0, 1]"
        );
        ensure!(
            (0.0..=1.0).contains(&config.ranking.max_overlap_fraction),
            "ranking.max_overlap_fraction must be within [0, 1]"
        );

        let validator = QueryValidator::new(config.validator.clone());
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(QueryCache::new(config.cache.clone())));
        let executor = QueryExecutor::new(self.store, validator.clone(), config.executor.clone());
        let mut translator = IntentTranslator::new(config.translator.clone());
        if let Some(filler) = self.slot_filler {
            translator = translator.with_slot_filler(filler);
        }
        let assembler = ContextAssembler::new(self.resolver, config.ranking.clone());

        Ok(QueryService::new(validator, cache, executor, translator, assembler))
    }
}
