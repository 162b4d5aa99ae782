// CodeRAG - Graph-RAG retrieval over a code knowledge graph
// Root library module

pub mod observability;
pub mod errors;
pub mod contracts;
pub mod types;
pub mod config;
pub mod builders;
pub mod query_validation;
pub mod query_cache;
pub mod query_executor;
pub mod intent_translator;
pub mod context_assembler;
pub mod query_service;
pub mod memory_graph;
pub mod source_resolver;

// Re-export key types
pub use observability::{
    init_logging,
    init_logging_with_level,
    log_operation,
    record_metric,
    with_trace_id,
    MetricType,
    Operation,
};

pub use errors::{EngineResult, ErrorKind, ErrorReport, QueryError};

pub use contracts::{
    GraphMutationListener,
    GraphStore,
    SlotFiller,
    SourceLocation,
    SourceLocationResolver,
    StoreError,
    StoreErrorKind,
    StoreRequest,
    StoreResponse,
};

pub use types::{
    CodeContextItem,
    ContextBudget,
    GraphNode,
    GraphQueryStatement,
    GraphValue,
    IntentSlots,
    NodeId,
    NodeKind,
    ParamValue,
    Predicate,
    QueryResult,
    RankedContextSet,
    Record,
    RequestDeadline,
    SizeUnit,
    StatementOptions,
    TruncationReason,
};

pub use builders::{QueryServiceBuilder, StatementBuilder};
pub use config::EngineConfig;

// Re-export pipeline components
pub use context_assembler::{ContextAssembler, RankingConfig};
pub use intent_translator::{IntentTemplate, IntentTranslator, TranslatedCandidate, TranslatorConfig};
pub use query_cache::{CacheConfig, CacheStatus, QueryCache};
pub use query_executor::{ExecutorConfig, QueryExecutor};
pub use query_service::{CandidateOutcome, CandidateReport, PromptAnswer, QueryService};
pub use query_validation::{QueryValidator, ValidationVerdict, ValidatorConfig, ViolationReason};

// Re-export bundled collaborators
pub use memory_graph::{GraphSnapshot, InMemoryGraphStore};
pub use source_resolver::{GraphSourceResolver, StaticSourceResolver};
