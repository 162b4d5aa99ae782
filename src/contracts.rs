// Collaborator Contracts
// Interfaces the engine consumes: the graph store, the source-location resolver,
// the text-generation slot filler, and the graph-mutation hook used by ingestion.

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::{GraphNode, IntentSlots, ParamValue, Record, SlotSchema};

/// Classification of a store failure, used to decide retryability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreErrorKind {
    /// Connection reset, leader change, temporary overload
    Transient,
    /// The store could not parse the statement
    Syntax,
    /// The statement parsed but failed while running
    Runtime,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub message: String,
}

impl StoreError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: StoreErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Self {
            kind: StoreErrorKind::Syntax,
            message: message.into(),
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self {
            kind: StoreErrorKind::Runtime,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == StoreErrorKind::Transient
    }
}

/// One read request sent to the graph store
#[derive(Debug, Clone, PartialEq)]
pub struct StoreRequest {
    /// Identifier the store can later be asked to cancel
    pub query_id: String,
    pub text: String,
    pub parameters: IndexMap<String, ParamValue>,
    pub timeout: Duration,
    /// Push-down row cap. `None` when the store cannot enforce one.
    pub row_limit: Option<usize>,
    pub read_only: bool,
}

/// Raw rows returned by the store
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreResponse {
    pub rows: Vec<Record>,
    pub nodes_touched: Option<u64>,
    pub relationships_touched: Option<u64>,
    /// The store hit its own time budget and returned what it had so far
    pub timed_out: bool,
}

/// Property graph store executing read-only statements
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Execute a statement
    ///
    /// # Preconditions
    /// - `request.read_only` is true
    /// - every `$name` in `request.text` has an entry in `request.parameters`
    ///
    /// # Postconditions
    /// - Returns at most `request.row_limit` rows when a limit is given
    /// - Does not mutate the graph
    async fn execute(&self, request: StoreRequest) -> Result<StoreResponse, StoreError>;

    /// Abort an in-flight statement. Returns true if the store acknowledged it.
    async fn cancel(&self, _query_id: &str) -> bool {
        false
    }

    /// Whether `row_limit` is enforced by the store itself
    fn supports_limit_pushdown(&self) -> bool {
        true
    }
}

/// File path and inclusive, 1-based line range of a graph node's source
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file_path: String,
    pub line_start: u32,
    pub line_end: u32,
}

impl SourceLocation {
    pub fn new(file_path: impl Into<String>, line_start: u32, line_end: u32) -> Self {
        Self {
            file_path: file_path.into(),
            line_start,
            line_end: line_end.max(line_start),
        }
    }

    /// Lines covered; an inverted range built from the public fields counts as one
    pub fn span(&self) -> u32 {
        self.line_end.saturating_sub(self.line_start).saturating_add(1)
    }

    /// Number of shared lines with another location in the same file
    pub fn overlap(&self, other: &SourceLocation) -> u32 {
        if self.file_path != other.file_path {
            return 0;
        }
        let start = self.line_start.max(other.line_start);
        let end = self.line_end.min(other.line_end);
        if end < start {
            0
        } else {
            end - start + 1
        }
    }
}

/// Maps graph nodes back to source code
#[async_trait]
pub trait SourceLocationResolver: Send + Sync {
    /// Locate the source span backing `node`
    ///
    /// # Postconditions
    /// - `Ok(None)` when the node has no known source (e.g. deleted since ingestion)
    async fn resolve(&self, node: &GraphNode) -> anyhow::Result<Option<SourceLocation>>;

    /// Read the text of a span, lines joined with `\n`
    async fn read_snippet(&self, location: &SourceLocation) -> anyhow::Result<String>;
}

/// Text-generation backend that extracts intent slots from a prompt
///
/// Output is untrusted: it only ever fills template slots and is checked
/// against `schema` before use.
#[async_trait]
pub trait SlotFiller: Send + Sync {
    async fn fill_slots(&self, prompt: &str, schema: &SlotSchema) -> anyhow::Result<IntentSlots>;
}

/// Hook invoked by ingestion after a graph mutation completes
pub trait GraphMutationListener: Send + Sync {
    fn on_graph_mutated(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_overlap() {
        let a = SourceLocation::new("src/Repo.java", 10, 20);
        let b = SourceLocation::new("src/Repo.java", 15, 30);
        let c = SourceLocation::new("src/Other.java", 15, 30);
        assert_eq!(a.overlap(&b), 6);
        assert_eq!(a.overlap(&c), 0);
        assert_eq!(a.span(), 11);
        assert_eq!(SourceLocation::new("x", 5, 2).line_end, 5);
    }

    #[test]
    fn test_span_of_hand_built_inverted_location() {
        let inverted = SourceLocation {
            file_path: "src/Repo.java".to_string(),
            line_start: 10,
            line_end: 5,
        };
        assert_eq!(inverted.span(), 1);

        let widest = SourceLocation {
            file_path: "src/Repo.java".to_string(),
            line_start: 0,
            line_end: u32::MAX,
        };
        assert_eq!(widest.span(), u32::MAX);
    }

    #[test]
    fn test_store_error_classification() {
        assert!(StoreError::transient("connection reset").is_transient());
        assert!(!StoreError::syntax("unexpected token").is_transient());
    }
}
