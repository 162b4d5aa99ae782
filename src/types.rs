// Core Types - Statements, results, intent slots and ranked code context
// These values flow between the validator, cache, executor, translator and assembler.
// Constructors enforce their invariants so downstream stages can rely on them.

use anyhow::{ensure, Result};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::errors::QueryError;

/// Default per-statement timeout
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Default maximum number of rows a statement may return
pub const DEFAULT_RESULT_LIMIT: usize = 500;

static PARAMETER_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("Invalid parameter name pattern"));

/// Typed value bound to a `$name` placeholder in a statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<ParamValue>),
    Map(BTreeMap<String, ParamValue>),
}

impl ParamValue {
    /// Scalars only: null, bool, integer, float, string
    pub fn is_primitive(&self) -> bool {
        !matches!(self, ParamValue::List(_) | ParamValue::Map(_))
    }

    /// A scalar, or a flat list of scalars
    pub fn is_primitive_or_list(&self) -> bool {
        match self {
            ParamValue::List(items) => items.iter().all(ParamValue::is_primitive),
            ParamValue::Map(_) => false,
            _ => true,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(i) => Some(*i),
            ParamValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    /// Stable textual encoding used for cache keys.
    /// Map entries are already ordered by `BTreeMap`.
    pub fn write_canonical(&self, out: &mut String) {
        match self {
            ParamValue::Null => out.push_str("null"),
            ParamValue::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            ParamValue::Int(i) => {
                out.push_str("i:");
                out.push_str(&i.to_string());
            }
            ParamValue::Float(f) => {
                out.push_str("f:");
                out.push_str(&format!("{:016x}", f.to_bits()));
            }
            ParamValue::String(s) => {
                out.push_str("s:");
                out.push_str(&s.len().to_string());
                out.push(':');
                out.push_str(s);
            }
            ParamValue::List(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    item.write_canonical(out);
                }
                out.push(']');
            }
            ParamValue::Map(entries) => {
                out.push('{');
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&key.len().to_string());
                    out.push(':');
                    out.push_str(key);
                    out.push('=');
                    value.write_canonical(out);
                }
                out.push('}');
            }
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::String(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::String(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<usize> for ParamValue {
    fn from(value: usize) -> Self {
        ParamValue::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Float(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

impl<T: Into<ParamValue>> From<Vec<T>> for ParamValue {
    fn from(values: Vec<T>) -> Self {
        ParamValue::List(values.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Null => write!(f, "null"),
            ParamValue::Bool(b) => write!(f, "{b}"),
            ParamValue::Int(i) => write!(f, "{i}"),
            ParamValue::Float(x) => write!(f, "{x}"),
            ParamValue::String(s) => write!(f, "'{s}'"),
            ParamValue::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            ParamValue::Map(entries) => {
                write!(f, "{{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key}: {value}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// Execution options attached to a statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementOptions {
    /// Wall-clock budget for a single execution
    pub timeout: Duration,
    /// Hard cap on returned rows, pushed down to the store
    pub result_limit: usize,
    /// Write access. The engine refuses to run anything with this set.
    pub allow_writes: bool,
}

impl Default for StatementOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_QUERY_TIMEOUT,
            result_limit: DEFAULT_RESULT_LIMIT,
            allow_writes: false,
        }
    }
}

/// A parameterized, read-only graph query
///
/// # Invariants
/// - `text` is non-empty after trimming
/// - parameter names are plain identifiers (no `$` prefix)
#[derive(Debug, Clone, PartialEq)]
pub struct GraphQueryStatement {
    text: String,
    parameters: IndexMap<String, ParamValue>,
    options: StatementOptions,
}

impl GraphQueryStatement {
    /// Create a statement with default options and no parameters
    pub fn new(text: impl Into<String>) -> Result<Self> {
        let text = text.into();
        ensure!(!text.trim().is_empty(), "Statement text cannot be empty");
        ensure!(!text.contains('\0'), "Statement text contains null bytes");
        Ok(Self {
            text,
            parameters: IndexMap::new(),
            options: StatementOptions::default(),
        })
    }

    /// Bind a parameter, replacing any previous value with the same name
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Result<Self> {
        let name = name.into();
        let name = name.strip_prefix('$').map(str::to_string).unwrap_or(name);
        ensure!(
            PARAMETER_NAME.is_match(&name),
            "Invalid parameter name '{}'",
            name
        );
        self.parameters.insert(name, value.into());
        Ok(self)
    }

    pub fn with_options(mut self, options: StatementOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = timeout;
        self
    }

    pub fn with_result_limit(mut self, limit: usize) -> Self {
        self.options.result_limit = limit;
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn parameters(&self) -> &IndexMap<String, ParamValue> {
        &self.parameters
    }

    pub fn options(&self) -> &StatementOptions {
        &self.options
    }
}

impl fmt::Display for GraphQueryStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text.split_whitespace().collect::<Vec<_>>().join(" "))
    }
}

/// Identifier of a node in the property graph
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content digest identifying a statement for caching
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn from_digest(hex_digest: String) -> Self {
        Self(hex_digest)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short prefix is enough for log lines
        write!(f, "{}", &self.0[..self.0.len().min(12)])
    }
}

/// Structural kinds of code elements stored in the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeKind {
    Package,
    Class,
    Interface,
    Method,
    Field,
}

impl NodeKind {
    pub const ALL: [NodeKind; 5] = [
        NodeKind::Package,
        NodeKind::Class,
        NodeKind::Interface,
        NodeKind::Method,
        NodeKind::Field,
    ];

    /// Graph label for this kind
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Package => "Package",
            NodeKind::Class => "Class",
            NodeKind::Interface => "Interface",
            NodeKind::Method => "Method",
            NodeKind::Field => "Field",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        NodeKind::ALL
            .into_iter()
            .find(|kind| kind.label().eq_ignore_ascii_case(label))
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// A node as returned in a result row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: NodeId,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, ParamValue>,
}

impl GraphNode {
    pub fn new(id: impl Into<String>, label: &str) -> Self {
        Self {
            id: NodeId::new(id),
            labels: vec![label.to_string()],
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: &str, value: impl Into<ParamValue>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    /// First label that maps onto a known code element kind
    pub fn kind(&self) -> Option<NodeKind> {
        self.labels.iter().find_map(|label| NodeKind::from_label(label))
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    pub fn property(&self, key: &str) -> Option<&ParamValue> {
        self.properties.get(key)
    }

    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(ParamValue::as_str)
    }

    pub fn property_i64(&self, key: &str) -> Option<i64> {
        self.properties.get(key).and_then(ParamValue::as_i64)
    }
}

/// A relationship as returned in a result row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphRelationship {
    pub rel_type: String,
    pub from: NodeId,
    pub to: NodeId,
}

/// A single value in a result row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum GraphValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<GraphValue>),
    Node(GraphNode),
    Relationship(GraphRelationship),
}

impl GraphValue {
    pub fn as_node(&self) -> Option<&GraphNode> {
        match self {
            GraphValue::Node(node) => Some(node),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            GraphValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<&ParamValue> for GraphValue {
    fn from(value: &ParamValue) -> Self {
        match value {
            ParamValue::Null | ParamValue::Map(_) => GraphValue::Null,
            ParamValue::Bool(b) => GraphValue::Bool(*b),
            ParamValue::Int(i) => GraphValue::Int(*i),
            ParamValue::Float(f) => GraphValue::Float(*f),
            ParamValue::String(s) => GraphValue::String(s.clone()),
            ParamValue::List(items) => GraphValue::List(items.iter().map(GraphValue::from).collect()),
        }
    }
}

impl fmt::Display for GraphValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphValue::Null => write!(f, "null"),
            GraphValue::Bool(b) => write!(f, "{b}"),
            GraphValue::Int(i) => write!(f, "{i}"),
            GraphValue::Float(x) => write!(f, "{x}"),
            GraphValue::String(s) => write!(f, "{s}"),
            GraphValue::List(items) => write!(f, "[{} items]", items.len()),
            GraphValue::Node(node) => {
                let name = node.property_str("name").unwrap_or("");
                write!(f, "({}:{} {})", node.id, node.labels.join(":"), name)
            }
            GraphValue::Relationship(rel) => write!(f, "({})-[:{}]->({})", rel.from, rel.rel_type, rel.to),
        }
    }
}

/// One result row: column name to value, in projection order
pub type Record = IndexMap<String, GraphValue>;

/// Why a result holds fewer rows than the store could have produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncationReason {
    /// Row count hit the statement's result limit
    ResultLimit,
    /// The store stopped early because its time budget ran out
    Timeout,
}

/// Per-statement execution statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub query_id: String,
    pub attempts: u32,
    pub rows_returned: usize,
    pub nodes_touched: Option<u64>,
    pub relationships_touched: Option<u64>,
}

/// Rows produced by one statement execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub rows: Vec<Record>,
    pub execution_time_ms: u64,
    pub truncated: bool,
    pub truncation_reason: Option<TruncationReason>,
    pub statistics: ExecutionStats,
}

impl QueryResult {
    pub fn new(
        rows: Vec<Record>,
        execution_time_ms: u64,
        truncation_reason: Option<TruncationReason>,
        statistics: ExecutionStats,
    ) -> Self {
        Self {
            rows,
            execution_time_ms,
            truncated: truncation_reason.is_some(),
            truncation_reason,
            statistics,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

/// Relationship types the translator can ask about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Predicate {
    Calls,
    Extends,
    Implements,
    Uses,
    Overrides,
    Declares,
    Contains,
}

impl Predicate {
    pub const ALL: [Predicate; 7] = [
        Predicate::Calls,
        Predicate::Extends,
        Predicate::Implements,
        Predicate::Uses,
        Predicate::Overrides,
        Predicate::Declares,
        Predicate::Contains,
    ];

    /// Relationship type in the graph
    pub fn rel_type(&self) -> &'static str {
        match self {
            Predicate::Calls => "CALLS",
            Predicate::Extends => "EXTENDS",
            Predicate::Implements => "IMPLEMENTS",
            Predicate::Uses => "USES",
            Predicate::Overrides => "OVERRIDES",
            Predicate::Declares => "DECLARES",
            Predicate::Contains => "CONTAINS",
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.rel_type())
    }
}

/// Which end of the relationship the subject sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationDirection {
    /// (subject)-[:PRED]->(object)
    #[default]
    Outgoing,
    /// (object)-[:PRED]->(subject)
    Incoming,
}

/// Node attributes a prompt may filter or group on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterAttribute {
    Name,
    Visibility,
    Package,
    ReturnType,
}

impl FilterAttribute {
    pub const ALL: [FilterAttribute; 4] = [
        FilterAttribute::Name,
        FilterAttribute::Visibility,
        FilterAttribute::Package,
        FilterAttribute::ReturnType,
    ];

    /// Property key on graph nodes
    pub fn property(&self) -> &'static str {
        match self {
            FilterAttribute::Name => "name",
            FilterAttribute::Visibility => "visibility",
            FilterAttribute::Package => "package",
            FilterAttribute::ReturnType => "returnType",
        }
    }

    /// Parameter name used when the attribute is bound in a statement
    pub fn param_name(&self) -> &'static str {
        match self {
            FilterAttribute::Name => "name",
            FilterAttribute::Visibility => "visibility",
            FilterAttribute::Package => "package",
            FilterAttribute::ReturnType => "return_type",
        }
    }
}

/// Comparison applied to a filter attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum Constraint {
    Equals(String),
    StartsWith(String),
    EndsWith(String),
    Contains(String),
}

impl Constraint {
    pub fn operator(&self) -> &'static str {
        match self {
            Constraint::Equals(_) => "=",
            Constraint::StartsWith(_) => "STARTS WITH",
            Constraint::EndsWith(_) => "ENDS WITH",
            Constraint::Contains(_) => "CONTAINS",
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Constraint::Equals(v)
            | Constraint::StartsWith(v)
            | Constraint::EndsWith(v)
            | Constraint::Contains(v) => v,
        }
    }

    /// Build a constraint from a name pattern with optional `*` wildcards
    pub fn from_pattern(pattern: &str) -> Self {
        let leading = pattern.starts_with('*');
        let trailing = pattern.ends_with('*') && pattern.len() > 1;
        let core = pattern.trim_matches('*').to_string();
        match (leading, trailing) {
            (true, true) => Constraint::Contains(core),
            (true, false) => Constraint::EndsWith(core),
            (false, true) => Constraint::StartsWith(core),
            (false, false) => Constraint::Equals(core),
        }
    }
}

/// Structured reading of a prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentSlots {
    pub subject_kind: NodeKind,
    #[serde(default)]
    pub predicate: Option<Predicate>,
    #[serde(default)]
    pub direction: RelationDirection,
    /// Name of the node on the far side of `predicate`
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default)]
    pub filters: BTreeMap<FilterAttribute, Constraint>,
    #[serde(default)]
    pub group_by: Option<FilterAttribute>,
    /// Aggregate to counts instead of listing nodes
    #[serde(default)]
    pub count: bool,
    /// Maximum traversal depth for transitive relationships
    #[serde(default)]
    pub depth: Option<u32>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl IntentSlots {
    pub fn new(subject_kind: NodeKind) -> Self {
        Self {
            subject_kind,
            predicate: None,
            direction: RelationDirection::Outgoing,
            object: None,
            filters: BTreeMap::new(),
            group_by: None,
            count: false,
            depth: None,
            limit: None,
        }
    }

    pub fn with_predicate(mut self, predicate: Predicate, direction: RelationDirection) -> Self {
        self.predicate = Some(predicate);
        self.direction = direction;
        self
    }

    pub fn with_object(mut self, object: impl Into<String>) -> Self {
        self.object = Some(object.into());
        self
    }

    pub fn with_filter(mut self, attribute: FilterAttribute, constraint: Constraint) -> Self {
        self.filters.insert(attribute, constraint);
        self
    }
}

/// Vocabulary a slot filler is allowed to answer with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotSchema {
    pub subject_kinds: Vec<NodeKind>,
    pub predicates: Vec<Predicate>,
    pub filter_attributes: Vec<FilterAttribute>,
    pub max_identifier_length: usize,
    pub max_limit: usize,
    pub max_depth: u32,
}

/// Unit in which a context budget is measured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeUnit {
    #[default]
    Characters,
    /// Approximation: one token per four characters
    Tokens,
}

impl SizeUnit {
    pub fn measure(&self, text: &str) -> usize {
        match self {
            SizeUnit::Characters => text.chars().count(),
            SizeUnit::Tokens => text.len().div_ceil(4),
        }
    }
}

/// Caller-supplied cap on the size of returned snippets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextBudget {
    pub limit: usize,
    pub unit: SizeUnit,
}

impl ContextBudget {
    pub fn characters(limit: usize) -> Self {
        Self {
            limit,
            unit: SizeUnit::Characters,
        }
    }

    pub fn tokens(limit: usize) -> Self {
        Self {
            limit,
            unit: SizeUnit::Tokens,
        }
    }
}

/// A line-accurate span of source code backing a graph node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeContextItem {
    pub file_path: String,
    pub line_start: u32,
    pub line_end: u32,
    pub snippet_text: String,
    pub source_node_id: NodeId,
    pub relevance_score: f32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merged_node_ids: Vec<NodeId>,
}

impl CodeContextItem {
    pub fn line_count(&self) -> u32 {
        self.line_end.saturating_sub(self.line_start).saturating_add(1)
    }
}

/// Counters collected while assembling a context set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssemblyStats {
    pub rows_seen: usize,
    pub nodes_seen: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub merged: usize,
    pub dropped_by_budget: usize,
}

/// Ranked, de-duplicated and budgeted code context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedContextSet {
    pub items: Vec<CodeContextItem>,
    /// Set when at least one ranked item was left out to respect the budget
    pub truncated: bool,
    pub total_size: usize,
    pub budget: ContextBudget,
    pub stats: AssemblyStats,
}

impl RankedContextSet {
    pub fn empty(budget: ContextBudget) -> Self {
        Self {
            items: Vec::new(),
            truncated: false,
            total_size: 0,
            budget,
            stats: AssemblyStats::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

/// Request-level deadline and cancellation handle
///
/// Cloned into every stage of one request. Cancelling the token or passing
/// the deadline stops the request at the next stage boundary, and aborts an
/// in-flight store call.
#[derive(Debug, Clone, Default)]
pub struct RequestDeadline {
    deadline: Option<tokio::time::Instant>,
    cancel: CancellationToken,
}

impl RequestDeadline {
    /// No deadline, never cancelled unless [`RequestDeadline::cancel`] is called
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn within(budget: Duration) -> Self {
        Self {
            deadline: Some(tokio::time::Instant::now() + budget),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Time left before the deadline, `None` when unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(tokio::time::Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail with `Cancelled` if the request was cancelled or ran out of time
    pub fn check(&self, stage: &str) -> Result<(), QueryError> {
        if self.cancel.is_cancelled() || self.remaining().is_some_and(|r| r.is_zero()) {
            return Err(QueryError::cancelled(stage));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_rejects_empty_text() {
        assert!(GraphQueryStatement::new("   ").is_err());
        assert!(GraphQueryStatement::new("MATCH (n:Method) RETURN n").is_ok());
    }

    #[test]
    fn test_param_names_are_normalized() {
        let statement = GraphQueryStatement::new("MATCH (n:Method) WHERE n.name = $name RETURN n")
            .unwrap()
            .with_param("$name", "save")
            .unwrap();
        assert_eq!(
            statement.parameters().get("name"),
            Some(&ParamValue::String("save".to_string()))
        );
        assert!(GraphQueryStatement::new("RETURN 1")
            .unwrap()
            .with_param("bad name", 1i64)
            .is_err());
    }

    #[test]
    fn test_primitive_classification() {
        assert!(ParamValue::from("x").is_primitive_or_list());
        assert!(ParamValue::from(vec![1i64, 2, 3]).is_primitive_or_list());
        assert!(!ParamValue::List(vec![ParamValue::List(vec![])]).is_primitive_or_list());
        assert!(!ParamValue::Map(BTreeMap::new()).is_primitive_or_list());
    }

    #[test]
    fn test_constraint_from_pattern() {
        assert_eq!(Constraint::from_pattern("save"), Constraint::Equals("save".into()));
        assert_eq!(Constraint::from_pattern("save*"), Constraint::StartsWith("save".into()));
        assert_eq!(Constraint::from_pattern("*Repo"), Constraint::EndsWith("Repo".into()));
        assert_eq!(Constraint::from_pattern("*cache*"), Constraint::Contains("cache".into()));
    }

    #[test]
    fn test_size_units() {
        assert_eq!(SizeUnit::Characters.measure("héllo"), 5);
        assert_eq!(SizeUnit::Tokens.measure("12345678"), 2);
        assert_eq!(SizeUnit::Tokens.measure("123456789"), 3);
    }

    #[tokio::test]
    async fn test_request_deadline() {
        let open = RequestDeadline::unbounded();
        assert!(open.check("translation").is_ok());
        assert_eq!(open.remaining(), None);

        let expired = RequestDeadline::within(Duration::ZERO);
        assert_eq!(
            expired.check("execution"),
            Err(QueryError::cancelled("execution"))
        );

        let cancelled = RequestDeadline::within(Duration::from_secs(60));
        cancelled.cancel();
        assert!(cancelled.is_cancelled());
        assert!(cancelled.check("assembly").is_err());
    }

    #[test]
    fn test_node_kind_from_label() {
        assert_eq!(NodeKind::from_label("method"), Some(NodeKind::Method));
        assert_eq!(NodeKind::from_label("Variable"), None);
        let node = GraphNode::new("m1", "Method").with_property("name", "persist");
        assert_eq!(node.kind(), Some(NodeKind::Method));
        assert_eq!(node.property_str("name"), Some("persist"));
    }
}
