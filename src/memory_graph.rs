//! In-memory property graph store
//!
//! A reference [`GraphStore`] over a petgraph `StableGraph`, loaded from a
//! JSON snapshot:
//!
//! ```json
//! { "nodes": [{"id": "m1", "labels": ["Method"], "properties": {"name": "persist"}}],
//!   "edges": [{"from": "m1", "to": "m2", "type": "CALLS"}] }
//! ```
//!
//! It executes a read-only statement subset: one `MATCH` path with labels,
//! inline property maps and directed (optionally variable-length)
//! relationships, a `WHERE` conjunction, `RETURN [DISTINCT]` of variables,
//! properties, `count(..)` and `length(p)`, `ORDER BY` and `LIMIT`.
//! Evaluation runs on the blocking pool, checks its deadline as it expands,
//! and stops when the query id is cancelled.

use anyhow::{bail, Context};
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument};

use crate::contracts::{GraphMutationListener, GraphStore, StoreError, StoreRequest, StoreResponse};
use crate::types::{GraphNode, GraphValue, NodeId, ParamValue, Record};

/// Depth cap for `*` and `*a..` relationship patterns
const MAX_UNBOUNDED_DEPTH: u32 = 15;

/// Expansion steps between deadline and cancellation checks
const CHECK_INTERVAL: u64 = 256;

/// Serialized form of a whole graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub edges: Vec<SnapshotEdge>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEdge {
    pub from: NodeId,
    pub to: NodeId,
    #[serde(rename = "type")]
    pub rel_type: String,
}

#[derive(Debug, Default)]
struct GraphData {
    graph: StableDiGraph<GraphNode, String>,
    index: HashMap<NodeId, NodeIndex>,
    labels: HashMap<String, Vec<NodeIndex>>,
}

impl GraphData {
    fn from_snapshot(snapshot: GraphSnapshot) -> anyhow::Result<Self> {
        let mut data = GraphData::default();
        for node in snapshot.nodes {
            data.add_node(node)?;
        }
        for edge in snapshot.edges {
            data.add_edge(&edge.from, &edge.rel_type, &edge.to)?;
        }
        Ok(data)
    }

    fn add_node(&mut self, node: GraphNode) -> anyhow::Result<()> {
        if self.index.contains_key(&node.id) {
            bail!("Duplicate node id '{}'", node.id);
        }
        let id = node.id.clone();
        let labels = node.labels.clone();
        let idx = self.graph.add_node(node);
        self.index.insert(id, idx);
        for label in labels {
            self.labels.entry(label).or_default().push(idx);
        }
        Ok(())
    }

    fn add_edge(&mut self, from: &NodeId, rel_type: &str, to: &NodeId) -> anyhow::Result<()> {
        let source = *self
            .index
            .get(from)
            .with_context(|| format!("Relationship source '{}' not found", from))?;
        let target = *self
            .index
            .get(to)
            .with_context(|| format!("Relationship target '{}' not found", to))?;
        self.graph.add_edge(source, target, rel_type.to_string());
        Ok(())
    }

    fn snapshot(&self) -> GraphSnapshot {
        let nodes = self
            .graph
            .node_indices()
            .map(|idx| self.graph[idx].clone())
            .collect();
        let edges = self
            .graph
            .edge_indices()
            .filter_map(|e| {
                let (source, target) = self.graph.edge_endpoints(e)?;
                Some(SnapshotEdge {
                    from: self.graph[source].id.clone(),
                    to: self.graph[target].id.clone(),
                    rel_type: self.graph[e].clone(),
                })
            })
            .collect();
        GraphSnapshot { nodes, edges }
    }
}

/// Removes a query's cancellation flag once its execution ends
struct RunningGuard {
    running: Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>,
    query_id: String,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running.lock().remove(&self.query_id);
    }
}

pub struct InMemoryGraphStore {
    data: Arc<RwLock<GraphData>>,
    listeners: RwLock<Vec<Arc<dyn GraphMutationListener>>>,
    running: Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>,
    latency: Option<Duration>,
    executions: AtomicU64,
}

impl Default for InMemoryGraphStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(GraphData::default())),
            listeners: RwLock::new(Vec::new()),
            running: Arc::new(Mutex::new(HashMap::new())),
            latency: None,
            executions: AtomicU64::new(0),
        }
    }

    pub fn from_snapshot(snapshot: GraphSnapshot) -> anyhow::Result<Self> {
        let store = Self::new();
        *store.data.write() = GraphData::from_snapshot(snapshot)?;
        Ok(store)
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let snapshot: GraphSnapshot =
            serde_json::from_str(json).context("Failed to parse graph snapshot")?;
        Self::from_snapshot(snapshot)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read graph snapshot {}", path.display()))?;
        let store = Self::from_json(&json)?;
        info!(
            "Loaded graph snapshot {} ({} nodes, {} relationships)",
            path.display(),
            store.node_count(),
            store.relationship_count()
        );
        Ok(store)
    }

    /// Delay every execution by `latency` before evaluating
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Register a listener notified after every mutation
    pub fn subscribe(&self, listener: Arc<dyn GraphMutationListener>) {
        self.listeners.write().push(listener);
    }

    pub fn add_node(&self, node: GraphNode) -> anyhow::Result<()> {
        self.data.write().add_node(node)?;
        self.notify_mutation();
        Ok(())
    }

    pub fn add_relationship(&self, from: &str, rel_type: &str, to: &str) -> anyhow::Result<()> {
        self.data
            .write()
            .add_edge(&NodeId::from(from), rel_type, &NodeId::from(to))?;
        self.notify_mutation();
        Ok(())
    }

    /// Swap in a whole new graph
    pub fn replace_snapshot(&self, snapshot: GraphSnapshot) -> anyhow::Result<()> {
        let data = GraphData::from_snapshot(snapshot)?;
        *self.data.write() = data;
        self.notify_mutation();
        Ok(())
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        self.data.read().snapshot()
    }

    pub fn node_count(&self) -> usize {
        self.data.read().graph.node_count()
    }

    pub fn relationship_count(&self) -> usize {
        self.data.read().graph.edge_count()
    }

    /// Number of `execute` calls received
    pub fn execution_count(&self) -> u64 {
        self.executions.load(AtomicOrdering::SeqCst)
    }

    fn notify_mutation(&self) {
        let listeners = self.listeners.read().clone();
        debug!("Graph mutated, notifying {} listeners", listeners.len());
        for listener in listeners {
            listener.on_graph_mutated();
        }
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    #[instrument(skip(self, request), fields(query_id = %request.query_id))]
    async fn execute(&self, request: StoreRequest) -> Result<StoreResponse, StoreError> {
        self.executions.fetch_add(1, AtomicOrdering::SeqCst);
        if !request.read_only {
            return Err(StoreError::runtime(
                "In-memory graph store only executes read-only statements",
            ));
        }
        let query = parse_statement(&request.text)?;

        let cancelled = Arc::new(AtomicBool::new(false));
        self.running
            .lock()
            .insert(request.query_id.clone(), Arc::clone(&cancelled));
        let _guard = RunningGuard {
            running: Arc::clone(&self.running),
            query_id: request.query_id.clone(),
        };

        let started = Instant::now();
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if cancelled.load(AtomicOrdering::SeqCst) {
            return Err(StoreError::runtime("Query cancelled"));
        }

        let data = Arc::clone(&self.data);
        let deadline = started + request.timeout;
        tokio::task::spawn_blocking(move || {
            let data = data.read();
            Evaluator::new(&data, &request.parameters, deadline, &cancelled).run(&query, request.row_limit)
        })
        .await
        .map_err(|e| StoreError::runtime(format!("Evaluation task failed: {e}")))?
    }

    async fn cancel(&self, query_id: &str) -> bool {
        match self.running.lock().get(query_id) {
            Some(flag) => {
                flag.store(true, AtomicOrdering::SeqCst);
                true
            }
            None => false,
        }
    }
}

// --- statement parsing ---

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Param(String),
    Str(String),
    Int(i64),
    Float(f64),
    Sym(&'static str),
}

const SYMBOLS: &[&str] = &[
    "..", "<>", "<=", ">=", "(", ")", "[", "]", "{", "}", ":", ",", ".", "*", "=", "<", ">",
    "-", "|", ";",
];

fn tokenize(text: &str) -> Result<Vec<Token>, StoreError> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '/' && chars.get(i + 1) == Some(&'/') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if c == '/' && chars.get(i + 1) == Some(&'*') {
            i += 2;
            while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                i += 1;
            }
            i += 2;
        } else if c == '\'' || c == '"' {
            let mut value = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => return Err(StoreError::syntax("Unterminated string literal")),
                    Some('\\') => {
                        if let Some(escaped) = chars.get(i + 1) {
                            value.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                other => *other,
                            });
                        }
                        i += 2;
                    }
                    Some(ch) if *ch == c => {
                        i += 1;
                        break;
                    }
                    Some(ch) => {
                        value.push(*ch);
                        i += 1;
                    }
                }
            }
            tokens.push(Token::Str(value));
        } else if c == '`' {
            let start = i + 1;
            let end = chars[start..]
                .iter()
                .position(|ch| *ch == '`')
                .map(|p| start + p)
                .ok_or_else(|| StoreError::syntax("Unterminated quoted identifier"))?;
            tokens.push(Token::Word(chars[start..end].iter().collect()));
            i = end + 1;
        } else if c == '$' {
            let start = i + 1;
            i = start;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            if i == start {
                return Err(StoreError::syntax("Expected parameter name after '$'"));
            }
            tokens.push(Token::Param(chars[start..i].iter().collect()));
        } else if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let is_float = chars.get(i) == Some(&'.')
                && chars.get(i + 1).is_some_and(|ch| ch.is_ascii_digit());
            if is_float {
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            let literal: String = chars[start..i].iter().collect();
            let token = if is_float {
                literal.parse().map(Token::Float).ok()
            } else {
                literal.parse().map(Token::Int).ok()
            };
            tokens.push(token.ok_or_else(|| StoreError::syntax(format!("Invalid number '{literal}'")))?);
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Word(chars[start..i].iter().collect()));
        } else {
            let symbol = SYMBOLS.iter().find(|s| {
                s.chars()
                    .enumerate()
                    .all(|(offset, ch)| chars.get(i + offset) == Some(&ch))
            });
            match symbol {
                Some(symbol) => {
                    tokens.push(Token::Sym(symbol));
                    i += symbol.len();
                }
                None => return Err(StoreError::syntax(format!("Unexpected character '{c}'"))),
            }
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelDirection {
    Outgoing,
    Incoming,
    Both,
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Param(String),
    Literal(ParamValue),
}

#[derive(Debug, Clone, PartialEq)]
struct NodePattern {
    var: Option<String>,
    labels: Vec<String>,
    properties: Vec<(String, Operand)>,
}

#[derive(Debug, Clone, PartialEq)]
struct RelPattern {
    types: Vec<String>,
    direction: RelDirection,
    min_hops: u32,
    max_hops: u32,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Var(String),
    Property(String, String),
    Count(Option<String>),
    Length(String),
    Id(String),
    Value(Operand),
}

impl Expr {
    /// Default column name when no alias is given
    fn column_name(&self) -> String {
        match self {
            Expr::Var(v) => v.clone(),
            Expr::Property(v, k) => format!("{v}.{k}"),
            Expr::Count(None) => "count(*)".to_string(),
            Expr::Count(Some(v)) => format!("count({v})"),
            Expr::Length(v) => format!("length({v})"),
            Expr::Id(v) => format!("id({v})"),
            Expr::Value(Operand::Param(p)) => format!("${p}"),
            Expr::Value(Operand::Literal(v)) => v.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparison {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    StartsWith,
    EndsWith,
    Contains,
    In,
    IsNull,
    IsNotNull,
}

#[derive(Debug, Clone, PartialEq)]
struct Condition {
    left: Expr,
    op: Comparison,
    right: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
struct ReturnItem {
    expr: Expr,
    column: String,
}

#[derive(Debug, Clone, PartialEq)]
struct Query {
    path_var: Option<String>,
    start: NodePattern,
    steps: Vec<(RelPattern, NodePattern)>,
    conditions: Vec<Condition>,
    distinct: bool,
    returns: Vec<ReturnItem>,
    order_by: Vec<(Expr, bool)>,
    limit: Option<Operand>,
}

impl Query {
    fn is_aggregate(&self) -> bool {
        self.returns
            .iter()
            .any(|item| matches!(item.expr, Expr::Count(_)))
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

fn parse_statement(text: &str) -> Result<Query, StoreError> {
    let mut parser = Parser {
        tokens: tokenize(text)?,
        pos: 0,
    };
    parser.query()
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        let found = self.at_keyword(keyword);
        if found {
            self.pos += 1;
        }
        found
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), StoreError> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.unexpected(keyword))
        }
    }

    fn at_sym(&self, symbol: &str) -> bool {
        matches!(self.peek(), Some(Token::Sym(s)) if *s == symbol)
    }

    fn eat_sym(&mut self, symbol: &str) -> bool {
        let found = self.at_sym(symbol);
        if found {
            self.pos += 1;
        }
        found
    }

    fn expect_sym(&mut self, symbol: &str) -> Result<(), StoreError> {
        if self.eat_sym(symbol) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{symbol}'")))
        }
    }

    fn identifier(&mut self) -> Result<String, StoreError> {
        match self.advance() {
            Some(Token::Word(w)) => Ok(w),
            _ => {
                self.pos -= 1;
                Err(self.unexpected("identifier"))
            }
        }
    }

    fn unexpected(&self, expected: &str) -> StoreError {
        match self.peek() {
            Some(token) => StoreError::syntax(format!("Expected {expected}, found {token:?}")),
            None => StoreError::syntax(format!("Expected {expected}, found end of statement")),
        }
    }

    fn query(&mut self) -> Result<Query, StoreError> {
        if self.at_keyword("OPTIONAL") {
            return Err(StoreError::syntax("OPTIONAL MATCH is not supported"));
        }
        self.expect_keyword("MATCH")?;

        let path_var = match (self.peek(), self.peek_at(1)) {
            (Some(Token::Word(w)), Some(Token::Sym("="))) => {
                let w = w.clone();
                self.pos += 2;
                Some(w)
            }
            _ => None,
        };

        let start = self.node_pattern()?;
        let mut steps = Vec::new();
        while self.at_sym("-") || self.at_sym("<") {
            let rel = self.rel_pattern()?;
            let node = self.node_pattern()?;
            steps.push((rel, node));
        }
        if self.at_sym(",") || self.at_keyword("MATCH") {
            return Err(StoreError::syntax("Only a single MATCH path is supported"));
        }

        let mut conditions = Vec::new();
        if self.eat_keyword("WHERE") {
            loop {
                conditions.push(self.condition()?);
                if self.at_keyword("OR") || self.at_keyword("XOR") {
                    return Err(StoreError::syntax("Only AND conjunctions are supported"));
                }
                if !self.eat_keyword("AND") {
                    break;
                }
            }
        }

        self.expect_keyword("RETURN")?;
        let distinct = self.eat_keyword("DISTINCT");
        let mut returns = Vec::new();
        loop {
            let expr = self.expr()?;
            let column = if self.eat_keyword("AS") {
                self.identifier()?
            } else {
                expr.column_name()
            };
            returns.push(ReturnItem { expr, column });
            if !self.eat_sym(",") {
                break;
            }
        }

        let mut order_by = Vec::new();
        if self.eat_keyword("ORDER") {
            self.expect_keyword("BY")?;
            loop {
                let expr = self.expr()?;
                let descending = if self.eat_keyword("DESC") || self.eat_keyword("DESCENDING") {
                    true
                } else {
                    if !self.eat_keyword("ASC") {
                        self.eat_keyword("ASCENDING");
                    }
                    false
                };
                order_by.push((expr, descending));
                if !self.eat_sym(",") {
                    break;
                }
            }
        }

        let limit = if self.eat_keyword("LIMIT") {
            match self.advance() {
                Some(Token::Int(n)) if n >= 0 => Some(Operand::Literal(ParamValue::Int(n))),
                Some(Token::Param(p)) => Some(Operand::Param(p)),
                _ => return Err(StoreError::syntax("LIMIT expects a non-negative integer or parameter")),
            }
        } else {
            None
        };

        self.eat_sym(";");
        if self.pos < self.tokens.len() {
            return Err(self.unexpected("end of statement"));
        }

        Ok(Query {
            path_var,
            start,
            steps,
            conditions,
            distinct,
            returns,
            order_by,
            limit,
        })
    }

    fn node_pattern(&mut self) -> Result<NodePattern, StoreError> {
        self.expect_sym("(")?;
        let var = match self.peek() {
            Some(Token::Word(_)) => Some(self.identifier()?),
            _ => None,
        };
        let mut labels = Vec::new();
        while self.eat_sym(":") {
            labels.push(self.identifier()?);
        }
        let mut properties = Vec::new();
        if self.eat_sym("{") {
            if !self.at_sym("}") {
                loop {
                    let key = self.identifier()?;
                    self.expect_sym(":")?;
                    properties.push((key, self.operand()?));
                    if !self.eat_sym(",") {
                        break;
                    }
                }
            }
            self.expect_sym("}")?;
        }
        self.expect_sym(")")?;
        Ok(NodePattern {
            var,
            labels,
            properties,
        })
    }

    fn rel_pattern(&mut self) -> Result<RelPattern, StoreError> {
        let incoming = self.eat_sym("<");
        self.expect_sym("-")?;

        let mut rel = RelPattern {
            types: Vec::new(),
            direction: RelDirection::Both,
            min_hops: 1,
            max_hops: 1,
        };
        if self.eat_sym("[") {
            if let Some(Token::Word(_)) = self.peek() {
                // Relationship variables are accepted but not bound
                self.identifier()?;
            }
            if self.eat_sym(":") {
                rel.types.push(self.identifier()?);
                while self.eat_sym("|") {
                    self.eat_sym(":");
                    rel.types.push(self.identifier()?);
                }
            }
            if self.eat_sym("*") {
                let min = match self.peek() {
                    Some(Token::Int(n)) => {
                        let n = *n;
                        self.pos += 1;
                        Some(n)
                    }
                    _ => None,
                };
                let (min, max) = if self.eat_sym("..") {
                    let max = match self.peek() {
                        Some(Token::Int(n)) => {
                            let n = *n;
                            self.pos += 1;
                            Some(n)
                        }
                        _ => None,
                    };
                    (min.unwrap_or(1), max)
                } else {
                    match min {
                        Some(n) => (n, Some(n)),
                        None => (1, None),
                    }
                };
                let to_hops = |n: i64| u32::try_from(n).map_err(|_| StoreError::syntax("Invalid hop count"));
                rel.min_hops = to_hops(min)?;
                rel.max_hops = match max {
                    Some(max) => to_hops(max)?,
                    None => MAX_UNBOUNDED_DEPTH,
                };
                if rel.max_hops < rel.min_hops {
                    return Err(StoreError::syntax("Variable-length range is empty"));
                }
            }
            self.expect_sym("]")?;
        }
        self.expect_sym("-")?;
        let outgoing = self.eat_sym(">");

        rel.direction = match (incoming, outgoing) {
            (true, false) => RelDirection::Incoming,
            (false, true) => RelDirection::Outgoing,
            (false, false) => RelDirection::Both,
            (true, true) => return Err(StoreError::syntax("Relationship cannot point both ways")),
        };
        Ok(rel)
    }

    fn operand(&mut self) -> Result<Operand, StoreError> {
        let negative = self.eat_sym("-");
        let operand = match self.advance() {
            Some(Token::Param(p)) if !negative => Operand::Param(p),
            Some(Token::Str(s)) if !negative => Operand::Literal(ParamValue::String(s)),
            Some(Token::Int(n)) => Operand::Literal(ParamValue::Int(if negative { -n } else { n })),
            Some(Token::Float(f)) => Operand::Literal(ParamValue::Float(if negative { -f } else { f })),
            Some(Token::Word(w)) if !negative && w.eq_ignore_ascii_case("true") => {
                Operand::Literal(ParamValue::Bool(true))
            }
            Some(Token::Word(w)) if !negative && w.eq_ignore_ascii_case("false") => {
                Operand::Literal(ParamValue::Bool(false))
            }
            Some(Token::Word(w)) if !negative && w.eq_ignore_ascii_case("null") => {
                Operand::Literal(ParamValue::Null)
            }
            _ => {
                self.pos -= 1;
                return Err(self.unexpected("literal or parameter"));
            }
        };
        Ok(operand)
    }

    fn expr(&mut self) -> Result<Expr, StoreError> {
        match (self.peek(), self.peek_at(1)) {
            (Some(Token::Word(name)), Some(Token::Sym("("))) => {
                let function = name.to_lowercase();
                self.pos += 2;
                let expr = match function.as_str() {
                    "count" if self.eat_sym("*") => Expr::Count(None),
                    "count" => Expr::Count(Some(self.identifier()?)),
                    "length" => Expr::Length(self.identifier()?),
                    "id" | "elementid" => Expr::Id(self.identifier()?),
                    other => {
                        return Err(StoreError::syntax(format!("Unsupported function '{other}'")))
                    }
                };
                self.expect_sym(")")?;
                Ok(expr)
            }
            (Some(Token::Word(w)), _)
                if ["true", "false", "null"].iter().any(|k| w.eq_ignore_ascii_case(k)) =>
            {
                Ok(Expr::Value(self.operand()?))
            }
            (Some(Token::Word(_)), _) => {
                let var = self.identifier()?;
                if self.eat_sym(".") {
                    Ok(Expr::Property(var, self.identifier()?))
                } else {
                    Ok(Expr::Var(var))
                }
            }
            _ => Ok(Expr::Value(self.operand()?)),
        }
    }

    fn condition(&mut self) -> Result<Condition, StoreError> {
        let left = self.expr()?;
        let op = match self.advance() {
            Some(Token::Sym("=")) => Comparison::Eq,
            Some(Token::Sym("<>")) => Comparison::Ne,
            Some(Token::Sym("<")) => Comparison::Lt,
            Some(Token::Sym(">")) => Comparison::Gt,
            Some(Token::Sym("<=")) => Comparison::Le,
            Some(Token::Sym(">=")) => Comparison::Ge,
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("STARTS") => {
                self.expect_keyword("WITH")?;
                Comparison::StartsWith
            }
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("ENDS") => {
                self.expect_keyword("WITH")?;
                Comparison::EndsWith
            }
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("CONTAINS") => Comparison::Contains,
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("IN") => Comparison::In,
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("IS") => {
                let negated = self.eat_keyword("NOT");
                self.expect_keyword("NULL")?;
                let op = if negated {
                    Comparison::IsNotNull
                } else {
                    Comparison::IsNull
                };
                return Ok(Condition {
                    left,
                    op,
                    right: None,
                });
            }
            _ => {
                self.pos -= 1;
                return Err(self.unexpected("comparison operator"));
            }
        };
        let right = self.expr()?;
        Ok(Condition {
            left,
            op,
            right: Some(right),
        })
    }
}

// --- evaluation ---

#[derive(Debug, Clone, Default)]
struct Binding {
    nodes: HashMap<String, NodeIndex>,
    path_len: u32,
}

impl Binding {
    /// Bind `var` to `idx`; false when it is already bound to another node
    fn bind(&mut self, var: &Option<String>, idx: NodeIndex) -> bool {
        match var {
            None => true,
            Some(var) => match self.nodes.get(var) {
                Some(existing) => *existing == idx,
                None => {
                    self.nodes.insert(var.clone(), idx);
                    true
                }
            },
        }
    }
}

struct Evaluator<'a> {
    data: &'a GraphData,
    params: &'a IndexMap<String, ParamValue>,
    deadline: Instant,
    cancelled: &'a AtomicBool,
    steps: u64,
    timed_out: bool,
    nodes_touched: HashSet<NodeIndex>,
    relationships_touched: u64,
}

impl<'a> Evaluator<'a> {
    fn new(
        data: &'a GraphData,
        params: &'a IndexMap<String, ParamValue>,
        deadline: Instant,
        cancelled: &'a AtomicBool,
    ) -> Self {
        Self {
            data,
            params,
            deadline,
            cancelled,
            steps: 0,
            timed_out: false,
            nodes_touched: HashSet::new(),
            relationships_touched: 0,
        }
    }

    /// Count one step; false once the deadline has passed
    fn tick(&mut self) -> Result<bool, StoreError> {
        self.steps += 1;
        if self.steps % CHECK_INTERVAL == 0 {
            if self.cancelled.load(AtomicOrdering::SeqCst) {
                return Err(StoreError::runtime("Query cancelled"));
            }
            if Instant::now() >= self.deadline {
                self.timed_out = true;
            }
        }
        Ok(!self.timed_out)
    }

    fn run(mut self, query: &Query, row_limit: Option<usize>) -> Result<StoreResponse, StoreError> {
        let limit = match &query.limit {
            Some(operand) => {
                let value = self.operand(operand)?;
                let n = match value {
                    ParamValue::Int(n) if n >= 0 => usize::try_from(n).unwrap_or(usize::MAX),
                    other => {
                        return Err(StoreError::syntax(format!(
                            "LIMIT must be a non-negative integer, got {other}"
                        )))
                    }
                };
                Some(n)
            }
            None => None,
        };
        let limit = match (limit, row_limit) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        // Without ordering, grouping or de-duplication the first matches are the answer
        let early_stop = if query.order_by.is_empty() && !query.distinct && !query.is_aggregate() {
            limit
        } else {
            None
        };
        let bindings = self.match_pattern(query, early_stop)?;

        let mut rows = if query.is_aggregate() {
            self.aggregate(query, &bindings)?
        } else {
            self.project(query, bindings)?
        };
        if let Some(limit) = limit {
            rows.truncate(limit);
        }

        debug!(
            "Evaluated statement: {} rows, {} nodes touched, timed out: {}",
            rows.len(),
            self.nodes_touched.len(),
            self.timed_out
        );
        Ok(StoreResponse {
            rows,
            nodes_touched: Some(self.nodes_touched.len() as u64),
            relationships_touched: Some(self.relationships_touched),
            timed_out: self.timed_out,
        })
    }

    fn match_pattern(&mut self, query: &Query, cap: Option<usize>) -> Result<Vec<Binding>, StoreError> {
        let candidates: Vec<NodeIndex> = match query.start.labels.first() {
            Some(label) => self.data.labels.get(label).cloned().unwrap_or_default(),
            None => self.data.graph.node_indices().collect(),
        };

        let mut results = Vec::new();
        for idx in candidates {
            if cap.is_some_and(|cap| results.len() >= cap) || !self.tick()? {
                break;
            }
            if !self.node_matches(idx, &query.start)? {
                continue;
            }
            let mut binding = Binding::default();
            if binding.bind(&query.start.var, idx) {
                self.extend(query, 0, binding, idx, cap, &mut results)?;
            }
        }
        Ok(results)
    }

    fn extend(
        &mut self,
        query: &Query,
        step: usize,
        binding: Binding,
        current: NodeIndex,
        cap: Option<usize>,
        results: &mut Vec<Binding>,
    ) -> Result<(), StoreError> {
        if cap.is_some_and(|cap| results.len() >= cap) {
            return Ok(());
        }
        let Some((rel, node_pattern)) = query.steps.get(step) else {
            if self.conditions_hold(query, &binding)? {
                results.push(binding);
            }
            return Ok(());
        };

        let mut reached = Vec::new();
        let mut used = Vec::new();
        if rel.min_hops == 0 {
            reached.push((current, 0));
        }
        self.expand(current, rel, 0, &mut used, &mut reached)?;

        for (next, hops) in reached {
            if !self.tick()? {
                break;
            }
            if !self.node_matches(next, node_pattern)? {
                continue;
            }
            let mut next_binding = binding.clone();
            if !next_binding.bind(&node_pattern.var, next) {
                continue;
            }
            next_binding.path_len += hops;
            self.extend(query, step + 1, next_binding, next, cap, results)?;
        }
        Ok(())
    }

    /// Nodes reachable from `from` within the relationship's hop range, without reusing an edge
    fn expand(
        &mut self,
        from: NodeIndex,
        rel: &RelPattern,
        depth: u32,
        used: &mut Vec<EdgeIndex>,
        reached: &mut Vec<(NodeIndex, u32)>,
    ) -> Result<(), StoreError> {
        if depth >= rel.max_hops {
            return Ok(());
        }
        let directions: &[Direction] = match rel.direction {
            RelDirection::Outgoing => &[Direction::Outgoing],
            RelDirection::Incoming => &[Direction::Incoming],
            RelDirection::Both => &[Direction::Outgoing, Direction::Incoming],
        };

        let graph = &self.data.graph;
        let mut next_hops: Vec<(EdgeIndex, NodeIndex)> = Vec::new();
        for direction in directions {
            for edge in graph.edges_directed(from, *direction) {
                if !rel.types.is_empty() && !rel.types.iter().any(|t| t == edge.weight()) {
                    continue;
                }
                if used.contains(&edge.id()) {
                    continue;
                }
                let other = if edge.source() == from {
                    edge.target()
                } else {
                    edge.source()
                };
                next_hops.push((edge.id(), other));
            }
        }

        for (edge, other) in next_hops {
            if !self.tick()? {
                return Ok(());
            }
            self.relationships_touched += 1;
            let hops = depth + 1;
            if hops >= rel.min_hops {
                reached.push((other, hops));
            }
            used.push(edge);
            self.expand(other, rel, hops, used, reached)?;
            used.pop();
        }
        Ok(())
    }

    fn node_matches(&mut self, idx: NodeIndex, pattern: &NodePattern) -> Result<bool, StoreError> {
        self.nodes_touched.insert(idx);
        let data = self.data;
        let node = &data.graph[idx];
        if !pattern.labels.iter().all(|label| node.has_label(label)) {
            return Ok(false);
        }
        for (key, operand) in &pattern.properties {
            let expected = GraphValue::from(&self.operand(operand)?);
            if !values_equal(&node_property(node, key), &expected) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn conditions_hold(&self, query: &Query, binding: &Binding) -> Result<bool, StoreError> {
        for condition in &query.conditions {
            let left = self.eval(query, &condition.left, binding)?;
            let right = match &condition.right {
                Some(expr) => self.eval(query, expr, binding)?,
                None => GraphValue::Null,
            };
            if !compare(condition.op, &left, &right) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn operand(&self, operand: &Operand) -> Result<ParamValue, StoreError> {
        match operand {
            Operand::Literal(value) => Ok(value.clone()),
            Operand::Param(name) => self
                .params
                .get(name)
                .cloned()
                .ok_or_else(|| StoreError::syntax(format!("Expected parameter(s): {name}"))),
        }
    }

    fn bound_node(&self, var: &str, binding: &Binding) -> Result<&'a GraphNode, StoreError> {
        let data = self.data;
        binding
            .nodes
            .get(var)
            .map(|idx| &data.graph[*idx])
            .ok_or_else(|| StoreError::syntax(format!("Variable `{var}` not defined")))
    }

    fn eval(&self, query: &Query, expr: &Expr, binding: &Binding) -> Result<GraphValue, StoreError> {
        match expr {
            Expr::Var(var) => {
                if query.path_var.as_deref() == Some(var.as_str()) {
                    return Err(StoreError::syntax("Returning whole paths is not supported"));
                }
                Ok(GraphValue::Node(self.bound_node(var, binding)?.clone()))
            }
            Expr::Property(var, key) => Ok(node_property(self.bound_node(var, binding)?, key)),
            Expr::Id(var) => Ok(GraphValue::String(self.bound_node(var, binding)?.id.to_string())),
            Expr::Length(var) => {
                if query.path_var.as_deref() == Some(var.as_str()) {
                    Ok(GraphValue::Int(i64::from(binding.path_len)))
                } else {
                    Err(StoreError::syntax(format!("`{var}` is not a path")))
                }
            }
            Expr::Value(operand) => Ok(GraphValue::from(&self.operand(operand)?)),
            Expr::Count(_) => Err(StoreError::syntax("count() is only allowed in RETURN")),
        }
    }

    fn project(&self, query: &Query, bindings: Vec<Binding>) -> Result<Vec<Record>, StoreError> {
        let mut rows: Vec<(Record, Binding)> = Vec::with_capacity(bindings.len());
        let mut seen = HashSet::new();
        for binding in bindings {
            let mut record = Record::new();
            for item in &query.returns {
                record.insert(item.column.clone(), self.eval(query, &item.expr, &binding)?);
            }
            if query.distinct && !seen.insert(row_key(&record)) {
                continue;
            }
            rows.push((record, binding));
        }

        if !query.order_by.is_empty() {
            let mut keyed = Vec::with_capacity(rows.len());
            for (record, binding) in rows {
                let keys = query
                    .order_by
                    .iter()
                    .map(|(expr, _)| self.order_value(query, expr, &record, Some(&binding)))
                    .collect::<Result<Vec<_>, _>>()?;
                keyed.push((keys, record));
            }
            keyed.sort_by(|a, b| compare_keys(&a.0, &b.0, &query.order_by));
            return Ok(keyed.into_iter().map(|(_, record)| record).collect());
        }
        Ok(rows.into_iter().map(|(record, _)| record).collect())
    }

    fn aggregate(&self, query: &Query, bindings: &[Binding]) -> Result<Vec<Record>, StoreError> {
        let mut groups: IndexMap<String, (Vec<GraphValue>, Vec<i64>)> = IndexMap::new();
        let counters = query
            .returns
            .iter()
            .filter(|item| matches!(item.expr, Expr::Count(_)))
            .count();

        for binding in bindings {
            let keys = query
                .returns
                .iter()
                .filter(|item| !matches!(item.expr, Expr::Count(_)))
                .map(|item| self.eval(query, &item.expr, binding))
                .collect::<Result<Vec<_>, _>>()?;
            let group_key = keys.iter().map(value_key).collect::<Vec<_>>().join("\u{1f}");
            let entry = groups
                .entry(group_key)
                .or_insert_with(|| (keys, vec![0; counters]));
            let counted = query.returns.iter().filter_map(|item| match &item.expr {
                Expr::Count(var) => Some(var),
                _ => None,
            });
            for (slot, var) in counted.enumerate() {
                let present = match var {
                    None => true,
                    Some(var) => binding.nodes.contains_key(var),
                };
                if present {
                    entry.1[slot] += 1;
                }
            }
        }

        let has_keys = query
            .returns
            .iter()
            .any(|item| !matches!(item.expr, Expr::Count(_)));
        if groups.is_empty() && !has_keys {
            groups.insert(String::new(), (Vec::new(), vec![0; counters]));
        }

        let mut rows: Vec<Record> = groups
            .into_values()
            .map(|(keys, counts)| {
                let mut keys = keys.into_iter();
                let mut counts = counts.into_iter();
                query
                    .returns
                    .iter()
                    .map(|item| {
                        let value = match item.expr {
                            Expr::Count(_) => GraphValue::Int(counts.next().unwrap_or(0)),
                            _ => keys.next().unwrap_or(GraphValue::Null),
                        };
                        (item.column.clone(), value)
                    })
                    .collect()
            })
            .collect();

        if !query.order_by.is_empty() {
            let mut keyed = Vec::with_capacity(rows.len());
            for record in rows {
                let keys = query
                    .order_by
                    .iter()
                    .map(|(expr, _)| self.order_value(query, expr, &record, None))
                    .collect::<Result<Vec<_>, _>>()?;
                keyed.push((keys, record));
            }
            keyed.sort_by(|a, b| compare_keys(&a.0, &b.0, &query.order_by));
            rows = keyed.into_iter().map(|(_, record)| record).collect();
        }
        Ok(rows)
    }

    /// Sort key: output columns first, then the match binding
    fn order_value(
        &self,
        query: &Query,
        expr: &Expr,
        record: &Record,
        binding: Option<&Binding>,
    ) -> Result<GraphValue, StoreError> {
        if let Some(value) = record.get(&expr.column_name()) {
            return Ok(value.clone());
        }
        if let Expr::Property(var, key) = expr {
            if let Some(GraphValue::Node(node)) = record.get(var) {
                return Ok(node_property(node, key));
            }
        }
        if let Some(item) = query.returns.iter().find(|item| item.expr == *expr) {
            if let Some(value) = record.get(&item.column) {
                return Ok(value.clone());
            }
        }
        match binding {
            Some(binding) => self.eval(query, expr, binding),
            None => Err(StoreError::syntax(format!(
                "ORDER BY {} must refer to a returned column",
                expr.column_name()
            ))),
        }
    }
}

fn node_property(node: &GraphNode, key: &str) -> GraphValue {
    match node.property(key) {
        Some(value) => GraphValue::from(value),
        None if key == "id" => GraphValue::String(node.id.to_string()),
        None => GraphValue::Null,
    }
}

fn value_key(value: &GraphValue) -> String {
    match value {
        GraphValue::Node(node) => format!("node:{}", node.id),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn row_key(record: &Record) -> String {
    record.values().map(value_key).collect::<Vec<_>>().join("\u{1f}")
}

fn as_f64(value: &GraphValue) -> Option<f64> {
    match value {
        GraphValue::Int(i) => Some(*i as f64),
        GraphValue::Float(f) => Some(*f),
        _ => None,
    }
}

fn values_equal(a: &GraphValue, b: &GraphValue) -> bool {
    match (a, b) {
        (GraphValue::Null, _) | (_, GraphValue::Null) => false,
        (GraphValue::Node(x), GraphValue::Node(y)) => x.id == y.id,
        _ => match (as_f64(a), as_f64(b)) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        },
    }
}

fn compare(op: Comparison, left: &GraphValue, right: &GraphValue) -> bool {
    match op {
        Comparison::IsNull => matches!(left, GraphValue::Null),
        Comparison::IsNotNull => !matches!(left, GraphValue::Null),
        Comparison::Eq => values_equal(left, right),
        Comparison::Ne => {
            !matches!(left, GraphValue::Null)
                && !matches!(right, GraphValue::Null)
                && !values_equal(left, right)
        }
        Comparison::Lt | Comparison::Gt | Comparison::Le | Comparison::Ge => {
            let ordering = match (left, right) {
                (GraphValue::String(a), GraphValue::String(b)) => Some(a.cmp(b)),
                _ => match (as_f64(left), as_f64(right)) {
                    (Some(a), Some(b)) => a.partial_cmp(&b),
                    _ => None,
                },
            };
            match ordering {
                Some(ordering) => match op {
                    Comparison::Lt => ordering == Ordering::Less,
                    Comparison::Gt => ordering == Ordering::Greater,
                    Comparison::Le => ordering != Ordering::Greater,
                    _ => ordering != Ordering::Less,
                },
                None => false,
            }
        }
        Comparison::StartsWith | Comparison::EndsWith | Comparison::Contains => {
            match (left, right) {
                (GraphValue::String(a), GraphValue::String(b)) => match op {
                    Comparison::StartsWith => a.starts_with(b.as_str()),
                    Comparison::EndsWith => a.ends_with(b.as_str()),
                    _ => a.contains(b.as_str()),
                },
                _ => false,
            }
        }
        Comparison::In => match right {
            GraphValue::List(items) => items.iter().any(|item| values_equal(left, item)),
            _ => false,
        },
    }
}

/// Total order for sorting: booleans, numbers, strings, nodes, others, then nulls
fn order_values(a: &GraphValue, b: &GraphValue) -> Ordering {
    fn rank(value: &GraphValue) -> u8 {
        match value {
            GraphValue::Bool(_) => 0,
            GraphValue::Int(_) | GraphValue::Float(_) => 1,
            GraphValue::String(_) => 2,
            GraphValue::Node(_) => 3,
            GraphValue::Relationship(_) | GraphValue::List(_) => 4,
            GraphValue::Null => 5,
        }
    }
    match (a, b) {
        (GraphValue::Bool(x), GraphValue::Bool(y)) => x.cmp(y),
        (GraphValue::String(x), GraphValue::String(y)) => x.cmp(y),
        (GraphValue::Node(x), GraphValue::Node(y)) => x.id.cmp(&y.id),
        _ => match (as_f64(a), as_f64(b)) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            _ => rank(a)
                .cmp(&rank(b))
                .then_with(|| value_key(a).cmp(&value_key(b))),
        },
    }
}

fn compare_keys(a: &[GraphValue], b: &[GraphValue], order_by: &[(Expr, bool)]) -> Ordering {
    for ((x, y), (_, descending)) in a.iter().zip(b).zip(order_by) {
        let ordering = order_values(x, y);
        let ordering = if *descending {
            ordering.reverse()
        } else {
            ordering
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::StoreErrorKind;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;

    const SNAPSHOT: &str = r#"{
        "nodes": [
            {"id": "p1", "labels": ["Package"], "properties": {"name": "com.acme.repo"}},
            {"id": "c1", "labels": ["Class"], "properties": {"name": "OrderRepository", "package": "com.acme.repo"}},
            {"id": "m1", "labels": ["Method"], "properties": {"name": "persist", "visibility": "PUBLIC", "package": "com.acme.repo"}},
            {"id": "m2", "labels": ["Method"], "properties": {"name": "save", "visibility": "PRIVATE", "package": "com.acme.repo"}},
            {"id": "m3", "labels": ["Method"], "properties": {"name": "flush", "visibility": "PUBLIC", "package": "com.acme.repo"}},
            {"id": "m4", "labels": ["Method"], "properties": {"name": "checkout", "visibility": "PUBLIC", "package": "com.acme.shop"}}
        ],
        "edges": [
            {"from": "p1", "to": "c1", "type": "CONTAINS"},
            {"from": "c1", "to": "m1", "type": "DECLARES"},
            {"from": "c1", "to": "m2", "type": "DECLARES"},
            {"from": "m1", "to": "m2", "type": "CALLS"},
            {"from": "m2", "to": "m3", "type": "CALLS"},
            {"from": "m4", "to": "m1", "type": "CALLS"}
        ]
    }"#;

    fn store() -> InMemoryGraphStore {
        InMemoryGraphStore::from_json(SNAPSHOT).unwrap()
    }

    fn request(text: &str, params: &[(&str, ParamValue)]) -> StoreRequest {
        StoreRequest {
            query_id: uuid::Uuid::new_v4().to_string(),
            text: text.to_string(),
            parameters: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            timeout: Duration::from_secs(5),
            row_limit: None,
            read_only: true,
        }
    }

    fn names(response: &StoreResponse, column: &str) -> Vec<String> {
        response
            .rows
            .iter()
            .map(|row| match row.get(column) {
                Some(GraphValue::Node(node)) => node.property_str("name").unwrap_or("").to_string(),
                Some(other) => other.to_string(),
                None => String::new(),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_relationship_match_with_filters() {
        let response = store()
            .execute(request(
                "MATCH (s:Method)-[:CALLS]->(o:Method) WHERE o.name = $object AND s.visibility = $visibility \
                 RETURN DISTINCT s AS node ORDER BY node.name LIMIT $limit",
                &[
                    ("object", "save".into()),
                    ("visibility", "PUBLIC".into()),
                    ("limit", 25_i64.into()),
                ],
            ))
            .await
            .unwrap();
        assert_eq!(names(&response, "node"), vec!["persist"]);
        assert!(response.nodes_touched.unwrap() > 0);
        assert!(!response.timed_out);
    }

    #[tokio::test]
    async fn test_incoming_and_variable_length() {
        let store = store();
        let response = store
            .execute(request(
                "MATCH (s:Method)<-[:CALLS]-(o:Method) WHERE o.name = $object RETURN s.name AS callee",
                &[("object", "persist".into())],
            ))
            .await
            .unwrap();
        assert_eq!(names(&response, "callee"), vec!["save"]);

        let response = store
            .execute(request(
                "MATCH p = (s:Method)-[:CALLS*1..3]->(o:Method) WHERE o.name = $object \
                 RETURN DISTINCT s AS node, length(p) AS hops ORDER BY hops, node.name",
                &[("object", "flush".into())],
            ))
            .await
            .unwrap();
        assert_eq!(names(&response, "node"), vec!["save", "persist", "checkout"]);
        assert_eq!(names(&response, "hops"), vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_inline_properties_and_declares() {
        let response = store()
            .execute(request(
                "MATCH (s:Method)<-[:DECLARES]-(o {name: 'OrderRepository'}) RETURN s.name ORDER BY s.name DESC",
                &[],
            ))
            .await
            .unwrap();
        assert_eq!(names(&response, "s.name"), vec!["save", "persist"]);
    }

    #[tokio::test]
    async fn test_count_grouped() {
        let response = store()
            .execute(request(
                "MATCH (s:Method) RETURN s.visibility AS group, count(s) AS total ORDER BY total DESC, group LIMIT 10",
                &[],
            ))
            .await
            .unwrap();
        assert_eq!(names(&response, "group"), vec!["PUBLIC", "PRIVATE"]);
        assert_eq!(names(&response, "total"), vec!["3", "1"]);

        let response = store()
            .execute(request("MATCH (n:Interface) RETURN count(*)", &[]))
            .await
            .unwrap();
        assert_eq!(names(&response, "count(*)"), vec!["0"]);
    }

    #[tokio::test]
    async fn test_string_predicates_and_row_limit() {
        let mut req = request(
            "MATCH (s:Method) WHERE s.package STARTS WITH $prefix RETURN s ORDER BY s.name",
            &[("prefix", "com.acme".into())],
        );
        req.row_limit = Some(2);
        let response = store().execute(req).await.unwrap();
        assert_eq!(names(&response, "s"), vec!["checkout", "flush"]);
    }

    #[tokio::test]
    async fn test_errors() {
        let store = store();
        let err = store
            .execute(request("MATCH (n RETURN n", &[]))
            .await
            .unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::Syntax);

        let err = store
            .execute(request("MATCH (n:Method {name: $missing}) RETURN n", &[]))
            .await
            .unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::Syntax);

        let err = store
            .execute(request("MATCH (n) DETACH DELETE n", &[]))
            .await
            .unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::Syntax);

        let mut write = request("MATCH (n) RETURN n", &[]);
        write.read_only = false;
        assert!(store.execute(write).await.is_err());
    }

    #[tokio::test]
    async fn test_repeated_execution_is_identical() {
        let store = store();
        let text = "MATCH (s:Method)-[:CALLS]->(o) RETURN s.name AS caller, o.name AS callee";
        let first = store.execute(request(text, &[])).await.unwrap();
        let second = store.execute(request(text, &[])).await.unwrap();
        assert_eq!(first.rows, second.rows);
        assert_eq!(store.execution_count(), 2);
    }

    struct CountingListener(AtomicUsize);

    impl GraphMutationListener for CountingListener {
        fn on_graph_mutated(&self) {
            self.0.fetch_add(1, AtomicOrdering::SeqCst);
        }
    }

    #[test]
    fn test_mutations_notify_listeners() -> anyhow::Result<()> {
        let store = store();
        let listener = Arc::new(CountingListener(AtomicUsize::new(0)));
        store.subscribe(listener.clone());

        store.add_node(GraphNode::new("f1", "Field").with_property("name", "items"))?;
        store.add_relationship("c1", "DECLARES", "f1")?;
        assert!(store.add_relationship("c1", "DECLARES", "missing").is_err());
        assert_eq!(listener.0.load(AtomicOrdering::SeqCst), 2);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.nodes.len(), 7);
        store.replace_snapshot(GraphSnapshot::default())?;
        assert_eq!(store.node_count(), 0);
        assert_eq!(listener.0.load(AtomicOrdering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_running_query() {
        let store = Arc::new(store().with_latency(Duration::from_millis(200)));
        let req = request("MATCH (n) RETURN n", &[]);
        let query_id = req.query_id.clone();

        let running = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.execute(req).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.cancel(&query_id).await);
        let err = running.await.unwrap().unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::Runtime);
        assert!(!store.cancel(&query_id).await);
    }

    #[test]
    fn test_tokenizer_handles_comments_and_literals() {
        let tokens = tokenize("MATCH (n) // trailing\nWHERE n.name = 'x' RETURN n /* done */").unwrap();
        assert!(tokens.contains(&Token::Word("WHERE".to_string())));
        assert!(!tokens.iter().any(|t| matches!(t, Token::Word(w) if w == "trailing")));
        let tokens = tokenize("[:CALLS*1..4]").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Sym("["),
                Token::Sym(":"),
                Token::Word("CALLS".to_string()),
                Token::Sym("*"),
                Token::Int(1),
                Token::Sym(".."),
                Token::Int(4),
                Token::Sym("]"),
            ]
        );
    }
}
