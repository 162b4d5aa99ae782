// Context Assembler & Ranker - graph rows to budgeted, line-accurate code context
// Rows are resolved node by node; a node whose source can't be located is
// skipped and counted, never fatal for the request.

use chrono::{DateTime, TimeZone, Utc};
use futures::stream::{self, StreamExt};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::contracts::{SourceLocation, SourceLocationResolver};
use crate::errors::QueryError;
use crate::observability::{log_operation, Operation, OperationContext};
use crate::types::{
    AssemblyStats, CodeContextItem, ContextBudget, GraphNode, GraphValue, NodeId, QueryResult,
    RankedContextSet, RequestDeadline, SizeUnit,
};

/// Source lookups in flight per assembly
const RESOLVE_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingConfig {
    /// Multiplier per node label; labels not listed use `default_weight`
    pub node_weights: BTreeMap<String, f32>,
    pub default_weight: f32,
    /// Base score of a node returned in the primary column
    pub direct_score: f32,
    /// Base score of any other node found in a row
    pub related_score: f32,
    /// Per-hop decay applied beyond the first hop
    pub transitive_decay: f32,
    /// Share of the score driven by recency, in `0.0..=1.0`
    pub recency_weight: f32,
    #[serde(with = "crate::config::duration_string")]
    pub recency_half_life: Duration,
    /// Items in one file overlapping by more than this share of the smaller span are merged
    pub max_overlap_fraction: f32,
    pub size_unit: SizeUnit,
    pub primary_column: String,
    pub hops_column: String,
    /// Node property holding a last-modified timestamp (epoch seconds or RFC 3339)
    pub recency_property: String,
}

impl Default for RankingConfig {
    fn default() -> Self {
        let node_weights = [
            ("Method", 1.0),
            ("Class", 0.9),
            ("Interface", 0.85),
            ("Field", 0.6),
            ("Package", 0.4),
        ]
        .into_iter()
        .map(|(label, weight)| (label.to_string(), weight))
        .collect();

        Self {
            node_weights,
            default_weight: 0.5,
            direct_score: 1.0,
            related_score: 0.6,
            transitive_decay: 0.7,
            recency_weight: 0.15,
            recency_half_life: Duration::from_secs(30 * 24 * 60 * 60),
            max_overlap_fraction: 0.5,
            size_unit: SizeUnit::Characters,
            primary_column: "node".to_string(),
            hops_column: "hops".to_string(),
            recency_property: "lastModified".to_string(),
        }
    }
}

impl RankingConfig {
    /// Largest weight among the node's labels
    pub fn weight_for(&self, node: &GraphNode) -> f32 {
        node.labels
            .iter()
            .filter_map(|label| self.node_weights.get(label).copied())
            .reduce(f32::max)
            .unwrap_or(self.default_weight)
    }

    /// Structural base score for a node found `hops` relationships away
    pub fn structural_score(&self, direct: bool, hops: Option<u32>) -> f32 {
        let base = if direct {
            self.direct_score
        } else {
            self.related_score
        };
        let extra_hops = hops.unwrap_or(1).saturating_sub(1);
        base * self.transitive_decay.powi(extra_hops as i32)
    }

    /// Recency in `0.0..=1.0`, halving every `recency_half_life`; 0.5 when unknown
    pub fn recency(&self, node: &GraphNode, now: DateTime<Utc>) -> f32 {
        let Some(modified) = self.modified_at(node) else {
            return 0.5;
        };
        let age = (now - modified).num_seconds().max(0) as f64;
        let half_life = self.recency_half_life.as_secs_f64().max(1.0);
        0.5_f64.powf(age / half_life) as f32
    }

    fn modified_at(&self, node: &GraphNode) -> Option<DateTime<Utc>> {
        let value = node.property(&self.recency_property)?;
        if let Some(secs) = value.as_i64() {
            return Utc.timestamp_opt(secs, 0).single();
        }
        value
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Final relevance: structure, node-type weight and recency combined
    pub fn score(&self, node: &GraphNode, direct: bool, hops: Option<u32>, now: DateTime<Utc>) -> f32 {
        let recency_weight = self.recency_weight.clamp(0.0, 1.0);
        let recency = self.recency(node, now);
        self.structural_score(direct, hops)
            * self.weight_for(node)
            * (1.0 - recency_weight + recency_weight * recency)
    }
}

/// A node picked out of the result rows, before source resolution
#[derive(Debug, Clone)]
struct ScoredNode {
    node: GraphNode,
    score: f32,
}

pub struct ContextAssembler {
    resolver: Arc<dyn SourceLocationResolver>,
    config: RankingConfig,
}

impl ContextAssembler {
    pub fn new(resolver: Arc<dyn SourceLocationResolver>, config: RankingConfig) -> Self {
        Self { resolver, config }
    }

    /// Budget of `limit` in the configured default size unit
    pub fn budget(&self, limit: usize) -> ContextBudget {
        ContextBudget {
            limit,
            unit: self.config.size_unit,
        }
    }

    pub fn config(&self) -> &RankingConfig {
        &self.config
    }

    /// Turn query rows into a ranked, de-duplicated and budgeted context set
    ///
    /// # Postconditions
    /// - Sum of emitted snippet sizes never exceeds `budget.limit`
    /// - `truncated` is set when a ranked item was left out for the budget
    /// - No two items in one file overlap beyond `max_overlap_fraction`
    #[instrument(skip(self, result, deadline), fields(rows = result.rows.len(), budget = budget.limit))]
    pub async fn assemble(
        &self,
        result: &QueryResult,
        budget: ContextBudget,
        deadline: &RequestDeadline,
    ) -> Result<RankedContextSet, QueryError> {
        self.assemble_at(result, budget, deadline, Utc::now()).await
    }

    /// [`ContextAssembler::assemble`] with an explicit clock for recency scoring
    pub async fn assemble_at(
        &self,
        result: &QueryResult,
        budget: ContextBudget,
        deadline: &RequestDeadline,
        now: DateTime<Utc>,
    ) -> Result<RankedContextSet, QueryError> {
        let ctx = OperationContext::new("context.assemble");
        let mut stats = AssemblyStats {
            rows_seen: result.rows.len(),
            ..AssemblyStats::default()
        };

        let candidates = self.collect_nodes(result, now);
        stats.nodes_seen = candidates.len();

        let resolved: Vec<_> = stream::iter(candidates)
            .map(|(id, scored)| async move {
                deadline.check("context assembly")?;
                let item = self.resolve_item(&scored).await;
                Ok::<_, QueryError>((id, item))
            })
            .buffered(RESOLVE_CONCURRENCY)
            .collect()
            .await;

        let mut items = Vec::with_capacity(resolved.len());
        for outcome in resolved {
            let (id, item) = outcome?;
            match item {
                Ok(item) => {
                    stats.resolved += 1;
                    items.push(item);
                }
                Err(e) => {
                    stats.unresolved += 1;
                    let reason = QueryError::UnresolvedLocation {
                        node_id: id.to_string(),
                    };
                    debug!("Skipping row: {} ({:#})", reason, e);
                }
            }
        }

        let (mut items, merged) = self.merge_overlapping(items).await;
        stats.merged = merged;

        items.sort_by(|a, b| {
            b.relevance_score
                .total_cmp(&a.relevance_score)
                .then_with(|| a.file_path.cmp(&b.file_path))
                .then_with(|| a.line_start.cmp(&b.line_start))
                .then_with(|| a.source_node_id.cmp(&b.source_node_id))
        });

        let unit = budget.unit;
        let mut set = RankedContextSet::empty(budget);
        let ranked = items.len();
        for item in items {
            let size = unit.measure(&item.snippet_text);
            if set.total_size + size > budget.limit {
                set.truncated = true;
                break;
            }
            set.total_size += size;
            set.items.push(item);
        }
        stats.dropped_by_budget = ranked - set.items.len();
        set.stats = stats;

        log_operation::<QueryError>(
            &ctx,
            &Operation::ContextAssemble {
                items: set.items.len(),
                unresolved: set.stats.unresolved,
                truncated: set.truncated,
            },
            Ok(()),
        );
        Ok(set)
    }

    /// Nodes referenced by the rows, keyed by id, keeping each node's best score
    fn collect_nodes(&self, result: &QueryResult, now: DateTime<Utc>) -> IndexMap<NodeId, ScoredNode> {
        let mut nodes: IndexMap<NodeId, ScoredNode> = IndexMap::new();
        for row in &result.rows {
            let hops = row
                .get(&self.config.hops_column)
                .and_then(GraphValue::as_i64)
                .and_then(|h| u32::try_from(h).ok());
            let has_primary = row.contains_key(&self.config.primary_column);

            for (column, value) in row {
                let direct = !has_primary || *column == self.config.primary_column;
                let mut found = Vec::new();
                collect_graph_nodes(value, &mut found);
                for node in found {
                    // Nodes nested in lists are context, not the match itself
                    let direct = direct && matches!(value, GraphValue::Node(_));
                    let score = self.config.score(node, direct, hops, now);
                    match nodes.get_mut(&node.id) {
                        Some(existing) if existing.score >= score => {}
                        Some(existing) => existing.score = score,
                        None => {
                            nodes.insert(
                                node.id.clone(),
                                ScoredNode {
                                    node: node.clone(),
                                    score,
                                },
                            );
                        }
                    }
                }
            }
        }
        nodes
    }

    async fn resolve_item(&self, scored: &ScoredNode) -> anyhow::Result<CodeContextItem> {
        let location = self
            .resolver
            .resolve(&scored.node)
            .await?
            .ok_or_else(|| anyhow::anyhow!("resolver returned no location"))?;
        let snippet_text = self.resolver.read_snippet(&location).await?;
        Ok(CodeContextItem {
            file_path: location.file_path,
            line_start: location.line_start,
            line_end: location.line_end,
            snippet_text,
            source_node_id: scored.node.id.clone(),
            relevance_score: scored.score,
            merged_node_ids: Vec::new(),
        })
    }

    /// Merge same-file items overlapping beyond the configured fraction until none remain
    async fn merge_overlapping(&self, mut items: Vec<CodeContextItem>) -> (Vec<CodeContextItem>, usize) {
        let mut merged = 0;
        while let Some((i, j)) = self.find_overlap(&items) {
            let second = items.remove(j);
            let first = items.remove(i);
            items.push(self.merge_pair(first, second).await);
            merged += 1;
        }
        (items, merged)
    }

    fn find_overlap(&self, items: &[CodeContextItem]) -> Option<(usize, usize)> {
        for i in 0..items.len() {
            for j in (i + 1)..items.len() {
                if exceeds_overlap(&items[i], &items[j], self.config.max_overlap_fraction) {
                    return Some((i, j));
                }
            }
        }
        None
    }

    async fn merge_pair(&self, a: CodeContextItem, b: CodeContextItem) -> CodeContextItem {
        let (mut keep, other) = if b.relevance_score > a.relevance_score {
            (b, a)
        } else {
            (a, b)
        };
        let union = SourceLocation::new(
            keep.file_path.clone(),
            keep.line_start.min(other.line_start),
            keep.line_end.max(other.line_end),
        );

        match self.resolver.read_snippet(&union).await {
            Ok(snippet) => {
                keep.line_start = union.line_start;
                keep.line_end = union.line_end;
                keep.snippet_text = snippet;
            }
            Err(e) => {
                // Keep the better span as-is; the other item is absorbed
                warn!(
                    "Failed to read merged span {}:{}-{}: {:#}",
                    union.file_path, union.line_start, union.line_end, e
                );
            }
        }
        keep.merged_node_ids.push(other.source_node_id);
        keep.merged_node_ids.extend(other.merged_node_ids);
        keep
    }
}

fn collect_graph_nodes<'a>(value: &'a GraphValue, out: &mut Vec<&'a GraphNode>) {
    match value {
        GraphValue::Node(node) => out.push(node),
        GraphValue::List(values) => values.iter().for_each(|v| collect_graph_nodes(v, out)),
        _ => {}
    }
}

fn exceeds_overlap(a: &CodeContextItem, b: &CodeContextItem, max_fraction: f32) -> bool {
    if a.file_path != b.file_path {
        return false;
    }
    let shared = SourceLocation::new(a.file_path.as_str(), a.line_start, a.line_end)
        .overlap(&SourceLocation::new(b.file_path.as_str(), b.line_start, b.line_end));
    if shared == 0 {
        return false;
    }
    let smaller = a.line_count().min(b.line_count()).max(1);
    shared as f32 / smaller as f32 > max_fraction
}
