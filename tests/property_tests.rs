// Property-Based Testing - validator, cache keys and context ranking
// Generated inputs probe the invariants each stage promises.

use coderag::context_assembler::ContextAssembler;
use coderag::query_cache::cache_key;
use coderag::types::ExecutionStats;
use coderag::{
    ContextBudget, GraphNode, GraphQueryStatement, GraphValue, QueryResult, QueryValidator,
    RankingConfig, Record, RequestDeadline, SourceLocation, StaticSourceResolver,
};
use proptest::prelude::*;
use std::sync::Arc;

mod strategies {
    use super::*;

    pub fn write_keyword() -> impl Strategy<Value = &'static str> {
        prop::sample::select(vec![
            "CREATE", "MERGE", "DELETE", "DETACH DELETE", "SET", "REMOVE", "DROP",
        ])
    }

    /// Randomize the case of each letter
    pub fn mixed_case(word: &'static str) -> impl Strategy<Value = String> {
        prop::collection::vec(any::<bool>(), word.len()).prop_map(move |flags| {
            word.chars()
                .zip(flags)
                .map(|(c, upper)| {
                    if upper {
                        c.to_ascii_uppercase()
                    } else {
                        c.to_ascii_lowercase()
                    }
                })
                .collect()
        })
    }

    pub fn whitespace() -> impl Strategy<Value = String> {
        prop::string::string_regex(r"[ \t\n]{1,4}").unwrap()
    }

    /// (snippet line count, node weight label) per node
    pub fn nodes() -> impl Strategy<Value = Vec<(u32, &'static str)>> {
        prop::collection::vec(
            (1u32..8, prop::sample::select(vec!["Method", "Class", "Field", "Interface"])),
            1..12,
        )
    }
}

const BASE_TOKENS: &[&str] = &[
    "MATCH", "(s:Method)-[:CALLS]->(o:Method)", "WHERE", "o.name", "=", "$object", "RETURN",
    "DISTINCT", "s", "AS", "node", "LIMIT", "$limit",
];

fn node_rows(nodes: &[(u32, &'static str)]) -> (QueryResult, StaticSourceResolver) {
    let mut resolver = StaticSourceResolver::new();
    let mut rows = Vec::new();
    for (i, (lines, label)) in nodes.iter().enumerate() {
        let id = format!("n{i}");
        let file = format!("src/File{i}.java");
        let content: String = (1..=*lines).map(|l| format!("line {l} of {file}\n")).collect();
        resolver = resolver
            .with_file(file.clone(), content)
            .with_location(id.clone(), SourceLocation::new(file, 1, *lines));

        let mut row = Record::new();
        row.insert("node".to_string(), GraphValue::Node(GraphNode::new(id, label)));
        rows.push(row);
    }
    (
        QueryResult::new(rows, 1, None, ExecutionStats::default()),
        resolver,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn write_keywords_are_always_rejected(
        keyword in strategies::write_keyword().prop_flat_map(strategies::mixed_case),
        prefix_label in "[A-Z][a-z]{2,8}",
    ) {
        let text = format!("MATCH (n:{prefix_label}) {keyword} n RETURN n");
        let statement = GraphQueryStatement::new(text).unwrap();
        let verdict = QueryValidator::default().validate(&statement);
        prop_assert!(!verdict.allowed);
        prop_assert!(!verdict.violations.is_empty());
    }

    #[test]
    fn cache_key_ignores_whitespace_and_param_order(
        gaps in prop::collection::vec(strategies::whitespace(), BASE_TOKENS.len() + 1),
        object in "[a-z]{1,12}",
        limit in 1i64..500,
        reversed in any::<bool>(),
    ) {
        let compact = BASE_TOKENS.join(" ");
        let mut spaced = gaps[0].clone();
        for (token, gap) in BASE_TOKENS.iter().zip(&gaps[1..]) {
            spaced.push_str(token);
            spaced.push_str(gap);
        }

        let a = GraphQueryStatement::new(compact).unwrap()
            .with_param("object", object.as_str()).unwrap()
            .with_param("limit", limit).unwrap();
        let b = if reversed {
            GraphQueryStatement::new(spaced).unwrap()
                .with_param("limit", limit).unwrap()
                .with_param("object", object.as_str()).unwrap()
        } else {
            GraphQueryStatement::new(spaced).unwrap()
                .with_param("object", object.as_str()).unwrap()
                .with_param("limit", limit).unwrap()
        };
        prop_assert_eq!(cache_key(&a), cache_key(&b));

        let c = a.clone().with_param("object", format!("{object}x")).unwrap();
        prop_assert_ne!(cache_key(&a), cache_key(&c));
    }

    #[test]
    fn assembled_context_respects_budget_and_order(
        nodes in strategies::nodes(),
        limit in 0usize..600,
    ) {
        let (result, resolver) = node_rows(&nodes);
        let assembler = ContextAssembler::new(Arc::new(resolver), RankingConfig::default());
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let set = runtime
            .block_on(assembler.assemble(&result, ContextBudget::characters(limit), &RequestDeadline::unbounded()))
            .unwrap();

        prop_assert!(set.total_size <= limit);
        let measured: usize = set.items.iter().map(|i| i.snippet_text.chars().count()).sum();
        prop_assert_eq!(measured, set.total_size);
        prop_assert_eq!(set.items.len() + set.stats.dropped_by_budget, nodes.len());
        prop_assert_eq!(set.truncated, set.stats.dropped_by_budget > 0);
        for pair in set.items.windows(2) {
            prop_assert!(pair[0].relevance_score >= pair[1].relevance_score);
        }
    }
}
