// End-to-end tests for the query service over the fixture graph and source tree

mod common;

use anyhow::Result;
use coderag::{
    CacheStatus, CandidateOutcome, ContextBudget, EngineConfig, GraphNode, GraphQueryStatement,
    GraphValue, IntentTemplate, QueryError, RequestDeadline,
};
use common::{fixture, fixture_with};
use pretty_assertions::assert_eq;
use std::time::{Duration, Instant};

fn roomy() -> ContextBudget {
    ContextBudget::characters(8000)
}

#[test]
fn test_fixture_spans_fit_their_files() -> Result<()> {
    let graph: serde_json::Value = serde_json::from_str(common::GRAPH_JSON)?;
    let nodes = graph["nodes"].as_array().cloned().unwrap_or_default();
    for node in nodes {
        let props = &node["properties"];
        let Some(file) = props["file"].as_str() else {
            continue;
        };
        let source = match file {
            "src/OrderRepository.java" => common::REPOSITORY_SOURCE,
            "src/AuditLog.java" => common::AUDIT_SOURCE,
            other => anyhow::bail!("fixture node points at unknown file {other}"),
        };
        let end = props["endLine"].as_u64().unwrap_or(0) as usize;
        assert!(end <= source.lines().count(), "{} ends past {file}", node["id"]);
    }
    Ok(())
}

#[tokio::test]
async fn test_public_callers_of_save() -> Result<()> {
    let fx = fixture()?;
    let answer = fx
        .service
        .answer_prompt(
            "find all public methods that call save",
            roomy(),
            &RequestDeadline::unbounded(),
        )
        .await?;

    assert!(answer.is_answered());
    assert_eq!(answer.context.len(), 1);
    let item = &answer.context.items[0];
    assert_eq!(item.file_path, "src/OrderRepository.java");
    assert_eq!((item.line_start, item.line_end), (4, 6));
    assert!(item.snippet_text.contains("public void persist(Order order)"));
    assert_eq!(item.source_node_id.as_str(), "m1");
    assert_eq!(answer.candidates[0].template, IntentTemplate::FindByRelationship);
    Ok(())
}

#[tokio::test]
async fn test_passive_prompt_follows_edges_backwards() -> Result<()> {
    let fx = fixture()?;
    let answer = fx
        .service
        .answer_prompt("which methods are called by persist", roomy(), &RequestDeadline::unbounded())
        .await?;
    let ids: Vec<&str> = answer.context.items.iter().map(|i| i.source_node_id.as_str()).collect();
    assert_eq!(ids, vec!["m2"]);
    Ok(())
}

#[tokio::test]
async fn test_members_and_package_listing() -> Result<()> {
    let fx = fixture()?;
    let members = fx
        .service
        .answer_prompt(
            "show the methods of class OrderRepository",
            roomy(),
            &RequestDeadline::unbounded(),
        )
        .await?;
    let mut ids: Vec<&str> = members.context.items.iter().map(|i| i.source_node_id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["m1", "m2", "m3"]);

    let classes = fx
        .service
        .answer_prompt(
            "list classes in package com.acme.repo",
            roomy(),
            &RequestDeadline::unbounded(),
        )
        .await?;
    assert_eq!(classes.context.len(), 1);
    assert_eq!(
        (classes.context.items[0].line_start, classes.context.items[0].line_end),
        (3, 13)
    );
    Ok(())
}

#[tokio::test]
async fn test_tight_budget_truncates() -> Result<()> {
    let fx = fixture()?;
    let budget = ContextBudget::characters(80);
    let answer = fx
        .service
        .answer_prompt(
            "show the methods of class OrderRepository",
            budget,
            &RequestDeadline::unbounded(),
        )
        .await?;

    assert!(answer.context.truncated);
    assert!(answer.context.total_size <= 80);
    assert!(answer.context.len() < 3);
    assert_eq!(
        answer.context.stats.dropped_by_budget,
        3 - answer.context.len()
    );
    Ok(())
}

#[tokio::test]
async fn test_deleted_source_file_is_skipped() -> Result<()> {
    let fx = fixture()?;
    std::fs::remove_file(fx.source_root.path().join("src/AuditLog.java"))?;

    let answer = fx
        .service
        .answer_prompt("which methods call save", roomy(), &RequestDeadline::unbounded())
        .await?;
    assert_eq!(answer.context.len(), 1);
    assert_eq!(answer.context.items[0].source_node_id.as_str(), "m1");
    assert_eq!(answer.context.stats.unresolved, 1);
    Ok(())
}

#[tokio::test]
async fn test_write_statement_rejected_without_store_call() -> Result<()> {
    let fx = fixture()?;
    let statement = GraphQueryStatement::new("MATCH (n) DETACH DELETE n")?;
    let err = fx
        .service
        .execute_statement(&statement, &RequestDeadline::unbounded())
        .await
        .unwrap_err();

    match err {
        QueryError::ValidationRejected { violations } => assert!(!violations.is_empty()),
        other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(fx.store.execution_count(), 0);
    assert!(fx.service.cache().is_empty());
    assert_eq!(fx.store.node_count(), 6);
    Ok(())
}

#[tokio::test]
async fn test_timeout_returns_promptly_and_is_not_cached() -> Result<()> {
    let fx = fixture_with(EngineConfig::default(), Some(Duration::from_secs(3)))?;
    let statement =
        GraphQueryStatement::new("MATCH (m:Method) RETURN m")?.with_timeout(Duration::from_millis(200));

    let started = Instant::now();
    let err = fx
        .service
        .execute_statement(&statement, &RequestDeadline::unbounded())
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::ExecutionTimeout { timeout_ms: 200, .. }));
    assert!(started.elapsed() < Duration::from_millis(700));
    assert!(fx.service.cache().is_empty());
    assert!(err.is_retryable());
    Ok(())
}

#[tokio::test]
async fn test_prompt_timeout_on_last_candidate_surfaces() -> Result<()> {
    let mut config = EngineConfig::default();
    config.executor.default_timeout = Duration::from_millis(150);
    let fx = fixture_with(config, Some(Duration::from_secs(3)))?;

    let started = Instant::now();
    let err = fx
        .service
        .answer_prompt(
            "find all public methods that call save",
            roomy(),
            &RequestDeadline::unbounded(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::ExecutionTimeout { .. }));
    assert!(started.elapsed() < Duration::from_secs(2));
    Ok(())
}

#[tokio::test]
async fn test_request_deadline_bounds_execution() -> Result<()> {
    let fx = fixture_with(EngineConfig::default(), Some(Duration::from_secs(3)))?;
    let statement = GraphQueryStatement::new("MATCH (m:Method) RETURN m")?;

    let started = Instant::now();
    let err = fx
        .service
        .execute_statement(&statement, &RequestDeadline::within(Duration::from_millis(150)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        QueryError::ExecutionTimeout { .. } | QueryError::Cancelled { .. }
    ));
    assert!(started.elapsed() < Duration::from_millis(650));
    Ok(())
}

#[tokio::test]
async fn test_unmatched_prompt_explains() -> Result<()> {
    let fx = fixture()?;
    let answer = fx
        .service
        .answer_prompt("hello there", roomy(), &RequestDeadline::unbounded())
        .await?;
    assert!(answer.context.is_empty());
    assert!(answer.candidates.is_empty());
    assert!(answer.explanation.is_some());
    assert_eq!(fx.store.execution_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_cache_hits_until_graph_mutates() -> Result<()> {
    let fx = fixture()?;
    let prompt = "find all public methods that call save";
    let deadline = RequestDeadline::unbounded();

    let first = fx.service.answer_prompt(prompt, roomy(), &deadline).await?;
    let second = fx.service.answer_prompt(prompt, roomy(), &deadline).await?;
    assert_eq!(first.context, second.context);
    assert_eq!(fx.store.execution_count(), 1);
    assert!(matches!(
        second.candidates[0].outcome,
        CandidateOutcome::Accepted { cache: CacheStatus::Hit, .. }
    ));

    fx.store.add_node(
        GraphNode::new("m5", "Method")
            .with_property("name", "retry")
            .with_property("visibility", "PUBLIC"),
    )?;
    fx.store.add_relationship("m5", "CALLS", "m2")?;
    assert!(fx.service.cache().is_empty());

    let third = fx.service.answer_prompt(prompt, roomy(), &deadline).await?;
    assert_eq!(fx.store.execution_count(), 2);
    // m5 has no source span, so it is counted but not returned
    assert_eq!(third.context.len(), 1);
    assert_eq!(third.context.stats.unresolved, 1);
    Ok(())
}

#[tokio::test]
async fn test_grouped_count_prompt() -> Result<()> {
    let fx = fixture()?;
    let answer = fx
        .service
        .answer_prompt(
            "how many methods grouped by visibility",
            roomy(),
            &RequestDeadline::unbounded(),
        )
        .await?;
    assert!(answer.context.is_empty());

    let mut groups: Vec<(String, i64)> = answer
        .summary_rows
        .iter()
        .filter_map(|row| {
            let group = row.get("group")?.to_string();
            let total = row.get("total").and_then(GraphValue::as_i64)?;
            Some((group, total))
        })
        .collect();
    groups.sort();
    assert_eq!(
        groups,
        vec![("PRIVATE".to_string(), 2), ("PUBLIC".to_string(), 2)]
    );
    Ok(())
}
