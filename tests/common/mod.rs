// Shared fixtures: a small order-service graph and the source tree it points at
#![allow(dead_code)]

use anyhow::Result;
use coderag::{
    EngineConfig, GraphSourceResolver, InMemoryGraphStore, QueryService, QueryServiceBuilder,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const REPOSITORY_SOURCE: &str = "\
package com.acme.repo;

public class OrderRepository {
    public void persist(Order order) {
        save(order);
    }

    public void save(Order order) {
        store.put(order.id(), order);
    }

    private void flush() {}
}
";

pub const AUDIT_SOURCE: &str = "\
package com.acme.audit;

class AuditLog {
    private void audit(Order order) {
        repository.save(order);
    }
}
";

pub const GRAPH_JSON: &str = r#"{
  "nodes": [
    {"id": "p1", "labels": ["Package"], "properties": {"name": "com.acme.repo"}},
    {"id": "c1", "labels": ["Class"], "properties": {
      "name": "OrderRepository", "package": "com.acme.repo", "visibility": "PUBLIC",
      "file": "src/OrderRepository.java", "startLine": 3, "endLine": 13}},
    {"id": "m1", "labels": ["Method"], "properties": {
      "name": "persist", "visibility": "PUBLIC", "returnType": "void",
      "file": "src/OrderRepository.java", "startLine": 4, "endLine": 6}},
    {"id": "m2", "labels": ["Method"], "properties": {
      "name": "save", "visibility": "PUBLIC", "returnType": "void",
      "file": "src/OrderRepository.java", "startLine": 8, "endLine": 10}},
    {"id": "m3", "labels": ["Method"], "properties": {
      "name": "flush", "visibility": "PRIVATE", "returnType": "void",
      "file": "src/OrderRepository.java", "startLine": 12, "endLine": 12}},
    {"id": "m4", "labels": ["Method"], "properties": {
      "name": "audit", "visibility": "PRIVATE", "returnType": "void",
      "file": "src/AuditLog.java", "startLine": 4, "endLine": 6}}
  ],
  "edges": [
    {"from": "p1", "to": "c1", "type": "CONTAINS"},
    {"from": "c1", "to": "m1", "type": "DECLARES"},
    {"from": "c1", "to": "m2", "type": "DECLARES"},
    {"from": "c1", "to": "m3", "type": "DECLARES"},
    {"from": "m1", "to": "m2", "type": "CALLS"},
    {"from": "m4", "to": "m2", "type": "CALLS"}
  ]
}"#;

/// Service over the fixture graph plus the temp dir holding its sources
pub struct Fixture {
    pub service: Arc<QueryService>,
    pub store: Arc<InMemoryGraphStore>,
    pub source_root: TempDir,
}

pub fn source_tree() -> Result<TempDir> {
    let dir = tempfile::tempdir()?;
    std::fs::create_dir_all(dir.path().join("src"))?;
    std::fs::write(dir.path().join("src/OrderRepository.java"), REPOSITORY_SOURCE)?;
    std::fs::write(dir.path().join("src/AuditLog.java"), AUDIT_SOURCE)?;
    Ok(dir)
}

pub fn fixture() -> Result<Fixture> {
    fixture_with(EngineConfig::default(), None)
}

/// Fixture whose store sleeps `latency` before evaluating each statement
pub fn fixture_with(config: EngineConfig, latency: Option<Duration>) -> Result<Fixture> {
    let source_root = source_tree()?;
    let mut store = InMemoryGraphStore::from_json(GRAPH_JSON)?;
    if let Some(latency) = latency {
        store = store.with_latency(latency);
    }
    let store = Arc::new(store);
    let resolver = Arc::new(GraphSourceResolver::new(source_root.path()));
    let service = QueryServiceBuilder::new(store.clone(), resolver)
        .config(config)
        .build()?;
    store.subscribe(service.mutation_listener());

    Ok(Fixture {
        service: Arc::new(service),
        store,
        source_root,
    })
}
