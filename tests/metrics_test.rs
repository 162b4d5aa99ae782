// Engine metrics - the process-wide cache gauge follows the service's cache

mod common;

use anyhow::Result;
use coderag::observability::get_metrics;
use coderag::{GraphQueryStatement, RequestDeadline};
use common::fixture;

fn cache_entries() -> u64 {
    get_metrics()["cache"]["entries"].as_u64().unwrap_or(u64::MAX)
}

#[tokio::test]
async fn test_cache_entries_gauge_tracks_fills_and_invalidation() -> Result<()> {
    let fx = fixture()?;
    for name in ["persist", "save"] {
        let statement = GraphQueryStatement::new("MATCH (m:Method {name: $name}) RETURN m")?
            .with_param("name", name)?;
        fx.service
            .execute_statement(&statement, &RequestDeadline::unbounded())
            .await?;
    }
    assert_eq!(cache_entries(), 2);

    fx.service.invalidate_cache();
    assert_eq!(cache_entries(), 0);

    let metrics = get_metrics();
    assert!(metrics["requests"]["total"].as_u64().unwrap_or(0) >= 2);
    Ok(())
}
