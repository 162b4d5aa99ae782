// Source location resolvers: graph node -> file span -> snippet text

use anyhow::{bail, ensure, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use crate::contracts::{SourceLocation, SourceLocationResolver};
use crate::types::GraphNode;

/// Lines `line_start..=line_end` (1-based) of `text`, joined with `\n`
pub fn slice_lines(text: &str, location: &SourceLocation) -> Result<String> {
    ensure!(location.line_start >= 1, "Line numbers start at 1");
    ensure!(
        location.line_start <= location.line_end,
        "{} span {}..{} is inverted",
        location.file_path,
        location.line_start,
        location.line_end
    );
    let total = text.lines().count();
    ensure!(
        (location.line_end as usize) <= total,
        "{} has {} lines, span ends at {}",
        location.file_path,
        total,
        location.line_end
    );
    Ok(text
        .lines()
        .skip(location.line_start as usize - 1)
        .take(location.span() as usize)
        .collect::<Vec<_>>()
        .join("\n"))
}

/// Resolver backed by in-memory maps, for tests and embedded use
#[derive(Debug, Clone, Default)]
pub struct StaticSourceResolver {
    locations: HashMap<String, SourceLocation>,
    files: HashMap<String, String>,
}

impl StaticSourceResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.insert(path.into(), content.into());
        self
    }

    pub fn with_location(mut self, node_id: impl Into<String>, location: SourceLocation) -> Self {
        self.locations.insert(node_id.into(), location);
        self
    }
}

#[async_trait]
impl SourceLocationResolver for StaticSourceResolver {
    async fn resolve(&self, node: &GraphNode) -> Result<Option<SourceLocation>> {
        Ok(self.locations.get(node.id.as_str()).cloned())
    }

    async fn read_snippet(&self, location: &SourceLocation) -> Result<String> {
        let text = self
            .files
            .get(&location.file_path)
            .with_context(|| format!("No source registered for {}", location.file_path))?;
        slice_lines(text, location)
    }
}

/// Resolver reading span properties off graph nodes and text from disk
///
/// Nodes carry `file`, `startLine` and `endLine` properties written at
/// ingestion time. Files are read relative to `root`; paths escaping it are
/// refused.
#[derive(Debug, Clone)]
pub struct GraphSourceResolver {
    root: PathBuf,
    file_property: String,
    start_property: String,
    end_property: String,
}

impl GraphSourceResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            file_property: "file".to_string(),
            start_property: "startLine".to_string(),
            end_property: "endLine".to_string(),
        }
    }

    pub fn with_properties(mut self, file: &str, start: &str, end: &str) -> Self {
        self.file_property = file.to_string();
        self.start_property = start.to_string();
        self.end_property = end.to_string();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, relative: &str) -> Result<PathBuf> {
        let path = Path::new(relative);
        for component in path.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => bail!("Source path '{}' escapes the source root", relative),
            }
        }
        Ok(self.root.join(path))
    }
}

#[async_trait]
impl SourceLocationResolver for GraphSourceResolver {
    async fn resolve(&self, node: &GraphNode) -> Result<Option<SourceLocation>> {
        let Some(file) = node.property_str(&self.file_property) else {
            return Ok(None);
        };
        let start = node.property_i64(&self.start_property).unwrap_or(1);
        let end = node.property_i64(&self.end_property).unwrap_or(start);
        let (Ok(start), Ok(end)) = (u32::try_from(start), u32::try_from(end)) else {
            return Ok(None);
        };
        if start == 0 {
            return Ok(None);
        }

        // Backing file deleted since ingestion
        if !tokio::fs::try_exists(self.full_path(file)?).await.unwrap_or(false) {
            debug!("Source file {} no longer exists", file);
            return Ok(None);
        }
        Ok(Some(SourceLocation::new(file, start, end)))
    }

    async fn read_snippet(&self, location: &SourceLocation) -> Result<String> {
        let path = self.full_path(&location.file_path)?;
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        slice_lines(&text, location)
    }
}
