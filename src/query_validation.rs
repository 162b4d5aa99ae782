// Query Validation Module - static safety and complexity gate for graph statements
// Runs before every cache lookup and again before every store dispatch.
// Pure: the verdict depends only on the statement and the configuration.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::types::GraphQueryStatement;

/// Write or destructive clauses. Matched on the raw text, literals included.
static WRITE_KEYWORDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(create|delete|detach|set|merge|remove|drop|foreach|load\s+csv)\b")
        .expect("Invalid write keyword pattern")
});

static PROCEDURE_CALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bcall\s+([A-Za-z_][A-Za-z0-9_.]*)").expect("Invalid procedure call pattern")
});

/// `-[...]-`, with either arrow head outside the match
static BRACKETED_RELATIONSHIP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-\[([^\]]*)\]-").expect("Invalid relationship pattern"));

/// `(a)--(b)`, `(a)-->(b)`, `(a)<--(b)`
static BARE_RELATIONSHIP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\)\s*(?:<-->|<--|-->|--)\s*\(").expect("Invalid bare relationship pattern")
});

static VARIABLE_LENGTH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\*\s*(?P<min>\d+)?\s*(?P<range>\.\.\s*(?P<max>\d+)?)?")
        .expect("Invalid variable length pattern")
});

/// `MATCH (n)` or `MATCH p = (n)`: a start node with no label or properties
static UNANCHORED_MATCH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bmatch\s+(?:[A-Za-z_]\w*\s*=\s*)?\(\s*(?:[A-Za-z_]\w*)?\s*\)")
        .expect("Invalid unanchored match pattern")
});

static MATCH_CLAUSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bmatch\b").expect("Invalid match clause pattern"));

static PARAMETER_REFERENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)").expect("Invalid parameter pattern"));

/// Validator limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Maximum traversal hops across all patterns in the statement
    pub max_hops: u32,
    /// Maximum unbounded pattern expansions (the cardinality heuristic)
    pub max_unbounded_expansions: u32,
    /// Maximum statement length in bytes
    pub max_statement_length: usize,
    /// Procedures that may be invoked with `CALL`
    pub allowed_procedures: Vec<String>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_hops: 6,
            max_unbounded_expansions: 3,
            max_statement_length: 8 * 1024,
            allowed_procedures: vec![
                "db.labels".to_string(),
                "db.relationshipTypes".to_string(),
                "db.propertyKeys".to_string(),
            ],
        }
    }
}

/// A single reason a statement was refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ViolationReason {
    /// The statement asked for write access in its options
    WritesNotPermitted,
    WriteOperation { keyword: String },
    DisallowedProcedure { name: String },
    TooManyHops { hops: u32, max_hops: u32 },
    CardinalityCeilingExceeded { unbounded_expansions: u32, ceiling: u32 },
    NonPrimitiveParameter { name: String },
    StatementTooLong { length: usize, max_length: usize },
}

impl fmt::Display for ViolationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViolationReason::WritesNotPermitted => write!(f, "write access is not permitted"),
            ViolationReason::WriteOperation { keyword } => {
                write!(f, "write operation '{keyword}' is not allowed")
            }
            ViolationReason::DisallowedProcedure { name } => {
                write!(f, "procedure '{name}' is not on the read-only allowlist")
            }
            ViolationReason::TooManyHops { hops, max_hops } => {
                write!(f, "{hops} traversal hops exceeds the maximum of {max_hops}")
            }
            ViolationReason::CardinalityCeilingExceeded {
                unbounded_expansions,
                ceiling,
            } => write!(
                f,
                "{unbounded_expansions} unbounded expansions exceeds the ceiling of {ceiling}"
            ),
            ViolationReason::NonPrimitiveParameter { name } => {
                write!(f, "parameter ${name} is not a primitive or list of primitives")
            }
            ViolationReason::StatementTooLong { length, max_length } => {
                write!(f, "statement length {length} exceeds {max_length} bytes")
            }
        }
    }
}

/// Outcome of validating one statement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub allowed: bool,
    pub violations: Vec<ViolationReason>,
    pub estimated_complexity: u32,
}

/// Structural measurements of a statement's patterns
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatternAnalysis {
    pub hops: u32,
    pub unbounded_expansions: u32,
    pub match_clauses: u32,
}

impl PatternAnalysis {
    pub fn complexity(&self) -> u32 {
        self.hops
            .saturating_add(self.unbounded_expansions.saturating_mul(10))
            .saturating_add(self.match_clauses)
    }
}

#[derive(Debug, Clone)]
pub struct QueryValidator {
    config: ValidatorConfig,
}

impl Default for QueryValidator {
    fn default() -> Self {
        Self::new(ValidatorConfig::default())
    }
}

impl QueryValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Check a statement against the safety and complexity rules
    ///
    /// Violations are reported in check order: write access, hops,
    /// cardinality, parameter types, then length.
    pub fn validate(&self, statement: &GraphQueryStatement) -> ValidationVerdict {
        let text = statement.text();
        let mut violations = Vec::new();

        // (a) write and destructive operations
        if statement.options().allow_writes {
            violations.push(ViolationReason::WritesNotPermitted);
        }
        for keyword in write_keywords(text) {
            violations.push(ViolationReason::WriteOperation { keyword });
        }
        for name in self.disallowed_procedures(text) {
            violations.push(ViolationReason::DisallowedProcedure { name });
        }

        // (b) traversal depth and (c) cardinality, on code only
        let analysis = analyze_patterns(text);
        if analysis.hops > self.config.max_hops {
            violations.push(ViolationReason::TooManyHops {
                hops: analysis.hops,
                max_hops: self.config.max_hops,
            });
        }
        if analysis.unbounded_expansions > self.config.max_unbounded_expansions {
            violations.push(ViolationReason::CardinalityCeilingExceeded {
                unbounded_expansions: analysis.unbounded_expansions,
                ceiling: self.config.max_unbounded_expansions,
            });
        }

        // (d) parameter types
        for (name, value) in statement.parameters() {
            if !value.is_primitive_or_list() {
                violations.push(ViolationReason::NonPrimitiveParameter { name: name.clone() });
            }
        }

        if text.len() > self.config.max_statement_length {
            violations.push(ViolationReason::StatementTooLong {
                length: text.len(),
                max_length: self.config.max_statement_length,
            });
        }

        let verdict = ValidationVerdict {
            allowed: violations.is_empty(),
            violations,
            estimated_complexity: analysis.complexity(),
        };
        debug!(
            allowed = verdict.allowed,
            complexity = verdict.estimated_complexity,
            violations = verdict.violations.len(),
            "Validated statement"
        );
        verdict
    }

    fn disallowed_procedures(&self, text: &str) -> Vec<String> {
        let code = strip_literals(text);
        let mut names: Vec<String> = Vec::new();
        for captures in PROCEDURE_CALL.captures_iter(&code) {
            let name = captures[1].to_string();
            let allowed = self
                .config
                .allowed_procedures
                .iter()
                .any(|p| p.eq_ignore_ascii_case(&name));
            if !allowed && !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }
}

/// Distinct write keywords in order of first appearance, upper-cased
fn write_keywords(text: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for m in WRITE_KEYWORDS.find_iter(text) {
        let keyword = m
            .as_str()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_uppercase();
        if !found.contains(&keyword) {
            found.push(keyword);
        }
    }
    found
}

/// Count hops, unbounded expansions and MATCH clauses, ignoring literals and comments
pub fn analyze_patterns(text: &str) -> PatternAnalysis {
    let code = strip_literals(text);
    let mut analysis = PatternAnalysis::default();

    for captures in BRACKETED_RELATIONSHIP.captures_iter(&code) {
        let detail = &captures[1];
        match VARIABLE_LENGTH.captures(detail) {
            None => analysis.hops += 1,
            Some(range) => {
                let min = range
                    .name("min")
                    .and_then(|m| m.as_str().parse::<u32>().ok());
                let max = range
                    .name("max")
                    .and_then(|m| m.as_str().parse::<u32>().ok());
                match (range.name("range").is_some(), min, max) {
                    // `*a..b` and `*..b`
                    (true, _, Some(max)) => analysis.hops = analysis.hops.saturating_add(max),
                    // `*n`
                    (false, Some(exact), _) => {
                        analysis.hops = analysis.hops.saturating_add(exact)
                    }
                    // `*` and `*a..`
                    (_, min, None) => {
                        analysis.hops = analysis.hops.saturating_add(min.unwrap_or(1).max(1));
                        analysis.unbounded_expansions += 1;
                    }
                    // a bare upper bound without `..` reads as an exact length
                    (false, None, Some(exact)) => {
                        analysis.hops = analysis.hops.saturating_add(exact)
                    }
                }
            }
        }
    }

    analysis.hops += BARE_RELATIONSHIP.find_iter(&code).count() as u32;
    analysis.unbounded_expansions += UNANCHORED_MATCH.find_iter(&code).count() as u32;
    analysis.match_clauses = MATCH_CLAUSE.find_iter(&code).count() as u32;
    analysis
}

/// Names of `$parameters` referenced outside literals and comments, in order
pub fn referenced_parameters(text: &str) -> Vec<String> {
    let code = strip_literals(text);
    let mut names: Vec<String> = Vec::new();
    for captures in PARAMETER_REFERENCE.captures_iter(&code) {
        let name = captures[1].to_string();
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// Lexical pieces of a statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Segment<'a> {
    Code(&'a str),
    /// Quoted string including its quotes
    Literal(&'a str),
    Comment,
}

/// Split a statement into code, string literals and comments
pub(crate) fn segments(text: &str) -> Vec<Segment<'_>> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"') => {
                if start < i {
                    out.push(Segment::Code(&text[start..i]));
                }
                let mut j = i + 1;
                while j < bytes.len() {
                    if bytes[j] == b'\\' {
                        j += 2;
                        continue;
                    }
                    if bytes[j] == quote {
                        break;
                    }
                    j += 1;
                }
                let end = (j + 1).min(bytes.len());
                out.push(Segment::Literal(&text[i..end]));
                i = end;
                start = end;
            }
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                if start < i {
                    out.push(Segment::Code(&text[start..i]));
                }
                let end = text[i..].find('\n').map_or(bytes.len(), |p| i + p);
                out.push(Segment::Comment);
                i = end;
                start = end;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                if start < i {
                    out.push(Segment::Code(&text[start..i]));
                }
                let end = text[i + 2..]
                    .find("*/")
                    .map_or(bytes.len(), |p| i + 2 + p + 2);
                out.push(Segment::Comment);
                i = end;
                start = end;
            }
            _ => i += 1,
        }
    }
    if start < bytes.len() {
        out.push(Segment::Code(&text[start..]));
    }
    out
}

/// Replace string literals with `''` and comments with a space
pub(crate) fn strip_literals(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for segment in segments(text) {
        match segment {
            Segment::Code(code) => out.push_str(code),
            Segment::Literal(_) => out.push_str("''"),
            Segment::Comment => out.push(' '),
        }
    }
    out
}
