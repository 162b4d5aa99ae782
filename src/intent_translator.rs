//! Intent translation: free-text prompts to parameterized graph statements
//!
//! Prompts are matched against a fixed catalog of intent templates using
//! keyword and pattern extraction, for example:
//! - "find all public methods that call save"
//! - "what eventually calls flush"
//! - "list classes in package com.acme.repo"
//! - "count methods grouped by visibility"
//!
//! User text never reaches a statement body. Every extracted value is bound
//! through a parameter, and the optional [`SlotFiller`] only ever produces
//! [`IntentSlots`], which are checked against a closed schema before the same
//! renderers turn them into statements.

use anyhow::{bail, ensure, Context};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::contracts::SlotFiller;
use crate::errors::QueryError;
use crate::observability::{log_operation, Operation, OperationContext};
use crate::query_validation::referenced_parameters;
use crate::types::{
    Constraint, FilterAttribute, GraphQueryStatement, IntentSlots, NodeKind, ParamValue,
    Predicate, RelationDirection, RequestDeadline, SlotSchema, StatementOptions,
};

static VISIBILITY_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(public|private|protected|package[- ]private)\b")
        .expect("Invalid visibility pattern")
});

static SUBJECT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(methods?|functions?|procedures?|members?|classes|class|types?|interfaces?|fields?|attributes?|properties|property|packages?|modules?|namespaces?)\b",
    )
    .expect("Invalid subject pattern")
});

/// "what does X call", with the object before the verb
static REVERSE_QUESTION_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\bwhat\s+does\s+["'`]?([A-Za-z_*][\w.$*]*)["'`]?\s+(call|invoke|use|extend|implement|override)\b"#)
        .expect("Invalid reverse question pattern")
});

/// Relationship phrases, passive forms first
static RELATION_PATTERNS: Lazy<Vec<(Regex, Predicate, RelationDirection)>> = Lazy::new(|| {
    use Predicate::*;
    use RelationDirection::*;
    [
        (r"(?i)\b(?:called|invoked)\s+by\b", Calls, Incoming),
        (r"(?i)\b(?:extended|subclassed|inherited)\s+by\b", Extends, Incoming),
        (r"(?i)\bimplemented\s+by\b", Implements, Incoming),
        (r"(?i)\b(?:used|referenced)\s+by\b", Uses, Incoming),
        (r"(?i)\boverridden\s+by\b", Overrides, Incoming),
        (r"(?i)\b(?:calls?|invokes?|calling|invoking)\b", Calls, Outgoing),
        (
            r"(?i)\b(?:extends?|extending|inherits?\s+from|subclass(?:es)?\s+of)\b",
            Extends,
            Outgoing,
        ),
        (r"(?i)\b(?:implements?|implementing)\b", Implements, Outgoing),
        (
            r"(?i)\b(?:uses?|using|depends?\s+on|references?|referencing)\b",
            Uses,
            Outgoing,
        ),
        (r"(?i)\b(?:overrides?|overriding)\b", Overrides, Outgoing),
    ]
    .into_iter()
    .map(|(pattern, predicate, direction)| {
        (
            Regex::new(pattern).expect("Invalid relation pattern"),
            predicate,
            direction,
        )
    })
    .collect()
});

static PACKAGE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\bpackage\s+["'`]?([A-Za-z_][\w.]*)"#).expect("Invalid package pattern")
});

static OWNER_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\b(?:of|in|on|inside|within|from|declared\s+in|defined\s+in)\s+(?:the\s+)?(?:class|interface|type)\s+["'`]?([A-Za-z_][\w$]*)"#,
    )
    .expect("Invalid owner pattern")
});

static POSSESSIVE_OWNER_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b([A-Z][\w$]*)'s\s+(?:methods|fields|members|functions)\b")
        .expect("Invalid possessive owner pattern")
});

static GROUP_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:grouped\s+by|group\s+by|broken\s+down\s+by|per|by)\s+(visibility|package|return\s+type|name)\b")
        .expect("Invalid group pattern")
});

static COUNT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:count|how\s+many|number\s+of)\b").expect("Invalid count pattern")
});

static TRANSITIVE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:transitively|indirectly|eventually|ultimately|recursively)\b")
        .expect("Invalid transitive pattern")
});

static DEPTH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:within|up\s+to|at\s+most)\s+(\d+)\s+(?:hops?|levels?|steps?)\b")
        .expect("Invalid depth pattern")
});

static LIMIT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:top|first|limit(?:\s+to)?)\s+(\d+)\b").expect("Invalid limit pattern")
});

static NAME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(named|called|matching|starting\s+with|ending\s+with|containing)\s+["'`]?([A-Za-z_*$][\w.$*]*)"#)
        .expect("Invalid name pattern")
});

static RETURN_TYPE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\breturn(?:s|ing)?\s+(?:an?\s+|the\s+)?["'`]?([A-Za-z_][\w.$<>\[\]]*)"#)
        .expect("Invalid return type pattern")
});

static QUOTED_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"["'`]([A-Za-z_*$][\w.$*]{0,127})["'`]"#).expect("Invalid quoted pattern")
});

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_*$][A-Za-z0-9_.$*]*$").expect("Invalid identifier pattern")
});

static TYPE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_$][A-Za-z0-9_.$<>\[\], ]*$").expect("Invalid type name pattern")
});

/// Words skipped when looking for the object of a relationship phrase
const OBJECT_STOP_WORDS: &[&str] = &[
    "the", "a", "an", "any", "all", "some", "to", "of", "on", "into", "from", "method",
    "methods", "function", "functions", "class", "classes", "interface", "interfaces", "field",
    "fields", "type", "named", "called", "directly", "transitively", "indirectly", "eventually",
    "ultimately", "recursively", "something",
];

/// Tokens after a relationship verb that are never an object name
const NON_OBJECT_WORDS: &[&str] = &[
    "by", "and", "or", "with", "in", "that", "which", "who", "what", "where", "is", "are",
];

const VISIBILITY_VALUES: &[&str] = &["PUBLIC", "PRIVATE", "PROTECTED", "PACKAGE"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslatorConfig {
    /// Below this, the slot filler is consulted
    pub confidence_threshold: f32,
    pub max_candidates: usize,
    pub default_limit: usize,
    pub max_limit: usize,
    pub max_prompt_length: usize,
    pub default_depth: u32,
    pub max_depth: u32,
    /// Ceiling on the confidence of slot-filler candidates
    pub filler_confidence_cap: f32,
    pub max_identifier_length: usize,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.6,
            max_candidates: 3,
            default_limit: 25,
            max_limit: 200,
            max_prompt_length: 2000,
            default_depth: 3,
            max_depth: 5,
            filler_confidence_cap: 0.55,
            max_identifier_length: 128,
        }
    }
}

/// A prompt that passed basic input checks, with normalized whitespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedPrompt {
    text: String,
}

impl ValidatedPrompt {
    pub fn new(raw: &str, max_length: usize) -> anyhow::Result<Self> {
        ensure!(!raw.contains('\0'), "Prompt contains null bytes");
        ensure!(
            raw.chars().count() <= max_length,
            "Prompt exceeds maximum length of {} characters",
            max_length
        );
        let text = raw
            .chars()
            .map(|c| if c.is_control() { ' ' } else { c })
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        ensure!(!text.is_empty(), "Prompt cannot be empty");
        Ok(Self { text })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

/// A relationship phrase found in a prompt
#[derive(Debug, Clone, PartialEq)]
struct RelationMatch {
    predicate: Predicate,
    direction: RelationDirection,
    object: Option<String>,
}

/// Everything the pattern extractors found in one prompt
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptFeatures {
    subject: Option<NodeKind>,
    visibility: Option<&'static str>,
    relation: Option<RelationMatch>,
    package: Option<String>,
    owner: Option<String>,
    name: Option<Constraint>,
    return_type: Option<String>,
    group_by: Option<FilterAttribute>,
    count: bool,
    transitive: bool,
    depth: Option<u32>,
    limit: Option<usize>,
    quoted: Vec<String>,
}

impl PromptFeatures {
    pub fn extract(prompt: &ValidatedPrompt) -> Self {
        let text = prompt.as_str();
        let mut features = PromptFeatures {
            quoted: QUOTED_PATTERN
                .captures_iter(text)
                .map(|c| c[1].to_string())
                .collect(),
            ..PromptFeatures::default()
        };

        // Spans of qualifier phrases; subject nouns inside them don't count
        let mut qualifier_spans = Vec::new();

        if let Some(c) = VISIBILITY_PATTERN.captures(text) {
            features.visibility = Some(match c[1].to_lowercase().as_str() {
                "public" => "PUBLIC",
                "private" => "PRIVATE",
                "protected" => "PROTECTED",
                _ => "PACKAGE",
            });
            if let Some(m) = c.get(0) {
                qualifier_spans.push(m.range());
            }
        }

        if let Some(c) = PACKAGE_PATTERN.captures(text) {
            let name = trim_identifier(&c[1]);
            let lowered = name.to_lowercase();
            if !matches!(lowered.as_str(), "private" | "level" | "visibility" | "") {
                features.package = Some(name);
                if let Some(m) = c.get(0) {
                    qualifier_spans.push(m.range());
                }
            }
        }
        if let Some(c) = OWNER_PATTERN
            .captures(text)
            .or_else(|| POSSESSIVE_OWNER_PATTERN.captures(text))
        {
            features.owner = Some(trim_identifier(&c[1]));
            if let Some(m) = c.get(0) {
                // Possessive form names the subject inside the match ("Foo's methods")
                if !m.as_str().contains("'s ") {
                    qualifier_spans.push(m.range());
                }
            }
        }

        features.subject = SUBJECT_PATTERN
            .find_iter(text)
            .filter(|m| !qualifier_spans.iter().any(|span| span.contains(&m.start())))
            .find_map(|m| subject_kind(m.as_str()));

        features.relation = extract_relation(text);

        if let Some(c) = NAME_PATTERN.captures(text) {
            let value = trim_identifier(&c[2]);
            if !value.eq_ignore_ascii_case("by") && !value.is_empty() {
                let verb = c[1].to_lowercase();
                features.name = Some(if verb.starts_with("starting") {
                    Constraint::StartsWith(value)
                } else if verb.starts_with("ending") {
                    Constraint::EndsWith(value)
                } else if verb == "containing" {
                    Constraint::Contains(value)
                } else {
                    Constraint::from_pattern(&value)
                });
            }
        }

        if let Some(c) = RETURN_TYPE_PATTERN.captures(text) {
            let value = trim_identifier(&c[1]);
            if !matches!(value.to_lowercase().as_str(), "type" | "value" | "") {
                features.return_type = Some(value);
            }
        }

        features.group_by = GROUP_PATTERN.captures(text).map(|c| {
            match c[1].to_lowercase().split_whitespace().collect::<String>().as_str() {
                "visibility" => FilterAttribute::Visibility,
                "package" => FilterAttribute::Package,
                "returntype" => FilterAttribute::ReturnType,
                _ => FilterAttribute::Name,
            }
        });
        features.count = COUNT_PATTERN.is_match(text);
        features.transitive = TRANSITIVE_PATTERN.is_match(text);
        features.depth = DEPTH_PATTERN
            .captures(text)
            .and_then(|c| c[1].parse::<u32>().ok());
        features.limit = LIMIT_PATTERN
            .captures(text)
            .and_then(|c| c[1].parse::<usize>().ok());

        features
    }

    fn has_filters(&self) -> bool {
        self.visibility.is_some()
            || self.name.is_some()
            || self.return_type.is_some()
            || !self.quoted.is_empty()
    }

    /// Attribute filters shared by every template
    fn filters(&self, include_package: bool) -> BTreeMap<FilterAttribute, Constraint> {
        let mut filters = BTreeMap::new();
        if let Some(name) = &self.name {
            filters.insert(FilterAttribute::Name, name.clone());
        }
        if let Some(visibility) = self.visibility {
            filters.insert(
                FilterAttribute::Visibility,
                Constraint::Equals(visibility.to_string()),
            );
        }
        if include_package {
            if let Some(package) = &self.package {
                filters.insert(FilterAttribute::Package, Constraint::from_pattern(package));
            }
        }
        if let Some(return_type) = &self.return_type {
            filters.insert(
                FilterAttribute::ReturnType,
                Constraint::Equals(return_type.clone()),
            );
        }
        filters
    }
}

fn subject_kind(word: &str) -> Option<NodeKind> {
    let word = word.to_lowercase();
    let kind = match word.as_str() {
        "method" | "methods" | "function" | "functions" | "procedure" | "procedures"
        | "member" | "members" => NodeKind::Method,
        "class" | "classes" | "type" | "types" => NodeKind::Class,
        "interface" | "interfaces" => NodeKind::Interface,
        "field" | "fields" | "attribute" | "attributes" | "property" | "properties" => {
            NodeKind::Field
        }
        "package" | "packages" | "module" | "modules" | "namespace" | "namespaces" => {
            NodeKind::Package
        }
        _ => return None,
    };
    Some(kind)
}

fn trim_identifier(raw: &str) -> String {
    raw.trim_matches(|c: char| matches!(c, '"' | '\'' | '`' | '?' | '!' | ',' | ';' | ':'))
        .trim_end_matches('.')
        .trim_end_matches("()")
        .to_string()
}

fn extract_relation(text: &str) -> Option<RelationMatch> {
    if let Some(c) = REVERSE_QUESTION_PATTERN.captures(text) {
        let predicate = match c[2].to_lowercase().as_str() {
            "call" | "invoke" => Predicate::Calls,
            "use" => Predicate::Uses,
            "extend" => Predicate::Extends,
            "implement" => Predicate::Implements,
            _ => Predicate::Overrides,
        };
        return Some(RelationMatch {
            predicate,
            direction: RelationDirection::Incoming,
            object: Some(trim_identifier(&c[1])),
        });
    }

    RELATION_PATTERNS
        .iter()
        .find_map(|(pattern, predicate, direction)| {
            pattern.find(text).map(|m| RelationMatch {
                predicate: *predicate,
                direction: *direction,
                object: object_after(&text[m.end()..]),
            })
        })
}

/// First identifier after a relationship verb, skipping filler words
fn object_after(rest: &str) -> Option<String> {
    for token in rest.split_whitespace() {
        let lowered = token.to_lowercase();
        let bare = lowered.trim_matches(|c: char| !c.is_alphanumeric());
        if OBJECT_STOP_WORDS.contains(&bare) {
            continue;
        }
        if NON_OBJECT_WORDS.contains(&bare) {
            return None;
        }
        let candidate = trim_identifier(token);
        return IDENTIFIER.is_match(&candidate).then_some(candidate);
    }
    None
}

/// Catalog of intent templates, in tie-break order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentTemplate {
    /// find {visibility} {subjectKind} that {predicate} {object}
    FindByRelationship,
    /// find {subjectKind} that transitively {predicate} {object}
    FindTransitive,
    /// list {subjectKind} in package {name}
    ListInPackage,
    /// {subjectKind} of class {name}
    MembersOf,
    /// find {subjectKind} named {name}
    FindByName,
    /// count {subjectKind} grouped by {attribute}
    CountGrouped,
}

impl IntentTemplate {
    pub const CATALOG: [IntentTemplate; 6] = [
        IntentTemplate::FindByRelationship,
        IntentTemplate::FindTransitive,
        IntentTemplate::ListInPackage,
        IntentTemplate::MembersOf,
        IntentTemplate::FindByName,
        IntentTemplate::CountGrouped,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            IntentTemplate::FindByRelationship => "find_by_relationship",
            IntentTemplate::FindTransitive => "find_transitive",
            IntentTemplate::ListInPackage => "list_in_package",
            IntentTemplate::MembersOf => "members_of",
            IntentTemplate::FindByName => "find_by_name",
            IntentTemplate::CountGrouped => "count_grouped",
        }
    }

    /// Slots and confidence for this template, if the prompt fits it at all
    fn interpret(&self, features: &PromptFeatures, config: &TranslatorConfig) -> Option<(IntentSlots, f32)> {
        let aggregate = features.count || features.group_by.is_some();
        match self {
            IntentTemplate::FindByRelationship | IntentTemplate::FindTransitive => {
                let relation = features.relation.as_ref()?;
                let object = relation.object.clone()?;
                let transitive = features.transitive || features.depth.is_some();

                let subject = features
                    .subject
                    .unwrap_or_else(|| default_subject(relation.predicate, relation.direction));
                let mut slots = IntentSlots::new(subject)
                    .with_predicate(relation.predicate, relation.direction)
                    .with_object(object);
                slots.filters = features.filters(true);
                slots.limit = features.limit;

                let mut confidence = 0.75;
                if features.subject.is_some() {
                    confidence += 0.1;
                }
                if !slots.filters.is_empty() {
                    confidence += 0.05;
                }

                if *self == IntentTemplate::FindTransitive {
                    if !transitive {
                        return None;
                    }
                    slots.depth = Some(
                        features
                            .depth
                            .unwrap_or(config.default_depth)
                            .clamp(1, config.max_depth),
                    );
                    confidence = 0.9 + if features.subject.is_some() { 0.05 } else { 0.0 };
                } else if transitive {
                    // Direct relationships only: a narrower fallback for transitive prompts
                    confidence = 0.6;
                }
                Some((slots, confidence))
            }
            IntentTemplate::ListInPackage => {
                if features.relation.is_some() || aggregate {
                    return None;
                }
                let package = features.package.clone()?;
                let subject = match features.subject {
                    Some(NodeKind::Package) | None => NodeKind::Class,
                    Some(kind) => kind,
                };
                let mut slots = IntentSlots::new(subject)
                    .with_predicate(Predicate::Contains, RelationDirection::Incoming)
                    .with_object(package);
                slots.filters = features.filters(false);
                slots.limit = features.limit;
                Some((slots, 0.85))
            }
            IntentTemplate::MembersOf => {
                if features.relation.is_some() || aggregate {
                    return None;
                }
                let owner = features.owner.clone()?;
                let subject = match features.subject {
                    Some(kind @ (NodeKind::Method | NodeKind::Field)) => kind,
                    _ => NodeKind::Method,
                };
                let mut slots = IntentSlots::new(subject)
                    .with_predicate(Predicate::Declares, RelationDirection::Incoming)
                    .with_object(owner);
                slots.filters = features.filters(true);
                slots.limit = features.limit;
                Some((slots, 0.85))
            }
            IntentTemplate::FindByName => {
                if features.relation.is_some() || aggregate || !features.has_filters() {
                    return None;
                }
                let mut slots = IntentSlots::new(features.subject.unwrap_or(NodeKind::Method));
                slots.filters = features.filters(true);
                if !slots.filters.contains_key(&FilterAttribute::Name) {
                    if let Some(quoted) = features.quoted.first() {
                        slots
                            .filters
                            .insert(FilterAttribute::Name, Constraint::from_pattern(quoted));
                    }
                }
                slots.limit = features.limit;

                let mut confidence = 0.65;
                if features.subject.is_some() {
                    confidence += 0.1;
                }
                if slots.filters.contains_key(&FilterAttribute::Name) {
                    confidence += 0.1;
                }
                Some((slots, confidence))
            }
            IntentTemplate::CountGrouped => {
                if features.relation.is_some() || !aggregate {
                    return None;
                }
                let mut slots = IntentSlots::new(features.subject.unwrap_or(NodeKind::Method));
                slots.filters = features.filters(true);
                slots.group_by = features.group_by;
                slots.count = true;
                slots.limit = features.limit;
                let confidence = if features.count && features.group_by.is_some() {
                    0.9
                } else {
                    0.8
                };
                Some((slots, confidence))
            }
        }
    }

    /// Which template renders a given set of slots
    pub fn classify(slots: &IntentSlots) -> Option<IntentTemplate> {
        if slots.count || slots.group_by.is_some() {
            return slots.predicate.is_none().then_some(IntentTemplate::CountGrouped);
        }
        match (slots.predicate, slots.object.is_some()) {
            (Some(Predicate::Contains), true) => Some(IntentTemplate::ListInPackage),
            (Some(Predicate::Declares), true) => Some(IntentTemplate::MembersOf),
            (Some(_), true) if slots.depth.is_some() => Some(IntentTemplate::FindTransitive),
            (Some(_), true) => Some(IntentTemplate::FindByRelationship),
            (None, _) if !slots.filters.is_empty() => Some(IntentTemplate::FindByName),
            _ => None,
        }
    }

    /// Render slots into a parameterized statement
    ///
    /// Pure: identical slots and options always yield an identical statement.
    /// Slot values are only ever bound as parameters.
    pub fn render(
        &self,
        slots: &IntentSlots,
        options: &StatementOptions,
        config: &TranslatorConfig,
    ) -> anyhow::Result<GraphQueryStatement> {
        let subject = slots.subject_kind.label();
        let mut params: Vec<(String, ParamValue)> = Vec::new();
        let mut conditions: Vec<String> = Vec::new();

        let pattern = match self {
            IntentTemplate::FindByRelationship | IntentTemplate::FindTransitive => {
                let predicate = slots
                    .predicate
                    .context("Relationship template requires a predicate")?;
                let object = slots
                    .object
                    .as_deref()
                    .context("Relationship template requires an object")?;
                push_condition(&mut conditions, &mut params, "o.name", "object", object);

                let hops = if *self == IntentTemplate::FindTransitive {
                    let depth = slots.depth.unwrap_or(config.default_depth);
                    ensure!(
                        (1..=config.max_depth).contains(&depth),
                        "Traversal depth {} outside 1..={}",
                        depth,
                        config.max_depth
                    );
                    format!("*1..{depth}")
                } else {
                    String::new()
                };
                let object_node = match object_kind(slots.subject_kind, predicate, slots.direction) {
                    Some(kind) => format!("(o:{})", kind.label()),
                    None => "(o)".to_string(),
                };
                let relationship = match slots.direction {
                    RelationDirection::Outgoing => format!("-[:{}{hops}]->", predicate.rel_type()),
                    RelationDirection::Incoming => format!("<-[:{}{hops}]-", predicate.rel_type()),
                };
                if *self == IntentTemplate::FindTransitive {
                    format!("p = (s:{subject}){relationship}{object_node}")
                } else {
                    format!("(s:{subject}){relationship}{object_node}")
                }
            }
            IntentTemplate::ListInPackage => {
                let package = slots
                    .object
                    .as_deref()
                    .context("Package listing requires a package name")?;
                if matches!(slots.subject_kind, NodeKind::Class | NodeKind::Interface) {
                    push_condition(&mut conditions, &mut params, "o.name", "package", package);
                    format!("(s:{subject})<-[:CONTAINS]-(o:Package)")
                } else {
                    push_condition(&mut conditions, &mut params, "s.package", "package", package);
                    format!("(s:{subject})")
                }
            }
            IntentTemplate::MembersOf => {
                let owner = slots
                    .object
                    .as_deref()
                    .context("Member listing requires an owner name")?;
                push_condition(&mut conditions, &mut params, "o.name", "owner", owner);
                format!("(s:{subject})<-[:DECLARES]-(o)")
            }
            IntentTemplate::FindByName => {
                ensure!(!slots.filters.is_empty(), "Name lookup requires at least one filter");
                format!("(s:{subject})")
            }
            IntentTemplate::CountGrouped => format!("(s:{subject})"),
        };

        for (attribute, constraint) in &slots.filters {
            if *self == IntentTemplate::ListInPackage && *attribute == FilterAttribute::Package {
                continue;
            }
            let property = format!("s.{}", attribute.property());
            conditions.push(format!(
                "{property} {} ${}",
                constraint.operator(),
                attribute.param_name()
            ));
            params.push((
                attribute.param_name().to_string(),
                ParamValue::String(constraint.value().to_string()),
            ));
        }

        let limit = slots
            .limit
            .unwrap_or(config.default_limit)
            .clamp(1, config.max_limit)
            .min(options.result_limit.max(1));

        let mut text = format!("MATCH {pattern}");
        if !conditions.is_empty() {
            text.push_str(" WHERE ");
            text.push_str(&conditions.join(" AND "));
        }
        match self {
            IntentTemplate::FindTransitive => {
                text.push_str(" RETURN DISTINCT s AS node, length(p) AS hops ORDER BY hops, node.name LIMIT $limit");
            }
            IntentTemplate::CountGrouped => match slots.group_by {
                Some(attribute) => text.push_str(&format!(
                    " RETURN s.{} AS group, count(s) AS total ORDER BY total DESC, group LIMIT $limit",
                    attribute.property()
                )),
                None => text.push_str(" RETURN count(s) AS total"),
            },
            _ => text.push_str(" RETURN DISTINCT s AS node ORDER BY node.name LIMIT $limit"),
        }

        let mut statement = GraphQueryStatement::new(text)?.with_options(options.clone());
        for (name, value) in params {
            statement = statement.with_param(name, value)?;
        }
        if statement.text().contains("$limit") {
            statement = statement.with_param("limit", limit)?;
        }
        Ok(statement)
    }
}

fn push_condition(
    conditions: &mut Vec<String>,
    params: &mut Vec<(String, ParamValue)>,
    property: &str,
    param: &str,
    pattern: &str,
) {
    let constraint = Constraint::from_pattern(pattern);
    conditions.push(format!("{property} {} ${param}", constraint.operator()));
    params.push((param.to_string(), ParamValue::String(constraint.value().to_string())));
}

fn default_subject(predicate: Predicate, direction: RelationDirection) -> NodeKind {
    match (predicate, direction) {
        (Predicate::Extends, _) | (Predicate::Implements, RelationDirection::Outgoing) => {
            NodeKind::Class
        }
        (Predicate::Implements, RelationDirection::Incoming) => NodeKind::Interface,
        (Predicate::Contains, _) => NodeKind::Class,
        _ => NodeKind::Method,
    }
}

/// Label of the node on the far side of a relationship, when it is implied
fn object_kind(subject: NodeKind, predicate: Predicate, direction: RelationDirection) -> Option<NodeKind> {
    match (predicate, direction) {
        (Predicate::Calls | Predicate::Overrides, _) => Some(NodeKind::Method),
        (Predicate::Extends, _) => Some(subject),
        (Predicate::Implements, RelationDirection::Outgoing) => Some(NodeKind::Interface),
        (Predicate::Implements, RelationDirection::Incoming) => Some(NodeKind::Class),
        (Predicate::Contains, RelationDirection::Incoming) => Some(NodeKind::Package),
        _ => None,
    }
}

/// Where a candidate's slots came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotSource {
    PatternMatch,
    SlotFiller,
}

/// One rendered statement with its confidence
#[derive(Debug, Clone, PartialEq)]
pub struct TranslatedCandidate {
    pub template: IntentTemplate,
    pub slots: IntentSlots,
    pub statement: GraphQueryStatement,
    pub confidence: f32,
    pub source: SlotSource,
}

/// Per-request inputs to translation
#[derive(Debug, Clone, Default)]
pub struct TranslationContext {
    /// Options given to every rendered statement
    pub options: StatementOptions,
    pub deadline: RequestDeadline,
}

pub struct IntentTranslator {
    config: TranslatorConfig,
    slot_filler: Option<Arc<dyn SlotFiller>>,
}

impl Default for IntentTranslator {
    fn default() -> Self {
        Self::new(TranslatorConfig::default())
    }
}

impl IntentTranslator {
    pub fn new(config: TranslatorConfig) -> Self {
        Self {
            config,
            slot_filler: None,
        }
    }

    pub fn with_slot_filler(mut self, filler: Arc<dyn SlotFiller>) -> Self {
        self.slot_filler = Some(filler);
        self
    }

    pub fn config(&self) -> &TranslatorConfig {
        &self.config
    }

    /// Closed vocabulary the slot filler must answer within
    pub fn schema(&self) -> SlotSchema {
        SlotSchema {
            subject_kinds: NodeKind::ALL.to_vec(),
            predicates: Predicate::ALL.to_vec(),
            filter_attributes: FilterAttribute::ALL.to_vec(),
            max_identifier_length: self.config.max_identifier_length,
            max_limit: self.config.max_limit,
            max_depth: self.config.max_depth,
        }
    }

    /// Translate a prompt into candidate statements, best first
    ///
    /// Equal confidences keep catalog order. Fails with `NoMatchingIntent`
    /// when neither pattern matching nor the slot filler yields a candidate.
    #[instrument(skip(self, context))]
    pub async fn translate(
        &self,
        prompt: &str,
        context: &TranslationContext,
    ) -> Result<Vec<TranslatedCandidate>, QueryError> {
        let ctx = OperationContext::new("prompt.translate");
        let prompt = ValidatedPrompt::new(prompt, self.config.max_prompt_length)
            .map_err(|e| QueryError::invalid_input("prompt", e))?;
        context.deadline.check("translation")?;

        let features = PromptFeatures::extract(&prompt);
        debug!("Extracted prompt features: {:?}", features);

        let mut candidates: Vec<TranslatedCandidate> = IntentTemplate::CATALOG
            .iter()
            .filter_map(|template| {
                let (slots, confidence) = template.interpret(&features, &self.config)?;
                self.candidate(*template, slots, confidence, SlotSource::PatternMatch, &context.options)
            })
            .collect();

        let best = candidates.iter().map(|c| c.confidence).fold(0.0_f32, f32::max);
        if best < self.config.confidence_threshold {
            if let Some(filler) = &self.slot_filler {
                context.deadline.check("slot filling")?;
                match self.fill_with(filler.as_ref(), &prompt, &context.options).await {
                    Ok(Some(candidate)) => candidates.push(candidate),
                    Ok(None) => debug!("Slot filler output matched no template"),
                    Err(e) => warn!("Discarding slot filler output: {:#}", e),
                }
            }
        }

        // Stable sort: ties stay in catalog order
        candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        candidates.truncate(self.config.max_candidates);

        log_operation::<QueryError>(
            &ctx,
            &Operation::PromptTranslate {
                candidates: candidates.len(),
            },
            Ok(()),
        );

        if candidates.is_empty() {
            return Err(QueryError::NoMatchingIntent {
                reason: format!(
                    "no intent template matched \"{}\"",
                    truncate_for_report(prompt.as_str())
                ),
            });
        }
        Ok(candidates)
    }

    fn candidate(
        &self,
        template: IntentTemplate,
        slots: IntentSlots,
        confidence: f32,
        source: SlotSource,
        options: &StatementOptions,
    ) -> Option<TranslatedCandidate> {
        let statement = match template.render(&slots, options, &self.config) {
            Ok(statement) => statement,
            Err(e) => {
                warn!("Template {} failed to render: {:#}", template.name(), e);
                return None;
            }
        };
        // Well-formedness: every placeholder must be bound
        let unbound: Vec<String> = referenced_parameters(statement.text())
            .into_iter()
            .filter(|name| !statement.parameters().contains_key(name))
            .collect();
        if !unbound.is_empty() {
            warn!("Template {} left parameters unbound: {:?}", template.name(), unbound);
            return None;
        }
        Some(TranslatedCandidate {
            template,
            slots,
            statement,
            confidence: confidence.clamp(0.0, 1.0),
            source,
        })
    }

    async fn fill_with(
        &self,
        filler: &dyn SlotFiller,
        prompt: &ValidatedPrompt,
        options: &StatementOptions,
    ) -> anyhow::Result<Option<TranslatedCandidate>> {
        let schema = self.schema();
        let slots = filler.fill_slots(prompt.as_str(), &schema).await?;
        let slots = sanitize_filled_slots(slots, &schema)?;
        let Some(template) = IntentTemplate::classify(&slots) else {
            return Ok(None);
        };
        let confidence = self
            .config
            .filler_confidence_cap
            .min(self.config.confidence_threshold);
        Ok(self.candidate(template, slots, confidence, SlotSource::SlotFiller, options))
    }
}

/// Check untrusted slots against the schema's closed vocabularies and limits
pub fn sanitize_filled_slots(mut slots: IntentSlots, schema: &SlotSchema) -> anyhow::Result<IntentSlots> {
    ensure!(
        schema.subject_kinds.contains(&slots.subject_kind),
        "Subject kind {:?} is not allowed",
        slots.subject_kind
    );
    if let Some(predicate) = slots.predicate {
        ensure!(
            schema.predicates.contains(&predicate),
            "Predicate {:?} is not allowed",
            predicate
        );
    }
    if let Some(object) = &slots.object {
        check_identifier(object, schema.max_identifier_length)?;
    }

    for (attribute, constraint) in slots.filters.iter_mut() {
        ensure!(
            schema.filter_attributes.contains(attribute),
            "Filter attribute {:?} is not allowed",
            attribute
        );
        match attribute {
            FilterAttribute::Visibility => {
                let upper = constraint.value().to_uppercase();
                ensure!(
                    VISIBILITY_VALUES.contains(&upper.as_str()),
                    "Unknown visibility '{}'",
                    constraint.value()
                );
                *constraint = Constraint::Equals(upper);
            }
            FilterAttribute::ReturnType => {
                let value = constraint.value();
                ensure!(
                    !value.is_empty()
                        && value.len() <= schema.max_identifier_length
                        && TYPE_NAME.is_match(value),
                    "Return type '{}' is not a type name",
                    value
                );
            }
            FilterAttribute::Name | FilterAttribute::Package => {
                check_identifier(constraint.value(), schema.max_identifier_length)?;
            }
        }
    }
    if let Some(group_by) = slots.group_by {
        ensure!(
            schema.filter_attributes.contains(&group_by),
            "Grouping attribute {:?} is not allowed",
            group_by
        );
    }
    if let Some(depth) = slots.depth {
        ensure!(
            (1..=schema.max_depth).contains(&depth),
            "Depth {} outside 1..={}",
            depth,
            schema.max_depth
        );
    }
    if let Some(limit) = slots.limit {
        ensure!(limit >= 1, "Limit must be positive");
        slots.limit = Some(limit.min(schema.max_limit));
    }
    Ok(slots)
}

fn check_identifier(value: &str, max_length: usize) -> anyhow::Result<()> {
    if value.is_empty() || value.len() > max_length {
        bail!("Identifier length {} outside 1..={}", value.len(), max_length);
    }
    ensure!(IDENTIFIER.is_match(value), "'{}' is not an identifier", value);
    Ok(())
}

fn truncate_for_report(prompt: &str) -> String {
    if prompt.chars().count() > 80 {
        let mut head: String = prompt.chars().take(77).collect();
        head.push_str("...");
        head
    } else {
        prompt.to_string()
    }
}
