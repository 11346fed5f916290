use std::collections::{BTreeMap, HashSet};

use glob::{MatchOptions, Pattern};
use serde::{Serialize, Serializer};

use crate::{Category, ConfigurationError, Criticality, Rule, RuleRecord};

/// Which files a rule looks at.
///
/// A pattern containing `/` is matched against the whole relative path. A bare
/// pattern (`README.md`, `*.yaml`) also matches by file name anywhere in the tree.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    patterns: Vec<String>,
    compiled: Vec<Pattern>,
}

impl Scope {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn compile(rule_id: &str, patterns: &[String]) -> Result<Self, ConfigurationError> {
        let patterns: Vec<String> = patterns
            .iter()
            .map(|p| normalize_path(p.trim()).to_string())
            .filter(|p| !p.is_empty())
            .collect();
        let compiled = patterns
            .iter()
            .map(|p| {
                Pattern::new(p).map_err(|source| ConfigurationError::InvalidScope {
                    rule: rule_id.to_string(),
                    pattern: p.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns, compiled })
    }

    pub fn is_all(&self) -> bool {
        self.compiled.is_empty()
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn matches(&self, path: &str) -> bool {
        if self.is_all() {
            return true;
        }
        let path = normalize_path(path);
        let file_name = path.rsplit('/').next().unwrap_or(path);
        let strict = MatchOptions {
            require_literal_separator: true,
            ..MatchOptions::new()
        };
        self.patterns.iter().zip(&self.compiled).any(|(raw, pattern)| {
            pattern.matches_with(path, strict)
                || (!raw.contains('/') && pattern.matches_with(file_name, strict))
        })
    }
}

impl Serialize for Scope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(&self.patterns)
    }
}

fn normalize_path(path: &str) -> &str {
    path.trim_start_matches("./").trim_start_matches('/')
}

pub fn parse_category(value: &str) -> Option<Category> {
    match value.trim().to_lowercase().as_str() {
        "structural" | "structure" | "estructura" => Some(Category::Structural),
        "content" | "contenido" | "contenidos" => Some(Category::Content),
        "semantic" | "semantica" | "semántica" | "semántico" => Some(Category::Semantic),
        _ => None,
    }
}

pub fn parse_criticality(value: &str) -> Option<Criticality> {
    match value.trim().to_lowercase().as_str() {
        "high" | "alta" | "critical" => Some(Criticality::High),
        "medium" | "media" => Some(Criticality::Medium),
        "low" | "baja" => Some(Criticality::Low),
        _ => None,
    }
}

fn required(
    value: Option<String>,
    index: usize,
    field: &'static str,
) -> Result<String, ConfigurationError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(ConfigurationError::MissingField { index, field })
}

/// Validate a single record. `index` is its position in the source list and
/// only used for error messages.
pub fn rule_from_record(index: usize, record: RuleRecord) -> Result<Rule, ConfigurationError> {
    let id = required(record.id, index, "id")?;
    let description = required(record.description, index, "description")?;

    let raw_category = required(record.category, index, "category")?;
    let category = parse_category(&raw_category).ok_or_else(|| ConfigurationError::UnknownCategory {
        rule: id.clone(),
        value: raw_category,
    })?;

    let raw_criticality = required(record.criticality, index, "criticality")?;
    let criticality =
        parse_criticality(&raw_criticality).ok_or_else(|| ConfigurationError::UnknownCriticality {
            rule: id.clone(),
            value: raw_criticality,
        })?;

    let scope = Scope::compile(&id, &record.scope)?;

    Ok(Rule {
        id,
        description,
        category,
        criticality,
        scope,
        explanation: record.explanation.filter(|e| !e.trim().is_empty()),
    })
}

/// Validated rules grouped for model selection and consolidation.
#[derive(Debug, Clone, Default)]
pub struct Classification {
    pub rules: Vec<Rule>,
    pub by_category: BTreeMap<Category, Vec<String>>,
    pub by_criticality: BTreeMap<Criticality, Vec<String>>,
}

impl Classification {
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn ids_in(&self, criticality: Criticality) -> &[String] {
        self.by_criticality
            .get(&criticality)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn ids_of(&self, category: Category) -> &[String] {
        self.by_category
            .get(&category)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Turn raw records into rules. Any malformed record fails the whole set.
pub fn classify(records: Vec<RuleRecord>) -> Result<Classification, ConfigurationError> {
    let mut seen = HashSet::new();
    let mut out = Classification::default();

    for (index, record) in records.into_iter().enumerate() {
        let rule = rule_from_record(index, record)?;
        if !seen.insert(rule.id.clone()) {
            return Err(ConfigurationError::DuplicateRule(rule.id));
        }
        out.by_category
            .entry(rule.category)
            .or_default()
            .push(rule.id.clone());
        out.by_criticality
            .entry(rule.criticality)
            .or_default()
            .push(rule.id.clone());
        out.rules.push(rule);
    }

    Ok(out)
}
