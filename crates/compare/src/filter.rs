//! Composable row filters for comparison results.

use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use serde::{Deserialize, Serialize};

use manifold_core::Record;

use crate::ComparisonResult;

/// One independent row test. Each reads the left record when present,
/// otherwise the right one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Predicate {
    /// Fuzzy match against `kind/namespace/name`.
    Search { text: String },
    Namespace { namespace: String },
    Kind { kind: String },
    /// `value: None` only requires the key.
    Label { key: String, value: Option<String> },
    Annotation { key: String, value: Option<String> },
}

impl Predicate {
    /// Parse `k=v` (or a bare `k`) into a label predicate.
    pub fn label(spec: &str) -> Self {
        let (key, value) = split_pair(spec);
        Predicate::Label { key, value }
    }

    pub fn annotation(spec: &str) -> Self {
        let (key, value) = split_pair(spec);
        Predicate::Annotation { key, value }
    }

    fn test(&self, record: &Record, matcher: &SkimMatcherV2) -> bool {
        match self {
            Predicate::Search { text } => {
                if text.is_empty() { return true; }
                let hay = format!("{}/{}/{}", record.kind, record.effective_namespace(), record.name);
                matcher.fuzzy_match(&hay, text).is_some()
            }
            Predicate::Namespace { namespace } => record.effective_namespace() == namespace,
            Predicate::Kind { kind } => record.kind.eq_ignore_ascii_case(kind),
            Predicate::Label { key, value } => has_pair(record.labels().iter(), key, value.as_deref()),
            Predicate::Annotation { key, value } => has_pair(record.annotations().iter(), key, value.as_deref()),
        }
    }
}

fn split_pair(spec: &str) -> (String, Option<String>) {
    match spec.split_once('=') {
        Some((k, v)) => (k.trim().to_string(), Some(v.trim().to_string())),
        None => (spec.trim().to_string(), None),
    }
}

fn has_pair<'a>(mut pairs: impl Iterator<Item = &'a (String, String)>, key: &str, value: Option<&str>) -> bool {
    pairs.any(|(k, v)| k == key && value.map(|want| want == v).unwrap_or(true))
}

/// All predicates must hold (logical AND). An empty pipeline keeps every row.
pub struct FilterPipeline {
    predicates: Vec<Predicate>,
    matcher: SkimMatcherV2,
}

impl Default for FilterPipeline {
    fn default() -> Self { Self::new() }
}

impl std::fmt::Debug for FilterPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterPipeline").field("predicates", &self.predicates).finish()
    }
}

impl FilterPipeline {
    pub fn new() -> Self { Self { predicates: Vec::new(), matcher: SkimMatcherV2::default() } }

    pub fn with(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn push(&mut self, predicate: Predicate) { self.predicates.push(predicate); }
    pub fn is_empty(&self) -> bool { self.predicates.is_empty() }
    pub fn predicates(&self) -> &[Predicate] { &self.predicates }

    pub fn keeps(&self, row: &ComparisonResult<'_>) -> bool {
        let Some(record) = row.primary() else { return false };
        self.predicates.iter().all(|p| p.test(record, &self.matcher))
    }

    pub fn apply<'a>(&self, rows: Vec<ComparisonResult<'a>>) -> Vec<ComparisonResult<'a>> {
        if self.predicates.is_empty() { return rows; }
        rows.into_iter().filter(|row| self.keeps(row)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_spec_splits_on_first_equals() {
        assert_eq!(Predicate::label("app=web"), Predicate::Label { key: "app".into(), value: Some("web".into()) });
        assert_eq!(Predicate::label("tier"), Predicate::Label { key: "tier".into(), value: None });
        assert_eq!(
            Predicate::annotation("a=b=c"),
            Predicate::Annotation { key: "a".into(), value: Some("b=c".into()) }
        );
    }
}
