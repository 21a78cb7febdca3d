use serde::{Deserialize, Serialize};

use manifold_core::RefKind;

use crate::path::PropertyPath;

/// How the target namespace of a reference is determined.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(tag = "mode", content = "property", rename_all = "kebab-case")]
pub enum NamespaceMode {
    /// Namespace plays no part in matching.
    None,
    /// Target lives in the source record's namespace.
    #[default]
    Implicit,
    /// A sibling property of the source value names the namespace; unresolved if absent.
    Explicit(String),
    /// Like `Explicit`, falling back to `Implicit` when the property is absent.
    OptionalExplicit(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MatcherKind {
    /// Source value equals the value at the target path.
    #[default]
    Equals,
    /// Source mapping is a subset of the label map at the target path.
    LabelSelector,
    /// Source value is a file or folder path relative to the source's file.
    RelativePath,
}

/// Only apply the rule to values whose sibling `property` equals `equals`
/// (e.g. `roleRef.kind == ClusterRole`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Guard {
    pub property: String,
    pub equals: String,
}

/// Declarative rule as written in the builtin table or a rule file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefMapperSpec {
    pub id: String,
    pub source_kind: String,
    pub source_path: String,
    pub target_kind: String,
    #[serde(default)]
    pub target_path: Option<String>,
    #[serde(default)]
    pub matcher: MatcherKind,
    pub ref_kind: RefKind,
    #[serde(default)]
    pub namespace: NamespaceMode,
    #[serde(default)]
    pub guard: Option<Guard>,
    /// Id of the reciprocal rule that must confirm a match from the target side.
    #[serde(default)]
    pub pair: Option<String>,
}

impl RefMapperSpec {
    pub fn new(id: impl Into<String>, source_kind: &str, source_path: &str, target_kind: &str, ref_kind: RefKind) -> Self {
        Self {
            id: id.into(),
            source_kind: source_kind.into(),
            source_path: source_path.into(),
            target_kind: target_kind.into(),
            target_path: Some("metadata.name".into()),
            matcher: MatcherKind::Equals,
            ref_kind,
            namespace: NamespaceMode::Implicit,
            guard: None,
            pair: None,
        }
    }

    pub fn target_path(mut self, path: &str) -> Self {
        self.target_path = Some(path.into());
        self
    }

    pub fn selector(mut self, target_path: &str) -> Self {
        self.matcher = MatcherKind::LabelSelector;
        self.target_path = Some(target_path.into());
        self
    }

    pub fn relative_path(mut self) -> Self {
        self.matcher = MatcherKind::RelativePath;
        self.target_path = None;
        self
    }

    pub fn namespace(mut self, mode: NamespaceMode) -> Self {
        self.namespace = mode;
        self
    }

    pub fn guard(mut self, property: &str, equals: &str) -> Self {
        self.guard = Some(Guard { property: property.into(), equals: equals.into() });
        self
    }

    pub fn pair(mut self, rule: &str) -> Self {
        self.pair = Some(rule.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetMatcher {
    Equals(PropertyPath),
    LabelSelector(PropertyPath),
    RelativePath,
}

/// Validated rule consumed by the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefMapper {
    pub id: String,
    pub source_kind: String,
    pub source: PropertyPath,
    pub target_kind: String,
    pub matcher: TargetMatcher,
    pub ref_kind: RefKind,
    pub namespace: NamespaceMode,
    pub guard: Option<Guard>,
    pub pair: Option<String>,
}

impl RefMapper {
    pub fn targets(&self, kind: &str) -> bool { self.target_kind == kind || self.target_kind == manifold_core::ANY_KIND }

    pub fn is_selector(&self) -> bool { matches!(self.matcher, TargetMatcher::LabelSelector(_)) }
}
