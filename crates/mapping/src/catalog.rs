//! Validated, immutable lookup `kind -> rules`.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{debug, warn};

use manifold_core::KindRegistry;

use crate::path::{PathError, PropertyPath};
use crate::rule::{MatcherKind, NamespaceMode, RefMapper, RefMapperSpec, TargetMatcher};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error("rule without id")]
    EmptyId,
    #[error("{rule}: duplicate rule id")]
    DuplicateId { rule: String },
    #[error("{rule}: empty source kind")]
    EmptySourceKind { rule: String },
    #[error("{rule}: unknown target kind {kind}")]
    UnknownTargetKind { rule: String, kind: String },
    #[error("{rule}: {which} path: {source}")]
    BadPath { rule: String, which: &'static str, source: PathError },
    #[error("{rule}: matcher requires a target path")]
    MissingTargetPath { rule: String },
    #[error("{rule}: namespace mode needs a property name")]
    EmptyNamespaceProperty { rule: String },
    #[error("{rule}: pair rule {pair} does not exist")]
    UnknownPair { rule: String, pair: String },
    #[error("loading rules: {0}")]
    Load(String),
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    by_kind: FxHashMap<String, Vec<Arc<RefMapper>>>,
    by_id: FxHashMap<String, Arc<RefMapper>>,
    dropped: Vec<RuleError>,
}

fn compile(spec: &RefMapperSpec, registry: &KindRegistry) -> Result<RefMapper, RuleError> {
    let rule = spec.id.trim();
    if rule.is_empty() { return Err(RuleError::EmptyId); }
    let rule = rule.to_string();
    if spec.source_kind.trim().is_empty() {
        return Err(RuleError::EmptySourceKind { rule });
    }
    if !registry.is_recognized(&spec.target_kind) {
        return Err(RuleError::UnknownTargetKind { rule, kind: spec.target_kind.clone() });
    }
    let source = PropertyPath::parse(&spec.source_path).map_err(|e| RuleError::BadPath { rule: rule.clone(), which: "source", source: e })?;
    let target_path = || -> Result<PropertyPath, RuleError> {
        let raw = spec.target_path.as_deref().ok_or_else(|| RuleError::MissingTargetPath { rule: rule.clone() })?;
        PropertyPath::parse(raw).map_err(|e| RuleError::BadPath { rule: rule.clone(), which: "target", source: e })
    };
    let matcher = match spec.matcher {
        MatcherKind::Equals => TargetMatcher::Equals(target_path()?),
        MatcherKind::LabelSelector => TargetMatcher::LabelSelector(target_path()?),
        MatcherKind::RelativePath => TargetMatcher::RelativePath,
    };
    match &spec.namespace {
        NamespaceMode::Explicit(p) | NamespaceMode::OptionalExplicit(p) if p.trim().is_empty() => {
            return Err(RuleError::EmptyNamespaceProperty { rule });
        }
        _ => {}
    }
    Ok(RefMapper {
        id: rule,
        source_kind: spec.source_kind.trim().to_string(),
        source,
        target_kind: spec.target_kind.clone(),
        matcher,
        ref_kind: spec.ref_kind,
        namespace: spec.namespace.clone(),
        guard: spec.guard.clone(),
        pair: spec.pair.clone(),
    })
}

impl Catalog {
    /// Builtin rules validated against `registry`.
    pub fn builtin(registry: &KindRegistry) -> Self { Self::from_specs(crate::builtin::rules(), registry) }

    /// Validate `specs` once. Malformed rules are dropped with a diagnostic;
    /// construction never fails.
    pub fn from_specs(specs: impl IntoIterator<Item = RefMapperSpec>, registry: &KindRegistry) -> Self {
        let mut cat = Self::default();
        cat.extend(specs, registry);
        cat
    }

    /// Add more rules (e.g. from a rule file) with the same validation.
    pub fn extend(&mut self, specs: impl IntoIterator<Item = RefMapperSpec>, registry: &KindRegistry) {
        let mut accepted: Vec<RefMapper> = Vec::new();
        for spec in specs {
            let compiled = compile(&spec, registry).and_then(|r| {
                if self.by_id.contains_key(&r.id) || accepted.iter().any(|a| a.id == r.id) {
                    Err(RuleError::DuplicateId { rule: r.id })
                } else {
                    Ok(r)
                }
            });
            match compiled {
                Ok(r) => accepted.push(r),
                Err(e) => self.drop_rule(e),
            }
        }
        // Pairs may point at rules declared later in the same batch.
        let known = |id: &str, accepted: &[RefMapper]| self.by_id.contains_key(id) || accepted.iter().any(|a| a.id == id);
        let (ok, bad): (Vec<RefMapper>, Vec<RefMapper>) = accepted
            .iter()
            .cloned()
            .partition(|r| r.pair.as_deref().map(|p| known(p, &accepted)).unwrap_or(true));
        for r in bad {
            let pair = r.pair.clone().unwrap_or_default();
            self.drop_rule(RuleError::UnknownPair { rule: r.id, pair });
        }
        for r in ok {
            let r = Arc::new(r);
            self.by_kind.entry(r.source_kind.clone()).or_default().push(Arc::clone(&r));
            self.by_id.insert(r.id.clone(), r);
        }
        debug!(rules = self.by_id.len(), dropped = self.dropped.len(), "reference catalog ready");
    }

    fn drop_rule(&mut self, e: RuleError) {
        warn!(error = %e, "dropping malformed reference rule");
        self.dropped.push(e);
    }

    pub fn rules_for(&self, kind: &str) -> &[Arc<RefMapper>] { self.by_kind.get(kind).map(|v| v.as_slice()).unwrap_or(&[]) }

    pub fn rule(&self, id: &str) -> Option<&RefMapper> { self.by_id.get(id).map(|r| r.as_ref()) }

    /// Source kinds with at least one rule that a record of `kind` could satisfy.
    pub fn source_kinds_targeting(&self, kind: &str) -> Vec<&str> {
        let mut out: Vec<&str> = self
            .by_kind
            .iter()
            .filter(|(_, rules)| rules.iter().any(|r| r.targets(kind)))
            .map(|(k, _)| k.as_str())
            .collect();
        out.sort_unstable();
        out
    }

    pub fn len(&self) -> usize { self.by_id.len() }
    pub fn is_empty(&self) -> bool { self.by_id.is_empty() }

    /// Diagnostics for rules dropped during construction.
    pub fn dropped(&self) -> &[RuleError] { &self.dropped }

    /// Read rule specs from a YAML (or JSON) file.
    pub fn load_specs(path: &std::path::Path) -> Result<Vec<RefMapperSpec>, RuleError> {
        let text = std::fs::read_to_string(path).map_err(|e| RuleError::Load(format!("{}: {}", path.display(), e)))?;
        Self::parse_specs(&text)
    }

    pub fn parse_specs(text: &str) -> Result<Vec<RefMapperSpec>, RuleError> {
        serde_yaml::from_str(text).map_err(|e| RuleError::Load(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifold_core::RefKind;

    #[test]
    fn builtin_catalog_has_no_dropped_rules() {
        let cat = Catalog::builtin(&KindRegistry::builtin());
        assert!(cat.dropped().is_empty(), "dropped: {:?}", cat.dropped());
        assert!(cat.rules_for("Deployment").iter().any(|r| r.target_kind == "ConfigMap"));
        assert!(cat.rule(crate::builtin::SA_SECRETS_RULE).is_some());
        assert!(cat.rules_for("Unknown").is_empty());
    }

    #[test]
    fn malformed_rules_are_dropped_not_fatal() {
        let reg = KindRegistry::builtin();
        let specs = vec![
            RefMapperSpec::new("ok", "Pod", "spec.serviceAccountName", "ServiceAccount", RefKind::ConfigConsumer),
            RefMapperSpec::new("bad-kind", "Pod", "spec.x", "NoSuchKind", RefKind::ConfigConsumer),
            RefMapperSpec::new("bad-path", "Pod", "spec..x", "Secret", RefKind::ConfigConsumer),
            RefMapperSpec::new("", "Pod", "spec.x", "Secret", RefKind::ConfigConsumer),
            RefMapperSpec::new("ok", "Pod", "spec.y", "Secret", RefKind::ConfigConsumer),
            RefMapperSpec::new("lonely", "Pod", "spec.z", "Secret", RefKind::ConfigConsumer).pair("missing"),
            RefMapperSpec::new("no-prop", "Pod", "spec.z", "Secret", RefKind::ConfigConsumer)
                .namespace(NamespaceMode::Explicit(" ".into())),
        ];
        let cat = Catalog::from_specs(specs, &reg);
        assert_eq!(cat.len(), 1);
        assert_eq!(cat.dropped().len(), 6);
        assert!(cat.dropped().contains(&RuleError::DuplicateId { rule: "ok".into() }));
        assert!(cat.dropped().contains(&RuleError::UnknownPair { rule: "lonely".into(), pair: "missing".into() }));
    }

    #[test]
    fn source_kinds_targeting_includes_wildcards() {
        let cat = Catalog::builtin(&KindRegistry::builtin());
        let kinds = cat.source_kinds_targeting("ConfigMap");
        assert!(kinds.contains(&"Deployment"));
        assert!(kinds.contains(&"Kustomization"));
        assert!(!kinds.contains(&"Service"));
    }

    #[test]
    fn rule_files_parse_from_yaml() {
        let text = r#"
- id: app-config
  source_kind: App
  source_path: spec.configRef
  target_kind: ConfigMap
  target_path: metadata.name
  ref_kind: config-consumer
  namespace: { mode: optional-explicit, property: configNamespace }
- id: app-selects
  source_kind: App
  source_path: spec.selector
  target_kind: Pod
  target_path: metadata.labels
  matcher: label-selector
  ref_kind: selector-match
"#;
        let specs = Catalog::parse_specs(text).unwrap();
        assert_eq!(specs[0].namespace, NamespaceMode::OptionalExplicit("configNamespace".into()));
        let cat = Catalog::from_specs(specs, &KindRegistry::builtin());
        assert_eq!(cat.rules_for("App").len(), 2);
        assert!(cat.rules_for("App")[1].is_selector());
    }
}
