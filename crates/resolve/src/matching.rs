//! Target lookup for one rule applied to one record.

use std::path::{Component, Path, PathBuf};

use rustc_hash::FxHashMap;

use manifold_core::{Collection, Content, KindRegistry, Record, RecordId, ANY_KIND};
use manifold_mapping::{scalar_string, Located, NamespaceMode, PathError, PropertyPath, RefMapper, TargetMatcher};

/// Result of matching one source value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Every matching target, in id order.
    Matched(Vec<RecordId>),
    /// Target is named but absent.
    Unmatched { name: String, namespace: Option<String> },
    /// Target cannot be named.
    Unresolved(String),
}

/// Records grouped by kind for one pass, in id order.
pub(crate) struct KindIndex<'c> {
    by_kind: FxHashMap<&'c str, Vec<&'c Record>>,
    all: Vec<&'c Record>,
}

impl<'c> KindIndex<'c> {
    pub(crate) fn build(collection: &'c Collection) -> Self {
        let mut by_kind: FxHashMap<&'c str, Vec<&'c Record>> = FxHashMap::default();
        let mut all = Vec::with_capacity(collection.len());
        for r in collection.iter() {
            by_kind.entry(r.kind.as_str()).or_default().push(r);
            all.push(r);
        }
        Self { by_kind, all }
    }

    fn of_kind(&self, kind: &str) -> &[&'c Record] {
        if kind == ANY_KIND { return &self.all; }
        self.by_kind.get(kind).map(|v| v.as_slice()).unwrap_or(&[])
    }

    fn get(&self, id: RecordId) -> Option<&'c Record> {
        self.all.binary_search_by_key(&id, |r| r.id).ok().map(|i| self.all[i])
    }
}

/// Read-only view used to evaluate rules during a pass.
pub(crate) struct Probe<'p> {
    index: &'p KindIndex<'p>,
    registry: &'p KindRegistry,
}

impl<'p> Probe<'p> {
    pub(crate) fn new(index: &'p KindIndex<'p>, registry: &'p KindRegistry) -> Self { Self { index, registry } }

    pub(crate) fn record(&self, id: RecordId) -> Option<&'p Record> { self.index.get(id) }

    /// Apply `rule` to `record`, one outcome per source value.
    pub(crate) fn evaluate(&self, record: &Record, rule: &RefMapper) -> Result<Vec<(String, Outcome)>, PathError> {
        let mut out = Vec::new();
        for loc in rule.source.read(record.content())? {
            if let Some(g) = &rule.guard {
                if loc.sibling_str(&g.property) != Some(g.equals.as_str()) { continue; }
            }
            let value = match &rule.matcher {
                TargetMatcher::LabelSelector(_) => render_selector(loc.value),
                _ => match scalar_string(loc.value) {
                    Some(v) if !v.is_empty() => v,
                    // mapping where a scalar was expected: nothing to name
                    _ => continue,
                },
            };
            let namespace = match self.target_namespace(record, rule, &loc) {
                Ok(ns) => ns,
                Err(reason) => {
                    out.push((value, Outcome::Unresolved(reason)));
                    continue;
                }
            };
            let outcome = match &rule.matcher {
                TargetMatcher::Equals(tp) => self.match_equal(record, rule, tp, &value, namespace),
                TargetMatcher::LabelSelector(tp) => self.match_selector(record, rule, tp, loc.value, namespace.as_deref()),
                TargetMatcher::RelativePath => self.match_relative(record, rule, &value),
            };
            out.push((value, outcome));
        }
        Ok(out)
    }

    fn target_namespace(&self, record: &Record, rule: &RefMapper, loc: &Located<'_>) -> Result<Option<String>, String> {
        if rule.target_kind != ANY_KIND && !self.registry.is_namespaced(&rule.target_kind) {
            return Ok(None);
        }
        match &rule.namespace {
            NamespaceMode::None => Ok(None),
            NamespaceMode::Implicit => Ok(Some(record.effective_namespace().to_string())),
            NamespaceMode::Explicit(p) => match loc.sibling_str(p) {
                Some(ns) => Ok(Some(ns.to_string())),
                None => Err(format!("namespace property {} missing", p)),
            },
            NamespaceMode::OptionalExplicit(p) => {
                Ok(Some(loc.sibling_str(p).unwrap_or(record.effective_namespace()).to_string()))
            }
        }
    }

    fn candidates<'s>(&'s self, record: &'s Record, rule: &'s RefMapper, namespace: Option<&'s str>) -> impl Iterator<Item = &'p Record> + 's {
        self.index
            .of_kind(&rule.target_kind)
            .iter()
            .copied()
            .filter(move |t| t.id != record.id)
            .filter(move |t| namespace.map_or(true, |ns| t.effective_namespace() == ns))
    }

    fn match_equal(&self, record: &Record, rule: &RefMapper, tp: &PropertyPath, value: &str, namespace: Option<String>) -> Outcome {
        let ids: Vec<RecordId> = self
            .candidates(record, rule, namespace.as_deref())
            .filter(|t| target_value(t, tp).as_deref() == Some(value))
            .map(|t| t.id)
            .collect();
        if ids.is_empty() {
            Outcome::Unmatched { name: value.to_string(), namespace }
        } else {
            Outcome::Matched(ids)
        }
    }

    fn match_selector(&self, record: &Record, rule: &RefMapper, tp: &PropertyPath, selector: &Content, namespace: Option<&str>) -> Outcome {
        let wanted = string_map(selector);
        if wanted.is_empty() {
            return Outcome::Unresolved("empty selector".into());
        }
        let ids: Vec<RecordId> = self
            .candidates(record, rule, namespace)
            .filter(|t| {
                let Ok(found) = tp.read(t.content()) else { return false };
                let labels: Vec<(String, String)> = found.iter().flat_map(|l| string_map(l.value)).collect();
                wanted.iter().all(|w| labels.contains(w))
            })
            .map(|t| t.id)
            .collect();
        if ids.is_empty() {
            Outcome::Unresolved("selector matches nothing".into())
        } else {
            Outcome::Matched(ids)
        }
    }

    fn match_relative(&self, record: &Record, rule: &RefMapper, value: &str) -> Outcome {
        let Some(file) = record.file_path() else {
            return Outcome::Unresolved("source has no file".into());
        };
        let base = Path::new(file).parent().unwrap_or_else(|| Path::new(""));
        let wanted = normalize_path(&base.join(value));
        let ids: Vec<RecordId> = self
            .candidates(record, rule, None)
            .filter(|t| {
                let Some(tf) = t.file_path() else { return false };
                let tf = normalize_path(Path::new(tf));
                tf == wanted || (t.kind == "Kustomization" && tf.parent() == Some(wanted.as_path()))
            })
            .map(|t| t.id)
            .collect();
        if ids.is_empty() {
            Outcome::Unmatched { name: value.to_string(), namespace: None }
        } else {
            Outcome::Matched(ids)
        }
    }
}

/// `metadata.name` reads the record's effective name (which may be overridden).
fn target_value(target: &Record, tp: &PropertyPath) -> Option<String> {
    if tp.as_str() == "metadata.name" { return Some(target.name.clone()); }
    tp.read(target.content()).ok()?.into_iter().find_map(|l| scalar_string(l.value))
}

fn string_map(v: &Content) -> Vec<(String, String)> {
    match v.as_object() {
        Some(map) => map.iter().filter_map(|(k, v)| scalar_string(v).map(|s| (k.clone(), s))).collect(),
        None => Vec::new(),
    }
}

fn render_selector(v: &Content) -> String {
    string_map(v).into_iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
}

/// Lexically normalize a path: drop `.`, fold `..` into the parent.
fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                let at_parent = matches!(out.components().next_back(), Some(Component::ParentDir));
                if at_parent || !out.pop() { out.push(".."); }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_folds_parent_segments() {
        assert_eq!(normalize_path(Path::new("overlays/prod/../../base")), PathBuf::from("base"));
        assert_eq!(normalize_path(Path::new("./a/./b")), PathBuf::from("a/b"));
        assert_eq!(normalize_path(Path::new("../x")), PathBuf::from("../x"));
        assert_eq!(normalize_path(Path::new("../../x")), PathBuf::from("../../x"));
    }

    #[test]
    fn selectors_render_sorted() {
        let v = serde_json::json!({"tier": "fe", "app": "web"});
        assert_eq!(render_selector(&v), "app=web,tier=fe");
        assert!(string_map(&serde_json::json!("scalar")).is_empty());
    }
}
