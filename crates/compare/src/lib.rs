//! Manifold comparator: matches records of two collections by a stable
//! identity and classifies them as matched, left-only or right-only.
//!
//! Every set operation is a post-filter over the union, so all of them agree
//! on how a given identity is classified.

#![forbid(unsafe_code)]

mod diff;
mod filter;

use std::collections::BTreeMap;
use std::time::Instant;

use metrics::histogram;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use manifold_core::{Collection, Record, DEFAULT_NAMESPACE};

pub use diff::{diff_summary, DiffSummary};
pub use filter::{FilterPipeline, Predicate};

/// Namespace for comparison row ids. Changing it changes every stable id.
const COMPARE_NAMESPACE: Uuid = Uuid::from_u128(0x6d61_6e69_666f_6c64_2d63_6d70_2d72_6f77);
/// Stands in for the missing side of a one-sided row.
const ABSENT: &str = "<absent>";

/// Cross-collection key: `name.kind.namespace.apiVersion`, with an absent
/// namespace read as `default`. Never depends on id or storage.
pub fn identity(record: &Record) -> String {
    let ns = record.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE);
    format!("{}.{}.{}.{}", record.name, record.kind, ns, record.api_version)
}

/// Deterministic row id for a pair of identities.
pub fn stable_id(left: Option<&str>, right: Option<&str>) -> Uuid {
    let key = format!("{}|{}", left.unwrap_or(ABSENT), right.unwrap_or(ABSENT));
    Uuid::new_v5(&COMPARE_NAMESPACE, key.as_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompareOp {
    #[default]
    Union,
    Intersection,
    SymmetricDifference,
    LeftDifference,
    RightDifference,
}

impl CompareOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Union => "union",
            CompareOp::Intersection => "intersection",
            CompareOp::SymmetricDifference => "symmetric-difference",
            CompareOp::LeftDifference => "left-difference",
            CompareOp::RightDifference => "right-difference",
        }
    }

    /// Whether a union row belongs to this operation's result.
    pub fn keeps(&self, row: &ComparisonResult<'_>) -> bool {
        match self {
            CompareOp::Union => true,
            CompareOp::Intersection => row.is_match,
            CompareOp::SymmetricDifference => !row.is_match,
            CompareOp::LeftDifference => row.is_left_only(),
            CompareOp::RightDifference => row.is_right_only(),
        }
    }
}

impl std::str::FromStr for CompareOp {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "union" => Ok(CompareOp::Union),
            "intersection" => Ok(CompareOp::Intersection),
            "symmetric-difference" => Ok(CompareOp::SymmetricDifference),
            "left-difference" => Ok(CompareOp::LeftDifference),
            "right-difference" => Ok(CompareOp::RightDifference),
            other => Err(format!("unknown compare operation: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComparisonResult<'a> {
    pub stable_id: Uuid,
    pub identity: String,
    pub is_match: bool,
    pub left: Option<&'a Record>,
    pub right: Option<&'a Record>,
    /// Only ever true for matched rows.
    pub is_different: bool,
}

impl<'a> ComparisonResult<'a> {
    fn matched(identity: String, left: &'a Record, right: &'a Record) -> Self {
        Self {
            stable_id: stable_id(Some(&identity), Some(&identity)),
            is_different: left.text() != right.text(),
            identity,
            is_match: true,
            left: Some(left),
            right: Some(right),
        }
    }

    fn left_only(identity: String, left: &'a Record) -> Self {
        Self { stable_id: stable_id(Some(&identity), None), identity, is_match: false, left: Some(left), right: None, is_different: false }
    }

    fn right_only(identity: String, right: &'a Record) -> Self {
        Self { stable_id: stable_id(None, Some(&identity)), identity, is_match: false, left: None, right: Some(right), is_different: false }
    }

    pub fn is_left_only(&self) -> bool { self.left.is_some() && self.right.is_none() }
    pub fn is_right_only(&self) -> bool { self.left.is_none() && self.right.is_some() }

    /// The record predicates read from: left when present.
    pub fn primary(&self) -> Option<&'a Record> { self.left.or(self.right) }

    /// Field-level change counts for a matched row.
    pub fn diff(&self) -> Option<DiffSummary> {
        match (self.left, self.right) {
            (Some(l), Some(r)) => Some(diff_summary(r.content(), l.content())),
            _ => None,
        }
    }
}

/// First record per identity, by id, plus the later records sharing an
/// identity with it. Those never appear in a row.
fn by_identity(collection: &Collection) -> (BTreeMap<String, &Record>, Vec<&Record>) {
    let mut map: BTreeMap<String, &Record> = BTreeMap::new();
    let mut shadowed = Vec::new();
    for record in collection.iter() {
        let key = identity(record);
        if let Some(first) = map.get(&key) {
            debug!(identity = %key, kept = %first.id, dropped = %record.id, "duplicate identity in collection");
            shadowed.push(record);
            continue;
        }
        map.insert(key, record);
    }
    (map, shadowed)
}

/// Records that `compare` leaves out of every row because a record with a
/// smaller id in the same collection has the same identity.
pub fn shadowed(collection: &Collection) -> Vec<&Record> { by_identity(collection).1 }

fn union<'a>(left: &BTreeMap<String, &'a Record>, right: &BTreeMap<String, &'a Record>) -> Vec<ComparisonResult<'a>> {
    let mut out = Vec::with_capacity(left.len().max(right.len()));
    for (key, l) in left.iter() {
        match right.get(key) {
            Some(r) => out.push(ComparisonResult::matched(key.clone(), *l, *r)),
            None => out.push(ComparisonResult::left_only(key.clone(), *l)),
        }
    }
    for (key, r) in right.iter() {
        if !left.contains_key(key) {
            out.push(ComparisonResult::right_only(key.clone(), *r));
        }
    }
    out.sort_by(|a, b| a.identity.cmp(&b.identity));
    out
}

/// Compare two collections under `op`. Rows are ordered by identity.
pub fn compare<'a>(left: &'a Collection, right: &'a Collection, op: CompareOp) -> Vec<ComparisonResult<'a>> {
    let started = Instant::now();
    let (lmap, lshadow) = by_identity(left);
    let (rmap, rshadow) = by_identity(right);
    let mut rows = union(&lmap, &rmap);
    rows.retain(|row| op.keeps(row));
    histogram!("compare_results", rows.len() as f64);
    debug!(
        op = op.as_str(),
        left = lmap.len(),
        right = rmap.len(),
        rows = rows.len(),
        shadowed = lshadow.len() + rshadow.len(),
        took_ms = started.elapsed().as_millis() as u64,
        "comparison done"
    );
    rows
}

/// Compare, then run the rows through `filters`.
pub fn compare_filtered<'a>(left: &'a Collection, right: &'a Collection, op: CompareOp, filters: &FilterPipeline) -> Vec<ComparisonResult<'a>> {
    filters.apply(compare(left, right, op))
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifold_core::{RecordOverrides, Storage, YamlCodec};
    use serde_json::json;

    fn pod(name: &str, ns: Option<&str>) -> Record {
        let mut meta = json!({ "name": name });
        if let Some(ns) = ns { meta["namespace"] = json!(ns); }
        Record::create(json!({ "apiVersion": "v1", "kind": "Pod", "metadata": meta }), RecordOverrides::default(), &YamlCodec::new()).unwrap()
    }

    #[test]
    fn identity_defaults_namespace_and_ignores_id_and_storage() {
        let a = pod("a", None);
        let mut b = pod("a", Some("default"));
        b.storage = Storage::Cluster;
        assert_ne!(a.id, b.id);
        assert_eq!(identity(&a), "a.Pod.default.v1");
        assert_eq!(identity(&a), identity(&b));
        assert_ne!(identity(&a), identity(&pod("a", Some("ns1"))));
    }

    #[test]
    fn stable_id_is_pure_and_side_sensitive() {
        let x = stable_id(Some("a.Pod.ns1.v1"), None);
        assert_eq!(x, stable_id(Some("a.Pod.ns1.v1"), None));
        assert_ne!(x, stable_id(None, Some("a.Pod.ns1.v1")));
        assert_ne!(x, stable_id(Some("a.Pod.ns1.v1"), Some("a.Pod.ns1.v1")));
        assert_eq!(x.get_version_num(), 5);
    }

    #[test]
    fn compare_op_parses_kebab_names() {
        for op in [CompareOp::Union, CompareOp::Intersection, CompareOp::SymmetricDifference, CompareOp::LeftDifference, CompareOp::RightDifference] {
            assert_eq!(op.as_str().parse::<CompareOp>().unwrap(), op);
        }
        assert!("outer".parse::<CompareOp>().is_err());
    }
}
