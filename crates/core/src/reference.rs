use serde::{Deserialize, Serialize};

use crate::RecordId;

/// Typed relationship carried by a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefKind {
    /// Overlay -> base, owned -> owner.
    ParentChild,
    /// Workload -> ConfigMap/Secret/ServiceAccount/claim.
    ConfigConsumer,
    /// Label selector -> labelled records (fan-out).
    SelectorMatch,
    /// Template -> values placeholder.
    TemplateValue,
}

impl RefKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefKind::ParentChild => "parent-child",
            RefKind::ConfigConsumer => "config-consumer",
            RefKind::SelectorMatch => "selector-match",
            RefKind::TemplateValue => "template-value",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefTarget {
    /// A concrete record in the same collection.
    Record(RecordId),
    /// Target is named but nothing in the collection matches.
    Named { name: String, namespace: Option<String> },
    /// Target cannot be named (empty selector, missing namespace property, ...).
    Unresolved { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefStatus {
    Satisfied,
    /// Matched, but a paired rule was not reciprocated by the target.
    Informational,
    Unsatisfied,
    Unresolved,
}

/// Directed edge produced by one reference rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    pub source: RecordId,
    pub target: RefTarget,
    pub ref_kind: RefKind,
    pub target_kind: String,
    /// Id of the rule that produced this edge.
    pub rule: String,
    /// Rendered source value (`web-config`, `app=web,tier=fe`, `../base`).
    pub value: String,
    pub reciprocated: bool,
}

impl Reference {
    pub fn status(&self) -> RefStatus {
        match &self.target {
            RefTarget::Record(_) if self.reciprocated => RefStatus::Satisfied,
            RefTarget::Record(_) => RefStatus::Informational,
            RefTarget::Named { .. } => RefStatus::Unsatisfied,
            RefTarget::Unresolved { .. } => RefStatus::Unresolved,
        }
    }

    pub fn target_id(&self) -> Option<RecordId> {
        match self.target {
            RefTarget::Record(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_satisfied(&self) -> bool { self.status() == RefStatus::Satisfied }

    pub fn is_dangling(&self) -> bool { self.target_id().is_none() }

    /// Replace a record target by its last known name once the target is gone.
    pub fn downgrade(&mut self, name: &str, namespace: Option<String>) {
        self.target = RefTarget::Named { name: name.to_string(), namespace };
        self.reciprocated = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(target: RefTarget, reciprocated: bool) -> Reference {
        Reference {
            source: RecordId(1),
            target,
            ref_kind: RefKind::ConfigConsumer,
            target_kind: "ConfigMap".into(),
            rule: "r".into(),
            value: "cm".into(),
            reciprocated,
        }
    }

    #[test]
    fn status_follows_target_shape() {
        assert_eq!(edge(RefTarget::Record(RecordId(2)), true).status(), RefStatus::Satisfied);
        assert_eq!(edge(RefTarget::Record(RecordId(2)), false).status(), RefStatus::Informational);
        let named = RefTarget::Named { name: "cm".into(), namespace: None };
        assert_eq!(edge(named, true).status(), RefStatus::Unsatisfied);
        let unresolved = RefTarget::Unresolved { reason: "empty selector".into() };
        assert_eq!(edge(unresolved, true).status(), RefStatus::Unresolved);
    }

    #[test]
    fn downgrade_keeps_the_name() {
        let mut e = edge(RefTarget::Record(RecordId(2)), true);
        e.downgrade("cm", Some("ns1".into()));
        assert_eq!(e.status(), RefStatus::Unsatisfied);
        assert_eq!(e.target, RefTarget::Named { name: "cm".into(), namespace: Some("ns1".into()) });
    }
}
