use serde::{Deserialize, Serialize};

use crate::codec::Content;

/// Notification from a source of truth (manifest files, cluster, expansion runs).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum SourceEvent {
    /// A manifest file appeared; `text` may hold several documents.
    Added { path: String, text: String },
    Updated { path: String, text: String },
    Removed { path: String },
    /// Wholesale replacement (cluster snapshot, Helm/Kustomize output).
    Replaced { records: Vec<Content> },
}

impl SourceEvent {
    pub fn path(&self) -> Option<&str> {
        match self {
            SourceEvent::Added { path, .. } | SourceEvent::Updated { path, .. } | SourceEvent::Removed { path } => Some(path),
            SourceEvent::Replaced { .. } => None,
        }
    }
}
