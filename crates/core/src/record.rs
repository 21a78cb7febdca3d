use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::codec::{Content, ContentCodec};
use crate::error::{CoreError, CoreResult};
use crate::reference::Reference;

/// Namespace assumed for records that do not declare one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Process-local record id. Ids are never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(pub u64);

impl RecordId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "#{}", self.0) }
}

/// Where a collection's records come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Storage {
    Local,
    Cluster,
    Transient,
    Preview,
}

impl Storage {
    pub const ALL: [Storage; 4] = [Storage::Local, Storage::Cluster, Storage::Transient, Storage::Preview];

    pub fn as_str(&self) -> &'static str {
        match self {
            Storage::Local => "local",
            Storage::Cluster => "cluster",
            Storage::Transient => "transient",
            Storage::Preview => "preview",
        }
    }
}

/// File location of a record loaded from a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Origin {
    pub path: String,
    /// Position of the document inside a multi-document file.
    pub doc_index: usize,
}

/// Values that take precedence over what the content declares.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOverrides {
    pub name: Option<String>,
    pub namespace: Option<String>,
    pub storage: Option<Storage>,
    pub origin: Option<Origin>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Record {
    pub id: RecordId,
    pub kind: String,
    pub api_version: String,
    pub name: String,
    pub namespace: Option<String>,
    pub storage: Storage,
    pub origin: Option<Origin>,
    content: Content,
    text: String,
    #[serde(skip)]
    overrides: RecordOverrides,
    /// Edges this record originates.
    pub outgoing: Vec<Reference>,
    /// Edges pointing at this record.
    pub incoming: Vec<Reference>,
    /// Set on every mutation; cleared once the record has been reprocessed.
    pub dirty: bool,
    /// Last parse failure. Invalid records keep their last good content.
    pub invalid: Option<String>,
}

fn meta_str<'a>(content: &'a Content, key: &str) -> Option<&'a str> {
    content.get("metadata").and_then(|m| m.get(key)).and_then(|v| v.as_str())
}

fn string_pairs(v: Option<&Content>) -> Vec<(String, String)> {
    let mut out = Vec::new();
    if let Some(map) = v.and_then(|v| v.as_object()) {
        for (k, v) in map.iter() {
            let s = match v {
                Content::String(s) => s.clone(),
                Content::Null => String::new(),
                other => other.to_string(),
            };
            out.push((k.clone(), s));
        }
    }
    out
}

impl Record {
    /// Build a record from content. `kind` and `apiVersion` must be present;
    /// name and namespace come from `metadata` unless overridden.
    pub fn create(content: Content, overrides: RecordOverrides, codec: &dyn ContentCodec) -> CoreResult<Record> {
        let text = codec.serialize(&content)?;
        let (kind, api_version, name, namespace) = Self::derive_identity(&content, &overrides)?;
        Ok(Record {
            id: RecordId::next(),
            kind,
            api_version,
            name,
            namespace,
            storage: overrides.storage.unwrap_or(Storage::Local),
            origin: overrides.origin.clone(),
            content,
            text,
            overrides,
            outgoing: Vec::new(),
            incoming: Vec::new(),
            dirty: true,
            invalid: None,
        })
    }

    fn derive_identity(content: &Content, overrides: &RecordOverrides) -> CoreResult<(String, String, String, Option<String>)> {
        let kind = content.get("kind").and_then(|v| v.as_str()).ok_or(CoreError::MissingField("kind"))?;
        let api_version = content.get("apiVersion").and_then(|v| v.as_str()).ok_or(CoreError::MissingField("apiVersion"))?;
        let name = match &overrides.name {
            Some(n) => n.clone(),
            None => meta_str(content, "name").ok_or(CoreError::MissingField("metadata.name"))?.to_string(),
        };
        let namespace = overrides.namespace.clone().or_else(|| meta_str(content, "namespace").map(str::to_string));
        Ok((kind.to_string(), api_version.to_string(), name, namespace))
    }

    pub fn content(&self) -> &Content { &self.content }
    pub fn text(&self) -> &str { &self.text }

    /// Replace content in place, keeping the id. Text is re-serialized and
    /// identity fields re-derived so the three never disagree.
    pub fn update_content(&mut self, content: Content, codec: &dyn ContentCodec) -> CoreResult<()> {
        let text = codec.serialize(&content)?;
        let (kind, api_version, name, namespace) = Self::derive_identity(&content, &self.overrides)?;
        self.kind = kind;
        self.api_version = api_version;
        self.name = name;
        self.namespace = namespace;
        self.content = content;
        self.text = text;
        self.invalid = None;
        self.dirty = true;
        Ok(())
    }

    /// Flag the record invalid, keeping its last known good content.
    pub fn mark_invalid(&mut self, reason: impl Into<String>) {
        self.invalid = Some(reason.into());
        self.dirty = true;
    }

    pub fn is_valid(&self) -> bool { self.invalid.is_none() }

    pub fn effective_namespace(&self) -> &str { self.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE) }

    pub fn file_path(&self) -> Option<&str> { self.origin.as_ref().map(|o| o.path.as_str()) }

    pub fn labels(&self) -> SmallVec<[(String, String); 8]> {
        string_pairs(self.content.get("metadata").and_then(|m| m.get("labels"))).into_iter().collect()
    }

    pub fn annotations(&self) -> SmallVec<[(String, String); 4]> {
        string_pairs(self.content.get("metadata").and_then(|m| m.get("annotations"))).into_iter().collect()
    }

    /// Whether the record references or is referenced by `other`.
    pub fn touches(&self, other: RecordId) -> bool {
        self.outgoing.iter().any(|e| e.target_id() == Some(other)) || self.incoming.iter().any(|e| e.source == other)
    }
}
