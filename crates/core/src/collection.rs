//! Records grouped by storage tag, plus the edge bookkeeping that keeps
//! `outgoing` and `incoming` lists transposes of each other.

use std::collections::BTreeMap;

use tracing::debug;

use crate::codec::{Content, ContentCodec};
use crate::error::{CoreError, CoreResult};
use crate::record::{Record, RecordId, RecordOverrides, Storage};
use crate::reference::Reference;

/// Edges added and removed by one outgoing-set replacement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdgeDelta {
    pub added: Vec<Reference>,
    pub removed: Vec<Reference>,
}

impl EdgeDelta {
    pub fn is_empty(&self) -> bool { self.added.is_empty() && self.removed.is_empty() }

    pub fn extend(&mut self, other: EdgeDelta) {
        self.added.extend(other.added);
        self.removed.extend(other.removed);
    }
}

#[derive(Debug, Clone)]
pub struct Collection {
    storage: Storage,
    records: BTreeMap<RecordId, Record>,
}

impl Collection {
    pub fn new(storage: Storage) -> Self { Self { storage, records: BTreeMap::new() } }

    pub fn storage(&self) -> Storage { self.storage }
    pub fn len(&self) -> usize { self.records.len() }
    pub fn is_empty(&self) -> bool { self.records.is_empty() }
    pub fn contains(&self, id: RecordId) -> bool { self.records.contains_key(&id) }
    pub fn get(&self, id: RecordId) -> Option<&Record> { self.records.get(&id) }
    pub fn get_mut(&mut self, id: RecordId) -> Option<&mut Record> { self.records.get_mut(&id) }

    /// Records in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Record> { self.records.values() }
    pub fn ids(&self) -> Vec<RecordId> { self.records.keys().copied().collect() }

    /// Insert an already built record, retagging it with this collection's storage.
    /// Edges are collection scoped, so any the record carried are dropped.
    pub fn insert(&mut self, mut record: Record) -> RecordId {
        record.storage = self.storage;
        record.outgoing.clear();
        record.incoming.clear();
        record.dirty = true;
        let id = record.id;
        self.records.insert(id, record);
        id
    }

    pub fn create(&mut self, content: Content, mut overrides: RecordOverrides, codec: &dyn ContentCodec) -> CoreResult<RecordId> {
        overrides.storage = Some(self.storage);
        let record = Record::create(content, overrides, codec)?;
        Ok(self.insert(record))
    }

    pub fn update_content(&mut self, id: RecordId, content: Content, codec: &dyn ContentCodec) -> CoreResult<()> {
        self.records.get_mut(&id).ok_or(CoreError::NotFound(id))?.update_content(content, codec)
    }

    /// Remove a record and every edge where it is an endpoint. Edges from other
    /// records to it are downgraded to unsatisfied, never dropped. The returned
    /// record still carries its edge lists so callers can find affected peers.
    pub fn delete(&mut self, id: RecordId) -> CoreResult<Record> {
        let record = self.records.remove(&id).ok_or(CoreError::NotFound(id))?;
        for edge in record.outgoing.iter() {
            if let Some(target) = edge.target_id().and_then(|t| self.records.get_mut(&t)) {
                target.incoming.retain(|e| e != edge);
            }
        }
        for edge in record.incoming.iter() {
            let Some(source) = self.records.get_mut(&edge.source) else { continue };
            for out in source.outgoing.iter_mut().filter(|o| o.target_id() == Some(id)) {
                out.downgrade(&record.name, record.namespace.clone());
            }
            dedup_edges(&mut source.outgoing);
            source.dirty = true;
        }
        debug!(id = %id, kind = %record.kind, name = %record.name, "record deleted");
        Ok(record)
    }

    /// Replace a record's outgoing edges with `next`, mirroring the diff into
    /// the incoming lists of the affected targets.
    pub fn replace_outgoing(&mut self, id: RecordId, mut next: Vec<Reference>) -> CoreResult<EdgeDelta> {
        dedup_edges(&mut next);
        let record = self.records.get_mut(&id).ok_or(CoreError::NotFound(id))?;
        let previous = std::mem::replace(&mut record.outgoing, next.clone());
        let removed: Vec<Reference> = previous.iter().filter(|e| !next.contains(e)).cloned().collect();
        let added: Vec<Reference> = next.iter().filter(|e| !previous.contains(e)).cloned().collect();
        for edge in removed.iter() {
            if let Some(target) = edge.target_id().and_then(|t| self.records.get_mut(&t)) {
                target.incoming.retain(|e| e != edge);
            }
        }
        for edge in added.iter() {
            if let Some(target) = edge.target_id().and_then(|t| self.records.get_mut(&t)) {
                target.incoming.push(edge.clone());
            }
        }
        Ok(EdgeDelta { added, removed })
    }

    /// Ids of records flagged dirty, clearing the flag.
    pub fn take_dirty(&mut self) -> Vec<RecordId> {
        let mut out = Vec::new();
        for (id, record) in self.records.iter_mut() {
            if record.dirty {
                record.dirty = false;
                out.push(*id);
            }
        }
        out
    }

    /// Check that every record-targeted edge appears on both endpoints.
    pub fn edges_consistent(&self) -> bool {
        for record in self.records.values() {
            for edge in record.outgoing.iter() {
                if edge.source != record.id { return false; }
                if let Some(t) = edge.target_id() {
                    match self.records.get(&t) {
                        Some(target) if target.incoming.contains(edge) => {}
                        _ => return false,
                    }
                }
            }
            for edge in record.incoming.iter() {
                if edge.target_id() != Some(record.id) { return false; }
                match self.records.get(&edge.source) {
                    Some(source) if source.outgoing.contains(edge) => {}
                    _ => return false,
                }
            }
        }
        true
    }
}

fn dedup_edges(edges: &mut Vec<Reference>) {
    let mut seen: Vec<Reference> = Vec::with_capacity(edges.len());
    edges.retain(|e| {
        if seen.contains(e) { return false; }
        seen.push(e.clone());
        true
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::YamlCodec;
    use crate::reference::{RefKind, RefStatus, RefTarget};

    fn obj(kind: &str, name: &str) -> Content {
        serde_json::json!({"apiVersion": "v1", "kind": kind, "metadata": {"name": name, "namespace": "ns1"}})
    }

    fn edge(source: RecordId, target: RecordId) -> Reference {
        Reference {
            source,
            target: RefTarget::Record(target),
            ref_kind: RefKind::ConfigConsumer,
            target_kind: "ConfigMap".into(),
            rule: "test".into(),
            value: "cm".into(),
            reciprocated: true,
        }
    }

    #[test]
    fn create_forces_storage_tag() {
        let mut col = Collection::new(Storage::Cluster);
        let ov = RecordOverrides { storage: Some(Storage::Local), ..Default::default() };
        let id = col.create(obj("Pod", "a"), ov, &YamlCodec::new()).unwrap();
        assert_eq!(col.get(id).unwrap().storage, Storage::Cluster);
    }

    #[test]
    fn replace_outgoing_mirrors_incoming() {
        let codec = YamlCodec::new();
        let mut col = Collection::new(Storage::Local);
        let pod = col.create(obj("Pod", "a"), RecordOverrides::default(), &codec).unwrap();
        let cm = col.create(obj("ConfigMap", "cm"), RecordOverrides::default(), &codec).unwrap();

        let delta = col.replace_outgoing(pod, vec![edge(pod, cm), edge(pod, cm)]).unwrap();
        assert_eq!(delta.added.len(), 1);
        assert_eq!(col.get(cm).unwrap().incoming.len(), 1);
        assert!(col.edges_consistent());

        let again = col.replace_outgoing(pod, vec![edge(pod, cm)]).unwrap();
        assert!(again.is_empty());

        let cleared = col.replace_outgoing(pod, vec![]).unwrap();
        assert_eq!(cleared.removed.len(), 1);
        assert!(col.get(cm).unwrap().incoming.is_empty());
        assert!(col.edges_consistent());
    }

    #[test]
    fn delete_downgrades_references_to_the_removed_record() {
        let codec = YamlCodec::new();
        let mut col = Collection::new(Storage::Local);
        let pod = col.create(obj("Pod", "a"), RecordOverrides::default(), &codec).unwrap();
        let cm = col.create(obj("ConfigMap", "cm"), RecordOverrides::default(), &codec).unwrap();
        col.replace_outgoing(pod, vec![edge(pod, cm)]).unwrap();
        col.take_dirty();

        let removed = col.delete(cm).unwrap();
        assert_eq!(removed.incoming.len(), 1);
        let pod_rec = col.get(pod).unwrap();
        assert!(pod_rec.dirty);
        assert_eq!(pod_rec.outgoing.len(), 1);
        assert_eq!(pod_rec.outgoing[0].status(), RefStatus::Unsatisfied);
        assert!(!pod_rec.touches(cm));
        assert!(col.edges_consistent());
    }

    #[test]
    fn delete_unknown_id_is_an_error() {
        let mut col = Collection::new(Storage::Local);
        assert!(matches!(col.delete(RecordId(u64::MAX)), Err(CoreError::NotFound(_))));
    }
}
