//! Incremental synchronizer: turns source events into record mutations and
//! runs one resolver pass per batch over the affected records only.

use std::collections::BTreeSet;
use std::sync::Arc;

use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use manifold_core::{Collection, Content, ContentCodec, KindRegistry, Origin, Record, RecordId, RecordOverrides, SourceEvent, Storage};
use manifold_mapping::Catalog;
use manifold_resolve::Resolver;

/// What one batch did to the collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub epoch: u64,
    pub events: usize,
    pub created: Vec<RecordId>,
    pub updated: Vec<RecordId>,
    pub removed: Vec<RecordId>,
    /// `(source, error)` for documents or files that failed to parse.
    pub invalid: Vec<(String, String)>,
    /// Records handed to the resolver.
    pub affected: usize,
    pub edges_added: usize,
    pub edges_removed: usize,
}

/// Records whose reference status may change, collected while applying events.
#[derive(Debug, Default)]
struct Affected {
    ids: BTreeSet<RecordId>,
    /// Kinds that appeared or changed; sources with rules targeting them are included.
    kinds: BTreeSet<String>,
}

impl Affected {
    fn touch(&mut self, record: &Record) {
        self.ids.insert(record.id);
        self.kinds.insert(record.kind.clone());
        self.neighbours(record);
    }

    fn neighbours(&mut self, record: &Record) {
        self.ids.extend(record.outgoing.iter().filter_map(|e| e.target_id()));
        self.ids.extend(record.incoming.iter().map(|e| e.source));
    }
}

type DocKey = (String, String, Option<String>);

pub struct Synchronizer {
    collection: Collection,
    catalog: Arc<Catalog>,
    registry: Arc<KindRegistry>,
    codec: Arc<dyn ContentCodec>,
    /// Manifest path -> records in document order.
    files: FxHashMap<String, Vec<RecordId>>,
    epoch: u64,
}

impl Synchronizer {
    pub fn new(storage: Storage, catalog: Arc<Catalog>, registry: Arc<KindRegistry>, codec: Arc<dyn ContentCodec>) -> Self {
        Self { collection: Collection::new(storage), catalog, registry, codec, files: FxHashMap::default(), epoch: 0 }
    }

    pub fn collection(&self) -> &Collection { &self.collection }
    pub fn epoch(&self) -> u64 { self.epoch }
    pub fn storage(&self) -> Storage { self.collection.storage() }

    /// Record ids produced by a manifest file.
    pub fn records_for(&self, path: &str) -> &[RecordId] { self.files.get(path).map(|v| v.as_slice()).unwrap_or(&[]) }

    pub fn apply(&mut self, event: SourceEvent) -> BatchReport { self.apply_batch(vec![event]) }

    /// Apply every event, then resolve the union of affected records once.
    pub fn apply_batch(&mut self, events: Vec<SourceEvent>) -> BatchReport {
        let mut report = BatchReport { events: events.len(), ..Default::default() };
        let mut affected = Affected::default();
        for event in events {
            match event {
                SourceEvent::Added { path, text } | SourceEvent::Updated { path, text } => {
                    self.sync_file(&path, &text, &mut affected, &mut report)
                }
                SourceEvent::Removed { path } => self.remove_file(&path, &mut affected, &mut report),
                SourceEvent::Replaced { records } => self.replace_all(records, &mut affected, &mut report),
            }
        }
        self.finish(affected, report)
    }

    /// Insert or overwrite a record built elsewhere (e.g. by a transfer).
    /// An existing record with the same id keeps its id and edges.
    pub fn upsert(&mut self, record: Record) -> BatchReport {
        let mut report = BatchReport { events: 1, ..Default::default() };
        let mut affected = Affected::default();
        let id = record.id;
        if self.collection.contains(id) {
            if let Some(old) = self.collection.get(id) {
                affected.kinds.insert(old.kind.clone());
            }
            match self.collection.update_content(id, record.content().clone(), self.codec.as_ref()) {
                Ok(()) => {
                    if let Some(r) = self.collection.get_mut(id) { r.origin = record.origin.clone(); }
                    report.updated.push(id);
                }
                Err(e) => report.invalid.push((id.to_string(), e.to_string())),
            }
        } else {
            self.collection.insert(record);
            report.created.push(id);
        }
        if let Some(r) = self.collection.get(id) { affected.touch(r); }
        self.finish(affected, report)
    }

    /// Remove one record by id. Returns `None` if it is not in the collection.
    pub fn remove(&mut self, id: RecordId) -> Option<BatchReport> {
        if !self.collection.contains(id) { return None; }
        let mut report = BatchReport { events: 1, ..Default::default() };
        let mut affected = Affected::default();
        self.delete_record(id, &mut affected, &mut report);
        for ids in self.files.values_mut() { ids.retain(|x| *x != id); }
        self.files.retain(|_, ids| !ids.is_empty());
        Some(self.finish(affected, report))
    }

    fn finish(&mut self, affected: Affected, mut report: BatchReport) -> BatchReport {
        let candidates = self.expand(affected);
        let resolver = Resolver::new(&self.catalog, &self.registry);
        let outcome = resolver.resolve(&mut self.collection, &candidates);
        // records downgraded by deletions were flagged dirty and are in `candidates`
        self.collection.take_dirty();
        self.epoch = self.epoch.saturating_add(1);
        report.epoch = self.epoch;
        report.affected = candidates.len();
        report.edges_added = outcome.added.len();
        report.edges_removed = outcome.removed.len();
        counter!("sync_batches_total", 1u64, "storage" => self.storage().as_str());
        histogram!("sync_affected_records", candidates.len() as f64);
        debug!(
            storage = self.storage().as_str(),
            epoch = self.epoch,
            created = report.created.len(),
            updated = report.updated.len(),
            removed = report.removed.len(),
            affected = report.affected,
            "batch applied"
        );
        report
    }

    /// Conservative closure of the affected set: touched records, their
    /// neighbours, and every record whose kind has a rule that a touched kind
    /// could satisfy. Over-inclusion is fine; missing a record is not.
    fn expand(&self, affected: Affected) -> Vec<RecordId> {
        let mut ids = affected.ids;
        let mut source_kinds: BTreeSet<&str> = BTreeSet::new();
        for kind in affected.kinds.iter() {
            source_kinds.extend(self.catalog.source_kinds_targeting(kind));
        }
        if !source_kinds.is_empty() {
            ids.extend(self.collection.iter().filter(|r| source_kinds.contains(r.kind.as_str())).map(|r| r.id));
        }
        ids.into_iter()
            .filter(|id| self.collection.get(*id).map(|r| r.is_valid()).unwrap_or(false))
            .collect()
    }

    fn sync_file(&mut self, path: &str, text: &str, affected: &mut Affected, report: &mut BatchReport) {
        let docs = match self.codec.parse_all(text) {
            Ok(docs) => docs,
            Err(e) => {
                warn!(path = %path, error = %e, "manifest failed to parse; keeping last good records");
                for id in self.records_for(path).to_vec() {
                    if let Some(r) = self.collection.get_mut(id) { r.mark_invalid(e.to_string()); }
                }
                report.invalid.push((path.to_string(), e.to_string()));
                return;
            }
        };
        let existing = self.files.remove(path).unwrap_or_default();
        let docs: Vec<(usize, Content)> = docs.into_iter().enumerate().collect();
        let ids = self.reconcile(existing, docs, Some(path), affected, report);
        if !ids.is_empty() { self.files.insert(path.to_string(), ids); }
    }

    fn remove_file(&mut self, path: &str, affected: &mut Affected, report: &mut BatchReport) {
        let Some(ids) = self.files.remove(path) else {
            debug!(path = %path, "remove for unknown path");
            return;
        };
        for id in ids { self.delete_record(id, affected, report); }
    }

    fn replace_all(&mut self, records: Vec<Content>, affected: &mut Affected, report: &mut BatchReport) {
        let existing = self.collection.ids();
        self.files.clear();
        let docs: Vec<(usize, Content)> = records.into_iter().enumerate().collect();
        let ids = self.reconcile(existing, docs, None, affected, report);
        info!(storage = self.storage().as_str(), records = ids.len(), "collection replaced");
    }

    /// Pair incoming documents with existing records by (kind, name, namespace),
    /// then (for files) by position, so ids survive edits. Leftover records
    /// are deleted, leftover documents created. Returns ids in document order.
    fn reconcile(
        &mut self,
        existing: Vec<RecordId>,
        docs: Vec<(usize, Content)>,
        path: Option<&str>,
        affected: &mut Affected,
        report: &mut BatchReport,
    ) -> Vec<RecordId> {
        let mut pool = existing;
        let mut placed: Vec<(usize, RecordId)> = Vec::new();
        let mut leftovers: Vec<(usize, Content, RecordOverrides)> = Vec::new();

        for (index, doc) in docs {
            let overrides = doc_overrides(&doc, path, index);
            let key = doc_key(&doc, &overrides);
            let hit = key.as_ref().and_then(|k| pool.iter().position(|id| self.record_key(*id).as_ref() == Some(k)));
            match hit {
                Some(pos) => {
                    let id = pool.remove(pos);
                    self.update_record(id, doc, overrides.origin, affected, report);
                    placed.push((index, id));
                }
                None => leftovers.push((index, doc, overrides)),
            }
        }

        for (index, doc, overrides) in leftovers {
            if path.is_some() && !pool.is_empty() {
                let id = pool.remove(0);
                self.update_record(id, doc, overrides.origin, affected, report);
                placed.push((index, id));
                continue;
            }
            match self.collection.create(doc, overrides, self.codec.as_ref()) {
                Ok(id) => {
                    if let Some(r) = self.collection.get(id) { affected.touch(r); }
                    report.created.push(id);
                    placed.push((index, id));
                }
                Err(e) => {
                    let source = path.map(|p| format!("{}#{}", p, index)).unwrap_or_else(|| format!("snapshot#{}", index));
                    warn!(source = %source, error = %e, "document skipped");
                    report.invalid.push((source, e.to_string()));
                }
            }
        }

        for id in pool { self.delete_record(id, affected, report); }
        placed.sort_unstable_by_key(|(i, _)| *i);
        placed.into_iter().map(|(_, id)| id).collect()
    }

    fn update_record(&mut self, id: RecordId, doc: Content, origin: Option<Origin>, affected: &mut Affected, report: &mut BatchReport) {
        let Some(record) = self.collection.get_mut(id) else { return };
        if record.origin != origin { record.origin = origin; }
        if record.content() == &doc && record.is_valid() { return; }
        let old_kind = record.kind.clone();
        match record.update_content(doc, self.codec.as_ref()) {
            Ok(()) => {
                affected.kinds.insert(old_kind);
                affected.touch(record);
                report.updated.push(id);
            }
            Err(e) => {
                warn!(id = %id, error = %e, "update rejected; record kept in last good state");
                record.mark_invalid(e.to_string());
                report.invalid.push((id.to_string(), e.to_string()));
            }
        }
    }

    fn delete_record(&mut self, id: RecordId, affected: &mut Affected, report: &mut BatchReport) {
        match self.collection.delete(id) {
            Ok(record) => {
                affected.ids.remove(&id);
                affected.neighbours(&record);
                report.removed.push(id);
            }
            Err(e) => debug!(id = %id, error = %e, "delete skipped"),
        }
    }

    fn record_key(&self, id: RecordId) -> Option<DocKey> {
        self.collection.get(id).map(|r| (r.kind.clone(), r.name.clone(), r.namespace.clone()))
    }
}

/// Kustomization files rarely carry a name; they are named after their folder.
fn doc_overrides(doc: &Content, path: Option<&str>, index: usize) -> RecordOverrides {
    let mut overrides = RecordOverrides::default();
    let Some(path) = path else { return overrides };
    overrides.origin = Some(Origin { path: path.to_string(), doc_index: index });
    let named = doc.get("metadata").and_then(|m| m.get("name")).and_then(|v| v.as_str()).is_some();
    if !named && doc.get("kind").and_then(|v| v.as_str()) == Some("Kustomization") {
        let folder = std::path::Path::new(path)
            .parent()
            .and_then(|p| p.file_name())
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string());
        overrides.name = Some(folder);
    }
    overrides
}

fn doc_key(doc: &Content, overrides: &RecordOverrides) -> Option<DocKey> {
    let kind = doc.get("kind")?.as_str()?.to_string();
    let meta = doc.get("metadata");
    let name = match &overrides.name {
        Some(n) => n.clone(),
        None => meta?.get("name")?.as_str()?.to_string(),
    };
    let namespace = meta.and_then(|m| m.get("namespace")).and_then(|v| v.as_str()).map(str::to_string);
    Some((kind, name, namespace))
}
