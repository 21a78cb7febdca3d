//! Manifold reference resolver.
//!
//! `resolve(collection, candidates)` recomputes the full outgoing edge set of
//! every candidate from the catalog and diffs it against what the record had,
//! mirroring additions and removals into the targets' incoming lists. Only
//! candidates are touched; unrelated records keep their edges.

#![forbid(unsafe_code)]

mod matching;

use std::time::Instant;

use metrics::{counter, histogram};
use tracing::{debug, warn};

use manifold_core::{Collection, KindRegistry, Record, RecordId, RefKind, RefStatus, RefTarget, Reference};
use manifold_mapping::{Catalog, RefMapper};

use matching::{KindIndex, Outcome, Probe};

/// Edges added and removed by one resolver pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveOutcome {
    pub added: Vec<Reference>,
    pub removed: Vec<Reference>,
    /// Candidates that were actually reprocessed.
    pub processed: usize,
    /// Rule applications aborted by unreadable paths.
    pub rule_errors: usize,
}

impl ResolveOutcome {
    pub fn is_noop(&self) -> bool { self.added.is_empty() && self.removed.is_empty() }
}

pub struct Resolver<'a> {
    catalog: &'a Catalog,
    registry: &'a KindRegistry,
}

impl<'a> Resolver<'a> {
    pub fn new(catalog: &'a Catalog, registry: &'a KindRegistry) -> Self { Self { catalog, registry } }

    /// Reprocess every record in the collection.
    pub fn resolve_all(&self, collection: &mut Collection) -> ResolveOutcome {
        let ids = collection.ids();
        self.resolve(collection, &ids)
    }

    /// Recompute outgoing edges for `candidates`. Missing ids and invalid
    /// records are skipped; invalid records keep their last edges.
    pub fn resolve(&self, collection: &mut Collection, candidates: &[RecordId]) -> ResolveOutcome {
        let t0 = Instant::now();
        let mut ids = candidates.to_vec();
        ids.sort_unstable();
        ids.dedup();

        let mut outcome = ResolveOutcome::default();
        let planned: Vec<(RecordId, Vec<Reference>)> = {
            let index = KindIndex::build(collection);
            let probe = Probe::new(&index, self.registry);
            let mut planned = Vec::with_capacity(ids.len());
            for id in ids.iter() {
                let Some(record) = collection.get(*id) else { continue };
                if !record.is_valid() {
                    debug!(id = %id, "skipping invalid record");
                    continue;
                }
                let (edges, errors) = self.outgoing_for(&probe, record);
                outcome.rule_errors += errors;
                planned.push((*id, edges));
            }
            planned
        };

        for (id, edges) in planned {
            match collection.replace_outgoing(id, edges) {
                Ok(delta) => {
                    outcome.added.extend(delta.added);
                    outcome.removed.extend(delta.removed);
                    outcome.processed += 1;
                }
                Err(e) => warn!(id = %id, error = %e, "record vanished during resolve"),
            }
            if let Some(r) = collection.get_mut(id) { r.dirty = false; }
        }

        counter!("resolve_passes_total", 1u64);
        counter!("resolve_edges_added_total", outcome.added.len() as u64);
        counter!("resolve_edges_removed_total", outcome.removed.len() as u64);
        if outcome.rule_errors > 0 { counter!("resolve_rule_errors_total", outcome.rule_errors as u64); }
        histogram!("resolve_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(
            candidates = ids.len(),
            processed = outcome.processed,
            added = outcome.added.len(),
            removed = outcome.removed.len(),
            "resolve pass done"
        );
        outcome
    }

    fn outgoing_for(&self, probe: &Probe<'_>, record: &Record) -> (Vec<Reference>, usize) {
        let mut edges = Vec::new();
        let mut errors = 0usize;
        for rule in self.catalog.rules_for(&record.kind) {
            match probe.evaluate(record, rule) {
                Ok(found) => {
                    for (value, outcome) in found {
                        self.push_edges(probe, record, rule, value, outcome, &mut edges);
                    }
                }
                Err(e) => {
                    errors += 1;
                    warn!(rule = %rule.id, id = %record.id, kind = %record.kind, name = %record.name, error = %e, "reference rule aborted");
                }
            }
        }
        collapse_selector_misses(&mut edges);
        (edges, errors)
    }

    fn push_edges(&self, probe: &Probe<'_>, record: &Record, rule: &RefMapper, value: String, outcome: Outcome, out: &mut Vec<Reference>) {
        let edge = |target: RefTarget, reciprocated: bool| Reference {
            source: record.id,
            target,
            ref_kind: rule.ref_kind,
            target_kind: rule.target_kind.clone(),
            rule: rule.id.clone(),
            value: value.clone(),
            reciprocated,
        };
        match outcome {
            Outcome::Matched(targets) => {
                for target in targets {
                    let reciprocated = self.reciprocated(probe, record, rule, target);
                    out.push(edge(RefTarget::Record(target), reciprocated));
                }
            }
            Outcome::Unmatched { name, namespace } => out.push(edge(RefTarget::Named { name, namespace }, false)),
            Outcome::Unresolved(reason) => out.push(edge(RefTarget::Unresolved { reason }, false)),
        }
    }

    /// Paired rules count as satisfied only when the pair rule, applied from
    /// the target, matches the source back.
    fn reciprocated(&self, probe: &Probe<'_>, source: &Record, rule: &RefMapper, target: RecordId) -> bool {
        let Some(pair_id) = rule.pair.as_deref() else { return true };
        let Some(pair) = self.catalog.rule(pair_id) else { return false };
        let Some(target) = probe.record(target) else { return false };
        if pair.source_kind != target.kind || !pair.targets(&source.kind) { return false; }
        match probe.evaluate(target, pair) {
            Ok(found) => found.iter().any(|(_, o)| matches!(o, Outcome::Matched(ids) if ids.contains(&source.id))),
            Err(e) => {
                debug!(rule = %pair.id, error = %e, "pair rule unreadable; treating as not reciprocated");
                false
            }
        }
    }
}

/// One selector is tried against several target kinds. Misses for kinds it
/// does not select are noise: keep them only when the selector matched
/// nothing at all, and then only once.
fn collapse_selector_misses(edges: &mut Vec<Reference>) {
    let is_miss = |e: &Reference| e.ref_kind == RefKind::SelectorMatch && e.status() == RefStatus::Unresolved;
    let matched: Vec<String> = edges
        .iter()
        .filter(|e| e.ref_kind == RefKind::SelectorMatch && e.target_id().is_some())
        .map(|e| e.value.clone())
        .collect();
    let mut reported: Vec<String> = Vec::new();
    edges.retain(|e| {
        if !is_miss(e) { return true; }
        if matched.contains(&e.value) || reported.contains(&e.value) { return false; }
        reported.push(e.value.clone());
        true
    });
}
