//! Per-collection mutation queue.
//!
//! One task owns the [`Synchronizer`]; everything that mutates the collection
//! goes through its channel. Source events received within one tick are
//! coalesced into a single batch. Readers load the latest frozen snapshot
//! without touching the queue.

use std::collections::VecDeque;
use std::sync::Arc;

use arc_swap::ArcSwap;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

use manifold_core::{Collection, Record, RecordId, Settings, SourceEvent, Storage};

use crate::sync::{BatchReport, Synchronizer};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("mutation queue for {0} collection is closed")]
    Closed(&'static str),
}

pub enum Mutation {
    Event(SourceEvent),
    Upsert { record: Record, reply: oneshot::Sender<BatchReport> },
    Remove { id: RecordId, reply: oneshot::Sender<Option<BatchReport>> },
    /// Apply everything queued so far and report the epoch.
    Flush { reply: oneshot::Sender<u64> },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum EventKey {
    Path(String),
    Snapshot,
}

/// Coalescing queue keyed by manifest path with FIFO order. A later event for
/// the same path replaces the earlier one; the file's final state is what counts.
/// A snapshot replaces the whole collection, so it discards everything queued
/// before it.
pub struct Coalescer {
    map: FxHashMap<EventKey, SourceEvent>,
    order: VecDeque<EventKey>,
    cap: usize,
}

impl Coalescer {
    pub fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new(), cap: cap.max(1) }
    }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
    pub fn is_full(&self) -> bool { self.map.len() >= self.cap }

    pub fn push(&mut self, ev: SourceEvent) {
        let key = match ev.path() {
            Some(p) => EventKey::Path(p.to_string()),
            None => {
                self.map.clear();
                self.order.clear();
                EventKey::Snapshot
            }
        };
        if !self.map.contains_key(&key) {
            self.order.push_back(key.clone());
        }
        self.map.insert(key, ev);
    }

    pub fn drain_ready(&mut self) -> Vec<SourceEvent> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(key) = self.order.pop_front() {
            if let Some(ev) = self.map.remove(&key) {
                out.push(ev);
            }
        }
        out
    }
}

/// Handle for readers and writers of one collection.
#[derive(Clone)]
pub struct CollectionHandle {
    storage: Storage,
    tx: mpsc::Sender<Mutation>,
    snap: Arc<ArcSwap<Collection>>,
    epoch_rx: watch::Receiver<u64>,
}

impl CollectionHandle {
    pub fn storage(&self) -> Storage { self.storage }
    pub fn current(&self) -> Arc<Collection> { self.snap.load_full() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }

    fn closed(&self) -> StoreError { StoreError::Closed(self.storage.as_str()) }

    pub async fn send(&self, ev: SourceEvent) -> Result<(), StoreError> {
        self.tx.send(Mutation::Event(ev)).await.map_err(|_| self.closed())
    }

    /// Insert or overwrite a record; resolves before replying.
    pub async fn upsert(&self, record: Record) -> Result<BatchReport, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Mutation::Upsert { record, reply }).await.map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())
    }

    pub async fn remove(&self, id: RecordId) -> Result<Option<BatchReport>, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Mutation::Remove { id, reply }).await.map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())
    }

    /// Wait until every event sent before this call has been applied.
    pub async fn flush(&self) -> Result<u64, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Mutation::Flush { reply }).await.map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())
    }
}

struct Publisher {
    snap: Arc<ArcSwap<Collection>>,
    epoch_tx: watch::Sender<u64>,
}

impl Publisher {
    fn publish(&self, sync: &Synchronizer) {
        self.snap.store(Arc::new(sync.collection().clone()));
        let _ = self.epoch_tx.send(sync.epoch());
    }

    fn drain(&self, sync: &mut Synchronizer, coalescer: &mut Coalescer) -> Option<BatchReport> {
        let batch = coalescer.drain_ready();
        if batch.is_empty() { return None; }
        let report = sync.apply_batch(batch);
        self.publish(sync);
        Some(report)
    }
}

/// Spawn the task owning `sync`. Returns the handle used to reach it.
pub fn spawn_collection(sync: Synchronizer, settings: &Settings) -> CollectionHandle {
    let storage = sync.storage();
    let cap = settings.queue_cap;
    let tick = settings.tick();
    let (tx, mut rx) = mpsc::channel::<Mutation>(cap);
    let snap = Arc::new(ArcSwap::from_pointee(sync.collection().clone()));
    let (epoch_tx, epoch_rx) = watch::channel(sync.epoch());
    let publisher = Publisher { snap: Arc::clone(&snap), epoch_tx };

    tokio::spawn(async move {
        let mut sync = sync;
        let mut coalescer = Coalescer::with_capacity(cap);
        let mut ticker = tokio::time::interval(tick);
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(Mutation::Event(ev)) => {
                            coalescer.push(ev);
                            if coalescer.is_full() { publisher.drain(&mut sync, &mut coalescer); }
                        }
                        Some(Mutation::Upsert { record, reply }) => {
                            publisher.drain(&mut sync, &mut coalescer);
                            let report = sync.upsert(record);
                            publisher.publish(&sync);
                            let _ = reply.send(report);
                        }
                        Some(Mutation::Remove { id, reply }) => {
                            publisher.drain(&mut sync, &mut coalescer);
                            let report = sync.remove(id);
                            if report.is_some() { publisher.publish(&sync); }
                            let _ = reply.send(report);
                        }
                        Some(Mutation::Flush { reply }) => {
                            publisher.drain(&mut sync, &mut coalescer);
                            let _ = reply.send(sync.epoch());
                        }
                        None => {
                            debug!(storage = storage.as_str(), "mutation channel closed; draining and exiting");
                            publisher.drain(&mut sync, &mut coalescer);
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    publisher.drain(&mut sync, &mut coalescer);
                }
            }
        }
        info!(storage = storage.as_str(), "collection queue stopped");
    });

    CollectionHandle { storage, tx, snap, epoch_rx }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn added(path: &str, text: &str) -> SourceEvent { SourceEvent::Added { path: path.into(), text: text.into() } }

    #[test]
    fn coalescer_keeps_last_event_per_path_in_first_seen_order() {
        let mut c = Coalescer::with_capacity(8);
        c.push(added("a.yaml", "1"));
        c.push(added("b.yaml", "1"));
        c.push(SourceEvent::Removed { path: "a.yaml".into() });
        assert_eq!(c.len(), 2);
        let out = c.drain_ready();
        assert!(matches!(&out[0], SourceEvent::Removed { path } if path == "a.yaml"));
        assert!(matches!(&out[1], SourceEvent::Added { path, .. } if path == "b.yaml"));
        assert!(c.is_empty());
    }

    #[test]
    fn snapshot_discards_earlier_events_and_keeps_later_ones() {
        let mut c = Coalescer::with_capacity(8);
        c.push(added("a.yaml", "1"));
        c.push(SourceEvent::Replaced { records: vec![] });
        c.push(added("b.yaml", "1"));
        c.push(SourceEvent::Replaced { records: vec![serde_json::json!({ "kind": "ConfigMap" })] });
        c.push(added("c.yaml", "1"));
        let out = c.drain_ready();
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[0], SourceEvent::Replaced { records } if records.len() == 1));
        assert!(matches!(&out[1], SourceEvent::Added { path, .. } if path == "c.yaml"));
    }

    #[test]
    fn coalescer_reports_full() {
        let mut c = Coalescer::with_capacity(2);
        c.push(added("a.yaml", ""));
        assert!(!c.is_full());
        c.push(added("b.yaml", ""));
        assert!(c.is_full());
    }
}
