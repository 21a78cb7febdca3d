//! Manifold store: the incremental synchronizer and the mutation queues that
//! serialize every write to a collection.

#![forbid(unsafe_code)]

mod queue;
mod sync;

use std::collections::BTreeMap;
use std::sync::Arc;

use manifold_core::{ContentCodec, KindRegistry, Settings, Storage};
use manifold_mapping::Catalog;

pub use queue::{spawn_collection, CollectionHandle, Coalescer, Mutation, StoreError};
pub use sync::{BatchReport, Synchronizer};

/// One mutation queue per storage tag, shared by every component by reference.
#[derive(Clone)]
pub struct Store {
    handles: BTreeMap<Storage, CollectionHandle>,
}

impl Store {
    /// Spawn a queue for every storage tag. Must be called inside a tokio runtime.
    pub fn spawn(catalog: Arc<Catalog>, registry: Arc<KindRegistry>, codec: Arc<dyn ContentCodec>, settings: &Settings) -> Self {
        let handles = Storage::ALL
            .iter()
            .map(|s| {
                let sync = Synchronizer::new(*s, Arc::clone(&catalog), Arc::clone(&registry), Arc::clone(&codec));
                (*s, spawn_collection(sync, settings))
            })
            .collect();
        Self { handles }
    }

    pub fn collection(&self, storage: Storage) -> &CollectionHandle {
        // every tag is spawned in `spawn`
        &self.handles[&storage]
    }

    pub fn local(&self) -> &CollectionHandle { self.collection(Storage::Local) }
    pub fn cluster(&self) -> &CollectionHandle { self.collection(Storage::Cluster) }
}
