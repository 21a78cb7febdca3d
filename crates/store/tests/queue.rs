#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use manifold_core::{KindRegistry, RefStatus, Settings, SourceEvent, Storage, YamlCodec};
use manifold_mapping::Catalog;
use manifold_store::{spawn_collection, Store, Synchronizer};

fn cm(name: &str, n: usize) -> String {
    format!("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {name}\n  namespace: ns1\ndata:\n  n: \"{n}\"\n")
}

fn synchronizer() -> Synchronizer {
    let registry = KindRegistry::builtin();
    let catalog = Catalog::builtin(&registry);
    Synchronizer::new(Storage::Local, Arc::new(catalog), Arc::new(registry), Arc::new(YamlCodec::new()))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn coalesced_updates_land_on_last_write() {
    let handle = spawn_collection(synchronizer(), &Settings { tick_ms: 50, ..Settings::default() });
    for n in 0..20 {
        handle.send(SourceEvent::Updated { path: "cm.yaml".into(), text: cm("app", n) }).await.unwrap();
    }
    let epoch = handle.flush().await.unwrap();
    assert!(epoch >= 1);

    let snap = handle.current();
    assert_eq!(snap.len(), 1);
    let record = snap.iter().next().unwrap();
    assert_eq!(record.content()["data"]["n"], serde_json::json!("19"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn epoch_watch_observes_ticks() {
    let handle = spawn_collection(synchronizer(), &Settings::default());
    let mut rx = handle.subscribe_epoch();
    handle.send(SourceEvent::Added { path: "a.yaml".into(), text: cm("a", 0) }).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), rx.changed()).await.unwrap().unwrap();
    assert!(*rx.borrow() >= 1);
    assert_eq!(handle.current().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn store_routes_per_storage_and_serializes_mutations() {
    let registry = KindRegistry::builtin();
    let catalog = Arc::new(Catalog::builtin(&registry));
    let store = Store::spawn(catalog, Arc::new(registry), Arc::new(YamlCodec::new()), &Settings::default());

    let deploy = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\n  namespace: ns1\nspec:\n  template:\n    spec:\n      containers:\n        - name: web\n          envFrom:\n            - configMapRef:\n                name: app\n";
    store.local().send(SourceEvent::Added { path: "d.yaml".into(), text: deploy.into() }).await.unwrap();
    store.local().send(SourceEvent::Added { path: "cm.yaml".into(), text: cm("app", 1) }).await.unwrap();
    store.local().flush().await.unwrap();

    let local = store.local().current();
    assert_eq!(local.len(), 2);
    assert!(store.cluster().current().is_empty());
    let web = local.iter().find(|r| r.kind == "Deployment").unwrap();
    assert_eq!(web.outgoing[0].status(), RefStatus::Satisfied);

    let copy = local.iter().find(|r| r.kind == "ConfigMap").unwrap().clone();
    let report = store.cluster().upsert(copy).await.unwrap();
    assert_eq!(report.created.len(), 1);
    assert_eq!(store.cluster().current().len(), 1);
    assert_eq!(store.cluster().current().iter().next().unwrap().storage, Storage::Cluster);

    let id = report.created[0];
    assert!(store.cluster().remove(id).await.unwrap().is_some());
    assert!(store.cluster().current().is_empty());
}
