#![forbid(unsafe_code)]

use manifold_core::{Collection, Content, KindRegistry, Origin, RecordId, RecordOverrides, RefKind, RefStatus, Storage, YamlCodec};
use manifold_mapping::Catalog;
use manifold_resolve::Resolver;
use serde_json::json;

fn add(col: &mut Collection, v: Content) -> RecordId {
    col.create(v, RecordOverrides::default(), &YamlCodec::new()).unwrap()
}

fn add_file(col: &mut Collection, v: Content, path: &str, name: Option<&str>) -> RecordId {
    let ov = RecordOverrides {
        name: name.map(str::to_string),
        origin: Some(Origin { path: path.into(), doc_index: 0 }),
        ..Default::default()
    };
    col.create(v, ov, &YamlCodec::new()).unwrap()
}

fn deployment(name: &str, ns: &str, cm: &str) -> Content {
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": { "name": name, "namespace": ns },
        "spec": { "template": {
            "metadata": { "labels": { "app": name } },
            "spec": { "containers": [ { "name": "c", "envFrom": [ { "configMapRef": { "name": cm } } ] } ] }
        } }
    })
}

fn config_map(name: &str, ns: &str) -> Content {
    json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": name, "namespace": ns } })
}

fn pod(name: &str, ns: &str, labels: Content) -> Content {
    json!({ "apiVersion": "v1", "kind": "Pod", "metadata": { "name": name, "namespace": ns, "labels": labels } })
}

fn service(name: &str, ns: &str, selector: Content) -> Content {
    json!({ "apiVersion": "v1", "kind": "Service", "metadata": { "name": name, "namespace": ns }, "spec": { "selector": selector } })
}

fn setup() -> (Catalog, KindRegistry) {
    let reg = KindRegistry::builtin();
    (Catalog::builtin(&reg), reg)
}

#[test]
fn deployment_envfrom_configmap_is_satisfied_then_unsatisfied_after_delete() {
    let (cat, reg) = setup();
    let resolver = Resolver::new(&cat, &reg);
    let mut col = Collection::new(Storage::Local);
    let web = add(&mut col, deployment("web", "ns1", "web-config"));
    let cm = add(&mut col, config_map("web-config", "ns1"));

    resolver.resolve_all(&mut col);
    let out = &col.get(web).unwrap().outgoing;
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].status(), RefStatus::Satisfied);
    assert_eq!(out[0].ref_kind, RefKind::ConfigConsumer);
    assert_eq!(out[0].target_id(), Some(cm));
    assert_eq!(col.get(cm).unwrap().incoming.len(), 1);

    let removed = col.delete(cm).unwrap();
    let affected: Vec<RecordId> = removed.incoming.iter().map(|e| e.source).collect();
    resolver.resolve(&mut col, &affected);
    let out = &col.get(web).unwrap().outgoing;
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].status(), RefStatus::Unsatisfied);
    assert!(col.iter().all(|r| !r.touches(cm)));
    assert!(col.edges_consistent());
}

#[test]
fn resolving_twice_is_idempotent() {
    let (cat, reg) = setup();
    let resolver = Resolver::new(&cat, &reg);
    let mut col = Collection::new(Storage::Local);
    add(&mut col, deployment("web", "ns1", "web-config"));
    add(&mut col, config_map("web-config", "ns1"));
    add(&mut col, service("web", "ns1", json!({ "app": "web" })));
    add(&mut col, pod("web-1", "ns1", json!({ "app": "web" })));

    let first = resolver.resolve_all(&mut col);
    assert!(!first.added.is_empty());
    let snapshot: Vec<_> = col.iter().map(|r| (r.outgoing.clone(), r.incoming.clone())).collect();
    let second = resolver.resolve_all(&mut col);
    assert!(second.is_noop());
    let again: Vec<_> = col.iter().map(|r| (r.outgoing.clone(), r.incoming.clone())).collect();
    assert_eq!(snapshot, again);
    assert!(col.edges_consistent());
}

#[test]
fn configmap_in_another_namespace_does_not_satisfy() {
    let (cat, reg) = setup();
    let resolver = Resolver::new(&cat, &reg);
    let mut col = Collection::new(Storage::Local);
    let web = add(&mut col, deployment("web", "ns1", "web-config"));
    add(&mut col, config_map("web-config", "ns2"));
    resolver.resolve_all(&mut col);
    let out = &col.get(web).unwrap().outgoing;
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].status(), RefStatus::Unsatisfied);
}

#[test]
fn service_selector_fans_out_and_empty_selector_matches_nothing() {
    let (cat, reg) = setup();
    let resolver = Resolver::new(&cat, &reg);
    let mut col = Collection::new(Storage::Local);
    let svc = add(&mut col, service("web", "ns1", json!({ "app": "web" })));
    let empty = add(&mut col, service("all", "ns1", json!({})));
    let lost = add(&mut col, service("lost", "ns1", json!({ "app": "nope" })));
    let p1 = add(&mut col, pod("web-1", "ns1", json!({ "app": "web", "pod-template-hash": "x" })));
    let p2 = add(&mut col, pod("web-2", "ns1", json!({ "app": "web" })));
    add(&mut col, pod("other", "ns1", json!({ "app": "db" })));
    add(&mut col, pod("web-elsewhere", "ns2", json!({ "app": "web" })));
    let dep = add(&mut col, deployment("web", "ns1", "none"));

    resolver.resolve_all(&mut col);

    let targets: Vec<RecordId> = col.get(svc).unwrap().outgoing.iter().filter_map(|e| e.target_id()).collect();
    assert_eq!(targets, vec![p1, p2, dep]);
    assert!(col.get(svc).unwrap().outgoing.iter().all(|e| e.ref_kind == RefKind::SelectorMatch));

    for id in [empty, lost] {
        let out = &col.get(id).unwrap().outgoing;
        assert_eq!(out.len(), 1);
        assert!(out.iter().all(|e| e.status() == RefStatus::Unresolved), "{:?}", out);
    }
    assert!(col.edges_consistent());
}

#[test]
fn explicit_namespace_modes() {
    let (cat, reg) = setup();
    let resolver = Resolver::new(&cat, &reg);
    let mut col = Collection::new(Storage::Local);
    let sa = add(&mut col, json!({ "apiVersion": "v1", "kind": "ServiceAccount", "metadata": { "name": "bot", "namespace": "ops" } }));
    add(&mut col, json!({ "apiVersion": "rbac.authorization.k8s.io/v1", "kind": "ClusterRole", "metadata": { "name": "view" } }));
    let crb = add(&mut col, json!({
        "apiVersion": "rbac.authorization.k8s.io/v1",
        "kind": "ClusterRoleBinding",
        "metadata": { "name": "bot-view" },
        "roleRef": { "kind": "ClusterRole", "name": "view" },
        "subjects": [
            { "kind": "ServiceAccount", "name": "bot", "namespace": "ops" },
            { "kind": "ServiceAccount", "name": "bot" },
            { "kind": "User", "name": "alice" }
        ]
    }));
    let rb = add(&mut col, json!({
        "apiVersion": "rbac.authorization.k8s.io/v1",
        "kind": "RoleBinding",
        "metadata": { "name": "bot-edit", "namespace": "ops" },
        "roleRef": { "kind": "ClusterRole", "name": "view" },
        "subjects": [ { "kind": "ServiceAccount", "name": "bot" } ]
    }));

    resolver.resolve_all(&mut col);

    let statuses: Vec<(String, RefStatus)> = col.get(crb).unwrap().outgoing.iter().map(|e| (e.value.clone(), e.status())).collect();
    assert_eq!(
        statuses,
        vec![
            ("view".to_string(), RefStatus::Satisfied),
            ("bot".to_string(), RefStatus::Satisfied),
            ("bot".to_string(), RefStatus::Unresolved),
        ]
    );
    // optional-explicit falls back to the binding's namespace; cluster role ignores namespace
    let rb_out = &col.get(rb).unwrap().outgoing;
    assert_eq!(rb_out.len(), 2);
    assert!(rb_out.iter().all(|e| e.status() == RefStatus::Satisfied));
    assert_eq!(col.get(sa).unwrap().incoming.len(), 2);
}

#[test]
fn paired_rules_need_reciprocation() {
    let (cat, reg) = setup();
    let resolver = Resolver::new(&cat, &reg);
    let mut col = Collection::new(Storage::Local);
    let sa = add(&mut col, json!({
        "apiVersion": "v1", "kind": "ServiceAccount",
        "metadata": { "name": "builder", "namespace": "ci" },
        "secrets": [ { "name": "builder-token" }, { "name": "stray" } ]
    }));
    let token = add(&mut col, json!({
        "apiVersion": "v1", "kind": "Secret",
        "metadata": { "name": "builder-token", "namespace": "ci",
            "annotations": { "kubernetes.io/service-account.name": "builder" } }
    }));
    let stray = add(&mut col, json!({ "apiVersion": "v1", "kind": "Secret", "metadata": { "name": "stray", "namespace": "ci" } }));

    resolver.resolve_all(&mut col);

    let sa_out = &col.get(sa).unwrap().outgoing;
    let to_token = sa_out.iter().find(|e| e.target_id() == Some(token)).unwrap();
    let to_stray = sa_out.iter().find(|e| e.target_id() == Some(stray)).unwrap();
    assert_eq!(to_token.status(), RefStatus::Satisfied);
    assert_eq!(to_stray.status(), RefStatus::Informational);

    let token_out = &col.get(token).unwrap().outgoing;
    assert_eq!(token_out.len(), 1);
    assert_eq!(token_out[0].status(), RefStatus::Satisfied);
    assert_eq!(col.get(stray).unwrap().incoming.len(), 1);
    assert!(col.edges_consistent());

    // dropping the annotation downgrades the forward edge once the SA is reprocessed
    let mut plain = col.get(token).unwrap().content().clone();
    plain["metadata"]["annotations"] = json!({});
    col.update_content(token, plain, &YamlCodec::new()).unwrap();
    resolver.resolve(&mut col, &[token, sa]);
    let to_token = col.get(sa).unwrap().outgoing.iter().find(|e| e.target_id() == Some(token)).cloned().unwrap();
    assert_eq!(to_token.status(), RefStatus::Informational);
    assert!(col.get(token).unwrap().outgoing.is_empty());
}

#[test]
fn unreadable_path_aborts_only_that_rule() {
    let (cat, reg) = setup();
    let resolver = Resolver::new(&cat, &reg);
    let mut col = Collection::new(Storage::Local);
    let bad = add(&mut col, json!({
        "apiVersion": "v1", "kind": "Pod",
        "metadata": { "name": "odd", "namespace": "ns1" },
        "spec": { "containers": "not-a-list", "serviceAccountName": "bot" }
    }));
    let sa = add(&mut col, json!({ "apiVersion": "v1", "kind": "ServiceAccount", "metadata": { "name": "bot", "namespace": "ns1" } }));

    let outcome = resolver.resolve_all(&mut col);
    assert!(outcome.rule_errors > 0);
    let out = &col.get(bad).unwrap().outgoing;
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].target_id(), Some(sa));
}

#[test]
fn kustomization_overlays_reference_bases_and_files() {
    let (cat, reg) = setup();
    let resolver = Resolver::new(&cat, &reg);
    let mut col = Collection::new(Storage::Local);
    let kust = |resources: Content| json!({ "apiVersion": "kustomize.config.k8s.io/v1beta1", "kind": "Kustomization", "resources": resources });
    let base = add_file(&mut col, kust(json!(["cm.yaml"])), "app/base/kustomization.yaml", Some("base"));
    let cm = add_file(&mut col, config_map("settings", "default"), "app/base/cm.yaml", None);
    let overlay = add_file(&mut col, kust(json!(["../../base", "../../missing"])), "app/overlays/prod/kustomization.yaml", Some("prod"));

    resolver.resolve_all(&mut col);

    let out = &col.get(overlay).unwrap().outgoing;
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].target_id(), Some(base));
    assert_eq!(out[0].ref_kind, RefKind::ParentChild);
    assert_eq!(out[1].status(), RefStatus::Unsatisfied);
    assert_eq!(col.get(base).unwrap().outgoing[0].target_id(), Some(cm));
}

#[test]
fn invalid_records_keep_their_edges_and_are_skipped() {
    let (cat, reg) = setup();
    let resolver = Resolver::new(&cat, &reg);
    let mut col = Collection::new(Storage::Local);
    let web = add(&mut col, deployment("web", "ns1", "web-config"));
    add(&mut col, config_map("web-config", "ns1"));
    resolver.resolve_all(&mut col);
    col.get_mut(web).unwrap().mark_invalid("bad yaml");
    let outcome = resolver.resolve(&mut col, &[web]);
    assert_eq!(outcome.processed, 0);
    assert_eq!(col.get(web).unwrap().outgoing.len(), 1);
}
