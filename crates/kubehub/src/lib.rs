//! Manifold kubehub: discovery and wholesale cluster snapshots feeding the
//! cluster collection.

#![forbid(unsafe_code)]

use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use k8s_openapi::api::core::v1::Namespace;
use kube::{
    api::{Api, ListParams},
    config::{Config, KubeConfigOptions},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
};
use metrics::histogram;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use manifold_core::{registry::discovered_kind, Content, KindRegistry, SourceEvent};

pub use kube::Client;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    pub fn matches(&self, wanted: &KindQuery) -> bool {
        match wanted {
            KindQuery::Kind(kind) => self.kind.eq_ignore_ascii_case(kind),
            KindQuery::Gvk(gvk) => self.group == gvk.group && self.version == gvk.version && self.kind == gvk.kind,
        }
    }
}

/// A kind named on the command line: bare (`Deployment`, any group) or pinned
/// to a group and version (`v1/Pod`, `apps/v1/Deployment`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KindQuery {
    Kind(String),
    Gvk(GroupVersionKind),
}

impl KindQuery {
    pub fn parse(wanted: &str) -> Result<Self> {
        let wanted = wanted.trim();
        match wanted.split('/').collect::<Vec<_>>().as_slice() {
            [kind] if !kind.is_empty() => Ok(Self::Kind((*kind).to_string())),
            [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::Gvk(GroupVersionKind::gvk("", version, kind))),
            [group, version, kind] if [group, version, kind].iter().all(|p| !p.is_empty()) => Ok(Self::Gvk(GroupVersionKind::gvk(group, version, kind))),
            _ => Err(anyhow!("invalid kind {:?} (expect Kind, v1/Kind or group/v1/Kind)", wanted)),
        }
    }
}

/// Client for the default kubeconfig, or for `context` when given.
pub async fn client(context: Option<&str>) -> Result<Client> {
    match context {
        None => Client::try_default().await.context("loading default kube client"),
        Some(ctx) => {
            let opts = KubeConfigOptions { context: Some(ctx.to_string()), ..Default::default() };
            let config = Config::from_kubeconfig(&opts).await.with_context(|| format!("loading kube context {}", ctx))?;
            Client::try_from(config).context("building kube client")
        }
    }
}

async fn recommended(client: &Client) -> Result<Vec<(ApiResource, bool)>> {
    let discovery = Discovery::new(client.clone()).run().await.context("running discovery")?;
    let mut out = Vec::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            out.push((ar, matches!(caps.scope, Scope::Namespaced)));
        }
    }
    Ok(out)
}

fn describe(ar: &ApiResource, namespaced: bool) -> DiscoveredResource {
    DiscoveredResource { group: ar.group.clone(), version: ar.version.clone(), kind: ar.kind.clone(), namespaced }
}

/// Served resources (incl. CRDs), sorted by group, version, kind.
pub async fn discover(client: &Client) -> Result<Vec<DiscoveredResource>> {
    let mut out: Vec<DiscoveredResource> = recommended(client).await?.iter().map(|(ar, ns)| describe(ar, *ns)).collect();
    out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
    Ok(out)
}

/// Add served kinds the registry does not know yet. Known kinds keep their
/// builtin entries and delete hooks. Returns how many were added.
pub fn merge_kinds(registry: &mut KindRegistry, served: &[DiscoveredResource]) -> usize {
    let mut added = 0;
    for res in served {
        if registry.get(&res.kind).is_some() { continue; }
        registry.register(discovered_kind(&res.kind, &res.api_version(), res.namespaced));
        added += 1;
    }
    added
}

/// Discover served kinds and merge them into `registry`.
pub async fn discover_kinds(client: &Client, registry: &mut KindRegistry) -> Result<Vec<DiscoveredResource>> {
    let served = discover(client).await?;
    let added = merge_kinds(registry, &served);
    info!(served = served.len(), added, "kind discovery merged");
    Ok(served)
}

fn strip_managed_fields(v: &mut Content) {
    if let Some(obj) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        obj.remove("managedFields");
    }
}

/// List objects list responses omit `kind`/`apiVersion` on items; put them back.
fn to_content(obj: &DynamicObject, ar: &ApiResource) -> Result<Content> {
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut raw);
    if let Some(map) = raw.as_object_mut() {
        map.entry("apiVersion").or_insert_with(|| Content::String(ar.api_version.clone()));
        map.entry("kind").or_insert_with(|| Content::String(ar.kind.clone()));
    }
    Ok(raw)
}

/// List every requested kind and wrap the result as one wholesale snapshot.
/// Unknown kinds are skipped with a warning; list failures abort.
pub async fn cluster_snapshot(client: &Client, kinds: &[String], namespace: Option<&str>) -> Result<SourceEvent> {
    let t0 = Instant::now();
    let queries = kinds.iter().map(|k| KindQuery::parse(k)).collect::<Result<Vec<_>>>()?;
    let served = recommended(client).await?;
    let mut records = Vec::new();
    for (wanted, query) in kinds.iter().zip(queries.iter()) {
        let Some((ar, namespaced)) = served.iter().find(|(ar, ns)| describe(ar, *ns).matches(query)) else {
            warn!(kind = %wanted, "kind not served by cluster; skipped");
            continue;
        };
        let api: Api<DynamicObject> = match (*namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(client.clone(), ns, ar),
            _ => Api::all_with(client.clone(), ar),
        };
        let list = api.list(&ListParams::default()).await.with_context(|| format!("listing {}", ar.kind))?;
        debug!(kind = %ar.kind, count = list.items.len(), "listed");
        for obj in list.items.iter() {
            records.push(to_content(obj, ar)?);
        }
    }
    histogram!("cluster_snapshot_ms", t0.elapsed().as_secs_f64() * 1000.0);
    info!(kinds = kinds.len(), records = records.len(), ns = ?namespace, "cluster snapshot taken");
    Ok(SourceEvent::Replaced { records })
}

pub async fn namespace_exists(client: &Client, ns: &str) -> Result<bool> {
    let api: Api<Namespace> = Api::all(client.clone());
    Ok(api.get_opt(ns).await.with_context(|| format!("looking up namespace {}", ns))?.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(group: &str, kind: &str, namespaced: bool) -> DiscoveredResource {
        DiscoveredResource { group: group.into(), version: "v1".into(), kind: kind.into(), namespaced }
    }

    #[test]
    fn kind_queries_parse_bare_and_pinned_forms() {
        assert_eq!(KindQuery::parse("Pod").unwrap(), KindQuery::Kind("Pod".into()));
        let KindQuery::Gvk(core) = KindQuery::parse("v1/Pod").unwrap() else { panic!("expected gvk") };
        assert_eq!((core.group.as_str(), core.version.as_str(), core.kind.as_str()), ("", "v1", "Pod"));
        let KindQuery::Gvk(apps) = KindQuery::parse("apps/v1/Deployment").unwrap() else { panic!("expected gvk") };
        assert_eq!(apps.group, "apps");
        for bad in ["", "apps//Deployment", "a/b/c/d", "v1/"] {
            assert!(KindQuery::parse(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn resources_match_bare_kind_or_pinned_gvk() {
        let q = |s: &str| KindQuery::parse(s).unwrap();
        let d = res("apps", "Deployment", true);
        assert!(d.matches(&q("deployment")));
        assert!(d.matches(&q("apps/v1/Deployment")));
        assert!(!d.matches(&q("v1/Deployment")));
        assert!(res("", "Pod", true).matches(&q("v1/Pod")));
        assert_eq!(d.api_version(), "apps/v1");
        assert_eq!(res("", "Pod", true).api_version(), "v1");
    }

    #[test]
    fn merge_keeps_builtin_entries() {
        let mut reg = KindRegistry::builtin();
        let before = reg.len();
        let served = vec![res("", "Namespace", true), res("example.com", "Widget", false)];
        assert_eq!(merge_kinds(&mut reg, &served), 1);
        assert_eq!(reg.len(), before + 1);
        assert!(!reg.is_namespaced("Namespace"));
        assert!(!reg.is_namespaced("Widget"));
        assert_eq!(reg.get("Widget").unwrap().api_version, "example.com/v1");
    }

    #[test]
    fn managed_fields_are_dropped() {
        let mut v = serde_json::json!({ "metadata": { "name": "x", "managedFields": [] } });
        strip_managed_fields(&mut v);
        assert_eq!(v, serde_json::json!({ "metadata": { "name": "x" } }));
    }
}
