//! Built-in kind registry.
//!
//! Maps a `kind` to its scope, default apiVersion and the kubectl arguments
//! used to delete it in a cluster. Kinds discovered from a live cluster can be
//! merged in with [`KindRegistry::register`].

use std::collections::BTreeMap;

/// Wildcard kind accepted by reference rules that match any record.
pub const ANY_KIND: &str = "*";

/// Produces the kubectl argument vector deleting `(kind, name, namespace)`.
pub type DeleteHook = fn(&str, &str, Option<&str>) -> Vec<String>;

#[derive(Clone)]
pub struct KindInfo {
    pub kind: String,
    pub api_version: String,
    pub namespaced: bool,
    /// False for kinds that only exist on disk (Kustomization).
    pub cluster_resource: bool,
    pub delete_hook: Option<DeleteHook>,
}

impl std::fmt::Debug for KindInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KindInfo")
            .field("kind", &self.kind)
            .field("api_version", &self.api_version)
            .field("namespaced", &self.namespaced)
            .field("cluster_resource", &self.cluster_resource)
            .field("delete_hook", &self.delete_hook.is_some())
            .finish()
    }
}

fn delete_namespaced(kind: &str, name: &str, namespace: Option<&str>) -> Vec<String> {
    vec![
        "delete".into(),
        kind.to_ascii_lowercase(),
        name.into(),
        "--namespace".into(),
        namespace.unwrap_or(crate::DEFAULT_NAMESPACE).into(),
    ]
}

fn delete_cluster_scoped(kind: &str, name: &str, _namespace: Option<&str>) -> Vec<String> {
    vec!["delete".into(), kind.to_ascii_lowercase(), name.into()]
}

fn delete_namespace(_kind: &str, name: &str, _namespace: Option<&str>) -> Vec<String> {
    // kubectl waits for finalizers by default; the namespace is gone from our side already
    vec!["delete".into(), "namespace".into(), name.into(), "--wait=false".into()]
}

fn kind(kind: &str, api_version: &str, namespaced: bool) -> KindInfo {
    let hook: DeleteHook = if namespaced { delete_namespaced } else { delete_cluster_scoped };
    KindInfo {
        kind: kind.into(),
        api_version: api_version.into(),
        namespaced,
        cluster_resource: true,
        delete_hook: Some(hook),
    }
}

#[derive(Debug, Clone, Default)]
pub struct KindRegistry {
    kinds: BTreeMap<String, KindInfo>,
}

impl KindRegistry {
    pub fn empty() -> Self { Self::default() }

    pub fn builtin() -> Self {
        let mut reg = Self::default();
        for info in [
            kind("Pod", "v1", true),
            kind("ConfigMap", "v1", true),
            kind("Secret", "v1", true),
            kind("Service", "v1", true),
            kind("ServiceAccount", "v1", true),
            kind("PersistentVolumeClaim", "v1", true),
            kind("PersistentVolume", "v1", false),
            kind("Node", "v1", false),
            kind("Deployment", "apps/v1", true),
            kind("StatefulSet", "apps/v1", true),
            kind("DaemonSet", "apps/v1", true),
            kind("ReplicaSet", "apps/v1", true),
            kind("Job", "batch/v1", true),
            kind("CronJob", "batch/v1", true),
            kind("Ingress", "networking.k8s.io/v1", true),
            kind("NetworkPolicy", "networking.k8s.io/v1", true),
            kind("PodDisruptionBudget", "policy/v1", true),
            kind("HorizontalPodAutoscaler", "autoscaling/v2", true),
            kind("Role", "rbac.authorization.k8s.io/v1", true),
            kind("RoleBinding", "rbac.authorization.k8s.io/v1", true),
            kind("ClusterRole", "rbac.authorization.k8s.io/v1", false),
            kind("ClusterRoleBinding", "rbac.authorization.k8s.io/v1", false),
            kind("StorageClass", "storage.k8s.io/v1", false),
            kind("CustomResourceDefinition", "apiextensions.k8s.io/v1", false),
            KindInfo { delete_hook: Some(delete_namespace), ..kind("Namespace", "v1", false) },
            KindInfo { cluster_resource: false, delete_hook: None, ..kind("Kustomization", "kustomize.config.k8s.io/v1beta1", false) },
        ] {
            reg.register(info);
        }
        reg
    }

    /// Add or replace a kind. Discovery results override builtin entries.
    pub fn register(&mut self, info: KindInfo) { self.kinds.insert(info.kind.clone(), info); }

    pub fn get(&self, kind: &str) -> Option<&KindInfo> { self.kinds.get(kind) }

    pub fn is_recognized(&self, kind: &str) -> bool { kind == ANY_KIND || self.kinds.contains_key(kind) }

    /// Unknown kinds (CRDs not yet discovered) are treated as namespaced.
    pub fn is_namespaced(&self, kind: &str) -> bool { self.get(kind).map(|k| k.namespaced).unwrap_or(true) }

    pub fn is_cluster_resource(&self, kind: &str) -> bool { self.get(kind).map(|k| k.cluster_resource).unwrap_or(true) }

    /// Deletion arguments for a record, `None` for local-only kinds.
    pub fn delete_args(&self, kind: &str, name: &str, namespace: Option<&str>) -> Option<Vec<String>> {
        match self.get(kind) {
            Some(info) => info.delete_hook.map(|hook| hook(kind, name, namespace)),
            None => Some(delete_namespaced(kind, name, namespace)),
        }
    }

    pub fn kinds(&self) -> impl Iterator<Item = &KindInfo> { self.kinds.values() }

    pub fn len(&self) -> usize { self.kinds.len() }
    pub fn is_empty(&self) -> bool { self.kinds.is_empty() }
}

/// Convenience constructor for discovered kinds.
pub fn discovered_kind(kind_name: &str, api_version: &str, namespaced: bool) -> KindInfo { kind(kind_name, api_version, namespaced) }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_scopes() {
        let reg = KindRegistry::builtin();
        assert!(reg.is_namespaced("ConfigMap"));
        assert!(!reg.is_namespaced("ClusterRole"));
        assert!(reg.is_namespaced("SomeCrd"));
        assert!(reg.is_recognized(ANY_KIND));
        assert!(!reg.is_recognized("SomeCrd"));
        assert!(!reg.is_cluster_resource("Kustomization"));
    }

    #[test]
    fn delete_hooks_dispatch_by_scope() {
        let reg = KindRegistry::builtin();
        assert_eq!(
            reg.delete_args("ConfigMap", "cm", Some("ns1")).unwrap(),
            vec!["delete", "configmap", "cm", "--namespace", "ns1"]
        );
        assert_eq!(reg.delete_args("ClusterRole", "admin", Some("ns1")).unwrap(), vec!["delete", "clusterrole", "admin"]);
        assert_eq!(reg.delete_args("Namespace", "ns1", None).unwrap(), vec!["delete", "namespace", "ns1", "--wait=false"]);
        assert!(reg.delete_args("Kustomization", "k", None).is_none());
    }

    #[test]
    fn discovered_kinds_override_builtin() {
        let mut reg = KindRegistry::builtin();
        reg.register(discovered_kind("Certificate", "cert-manager.io/v1", true));
        reg.register(discovered_kind("Pod", "v1", false));
        assert!(reg.is_recognized("Certificate"));
        assert!(!reg.is_namespaced("Pod"));
    }
}
