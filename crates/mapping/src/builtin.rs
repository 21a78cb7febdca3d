//! Builtin reference rules for core Kubernetes kinds.

use manifold_core::RefKind;

use crate::rule::{NamespaceMode, RefMapperSpec};

/// Kinds carrying a pod template, with the path to the pod spec.
const POD_SPECS: &[(&str, &str)] = &[
    ("Pod", "spec"),
    ("Deployment", "spec.template.spec"),
    ("StatefulSet", "spec.template.spec"),
    ("DaemonSet", "spec.template.spec"),
    ("ReplicaSet", "spec.template.spec"),
    ("Job", "spec.template.spec"),
    ("CronJob", "spec.jobTemplate.spec.template.spec"),
];

/// Kinds whose pods are selected by their template labels.
const TEMPLATED: &[(&str, &str)] = &[
    ("Deployment", "spec.template.metadata.labels"),
    ("StatefulSet", "spec.template.metadata.labels"),
    ("DaemonSet", "spec.template.metadata.labels"),
    ("ReplicaSet", "spec.template.metadata.labels"),
];

const OWNERS: &[&str] = &["ReplicaSet", "Deployment", "StatefulSet", "DaemonSet", "Job", "CronJob"];

pub const SA_SECRETS_RULE: &str = "serviceaccount-secrets";
pub const SECRET_SA_RULE: &str = "secret-serviceaccount-annotation";

fn id(kind: &str, suffix: &str) -> String { format!("{}-{}", kind.to_ascii_lowercase(), suffix) }

fn pod_spec_rules(kind: &str, p: &str, out: &mut Vec<RefMapperSpec>) {
    use RefKind::ConfigConsumer as C;
    for c in ["containers", "initContainers"] {
        let lc = c.to_ascii_lowercase();
        out.push(RefMapperSpec::new(id(kind, &format!("{lc}-envfrom-configmap")), kind, &format!("{p}.{c}[].envFrom[].configMapRef.name"), "ConfigMap", C));
        out.push(RefMapperSpec::new(id(kind, &format!("{lc}-envfrom-secret")), kind, &format!("{p}.{c}[].envFrom[].secretRef.name"), "Secret", C));
        out.push(RefMapperSpec::new(id(kind, &format!("{lc}-env-configmap")), kind, &format!("{p}.{c}[].env[].valueFrom.configMapKeyRef.name"), "ConfigMap", C));
        out.push(RefMapperSpec::new(id(kind, &format!("{lc}-env-secret")), kind, &format!("{p}.{c}[].env[].valueFrom.secretKeyRef.name"), "Secret", C));
    }
    out.push(RefMapperSpec::new(id(kind, "volume-configmap"), kind, &format!("{p}.volumes[].configMap.name"), "ConfigMap", C));
    out.push(RefMapperSpec::new(id(kind, "volume-secret"), kind, &format!("{p}.volumes[].secret.secretName"), "Secret", C));
    out.push(RefMapperSpec::new(id(kind, "projected-configmap"), kind, &format!("{p}.volumes[].projected.sources[].configMap.name"), "ConfigMap", C));
    out.push(RefMapperSpec::new(id(kind, "projected-secret"), kind, &format!("{p}.volumes[].projected.sources[].secret.name"), "Secret", C));
    out.push(RefMapperSpec::new(id(kind, "volume-claim"), kind, &format!("{p}.volumes[].persistentVolumeClaim.claimName"), "PersistentVolumeClaim", C));
    out.push(RefMapperSpec::new(id(kind, "serviceaccount"), kind, &format!("{p}.serviceAccountName"), "ServiceAccount", C));
    out.push(RefMapperSpec::new(id(kind, "image-pull-secret"), kind, &format!("{p}.imagePullSecrets[].name"), "Secret", C));
}

fn selector_rules(kind: &str, selector: &str, out: &mut Vec<RefMapperSpec>) {
    use RefKind::SelectorMatch as S;
    out.push(RefMapperSpec::new(id(kind, "selects-pod"), kind, selector, "Pod", S).selector("metadata.labels"));
    for (target, labels) in TEMPLATED {
        out.push(RefMapperSpec::new(id(kind, &format!("selects-{}", target.to_ascii_lowercase())), kind, selector, target, S).selector(labels));
    }
}

/// The full builtin rule table.
pub fn rules() -> Vec<RefMapperSpec> {
    use RefKind::{ConfigConsumer as C, ParentChild as P};
    let mut out = Vec::new();

    for field in ["resources", "bases", "components", "patchesStrategicMerge"] {
        out.push(
            RefMapperSpec::new(id("Kustomization", &field.to_ascii_lowercase()), "Kustomization", field, manifold_core::ANY_KIND, P)
                .relative_path()
                .namespace(NamespaceMode::None),
        );
    }

    for (kind, p) in POD_SPECS {
        pod_spec_rules(kind, p, &mut out);
    }

    selector_rules("Service", "spec.selector", &mut out);
    selector_rules("NetworkPolicy", "spec.podSelector.matchLabels", &mut out);
    selector_rules("PodDisruptionBudget", "spec.selector.matchLabels", &mut out);

    out.push(RefMapperSpec::new(id("ServiceAccount", "image-pull-secret"), "ServiceAccount", "imagePullSecrets[].name", "Secret", C));
    out.push(RefMapperSpec::new(SA_SECRETS_RULE, "ServiceAccount", "secrets[].name", "Secret", C).pair(SECRET_SA_RULE));
    out.push(
        RefMapperSpec::new(SECRET_SA_RULE, "Secret", r#"metadata.annotations["kubernetes.io/service-account.name"]"#, "ServiceAccount", C)
            .pair(SA_SECRETS_RULE),
    );

    out.push(RefMapperSpec::new(id("Ingress", "backend-service"), "Ingress", "spec.rules[].http.paths[].backend.service.name", "Service", C));
    out.push(RefMapperSpec::new(id("Ingress", "default-backend"), "Ingress", "spec.defaultBackend.service.name", "Service", C));
    out.push(RefMapperSpec::new(id("Ingress", "tls-secret"), "Ingress", "spec.tls[].secretName", "Secret", C));

    out.push(RefMapperSpec::new(id("RoleBinding", "role"), "RoleBinding", "roleRef.name", "Role", C).guard("kind", "Role"));
    out.push(
        RefMapperSpec::new(id("RoleBinding", "clusterrole"), "RoleBinding", "roleRef.name", "ClusterRole", C)
            .guard("kind", "ClusterRole")
            .namespace(NamespaceMode::None),
    );
    out.push(
        RefMapperSpec::new(id("RoleBinding", "subject-serviceaccount"), "RoleBinding", "subjects[].name", "ServiceAccount", C)
            .guard("kind", "ServiceAccount")
            .namespace(NamespaceMode::OptionalExplicit("namespace".into())),
    );
    out.push(
        RefMapperSpec::new(id("ClusterRoleBinding", "clusterrole"), "ClusterRoleBinding", "roleRef.name", "ClusterRole", C)
            .guard("kind", "ClusterRole")
            .namespace(NamespaceMode::None),
    );
    out.push(
        RefMapperSpec::new(id("ClusterRoleBinding", "subject-serviceaccount"), "ClusterRoleBinding", "subjects[].name", "ServiceAccount", C)
            .guard("kind", "ServiceAccount")
            .namespace(NamespaceMode::Explicit("namespace".into())),
    );

    out.push(
        RefMapperSpec::new(id("PersistentVolumeClaim", "storageclass"), "PersistentVolumeClaim", "spec.storageClassName", "StorageClass", C)
            .namespace(NamespaceMode::None),
    );
    out.push(
        RefMapperSpec::new(id("PersistentVolumeClaim", "volume"), "PersistentVolumeClaim", "spec.volumeName", "PersistentVolume", C)
            .namespace(NamespaceMode::None),
    );

    for target in ["Deployment", "StatefulSet", "ReplicaSet"] {
        out.push(
            RefMapperSpec::new(
                id("HorizontalPodAutoscaler", &format!("scale-{}", target.to_ascii_lowercase())),
                "HorizontalPodAutoscaler",
                "spec.scaleTargetRef.name",
                target,
                P,
            )
            .guard("kind", target),
        );
    }

    // Owner references apply to any kind; expanded for the kinds that own pods.
    for (kind, _) in POD_SPECS {
        for owner in OWNERS {
            out.push(
                RefMapperSpec::new(id(kind, &format!("owner-{}", owner.to_ascii_lowercase())), kind, "metadata.ownerReferences[].name", owner, P)
                    .guard("kind", owner),
            );
        }
    }

    out
}
