use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use manifold_core::{Content, ContentCodec, CoreError, KindRegistry, Record, RecordOverrides, Settings, Storage};
use manifold_store::{BatchReport, Store, StoreError};

use crate::process::{CancelSignal, CommandSpec, ProcessError, ProcessOutput, ProcessRunner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    ToCluster,
    ToLocal,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ToCluster => "to-cluster",
            Direction::ToLocal => "to-local",
        }
    }

    pub fn storage(&self) -> Storage {
        match self {
            Direction::ToCluster => Storage::Cluster,
            Direction::ToLocal => Storage::Local,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransferOptions {
    /// Target namespace; defaults to the source record's namespace.
    pub namespace: Option<String>,
    /// Create the namespace before applying, and delete it again if the apply fails.
    pub create_namespace: bool,
    /// Overrides the configured transfer timeout for each kubectl call.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferOutcome {
    pub record: Record,
    /// Non-fatal notes: kubectl warnings, refetch fallbacks.
    pub warnings: Vec<String>,
    /// Whether the record content came back from the cluster.
    pub refetched: bool,
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("{kind} only exists locally and cannot be applied to a cluster")]
    NotClusterResource { kind: String },
    #[error("creating namespace {namespace} failed: {detail}")]
    NamespaceCreate { namespace: String, detail: String },
    #[error("apply failed: {detail}")]
    Apply {
        detail: String,
        /// Objects kubectl reported as applied before the failure.
        applied: Vec<String>,
        /// Set when a namespace created for this transfer was deleted again.
        namespace_rolled_back: bool,
    },
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: &'static str, after: Duration },
    #[error("transfer cancelled; object present in cluster afterwards: {present:?}")]
    Cancelled {
        /// Ground truth re-queried after cancelling; `None` when the query failed.
        present: Option<bool>,
    },
    #[error("delete failed: {detail}")]
    Delete { detail: String },
    #[error(transparent)]
    Process(ProcessError),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Drop server-populated fields so refetched content compares cleanly
/// against manifests.
pub fn strip_noisy(mut v: Content) -> Content {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        for key in ["managedFields", "resourceVersion", "generation", "creationTimestamp", "uid", "selfLink"] {
            meta.remove(key);
        }
        if let Some(annotations) = meta.get_mut("annotations").and_then(|a| a.as_object_mut()) {
            annotations.remove("kubectl.kubernetes.io/last-applied-configuration");
            if annotations.is_empty() { meta.remove("annotations"); }
        }
    }
    if let Some(obj) = v.as_object_mut() { obj.remove("status"); }
    v
}

/// Lines of `kubectl apply` output naming an object it acted on
/// (`configmap/web created`, `... configured`, `... unchanged`).
pub fn applied_lines(stdout: &str) -> Vec<String> {
    const VERBS: [&str; 4] = [" created", " configured", " unchanged", " serverside-applied"];
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| l.contains('/') && VERBS.iter().any(|v| l.ends_with(v)))
        .map(str::to_string)
        .collect()
}

fn failure_detail(out: &ProcessOutput) -> String {
    let stderr = out.stderr.trim();
    if stderr.is_empty() {
        format!("exit code {:?}", out.exit_code)
    } else {
        stderr.to_string()
    }
}

pub struct Orchestrator {
    runner: Arc<dyn ProcessRunner>,
    registry: Arc<KindRegistry>,
    codec: Arc<dyn ContentCodec>,
    settings: Settings,
}

impl Orchestrator {
    pub fn new(runner: Arc<dyn ProcessRunner>, registry: Arc<KindRegistry>, codec: Arc<dyn ContentCodec>, settings: Settings) -> Self {
        Self { runner, registry, codec, settings }
    }

    fn kubectl<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut spec = CommandSpec::new(self.settings.kubectl.as_str());
        if let Some(ctx) = self.settings.kube_context.as_deref() {
            spec = spec.args(["--context", ctx]);
        }
        spec.args(args)
    }

    async fn run(&self, spec: &CommandSpec, timeout: Duration, cancel: &mut CancelSignal) -> Result<ProcessOutput, ProcessError> {
        debug!(command = %spec.display(), "running");
        self.runner.run(spec, timeout, cancel).await
    }

    /// Copy `source` into the collection `direction` points at. A supplied
    /// `target` is overwritten in place and keeps its id.
    ///
    /// The returned record is not committed anywhere; see [`Self::transfer_into`].
    pub async fn transfer(
        &self,
        source: &Record,
        target: Option<&Record>,
        direction: Direction,
        opts: &TransferOptions,
        cancel: &mut CancelSignal,
    ) -> Result<TransferOutcome, TransferError> {
        let t0 = Instant::now();
        let res = match direction {
            Direction::ToLocal => self.copy_local(source, target),
            Direction::ToCluster => self.apply_to_cluster(source, target, opts, cancel).await,
        };
        histogram!("transfer_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "direction" => direction.as_str());
        match &res {
            Ok(out) => {
                counter!("transfer_ok", 1u64, "direction" => direction.as_str());
                info!(direction = direction.as_str(), kind = %source.kind, name = %source.name, warnings = out.warnings.len(), "transfer done");
            }
            Err(e) => {
                counter!("transfer_err", 1u64, "direction" => direction.as_str());
                warn!(direction = direction.as_str(), kind = %source.kind, name = %source.name, error = %e, "transfer failed");
            }
        }
        res
    }

    /// Transfer, then commit the result through the destination collection's
    /// mutation queue.
    pub async fn transfer_into(
        &self,
        store: &Store,
        source: &Record,
        target: Option<&Record>,
        direction: Direction,
        opts: &TransferOptions,
        cancel: &mut CancelSignal,
    ) -> Result<(TransferOutcome, BatchReport), TransferError> {
        let outcome = self.transfer(source, target, direction, opts, cancel).await?;
        let report = store.collection(direction.storage()).upsert(outcome.record.clone()).await?;
        Ok((outcome, report))
    }

    fn copy_local(&self, source: &Record, target: Option<&Record>) -> Result<TransferOutcome, TransferError> {
        let record = self.materialize(source.content().clone(), target, Storage::Local)?;
        Ok(TransferOutcome { record, warnings: Vec::new(), refetched: false })
    }

    fn materialize(&self, content: Content, target: Option<&Record>, storage: Storage) -> Result<Record, TransferError> {
        match target {
            Some(existing) => {
                let mut record = existing.clone();
                record.update_content(content, self.codec.as_ref())?;
                record.storage = storage;
                Ok(record)
            }
            None => {
                let overrides = RecordOverrides { storage: Some(storage), ..Default::default() };
                Ok(Record::create(content, overrides, self.codec.as_ref())?)
            }
        }
    }

    async fn apply_to_cluster(
        &self,
        source: &Record,
        target: Option<&Record>,
        opts: &TransferOptions,
        cancel: &mut CancelSignal,
    ) -> Result<TransferOutcome, TransferError> {
        if !self.registry.is_cluster_resource(&source.kind) {
            return Err(TransferError::NotClusterResource { kind: source.kind.clone() });
        }
        let timeout = opts.timeout.unwrap_or_else(|| self.settings.transfer_timeout());
        let namespace = if self.registry.is_namespaced(&source.kind) {
            Some(opts.namespace.clone().unwrap_or_else(|| source.effective_namespace().to_string()))
        } else {
            None
        };
        let mut warnings = Vec::new();

        let mut created_namespace = None;
        if let (true, Some(ns)) = (opts.create_namespace, namespace.as_deref()) {
            if self.create_namespace(ns, timeout, cancel, &mut warnings).await? {
                created_namespace = Some(ns.to_string());
            }
        }

        let mut content = source.content().clone();
        if let (Some(ns), Some(meta)) = (namespace.as_deref(), content.get_mut("metadata").and_then(|m| m.as_object_mut())) {
            meta.insert("namespace".into(), Content::String(ns.to_string()));
        }
        let manifest = self.codec.serialize(&content)?;
        let mut args = vec!["apply".to_string(), "-f".into(), "-".into()];
        if let Some(ns) = namespace.as_deref() {
            args.extend(["--namespace".to_string(), ns.to_string()]);
        }
        let spec = self.kubectl(args).stdin(manifest);

        match self.run(&spec, timeout, cancel).await {
            Ok(out) if out.success() => {
                warnings.extend(out.stderr.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_string));
            }
            Ok(out) => {
                let applied = applied_lines(&out.stdout);
                let rolled_back = self.rollback_namespace(created_namespace.as_deref(), timeout).await;
                return Err(TransferError::Apply { detail: failure_detail(&out), applied, namespace_rolled_back: rolled_back });
            }
            Err(ProcessError::Timeout(after)) => {
                // cluster side effects are unknown; the next resync reconciles them
                return Err(TransferError::Timeout { operation: "apply", after });
            }
            Err(ProcessError::Cancelled) => {
                let present = self.observe(source, namespace.as_deref(), timeout).await;
                return Err(TransferError::Cancelled { present: present.map(|c| c.is_some()) });
            }
            Err(e @ ProcessError::Spawn { .. }) => {
                // kubectl never ran, so the namespace is the only thing we changed
                let rolled_back = self.rollback_namespace(created_namespace.as_deref(), timeout).await;
                return Err(TransferError::Apply { detail: e.to_string(), applied: Vec::new(), namespace_rolled_back: rolled_back });
            }
            Err(e) => {
                // kubectl ran but its outcome is unknown; leave the namespace in place
                return Err(TransferError::Apply { detail: e.to_string(), applied: Vec::new(), namespace_rolled_back: false });
            }
        }

        let (content, refetched) = match self.observe(source, namespace.as_deref(), timeout).await {
            Some(Some(live)) => (strip_noisy(live), true),
            _ => {
                warnings.push(format!("could not re-fetch {}/{}; using the applied content", source.kind, source.name));
                (content, false)
            }
        };
        let record = self.materialize(content, target, Storage::Cluster)?;
        Ok(TransferOutcome { record, warnings, refetched })
    }

    /// Returns whether the namespace was created by this call.
    async fn create_namespace(
        &self,
        ns: &str,
        timeout: Duration,
        cancel: &mut CancelSignal,
        warnings: &mut Vec<String>,
    ) -> Result<bool, TransferError> {
        let spec = self.kubectl(["create", "namespace", ns]);
        match self.run(&spec, timeout, cancel).await {
            Ok(out) if out.success() => {
                info!(namespace = %ns, "namespace created");
                Ok(true)
            }
            Ok(out) if out.stderr.contains("AlreadyExists") => {
                warnings.push(format!("namespace {} already exists", ns));
                Ok(false)
            }
            Ok(out) => Err(TransferError::NamespaceCreate { namespace: ns.to_string(), detail: failure_detail(&out) }),
            Err(ProcessError::Timeout(after)) => Err(TransferError::Timeout { operation: "create namespace", after }),
            Err(ProcessError::Cancelled) => Err(TransferError::Cancelled { present: None }),
            Err(e) => Err(TransferError::NamespaceCreate { namespace: ns.to_string(), detail: e.to_string() }),
        }
    }

    /// Best effort; a failed rollback is logged and never replaces the
    /// original error.
    async fn rollback_namespace(&self, ns: Option<&str>, timeout: Duration) -> bool {
        let Some(ns) = ns else { return false };
        let Some(args) = self.registry.delete_args("Namespace", ns, None) else { return false };
        counter!("transfer_rollback_total", 1u64);
        let spec = self.kubectl(args);
        match self.run(&spec, timeout, &mut CancelSignal::never()).await {
            Ok(out) if out.success() => {
                info!(namespace = %ns, "rolled back namespace created for failed transfer");
                true
            }
            Ok(out) => {
                warn!(namespace = %ns, error = %failure_detail(&out), "namespace rollback failed");
                false
            }
            Err(e) => {
                warn!(namespace = %ns, error = %e, "namespace rollback failed");
                false
            }
        }
    }

    /// Query the live object. `None`: the query itself failed. `Some(None)`: not found.
    async fn observe(&self, source: &Record, namespace: Option<&str>, timeout: Duration) -> Option<Option<Content>> {
        let mut args = vec!["get".to_string(), source.kind.to_ascii_lowercase(), source.name.clone(), "-o".into(), "yaml".into()];
        if let Some(ns) = namespace {
            args.extend(["--namespace".to_string(), ns.to_string()]);
        }
        let spec = self.kubectl(args);
        let out = match self.run(&spec, timeout, &mut CancelSignal::never()).await {
            Ok(out) => out,
            Err(e) => {
                warn!(kind = %source.kind, name = %source.name, error = %e, "re-fetch failed");
                return None;
            }
        };
        if !out.success() {
            if out.stderr.contains("NotFound") { return Some(None); }
            warn!(kind = %source.kind, name = %source.name, error = %failure_detail(&out), "re-fetch failed");
            return None;
        }
        match self.codec.parse(&out.stdout) {
            Ok(v) => Some(Some(v)),
            Err(e) => {
                warn!(kind = %source.kind, name = %source.name, error = %e, "re-fetched object did not parse");
                None
            }
        }
    }

    /// Delete the record's object from the cluster using its kind's delete hook.
    pub async fn delete_in_cluster(&self, record: &Record, cancel: &mut CancelSignal) -> Result<String, TransferError> {
        let namespace = self.registry.is_namespaced(&record.kind).then(|| record.effective_namespace());
        let args = self
            .registry
            .delete_args(&record.kind, &record.name, namespace)
            .ok_or_else(|| TransferError::NotClusterResource { kind: record.kind.clone() })?;
        let spec = self.kubectl(args);
        match self.run(&spec, self.settings.transfer_timeout(), cancel).await {
            Ok(out) if out.success() => {
                info!(kind = %record.kind, name = %record.name, "deleted from cluster");
                Ok(out.stdout.trim().to_string())
            }
            Ok(out) => Err(TransferError::Delete { detail: failure_detail(&out) }),
            Err(ProcessError::Timeout(after)) => Err(TransferError::Timeout { operation: "delete", after }),
            Err(e) => Err(TransferError::Process(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strip_noisy_prunes_server_fields() {
        let v = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "x",
                "namespace": "ns",
                "uid": "abc",
                "managedFields": [ {"foo": "bar"} ],
                "resourceVersion": "123",
                "generation": 5,
                "creationTimestamp": "2020-01-01T00:00:00Z",
                "annotations": { "kubectl.kubernetes.io/last-applied-configuration": "{}" }
            },
            "status": { "obs": true },
            "data": { "k": "v" }
        });
        let pruned = strip_noisy(v);
        assert_eq!(
            pruned,
            json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "x", "namespace": "ns" }, "data": { "k": "v" } })
        );
    }

    #[test]
    fn applied_lines_picks_object_results() {
        let out = "configmap/a created\nWarning: something\nsecret/b unchanged\n\ndeployment.apps/web configured\n";
        assert_eq!(applied_lines(out), vec!["configmap/a created", "secret/b unchanged", "deployment.apps/web configured"]);
    }
}
