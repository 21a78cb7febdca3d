use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use manifold_apply::{cancel_pair, CancelSignal, Direction, Orchestrator, SystemRunner, TransferOptions};
use manifold_compare::{compare_filtered, shadowed, CompareOp, ComparisonResult, FilterPipeline, Predicate};
use manifold_core::{Collection, ContentCodec, KindRegistry, Record, RefTarget, Settings, SourceEvent, Storage, YamlCodec};
use manifold_kubehub::KindQuery;
use manifold_mapping::Catalog;
use manifold_store::Store;

mod load;

#[derive(Parser, Debug)]
#[command(name = "manifoldctl", version, about = "Kubernetes manifest reference graphs, comparisons and transfers")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Extra reference rules (YAML or JSON list)
    #[arg(long = "rules", env = "MANIFOLD_RULES", global = true)]
    rules: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Target { Cluster, Local }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load manifests under DIR and print every reference with its status
    Graph {
        dir: PathBuf,
        /// Only show references that are not satisfied
        #[arg(long = "problems", action = ArgAction::SetTrue)]
        problems: bool,
    },
    /// Compare two manifest trees, or one tree against the live cluster
    Compare {
        left: PathBuf,
        /// Omit to compare against the cluster
        right: Option<PathBuf>,
        #[arg(long = "op", default_value = "union")]
        op: CompareOp,
        #[arg(long = "kind")]
        kind: Option<String>,
        #[arg(long = "search")]
        search: Option<String>,
        /// Label predicate `k=v` or `k`; repeatable
        #[arg(long = "label")]
        label: Vec<String>,
        /// Annotation predicate `k=v` or `k`; repeatable
        #[arg(long = "annotation")]
        annotation: Vec<String>,
    },
    /// Copy one record between a manifest file and the cluster
    Transfer {
        file: PathBuf,
        #[arg(long = "kind")]
        kind: String,
        #[arg(long = "name")]
        name: String,
        /// Create the namespace first when it does not exist
        #[arg(long = "create-namespace", action = ArgAction::SetTrue)]
        create_namespace: bool,
        #[arg(long = "to", value_enum, default_value_t = Target::Cluster)]
        to: Target,
    },
    /// Delete the object a manifest describes from the cluster
    Delete {
        file: PathBuf,
        #[arg(long = "kind")]
        kind: String,
        #[arg(long = "name")]
        name: String,
    },
    /// Discover served kinds (incl. CRDs)
    Discover,
}

fn init_tracing() {
    let env = std::env::var("MANIFOLD_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("MANIFOLD_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid MANIFOLD_METRICS_ADDR; expected host:port");
        }
    }
}

struct Engine {
    settings: Settings,
    registry: Arc<KindRegistry>,
    codec: Arc<dyn ContentCodec>,
    store: Store,
}

impl Engine {
    fn start(settings: Settings, rules: Option<&Path>) -> Result<Self> {
        let registry = KindRegistry::builtin();
        let mut catalog = Catalog::builtin(&registry);
        if let Some(path) = rules {
            let specs = Catalog::load_specs(path).with_context(|| format!("loading rules from {}", path.display()))?;
            catalog.extend(specs, &registry);
        }
        for err in catalog.dropped() {
            warn!(error = %err, "reference rule dropped");
        }
        info!(rules = catalog.len(), kinds = registry.len(), "catalog ready");
        let registry = Arc::new(registry);
        let codec: Arc<dyn ContentCodec> = Arc::new(YamlCodec::with_max_bytes(settings.max_yaml_bytes));
        let store = Store::spawn(Arc::new(catalog), Arc::clone(&registry), Arc::clone(&codec), &settings);
        Ok(Self { settings, registry, codec, store })
    }

    async fn feed(&self, storage: Storage, events: Vec<SourceEvent>) -> Result<Arc<Collection>> {
        let handle = self.store.collection(storage);
        for ev in events {
            handle.send(ev).await?;
        }
        handle.flush().await?;
        Ok(handle.current())
    }

    fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(Arc::new(SystemRunner), Arc::clone(&self.registry), Arc::clone(&self.codec), self.settings.clone())
    }

    async fn cluster_client(&self) -> Result<manifold_kubehub::Client> {
        manifold_kubehub::client(self.settings.kube_context.as_deref()).await
    }
}

fn find<'a>(collection: &'a Collection, kind: &str, name: &str, ns: Option<&str>) -> Result<&'a Record> {
    collection
        .iter()
        .find(|r| r.kind.eq_ignore_ascii_case(kind) && r.name == name && ns.map(|n| r.effective_namespace() == n).unwrap_or(true))
        .ok_or_else(|| anyhow!("no {} named {} found", kind, name))
}

fn describe(record: &Record) -> String {
    format!("{}/{}/{}", record.kind, record.effective_namespace(), record.name)
}

fn target_label(collection: &Collection, target: &RefTarget) -> String {
    match target {
        RefTarget::Record(id) => collection.get(*id).map(describe).unwrap_or_else(|| id.to_string()),
        RefTarget::Named { name, namespace } => format!("{} (missing, ns {})", name, namespace.as_deref().unwrap_or("-")),
        RefTarget::Unresolved { reason } => format!("<{}>", reason),
    }
}

fn print_graph(collection: &Collection, problems: bool) {
    for record in collection.iter() {
        let edges: Vec<_> = record.outgoing.iter().filter(|e| !problems || !e.is_satisfied()).collect();
        if problems && edges.is_empty() && record.is_valid() { continue; }
        let origin = record.file_path().unwrap_or("-");
        match &record.invalid {
            Some(reason) => println!("{} [{}] INVALID: {}", describe(record), origin, reason),
            None => println!("{} [{}]", describe(record), origin),
        }
        for edge in edges {
            println!(
                "  -> {:?} {} {} = {} ({})",
                edge.status(),
                edge.ref_kind.as_str(),
                edge.target_kind,
                edge.value,
                target_label(collection, &edge.target)
            );
        }
    }
}

fn row_marker(row: &ComparisonResult<'_>) -> &'static str {
    match (row.is_match, row.is_different, row.left.is_some()) {
        (true, false, _) => "=",
        (true, true, _) => "~",
        (false, _, true) => "<",
        (false, _, false) => ">",
    }
}

async fn cmd_graph(engine: &Engine, output: Output, dir: &Path, problems: bool) -> Result<()> {
    let events = load::manifest_events(dir)?;
    let snap = engine.feed(Storage::Local, events).await?;
    match output {
        Output::Human => print_graph(&snap, problems),
        Output::Json => {
            let records: Vec<&Record> = snap.iter().collect();
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
    }
    Ok(())
}

async fn cmd_compare(
    engine: &Engine,
    output: Output,
    namespace: Option<&str>,
    left: &Path,
    right: Option<&Path>,
    op: CompareOp,
    filters: FilterPipeline,
) -> Result<()> {
    let lsnap = engine.feed(Storage::Local, load::manifest_events(left)?).await?;
    let rsnap = match right {
        Some(dir) => engine.feed(Storage::Transient, load::manifest_events(dir)?).await?,
        None => {
            let mut kinds: Vec<String> = lsnap.iter().filter(|r| engine.registry.is_cluster_resource(&r.kind)).map(|r| r.kind.clone()).collect();
            kinds.sort();
            kinds.dedup();
            let client = engine.cluster_client().await?;
            let snapshot = manifold_kubehub::cluster_snapshot(&client, &kinds, namespace).await?;
            engine.feed(Storage::Cluster, vec![snapshot]).await?
        }
    };
    let rows = compare_filtered(&lsnap, &rsnap, op, &filters);
    for (side, snap) in [("left", &lsnap), ("right", &rsnap)] {
        for record in shadowed(snap) {
            warn!(side, record = %describe(record), id = %record.id, "duplicate identity; record left out of the comparison");
        }
    }
    match output {
        Output::Human => {
            for row in rows.iter() {
                match row.diff() {
                    Some(d) if !d.is_empty() => println!("{} {} (+{} ~{} -{})", row_marker(row), row.identity, d.adds, d.updates, d.removes),
                    _ => println!("{} {}", row_marker(row), row.identity),
                }
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_transfer(
    engine: &Engine,
    output: Output,
    namespace: Option<&str>,
    file: &Path,
    kind: &str,
    name: &str,
    create_namespace: bool,
    to: Target,
) -> Result<()> {
    let orch = engine.orchestrator();
    let (cancel, mut signal) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling transfer");
            cancel.cancel();
        }
    });

    let outcome = match to {
        Target::Cluster => {
            let local = engine.feed(Storage::Local, vec![load::file_event(file)?]).await?;
            let source = find(&local, kind, name, None)?;
            let mut opts = TransferOptions { namespace: namespace.map(str::to_string), ..Default::default() };
            if create_namespace && engine.registry.is_namespaced(&source.kind) {
                let ns = opts.namespace.clone().unwrap_or_else(|| source.effective_namespace().to_string());
                let client = engine.cluster_client().await?;
                opts.create_namespace = !manifold_kubehub::namespace_exists(&client, &ns).await?;
            }
            let (outcome, _) = orch.transfer_into(&engine.store, source, None, Direction::ToCluster, &opts, &mut signal).await?;
            outcome
        }
        Target::Local => {
            // `--kind` may pin a version (`apps/v1/Deployment`) for the listing
            let bare = match KindQuery::parse(kind)? {
                KindQuery::Kind(k) => k,
                KindQuery::Gvk(gvk) => gvk.kind,
            };
            let client = engine.cluster_client().await?;
            let snapshot = manifold_kubehub::cluster_snapshot(&client, &[kind.to_string()], namespace).await?;
            let cluster = engine.feed(Storage::Cluster, vec![snapshot]).await?;
            let source = find(&cluster, &bare, name, namespace)?;
            let local = if file.exists() {
                engine.feed(Storage::Local, vec![load::file_event(file)?]).await?
            } else {
                engine.store.local().current()
            };
            let target = find(&local, &bare, name, None).ok();
            let (outcome, _) =
                orch.transfer_into(&engine.store, source, target, Direction::ToLocal, &TransferOptions::default(), &mut signal).await?;
            write_back(engine, file, &outcome.record)?;
            outcome
        }
    };

    match output {
        Output::Human => {
            println!("{} -> {}", describe(&outcome.record), outcome.record.storage.as_str());
            for w in outcome.warnings.iter() {
                println!("warning: {}", w);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&outcome)?),
    }
    Ok(())
}

/// Rewrite `file` with the transferred record in place of its old document.
fn write_back(engine: &Engine, file: &Path, record: &Record) -> Result<()> {
    let snap = engine.store.local().current();
    let key = load::file_key(file);
    let mut docs = load::file_records(&snap, &key);
    if !docs.iter().any(|r| r.id == record.id) {
        docs.push(record);
    }
    std::fs::write(file, load::render(&docs)).with_context(|| format!("writing {}", file.display()))?;
    info!(file = %file.display(), documents = docs.len(), "manifest written");
    Ok(())
}

async fn cmd_delete(engine: &Engine, file: &Path, kind: &str, name: &str) -> Result<()> {
    let local = engine.feed(Storage::Local, vec![load::file_event(file)?]).await?;
    let record = find(&local, kind, name, None)?;
    let out = engine.orchestrator().delete_in_cluster(record, &mut CancelSignal::never()).await?;
    println!("{}", out);
    Ok(())
}

async fn cmd_discover(engine: &Engine, output: Output) -> Result<()> {
    let client = engine.cluster_client().await?;
    let mut registry = (*engine.registry).clone();
    let resources = manifold_kubehub::discover_kinds(&client, &mut registry).await?;
    match output {
        Output::Human => {
            for r in resources {
                let scope = if r.namespaced { "namespaced" } else { "cluster" };
                println!("{} • {}", r.gvk_key(), scope);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&resources)?),
    }
    Ok(())
}

fn filters(kind: Option<String>, search: Option<String>, namespace: Option<&str>, labels: &[String], annotations: &[String]) -> FilterPipeline {
    let mut pipeline = FilterPipeline::new();
    if let Some(kind) = kind { pipeline.push(Predicate::Kind { kind }); }
    if let Some(text) = search { pipeline.push(Predicate::Search { text }); }
    if let Some(ns) = namespace { pipeline.push(Predicate::Namespace { namespace: ns.to_string() }); }
    for l in labels { pipeline.push(Predicate::label(l)); }
    for a in annotations { pipeline.push(Predicate::annotation(a)); }
    pipeline
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let mut settings = Settings::from_env();
    if let Some(rules) = cli.rules.as_ref() {
        settings.rules_file = Some(rules.display().to_string());
    }
    let engine = Engine::start(settings, cli.rules.as_deref())?;
    let ns = cli.namespace.as_deref();

    match cli.command {
        Commands::Graph { dir, problems } => cmd_graph(&engine, cli.output, &dir, problems).await?,
        Commands::Compare { left, right, op, kind, search, label, annotation } => {
            let pipeline = filters(kind, search, ns, &label, &annotation);
            cmd_compare(&engine, cli.output, ns, &left, right.as_deref(), op, pipeline).await?
        }
        Commands::Transfer { file, kind, name, create_namespace, to } => {
            cmd_transfer(&engine, cli.output, ns, &file, &kind, &name, create_namespace, to).await?
        }
        Commands::Delete { file, kind, name } => cmd_delete(&engine, &file, &kind, &name).await?,
        Commands::Discover => cmd_discover(&engine, cli.output).await?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn compare_flags_parse() {
        let cli = Cli::parse_from(["manifoldctl", "-o", "json", "compare", "a", "b", "--op", "left-difference", "--label", "app=web", "--label", "tier"]);
        match cli.command {
            Commands::Compare { op, label, right, .. } => {
                assert_eq!(op, CompareOp::LeftDifference);
                assert_eq!(label, vec!["app=web", "tier"]);
                assert_eq!(right.as_deref(), Some(Path::new("b")));
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert_eq!(cli.output, Output::Json);
    }

    #[test]
    fn filter_pipeline_collects_every_flag() {
        let p = filters(Some("Pod".into()), Some("web".into()), Some("ns1"), &["app=web".into()], &[]);
        assert_eq!(p.predicates().len(), 4);
    }
}
