use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use keel_core::{LabelSelector, Resource, ResourceRef};
use keel_persist::SqlitePersist;
use keel_runtime::{Applied, Engine, EngineConfig};
use keel_schema::{load_manifest, DocumentSchema, Format, KindInfo, KindRegistry};
use keel_store::ResourceStore;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Keel CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace for refs given as Kind/name
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Namespaced kinds to accept, e.g. "v1/File" or "example.com/v1/Widget"
    #[arg(long = "kind", global = true, env = "KEEL_KINDS", value_delimiter = ',')]
    kinds: Vec<String>,

    /// Cluster-scoped kinds to accept
    #[arg(long = "cluster-kind", global = true, env = "KEEL_CLUSTER_KINDS", value_delimiter = ',')]
    cluster_kinds: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Parse and validate a manifest without writing anything
    Validate { file: PathBuf },
    /// Print the content fingerprint of every resource in a manifest
    Fingerprint { file: PathBuf },
    /// Validate a manifest and write its resources to the store
    Apply { file: PathBuf },
    /// Show one resource
    Get {
        /// Kind/name or Kind/namespace/name
        key: String,
    },
    /// List resources of a kind
    Ls {
        kind: String,
        /// Equality label selector, e.g. "app=web,tier=front"
        #[arg(long = "selector", short = 'l')]
        selector: Option<String>,
    },
    /// Mark a resource for deletion, or remove it immediately with --force
    Delete {
        key: String,
        #[arg(long = "force", action = ArgAction::SetTrue)]
        force: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

/// Split "v1/Kind" or "group/v1/Kind" into (apiVersion, kind).
fn parse_kind(key: &str) -> Option<(String, String)> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Some(((*version).to_string(), (*kind).to_string())),
        [group, version, kind] => Some((format!("{}/{}", group, version), (*kind).to_string())),
        _ => None,
    }
}

fn kind_infos(cli: &Cli) -> Result<Vec<KindInfo>> {
    let scoped = cli.kinds.iter().map(|k| (k, true)).chain(cli.cluster_kinds.iter().map(|k| (k, false)));
    scoped
        .map(|(key, namespaced)| {
            let (api_version, kind) = parse_kind(key).ok_or_else(|| anyhow!("invalid kind {:?}; expected v1/Kind", key))?;
            Ok(if namespaced { KindInfo::namespaced(api_version, kind) } else { KindInfo::cluster(api_version, kind) })
        })
        .collect()
}

fn registry(cli: &Cli, default_namespace: &str) -> Result<KindRegistry> {
    let mut reg = KindRegistry::new(default_namespace);
    for info in kind_infos(cli)? {
        reg.register(info)?;
    }
    Ok(reg)
}

fn parse_ref(raw: &str, ns: Option<&str>) -> Result<ResourceRef> {
    let mut key = ResourceRef::from_str(raw)?;
    if key.namespace.is_none() {
        key.namespace = ns.map(str::to_string);
    }
    Ok(key)
}

fn parse_selector(raw: Option<&str>) -> Result<LabelSelector> {
    let mut sel = LabelSelector::everything();
    for pair in raw.unwrap_or_default().split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (k, v) = pair.split_once('=').ok_or_else(|| anyhow!("invalid selector term {:?}; expected key=value", pair))?;
        sel = sel.with(k.trim(), v.trim());
    }
    Ok(sel)
}

fn open_store(shards: usize) -> Result<Arc<ResourceStore>> {
    let persist = SqlitePersist::open_default().context("opening keel database")?;
    let store = ResourceStore::with_persist(Arc::new(persist), shards)?;
    Ok(Arc::new(store))
}

fn load(schema: &DocumentSchema, file: &Path) -> Result<Vec<Resource>> {
    let resources = load_manifest(schema, file)?;
    info!(file = %file.display(), count = resources.len(), "manifest loaded");
    Ok(resources)
}

fn print_resource(output: Output, resource: &Resource) -> Result<()> {
    match output {
        Output::Human => print!("{}", serde_yaml::to_string(resource)?),
        Output::Json => println!("{}", serde_json::to_string_pretty(resource)?),
    }
    Ok(())
}

fn describe(applied: &Applied) -> String {
    if applied.created {
        "created".to_string()
    } else if applied.is_unchanged() {
        "unchanged".to_string()
    } else {
        let d = applied.diff;
        format!("configured (+{} ~{} -{})", d.adds, d.updates, d.removes)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let config = EngineConfig::from_env();
    let ns = cli.namespace.as_deref();
    let command = match &cli.command {
        Commands::Validate { .. } => "validate",
        Commands::Fingerprint { .. } => "fingerprint",
        Commands::Apply { .. } => "apply",
        Commands::Get { .. } => "get",
        Commands::Ls { .. } => "ls",
        Commands::Delete { .. } => "delete",
    };
    metrics::counter!("cli_commands_total", 1u64, "command" => command);

    match &cli.command {
        Commands::Validate { file } => {
            let schema = DocumentSchema::new(registry(&cli, &config.default_namespace)?, Format::Yaml);
            let resources = load(&schema, file)?;
            match cli.output {
                Output::Human => {
                    for r in &resources {
                        println!("{} valid", r.key());
                    }
                }
                Output::Json => {
                    let keys: Vec<ResourceRef> = resources.iter().map(Resource::key).collect();
                    println!("{}", serde_json::to_string_pretty(&keys)?);
                }
            }
        }
        Commands::Fingerprint { file } => {
            let schema = DocumentSchema::new(registry(&cli, &config.default_namespace)?, Format::Yaml);
            let resources = load(&schema, file)?;
            match cli.output {
                Output::Human => {
                    for r in &resources {
                        println!("{}  {}", r.content_fingerprint().to_hex(), r.key());
                    }
                }
                Output::Json => {
                    let rows: Vec<serde_json::Value> = resources
                        .iter()
                        .map(|r| serde_json::json!({ "key": r.key(), "fingerprint": r.content_fingerprint().to_hex() }))
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                }
            }
        }
        Commands::Apply { file } => {
            let mut builder = Engine::builder(config.clone()).store(open_store(config.shards)?);
            for info in kind_infos(&cli)? {
                builder = builder.kind(info);
            }
            let engine = builder.start()?;
            let result = load(engine.schema(), file).and_then(|resources| {
                resources
                    .into_iter()
                    .map(|r| engine.apply_resource(r).map_err(anyhow::Error::from))
                    .collect::<Result<Vec<Applied>>>()
            });
            engine.shutdown().await;
            let applied = result?;
            match cli.output {
                Output::Human => {
                    for a in &applied {
                        println!("{} {} (version {})", a.key, describe(a), a.version);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&applied)?),
            }
        }
        Commands::Get { key } => {
            let store = open_store(config.shards)?;
            let key = parse_ref(key, ns)?;
            let resource = store.get(&key)?;
            print_resource(cli.output, &resource)?;
        }
        Commands::Ls { kind, selector } => {
            let store = open_store(config.shards)?;
            let selector = parse_selector(selector.as_deref())?;
            let items: Vec<Arc<Resource>> = store
                .list(kind, &selector)
                .into_iter()
                .filter(|r| ns.map(|n| r.metadata.namespace.as_deref() == Some(n)).unwrap_or(true))
                .collect();
            match cli.output {
                Output::Human => {
                    println!("NAMESPACE   NAME                 STATE");
                    for r in &items {
                        let ns_col = r.metadata.namespace.clone().unwrap_or_else(|| "-".to_string());
                        let state = if r.is_deleting() { "deleting" } else if r.status.is_some() { "observed" } else { "pending" };
                        println!("{:<11} {:<20} {}", ns_col, r.metadata.name, state);
                    }
                }
                Output::Json => {
                    let items: Vec<&Resource> = items.iter().map(|r| r.as_ref()).collect();
                    println!("{}", serde_json::to_string_pretty(&items)?);
                }
            }
        }
        Commands::Delete { key, force } => {
            let store = open_store(config.shards)?;
            let key = parse_ref(key, ns)?;
            let version = if *force { store.delete(&key)? } else { store.mark_deleted(&key)? };
            if !*force {
                warn!(%key, "marked for deletion; a running controller finalizes it");
            }
            match cli.output {
                Output::Human => println!("{} {} (version {})", key, if *force { "deleted" } else { "marked" }, version),
                Output::Json => println!("{}", serde_json::json!({ "key": key, "version": version, "force": force })),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_runtime::DiffSummary;

    #[test]
    fn kinds_and_selectors_parse() {
        assert_eq!(parse_kind("v1/File"), Some(("v1".into(), "File".into())));
        assert_eq!(parse_kind("example.com/v1/Widget"), Some(("example.com/v1".into(), "Widget".into())));
        assert_eq!(parse_kind("File"), None);

        let sel = parse_selector(Some("app=web, tier = front")).unwrap();
        assert_eq!(sel, LabelSelector::everything().with("app", "web").with("tier", "front"));
        assert!(parse_selector(None).unwrap().is_empty());
        assert!(parse_selector(Some("app")).is_err());
    }

    #[test]
    fn apply_outcomes_are_described() {
        let applied = |created: bool, diff: DiffSummary| Applied { key: ResourceRef::new("Number", "n1"), version: 3, created, diff };
        assert_eq!(describe(&applied(true, DiffSummary::default())), "created");
        assert_eq!(describe(&applied(false, DiffSummary::default())), "unchanged");
        let diff = DiffSummary { adds: 1, updates: 2, removes: 0 };
        assert_eq!(describe(&applied(false, diff)), "configured (+1 ~2 -0)");
    }

    #[test]
    fn refs_take_the_namespace_flag() {
        assert_eq!(parse_ref("File/motd", Some("ops")).unwrap(), ResourceRef::namespaced("File", "ops", "motd"));
        assert_eq!(parse_ref("File/team/motd", Some("ops")).unwrap(), ResourceRef::namespaced("File", "team", "motd"));
        assert!(parse_ref("File/Bad_Name", None).is_err());
    }
}
