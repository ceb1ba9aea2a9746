use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kmut_core::{ObjectKey, ObjectStore, Verb};
use kmut_mutate::{Mutator, RetryConfig, StatusMode};
use kube::core::DynamicObject;
use serde_json::Value as Json;
use tracing::info;

const TOUCHED_AT: &str = "kmut.dev/touched-at";

#[derive(Parser, Debug)]
#[command(name = "kmutctl", version, about = "Conflict-safe object mutations")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: current context)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Delay between retry attempts (overrides KMUT_RETRY_INTERVAL_MS)
    #[arg(long = "retry-interval-ms", global = true)]
    retry_interval_ms: Option<u64>,

    /// Overall retry budget (overrides KMUT_RETRY_TIMEOUT_MS)
    #[arg(long = "retry-timeout-ms", global = true)]
    retry_timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json, Yaml }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the object if missing, then merge-patch its labels
    Label {
        /// GVK key, e.g. "v1/ConfigMap" or "engine.kube.ci/v1alpha1/Workplan"
        gvk: String,
        name: String,
        /// key=value pairs
        #[arg(required = true)]
        labels: Vec<String>,
    },
    /// Set annotations with a conflict-retrying update
    Annotate {
        gvk: String,
        name: String,
        #[arg(required = true)]
        annotations: Vec<String>,
    },
    /// Stamp the object with the current time (conflict-retrying update)
    Touch {
        gvk: String,
        name: String,
    },
    /// Update status fields
    Status {
        gvk: String,
        name: String,
        /// path=value, value parsed as JSON when possible (e.g. phase=Running, conditions.ready=true)
        #[arg(long = "set", required = true)]
        set: Vec<String>,
        /// Write through the status subresource; may be given at most once
        #[arg(long = "subresource", action = ArgAction::Append, num_args = 0..=1, default_missing_value = "true")]
        subresource: Vec<bool>,
    },
}

fn init_tracing() {
    let env = std::env::var("KMUT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KMUT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KMUT_METRICS_ADDR; expected host:port");
        }
    }
}

fn retry_config(cli: &Cli) -> RetryConfig {
    let mut cfg = RetryConfig::from_env();
    if let Some(ms) = cli.retry_interval_ms { cfg.interval = Duration::from_millis(ms); }
    if let Some(ms) = cli.retry_timeout_ms { cfg.timeout = Duration::from_millis(ms); }
    cfg
}

/// Resolved store plus the namespace to address objects in.
async fn open(gvk: &str, ns: Option<&str>, retry: RetryConfig) -> Result<(Mutator<DynamicObject, kmut_kubehub::KubeStore<DynamicObject>>, Option<String>)> {
    let (store, ar, namespaced) = kmut_kubehub::dynamic_store(gvk).await?;
    let ns = if !namespaced {
        None
    } else {
        match ns {
            Some(ns) => Some(ns.to_string()),
            None => Some(kmut_kubehub::get_kube_client().await?.default_namespace().to_string()),
        }
    };
    Ok((Mutator::with_dyntype(store, ar, retry), ns))
}

fn object_meta(ns: Option<&str>, name: &str) -> ObjectMeta {
    ObjectMeta { name: Some(name.to_string()), namespace: ns.map(|s| s.to_string()), ..Default::default() }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let retry = retry_config(&cli);
    let output = cli.output;

    match &cli.command {
        Commands::Label { gvk, name, labels } => {
            let pairs = parse_pairs(labels)?;
            let (m, ns) = open(gvk, cli.namespace.as_deref(), retry).await?;
            info!(gvk = %gvk, ns = ?ns, name = %name, "label invoked");
            let (obj, verb) = m
                .create_or_patch(object_meta(ns.as_deref(), name), |mut o: DynamicObject| {
                    merge_into(&mut o.metadata.labels, &pairs);
                    o
                })
                .await?;
            print_result(output, &m.kind(), verb.as_str(), &obj)?;
        }
        Commands::Annotate { gvk, name, annotations } => {
            let pairs = parse_pairs(annotations)?;
            let (m, ns) = open(gvk, cli.namespace.as_deref(), retry).await?;
            info!(gvk = %gvk, ns = ?ns, name = %name, "annotate invoked");
            let obj = m
                .try_update(&object_meta(ns.as_deref(), name), |mut o: DynamicObject| {
                    merge_into(&mut o.metadata.annotations, &pairs);
                    o
                })
                .await?;
            print_result(output, &m.kind(), "updated", &obj)?;
        }
        Commands::Touch { gvk, name } => {
            let (m, ns) = open(gvk, cli.namespace.as_deref(), retry).await?;
            let pairs = vec![(TOUCHED_AT.to_string(), chrono::Utc::now().to_rfc3339())];
            let obj = m
                .try_update(&object_meta(ns.as_deref(), name), |mut o: DynamicObject| {
                    merge_into(&mut o.metadata.annotations, &pairs);
                    o
                })
                .await?;
            print_result(output, &m.kind(), "updated", &obj)?;
        }
        Commands::Status { gvk, name, set, subresource } => {
            // Reject bad flags before touching the cluster
            let mode = StatusMode::from_flags(subresource)?;
            let sets = parse_sets(set)?;
            let (m, ns) = open(gvk, cli.namespace.as_deref(), retry).await?;
            info!(gvk = %gvk, ns = ?ns, name = %name, mode = ?mode, "status invoked");
            let key = ObjectKey::new(ns.as_deref(), name);
            let cur: DynamicObject = m.store().get(&key).await.with_context(|| format!("reading {}", key))?;
            let obj = m
                .update_status(
                    &cur,
                    |mut status: Json| {
                        for (path, v) in sets.iter() {
                            set_path(&mut status, path, v.clone());
                        }
                        status
                    },
                    mode,
                )
                .await?;
            print_result(output, &m.kind(), status_verb(&cur, &obj, mode), &obj)?;
        }
    }

    Ok(())
}

fn print_result(output: Output, kind: &str, verb: &str, obj: &DynamicObject) -> Result<()> {
    match output {
        Output::Human => {
            let key = ObjectKey::of(obj).map(|k| k.to_string()).unwrap_or_else(|| "-".to_string());
            let rv = obj.metadata.resource_version.as_deref().unwrap_or("-");
            println!("{} {} {} (resourceVersion {})", kind, key, verb, rv);
        }
        Output::Json => {
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "verb": verb, "object": obj }))?);
        }
        Output::Yaml => {
            print!("{}", serde_yaml::to_string(&serde_json::json!({ "verb": verb, "object": obj }))?);
        }
    }
    Ok(())
}

fn parse_pairs(raw: &[String]) -> Result<Vec<(String, String)>> {
    raw.iter()
        .map(|s| {
            let (k, v) = s.split_once('=').ok_or_else(|| anyhow!("expected key=value, got {:?}", s))?;
            if k.is_empty() { return Err(anyhow!("empty key in {:?}", s)); }
            Ok((k.to_string(), v.to_string()))
        })
        .collect()
}

/// `path=value` with the value read as JSON, or as a plain string otherwise.
fn parse_sets(raw: &[String]) -> Result<Vec<(String, Json)>> {
    Ok(parse_pairs(raw)?
        .into_iter()
        .map(|(k, v)| {
            let val = serde_json::from_str(&v).unwrap_or(Json::String(v));
            (k, val)
        })
        .collect())
}

fn merge_into(map: &mut Option<BTreeMap<String, String>>, pairs: &[(String, String)]) {
    let m = map.get_or_insert_with(BTreeMap::new);
    for (k, v) in pairs.iter() {
        m.insert(k.clone(), v.clone());
    }
}

/// Set a dot-separated path, creating intermediate objects.
fn set_path(root: &mut Json, path: &str, value: Json) {
    if !root.is_object() {
        *root = Json::Object(serde_json::Map::new());
    }
    if let Json::Object(map) = root {
        match path.split_once('.') {
            Some((head, rest)) => set_path(map.entry(head.to_string()).or_insert(Json::Null), rest, value),
            None => {
                map.insert(path.to_string(), value);
            }
        }
    }
}

/// A status write that left the resource version alone did not happen.
fn status_verb(before: &DynamicObject, after: &DynamicObject, mode: StatusMode) -> &'static str {
    if before.metadata.resource_version == after.metadata.resource_version {
        Verb::Unchanged.as_str()
    } else if mode == StatusMode::Subresource {
        "updated"
    } else {
        Verb::Patched.as_str()
    }
}
