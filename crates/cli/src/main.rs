use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use kube::core::DynamicObject;
use kube::Client;
use reflex_controller::{Controller, ControllerConfig, ListOptions, ListWatcher, Object, ObjectKey, Reconcile};
use reflex_kubehub::KubeListWatcher;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "reflexctl", version, about = "Reflex: list/watch/reconcile demo against a live cluster")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns", global = true, env = "REFLEX_NAMESPACE")]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover served resources (incl. CRDs)
    Discover,
    /// List objects for a given group/version/kind key once
    Ls {
        /// GVK key, e.g. "v1/ConfigMap" or "cert-manager.io/v1/Certificate"
        gvk: String,
        #[command(flatten)]
        selectors: Selectors,
    },
    /// Run a controller for a GVK that prints one line per sync
    Run {
        /// GVK key, e.g. "v1/Pod"
        gvk: String,
        #[command(flatten)]
        selectors: Selectors,
        #[command(flatten)]
        tuning: Tuning,
    },
}

#[derive(Args, Debug, Default)]
struct Selectors {
    /// Label selector, e.g. "app=web,tier!=db"
    #[arg(short = 'l', long = "selector", env = "REFLEX_LABEL_SELECTOR")]
    labels: Option<String>,
    /// Field selector, e.g. "status.phase=Running"
    #[arg(long = "field-selector", env = "REFLEX_FIELD_SELECTOR")]
    fields: Option<String>,
}

/// Overrides on top of `ControllerConfig::from_env()`.
#[derive(Args, Debug, Default)]
struct Tuning {
    #[arg(long = "workers", env = "REFLEX_WORKERS")]
    workers: Option<usize>,
    #[arg(long = "max-retries", env = "REFLEX_MAX_RETRIES")]
    max_retries: Option<u32>,
    /// Re-sync every cached object this often (0 disables)
    #[arg(long = "resync-secs", env = "REFLEX_RESYNC_SECS")]
    resync_secs: Option<u64>,
    /// Server-side watch timeout
    #[arg(long = "watch-timeout-secs", env = "REFLEX_WATCH_TIMEOUT_SECS")]
    watch_timeout_secs: Option<u64>,
    /// Reopen a cleanly closed watch instead of relisting
    #[arg(long = "resume-watch", action = ArgAction::SetTrue)]
    resume_watch: bool,
}

impl Selectors {
    fn list_options(&self, namespace: Option<&str>) -> ListOptions {
        let mut options = ListOptions::default();
        if let Some(ns) = namespace {
            options = options.namespace(ns);
        }
        if let Some(l) = self.labels.as_deref() {
            options = options.labels(l);
        }
        if let Some(f) = self.fields.as_deref() {
            options = options.fields(f);
        }
        options
    }
}

impl Tuning {
    fn apply(&self, config: &mut ControllerConfig) {
        if let Some(w) = self.workers {
            config.workers = w.max(1);
        }
        if let Some(m) = self.max_retries {
            config.max_retries = m;
        }
        if let Some(s) = self.resync_secs {
            config.reflector.resync_period = (s > 0).then(|| Duration::from_secs(s));
        }
        if self.resume_watch {
            config.reflector.resume_watch_on_close = true;
        }
    }
}

fn init_tracing() {
    let env = std::env::var("REFLEX_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("REFLEX_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid REFLEX_METRICS_ADDR; expected host:port");
        }
    }
}

/// Prints what it would do for each key.
struct PrintReconciler {
    kind: String,
    output: Output,
}

#[async_trait]
impl Reconcile<DynamicObject> for PrintReconciler {
    async fn sync(&self, key: &ObjectKey, object: Option<Arc<DynamicObject>>) -> anyhow::Result<()> {
        match (self.output, object) {
            (Output::Human, Some(_)) => println!("Sync/Add/Update for {} {}", self.kind, key),
            (Output::Human, None) => println!("{} {} does not exist anymore", self.kind, key),
            (Output::Json, object) => {
                let line = serde_json::json!({
                    "kind": self.kind,
                    "key": key.to_string(),
                    "exists": object.is_some(),
                    "resourceVersion": object.map(|o| o.resource_version().to_string()),
                });
                println!("{line}");
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let ns = cli.namespace.as_deref();

    match cli.command {
        Commands::Discover => {
            info!("discover invoked");
            let client = Client::try_default().await.context("connecting to cluster")?;
            let resources = reflex_kubehub::discover(client).await?;
            match cli.output {
                Output::Human => {
                    for r in resources {
                        let scope = if r.namespaced { "namespaced" } else { "cluster" };
                        let gv = if r.group.is_empty() { r.version.clone() } else { format!("{}/{}", r.group, r.version) };
                        println!("{} • {} • {}", gv, r.kind, scope);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&resources)?),
            }
        }
        Commands::Ls { gvk, selectors } => {
            info!(gvk = %gvk, ns = ?ns, "ls invoked");
            let client = Client::try_default().await.context("connecting to cluster")?;
            let lw = KubeListWatcher::for_gvk(client, &gvk).await?;
            let list = lw.list(&selectors.list_options(ns)).await.context("listing")?;
            match cli.output {
                Output::Human => {
                    println!("{:<48} {:>10} {:>8}", "NAME", "VERSION", "AGE");
                    let mut items = list.items;
                    items.sort_by_key(|o| o.key());
                    for o in &items {
                        let age = o.metadata.creation_timestamp.as_ref().map(|t| render_age(t.0)).unwrap_or_else(|| "-".into());
                        println!("{:<48} {:>10} {:>8}", o.key().to_string(), o.resource_version().to_string(), age);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&list.items)?),
            }
        }
        Commands::Run { gvk, selectors, tuning } => {
            let mut config = ControllerConfig::from_env();
            config.name = gvk.clone();
            tuning.apply(&mut config);
            let mut options = selectors.list_options(ns);
            if let Some(secs) = tuning.watch_timeout_secs {
                options = options.watch_timeout(Duration::from_secs(secs));
            }
            info!(gvk = %gvk, ns = ?ns, workers = config.workers, max_retries = config.max_retries, "run invoked");

            let client = Client::try_default().await.context("connecting to cluster")?;
            let lw = KubeListWatcher::for_gvk(client, &gvk).await?;
            let reconciler = PrintReconciler { kind: lw.resource().kind.clone(), output: cli.output };
            let controller = Controller::new(lw, options, reconciler, config);

            let token = CancellationToken::new();
            let mut run = tokio::spawn(controller.run(token.clone()));
            let result = tokio::select! {
                r = &mut run => r?,
                _ = signal::ctrl_c() => {
                    info!("Ctrl-C received; stopping controller");
                    token.cancel();
                    run.await?
                }
            };
            if let Err(e) = result {
                error!(error = %e, "controller failed");
                return Err(e.into());
            }
        }
    }

    Ok(())
}

fn render_age(created: chrono::DateTime<chrono::Utc>) -> String {
    let mut secs = chrono::Utc::now().signed_duration_since(created).num_seconds().max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}
