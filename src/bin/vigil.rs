use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};
use vigil::{
    actors::{scheduler::SchedulerHandle, watcher},
    config::{self, EngineSettings},
    dispatch::{self, WebhookDispatcher},
    query::{PrometheusClient, QueryClient},
    store::ConfigStore,
};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file (overridden by VIGIL_CONFIG)
    #[arg(short, long)]
    config: Option<String>,

    /// Disable hot-reloading of the config file
    #[arg(long)]
    no_watch: bool,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![("vigil", LevelFilter::TRACE)]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let path = config::resolve_config_path(args.config.as_deref())?;

    // the only fatal configuration path: a broken file before any
    // generation has ever been published
    let cfg = config::read_config_file(&path)?;
    let settings = EngineSettings::from_config(&cfg)
        .map_err(|e| anyhow::anyhow!("invalid engine settings: {e}"))?;

    let store = Arc::new(ConfigStore::new());
    let seq = store
        .publish(&cfg.rules)
        .map_err(|e| anyhow::anyhow!("initial configuration rejected: {e}"))?;
    info!(
        "loaded {} rules from {} (generation {seq})",
        cfg.rules.len(),
        path.display()
    );

    let client: Arc<dyn QueryClient> = Arc::new(PrometheusClient::new(&cfg.prometheus_url));

    let (event_tx, event_rx) = mpsc::channel(64);
    let dispatcher = match &cfg.notify {
        Some(notify) => {
            debug!("dispatching alerts to webhook {}", notify.webhook);
            WebhookDispatcher::new(&notify.webhook).spawn(event_rx)
        }
        None => {
            warn!("no notify target configured, alerts will only be logged");
            dispatch::spawn_log_drain(event_rx)
        }
    };

    let scheduler = SchedulerHandle::spawn(settings, Arc::clone(&store), client, event_tx);

    let config_watcher = if args.no_watch {
        None
    } else {
        Some(watcher::spawn(path.clone(), Arc::clone(&store))?)
    };

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    if let Some(w) = &config_watcher {
        w.shutdown().await;
    }
    scheduler.shutdown().await;

    // give the dispatcher a bounded grace period to flush, then exit anyway
    if tokio::time::timeout(settings.grace, dispatcher).await.is_err() {
        warn!("dispatcher did not drain within the grace period");
    }

    Ok(())
}
