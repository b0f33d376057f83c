use clap::Parser;
use personlink_api::RestApi;
use personlink_engine::{LinkerConfig, LinkerContext, LocalScheduler, LoggingPlugin};
use personlink_storage::StorageManager;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Links synced contacts into persons
#[derive(Parser, Debug)]
#[command(name = "personlink")]
#[command(about = "Contact auto-linking service", long_about = None)]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the data directory
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// HTTP API port
    #[arg(long)]
    http_port: Option<u16>,

    /// Seconds between snapshots, 0 disables them
    #[arg(long)]
    snapshot_interval: Option<u64>,

    /// Milliseconds between watch trigger checks
    #[arg(long)]
    watch_poll_interval: Option<u64>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn linker_config(&self) -> anyhow::Result<LinkerConfig> {
        let mut config = match &self.config {
            Some(path) => LinkerConfig::from_file(path)?,
            None => LinkerConfig::default(),
        };
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(port) = self.http_port {
            config.http_port = port;
        }
        if let Some(secs) = self.snapshot_interval {
            config.snapshot_interval_secs = secs;
        }
        if let Some(ms) = self.watch_poll_interval {
            config.watch_poll_interval_ms = ms;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = args.linker_config()?;

    info!("Starting personlink v{}", env!("CARGO_PKG_VERSION"));
    info!("Data directory: {:?}", config.data_dir);
    info!("HTTP API port: {}", config.http_port);

    let storage = Arc::new(StorageManager::open(&config.data_dir)?);
    info!("Storage initialized");

    let save_handle = (config.snapshot_interval_secs > 0)
        .then(|| storage.start_background_save(config.snapshot_interval()));

    let (scheduler, mut fired) = LocalScheduler::new(storage.clone());
    let scheduler = Arc::new(scheduler);
    let poller = scheduler.clone().spawn_poller(config.watch_poll_interval());

    let context = Arc::new(LinkerContext::new(
        storage.clone(),
        scheduler.clone(),
        config.clone(),
    ));
    context.register_plugin(Arc::new(LoggingPlugin));

    let watch = context.setup_watch().await?;
    info!("Watching contacts (activity {})", watch);

    let watch_context = context.clone();
    let watch_handle = tokio::spawn(async move {
        while let Some(event) = fired.recv().await {
            match watch_context.handle_fired(event).await {
                Ok(report) => info!(
                    "Job {} relinked {} of {} changed contacts",
                    report.job_id, report.processed, report.total
                ),
                Err(e) => warn!("Watch-triggered pass failed: {}", e),
            }
        }
    });

    let http_context = context.clone();
    let http_port = config.http_port;
    let http_handle = std::thread::spawn(move || {
        info!("Starting HTTP server on port {}", http_port);
        let sys = actix_web::rt::System::new();
        sys.block_on(async {
            if let Err(e) = RestApi::start(http_context, http_port).await {
                error!("HTTP server error: {}", e);
            }
        })
    });

    info!("personlink started successfully");
    info!("HTTP API: http://localhost:{}/", config.http_port);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
        _ = tokio::task::spawn_blocking(move || {
            http_handle.join().ok();
        }) => {
            info!("HTTP server stopped");
        }
        _ = watch_handle => {
            info!("Watch loop stopped");
        }
    }

    info!("Shutting down...");
    poller.abort();
    storage.stop_background_save();
    if let Some(handle) = save_handle {
        handle.join().ok();
    }
    storage.save()?;
    Ok(())
}
