//! Level II fetcher - standalone background ingestion service.
//!
//! Discovers new NEXRAD volumes in S3, decodes and transcodes them, and
//! persists bitmask artifacts under the data directory. An HTTP admin
//! surface on port 13480 observes and reconfigures the pipeline.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use levelii::admin::{AdminServer, DEFAULT_ADMIN_PORT};
use levelii::pipeline::config::IngestConfig;
use levelii::pipeline::Ingestor;
use levelii::store::FrameStore;
use levelii::S3ObjectStore;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Level II fetcher - continuous NEXRAD ingestion and transcoding
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Root directory for artifacts, config, and state
    #[arg(long, env = "NEXRAD_DATA_PATH", default_value = "./data/levelii")]
    data_path: PathBuf,

    /// Disable the HTTP admin server
    #[arg(long)]
    no_http: bool,

    /// Admin server port
    #[arg(long, env = "NEXRAD_ADMIN_PORT", default_value_t = DEFAULT_ADMIN_PORT)]
    admin_port: u16,

    /// Enable catch-up of historical frames on startup
    #[arg(long)]
    catchup: bool,

    /// Number of fetch worker threads
    #[arg(long, env = "NEXRAD_THREADS")]
    threads: Option<usize>,

    /// Number of pre-allocated buffers
    #[arg(long, env = "NEXRAD_BUFFER_COUNT")]
    buffer_count: Option<usize>,

    /// Size of each buffer in MB
    #[arg(long, env = "NEXRAD_BUFFER_SIZE_MB")]
    buffer_size: Option<usize>,

    /// Comma-separated station list, or ALL
    #[arg(long, env = "NEXRAD_MONITORED_STATIONS")]
    stations: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(&args);

    info!("Level II fetcher starting");
    if let Err(e) = run(args).await {
        error!("fatal startup error: {}", e);
        std::process::exit(1);
    }
    info!("Level II fetcher stopped cleanly");
}

async fn run(args: Args) -> levelii::Result<()> {
    info!("  data path: {:?}", args.data_path);

    let store = Arc::new(FrameStore::new(&args.data_path)?);

    let objects = Arc::new(S3ObjectStore::connect().await);

    let config = build_config(&args);
    info!(
        "  performance: {} fetch threads, {} buffers ({} MB each), catchup={}",
        config.fetcher_thread_pool_size,
        config.buffer_pool_size,
        config.buffer_size / (1024 * 1024),
        config.catchup_enabled,
    );

    let ingestor = Arc::new(Ingestor::new(
        Arc::clone(&store),
        objects,
        config,
        &args.data_path,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let admin_handle = if args.no_http {
        info!("HTTP admin server disabled");
        None
    } else {
        let server = AdminServer::new(Arc::clone(&ingestor), Arc::clone(&store));
        let listener = AdminServer::bind(args.admin_port).await?;
        let handle = tokio::spawn(server.run(listener, shutdown_rx.clone()));
        info!("admin panel on http://localhost:{}", args.admin_port);
        Some(handle)
    };

    ingestor.start();
    info!("pipeline running; Ctrl+C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("signal handler failed: {}", e);
    }
    info!("shutting down");

    let _ = shutdown_tx.send(true);
    if let Some(handle) = admin_handle {
        match handle.await {
            Ok(Err(e)) => return Err(e),
            Err(e) => error!("admin server task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }

    // Blocking joins move off the runtime thread
    let ingestor_stop = Arc::clone(&ingestor);
    tokio::task::spawn_blocking(move || ingestor_stop.stop())
        .await
        .ok();

    Ok(())
}

/// Build the startup configuration. Priority: CLI > environment > defaults;
/// values persisted in `config.json` are applied on top at load time.
fn build_config(args: &Args) -> IngestConfig {
    let mut config = IngestConfig::default();

    if let Some(stations) = &args.stations {
        if stations == "ALL" || stations == "*" {
            config.monitored_stations = BTreeSet::from(["ALL".to_string()]);
            info!("monitoring ALL stations");
        } else {
            config.monitored_stations = stations
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            info!("monitoring stations: {:?}", config.monitored_stations);
        }
    } else {
        info!(
            "monitoring default stations: {:?}",
            config.monitored_stations
        );
    }

    if let Some(threads) = args.threads {
        config.fetcher_thread_pool_size = threads;
    }
    if let Some(count) = args.buffer_count {
        config.buffer_pool_size = count;
    }
    if let Some(size_mb) = args.buffer_size {
        config.buffer_size = size_mb * 1024 * 1024;
    }
    // Historical backfill is opt-in from the command line
    config.catchup_enabled = args.catchup;

    config
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("aws_config=warn".parse().unwrap())
        .add_directive("aws_smithy_runtime=warn".parse().unwrap());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
