use std::sync::Arc;

use clap::Parser;
use jongodb::dispatch::{Dispatcher, Topology};
use jongodb::engine::Engine;
use jongodb::txn::TransactionManager;
use jongodb::{config::Config, server};

#[tokio::main]
async fn main() {
    // Load .env first so clap's env fallbacks see variables.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let cfg_file_res = Config::load_from_file(cli.config.as_deref());
    let cfg_file = match &cfg_file_res {
        Ok(c) => c.clone(),
        Err(_) => Config::default(),
    };

    // Log filter precedence: CLI (--log-level) > RUST_LOG (env) >
    // config.toml log_level > default("info"). JONGODB_LOG_LEVEL is folded
    // in by Config::with_env_overrides below and already reflected in
    // cfg_file once `with_env_overrides` runs, so check it ahead of RUST_LOG.
    let cfg = cfg_file.with_env_overrides().with_overrides(
        cli.host.clone(),
        cli.port,
        cli.database.clone(),
        cli.replica_set.clone(),
        cli.log_level.clone(),
    );

    let filter_spec = if let Some(ref lvl) = cli.log_level {
        lvl.clone()
    } else if let Ok(env_spec) = std::env::var("RUST_LOG") {
        env_spec
    } else if let Some(ref lvl) = cfg.log_level {
        lvl.clone()
    } else {
        "info".to_string()
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter_spec))
        .compact()
        .init();

    if let Err(e) = cfg_file_res.as_ref() {
        tracing::warn!(error = %format!("{e:?}"), "invalid config file; using defaults");
    }

    if let Err(e) = cfg.validate() {
        fail(&format!("invalid configuration: {e}"));
    }

    tracing::info!(host = %cfg.host, port = cfg.port, database = %cfg.database, "starting jongodb");

    let topology = Topology::new(cfg.host.clone(), cfg.port, cfg.replica_set.clone());
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(Engine::new()),
        Arc::new(TransactionManager::new()),
        topology,
    ));

    let replica_set = cfg.replica_set.clone();
    let database = cfg.database.clone();

    let handle = match server::spawn_with_shutdown(cfg, dispatcher).await {
        Ok(handle) => handle,
        Err(e) => fail(&format!("failed to bind listener: {e}")),
    };

    let uri = match &replica_set {
        Some(rs) => format!(
            "mongodb://{}:{}/{}?replicaSet={}",
            handle.local_addr.ip(),
            handle.local_addr.port(),
            database,
            rs
        ),
        None => format!("mongodb://{}:{}/{}", handle.local_addr.ip(), handle.local_addr.port(), database),
    };

    println!("JONGODB_URI={uri}");
    use std::io::Write;
    let _ = std::io::stdout().flush();

    wait_for_termination_signal().await;
    tracing::info!("shutdown signal received, draining connections");
    handle.shutdown().await;
}

async fn wait_for_termination_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Emit the failure-line protocol and exit non-zero. Never returns.
fn fail(reason: &str) -> ! {
    eprintln!("JONGODB_START_FAILURE={reason}");
    std::process::exit(1);
}

#[derive(Debug, Parser, Clone)]
#[command(name = "jongodb", version, about = "In-memory MongoDB wire-protocol server for integration testing")]
struct Cli {
    /// Path to a config TOML file.
    #[arg(short = 'c', long = "config", env = "JONGODB_CONFIG")]
    config: Option<String>,

    /// Host/IP to bind (e.g. 127.0.0.1 or 0.0.0.0).
    #[arg(long = "host", env = "JONGODB_HOST")]
    host: Option<String>,

    /// Port to bind. Use 0 to let the OS choose an ephemeral port.
    #[arg(long = "port", env = "JONGODB_PORT")]
    port: Option<u16>,

    /// Default database name advertised in the ready-line URI.
    #[arg(long = "database", env = "JONGODB_DATABASE")]
    database: Option<String>,

    /// Replica set name to advertise in hello/isMaster responses.
    #[arg(long = "replica-set", env = "JONGODB_REPLICA_SET")]
    replica_set: Option<String>,

    /// Log level or filter spec (e.g. info or info,jongodb=debug).
    #[arg(long = "log-level", env = "JONGODB_LOG_LEVEL")]
    log_level: Option<String>,
}
