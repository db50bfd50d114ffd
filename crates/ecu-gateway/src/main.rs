//! # ecu-gateway
//!
//! ECU gateway binary: wires the stores, the session core and the
//! southbound server together, and optionally a simulated fleet.

#![deny(unsafe_code)]

mod transport;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use ecu_core::logging::{LogFormat, init_subscriber};
use ecu_events::sqlite::{
    ConnectionConfig, ConnectionPool, SqliteStore, new_file, new_in_memory, run_migrations,
};
use ecu_runtime::{Gateway, RuntimeConfig, TransportListener};
use ecu_server::{EcuServer, ServerConfig, WsTransport};
use ecu_settings::GatewaySettings;
use ecu_simulator::{SimulatedFleet, SimulatorConfig};
use tracing::{info, warn};

use crate::transport::RoutedTransport;

/// Prefix of simulated device ids (`sim_ecu_001`, ...).
const SIMULATED_PREFIX: &str = "sim_ecu";

/// ECU gateway southbound server.
#[derive(Parser, Debug)]
#[command(name = "ecu-gateway", about = "ECU gateway southbound server")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Path to the `SQLite` database, or `:memory:`.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Settings file (default `~/.ecu-gateway/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log filter when `RUST_LOG` is unset.
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,

    /// Run this many simulated devices alongside the socket server.
    #[arg(long, value_name = "N")]
    simulate: Option<usize>,
}

impl Cli {
    fn settings_path(&self) -> PathBuf {
        self.settings
            .clone()
            .unwrap_or_else(ecu_settings::settings_path)
    }

    /// Fold command-line overrides into loaded settings.
    fn apply(&self, settings: &mut GatewaySettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(path) = &self.db_path {
            settings.database.path = path.to_string_lossy().into_owned();
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.json_logs {
            settings.logging.json = true;
        }
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

/// Open the database and bring its schema up to date.
fn open_database(settings: &GatewaySettings) -> Result<ConnectionPool> {
    let config = ConnectionConfig {
        pool_size: settings.database.pool_size,
        ..ConnectionConfig::default()
    };
    let path = settings.database.path.as_str();
    let pool = if path == ":memory:" {
        new_in_memory(&config).context("Failed to open in-memory database")?
    } else {
        ensure_parent_dir(Path::new(path))?;
        new_file(path, &config).with_context(|| format!("Failed to open database {path}"))?
    };
    {
        let conn = pool.get().context("Failed to get DB connection")?;
        let applied = run_migrations(&conn).context("Failed to run migrations")?;
        info!(path, applied, "database ready");
    }
    Ok(pool)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let settings_path = args.settings_path();
    let mut settings = ecu_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
    args.apply(&mut settings);

    let format = if settings.logging.json {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };
    init_subscriber(&settings.logging.level, format);

    let store = Arc::new(SqliteStore::new(open_database(&settings)?));

    let metrics = match ecu_server::metrics::install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "metrics disabled");
            None
        }
    };

    // Session core
    let sockets = Arc::new(WsTransport::new(settings.server.max_message_bytes));
    let fleet = args
        .simulate
        .map(|_| SimulatedFleet::new(SimulatorConfig::from_settings(&settings.simulator)));
    let routed = Arc::new(RoutedTransport::new(sockets.clone(), fleet.clone()));
    let gateway = Gateway::start(
        RuntimeConfig::from_settings(&settings),
        store.clone(),
        store.clone(),
        routed,
    );

    // Southbound server
    let server = EcuServer::new(
        ServerConfig::from_settings(&settings.server),
        gateway.clone(),
        sockets,
        metrics,
    );
    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    info!("ECU gateway listening on ws://{addr}{}", settings.server.ws_path);

    if let (Some(fleet), Some(count)) = (&fleet, args.simulate) {
        let listener: Arc<dyn TransportListener> = gateway.clone();
        fleet.attach(&listener);
        let devices = fleet
            .connect_many(SIMULATED_PREFIX, count)
            .context("Failed to start simulated devices")?;
        info!(devices = devices.len(), "simulated fleet running");
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    info!("Shutting down...");
    server.shutdown().shutdown();
    let _ = handle.await;
    if let Some(fleet) = &fleet {
        fleet.shutdown().await;
    }
    let report = gateway.shutdown().await;
    if report.dropped > 0 {
        warn!(dropped = report.dropped, "log entries lost at shutdown");
    }
    match store.statistics() {
        Ok(stats) => info!(
            total_logs = stats.total_logs,
            total_devices = stats.total_devices,
            "Shutdown complete"
        ),
        Err(e) => warn!(error = %e, "Shutdown complete, statistics unavailable"),
    }
    Ok(())
}
