//! Outpost controller
//!
//! Starts the listener jobs, then hands the terminal to the operator console.

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use config::{ConfigManager, OutpostConfig};
use outpost_console::{CommandGenerator, Console, ConsoleContext, MsfVenom};
use outpost_control::{
    BeaconStorage, Correlator, DatabaseStorage, Hive, InMemoryStorage, JobConfig, JobManager,
    ListenerSpec, ListenerStorage, ManagementService, SystemInterfaces,
};
use outpost_proto::PROTOCOL_VERSION;
use outpost_transport::ConnectionConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "outpost")]
#[command(about = "Outpost - agent controller and operator console")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(long_version = concat!(
    env!("CARGO_PKG_VERSION"),
    "\nCommit: ", env!("OUTPOST_COMMIT"),
    "\nBuilt: ", env!("OUTPOST_BUILD_TIME")
))]
struct Cli {
    /// Config file (defaults to ~/.outpost/config.json)
    #[arg(long, env = "OUTPOST_CONFIG")]
    config: Option<PathBuf>,

    /// Database URL, e.g. sqlite://./outpost.db?mode=rwc
    #[arg(long, env = "OUTPOST_DB_URL")]
    database_url: Option<String>,

    /// Callback host for generated agents
    #[arg(long, env = "OUTPOST_LHOST")]
    lhost: Option<String>,

    /// Port of the session listener started on launch
    #[arg(long, env = "OUTPOST_LPORT")]
    lport: Option<u16>,

    /// Do not start a session listener on launch
    #[arg(long)]
    no_listener: bool,

    /// Seconds to wait for an agent's reply
    #[arg(long, env = "OUTPOST_REQUEST_TIMEOUT")]
    request_timeout: Option<u64>,

    /// Agent build script used by `generate`
    #[arg(long, env = "OUTPOST_GENERATOR")]
    generator: Option<PathBuf>,

    /// msfvenom executable used by `msf` and `inject`
    #[arg(long, env = "OUTPOST_MSFVENOM")]
    msfvenom: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", env = "OUTPOST_LOG_LEVEL")]
    log_level: String,
}

impl Cli {
    /// Flags win over the config file
    fn merge(self, mut config: OutpostConfig) -> OutpostConfig {
        if self.database_url.is_some() {
            config.database_url = self.database_url;
        }
        if self.lhost.is_some() {
            config.lhost = self.lhost;
        }
        if let Some(lport) = self.lport {
            config.lport = lport;
        }
        if self.no_listener {
            config.listen_on_start = false;
        }
        if let Some(timeout) = self.request_timeout {
            config.request_timeout_secs = timeout;
        }
        if self.generator.is_some() {
            config.generator = self.generator;
        }
        if self.msfvenom.is_some() {
            config.msfvenom = self.msfvenom;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => ConfigManager::default_path()?,
    };
    let config = cli.merge(ConfigManager::load(&config_path)?);

    info!(
        protocol_version = PROTOCOL_VERSION,
        config = ?config_path,
        "Outpost controller starting"
    );

    let (listeners, beacons) = open_storage(&config).await?;

    let hive = Arc::new(Hive::new());
    let events = hive.take_events();

    let job_config = JobConfig {
        connection: ConnectionConfig {
            send_queue_capacity: config.send_queue_capacity,
            recv_queue_capacity: config.recv_queue_capacity,
            ..Default::default()
        },
        handshake_timeout: Duration::from_secs(config.handshake_timeout_secs),
    };
    let jobs = Arc::new(JobManager::new(
        hive.clone(),
        listeners,
        Arc::new(SystemInterfaces),
        job_config,
    ));

    let restored = jobs
        .restore()
        .await
        .context("Failed to restore listener jobs")?;
    if !restored.is_empty() {
        info!("Restored {} listener job(s)", restored.len());
    }

    let lport_in_use = restored.iter().any(|job| job.port == config.lport);
    if config.listen_on_start && !lport_in_use {
        match jobs
            .start(ListenerSpec::session(config.listen_host.clone(), config.lport))
            .await
        {
            Ok(job) => println!("[*] Session listener on {} (job #{})", job.address(), job.id),
            Err(e) => {
                error!("Failed to start session listener: {}", e);
                println!("[!] Failed to start session listener: {}", e);
            }
        }
    }

    let service = Arc::new(ManagementService::new(hive.clone(), jobs.clone(), beacons));
    let correlator = Correlator::new(Duration::from_secs(config.request_timeout_secs));

    let mut console = Console::new(hive, service, correlator);
    if let Some(generator) = &config.generator {
        console = console.with_generator(Arc::new(CommandGenerator::new(generator)));
    }
    console = console.with_payload_source(Arc::new(match &config.msfvenom {
        Some(path) => MsfVenom::new(path),
        None => MsfVenom::default(),
    }));

    let lhost = config.lhost.clone().unwrap_or_default();
    if lhost.is_empty() {
        warn!("No callback host configured, `generate` needs --lhost");
    }
    let ctx = ConsoleContext::new(lhost, config.lport);

    tokio::select! {
        result = console.run(ctx, events) => {
            result.context("Console I/O failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    jobs.shutdown().await;
    info!("Outpost controller stopped");
    Ok(())
}

async fn open_storage(
    config: &OutpostConfig,
) -> Result<(Arc<dyn ListenerStorage>, Arc<dyn BeaconStorage>)> {
    match &config.database_url {
        Some(url) => {
            let db = outpost_db::connect(url)
                .await
                .context(format!("Failed to connect to database: {}", url))?;
            outpost_db::migrate(&db)
                .await
                .context("Failed to run database migrations")?;

            let storage = Arc::new(DatabaseStorage::new(db));
            let listeners: Arc<dyn ListenerStorage> = storage.clone();
            let beacons: Arc<dyn BeaconStorage> = storage;
            Ok((listeners, beacons))
        }
        None => {
            info!("No database configured, listener jobs will not persist");
            let storage = Arc::new(InMemoryStorage::new());
            let listeners: Arc<dyn ListenerStorage> = storage.clone();
            let beacons: Arc<dyn BeaconStorage> = storage;
            Ok((listeners, beacons))
        }
    }
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::parse_from([
            "outpost",
            "--lport",
            "9443",
            "--no-listener",
            "--database-url",
            "sqlite::memory:",
        ]);
        let config = cli.merge(OutpostConfig {
            lport: 8888,
            lhost: Some("10.0.0.2".to_string()),
            ..Default::default()
        });

        assert_eq!(config.lport, 9443);
        assert!(!config.listen_on_start);
        assert_eq!(config.database_url.as_deref(), Some("sqlite::memory:"));
        assert_eq!(config.lhost.as_deref(), Some("10.0.0.2"));
    }

    #[tokio::test]
    async fn test_open_sqlite_storage() {
        let config = OutpostConfig {
            database_url: Some("sqlite::memory:".to_string()),
            ..Default::default()
        };
        let (listeners, beacons) = open_storage(&config).await.unwrap();
        assert!(listeners.list().await.unwrap().is_empty());
        assert!(beacons.list_beacons().await.unwrap().is_empty());
    }
}
