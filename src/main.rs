use std::{process, sync::Arc, sync::OnceLock, time::Duration};

use futures_util::StreamExt;
use tracing::{debug, error, info, warn};
use yardlink::{
    config::Config,
    discovery::{self, Endpoint, ScanTarget, Scanner},
    logger::LoggerManager,
    orchestrator::{Link, MqttSessionFactory, Orchestrator},
    print_error,
};

static CONFIG: OnceLock<Config> = OnceLock::new();

pub fn config() -> &'static Config {
    CONFIG.get_or_init(|| {
        Config::new().unwrap_or_else(|e| {
            print_error!("{}", e);
            process::exit(1);
        })
    })
}

/// Configured broker as a single pre-ranked endpoint.
async fn configured_endpoint(cfg: &Config) -> Option<Endpoint> {
    let host = &cfg.transport.host;
    match discovery::resolve_endpoint(host, cfg.transport.port).await {
        Ok(mut endpoint) => {
            endpoint.serial = Some(cfg.transport.sn.clone());
            Some(endpoint)
        }
        Err(e) => {
            warn!(host = %host, "Cannot resolve configured broker, falling back to a scan: {e}");
            None
        }
    }
}

async fn establish(cfg: &Config, orchestrator: &Orchestrator) -> Result<Link, Box<dyn std::error::Error>> {
    // A configured serial means the broker is known: skip the scan.
    if !cfg.transport.sn.is_empty() {
        if let Some(endpoint) = configured_endpoint(cfg).await {
            info!(endpoint = %endpoint, "Connecting to configured broker");
            return Ok(orchestrator.connect_with_failover(&[endpoint]).await?);
        }
    }

    let target: ScanTarget = cfg.discovery.target.parse()?;
    info!(target = ?target, "No serial configured, discovering robots");
    let scanner = Scanner::new(cfg.discovery.clone(), cfg.transport.namespace.clone());
    Ok(orchestrator.discover_and_connect(&scanner, &target).await?)
}

async fn log_telemetry(link: &Link) {
    loop {
        let mut stream = Box::pin(link.session.watch_telemetry());
        while let Some(telemetry) = stream.next().await {
            info!(
                sn = %telemetry.sn,
                battery = ?telemetry.battery,
                state = ?telemetry.state,
                plan = ?telemetry.plan_id,
                healthy = link.session.is_healthy_default(),
                "Telemetry"
            );
        }
        warn!("Telemetry stream ended, waiting for the session to come back");
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config();
    let logger_manager = LoggerManager::new(cfg.logger.clone()).unwrap_or_else(|e| {
        print_error!("Failed to setup Log Manager: {}", e);
        process::exit(1);
    });
    logger_manager.init().unwrap_or_else(|e| {
        print_error!("Failed to init Log Manager: {}", e);
        process::exit(1);
    });
    info!("Starting yardlink version {}...", env!("CARGO_PKG_VERSION"));
    debug!("{:#?}", cfg.transport);
    info!("Log level: {}", cfg.logger.level);

    let sessions = MqttSessionFactory::new(cfg.transport.clone(), cfg.session.clone());
    let orchestrator = Orchestrator::new(Arc::new(sessions));

    let link = establish(cfg, &orchestrator).await.unwrap_or_else(|e| {
        error!("Failed to connect to a robot: {}", e);
        process::exit(1);
    });
    info!(
        endpoint = %link.endpoint,
        sn = %link.session.serial_number(),
        "Controller role acquired"
    );

    link.session.start_heartbeat_monitor();

    tokio::select! {
        _ = log_telemetry(&link) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    if let Err(e) = link.session.disconnect().await {
        warn!("Error during disconnect: {}", e);
    }
    if let Err(e) = orchestrator.close().await {
        warn!("Error closing cloud client: {}", e);
    }
    info!("Shutdown complete");
    Ok(())
}
