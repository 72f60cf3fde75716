//! Failover over discovered endpoints, plus the lazily built cloud client.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::{
    cloud::{CloudApi, CloudError, CloudFactory},
    config::{session::SessionConfig, TransportConfig},
    discovery::{connection_order, DiscoveryError, Endpoint, ScanTarget, Scanner},
    model::Robot,
    session::{self, LocalClient},
};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("No endpoints to connect to")]
    NoEndpoints,

    #[error("All {attempts} endpoints failed, last error: {last}")]
    AllFailed {
        attempts: usize,
        #[source]
        last: session::Error,
    },

    #[error(transparent)]
    Session(#[from] session::Error),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Cloud(#[from] CloudError),
}

/// Builds an unconnected session for an endpoint.
pub trait SessionFactory: Send + Sync {
    fn create(&self, endpoint: &Endpoint) -> Result<LocalClient, session::Error>;
}

/// [`SessionFactory`] over real MQTT transports.
///
/// The endpoint's address and port replace the configured broker. The serial
/// read during discovery is used when none is configured.
pub struct MqttSessionFactory {
    transport: TransportConfig,
    session: SessionConfig,
}

impl MqttSessionFactory {
    pub fn new(transport: TransportConfig, session: SessionConfig) -> Self {
        Self { transport, session }
    }
}

impl SessionFactory for MqttSessionFactory {
    fn create(&self, endpoint: &Endpoint) -> Result<LocalClient, session::Error> {
        let mut transport = self.transport.clone();
        transport.host = endpoint.address.to_string();
        transport.port = endpoint.port;
        if transport.sn.is_empty() {
            transport.sn = endpoint.serial.clone().unwrap_or_default();
        }
        LocalClient::from_config(transport, self.session.clone())
    }
}

/// An established session and the endpoint it runs on.
pub struct Link {
    pub endpoint: Endpoint,
    pub session: LocalClient,
}

pub struct Orchestrator {
    sessions: Arc<dyn SessionFactory>,
    cloud_factory: Option<CloudFactory>,
    cloud: OnceCell<Box<dyn CloudApi>>,
}

impl Orchestrator {
    pub fn new(sessions: Arc<dyn SessionFactory>) -> Self {
        Self {
            sessions,
            cloud_factory: None,
            cloud: OnceCell::new(),
        }
    }

    pub fn with_cloud(mut self, factory: CloudFactory) -> Self {
        self.cloud_factory = Some(factory);
        self
    }

    /// Tries each endpoint, recommended first, until one accepts both the
    /// connection and the controller handshake.
    ///
    /// Connection and timeout failures move on to the next endpoint. Any
    /// other error (a rejected handshake, a bad configuration) stops the walk.
    pub async fn connect_with_failover(&self, endpoints: &[Endpoint]) -> Result<Link, OrchestratorError> {
        if endpoints.is_empty() {
            return Err(OrchestratorError::NoEndpoints);
        }

        let mut attempts = 0;
        let mut last = None;

        for endpoint in connection_order(endpoints) {
            attempts += 1;
            let session = self.sessions.create(&endpoint)?;

            match establish(&session).await {
                Ok(()) => {
                    info!(endpoint = %endpoint, "Connected");
                    return Ok(Link { endpoint, session });
                }
                Err(e) => {
                    if let Err(close) = session.disconnect().await {
                        warn!(endpoint = %endpoint, "Error closing failed session: {close}");
                    }
                    if !e.is_connection_error() {
                        return Err(e.into());
                    }
                    warn!(endpoint = %endpoint, "Endpoint failed, trying next: {e}");
                    last = Some(e);
                }
            }
        }

        match last {
            Some(last) => Err(OrchestratorError::AllFailed { attempts, last }),
            None => Err(OrchestratorError::NoEndpoints),
        }
    }

    pub async fn discover_and_connect(
        &self,
        scanner: &Scanner,
        target: &ScanTarget,
    ) -> Result<Link, OrchestratorError> {
        let endpoints = scanner.scan(target).await?;
        self.connect_with_failover(&endpoints).await
    }

    async fn cloud(&self) -> Result<&dyn CloudApi, OrchestratorError> {
        let factory = self.cloud_factory.as_ref().ok_or(CloudError::NotConfigured)?;
        let client = self.cloud.get_or_try_init(|| factory()).await?;
        Ok(client.as_ref())
    }

    pub async fn list_robots(&self) -> Result<Vec<Robot>, OrchestratorError> {
        Ok(self.cloud().await?.list_robots().await?)
    }

    pub async fn get_latest_version(&self) -> Result<serde_json::Value, OrchestratorError> {
        Ok(self.cloud().await?.get_latest_version().await?)
    }

    /// Logs out of the cloud if a client was ever built.
    pub async fn close(&self) -> Result<(), OrchestratorError> {
        if let Some(cloud) = self.cloud.get() {
            cloud.logout().await?;
        }
        Ok(())
    }
}

async fn establish(session: &LocalClient) -> Result<(), session::Error> {
    session.connect().await?;
    session.get_controller().await?;
    Ok(())
}
