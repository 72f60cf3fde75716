//! Cloud account collaborator.
//!
//! Only the seam lives here: the REST client is supplied by the embedding
//! application through a [`CloudFactory`].

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;

use crate::model::Robot;

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("Cloud authentication failed: {0}")]
    Auth(String),

    #[error("Cloud request failed: {0}")]
    Request(String),

    #[error("No cloud client configured")]
    NotConfigured,
}

#[async_trait]
pub trait CloudApi: Send + Sync {
    async fn login(&self) -> Result<(), CloudError>;

    /// Renews the access token.
    async fn refresh(&self) -> Result<(), CloudError>;

    async fn logout(&self) -> Result<(), CloudError>;

    /// Robots bound to the account.
    async fn list_robots(&self) -> Result<Vec<Robot>, CloudError>;

    /// Latest firmware/app version record, as returned by the service.
    async fn get_latest_version(&self) -> Result<Value, CloudError>;
}

/// Builds (and typically logs in) a cloud client on first use.
pub type CloudFactory =
    Box<dyn Fn() -> BoxFuture<'static, Result<Box<dyn CloudApi>, CloudError>> + Send + Sync>;
