//! Construction of the rumqttc client and event loop.
//!
//! [`ClientBuilder`] turns a [`Config`] (or a bare host/port, for discovery
//! probes) into the `AsyncClient` / `EventLoop` pair. The pair must be used
//! together: the client queues requests, the event loop performs the I/O and
//! must be polled from exactly one task.

use std::{fs, time::Duration};

use rumqttc::{AsyncClient, EventLoop, MqttOptions, TlsConfiguration, Transport};

use super::{
    config::{Config, TlsConfig},
    error::TransferError,
};

pub struct ClientBuilder {
    opts: MqttOptions,
    cap: usize,
    tls_config: Option<TlsConfig>,
}

impl ClientBuilder {
    /// Minimal builder: clean session, rumqttc defaults otherwise.
    pub fn new(client_id: impl Into<String>, host: impl Into<String>, port: u16, cap: usize) -> Self {
        let mut opts = MqttOptions::new(client_id, host, port);
        opts.set_clean_session(true);
        Self {
            opts,
            cap,
            tls_config: None,
        }
    }

    /// Builder for the configured device session.
    ///
    /// Generates a fresh client id (`{prefix}-{sn}-{unix_ts}`) on every call so
    /// that a second session never kicks the first one off the broker.
    pub fn from_config(config: &Config) -> Result<Self, TransferError> {
        let mut builder = Self::new(
            config.client_id(),
            config.host.clone(),
            config.port,
            config.request_channel_capacity,
        )
        .keep_alive(config.keep_alive)
        .clean_session(config.clean_session);

        if let Some(max) = config.max_packet_size {
            builder = builder.max_packet_size(max as usize, max as usize);
        }

        if let Some(username) = &config.username {
            builder = builder.credentials(
                username.clone(),
                config.password.clone().unwrap_or_default(),
            );
        }

        builder.tls_config = config.tls.clone().filter(TlsConfig::is_enabled);
        Ok(builder)
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls_config = Some(tls);
        self
    }

    pub fn keep_alive(mut self, secs: u64) -> Self {
        self.opts.set_keep_alive(Duration::from_secs(secs));
        self
    }

    pub fn max_packet_size(mut self, incoming: usize, outgoing: usize) -> Self {
        self.opts.set_max_packet_size(incoming, outgoing);
        self
    }

    pub fn clean_session(mut self, clean: bool) -> Self {
        self.opts.set_clean_session(clean);
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.opts.set_credentials(username, password);
        self
    }

    pub fn client_id(&self) -> String {
        self.opts.client_id()
    }

    fn load_file(path: &str) -> Result<Vec<u8>, TransferError> {
        Ok(fs::read(path)?)
    }

    fn build_tls_transport(tls: &TlsConfig) -> Result<Transport, TransferError> {
        tls.validate_config()
            .map_err(|e| TransferError::ClientSetup(format!("Invalid TLS configuration: {e}")))?;

        let ca_path = tls
            .ca_cert_path
            .as_deref()
            .ok_or_else(|| TransferError::ClientSetup("TLS configuration is not set".into()))?;
        let ca = Self::load_file(ca_path)?;

        let client_auth = match tls.client_auth() {
            Some((cert, key)) => Some((Self::load_file(cert)?, Self::load_file(key)?)),
            None => None,
        };

        Ok(Transport::Tls(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth,
        }))
    }

    pub fn build(self) -> Result<(AsyncClient, EventLoop), TransferError> {
        let mut opts = self.opts;
        if let Some(tls) = &self.tls_config {
            opts.set_transport(Self::build_tls_transport(tls)?);
        }

        Ok(AsyncClient::new(opts, self.cap))
    }
}
