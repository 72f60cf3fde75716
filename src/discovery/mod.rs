//! LAN discovery of robot brokers.
//!
//! ```text
//! ScanTarget ──▶ candidates ──▶ TCP connect ──▶ heartbeat sniff ──▶ ARP / rDNS
//!   (+known hosts, dedup)      (≤1.5s)          (probe_timeout)     (best effort)
//!                                                      │
//!                                          classify ◀──┘ ──▶ rank
//! ```
//!
//! A candidate only becomes an [`Endpoint`] once a valid heartbeat has been
//! seen on its broker. Per-candidate failures are logged at debug level and
//! dropped; a scan that finds nothing returns an empty list.

use std::{
    fmt, io,
    net::{IpAddr, SocketAddr},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use futures_util::future;
use serde::Serialize;
use thiserror::Error;
use tokio::{net::TcpStream, sync::Semaphore};
use tracing::{debug, info};
use yardlink_mqtt::{probe, Envelope};

use crate::{config::discovery::DiscoveryConfig, model::Heartbeat};

pub mod classify;
pub mod net;

pub use classify::{classify, connection_order, rank, Role};
pub use net::Ipv4Net;

/// Upper bound for the reachability check, whatever the probe timeout.
const TCP_PROBE_CAP: Duration = Duration::from_millis(1500);

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Invalid CIDR: {0}")]
    InvalidCidr(String),

    #[error("Invalid scan target '{0}': expected 'auto', an IP address or a CIDR")]
    InvalidTarget(String),

    #[error("Cannot enumerate network interfaces: {0}")]
    Interfaces(#[from] io::Error),
}

/// A verified robot broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub address: IpAddr,
    pub port: u16,
    pub role: Role,
    pub mac: Option<String>,
    pub hostname: Option<String>,
    pub recommended: bool,
    /// Serial read from the heartbeat topic.
    pub serial: Option<String>,
}

impl Endpoint {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.socket_addr(), self.role)?;
        if let Some(serial) = &self.serial {
            write!(f, " sn={serial}")?;
        }
        if self.recommended {
            f.write_str(" [recommended]")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanTarget {
    Address(IpAddr),
    Cidr(String),
    /// Subnets of the host's own interfaces.
    Auto,
}

impl FromStr for ScanTarget {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("auto") {
            return Ok(ScanTarget::Auto);
        }
        if s.contains('/') {
            return Ok(ScanTarget::Cidr(s.to_string()));
        }
        s.parse()
            .map(ScanTarget::Address)
            .map_err(|_| DiscoveryError::InvalidTarget(s.to_string()))
    }
}

/// Serial and parsed beacon of a heartbeat that confirms the protocol.
pub fn confirm_heartbeat(envelope: &Envelope) -> Option<(String, Heartbeat)> {
    if !probe::is_valid_heartbeat(envelope) {
        return None;
    }
    let beat = Heartbeat::from_value(envelope.payload())?;
    Some((envelope.serial().to_string(), beat))
}

/// Resolves a configured broker `host` (address or name) into a recommended
/// endpoint of unknown role. IPv4 answers are preferred.
pub async fn resolve_endpoint(host: &str, port: u16) -> io::Result<Endpoint> {
    let mut addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
    addrs.sort_by_key(|addr| !addr.is_ipv4());
    let addr = addrs.first().ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("no address for {host}"))
    })?;
    let hostname = host.parse::<IpAddr>().is_err().then(|| host.to_string());

    Ok(Endpoint {
        address: addr.ip(),
        port,
        role: Role::Unknown,
        mac: None,
        hostname,
        recommended: true,
        serial: None,
    })
}

pub struct Scanner {
    config: DiscoveryConfig,
    namespace: String,
}

impl Scanner {
    pub fn new(config: DiscoveryConfig, namespace: impl Into<String>) -> Self {
        Self {
            config,
            namespace: namespace.into(),
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Addresses to probe for `target`: the target's hosts, then the known
    /// hosts, without duplicates.
    pub fn candidates(&self, target: &ScanTarget) -> Result<Vec<IpAddr>, DiscoveryError> {
        let cap = self.config.max_hosts_per_subnet;
        let mut candidates: Vec<IpAddr> = match target {
            ScanTarget::Address(ip) => vec![*ip],
            ScanTarget::Cidr(cidr) => cidr
                .parse::<Ipv4Net>()?
                .capped_hosts(cap)
                .into_iter()
                .map(IpAddr::V4)
                .collect(),
            ScanTarget::Auto => net::auto_subnets(self.config.min_prefix)?
                .iter()
                .flat_map(|subnet| subnet.capped_hosts(cap))
                .map(IpAddr::V4)
                .collect(),
        };

        candidates.extend(self.config.known_hosts.iter().filter_map(|h| h.parse::<IpAddr>().ok()));

        let mut seen = std::collections::HashSet::new();
        candidates.retain(|ip| seen.insert(*ip));
        Ok(candidates)
    }

    /// Probes every candidate and returns the ranked endpoints.
    pub async fn scan(&self, target: &ScanTarget) -> Result<Vec<Endpoint>, DiscoveryError> {
        let candidates = self.candidates(target)?;
        info!(
            candidates = candidates.len(),
            port = self.config.port,
            concurrency = self.config.concurrency,
            "Scanning for robot brokers"
        );

        // A zero permit count would park every probe forever.
        let permits = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let probes = candidates.into_iter().map(|ip| {
            let permits = permits.clone();
            async move {
                let _permit = permits.acquire_owned().await.ok()?;
                self.probe(ip).await
            }
        });

        let found: Vec<Endpoint> = future::join_all(probes).await.into_iter().flatten().collect();
        let ranked = rank(found);

        info!(found = ranked.len(), "Discovery finished");
        for endpoint in &ranked {
            info!("  {endpoint}");
        }
        Ok(ranked)
    }

    async fn probe(&self, ip: IpAddr) -> Option<Endpoint> {
        let port = self.config.port;
        let addr = SocketAddr::new(ip, port);
        let probe_timeout = self.config.probe_timeout();

        match tokio::time::timeout(probe_timeout.min(TCP_PROBE_CAP), TcpStream::connect(addr)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                debug!(%addr, "Port closed: {e}");
                return None;
            }
            Err(_) => {
                debug!(%addr, "Port check timed out");
                return None;
            }
        }

        let host = ip.to_string();
        let (serial, beat) = match probe::sniff_heartbeat(&host, port, &self.namespace, probe_timeout).await {
            Ok(Some(envelope)) => confirm_heartbeat(&envelope)?,
            Ok(None) => {
                debug!(%addr, "Broker answered but no heartbeat arrived");
                return None;
            }
            Err(e) => {
                debug!(%addr, "Heartbeat probe failed: {e}");
                return None;
            }
        };

        let (mac, hostname) = tokio::join!(net::lookup_mac(ip), net::reverse_dns(ip));
        let role = classify(
            mac.as_deref(),
            hostname.as_deref(),
            &self.config.vendor_markers,
        );
        debug!(
            %addr,
            sn = %serial,
            %role,
            ?mac,
            ?hostname,
            working_state = ?beat.working_state,
            "Robot broker confirmed"
        );

        Some(Endpoint {
            address: ip,
            port,
            role,
            mac,
            hostname,
            recommended: false,
            serial: Some(serial),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn scanner(known_hosts: &[&str]) -> Scanner {
        let config = DiscoveryConfig {
            known_hosts: known_hosts.iter().map(|h| h.to_string()).collect(),
            probe_timeout_ms: 300,
            ..Default::default()
        };
        Scanner::new(config, "snowbot")
    }

    #[test]
    fn test_scan_target_parse() {
        assert_eq!("auto".parse::<ScanTarget>().unwrap(), ScanTarget::Auto);
        assert_eq!(
            "192.168.1.24".parse::<ScanTarget>().unwrap(),
            ScanTarget::Address("192.168.1.24".parse().unwrap())
        );
        assert_eq!(
            "10.0.0.0/24".parse::<ScanTarget>().unwrap(),
            ScanTarget::Cidr("10.0.0.0/24".into())
        );
        assert!(matches!(
            "robot.local".parse::<ScanTarget>(),
            Err(DiscoveryError::InvalidTarget(_))
        ));
    }

    #[test]
    fn test_candidates_dedup_known_hosts() {
        let scanner = scanner(&["192.168.1.24", "192.168.1.55", "192.168.1.24"]);
        let target = ScanTarget::Address("192.168.1.55".parse().unwrap());
        let candidates: Vec<String> = scanner
            .candidates(&target)
            .unwrap()
            .iter()
            .map(|ip| ip.to_string())
            .collect();
        assert_eq!(candidates, ["192.168.1.55", "192.168.1.24"]);
    }

    #[test]
    fn test_candidates_cidr_capped() {
        let mut scanner = scanner(&[]);
        scanner.config.max_hosts_per_subnet = 10;
        let candidates = scanner
            .candidates(&ScanTarget::Cidr("10.1.0.0/16".into()))
            .unwrap();
        assert_eq!(candidates.len(), 10);
    }

    #[test]
    fn test_invalid_cidr_is_error() {
        let scanner = scanner(&[]);
        let err = scanner
            .candidates(&ScanTarget::Cidr("10.1.0.0/40".into()))
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::InvalidCidr(_)));
    }

    #[test]
    fn test_heartbeat_confirms_serial() {
        let envelope = Envelope::new("ns/SN77/device/heart_beat", json!({"working_state": 1}));
        let (serial, beat) = confirm_heartbeat(&envelope).unwrap();
        assert_eq!(serial, "SN77");
        assert_eq!(beat.working_state, Some(1));

        let raw = Envelope::new("ns/SN77/device/heart_beat", json!({"_raw": "789c"}));
        assert_eq!(confirm_heartbeat(&raw), None);
    }

    /// Minimal broker: CONNACK, SUBACK for the first SUBSCRIBE, then one
    /// plain-JSON heartbeat published on the subscribed filter's topic.
    async fn heartbeat_broker(topic: &'static str) -> (u16, tokio::sync::oneshot::Receiver<String>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (filter_tx, filter_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let mut filter_tx = Some(filter_tx);
            loop {
                // The TCP reachability check opens and drops a connection
                // first; only the MQTT session sends a CONNECT.
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 1024];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                if n == 0 || buf[0] != 0x10 {
                    continue;
                }
                socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();

                let n = socket.read(&mut buf).await.unwrap();
                assert_eq!(buf[0] & 0xF0, 0x80, "expected SUBSCRIBE");
                let pkid = [buf[2], buf[3]];
                let filter_len = u16::from_be_bytes([buf[4], buf[5]]) as usize;
                let filter = String::from_utf8_lossy(&buf[6..6 + filter_len]).to_string();
                assert!(n >= 6 + filter_len);
                if let Some(tx) = filter_tx.take() {
                    let _ = tx.send(filter);
                }
                socket.write_all(&[0x90, 0x03, pkid[0], pkid[1], 0x00]).await.unwrap();

                let payload = br#"{"working_state":1}"#;
                let mut packet = vec![0x30, (2 + topic.len() + payload.len()) as u8];
                packet.extend_from_slice(&(topic.len() as u16).to_be_bytes());
                packet.extend_from_slice(topic.as_bytes());
                packet.extend_from_slice(payload);
                socket.write_all(&packet).await.unwrap();

                // Hold the session open until the client hangs up.
                while socket.read(&mut buf).await.map(|n| n > 0).unwrap_or(false) {}
                return;
            }
        });
        (port, filter_rx)
    }

    #[tokio::test]
    async fn test_scan_confirms_sn77_in_configured_namespace() {
        let (port, filter_rx) = heartbeat_broker("ns/SN77/device/heart_beat").await;
        let config = DiscoveryConfig {
            port,
            probe_timeout_ms: 2000,
            known_hosts: vec![],
            ..Default::default()
        };
        let scanner = Scanner::new(config, "ns");

        let found = scanner
            .scan(&ScanTarget::Address("127.0.0.1".parse().unwrap()))
            .await
            .unwrap();

        assert_eq!(filter_rx.await.unwrap(), "ns/+/device/heart_beat");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].serial.as_deref(), Some("SN77"));
        assert!(found[0].recommended);
    }

    #[tokio::test]
    async fn test_zero_concurrency_still_scans() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut scanner = scanner(&[]);
        scanner.config.port = port;
        scanner.config.concurrency = 0;

        let found = tokio::time::timeout(
            Duration::from_secs(5),
            scanner.scan(&ScanTarget::Address("127.0.0.1".parse().unwrap())),
        )
        .await
        .expect("scan must not stall on zero concurrency")
        .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_scan_closed_port_is_empty() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut scanner = scanner(&[]);
        scanner.config.port = port;

        let found = scanner
            .scan(&ScanTarget::Address("127.0.0.1".parse().unwrap()))
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_endpoint_accepts_names_and_addresses() {
        let by_address = resolve_endpoint("192.168.1.24", 1883).await.unwrap();
        assert_eq!(by_address.address, "192.168.1.24".parse::<IpAddr>().unwrap());
        assert_eq!(by_address.hostname, None);
        assert!(by_address.recommended);

        let by_name = resolve_endpoint("localhost", 1883).await.unwrap();
        assert!(by_name.address.is_loopback());
        assert_eq!(by_name.hostname.as_deref(), Some("localhost"));
        assert_eq!(by_name.role, Role::Unknown);
    }

    #[tokio::test]
    async fn test_resolve_endpoint_unknown_name_is_error() {
        assert!(resolve_endpoint("no-such-host.invalid", 1883).await.is_err());
    }

    #[test]
    fn test_endpoint_display() {
        let endpoint = Endpoint {
            address: "192.168.1.55".parse().unwrap(),
            port: 1883,
            role: Role::Secondary,
            mac: None,
            hostname: None,
            recommended: true,
            serial: Some("SN77".into()),
        };
        assert_eq!(
            endpoint.to_string(),
            "192.168.1.55:1883 (secondary) sn=SN77 [recommended]"
        );
    }
}
