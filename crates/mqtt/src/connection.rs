//! Connection kernel: the only task that polls the rumqttc event loop.
//!
//! The kernel never touches mailboxes, callbacks, or session state. Every
//! event it observes is handed to the dispatcher over an unbounded channel:
//!
//! ```text
//!  network                 kernel task                    dispatcher task
//! ─────────▶ EventLoop::poll ──▶ KernelEvent ──mpsc──▶ decode ─▶ Router::deliver
//!                 │                                       └─▶ reconnect callbacks
//!                 └──▶ watch<ConnectionState>
//! ```
//!
//! Lifecycle rules:
//! - Every successful CONNACK re-issues the full feedback subscription set;
//!   with a clean session the broker forgets subscriptions on a drop.
//! - A poll error before this kernel's first CONNACK ends the kernel: `connect()`
//!   reports it to the caller instead of retrying behind their back.
//! - After the first CONNACK, transient errors are retried with [`Backoff`];
//!   fatal ones (bad credentials, TLS) end the kernel.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Outgoing, Packet, QoS,
    SubscribeFilter,
};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{backoff::Backoff, error::TransferError, state::ConnectionState};

/// Events crossing from the kernel task to the dispatcher.
#[derive(Debug)]
pub enum KernelEvent {
    /// CONNACK accepted. `reconnect` is false only for the first one in the
    /// owning transport's lifetime, across kernel restarts.
    Connected { reconnect: bool },
    /// Session lost; the kernel may still be retrying.
    Disconnected(String),
    Message { topic: String, payload: Bytes },
}

pub struct ConnectionKernel {
    client: AsyncClient,
    event_loop: EventLoop,
    subscriptions: Vec<SubscribeFilter>,
    backoff: Backoff,
    cancel: CancellationToken,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    events: mpsc::UnboundedSender<KernelEvent>,
    /// Shared with the transport; outlives this kernel.
    ever_connected: Arc<AtomicBool>,
    /// Set by this kernel's first CONNACK.
    established: bool,
    connected: bool,
}

impl ConnectionKernel {
    pub fn new(
        client: AsyncClient,
        event_loop: EventLoop,
        topics: Vec<String>,
        backoff: Backoff,
        cancel: CancellationToken,
        state_tx: Arc<watch::Sender<ConnectionState>>,
        events: mpsc::UnboundedSender<KernelEvent>,
        ever_connected: Arc<AtomicBool>,
    ) -> Self {
        let subscriptions = topics
            .into_iter()
            .map(|path| SubscribeFilter::new(path, QoS::AtMostOnce))
            .collect();
        Self {
            client,
            event_loop,
            subscriptions,
            backoff,
            cancel,
            state_tx,
            events,
            ever_connected,
            established: false,
            connected: false,
        }
    }

    fn update_state(&self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state.clone();
                true
            }
        });
        if changed {
            debug!(state = %state, "Connection state changed");
        }
    }

    fn emit(&self, event: KernelEvent) {
        if self.events.send(event).is_err() {
            trace!("Dispatcher gone, dropping kernel event");
        }
    }

    /// Drives the event loop until cancelled or a fatal error.
    pub async fn run(mut self) -> Result<(), TransferError> {
        self.update_state(ConnectionState::Connecting);

        loop {
            let polled = tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.shutdown().await;
                    return Ok(());
                }
                polled = self.event_loop.poll() => polled,
            };

            match polled {
                Ok(event) => self.handle_event(event),
                Err(e) => self.handle_error(e).await?,
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Incoming(Packet::ConnAck(conn_ack)) => {
                if conn_ack.code != ConnectReturnCode::Success {
                    return;
                }
                let reconnect = self.ever_connected.swap(true, Ordering::SeqCst);
                self.established = true;
                self.connected = true;
                self.backoff.reset();
                self.resubscribe();
                if reconnect {
                    info!("Reconnected to broker");
                } else {
                    info!("Connection established");
                }
                self.update_state(ConnectionState::Connected);
                self.emit(KernelEvent::Connected { reconnect });
            }
            Event::Incoming(Packet::Publish(publish)) => {
                trace!(topic = %publish.topic, bytes = publish.payload.len(), "Received publish");
                self.emit(KernelEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload,
                });
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!("Disconnected by broker");
                self.mark_lost("Disconnected by broker".into());
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                trace!(pkid = ack.pkid, "Subscriptions acknowledged");
            }
            Event::Incoming(_) => {}
            Event::Outgoing(outgoing) => {
                trace!("Outgoing packet: {:?}", outgoing);
            }
        }
    }

    /// Issues the subscription set without awaiting the request channel: this
    /// task is the one draining it.
    fn resubscribe(&self) {
        if self.subscriptions.is_empty() {
            return;
        }
        match self.client.try_subscribe_many(self.subscriptions.clone()) {
            Ok(()) => debug!(count = self.subscriptions.len(), "Feedback subscriptions issued"),
            Err(e) => error!("Failed to issue feedback subscriptions: {e}"),
        }
    }

    fn mark_lost(&mut self, reason: String) {
        if self.connected {
            self.connected = false;
            self.emit(KernelEvent::Disconnected(reason.clone()));
        }
        self.update_state(ConnectionState::Disconnected(reason));
    }

    async fn handle_error(&mut self, e: ConnectionError) -> Result<(), TransferError> {
        let reason = get_error_message(&e);
        self.mark_lost(reason.clone());

        if !self.established {
            debug!("Initial connection failed: {e}");
            return Err(TransferError::Connection(reason));
        }

        if is_fatal_error(&e) {
            error!("Fatal connection error, stopping kernel: {reason}");
            return Err(TransferError::from(e));
        }

        let delay = self.backoff.next_delay().map_err(|backoff_err| {
            error!("Reconnect abandoned: {backoff_err}");
            self.update_state(ConnectionState::Disconnected(backoff_err.to_string()));
            TransferError::RetriesPolicy(backoff_err)
        })?;

        warn!(
            "Reconnecting in {:.2} seconds due to error: {}",
            delay.as_secs_f64(),
            reason
        );
        self.update_state(ConnectionState::Reconnecting(delay.as_secs_f64()));

        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
        Ok(())
    }

    /// Sends DISCONNECT and polls briefly so it actually reaches the socket.
    async fn shutdown(&mut self) {
        info!("Shutdown requested, disconnecting");
        if self.connected {
            if let Err(e) = self.client.try_disconnect() {
                warn!("Error queueing disconnect packet: {e}");
            } else {
                let flush = async {
                    loop {
                        match self.event_loop.poll().await {
                            Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                            Ok(_) => {}
                        }
                    }
                };
                if tokio::time::timeout(std::time::Duration::from_secs(1), flush)
                    .await
                    .is_err()
                {
                    debug!("Disconnect flush timed out");
                }
            }
        }
        self.connected = false;
        self.update_state(ConnectionState::Disconnected("closed by client".into()));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Fatal,
    Reconnect,
}

fn classify_connection_error(err: &ConnectionError) -> Disposition {
    use Disposition::*;

    match err {
        ConnectionError::Tls(_) => Fatal,
        ConnectionError::MqttState(_) => Reconnect,
        ConnectionError::NotConnAck(_) => Fatal,
        ConnectionError::RequestsDone => Fatal,

        ConnectionError::Io(e) => match e.kind() {
            std::io::ErrorKind::AddrInUse
            | std::io::ErrorKind::PermissionDenied
            | std::io::ErrorKind::InvalidInput => Fatal,
            _ => Reconnect,
        },

        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => Reconnect,

        ConnectionError::ConnectionRefused(code) => match code {
            ConnectReturnCode::RefusedProtocolVersion
            | ConnectReturnCode::BadClientId
            | ConnectReturnCode::BadUserNamePassword
            | ConnectReturnCode::NotAuthorized => Fatal,
            _ => Reconnect,
        },

        #[allow(unreachable_patterns)]
        _ => Reconnect,
    }
}

fn is_fatal_error(err: &ConnectionError) -> bool {
    matches!(classify_connection_error(err), Disposition::Fatal)
}

/// Innermost message in the error source chain.
pub(crate) fn get_error_message(e: &dyn std::error::Error) -> String {
    let mut current = e;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string().trim_matches('"').to_string()
}
