//! Device transport: connection lifecycle, publishing and correlation.
//!
//! [`MqttTransport`] composes the pieces of this crate:
//!
//! ```text
//!              publish(leaf, doc)
//! caller ─────────────────────────▶ codec::encode ─▶ AsyncClient ─▶ broker
//!    ▲
//!    │ wait_for_message / telemetry_stream
//!    │
//! WaitQueue ◀── Router::deliver ◀── dispatcher ◀── KernelEvent ◀── ConnectionKernel
//! ```
//!
//! The [`Transport`] trait is the seam the session layer is written against,
//! so that protocol logic can be exercised without a broker.

use std::{
    pin::Pin,
    sync::{atomic::AtomicBool, Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use futures_core::Stream;
use rumqttc::{AsyncClient, QoS};
use serde_json::Value;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{
    client::ClientBuilder,
    codec,
    config::Config,
    connection::{ConnectionKernel, KernelEvent},
    envelope::Envelope,
    error::TransferError,
    router::{Router, WaitQueue},
    state::ConnectionState,
    topic::{self, Direction},
};

/// Zero-argument hook run once per reconnection, never on the initial connect.
///
/// Any session after the first counts as a reconnection, whether the kernel
/// restored it or a later `connect()` did.
pub type ReconnectCallback = Arc<dyn Fn() + Send + Sync>;

/// Lazy sequence of inbound envelopes.
pub type EnvelopeStream = Pin<Box<dyn Stream<Item = Envelope> + Send>>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Serial of the device this transport addresses.
    fn serial(&self) -> &str;

    /// Opens the session and subscribes the feedback leaves.
    async fn connect(&self) -> Result<(), TransferError>;

    /// Graceful close. Safe to call when already disconnected.
    async fn disconnect(&self) -> Result<(), TransferError>;

    fn is_connected(&self) -> bool;

    /// Encodes `payload` and sends it (QoS 0) to the app-direction `leaf`.
    async fn publish(&self, leaf: &str, payload: &Value) -> Result<(), TransferError>;

    /// Registers a mailbox. Create it *before* publishing the command whose
    /// reply it should catch.
    fn create_wait_queue(&self) -> WaitQueue;

    /// Deregisters a queue that will never be waited on.
    fn release_queue(&self, queue: WaitQueue) {
        drop(queue);
    }

    /// Waits for an envelope on the feedback `leaf`, optionally echoing
    /// `command`. Uses `queue` if given, otherwise registers a fresh one.
    ///
    /// Returns `Ok(None)` when `timeout` elapses. The mailbox is deregistered
    /// on every exit.
    async fn wait_for_message(
        &self,
        timeout: Duration,
        leaf: &str,
        command: Option<&str>,
        queue: Option<WaitQueue>,
    ) -> Result<Option<Envelope>, TransferError>;

    /// Every inbound envelope until the session is lost.
    fn telemetry_stream(&self) -> EnvelopeStream;

    fn add_reconnect_callback(&self, callback: ReconnectCallback);

    /// Number of registered mailboxes.
    fn registered_queues(&self) -> usize;
}

/// Waits on `queue` for a matching envelope, with `timeout`.
///
/// Shared by every [`Transport`] implementation; consumes the queue so that
/// it is released on all paths.
pub async fn wait_on_queue(
    queue: WaitQueue,
    timeout: Duration,
    leaf: &str,
    command: Option<&str>,
) -> Result<Option<Envelope>, TransferError> {
    let outcome = tokio::time::timeout(timeout, queue.recv_matching(leaf, command)).await;
    drop(queue);
    match outcome {
        Ok(Some(envelope)) => Ok(Some(envelope)),
        Ok(None) => Err(TransferError::Connection(format!(
            "transport closed while waiting for {leaf}"
        ))),
        Err(_) => Ok(None),
    }
}

/// Builds an [`EnvelopeStream`] over `queue` that ends when `state` reports
/// `Disconnected` (after draining what is already buffered).
pub fn envelope_stream(queue: WaitQueue, state: watch::Receiver<ConnectionState>) -> EnvelopeStream {
    enum Step {
        Item(Option<Envelope>),
        StateChanged(bool),
    }

    Box::pin(futures_util::stream::unfold(
        (queue, state),
        |(queue, mut state)| async move {
            loop {
                if let Some(envelope) = queue.try_recv() {
                    return Some((envelope, (queue, state)));
                }
                if matches!(*state.borrow_and_update(), ConnectionState::Disconnected(_)) {
                    return None;
                }

                let step = tokio::select! {
                    biased;
                    item = queue.recv() => Step::Item(item),
                    changed = state.changed() => Step::StateChanged(changed.is_ok()),
                };

                match step {
                    Step::Item(Some(envelope)) => return Some((envelope, (queue, state))),
                    Step::Item(None) | Step::StateChanged(false) => return None,
                    Step::StateChanged(true) => continue,
                }
            }
        },
    ))
}

struct ActiveSession {
    client: AsyncClient,
    cancel: CancellationToken,
    kernel: JoinHandle<Result<(), TransferError>>,
    dispatcher: JoinHandle<()>,
}

/// rumqttc-backed [`Transport`] for one device.
pub struct MqttTransport {
    config: Config,
    router: Router,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    callbacks: Arc<Mutex<Vec<ReconnectCallback>>>,
    /// Set by the first CONNACK of any kernel this transport spawns.
    ever_connected: Arc<AtomicBool>,
    session: tokio::sync::Mutex<Option<ActiveSession>>,
}

impl MqttTransport {
    /// Validates `config` and prepares a disconnected transport.
    pub fn new(config: Config) -> Result<Self, TransferError> {
        validator::Validate::validate(&config)?;
        let (state_tx, state_rx) = watch::channel(ConnectionState::default());
        Ok(Self {
            router: Router::new(config.mailbox_capacity),
            config,
            state_tx: Arc::new(state_tx),
            state_rx,
            callbacks: Arc::new(Mutex::new(Vec::new())),
            ever_connected: Arc::new(AtomicBool::new(false)),
            session: tokio::sync::Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    fn spawn_session(&self) -> Result<ActiveSession, TransferError> {
        let (client, event_loop) = ClientBuilder::from_config(&self.config)?.build()?;
        let cancel = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let kernel = ConnectionKernel::new(
            client.clone(),
            event_loop,
            self.config.feedback_topics(),
            self.config.backoff(),
            cancel.clone(),
            self.state_tx.clone(),
            events_tx,
            self.ever_connected.clone(),
        );

        let dispatcher = tokio::spawn(dispatch(events_rx, self.router.clone(), self.callbacks.clone()));
        let kernel = tokio::spawn(kernel.run());

        Ok(ActiveSession {
            client,
            cancel,
            kernel,
            dispatcher,
        })
    }

    async fn wait_connected(&self) -> Result<(), TransferError> {
        let mut state = self.state_rx.clone();
        loop {
            match &*state.borrow_and_update() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Disconnected(reason) if !reason.is_empty() => {
                    return Err(TransferError::Connection(format!(
                        "Cannot connect to MQTT broker {}:{}: {reason}",
                        self.config.host, self.config.port
                    )));
                }
                _ => {}
            }
            if state.changed().await.is_err() {
                return Err(TransferError::Connection("connection state channel closed".into()));
            }
        }
    }

    async fn teardown(session: ActiveSession) {
        session.cancel.cancel();
        match session.kernel.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Connection kernel ended with error: {e}"),
            Err(e) => warn!("Connection kernel task failed: {e}"),
        }
        if let Err(e) = session.dispatcher.await {
            warn!("Dispatcher task failed: {e}");
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    fn serial(&self) -> &str {
        &self.config.sn
    }

    async fn connect(&self) -> Result<(), TransferError> {
        let mut guard = self.session.lock().await;
        if let Some(stale) = guard.take() {
            Self::teardown(stale).await;
        }

        // Reset so a stale failure reason from a previous attempt is not read
        // as this attempt's outcome.
        self.state_tx.send_replace(ConnectionState::Connecting);
        let session = self.spawn_session()?;

        let outcome = tokio::time::timeout(self.config.connect_timeout(), self.wait_connected()).await;
        match outcome {
            Ok(Ok(())) => {
                info!(
                    host = %self.config.host,
                    port = self.config.port,
                    sn = %self.config.sn,
                    "MQTT connected"
                );
                *guard = Some(session);
                Ok(())
            }
            Ok(Err(e)) => {
                Self::teardown(session).await;
                Err(e)
            }
            Err(_) => {
                Self::teardown(session).await;
                self.state_tx
                    .send_replace(ConnectionState::Disconnected("connect timed out".into()));
                Err(TransferError::Timeout(format!(
                    "Timed out waiting for MQTT connection to {}:{}",
                    self.config.host, self.config.port
                )))
            }
        }
    }

    async fn disconnect(&self) -> Result<(), TransferError> {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            Self::teardown(session).await;
            info!(host = %self.config.host, "MQTT disconnected");
        }
        self.state_tx
            .send_replace(ConnectionState::Disconnected("closed by client".into()));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state_rx.borrow().is_connected()
    }

    async fn publish(&self, leaf: &str, payload: &Value) -> Result<(), TransferError> {
        if !self.is_connected() {
            return Err(TransferError::NotConnected);
        }
        let client = match self.session.lock().await.as_ref() {
            Some(session) => session.client.clone(),
            None => return Err(TransferError::NotConnected),
        };

        let topic = topic::build(&self.config.namespace, &self.config.sn, leaf, Direction::App);
        let bytes = codec::encode(payload).await?;
        client.publish_bytes(topic.as_str(), QoS::AtMostOnce, false, bytes).await?;

        debug!(topic = %topic, "→ {}", preview(payload));
        Ok(())
    }

    fn create_wait_queue(&self) -> WaitQueue {
        self.router.register()
    }

    async fn wait_for_message(
        &self,
        timeout: Duration,
        leaf: &str,
        command: Option<&str>,
        queue: Option<WaitQueue>,
    ) -> Result<Option<Envelope>, TransferError> {
        let queue = queue.unwrap_or_else(|| self.router.register());
        wait_on_queue(queue, timeout, leaf, command).await
    }

    fn telemetry_stream(&self) -> EnvelopeStream {
        envelope_stream(self.router.register(), self.state_rx.clone())
    }

    fn add_reconnect_callback(&self, callback: ReconnectCallback) {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    fn registered_queues(&self) -> usize {
        self.router.registered()
    }
}

/// Dispatcher task: decodes each inbound payload once, fans it out, and runs
/// reconnect callbacks. Closes every mailbox when the kernel goes away.
async fn dispatch(
    mut events: mpsc::UnboundedReceiver<KernelEvent>,
    router: Router,
    callbacks: Arc<Mutex<Vec<ReconnectCallback>>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            KernelEvent::Message { topic, payload } => {
                let doc = codec::decode(&payload).await;
                if codec::is_raw_fallback(&doc) {
                    debug!(topic = %topic, "Undecodable payload, delivering raw fallback");
                }
                trace!(topic = %topic, "← {}", preview(&doc));
                router.deliver(&Envelope::new(topic, doc));
            }
            KernelEvent::Connected { reconnect: true } => {
                let snapshot: Vec<ReconnectCallback> = callbacks
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                debug!(callbacks = snapshot.len(), "Running reconnect callbacks");
                for callback in snapshot {
                    callback();
                }
            }
            KernelEvent::Connected { reconnect: false } => {}
            KernelEvent::Disconnected(reason) => {
                warn!("MQTT session lost: {reason}");
            }
        }
    }
    router.close_all();
}

fn preview(doc: &Value) -> String {
    let mut text = doc.to_string();
    if text.len() > 160 {
        let mut cut = 160;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}
