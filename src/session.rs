//! Local control session for one robot.
//!
//! [`LocalClient`] wraps a [`Transport`] with the device's command protocol:
//!
//! - the `get_controller` handshake, which must succeed before the robot
//!   accepts mutating commands, and which is forgotten on every reconnect
//! - correlated commands that wait for their `data_feedback` acknowledgement
//! - fire-and-forget commands (lights, buzzer, chute)
//! - typed telemetry and heartbeat health
//!
//! Every correlated command registers its reply mailbox *before* publishing,
//! so a device that answers faster than the caller starts waiting is handled.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use futures_core::Stream;
use futures_util::{future, StreamExt};
use serde_json::{json, Map, Value};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use yardlink_mqtt::{
    topic::{command, feedback},
    MqttTransport, TransferError, Transport,
};

use crate::{
    config::{session::SessionConfig, TransportConfig},
    model::{CommandResult, LightState, Telemetry},
};

/// Pause before re-opening the heartbeat stream after a session loss.
const HEARTBEAT_REOPEN_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransferError),

    #[error("Command '{command}' rejected by device (state {code})")]
    Command { command: String, code: i64 },

    #[error("get_controller handshake rejected by device (state {code})")]
    NotController { code: i64 },
}

impl Error {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Transport(e) if e.is_timeout())
    }

    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Transport(e) if e.is_connection_error())
    }
}

struct HeartbeatMonitor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct LocalClient {
    transport: Arc<dyn Transport>,
    options: SessionConfig,
    command_timeout: Duration,
    controller: Arc<AtomicBool>,
    last_heartbeat: Arc<Mutex<Option<OffsetDateTime>>>,
    monitor: Mutex<Option<HeartbeatMonitor>>,
}

impl LocalClient {
    /// Wraps `transport`. The reconnect hook that drops the controller role is
    /// installed here, once.
    pub fn new(transport: Arc<dyn Transport>, options: SessionConfig, command_timeout: Duration) -> Self {
        let controller = Arc::new(AtomicBool::new(false));

        let flag = controller.clone();
        let sn = transport.serial().to_string();
        transport.add_reconnect_callback(Arc::new(move || {
            flag.store(false, Ordering::SeqCst);
            info!(sn = %sn, "Reconnected, controller role reset");
        }));

        Self {
            transport,
            options,
            command_timeout,
            controller,
            last_heartbeat: Arc::new(Mutex::new(None)),
            monitor: Mutex::new(None),
        }
    }

    /// Session over a fresh [`MqttTransport`].
    pub fn from_config(transport: TransportConfig, options: SessionConfig) -> Result<Self, Error> {
        let command_timeout = transport.command_timeout();
        let transport = MqttTransport::new(transport)?;
        Ok(Self::new(Arc::new(transport), options, command_timeout))
    }

    /// Opens the transport. A new session never inherits the controller
    /// role of an earlier one.
    pub async fn connect(&self) -> Result<(), Error> {
        self.controller.store(false, Ordering::SeqCst);
        self.transport.connect().await?;
        info!(sn = %self.serial_number(), "Local session connected");
        Ok(())
    }

    /// Stops the heartbeat monitor and closes the transport.
    pub async fn disconnect(&self) -> Result<(), Error> {
        self.stop_heartbeat_monitor().await;
        self.controller.store(false, Ordering::SeqCst);
        self.transport.disconnect().await?;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn serial_number(&self) -> &str {
        self.transport.serial()
    }

    pub fn controller_acquired(&self) -> bool {
        self.controller.load(Ordering::SeqCst)
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    // ------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------

    /// Requests the controller role.
    ///
    /// # Errors
    ///
    /// - [`Error::NotController`] when the device answers with a nonzero state
    /// - a timeout [`Error::Transport`] when no acknowledgement arrives
    ///
    /// The role is only marked acquired on an explicit success.
    pub async fn get_controller(&self) -> Result<CommandResult, Error> {
        let result = self
            .publish_and_wait(command::GET_CONTROLLER, json!({}), self.command_timeout)
            .await?;

        if !result.success() {
            warn!(sn = %self.serial_number(), state = result.state, "Controller handshake rejected");
            return Err(Error::NotController { code: result.state });
        }

        self.controller.store(true, Ordering::SeqCst);
        debug!(sn = %self.serial_number(), "Controller role acquired");
        Ok(result)
    }

    /// Runs the handshake if the role is not held and `auto_controller` is on.
    pub async fn ensure_controller(&self) -> Result<(), Error> {
        if !self.options.auto_controller || self.controller_acquired() {
            return Ok(());
        }
        self.get_controller().await?;
        tokio::time::sleep(self.options.settle_delay()).await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Correlated commands
    // ------------------------------------------------------------------

    /// Publishes `cmd` and waits for its `data_feedback` acknowledgement.
    ///
    /// The result is returned as received; callers decide what a nonzero
    /// state means.
    pub async fn publish_and_wait(
        &self,
        cmd: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<CommandResult, Error> {
        let queue = self.transport.create_wait_queue();
        if let Err(e) = self.transport.publish(cmd, &payload).await {
            self.transport.release_queue(queue);
            return Err(e.into());
        }

        let reply = self
            .transport
            .wait_for_message(timeout, feedback::DATA_FEEDBACK, Some(cmd), Some(queue))
            .await?;

        match reply {
            Some(envelope) => Ok(CommandResult::from_value(envelope.payload())),
            None => Err(TransferError::Timeout(format!(
                "Timed out waiting for '{cmd}' acknowledgement from {}",
                self.serial_number()
            ))
            .into()),
        }
    }

    async fn checked_command(&self, cmd: &str, payload: Value) -> Result<CommandResult, Error> {
        self.ensure_controller().await?;
        let result = self.publish_and_wait(cmd, payload, self.command_timeout).await?;
        if !result.success() {
            return Err(Error::Command {
                command: cmd.to_string(),
                code: result.state,
            });
        }
        info!(sn = %self.serial_number(), command = cmd, "Command acknowledged");
        Ok(result)
    }

    pub async fn start_plan(&self, plan_id: &str) -> Result<CommandResult, Error> {
        self.checked_command(command::START_PLAN, json!({ "planId": plan_id }))
            .await
    }

    pub async fn stop_plan(&self) -> Result<CommandResult, Error> {
        self.checked_command(command::STOP_PLAN, json!({})).await
    }

    pub async fn pause_plan(&self) -> Result<CommandResult, Error> {
        self.checked_command(command::PAUSE_PLAN, json!({})).await
    }

    pub async fn resume_plan(&self) -> Result<CommandResult, Error> {
        self.checked_command(command::RESUME_PLAN, json!({})).await
    }

    /// Sends the robot back to its dock (`cmd_recharge`).
    pub async fn return_to_dock(&self) -> Result<CommandResult, Error> {
        self.checked_command(command::CMD_RECHARGE, json!({})).await
    }

    // ------------------------------------------------------------------
    // Fire-and-forget commands
    // ------------------------------------------------------------------

    pub async fn set_lights(&self, state: LightState) -> Result<(), Error> {
        self.publish_raw(command::LIGHT_CTRL, state.to_payload()).await
    }

    pub async fn lights_on(&self) -> Result<(), Error> {
        self.set_lights(LightState::all_on()).await
    }

    pub async fn lights_off(&self) -> Result<(), Error> {
        self.set_lights(LightState::all_off()).await
    }

    pub async fn lights_body(&self) -> Result<(), Error> {
        self.set_lights(LightState::body_only()).await
    }

    /// `state` 1 plays, 0 stops.
    pub async fn buzzer(&self, state: i64) -> Result<(), Error> {
        let stamp = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
        self.publish_raw(
            command::CMD_BUZZER,
            json!({ "state": state, "timeStamp": stamp as i64 }),
        )
        .await
    }

    /// Snow chute direction. Positive turns right, negative left.
    pub async fn set_chute(&self, vel: i64) -> Result<(), Error> {
        self.publish_raw(command::CMD_CHUTE, json!({ "vel": vel })).await
    }

    /// Escape hatch for commands without a dedicated method.
    pub async fn publish_raw(&self, cmd: &str, payload: Value) -> Result<(), Error> {
        self.ensure_controller().await?;
        self.transport.publish(cmd, &payload).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Telemetry
    // ------------------------------------------------------------------

    /// One [`Telemetry`] per `DeviceMSG`, carrying the latest plan progress.
    ///
    /// Ends when the session is lost; call again after reconnecting.
    pub fn watch_telemetry(&self) -> impl Stream<Item = Telemetry> + Send + 'static {
        self.transport
            .telemetry_stream()
            .scan(None, |plan: &mut Option<Map<String, Value>>, envelope| {
                let item = match envelope.kind() {
                    feedback::PLAN_FEEDBACK => {
                        *plan = envelope.payload().as_object().filter(|p| !p.is_empty()).cloned();
                        None
                    }
                    feedback::DEVICE_MSG => {
                        let mut telemetry = Telemetry::from_value(envelope.payload());
                        if telemetry.sn.is_empty() {
                            telemetry.sn = envelope.serial().to_string();
                        }
                        if let Some(plan) = plan {
                            telemetry.merge_plan(plan);
                        }
                        Some(telemetry)
                    }
                    _ => None,
                };
                future::ready(Some(item))
            })
            .filter_map(future::ready)
    }

    /// Next `DeviceMSG` snapshot, or `None` after `timeout`.
    pub async fn get_status(&self, timeout: Duration) -> Result<Option<Telemetry>, Error> {
        let reply = self
            .transport
            .wait_for_message(timeout, feedback::DEVICE_MSG, None, None)
            .await?;

        Ok(reply.map(|envelope| {
            let mut telemetry = Telemetry::from_value(envelope.payload());
            if telemetry.sn.is_empty() {
                telemetry.sn = envelope.serial().to_string();
            }
            telemetry
        }))
    }

    // ------------------------------------------------------------------
    // Heartbeat health
    // ------------------------------------------------------------------

    /// Spawns a task stamping [`last_heartbeat`](Self::last_heartbeat) on every
    /// `heart_beat`. Restarts a running monitor.
    pub fn start_heartbeat_monitor(&self) {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(heartbeat_loop(
            self.transport.clone(),
            self.last_heartbeat.clone(),
            cancel.clone(),
        ));

        let previous = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(HeartbeatMonitor { cancel, task });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
    }

    pub async fn stop_heartbeat_monitor(&self) {
        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(monitor) = monitor {
            monitor.cancel.cancel();
            if let Err(e) = monitor.task.await {
                warn!("Heartbeat monitor task failed: {e}");
            }
        }
    }

    pub fn last_heartbeat(&self) -> Option<OffsetDateTime> {
        *self.last_heartbeat.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True if a heartbeat arrived within `max_age`.
    pub fn is_healthy(&self, max_age: Duration) -> bool {
        self.last_heartbeat()
            .is_some_and(|stamp| OffsetDateTime::now_utc() - stamp <= max_age)
    }

    /// [`is_healthy`](Self::is_healthy) with the configured age.
    pub fn is_healthy_default(&self) -> bool {
        self.is_healthy(self.options.heartbeat_max_age())
    }
}

async fn heartbeat_loop(
    transport: Arc<dyn Transport>,
    last: Arc<Mutex<Option<OffsetDateTime>>>,
    cancel: CancellationToken,
) {
    while !cancel.is_cancelled() {
        let mut stream = transport.telemetry_stream();
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return,
                next = stream.next() => next,
            };
            let Some(envelope) = next else { break };
            if envelope.kind() == feedback::HEART_BEAT {
                *last.lock().unwrap_or_else(PoisonError::into_inner) = Some(OffsetDateTime::now_utc());
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(HEARTBEAT_REOPEN_DELAY) => {}
        }
    }
}

impl Drop for LocalClient {
    fn drop(&mut self) {
        if let Some(monitor) = self
            .monitor
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            monitor.cancel.cancel();
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory [`Transport`] that answers like a device.

    use std::{
        collections::HashMap,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use async_trait::async_trait;
    use serde_json::Value;
    use tokio::sync::watch;
    use yardlink_mqtt::{
        transport::{envelope_stream, wait_on_queue},
        ConnectionState, Envelope, EnvelopeStream, ReconnectCallback, Router, TransferError,
        Transport, WaitQueue,
    };

    pub struct FakeTransport {
        pub sn: String,
        pub router: Router,
        pub published: Mutex<Vec<(String, Value)>>,
        /// Acknowledgement state per command leaf. Missing means no reply.
        pub replies: Mutex<HashMap<String, i64>>,
        pub connect_error: Mutex<Option<TransferError>>,
        pub fail_publish: Mutex<bool>,
        callbacks: Mutex<Vec<ReconnectCallback>>,
        state: watch::Sender<ConnectionState>,
    }

    impl FakeTransport {
        pub fn new(sn: &str) -> Arc<Self> {
            let (state, _) = watch::channel(ConnectionState::Connected);
            Arc::new(Self {
                sn: sn.to_string(),
                router: Router::default(),
                published: Mutex::new(Vec::new()),
                replies: Mutex::new(HashMap::new()),
                connect_error: Mutex::new(None),
                fail_publish: Mutex::new(false),
                callbacks: Mutex::new(Vec::new()),
                state,
            })
        }

        pub fn reply(&self, cmd: &str, state: i64) {
            self.replies.lock().unwrap().insert(cmd.to_string(), state);
        }

        pub fn leaves(&self) -> Vec<String> {
            self.published.lock().unwrap().iter().map(|(leaf, _)| leaf.clone()).collect()
        }

        pub fn inject(&self, leaf: &str, payload: Value) {
            self.router
                .deliver(&Envelope::new(format!("snowbot/{}/device/{leaf}", self.sn), payload));
        }

        pub fn simulate_reconnect(&self) {
            let callbacks = self.callbacks.lock().unwrap().clone();
            for callback in callbacks {
                callback();
            }
        }

        pub fn drop_session(&self) {
            self.state
                .send_replace(ConnectionState::Disconnected("link lost".into()));
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn serial(&self) -> &str {
            &self.sn
        }

        async fn connect(&self) -> Result<(), TransferError> {
            if let Some(e) = self.connect_error.lock().unwrap().take() {
                return Err(e);
            }
            self.state.send_replace(ConnectionState::Connected);
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), TransferError> {
            self.state
                .send_replace(ConnectionState::Disconnected("closed by client".into()));
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.state.borrow().is_connected()
        }

        async fn publish(&self, leaf: &str, payload: &Value) -> Result<(), TransferError> {
            if *self.fail_publish.lock().unwrap() {
                return Err(TransferError::NotConnected);
            }
            self.published
                .lock()
                .unwrap()
                .push((leaf.to_string(), payload.clone()));
            let reply = self.replies.lock().unwrap().get(leaf).copied();
            if let Some(state) = reply {
                self.inject(
                    "data_feedback",
                    serde_json::json!({"topic": leaf, "state": state, "data": {}}),
                );
            }
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
            envelope_stream(self.router.register(), self.state.subscribe())
        }

        fn add_reconnect_callback(&self, callback: ReconnectCallback) {
            self.callbacks.lock().unwrap().push(callback);
        }

        fn registered_queues(&self) -> usize {
            self.router.registered()
        }
    }
}
