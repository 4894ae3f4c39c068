//! MQTT to discrete input bridge.
//!
//! The bridge runs a reconnect loop:
//!
//! ```text
//! Disconnected -> Connecting -> Subscribed -> Receiving -> Disconnected
//!                     |             |             |
//!                     +-------------+-------------+--> BackoffWait -> Disconnected
//! ```
//!
//! Every pass starts by loading the configuration, so a [`ReconnectHandle::force_reconnect`]
//! is all it takes to apply new broker settings or topics. Topic lookups for
//! incoming messages use a freshly loaded configuration as well: a topic that
//! was removed from the mapping stays subscribed until the next reconnect but
//! no longer writes.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::registers::{RegisterBank, RegisterError, RegisterSpace};
use crate::session::{BrokerConnector, BrokerSession, InboundMessage, SessionError, SessionParams};
use crate::store::{ConfigProvider, DeviceConfig};

/// Delay between failed connection attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// Payloads (after trimming and lowercasing) that switch an input on.
pub const ON_PAYLOADS: [&str; 4] = ["on", "1", "true", "yes"];

/// Errors while handling a single message.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Payload on '{topic}' is not valid UTF-8: {source}")]
    Payload {
        topic: String,
        #[source]
        source: std::str::Utf8Error,
    },
    #[error("Cannot store value for '{topic}': {source}")]
    Register {
        topic: String,
        #[source]
        source: RegisterError,
    },
}

/// Connection state of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Disconnected,
    Connecting,
    Subscribed,
    Receiving,
    BackoffWait,
}

/// Commands accepted by a running bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeCommand {
    /// Tear down the current session and start over with a fresh configuration.
    ForceReconnect,
}

/// Handle for asking a running bridge to reconnect.
#[derive(Debug, Clone)]
pub struct ReconnectHandle {
    tx: mpsc::Sender<BridgeCommand>,
}

impl ReconnectHandle {
    /// Create a handle together with the receiving end of its channel.
    pub(crate) fn channel() -> (Self, mpsc::Receiver<BridgeCommand>) {
        let (tx, rx) = mpsc::channel(8);
        (Self { tx }, rx)
    }

    /// Request a reconnect.
    ///
    /// Returns `false` if the bridge is gone. A request made while another is
    /// still pending is merged into it.
    pub fn force_reconnect(&self) -> bool {
        match self.tx.try_send(BridgeCommand::ForceReconnect) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Bridge tuning.
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// Wait after a failed or lost connection
    pub reconnect_delay: Duration,
    /// MQTT keep-alive interval
    pub keep_alive: Duration,
    /// Client id prefix; the unix time in seconds is appended
    pub client_id_prefix: String,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            keep_alive: Duration::from_secs(60),
            client_id_prefix: "openwb-sim".to_string(),
        }
    }
}

/// Why a session ended.
#[derive(Debug)]
enum SessionEnd {
    Reconnect,
    Closed,
    Failed(SessionError),
}

/// Classify a payload: `true` for one of [`ON_PAYLOADS`], ignoring case and
/// surrounding whitespace.
pub fn payload_is_on(payload: &str) -> bool {
    let normalized = payload.trim().to_lowercase();
    ON_PAYLOADS.contains(&normalized.as_str())
}

/// Keeps the discrete inputs in sync with the configured MQTT topics.
pub struct MqttBridge<C: BrokerConnector> {
    connector: C,
    config: Arc<dyn ConfigProvider>,
    bank: Arc<RegisterBank>,
    options: BridgeOptions,
    commands: Option<mpsc::Receiver<BridgeCommand>>,
    state: watch::Sender<BridgeState>,
}

impl<C: BrokerConnector> MqttBridge<C> {
    /// Create a bridge and the handle used to make it reconnect.
    pub fn new(
        connector: C,
        config: Arc<dyn ConfigProvider>,
        bank: Arc<RegisterBank>,
        options: BridgeOptions,
    ) -> (Self, ReconnectHandle) {
        let (handle, rx) = ReconnectHandle::channel();
        let (state, _) = watch::channel(BridgeState::Disconnected);

        let bridge = Self {
            connector,
            config,
            bank,
            options,
            commands: Some(rx),
            state,
        };

        (bridge, handle)
    }

    /// Subscribe to state changes.
    pub fn state(&self) -> watch::Receiver<BridgeState> {
        self.state.subscribe()
    }

    /// Run the reconnect loop forever.
    pub async fn run(mut self) {
        info!(
            reconnect_delay_secs = self.options.reconnect_delay.as_secs(),
            "Starting MQTT bridge"
        );

        loop {
            self.set_state(BridgeState::Disconnected);
            self.drain_commands();
            let config = self.config.load();

            match self.run_session(&config).await {
                SessionEnd::Reconnect => {
                    info!("MQTT: reconnecting with current configuration");
                }
                SessionEnd::Closed => {
                    warn!(
                        broker = %config.broker_address,
                        "MQTT: connection closed by broker, restarting in {}s",
                        self.options.reconnect_delay.as_secs()
                    );
                    self.backoff().await;
                }
                SessionEnd::Failed(e) => {
                    error!(
                        broker = %config.broker_address,
                        port = config.broker_port,
                        "MQTT error: {}. Restarting in {}s",
                        e,
                        self.options.reconnect_delay.as_secs()
                    );
                    self.backoff().await;
                }
            }
        }
    }

    /// Connect, subscribe and receive until the session ends.
    async fn run_session(&mut self, config: &DeviceConfig) -> SessionEnd {
        self.set_state(BridgeState::Connecting);
        info!(
            broker = %config.broker_address,
            port = config.broker_port,
            "MQTT: connecting"
        );

        let params = self.session_params(config);
        let mut session = {
            let connect = self.connector.connect(&params);
            tokio::pin!(connect);

            loop {
                tokio::select! {
                    result = &mut connect => match result {
                        Ok(session) => break session,
                        Err(e) => return SessionEnd::Failed(e),
                    },
                    command = next_command(&mut self.commands) => {
                        if let Some(end) = on_command(&mut self.commands, command) {
                            return end;
                        }
                    }
                }
            }
        };

        let interrupted = {
            let subscribe = subscribe_all(&mut session, config);
            tokio::pin!(subscribe);

            loop {
                tokio::select! {
                    result = &mut subscribe => match result {
                        Ok(()) => break None,
                        Err(e) => break Some(SessionEnd::Failed(e)),
                    },
                    command = next_command(&mut self.commands) => {
                        if let Some(end) = on_command(&mut self.commands, command) {
                            break Some(end);
                        }
                    }
                }
            }
        };
        if let Some(end) = interrupted {
            session.disconnect().await;
            return end;
        }
        self.set_state(BridgeState::Subscribed);

        let end = self.receive(&mut session).await;
        if matches!(end, SessionEnd::Reconnect) {
            session.disconnect().await;
        }
        end
    }

    async fn receive<S: BrokerSession>(&mut self, session: &mut S) -> SessionEnd {
        self.set_state(BridgeState::Receiving);

        loop {
            tokio::select! {
                biased;

                command = next_command(&mut self.commands) => {
                    if let Some(end) = on_command(&mut self.commands, command) {
                        return end;
                    }
                }
                received = session.recv() => match received {
                    Ok(Some(message)) => {
                        if let Err(e) = self.handle_message(&message) {
                            error!(topic = %message.topic, "MQTT message error: {}", e);
                        }
                    }
                    Ok(None) => return SessionEnd::Closed,
                    Err(e) => return SessionEnd::Failed(e),
                },
            }
        }
    }

    /// Apply one message to the register bank.
    ///
    /// Returns the discrete input index that was written, or `None` when the
    /// topic is not mapped in the current configuration.
    pub fn handle_message(&self, message: &InboundMessage) -> Result<Option<u16>, BridgeError> {
        let payload = std::str::from_utf8(&message.payload).map_err(|source| BridgeError::Payload {
            topic: message.topic.clone(),
            source,
        })?;
        let value = u16::from(payload_is_on(payload));

        let config = self.config.load();
        let Some(index) = config.index_for(&message.topic) else {
            debug!(topic = %message.topic, "MQTT: topic not mapped, ignoring");
            return Ok(None);
        };

        self.bank
            .set_value(RegisterSpace::DiscreteInputs, index, value)
            .map_err(|source| BridgeError::Register {
                topic: message.topic.clone(),
                source,
            })?;

        info!("MQTT: {} -> DI{} is {}", message.topic, index as u32 + 1, value);
        Ok(Some(index))
    }

    async fn backoff(&mut self) {
        self.set_state(BridgeState::BackoffWait);

        let sleep = tokio::time::sleep(self.options.reconnect_delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return,
                command = next_command(&mut self.commands) => {
                    if on_command(&mut self.commands, command).is_some() {
                        info!("MQTT: reconnect requested, skipping backoff");
                        return;
                    }
                }
            }
        }
    }

    /// Discard queued commands; the configuration is about to be reloaded anyway.
    fn drain_commands(&mut self) {
        if let Some(rx) = &mut self.commands {
            while rx.try_recv().is_ok() {}
        }
    }

    fn session_params(&self, config: &DeviceConfig) -> SessionParams {
        SessionParams {
            client_id: format!(
                "{}-{}",
                self.options.client_id_prefix,
                chrono::Utc::now().timestamp()
            ),
            host: config.broker_address.clone(),
            port: config.broker_port,
            user: config.user.clone(),
            password: config.password.clone(),
            keep_alive: self.options.keep_alive,
        }
    }

    fn set_state(&self, state: BridgeState) {
        self.state.send_replace(state);
    }
}

/// Returns how the current phase should end, if at all.
fn on_command(
    commands: &mut Option<mpsc::Receiver<BridgeCommand>>,
    command: Option<BridgeCommand>,
) -> Option<SessionEnd> {
    match command {
        Some(BridgeCommand::ForceReconnect) => Some(SessionEnd::Reconnect),
        None => {
            debug!("All reconnect handles dropped");
            *commands = None;
            None
        }
    }
}

async fn subscribe_all<S: BrokerSession>(
    session: &mut S,
    config: &DeviceConfig,
) -> Result<(), SessionError> {
    for topic in config.topics() {
        session.subscribe(topic).await?;
        info!(topic = %topic, "MQTT: subscribed");
    }
    Ok(())
}

async fn next_command(commands: &mut Option<mpsc::Receiver<BridgeCommand>>) -> Option<BridgeCommand> {
    match commands {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
