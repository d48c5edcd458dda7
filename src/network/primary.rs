// Primary channel connection manager
// Sans-I/O state machine: the driver feeds transport events and the current time
// through `handle_input`, then drains `poll_output` until it yields `Timeout`.
// Every timer (reconnect, heartbeat, staleness) is a deadline owned here.

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::backoff::ReconnectPolicy;
use super::client::{Notification, PrimaryEvent};
use super::protocol::{ClientMessage, DeviceInfo, ServerMessage};
use crate::config::NetworkConfig;
use crate::storage::{last_room_id, save_room_id, PersistentQueue, Storage};

/// Close code for an intentional close; any other code triggers a reconnect
pub const NORMAL_CLOSURE: u16 = 1000;

const EXHAUSTED_MESSAGE: &str =
    "Unable to reach the game server. Check your connection and try again.";

#[derive(Debug, Clone)]
pub struct PrimaryConfig {
    pub url: String,
    pub heartbeat_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub backoff_factor: f64,
}

impl PrimaryConfig {
    pub fn from_network(config: &NetworkConfig) -> Self {
        Self {
            url: config.ws_url.clone(),
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
            max_reconnect_attempts: config.max_reconnect_attempts,
            reconnect_delay: Duration::from_millis(config.reconnect_delay_ms),
            backoff_factor: config.backoff_factor,
        }
    }

    /// Silence longer than this means the connection is dead
    pub fn stale_after(&self) -> Duration {
        self.heartbeat_interval * 2
    }
}

/// Who this client announces itself as in `hello`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub player_id: String,
    pub is_admin: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Transport events fed in by the driver
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Opened,
    Frame(String),
    Closed { code: u16, reason: String },
    Error(String),
    /// A deadline from `Output::Timeout` has passed
    Timeout,
}

/// Work for the driver
#[derive(Debug, Clone)]
pub enum Output {
    /// Open a new socket to this URL
    Connect(String),

    /// Write this message on the open socket
    Transmit(ClientMessage),

    /// Close the socket with this code and forget it
    Close(u16),

    Event(PrimaryEvent),

    /// Nothing more to do until this deadline (or the next input)
    Timeout(Option<Instant>),
}

pub struct PrimaryChannel {
    config: PrimaryConfig,
    identity: Identity,
    state: ConnectionState,
    policy: ReconnectPolicy,
    queue: Box<dyn PersistentQueue>,
    storage: Box<dyn Storage>,
    room_id: Option<String>,

    reconnect_at: Option<Instant>,
    next_heartbeat: Option<Instant>,
    last_inbound: Option<Instant>,

    exhausted_notified: bool,
    shut_down: bool,
    outputs: VecDeque<Output>,
}

impl PrimaryChannel {
    pub fn new(
        config: PrimaryConfig,
        identity: Identity,
        queue: Box<dyn PersistentQueue>,
        storage: Box<dyn Storage>,
    ) -> Self {
        let policy = ReconnectPolicy::new(
            config.max_reconnect_attempts,
            config.reconnect_delay,
            config.backoff_factor,
        );
        let room_id = last_room_id(storage.as_ref());

        Self {
            config,
            identity,
            state: ConnectionState::Disconnected,
            policy,
            queue,
            storage,
            room_id,
            reconnect_at: None,
            next_heartbeat: None,
            last_inbound: None,
            exhausted_notified: false,
            shut_down: false,
            outputs: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.policy.attempts()
    }

    pub fn pending_len(&self) -> usize {
        self.queue.len()
    }

    /// Open a connection unless one is already open or opening
    pub fn connect(&mut self) {
        if self.shut_down {
            warn!("Ignoring connect on a shut down primary channel");
            return;
        }
        match self.state {
            ConnectionState::Connected | ConnectionState::Connecting => {
                debug!("Connect ignored, already {:?}", self.state);
            }
            ConnectionState::Disconnected => {
                // An explicit connect supersedes any scheduled reconnect
                self.reconnect_at = None;
                self.set_state(ConnectionState::Connecting);
                info!("Connecting to {}", self.config.url);
                self.outputs
                    .push_back(Output::Connect(self.config.url.clone()));
            }
        }
    }

    /// External re-initialization: refills the reconnect budget and connects
    pub fn resume(&mut self) {
        self.shut_down = false;
        self.policy.reset();
        self.exhausted_notified = false;
        self.connect();
    }

    /// Transmit now when connected, otherwise queue for the next connection
    pub fn send(&mut self, message: ClientMessage) {
        if self.state == ConnectionState::Connected {
            self.transmit(message);
            return;
        }
        debug!("Not connected, queueing {}", message.kind());
        if let Err(e) = self.queue.append(message) {
            warn!("Failed to queue outbound message: {:#}", e);
        }
    }

    /// Put back a message the driver could not write.
    /// Heartbeats and `hello` are regenerated on the next open and are not kept.
    pub fn requeue(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::Ping { .. } | ClientMessage::Pong { .. } | ClientMessage::Hello { .. } => {
                debug!("Dropping unsent {}", message.kind());
            }
            other => {
                if let Err(e) = self.queue.append(other) {
                    warn!("Failed to requeue outbound message: {:#}", e);
                }
            }
        }
    }

    /// Tear down: cancel every timer and close any socket
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.reconnect_at = None;
        self.clear_liveness();
        if self.state != ConnectionState::Disconnected {
            self.outputs.push_back(Output::Close(NORMAL_CLOSURE));
        }
        self.set_state(ConnectionState::Disconnected);
        info!("Primary channel shut down");
    }

    pub fn handle_input(&mut self, now: Instant, input: Input) {
        if self.shut_down {
            debug!("Ignoring {:?} after shutdown", input);
            return;
        }
        match input {
            Input::Opened => self.on_opened(now),
            Input::Frame(text) => self.on_frame(now, &text),
            Input::Closed { code, reason } => self.on_closed(now, code, &reason),
            Input::Error(e) => self.on_error(now, &e),
            Input::Timeout => self.on_timeout(now),
        }
    }

    pub fn poll_output(&mut self) -> Output {
        self.outputs
            .pop_front()
            .unwrap_or_else(|| Output::Timeout(self.next_deadline()))
    }

    fn next_deadline(&self) -> Option<Instant> {
        let stale_at = self.last_inbound.map(|t| t + self.config.stale_after());
        [self.reconnect_at, self.next_heartbeat, stale_at]
            .into_iter()
            .flatten()
            .min()
    }

    fn on_opened(&mut self, now: Instant) {
        if self.state != ConnectionState::Connecting {
            warn!("Unexpected open while {:?}", self.state);
            return;
        }
        self.set_state(ConnectionState::Connected);
        self.policy.reset();
        self.exhausted_notified = false;
        self.last_inbound = Some(now);
        self.next_heartbeat = Some(now + self.config.heartbeat_interval);
        info!("Connected to {}", self.config.url);

        self.transmit(ClientMessage::Hello {
            player_id: self.identity.player_id.clone(),
            is_admin: self.identity.is_admin,
            device_info: DeviceInfo::current(),
        });
        self.flush_pending();
    }

    fn on_frame(&mut self, now: Instant, text: &str) {
        self.last_inbound = Some(now);

        let message = match ServerMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed frame: {}", e);
                return;
            }
        };

        match &message {
            ServerMessage::Ping { .. } => {
                self.transmit(ClientMessage::pong());
                return;
            }
            ServerMessage::Pong { .. } => {
                debug!("Heartbeat acknowledged");
                return;
            }
            ServerMessage::Welcome { room_id, message } => {
                if let Some(text) = message {
                    info!("Server: {}", text);
                }
                if let Some(room_id) = room_id.clone() {
                    self.remember_room(room_id);
                }
                self.flush_pending();
            }
            ServerMessage::Error { message } => {
                let text = message.clone().unwrap_or_else(|| "Server error".to_string());
                self.notify(Notification::error(text));
            }
            _ => {}
        }

        let event = match message.into_signal() {
            Ok(envelope) => PrimaryEvent::Signal(envelope),
            Err(message) => PrimaryEvent::Message(message),
        };
        self.outputs.push_back(Output::Event(event));
    }

    fn on_closed(&mut self, now: Instant, code: u16, reason: &str) {
        self.clear_liveness();
        self.set_state(ConnectionState::Disconnected);
        if code == NORMAL_CLOSURE {
            info!("Connection closed normally");
            return;
        }
        warn!("Connection closed (code {}): {}", code, reason);
        self.schedule_reconnect(now);
    }

    fn on_error(&mut self, now: Instant, error: &str) {
        warn!("Transport error: {}", error);
        self.clear_liveness();
        self.set_state(ConnectionState::Disconnected);
        self.schedule_reconnect(now);
    }

    fn on_timeout(&mut self, now: Instant) {
        if let Some(at) = self.reconnect_at {
            if now >= at {
                self.reconnect_at = None;
                info!(
                    "Reconnect attempt {}/{}",
                    self.policy.attempts(),
                    self.policy.max_attempts()
                );
                self.connect();
            }
        }

        if self.state != ConnectionState::Connected {
            return;
        }

        if let Some(last) = self.last_inbound {
            if now >= last + self.config.stale_after() {
                warn!(
                    "No inbound traffic for {:?}, forcing reconnect",
                    now.duration_since(last)
                );
                self.force_reconnect();
                return;
            }
        }

        if let Some(at) = self.next_heartbeat {
            if now >= at {
                self.transmit(ClientMessage::ping());
                self.next_heartbeat = Some(now + self.config.heartbeat_interval);
            }
        }
    }

    /// Watchdog path: close the silent socket and open a fresh one right away.
    /// Does not consume the reconnect budget.
    fn force_reconnect(&mut self) {
        self.reconnect_at = None;
        self.clear_liveness();
        self.outputs.push_back(Output::Close(NORMAL_CLOSURE));
        self.set_state(ConnectionState::Disconnected);
        self.connect();
    }

    fn schedule_reconnect(&mut self, now: Instant) {
        if self.reconnect_at.is_some() {
            debug!("Reconnect already scheduled");
            return;
        }
        match self.policy.next_delay() {
            Some(delay) => {
                info!(
                    "Reconnecting in {}ms (attempt {}/{})",
                    delay.as_millis(),
                    self.policy.attempts(),
                    self.policy.max_attempts()
                );
                self.reconnect_at = Some(now + delay);
            }
            None => {
                if !self.exhausted_notified {
                    self.exhausted_notified = true;
                    error!(
                        "Giving up after {} reconnect attempts",
                        self.policy.max_attempts()
                    );
                    self.notify(Notification::error(EXHAUSTED_MESSAGE));
                }
            }
        }
    }

    fn flush_pending(&mut self) {
        match self.queue.flush() {
            Ok(pending) => {
                for entry in pending {
                    self.transmit(entry.message);
                }
            }
            Err(e) => warn!("Failed to flush pending messages: {:#}", e),
        }
    }

    fn remember_room(&mut self, room_id: String) {
        if let Err(e) = save_room_id(self.storage.as_mut(), &room_id) {
            warn!("Failed to persist room id: {:#}", e);
        }
        debug!("Room id {}", room_id);
        self.room_id = Some(room_id);
    }

    fn transmit(&mut self, message: ClientMessage) {
        self.outputs.push_back(Output::Transmit(message));
    }

    fn notify(&mut self, notification: Notification) {
        self.outputs
            .push_back(Output::Event(PrimaryEvent::Notification(notification)));
    }

    fn clear_liveness(&mut self) {
        self.next_heartbeat = None;
        self.last_inbound = None;
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("Primary channel {:?} -> {:?}", self.state, state);
            self.state = state;
            self.outputs
                .push_back(Output::Event(PrimaryEvent::StateChanged(state)));
        }
    }
}
