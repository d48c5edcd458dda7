// Handles the UI thread uses to talk to the connection managers
// Each manager runs on its own thread; commands go in, events come out over channels

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use tokio::sync::mpsc as async_mpsc;
use tracing::warn;

use super::dispatch::Dispatcher;
use super::peer::PeerLinkState;
use super::primary::ConnectionState;
use super::protocol::{ClientMessage, PeerMessage, ServerMessage, SignalEnvelope};

/// Something the user should be told about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub message: String,
    pub is_error: bool,
}

impl Notification {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            is_error: true,
        }
    }
}

/// Events the primary channel thread sends to the UI
#[derive(Debug, Clone)]
pub enum PrimaryEvent {
    StateChanged(ConnectionState),

    /// Inbound message for the handler table
    Message(ServerMessage),

    /// Peer-link signaling relayed by the backend
    Signal(SignalEnvelope),

    Notification(Notification),
}

/// Commands the UI sends to the primary channel thread
#[derive(Debug)]
pub enum PrimaryCommand {
    Connect,

    /// Reset the reconnect budget and connect again
    Resume,

    Send(ClientMessage),

    /// Close the socket and stop the thread
    Shutdown,
}

/// Cloneable sending half of a `PrimaryClient`
#[derive(Debug, Clone)]
pub struct PrimarySender {
    tx: async_mpsc::UnboundedSender<PrimaryCommand>,
}

impl PrimarySender {
    /// Never fails from the caller's point of view; a stopped channel is logged
    pub fn send(&self, message: ClientMessage) {
        let kind = message.kind();
        if self.tx.send(PrimaryCommand::Send(message)).is_err() {
            warn!("Primary channel stopped, dropping {}", kind);
        }
    }
}

pub struct PrimaryClient {
    /// Commands TO the primary channel thread
    tx: async_mpsc::UnboundedSender<PrimaryCommand>,

    /// Events FROM the primary channel thread
    rx: mpsc::Receiver<PrimaryEvent>,

    connected: Arc<AtomicBool>,
}

impl PrimaryClient {
    pub fn new(
        tx: async_mpsc::UnboundedSender<PrimaryCommand>,
        rx: mpsc::Receiver<PrimaryEvent>,
        connected: Arc<AtomicBool>,
    ) -> Self {
        Self { tx, rx, connected }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Send now if connected, otherwise the message is queued for the next connection
    pub fn send(&self, message: ClientMessage) {
        self.sender().send(message);
    }

    pub fn sender(&self) -> PrimarySender {
        PrimarySender {
            tx: self.tx.clone(),
        }
    }

    pub fn connect(&self) -> io::Result<()> {
        self.command(PrimaryCommand::Connect)
    }

    pub fn resume(&self) -> io::Result<()> {
        self.command(PrimaryCommand::Resume)
    }

    pub fn shutdown(&self) -> io::Result<()> {
        self.command(PrimaryCommand::Shutdown)
    }

    fn command(&self, command: PrimaryCommand) -> io::Result<()> {
        self.tx
            .send(command)
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e.to_string()))
    }

    /// Try to receive an event (non-blocking)
    pub fn try_recv_event(&self) -> Option<PrimaryEvent> {
        self.rx.try_recv().ok()
    }

    /// Run every waiting inbound message through the handler table, in arrival order.
    /// Returns the events that are not messages.
    pub fn dispatch_pending(&self, dispatcher: &mut Dispatcher<ServerMessage>) -> Vec<PrimaryEvent> {
        let mut rest = Vec::new();
        while let Some(event) = self.try_recv_event() {
            match event {
                PrimaryEvent::Message(message) => {
                    dispatcher.dispatch(&message);
                }
                other => rest.push(other),
            }
        }
        rest
    }
}

/// Events the peer link thread sends to the UI
#[derive(Debug, Clone)]
pub enum PeerEvent {
    StateChanged(PeerLinkState),
    Message(PeerMessage),
    Notification(Notification),
}

/// Commands the UI sends to the peer link thread
#[derive(Debug)]
pub enum PeerCommand {
    StartLink,
    Signal(SignalEnvelope),
    Send(PeerMessage),
    SendNumberCall(u8),
    SendWinner {
        winner: String,
        amount: f64,
        pattern: String,
    },
    SendChat {
        message: String,
        sender: String,
    },
    Stop,
}

pub struct PeerClient {
    tx: mpsc::Sender<PeerCommand>,
    rx: mpsc::Receiver<PeerEvent>,
    open: Arc<AtomicBool>,
}

impl PeerClient {
    pub fn new(
        tx: mpsc::Sender<PeerCommand>,
        rx: mpsc::Receiver<PeerEvent>,
        open: Arc<AtomicBool>,
    ) -> Self {
        Self { tx, rx, open }
    }

    /// Whether the data channel is currently open
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    pub fn start_link(&self) -> io::Result<()> {
        self.command(PeerCommand::StartLink)
    }

    /// Hand over signaling that arrived on the primary channel
    pub fn signal(&self, envelope: SignalEnvelope) -> io::Result<()> {
        self.command(PeerCommand::Signal(envelope))
    }

    pub fn send(&self, message: PeerMessage) -> io::Result<()> {
        self.command(PeerCommand::Send(message))
    }

    pub fn send_number_call(&self, number: u8) -> io::Result<()> {
        self.command(PeerCommand::SendNumberCall(number))
    }

    pub fn send_winner(&self, winner: String, amount: f64, pattern: String) -> io::Result<()> {
        self.command(PeerCommand::SendWinner {
            winner,
            amount,
            pattern,
        })
    }

    pub fn send_chat(&self, message: String, sender: String) -> io::Result<()> {
        self.command(PeerCommand::SendChat { message, sender })
    }

    pub fn stop(&self) -> io::Result<()> {
        self.command(PeerCommand::Stop)
    }

    fn command(&self, command: PeerCommand) -> io::Result<()> {
        self.tx
            .send(command)
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e.to_string()))
    }

    pub fn try_recv_event(&self) -> Option<PeerEvent> {
        self.rx.try_recv().ok()
    }

    /// Same contract as `PrimaryClient::dispatch_pending`
    pub fn dispatch_pending(&self, dispatcher: &mut Dispatcher<PeerMessage>) -> Vec<PeerEvent> {
        let mut rest = Vec::new();
        while let Some(event) = self.try_recv_event() {
            match event {
                PeerEvent::Message(message) => {
                    dispatcher.dispatch(&message);
                }
                other => rest.push(other),
            }
        }
        rest
    }
}
