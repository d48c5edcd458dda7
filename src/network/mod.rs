// Connection layer for bingo-link
// Primary channel (WebSocket to the game backend) and optional peer data channel (WebRTC)

pub mod backoff;
pub mod client;
pub mod dispatch;
pub mod peer;
pub mod primary;
pub mod protocol;
pub mod runtime;
pub mod webrtc_runtime;

pub use client::{
    Notification, PeerClient, PeerCommand, PeerEvent, PrimaryClient, PrimaryCommand,
    PrimaryEvent, PrimarySender,
};
pub use dispatch::{Dispatcher, Tagged};
pub use peer::{CaptureDevice, MediaSource, PeerConfig, PeerLink, PeerLinkState};
pub use primary::{ConnectionState, Identity, PrimaryChannel, PrimaryConfig};
pub use protocol::{ClientMessage, PeerMessage, PeerRole, ServerMessage, SignalEnvelope};

use std::io;
use std::sync::mpsc;
use std::sync::{atomic::AtomicBool, Arc};

/// Start the primary channel thread and connect.
/// Returns the handle the UI loop talks to.
pub fn start_primary(channel: PrimaryChannel) -> io::Result<PrimaryClient> {
    let (event_tx, event_rx) = mpsc::channel();
    let (cmd_tx, cmd_rx) = tokio::sync::mpsc::unbounded_channel();
    let connected = Arc::new(AtomicBool::new(false));

    runtime::spawn_primary_thread(channel, event_tx, cmd_rx, connected.clone())?;

    let client = PrimaryClient::new(cmd_tx, event_rx, connected);
    client.connect()?;
    Ok(client)
}

/// Start the peer link thread. Its signaling is relayed through `signals`.
pub fn start_peer(
    link: PeerLink,
    stun_server: Option<String>,
    signals: PrimarySender,
) -> io::Result<PeerClient> {
    let (event_tx, event_rx) = mpsc::channel();
    let (cmd_tx, cmd_rx) = mpsc::channel();
    let open = Arc::new(AtomicBool::new(false));

    webrtc_runtime::spawn_peer_thread(link, stun_server, signals, event_tx, cmd_rx, open.clone())?;

    Ok(PeerClient::new(cmd_tx, event_rx, open))
}
