// Peer data channel manager
// Wraps a str0m `Rtc` (Sans-I/O WebRTC) with a fixed role, relays its signaling
// through the primary channel and exposes the same poll-driven interface.
// Best effort only: nothing is queued while the channel is not open.

use anyhow::{anyhow, Context, Result};
use std::collections::VecDeque;
use std::fs::File;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use str0m::change::{SdpAnswer, SdpOffer, SdpPendingOffer};
use str0m::channel::{ChannelConfig, ChannelId, Reliability};
use str0m::net::{DatagramRecv, Protocol, Receive, Transmit};
use str0m::{Candidate, Event, IceConnectionState, Rtc};

use super::client::{Notification, PeerEvent};
use super::protocol::{
    timestamp_ms, ClientMessage, IceCandidateInit, PeerMessage, PeerRole, SdpKind,
    SessionDescription, Signal, SignalEnvelope,
};
use crate::config::RtcConfig;

// Wake-up interval while there is no negotiated session for str0m to drive
const IDLE_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerLinkState {
    Idle,
    SignalingInProgress,
    Open,
    /// Terminal; a new link needs a new `PeerLink`
    Closed,
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub channel_label: String,
    pub max_retransmits: u16,
}

impl PeerConfig {
    pub fn from_rtc(config: &RtcConfig) -> Self {
        Self {
            channel_label: config.channel_label.clone(),
            max_retransmits: config.max_retransmits,
        }
    }
}

/// Local audio/video attached to a call
pub trait MediaSource: Send {
    fn acquire(&mut self) -> Result<()>;
    fn release(&mut self);
}

/// Holds a capture device node open for the length of the call
pub struct CaptureDevice {
    path: PathBuf,
    handle: Option<File>,
}

impl CaptureDevice {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            handle: None,
        }
    }
}

impl MediaSource for CaptureDevice {
    fn acquire(&mut self) -> Result<()> {
        let file = File::open(&self.path)
            .with_context(|| format!("opening capture device {}", self.path.display()))?;
        self.handle = Some(file);
        Ok(())
    }

    fn release(&mut self) {
        if self.handle.take().is_some() {
            debug!("Released capture device {}", self.path.display());
        }
    }
}

/// Work for the driver
#[derive(Debug)]
pub enum Output {
    /// Datagram to put on the UDP socket
    Transmit(Transmit),

    /// Signaling message to relay over the primary channel
    Signal(ClientMessage),

    Event(PeerEvent),

    /// Call `handle_timeout` at this instant
    Timeout(Instant),

    /// The link is closed and has nothing further to do
    Closed,
}

pub struct PeerLink {
    role: PeerRole,
    session_id: Option<String>,
    config: PeerConfig,
    rtc: Rtc,
    state: PeerLinkState,
    channel: Option<ChannelId>,
    pending_offer: Option<SdpPendingOffer>,
    local_description: Option<SessionDescription>,
    media: Option<Box<dyn MediaSource>>,
    outputs: VecDeque<Output>,
    /// Latest time handed in by the driver
    last_now: Instant,
}

impl PeerLink {
    /// Fix the role and session for this link.
    /// The initiator's data channel is negotiated as part of `start_link`;
    /// the responder accepts whichever channel the remote opens.
    pub fn new(
        role: PeerRole,
        session_id: Option<String>,
        config: PeerConfig,
        media: Option<Box<dyn MediaSource>>,
    ) -> Self {
        let rtc = Rtc::builder()
            .set_rtp_mode(false) // data channel only
            .build();
        info!("Peer link created as {:?}", role);

        Self {
            role,
            session_id,
            config,
            rtc,
            state: PeerLinkState::Idle,
            channel: None,
            pending_offer: None,
            local_description: None,
            media,
            outputs: VecDeque::new(),
            last_now: Instant::now(),
        }
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn state(&self) -> PeerLinkState {
        self.state
    }

    /// The offer or answer this side produced, if any
    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    /// Register a local ICE candidate. Candidates known before the offer/answer are
    /// carried in the SDP; later ones are relayed as `ice_candidate`.
    pub fn add_local_candidate(&mut self, candidate: Candidate) {
        if self.state == PeerLinkState::Closed {
            return;
        }
        let relay = self.local_description.is_some();
        let line = candidate.to_sdp_string();
        if self.rtc.add_local_candidate(candidate).is_none() {
            warn!("Local candidate rejected: {}", line);
            return;
        }
        debug!("Added local candidate {}", line);
        if relay {
            self.signal(Signal::Candidate(IceCandidateInit {
                candidate: line,
                sdp_mid: None,
                sdp_m_line_index: Some(0),
            }));
        }
    }

    /// Initiator only: negotiate the data channel and relay the offer
    pub fn start_link(&mut self) {
        if self.role != PeerRole::Initiator {
            warn!("Ignoring start_link: only the initiator originates an offer");
            return;
        }
        if self.state != PeerLinkState::Idle {
            warn!("Ignoring start_link while {:?}", self.state);
            return;
        }

        if let Some(media) = self.media.as_mut() {
            if let Err(e) = media.acquire() {
                warn!("Media unavailable: {:#}", e);
                self.notify(Notification::error(format!(
                    "Could not access camera or microphone: {}",
                    e
                )));
            }
        }

        if let Err(e) = self.create_offer() {
            error!("Failed to create offer: {:#}", e);
            self.notify(Notification::error(format!("Failed to start call: {}", e)));
        }
    }

    fn create_offer(&mut self) -> Result<()> {
        let mut change = self.rtc.sdp_api();
        change.add_channel_with_config(ChannelConfig {
            label: self.config.channel_label.clone(),
            ordered: true,
            reliability: Reliability::MaxRetransmits {
                retransmits: self.config.max_retransmits,
            },
            negotiated: None,
            protocol: String::new(),
        });
        let (offer, pending) = change
            .apply()
            .ok_or_else(|| anyhow!("no changes to negotiate"))?;

        let description = SessionDescription {
            kind: SdpKind::Offer,
            sdp: offer.to_sdp_string(),
        };
        self.pending_offer = Some(pending);
        self.local_description = Some(description.clone());
        self.set_state(PeerLinkState::SignalingInProgress);
        info!("Offer created, relaying to peer");
        self.signal(Signal::Offer(description));
        Ok(())
    }

    /// Signaling relayed from the primary channel
    pub fn handle_signal(&mut self, envelope: SignalEnvelope) {
        if self.state == PeerLinkState::Closed {
            debug!("Link closed, ignoring signaling");
            return;
        }
        if envelope.role == Some(self.role) {
            debug!("Ignoring our own relayed signaling");
            return;
        }

        let result = match envelope.signal {
            Signal::Offer(offer) => self.accept_offer(offer),
            Signal::Answer(answer) => self.accept_answer(answer),
            Signal::Candidate(candidate) => self.add_remote_candidate(candidate),
        };
        if let Err(e) = result {
            warn!("Peer signaling failed: {:#}", e);
        }
    }

    fn accept_offer(&mut self, offer: SessionDescription) -> Result<()> {
        if self.role != PeerRole::Responder {
            warn!("Ignoring offer: the initiator never answers");
            return Ok(());
        }
        if self.state != PeerLinkState::Idle {
            warn!("Ignoring offer while {:?}", self.state);
            return Ok(());
        }

        let offer = SdpOffer::from_sdp_string(&offer.sdp).context("parsing remote offer")?;
        let accepted = self.rtc.sdp_api().accept_offer(offer);
        let answer = match accepted {
            Ok(answer) => answer,
            Err(e) => {
                self.notify(Notification::error("Failed to answer call"));
                return Err(e).context("accepting remote offer");
            }
        };

        let description = SessionDescription {
            kind: SdpKind::Answer,
            sdp: answer.to_sdp_string(),
        };
        self.local_description = Some(description.clone());
        self.set_state(PeerLinkState::SignalingInProgress);
        info!("Offer accepted, relaying answer");
        self.signal(Signal::Answer(description));
        Ok(())
    }

    fn accept_answer(&mut self, answer: SessionDescription) -> Result<()> {
        if self.role != PeerRole::Initiator {
            warn!("Ignoring answer: the responder never sends an offer");
            return Ok(());
        }
        let Some(pending) = self.pending_offer.take() else {
            warn!("Ignoring answer with no offer outstanding");
            return Ok(());
        };

        let answer = SdpAnswer::from_sdp_string(&answer.sdp).context("parsing remote answer")?;
        self.rtc
            .sdp_api()
            .accept_answer(pending, answer)
            .context("applying remote answer")?;
        info!("Answer applied");
        Ok(())
    }

    fn add_remote_candidate(&mut self, candidate: IceCandidateInit) -> Result<()> {
        if candidate.candidate.is_empty() {
            // End-of-candidates marker
            return Ok(());
        }
        let parsed = Candidate::from_sdp_string(&candidate.candidate)
            .map_err(|e| anyhow!("parsing remote candidate: {}", e))?;
        self.rtc.add_remote_candidate(parsed);
        debug!("Added remote candidate {}", candidate.candidate);
        Ok(())
    }

    /// Write on the data channel if it is open; otherwise log and drop.
    /// Returns whether the message was handed to the channel.
    pub fn send(&mut self, message: &PeerMessage) -> bool {
        let cid = match (self.state, self.channel) {
            (PeerLinkState::Open, Some(cid)) => cid,
            _ => {
                warn!("Peer channel not open, dropping {}", message.kind());
                return false;
            }
        };
        let json = match message.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to encode {}: {}", message.kind(), e);
                return false;
            }
        };
        let Some(mut channel) = self.rtc.channel(cid) else {
            warn!("Peer channel vanished, dropping {}", message.kind());
            return false;
        };
        match channel.write(false, json.as_bytes()) {
            Ok(_) => true,
            Err(e) => {
                warn!("Failed to write {}: {}", message.kind(), e);
                false
            }
        }
    }

    pub fn send_number_call(&mut self, number: u8) -> bool {
        if self.role != PeerRole::Initiator {
            warn!("Ignoring number call: only the initiator calls numbers");
            return false;
        }
        self.send(&PeerMessage::NumberCalled {
            number,
            timestamp: timestamp_ms(),
        })
    }

    pub fn send_winner(&mut self, winner: String, amount: f64, pattern: String) -> bool {
        if self.role != PeerRole::Initiator {
            warn!("Ignoring winner announcement: only the initiator announces");
            return false;
        }
        self.send(&PeerMessage::Winner {
            winner,
            amount,
            pattern,
            timestamp: timestamp_ms(),
        })
    }

    pub fn send_chat(&mut self, message: String, sender: String) -> bool {
        self.send(&PeerMessage::Chat {
            message,
            sender,
            timestamp: timestamp_ms(),
        })
    }

    /// Close the connection and release media. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if self.state == PeerLinkState::Closed {
            debug!("Peer link already closed");
            return;
        }
        self.finish();
        self.notify(Notification::info("Call ended"));
    }

    fn finish(&mut self) {
        if let Some(mut media) = self.media.take() {
            media.release();
        }
        self.rtc.disconnect();
        self.channel = None;
        self.pending_offer = None;
        self.set_state(PeerLinkState::Closed);
        info!("Peer link closed");
    }

    /// Feed a datagram read from the UDP socket.
    /// Datagrams str0m cannot use (stray STUN replies, garbage) are logged and dropped.
    pub fn handle_receive(
        &mut self,
        now: Instant,
        source: SocketAddr,
        destination: SocketAddr,
        contents: &[u8],
    ) {
        self.last_now = self.last_now.max(now);
        if self.state == PeerLinkState::Closed {
            return;
        }
        let contents = match DatagramRecv::try_from(contents) {
            Ok(contents) => contents,
            Err(e) => {
                debug!("Dropping {} byte datagram from {}: {}", contents.len(), source, e);
                return;
            }
        };
        let receive = Receive {
            proto: Protocol::Udp,
            source,
            destination,
            contents,
        };
        if let Err(e) = self.rtc.handle_input(str0m::Input::Receive(now, receive)) {
            debug!("Dropping datagram from {}: {}", source, e);
        }
    }

    pub fn handle_timeout(&mut self, now: Instant) -> Result<()> {
        self.last_now = self.last_now.max(now);
        if self.state == PeerLinkState::Closed {
            return Ok(());
        }
        self.rtc.handle_input(str0m::Input::Timeout(now))?;
        Ok(())
    }

    pub fn poll_output(&mut self) -> Result<Output> {
        loop {
            if let Some(output) = self.outputs.pop_front() {
                return Ok(output);
            }
            if self.state == PeerLinkState::Closed {
                return Ok(Output::Closed);
            }
            // str0m's DTLS is only set up once a remote description is applied;
            // polling it before that is not allowed
            if self.awaiting_remote_description() {
                return Ok(Output::Timeout(self.last_now + IDLE_POLL));
            }
            match self.rtc.poll_output()? {
                str0m::Output::Transmit(transmit) => return Ok(Output::Transmit(transmit)),
                str0m::Output::Timeout(deadline) => return Ok(Output::Timeout(deadline)),
                str0m::Output::Event(event) => self.handle_rtc_event(event),
            }
        }
    }

    fn awaiting_remote_description(&self) -> bool {
        self.state == PeerLinkState::Idle || self.pending_offer.is_some()
    }

    fn handle_rtc_event(&mut self, event: Event) {
        match event {
            Event::Connected => {
                info!("Peer connection established (ICE + DTLS)");
            }
            Event::IceConnectionStateChange(state) => {
                debug!("ICE state: {:?}", state);
                if matches!(state, IceConnectionState::Disconnected) {
                    warn!("Peer connection lost");
                    self.notify(Notification::error("Peer connection lost"));
                    self.finish();
                }
            }
            Event::ChannelOpen(cid, label) => {
                info!("Data channel open: {}", label);
                self.channel = Some(cid);
                self.set_state(PeerLinkState::Open);
            }
            Event::ChannelData(data) => {
                let text = match std::str::from_utf8(&data.data) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Dropping non-UTF-8 peer message: {}", e);
                        return;
                    }
                };
                match PeerMessage::parse(text) {
                    Ok(message) => self
                        .outputs
                        .push_back(Output::Event(PeerEvent::Message(message))),
                    Err(e) => warn!("Dropping malformed peer message: {}", e),
                }
            }
            Event::ChannelClose(cid) => {
                if self.channel == Some(cid) {
                    info!("Data channel closed by peer");
                    self.finish();
                }
            }
            _ => {}
        }
    }

    fn signal(&mut self, signal: Signal) {
        let message = SignalEnvelope {
            signal,
            role: Some(self.role),
            room_id: self.session_id.clone(),
        }
        .into_client_message();
        self.outputs.push_back(Output::Signal(message));
    }

    fn notify(&mut self, notification: Notification) {
        self.outputs
            .push_back(Output::Event(PeerEvent::Notification(notification)));
    }

    fn set_state(&mut self, state: PeerLinkState) {
        if self.state != state {
            debug!("Peer link {:?} -> {:?}", self.state, state);
            self.state = state;
            self.outputs
                .push_back(Output::Event(PeerEvent::StateChanged(state)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::protocol::ServerMessage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn config() -> PeerConfig {
        PeerConfig::from_rtc(&RtcConfig::default())
    }

    fn link(role: PeerRole) -> PeerLink {
        PeerLink::new(role, Some("room-1".to_string()), config(), None)
    }

    /// Outputs up to the first timer, without sockets
    fn drain(link: &mut PeerLink) -> Vec<Output> {
        let mut outputs = Vec::new();
        loop {
            match link.poll_output().unwrap() {
                Output::Timeout(_) | Output::Closed => return outputs,
                other => outputs.push(other),
            }
        }
    }

    fn signals(outputs: Vec<Output>) -> Vec<ClientMessage> {
        outputs
            .into_iter()
            .filter_map(|o| match o {
                Output::Signal(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    fn notifications(outputs: &[Output]) -> Vec<Notification> {
        outputs
            .iter()
            .filter_map(|o| match o {
                Output::Event(PeerEvent::Notification(n)) => Some(n.clone()),
                _ => None,
            })
            .collect()
    }

    /// What the other side receives once the backend relays a signal
    fn relayed(message: &ClientMessage) -> SignalEnvelope {
        let json = message.to_json().unwrap();
        ServerMessage::parse(&json).unwrap().into_signal().unwrap()
    }

    /// Hand everything `from` produces to `to`, as the socket and the backend would
    fn pump(from: &mut PeerLink, to: &mut PeerLink, now: Instant) -> Vec<PeerEvent> {
        let mut events = Vec::new();
        loop {
            match from.poll_output().unwrap() {
                Output::Transmit(t) => to.handle_receive(now, t.source, t.destination, &t.contents),
                Output::Signal(m) => to.handle_signal(relayed(&m)),
                Output::Event(event) => events.push(event),
                Output::Timeout(_) | Output::Closed => return events,
            }
        }
    }

    /// Two links wired back to back on simulated time
    struct LinkedPair {
        initiator: PeerLink,
        responder: PeerLink,
        now: Instant,
        initiator_events: Vec<PeerEvent>,
        responder_events: Vec<PeerEvent>,
    }

    impl LinkedPair {
        fn new() -> Self {
            let mut initiator = link(PeerRole::Initiator);
            let mut responder = link(PeerRole::Responder);
            let a: SocketAddr = "10.0.0.1:1000".parse().unwrap();
            let b: SocketAddr = "10.0.0.2:2000".parse().unwrap();
            initiator.add_local_candidate(Candidate::host(a, "udp").unwrap());
            responder.add_local_candidate(Candidate::host(b, "udp").unwrap());
            Self {
                initiator,
                responder,
                now: Instant::now(),
                initiator_events: Vec::new(),
                responder_events: Vec::new(),
            }
        }

        fn step(&mut self, by: Duration) {
            let events = pump(&mut self.initiator, &mut self.responder, self.now);
            self.initiator_events.extend(events);
            let events = pump(&mut self.responder, &mut self.initiator, self.now);
            self.responder_events.extend(events);

            self.now += by;
            self.initiator.handle_timeout(self.now).unwrap();
            self.responder.handle_timeout(self.now).unwrap();
        }

        fn run_until(&mut self, by: Duration, max_steps: usize, done: impl Fn(&Self) -> bool) -> bool {
            for _ in 0..max_steps {
                if done(self) {
                    return true;
                }
                self.step(by);
            }
            done(self)
        }

        fn open(mut self) -> Self {
            self.initiator.start_link();
            let opened = self.run_until(Duration::from_millis(10), 2000, |p| {
                p.initiator.state() == PeerLinkState::Open
                    && p.responder.state() == PeerLinkState::Open
            });
            assert!(
                opened,
                "link did not open: initiator {:?}, responder {:?}",
                self.initiator.state(),
                self.responder.state()
            );
            self
        }
    }

    fn messages(events: &[PeerEvent]) -> Vec<PeerMessage> {
        events
            .iter()
            .filter_map(|e| match e {
                PeerEvent::Message(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    fn states(events: &[PeerEvent]) -> Vec<PeerLinkState> {
        events
            .iter()
            .filter_map(|e| match e {
                PeerEvent::StateChanged(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    struct CountingMedia {
        acquired: Arc<AtomicUsize>,
        released: Arc<AtomicUsize>,
        fail: bool,
    }

    impl MediaSource for CountingMedia {
        fn acquire(&mut self) -> Result<()> {
            if self.fail {
                return Err(anyhow!("permission denied"));
            }
            self.acquired.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn release(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_responder_never_originates_offer() {
        let mut responder = link(PeerRole::Responder);
        drain(&mut responder);

        responder.start_link();
        let outputs = drain(&mut responder);
        assert!(signals(outputs).is_empty());
        assert_eq!(responder.state(), PeerLinkState::Idle);
        assert!(responder.local_description().is_none());
    }

    #[test]
    fn test_initiator_relays_offer() {
        let mut initiator = link(PeerRole::Initiator);
        initiator.start_link();
        let outputs = drain(&mut initiator);
        assert!(outputs.iter().any(|o| matches!(
            o,
            Output::Event(PeerEvent::StateChanged(PeerLinkState::SignalingInProgress))
        )));

        let sent = signals(outputs);
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            ClientMessage::Offer {
                offer,
                role,
                room_id,
            } => {
                assert_eq!(offer.kind, SdpKind::Offer);
                assert!(offer.sdp.contains("m=application"));
                assert_eq!(*role, PeerRole::Initiator);
                assert_eq!(room_id.as_deref(), Some("room-1"));
            }
            other => panic!("expected offer, got {:?}", other),
        }

        // A second start is ignored
        initiator.start_link();
        assert!(signals(drain(&mut initiator)).is_empty());
    }

    #[test]
    fn test_offer_answer_exchange() {
        let mut initiator = link(PeerRole::Initiator);
        let mut responder = link(PeerRole::Responder);

        initiator.start_link();
        let offer = signals(drain(&mut initiator)).remove(0);

        responder.handle_signal(relayed(&offer));
        let outputs = drain(&mut responder);
        assert_eq!(responder.state(), PeerLinkState::SignalingInProgress);
        let answer = signals(outputs).remove(0);
        assert_eq!(answer.kind(), "answer");

        initiator.handle_signal(relayed(&answer));
        assert!(signals(drain(&mut initiator)).is_empty());
        assert_eq!(initiator.state(), PeerLinkState::SignalingInProgress);
    }

    #[test]
    fn test_role_preconditions_on_relayed_signaling() {
        let mut initiator = link(PeerRole::Initiator);
        let mut other = link(PeerRole::Initiator);
        other.start_link();
        let offer = signals(drain(&mut other)).remove(0);

        // Pretend the backend relayed it as coming from a responder
        let mut envelope = relayed(&offer);
        envelope.role = Some(PeerRole::Responder);
        initiator.handle_signal(envelope);
        assert!(signals(drain(&mut initiator)).is_empty());
        assert_eq!(initiator.state(), PeerLinkState::Idle);

        // A responder given an answer out of nowhere ignores it
        let mut responder = link(PeerRole::Responder);
        responder.handle_signal(SignalEnvelope {
            signal: Signal::Answer(SessionDescription {
                kind: SdpKind::Answer,
                sdp: "v=0".to_string(),
            }),
            role: Some(PeerRole::Initiator),
            room_id: None,
        });
        assert_eq!(responder.state(), PeerLinkState::Idle);
    }

    #[test]
    fn test_own_echo_is_ignored() {
        let mut initiator = link(PeerRole::Initiator);
        initiator.start_link();
        let offer = signals(drain(&mut initiator)).remove(0);

        let mut responder = link(PeerRole::Responder);
        let mut echo = relayed(&offer);
        echo.role = Some(PeerRole::Responder);
        responder.handle_signal(echo);
        assert_eq!(responder.state(), PeerLinkState::Idle);
    }

    #[test]
    fn test_garbage_signaling_is_absorbed() {
        let mut responder = link(PeerRole::Responder);
        responder.handle_signal(SignalEnvelope {
            signal: Signal::Candidate(IceCandidateInit {
                candidate: "not a candidate".to_string(),
                sdp_mid: None,
                sdp_m_line_index: None,
            }),
            role: Some(PeerRole::Initiator),
            room_id: None,
        });
        responder.handle_signal(SignalEnvelope {
            signal: Signal::Offer(SessionDescription {
                kind: SdpKind::Offer,
                sdp: "garbage".to_string(),
            }),
            role: Some(PeerRole::Initiator),
            room_id: None,
        });
        assert_eq!(responder.state(), PeerLinkState::Idle);
    }

    #[test]
    fn test_send_before_open_is_dropped() {
        let mut initiator = link(PeerRole::Initiator);
        initiator.start_link();
        drain(&mut initiator);

        assert!(!initiator.send_number_call(7));
        assert!(!initiator.send_chat("selam".to_string(), "admin".to_string()));
        let outputs = drain(&mut initiator);
        assert!(!outputs.iter().any(|o| matches!(o, Output::Transmit(_))));
    }

    #[test]
    fn test_responder_cannot_announce() {
        let mut responder = link(PeerRole::Responder);
        assert!(!responder.send_number_call(12));
        assert!(!responder.send_winner("Abebe".to_string(), 100.0, "row".to_string()));
    }

    #[test]
    fn test_stop_is_idempotent_and_releases_once() {
        let acquired = Arc::new(AtomicUsize::new(0));
        let released = Arc::new(AtomicUsize::new(0));
        let media = CountingMedia {
            acquired: acquired.clone(),
            released: released.clone(),
            fail: false,
        };
        let mut initiator = PeerLink::new(
            PeerRole::Initiator,
            None,
            config(),
            Some(Box::new(media)),
        );
        initiator.start_link();
        drain(&mut initiator);
        assert_eq!(acquired.load(Ordering::SeqCst), 1);

        initiator.stop();
        let first = drain(&mut initiator);
        initiator.stop();
        let second = drain(&mut initiator);

        assert_eq!(initiator.state(), PeerLinkState::Closed);
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(notifications(&first), vec![Notification::info("Call ended")]);
        assert!(second.is_empty());
        assert!(matches!(initiator.poll_output().unwrap(), Output::Closed));

        // Nothing revives a closed link
        initiator.start_link();
        assert!(signals(drain(&mut initiator)).is_empty());
        assert_eq!(initiator.state(), PeerLinkState::Closed);
    }

    #[test]
    fn test_media_failure_still_offers() {
        let media = CountingMedia {
            acquired: Arc::new(AtomicUsize::new(0)),
            released: Arc::new(AtomicUsize::new(0)),
            fail: true,
        };
        let mut initiator = PeerLink::new(
            PeerRole::Initiator,
            None,
            config(),
            Some(Box::new(media)),
        );
        initiator.start_link();
        let outputs = drain(&mut initiator);

        let notes = notifications(&outputs);
        assert_eq!(notes.len(), 1);
        assert!(notes[0].is_error);
        assert!(notes[0].message.contains("permission denied"));
        assert_eq!(signals(outputs).len(), 1);
        assert_eq!(initiator.state(), PeerLinkState::SignalingInProgress);
    }

    #[test]
    fn test_late_local_candidates_are_relayed() {
        let mut initiator = link(PeerRole::Initiator);
        let host: SocketAddr = "192.168.1.20:50000".parse().unwrap();
        initiator.add_local_candidate(Candidate::host(host, "udp").unwrap());
        assert!(signals(drain(&mut initiator)).is_empty());

        initiator.start_link();
        let offer = signals(drain(&mut initiator)).remove(0);
        match offer {
            ClientMessage::Offer { offer, .. } => assert!(offer.sdp.contains("192.168.1.20")),
            other => panic!("expected offer, got {:?}", other),
        }

        let late: SocketAddr = "192.168.1.20:50001".parse().unwrap();
        initiator.add_local_candidate(Candidate::host(late, "udp").unwrap());
        let sent = signals(drain(&mut initiator));
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind(), "ice_candidate");
    }

    #[test]
    fn test_missing_capture_device_fails_acquire() {
        let mut device = CaptureDevice::new("/nonexistent/video-device");
        assert!(device.acquire().is_err());
        device.release();
    }

    #[test]
    fn test_fresh_link_polls_without_session() {
        for role in [PeerRole::Initiator, PeerRole::Responder] {
            let mut fresh = link(role);
            assert!(matches!(fresh.poll_output().unwrap(), Output::Timeout(_)));

            let later = Instant::now() + Duration::from_millis(50);
            fresh.handle_timeout(later).unwrap();
            match fresh.poll_output().unwrap() {
                Output::Timeout(at) => assert!(at > later),
                other => panic!("expected timeout, got {:?}", other),
            }
        }

        // Still waiting on the answer
        let mut initiator = link(PeerRole::Initiator);
        initiator.start_link();
        drain(&mut initiator);
        assert!(matches!(initiator.poll_output().unwrap(), Output::Timeout(_)));
    }

    #[test]
    fn test_unusable_datagrams_are_dropped() {
        let a: SocketAddr = "10.0.0.9:4000".parse().unwrap();
        let b: SocketAddr = "10.0.0.1:1000".parse().unwrap();
        let garbage = [0xde, 0xad, 0xbe, 0xef];

        let mut responder = link(PeerRole::Responder);
        responder.handle_receive(Instant::now(), a, b, &garbage);
        responder.handle_receive(Instant::now(), a, b, &[]);
        assert_eq!(responder.state(), PeerLinkState::Idle);
        assert!(matches!(responder.poll_output().unwrap(), Output::Timeout(_)));

        let mut pair = LinkedPair::new().open();
        let now = pair.now;
        pair.initiator.handle_receive(now, a, b, &garbage);
        assert_eq!(pair.initiator.state(), PeerLinkState::Open);
        assert!(pair.initiator.send_number_call(5));
    }

    #[test]
    fn test_linked_peers_open_and_exchange_messages() {
        let mut pair = LinkedPair::new().open();

        assert_eq!(
            states(&pair.initiator_events),
            vec![PeerLinkState::SignalingInProgress, PeerLinkState::Open]
        );
        assert_eq!(
            states(&pair.responder_events),
            vec![PeerLinkState::SignalingInProgress, PeerLinkState::Open]
        );

        assert!(pair.initiator.send_number_call(42));
        assert!(pair.responder.send_chat("hi".to_string(), "P-1".to_string()));
        let delivered = pair.run_until(Duration::from_millis(10), 500, |p| {
            !messages(&p.responder_events).is_empty() && !messages(&p.initiator_events).is_empty()
        });
        assert!(delivered);

        let at_responder = messages(&pair.responder_events);
        assert!(matches!(
            at_responder.as_slice(),
            [PeerMessage::NumberCalled { number: 42, .. }]
        ));
        match messages(&pair.initiator_events).as_slice() {
            [PeerMessage::Chat {
                message, sender, ..
            }] => {
                assert_eq!(message, "hi");
                assert_eq!(sender, "P-1");
            }
            other => panic!("expected one chat, got {:?}", other),
        }

        // Announcements stay with the initiator even once open
        assert!(!pair.responder.send_number_call(9));
    }

    #[test]
    fn test_stopping_one_side_closes_the_other() {
        let mut pair = LinkedPair::new().open();

        pair.initiator.stop();
        assert_eq!(pair.initiator.state(), PeerLinkState::Closed);
        assert!(!pair.initiator.send_chat("late".to_string(), "admin".to_string()));

        // The responder notices once the peer stops answering
        let closed = pair.run_until(Duration::from_millis(100), 1200, |p| {
            p.responder.state() == PeerLinkState::Closed
        });
        assert!(closed, "responder still {:?}", pair.responder.state());
        assert_eq!(states(&pair.responder_events).last(), Some(&PeerLinkState::Closed));
        assert!(!pair.responder.send_chat("anyone?".to_string(), "P-1".to_string()));
    }
}
