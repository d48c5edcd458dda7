// bingo-link wire protocol
// JSON envelopes with a snake_case `type` tag and camelCase fields, exchanged
// with the game backend (primary channel) and between peers (data channel)

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, used for message timestamps
pub fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Role on the peer link, fixed when the link is created.
/// Serialized with the names the backend relays them under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRole {
    /// Creates the data channel and originates the offer
    #[serde(rename = "admin")]
    Initiator,
    /// Waits for the inbound channel and answers
    #[serde(rename = "player")]
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description as relayed through the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

/// ICE candidate as relayed through the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: Option<u16>,
}

/// Signaling payload carried over the primary channel
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidateInit),
}

/// A signaling payload plus the role and room it came from
#[derive(Debug, Clone, PartialEq)]
pub struct SignalEnvelope {
    pub signal: Signal,
    pub role: Option<PeerRole>,
    pub room_id: Option<String>,
}

impl SignalEnvelope {
    /// Wrap as the outbound primary-channel message that relays it
    pub fn into_client_message(self) -> ClientMessage {
        let SignalEnvelope {
            signal,
            role,
            room_id,
        } = self;
        let role = role.unwrap_or(PeerRole::Responder);
        match signal {
            Signal::Offer(offer) => ClientMessage::Offer {
                offer,
                role,
                room_id,
            },
            Signal::Answer(answer) => ClientMessage::Answer {
                answer,
                role,
                room_id,
            },
            Signal::Candidate(candidate) => ClientMessage::IceCandidate {
                candidate,
                role,
                room_id,
            },
        }
    }
}

/// Identification sent in `hello`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub os: String,
    pub arch: String,
    pub client_version: String,
    pub is_mobile: bool,
}

impl DeviceInfo {
    pub fn current() -> Self {
        let os = std::env::consts::OS;
        Self {
            os: os.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            is_mobile: matches!(os, "android" | "ios"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WinnerEntry {
    pub name: String,
    pub amount: f64,
}

/// Messages this client sends to the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Identification sent right after every successful open
    Hello {
        player_id: String,
        is_admin: bool,
        device_info: DeviceInfo,
    },

    /// Heartbeat request / response
    Ping { timestamp: u64 },
    Pong { timestamp: u64 },

    Register {
        player_id: String,
        name: String,
        phone: String,
        stake: u64,
        board_id: Option<u32>,
        game_type: Option<String>,
        payment: u64,
    },
    Payment { player_id: String, amount: u64 },
    Mark {
        player_id: String,
        number: u8,
        marked: bool,
    },
    StartGame {
        player_id: String,
        game_type: String,
    },
    Win {
        player_id: String,
        pattern: String,
        amount: f64,
    },

    // Admin panel
    GameStart {
        room_id: Option<String>,
        game_type: String,
        stake: u64,
        timestamp: u64,
    },
    NumberCalled {
        number: u8,
        room_id: Option<String>,
        timestamp: u64,
    },
    GameEnd {
        room_id: Option<String>,
        timestamp: u64,
    },
    PlayerWon {
        player_id: String,
        amount: f64,
        pattern: String,
        timestamp: u64,
    },
    AdminBroadcast {
        message: String,
        room_id: Option<String>,
        timestamp: u64,
    },
    GetStats { is_admin: bool },
    GetPlayers { room_id: Option<String> },
    JoinResponse {
        player_id: String,
        approved: bool,
        room_id: Option<String>,
    },
    WinVerification {
        player_id: String,
        verified: bool,
        pattern: String,
        amount: f64,
    },
    WithdrawResponse {
        player_id: String,
        approved: bool,
        amount: f64,
        account_number: String,
    },

    // Peer link signaling relayed by the backend
    Offer {
        offer: SessionDescription,
        role: PeerRole,
        room_id: Option<String>,
    },
    Answer {
        answer: SessionDescription,
        role: PeerRole,
        room_id: Option<String>,
    },
    IceCandidate {
        candidate: IceCandidateInit,
        role: PeerRole,
        room_id: Option<String>,
    },
}

impl ClientMessage {
    pub fn ping() -> Self {
        ClientMessage::Ping {
            timestamp: timestamp_ms(),
        }
    }

    pub fn pong() -> Self {
        ClientMessage::Pong {
            timestamp: timestamp_ms(),
        }
    }

    /// The `type` tag this message is sent under
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Hello { .. } => "hello",
            ClientMessage::Ping { .. } => "ping",
            ClientMessage::Pong { .. } => "pong",
            ClientMessage::Register { .. } => "register",
            ClientMessage::Payment { .. } => "payment",
            ClientMessage::Mark { .. } => "mark",
            ClientMessage::StartGame { .. } => "start_game",
            ClientMessage::Win { .. } => "win",
            ClientMessage::GameStart { .. } => "game_start",
            ClientMessage::NumberCalled { .. } => "number_called",
            ClientMessage::GameEnd { .. } => "game_end",
            ClientMessage::PlayerWon { .. } => "player_won",
            ClientMessage::AdminBroadcast { .. } => "admin_broadcast",
            ClientMessage::GetStats { .. } => "get_stats",
            ClientMessage::GetPlayers { .. } => "get_players",
            ClientMessage::JoinResponse { .. } => "join_response",
            ClientMessage::WinVerification { .. } => "win_verification",
            ClientMessage::WithdrawResponse { .. } => "withdraw_response",
            ClientMessage::Offer { .. } => "offer",
            ClientMessage::Answer { .. } => "answer",
            ClientMessage::IceCandidate { .. } => "ice_candidate",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Messages the backend sends to this client
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Acknowledges `hello`, may assign a room
    Welcome {
        room_id: Option<String>,
        message: Option<String>,
    },
    Ping { timestamp: Option<u64> },
    Pong { timestamp: Option<u64> },

    PlayerJoined {
        player_id: String,
        name: Option<String>,
        phone: Option<String>,
        stake: Option<u64>,
        #[serde(default)]
        paid: bool,
    },
    PlayerLeft { player_id: String },
    PlayerPaid { player_id: String, amount: f64 },
    PlayerWon {
        player_id: String,
        amount: f64,
        pattern: String,
    },
    NumberCalled { number: u8 },
    GameStarted {
        game_type: Option<String>,
        stake: Option<u64>,
    },
    GameEnded { room_id: Option<String> },
    WinAnnounced {
        winner_name: String,
        pattern: String,
        amount: f64,
    },
    AdminMessage { message: String },
    GameRequest {
        request: String,
        player_id: Option<String>,
        name: Option<String>,
        phone: Option<String>,
        number: Option<u8>,
        pattern: Option<String>,
        amount: Option<f64>,
        account_number: Option<String>,
    },
    Error { message: Option<String> },

    Offer {
        offer: SessionDescription,
        role: Option<PeerRole>,
        room_id: Option<String>,
    },
    Answer {
        answer: SessionDescription,
        role: Option<PeerRole>,
        room_id: Option<String>,
    },
    IceCandidate {
        candidate: IceCandidateInit,
        role: Option<PeerRole>,
        room_id: Option<String>,
    },

    /// Any tag this client does not recognize
    #[serde(skip)]
    Unknown { kind: String, payload: Value },
}

impl ServerMessage {
    const KINDS: &'static [&'static str] = &[
        "welcome",
        "ping",
        "pong",
        "player_joined",
        "player_left",
        "player_paid",
        "player_won",
        "number_called",
        "game_started",
        "game_ended",
        "win_announced",
        "admin_message",
        "game_request",
        "error",
        "offer",
        "answer",
        "ice_candidate",
    ];

    /// Parse an inbound frame. Unrecognized tags become `Unknown`;
    /// non-JSON, a missing tag, or a known tag with bad fields is an error.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        parse_tagged(text, Self::KINDS, |kind, payload| ServerMessage::Unknown {
            kind,
            payload,
        })
    }

    pub fn kind(&self) -> &str {
        match self {
            ServerMessage::Welcome { .. } => "welcome",
            ServerMessage::Ping { .. } => "ping",
            ServerMessage::Pong { .. } => "pong",
            ServerMessage::PlayerJoined { .. } => "player_joined",
            ServerMessage::PlayerLeft { .. } => "player_left",
            ServerMessage::PlayerPaid { .. } => "player_paid",
            ServerMessage::PlayerWon { .. } => "player_won",
            ServerMessage::NumberCalled { .. } => "number_called",
            ServerMessage::GameStarted { .. } => "game_started",
            ServerMessage::GameEnded { .. } => "game_ended",
            ServerMessage::WinAnnounced { .. } => "win_announced",
            ServerMessage::AdminMessage { .. } => "admin_message",
            ServerMessage::GameRequest { .. } => "game_request",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Offer { .. } => "offer",
            ServerMessage::Answer { .. } => "answer",
            ServerMessage::IceCandidate { .. } => "ice_candidate",
            ServerMessage::Unknown { kind, .. } => kind,
        }
    }

    /// Signaling payload for the peer link, if this is one
    pub fn into_signal(self) -> Result<SignalEnvelope, ServerMessage> {
        match self {
            ServerMessage::Offer {
                offer,
                role,
                room_id,
            } => Ok(SignalEnvelope {
                signal: Signal::Offer(offer),
                role,
                room_id,
            }),
            ServerMessage::Answer {
                answer,
                role,
                room_id,
            } => Ok(SignalEnvelope {
                signal: Signal::Answer(answer),
                role,
                room_id,
            }),
            ServerMessage::IceCandidate {
                candidate,
                role,
                room_id,
            } => Ok(SignalEnvelope {
                signal: Signal::Candidate(candidate),
                role,
                room_id,
            }),
            other => Err(other),
        }
    }
}

/// Messages exchanged directly between peers on the data channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum PeerMessage {
    NumberCalled {
        number: u8,
        #[serde(default)]
        timestamp: u64,
    },
    Winner {
        winner: String,
        amount: f64,
        pattern: String,
        #[serde(default)]
        timestamp: u64,
    },
    Chat {
        message: String,
        sender: String,
        #[serde(default)]
        timestamp: u64,
    },
    File { filename: String, size: u64 },
    GameState {
        numbers: Option<Vec<u8>>,
        winners: Option<Vec<WinnerEntry>>,
    },

    #[serde(skip)]
    Unknown { kind: String, payload: Value },
}

impl PeerMessage {
    const KINDS: &'static [&'static str] = &["number_called", "winner", "chat", "file", "game_state"];

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        parse_tagged(text, Self::KINDS, |kind, payload| PeerMessage::Unknown {
            kind,
            payload,
        })
    }

    pub fn kind(&self) -> &str {
        match self {
            PeerMessage::NumberCalled { .. } => "number_called",
            PeerMessage::Winner { .. } => "winner",
            PeerMessage::Chat { .. } => "chat",
            PeerMessage::File { .. } => "file",
            PeerMessage::GameState { .. } => "game_state",
            PeerMessage::Unknown { kind, .. } => kind,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn parse_tagged<T: DeserializeOwned>(
    text: &str,
    known: &[&str],
    unknown: impl FnOnce(String, Value) -> T,
) -> Result<T, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    let kind = value.get("type").and_then(Value::as_str).map(str::to_string);
    match kind {
        Some(kind) if !known.contains(&kind.as_str()) => Ok(unknown(kind, value)),
        _ => serde_json::from_value(value),
    }
}
