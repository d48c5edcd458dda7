// bingo-link configuration types
// All settings with defaults matching the values the web client shipped with

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub rtc: RtcConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkConfig {
    // Game backend WebSocket URL
    pub ws_url: String,

    // Heartbeat interval in milliseconds (staleness threshold is twice this)
    pub heartbeat_interval_ms: u64,

    // Automatic reconnect attempts before giving up
    pub max_reconnect_attempts: u32,

    // Delay before the first reconnect attempt
    pub reconnect_delay_ms: u64,

    // Growth factor applied to the delay on each further attempt
    pub backoff_factor: f64,

    // Unsent messages kept while offline (oldest dropped first)
    pub queue_capacity: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://localhost:8000/ws".to_string(),
            heartbeat_interval_ms: 30_000,
            max_reconnect_attempts: 5,
            reconnect_delay_ms: 3_000,
            backoff_factor: 1.5,
            queue_capacity: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct IceServer {
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RtcConfig {
    // Whether the peer data channel may be started at all
    pub enabled: bool,

    // Attach local audio/video when starting a call
    pub enable_media: bool,

    // Capture device held open while a call with media is active
    pub media_device: PathBuf,

    // Data channel label and retransmit budget
    pub channel_label: String,
    pub max_retransmits: u16,

    // Candidate-gathering servers, first STUN entry is used
    pub ice_servers: Vec<IceServer>,
}

impl RtcConfig {
    /// First STUN server as a `host:port` string
    pub fn stun_server(&self) -> Option<String> {
        self.ice_servers
            .iter()
            .flat_map(|server| server.urls.iter())
            .find_map(|url| url.strip_prefix("stun:"))
            .map(str::to_string)
    }
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            enable_media: false,
            media_device: PathBuf::from("/dev/video0"),
            channel_label: "bingoData".to_string(),
            max_retransmits: 3,
            ice_servers: vec![
                IceServer {
                    urls: vec![
                        "stun:stun1.l.google.com:19302".to_string(),
                        "stun:stun2.l.google.com:19302".to_string(),
                        "stun:stun3.l.google.com:19302".to_string(),
                        "stun:stun4.l.google.com:19302".to_string(),
                    ],
                },
                IceServer {
                    urls: vec!["stun:global.stun.twilio.com:3478".to_string()],
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    // Compared against `--admin <password>`; not a security boundary
    pub password: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            password: "asse2123".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    // Where pending messages, room id and settings live (defaults to the data dir)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}
