// Persisted user settings and the stable player identifier

use anyhow::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{load_json, save_json, Storage, PLAYER_ID_KEY, SETTINGS_KEY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// Amharic
    Am,
    En,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Default,
    Dark,
    Light,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FontSize {
    Small,
    Medium,
    Large,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub sound_enabled: bool,
    pub vibration_enabled: bool,
    pub auto_mark_numbers: bool,
    pub show_animations: bool,
    pub language: Language,
    pub theme: Theme,
    pub font_size: FontSize,
    pub notification_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sound_enabled: true,
            vibration_enabled: true,
            auto_mark_numbers: false,
            show_animations: true,
            language: Language::Am,
            theme: Theme::Default,
            font_size: FontSize::Medium,
            notification_enabled: true,
        }
    }
}

impl Settings {
    pub fn load(store: &dyn Storage) -> Self {
        load_json(store, SETTINGS_KEY).unwrap_or_default()
    }

    pub fn save(&self, store: &mut dyn Storage) -> Result<()> {
        save_json(store, SETTINGS_KEY, self)
    }
}

/// Generate a player id: "P-" followed by 8 uppercase letters/digits
fn generate_player_id() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..8)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("P-{}", suffix)
}

/// The player id stored for this install, created on first use
pub fn load_or_create_player_id(store: &mut dyn Storage) -> Result<String> {
    if let Some(id) = load_json::<String>(store, PLAYER_ID_KEY) {
        return Ok(id);
    }
    let id = generate_player_id();
    save_json(store, PLAYER_ID_KEY, &id)?;
    info!("Created player id {}", id);
    Ok(id)
}
