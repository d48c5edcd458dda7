// Configuration file loading and creation

use super::types::Config;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Get the path to the configuration file
pub fn get_config_path() -> PathBuf {
    let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("bingo-link");

    // Create config directory if it doesn't exist
    fs::create_dir_all(&path).ok();

    path.push("config.toml");
    path
}

/// Load configuration from file, or create default if it doesn't exist
pub fn load_config() -> Result<Config, io::Error> {
    load_config_from(&get_config_path())
}

/// Load configuration from an explicit path
pub fn load_config_from(config_path: &Path) -> Result<Config, io::Error> {
    if config_path.exists() {
        let contents = fs::read_to_string(config_path)?;
        match toml::from_str(&contents) {
            Ok(config) => Ok(config),
            Err(e) => {
                warn!("Failed to parse config file {}: {}", config_path.display(), e);
                warn!("Using default configuration");
                Ok(Config::default())
            }
        }
    } else {
        create_default_config(config_path)?;
        Ok(Config::default())
    }
}

/// Create a default configuration file with helpful comments
pub fn create_default_config(path: &Path) -> Result<(), io::Error> {
    let config = Config::default();
    let toml_string =
        toml::to_string_pretty(&config).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    let commented_toml = format!(
        "# bingo-link configuration file\n\
         # Restart the client after editing for changes to take effect\n\
         #\n\
         # network.ws_url: game backend WebSocket endpoint\n\
         # network.heartbeat_interval_ms: a connection silent for twice this long is reopened\n\
         # network.reconnect_delay_ms / backoff_factor: delay = delay_ms * factor^(attempt - 1)\n\
         #\n\
         # rtc.ice_servers: the first stun: URL is queried for a public candidate\n\n\
         {}",
        toml_string
    );

    fs::write(path, commented_toml)?;
    info!("Created default config file at: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serialization() {
        let config = Config::default();
        let toml_string = toml::to_string_pretty(&config).unwrap();

        let parsed: Config = toml::from_str(&toml_string).unwrap();

        assert_eq!(parsed.network.ws_url, config.network.ws_url);
        assert_eq!(
            parsed.network.heartbeat_interval_ms,
            config.network.heartbeat_interval_ms
        );
        assert_eq!(parsed.network.backoff_factor, config.network.backoff_factor);
        assert_eq!(parsed.rtc.ice_servers, config.rtc.ice_servers);
        assert_eq!(parsed.admin.password, config.admin.password);
        assert!(parsed.storage.data_dir.is_none());
    }

    #[test]
    fn test_partial_config_with_defaults() {
        let partial_toml = r#"
            [network]
            ws_url = "wss://bingo.example.org/ws"
            max_reconnect_attempts = 8
        "#;

        let config: Config = toml::from_str(partial_toml).unwrap();

        // Custom values
        assert_eq!(config.network.ws_url, "wss://bingo.example.org/ws");
        assert_eq!(config.network.max_reconnect_attempts, 8);

        // Defaults should still be there
        assert_eq!(config.network.reconnect_delay_ms, 3000);
        assert_eq!(config.network.queue_capacity, 50);
        assert_eq!(config.rtc.channel_label, "bingoData");
    }

    #[test]
    fn test_stun_server_picks_first_stun_url() {
        let config = Config::default();
        assert_eq!(
            config.rtc.stun_server().as_deref(),
            Some("stun1.l.google.com:19302")
        );

        let mut rtc = config.rtc.clone();
        rtc.ice_servers = vec![crate::config::IceServer {
            urls: vec!["turn:relay.example.org:3478".to_string()],
        }];
        assert_eq!(rtc.stun_server(), None);
    }

    #[test]
    fn test_missing_file_creates_default() {
        let dir = std::env::temp_dir().join(format!("bingo-link-config-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        let _ = fs::remove_file(&path);

        let config = load_config_from(&path).unwrap();
        assert_eq!(config.network.ws_url, "ws://localhost:8000/ws");
        assert!(path.exists());

        // Garbage falls back to defaults instead of failing
        fs::write(&path, "network = [[[").unwrap();
        let config = load_config_from(&path).unwrap();
        assert_eq!(config.network.max_reconnect_attempts, 5);

        let _ = fs::remove_dir_all(&dir);
    }
}
