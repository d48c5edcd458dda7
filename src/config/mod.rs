// Configuration module for bingo-link
// Handles loading and managing client configuration from TOML file

pub mod loader;
pub mod types;

pub use loader::{create_default_config, get_config_path, load_config, load_config_from};
pub use types::{AdminConfig, Config, IceServer, NetworkConfig, RtcConfig, StorageConfig};
