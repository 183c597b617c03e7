// Configuration module for racelink
// Handles loading network, server and session settings from a TOML file

pub mod loader;
pub mod types;

pub use loader::{create_default_config, get_config_path, load_config, load_config_from, parse_config};
pub use types::{Config, NetworkConfig, ServerConfig, SessionConfig};
