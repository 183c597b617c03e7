// Configuration file loading and creation

use super::types::Config;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Get the path to the configuration file
pub fn get_config_path() -> PathBuf {
    let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("racelink");

    // Create config directory if it doesn't exist
    fs::create_dir_all(&path).ok();

    path.push("config.toml");
    path
}

/// Load configuration from file, or create default if it doesn't exist
pub fn load_config() -> Result<Config, io::Error> {
    load_config_from(&get_config_path())
}

pub fn load_config_from(config_path: &Path) -> Result<Config, io::Error> {
    if config_path.exists() {
        let contents = fs::read_to_string(config_path)?;
        Ok(parse_config(&contents))
    } else {
        create_default_config(config_path)?;
        Ok(Config::default())
    }
}

/// Parse config text, falling back to defaults when it is not valid TOML
pub fn parse_config(contents: &str) -> Config {
    match toml::from_str(contents) {
        Ok(config) => config,
        Err(e) => {
            warn!("Failed to parse config file: {}", e);
            warn!("Using default configuration");
            Config::default()
        }
    }
}

/// Create a default configuration file with helpful comments
pub fn create_default_config(path: &Path) -> Result<(), io::Error> {
    let config = Config::default();
    let toml_string = toml::to_string_pretty(&config).map_err(io::Error::other)?;

    let commented_toml = format!(
        "# racelink configuration file\n\
         # Restart after editing for changes to take effect\n\
         #\n\
         # network.stun_server: set to \"\" to use host candidates only\n\
         # network.negotiation_timeout_secs: 0 waits for the peer forever\n\n\
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
    use std::time::Duration;

    #[test]
    fn test_default_config_serialization() {
        let config = Config::default();
        let toml_string = toml::to_string_pretty(&config).unwrap();

        let parsed: Config = toml::from_str(&toml_string).unwrap();

        assert_eq!(parsed.network.signaling_url, config.network.signaling_url);
        assert_eq!(parsed.network.poll_interval_ms, 300);
        assert_eq!(parsed.server.room_ttl_secs, 600);
        assert_eq!(parsed.session.frame_rate, 60);
    }

    #[test]
    fn test_partial_config_with_defaults() {
        let partial_toml = r#"
            [network]
            poll_interval_ms = 150
            stun_server = ""
        "#;

        let config = parse_config(partial_toml);

        assert_eq!(config.network.poll_interval(), Duration::from_millis(150));
        assert_eq!(config.network.stun_server(), None);

        // Untouched values keep their defaults
        assert_eq!(config.network.send_retries, 3);
        assert_eq!(config.network.negotiation_timeout(), None);
        assert_eq!(config.server.bind_addr, "0.0.0.0:8787");
    }

    #[test]
    fn test_invalid_config_falls_back() {
        let config = parse_config("[network\nsignaling_url = 5");
        assert_eq!(config.network.signaling_url, "http://127.0.0.1:8787");
    }

    #[test]
    fn test_missing_file_is_created() {
        let dir = std::env::temp_dir().join(format!("racelink-config-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        let _ = fs::remove_file(&path);

        let config = load_config_from(&path).unwrap();
        assert_eq!(config.session.race_secs, 30);

        let written = fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("# racelink configuration file"));
        assert_eq!(parse_config(&written).network.stun_server(), Some("stun.cloudflare.com:3478".into()));

        fs::remove_dir_all(&dir).unwrap();
    }
}
