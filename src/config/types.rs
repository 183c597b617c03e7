// racelink configuration types
// Every section has defaults so partial files load

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkConfig {
    // Base URL of the room service
    pub signaling_url: String,

    // Signaling poll interval while negotiating
    pub poll_interval_ms: u64,

    // STUN server for the reflexive candidate (empty = host candidates only)
    pub stun_server: String,

    // Consecutive failed signaling sends before giving up
    pub send_retries: u32,

    // Give up on connecting after this long (0 = wait forever)
    pub negotiation_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            signaling_url: "http://127.0.0.1:8787".to_string(),
            poll_interval_ms: 300,
            stun_server: "stun.cloudflare.com:3478".to_string(),
            send_retries: 3,
            negotiation_timeout_secs: 0,
        }
    }
}

impl NetworkConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn stun_server(&self) -> Option<String> {
        let server = self.stun_server.trim();
        (!server.is_empty()).then(|| server.to_string())
    }

    pub fn negotiation_timeout(&self) -> Option<Duration> {
        (self.negotiation_timeout_secs > 0).then(|| Duration::from_secs(self.negotiation_timeout_secs))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    // Listen address for the signaling server binary
    pub bind_addr: String,

    // Rooms older than this are forgotten
    pub room_ttl_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8787".to_string(),
            room_ttl_secs: 600,
        }
    }
}

impl ServerConfig {
    pub fn room_ttl(&self) -> Duration {
        Duration::from_secs(self.room_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    // State packets sent per second
    pub frame_rate: u32,

    // Demo race length before the host signals finish
    pub race_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            frame_rate: 60,
            race_secs: 30,
        }
    }
}

impl SessionConfig {
    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.frame_rate.max(1)))
    }
}
