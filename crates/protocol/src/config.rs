use serde::{Deserialize, Serialize};

use crate::messages::IceServerInfo;

/// Top-level agent configuration, loaded from a TOML file.
/// Every field has a default so an empty file is a valid configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub video: VideoConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub ice: IceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Base URL of the rendezvous server.
    #[serde(default = "default_server_url")]
    pub url: String,
    /// Path to the enrollment credential file written by the installer.
    #[serde(default = "default_credential_file")]
    pub credential_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    /// Target encoder bitrate in kbps.
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
    /// Capture and encode framerate.
    #[serde(default = "default_framerate")]
    pub framerate: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// Pending-session discovery interval in seconds.
    #[serde(default = "default_pending_secs")]
    pub pending_secs: u64,
    /// Per-session signalling poll interval in seconds.
    #[serde(default = "default_signal_secs")]
    pub signal_secs: u64,
    /// Telemetry/capability advertisement interval in seconds.
    #[serde(default = "default_telemetry_secs")]
    pub telemetry_secs: u64,
}

/// ICE/TURN server configuration for WebRTC NAT traversal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    /// STUN server URLs.
    #[serde(default = "default_stun_urls")]
    pub stun_urls: Vec<String>,
    /// TURN server URLs (e.g., "turn:turn.example.com:3478").
    #[serde(default)]
    pub turn_urls: Vec<String>,
    /// TURN username (long-term credential mechanism).
    pub turn_username: Option<String>,
    /// TURN credential/password.
    pub turn_credential: Option<String>,
}

impl IceConfig {
    /// Flatten into the ICE server list consumed at peer-connection init.
    pub fn to_ice_servers(&self) -> Vec<IceServerInfo> {
        let mut servers = vec![IceServerInfo {
            urls: self.stun_urls.clone(),
            username: None,
            credential: None,
        }];
        if !self.turn_urls.is_empty() {
            servers.push(IceServerInfo {
                urls: self.turn_urls.clone(),
                username: self.turn_username.clone(),
                credential: self.turn_credential.clone(),
            });
        }
        servers
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        toml::from_str("").expect("default server config")
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        toml::from_str("").expect("default video config")
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        toml::from_str("").expect("default poll config")
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        toml::from_str("").expect("default ice config")
    }
}

fn default_server_url() -> String {
    "http://localhost:9002".to_string()
}

fn default_credential_file() -> String {
    "./agent-credential.json".to_string()
}

fn default_bitrate() -> u32 {
    5000
}

fn default_framerate() -> u32 {
    30
}

fn default_pending_secs() -> u64 {
    10
}

fn default_signal_secs() -> u64 {
    5
}

fn default_telemetry_secs() -> u64 {
    60
}

fn default_stun_urls() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config: AgentConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.url, "http://localhost:9002");
        assert_eq!(config.server.credential_file, "./agent-credential.json");
        assert_eq!(config.video.bitrate, 5000);
        assert_eq!(config.video.framerate, 30);
        assert_eq!(config.poll.pending_secs, 10);
        assert_eq!(config.poll.signal_secs, 5);
        assert_eq!(config.poll.telemetry_secs, 60);
        assert_eq!(config.ice.stun_urls.len(), 2);
        assert!(config.ice.turn_urls.is_empty());
    }

    #[test]
    fn partial_file_overrides_only_named_fields() {
        let config: AgentConfig = toml::from_str(
            r#"
            [server]
            url = "https://rendezvous.example.com"

            [video]
            bitrate = 8000
            "#,
        )
        .unwrap();
        assert_eq!(config.server.url, "https://rendezvous.example.com");
        assert_eq!(config.video.bitrate, 8000);
        assert_eq!(config.video.framerate, 30);
        assert_eq!(config.poll.signal_secs, 5);
    }

    #[test]
    fn ice_servers_include_turn_when_configured() {
        let config: AgentConfig = toml::from_str(
            r#"
            [ice]
            turn_urls = ["turn:turn.example.com:3478"]
            turn_username = "user"
            turn_credential = "secret"
            "#,
        )
        .unwrap();
        let servers = config.ice.to_ice_servers();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[1].username.as_deref(), Some("user"));
    }

    #[test]
    fn ice_servers_stun_only_by_default() {
        let servers = IceConfig::default().to_ice_servers();
        assert_eq!(servers.len(), 1);
        assert!(servers[0].urls[0].starts_with("stun:"));
    }
}
