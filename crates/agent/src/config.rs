//! Configuration and credential loading.
//!
//! The TOML schema lives in the protocol crate; this module reads it
//! from disk and loads the enrollment credential the installer wrote.
//! Enrollment itself happens outside the agent core — only the stored
//! artefact is consumed here.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use tether_protocol::AgentConfig;

/// Long-lived identity written at enrollment time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub agent_id: String,
    pub asset_id: String,
    pub credential_key: String,
}

impl Credential {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read credential file {}", path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("parse credential file {}", path.display()))
    }
}

/// Load the agent configuration, or defaults when no file is given.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<AgentConfig> {
    match path {
        Some(path) => {
            let data = std::fs::read_to_string(path)
                .with_context(|| format!("read config file {}", path.display()))?;
            toml::from_str(&data).with_context(|| format!("parse config file {}", path.display()))
        }
        None => Ok(AgentConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_parses_enrollment_format() {
        let json = r#"{
            "agentId": "linux-host-1712345678",
            "assetId": "asset-42",
            "credentialKey": "c0ffee"
        }"#;
        let cred: Credential = serde_json::from_str(json).unwrap();
        assert_eq!(cred.agent_id, "linux-host-1712345678");
        assert_eq!(cred.asset_id, "asset-42");
        assert_eq!(cred.credential_key, "c0ffee");
    }

    #[test]
    fn credential_roundtrips_camel_case() {
        let cred = Credential {
            agent_id: "a".into(),
            asset_id: "b".into(),
            credential_key: "c".into(),
        };
        let json = serde_json::to_string(&cred).unwrap();
        assert!(json.contains("agentId"));
        assert!(json.contains("credentialKey"));
        assert!(!json.contains("agent_id"));
    }

    #[test]
    fn missing_config_path_yields_defaults() {
        let config = load_config(None).unwrap();
        assert_eq!(config.video.framerate, 30);
    }
}
