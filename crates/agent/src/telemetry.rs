//! Periodic telemetry POST.
//!
//! Full system-metrics collection lives outside the core; this is the
//! narrow surface the capability advertisement rides on. The snapshot is
//! deliberately small: identity, uptime, and the immutable capabilities
//! record.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::debug;

use tether_protocol::Capabilities;

use crate::config::Credential;
use crate::error::{AgentError, Result};

const POST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TelemetrySnapshot<'a> {
    agent_id: &'a str,
    asset_id: &'a str,
    /// Seconds since the Unix epoch.
    timestamp: u64,
    uptime_secs: u64,
    capabilities: &'a Capabilities,
}

/// POST one snapshot to `/api/agent/performance`, authenticated with the
/// long-lived agent credential.
pub async fn post_snapshot(
    http: &reqwest::Client,
    server_url: &str,
    credential: &Credential,
    capabilities: &Capabilities,
    started: Instant,
) -> Result<()> {
    let snapshot = TelemetrySnapshot {
        agent_id: &credential.agent_id,
        asset_id: &credential.asset_id,
        timestamp: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
        uptime_secs: started.elapsed().as_secs(),
        capabilities,
    };

    let resp = http
        .post(format!(
            "{}/api/agent/performance",
            server_url.trim_end_matches('/')
        ))
        .timeout(POST_TIMEOUT)
        .bearer_auth(&credential.credential_key)
        .json(&snapshot)
        .send()
        .await?;

    if !resp.status().is_success() {
        return Err(AgentError::Transport(format!(
            "telemetry POST: server returned {}",
            resp.status()
        )));
    }
    debug!("Telemetry snapshot sent");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_serializes_with_capabilities() {
        let caps = Capabilities {
            remote_control: true,
            screen_capture: true,
            input_injection: true,
            webrtc_supported: true,
            platform: "linux".into(),
            agent_version: "0.1.0".into(),
        };
        let snapshot = TelemetrySnapshot {
            agent_id: "agent-1",
            asset_id: "asset-1",
            timestamp: 1712345678,
            uptime_secs: 42,
            capabilities: &caps,
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains(r#""agentId":"agent-1""#));
        assert!(json.contains(r#""uptimeSecs":42"#));
        assert!(json.contains(r#""capabilities":{"#));
        assert!(json.contains(r#""remoteControl":true"#));
    }
}
