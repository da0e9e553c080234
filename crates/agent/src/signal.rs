//! HTTP signalling client for the rendezvous server.
//!
//! Stateless apart from the poll cursor: the server buffers signals per
//! session and sorts them by its own monotonic timestamps. The cursor is
//! advanced only after a poll response has been fully decoded, so a
//! network error followed by a re-poll never skips messages. Duplicates
//! are tolerated here; the peer negotiation above is idempotent for SDP
//! and additive for ICE candidates.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use tracing::debug;

use tether_protocol::{
    AckResponse, PollSignalsResponse, SendSignalRequest, SignalEnvelope, SignalKind,
};

use crate::error::{AgentError, Result};

const SEND_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SignalClient {
    http: reqwest::Client,
    server_url: String,
    session_id: String,
    token: String,
    /// Timestamp of the last decoded signal; poll requests ask for
    /// strictly newer messages.
    cursor: AtomicI64,
}

impl SignalClient {
    pub fn new(http: reqwest::Client, server_url: &str, session_id: &str, token: &str) -> Self {
        Self {
            http,
            server_url: server_url.trim_end_matches('/').to_string(),
            session_id: session_id.to_string(),
            token: token.to_string(),
            cursor: AtomicI64::new(0),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// POST one signal to the bus.
    pub async fn send(&self, kind: SignalKind, data: serde_json::Value) -> Result<()> {
        let body = SendSignalRequest {
            session_id: self.session_id.clone(),
            token: self.token.clone(),
            kind,
            data,
            sender: "agent".to_string(),
        };
        let resp = self
            .http
            .post(format!("{}/api/rc/signalling", self.server_url))
            .timeout(SEND_TIMEOUT)
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(AgentError::Transport(format!(
                "send signal: server returned {}",
                resp.status()
            )));
        }
        let ack: AckResponse = resp.json().await?;
        if !ack.success {
            return Err(AgentError::Transport(format!(
                "send signal rejected: {}",
                ack.error.unwrap_or_default()
            )));
        }
        debug!(session = %self.session_id, ?kind, "Signal sent");
        Ok(())
    }

    /// Poll for signals newer than the cursor, in server timestamp order.
    pub async fn poll(&self) -> Result<Vec<SignalEnvelope>> {
        let since = self.cursor.load(Ordering::Acquire).to_string();
        let resp = self
            .http
            .get(format!("{}/api/rc/signalling", self.server_url))
            .timeout(POLL_TIMEOUT)
            .query(&[
                ("sessionId", self.session_id.as_str()),
                ("token", self.token.as_str()),
                ("since", since.as_str()),
                ("role", "agent"),
            ])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(AgentError::Transport(format!(
                "poll signals: server returned {}",
                resp.status()
            )));
        }
        let body: PollSignalsResponse = resp.json().await?;
        if !body.success {
            return Err(AgentError::Transport("poll signals rejected".into()));
        }
        // Advance only now: the whole response decoded cleanly.
        if let Some(latest) = latest_timestamp(&body.data) {
            self.cursor.store(latest, Ordering::Release);
        }
        Ok(body.data)
    }

    /// DELETE all buffered signals for the session (graceful stop).
    pub async fn clear(&self) -> Result<()> {
        let resp = self
            .http
            .delete(format!("{}/api/rc/signalling", self.server_url))
            .timeout(SEND_TIMEOUT)
            .query(&[
                ("sessionId", self.session_id.as_str()),
                ("token", self.token.as_str()),
            ])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(AgentError::Transport(format!(
                "clear signals: server returned {}",
                resp.status()
            )));
        }
        debug!(session = %self.session_id, "Signal buffer cleared");
        Ok(())
    }
}

/// Timestamp the cursor should advance to after a successful poll: the
/// last (greatest) timestamp in the server-ordered batch.
fn latest_timestamp(messages: &[SignalEnvelope]) -> Option<i64> {
    messages.last().map(|m| m.timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(timestamp: i64) -> SignalEnvelope {
        SignalEnvelope {
            kind: SignalKind::Offer,
            data: serde_json::json!({}),
            timestamp,
        }
    }

    #[test]
    fn empty_batch_leaves_cursor_alone() {
        assert_eq!(latest_timestamp(&[]), None);
    }

    #[test]
    fn cursor_advances_to_last_message() {
        let batch = [envelope(10), envelope(20), envelope(30)];
        assert_eq!(latest_timestamp(&batch), Some(30));
    }

    #[test]
    fn client_starts_with_zero_cursor() {
        let client = SignalClient::new(reqwest::Client::new(), "http://server/", "S1", "T");
        assert_eq!(client.cursor.load(Ordering::Acquire), 0);
        assert_eq!(client.server_url, "http://server");
    }
}
