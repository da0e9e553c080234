//! Typed errors for the agent core.
//!
//! Propagation policy: transient transport errors on polling paths are
//! logged and retried on the next tick; malformed inbound payloads are
//! logged and dropped; codec failures are fatal for the owning session.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    /// HTTP transport failure against the rendezvous server (network I/O
    /// or a non-2xx status).
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed JSON or SDP received from the wire.
    #[error("decode error: {0}")]
    Decode(String),

    /// Platform capture or input subsystem failure.
    #[error("platform error: {0}")]
    Platform(String),

    /// Encoder initialization or encode failure.
    #[error("codec error: {0}")]
    Codec(String),

    /// Operation attempted in an invalid state.
    #[error("state error: {0}")]
    State(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        AgentError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        AgentError::Decode(err.to_string())
    }
}

impl From<webrtc::Error> for AgentError {
    fn from(err: webrtc::Error) -> Self {
        AgentError::State(format!("peer connection: {err}"))
    }
}
