use serde::{Deserialize, Serialize};

/// Signal message kinds carried over the rendezvous signalling bus.
///
/// The wire uses the kebab-case names the operator client sends
/// (`offer`, `answer`, `ice-candidate`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

/// One buffered signal returned by the poll endpoint.
///
/// `timestamp` is server-assigned and monotonic within a session; the
/// agent advances its poll cursor to the timestamp of the last message
/// it fully decoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEnvelope {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub data: serde_json::Value,
    pub timestamp: i64,
}

/// Body of `POST /api/rc/signalling`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendSignalRequest {
    pub session_id: String,
    pub token: String,
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub data: serde_json::Value,
    /// Identifies the originating side so the server can route by role.
    pub sender: String,
}

/// Response of `GET /api/rc/signalling`.
#[derive(Debug, Clone, Deserialize)]
pub struct PollSignalsResponse {
    pub success: bool,
    #[serde(default)]
    pub data: Vec<SignalEnvelope>,
}

/// Generic `{success}` acknowledgement from the rendezvous server.
#[derive(Debug, Clone, Deserialize)]
pub struct AckResponse {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Remote-control session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Active,
    Ended,
}

/// A pending session handed out by `GET /api/agent/rc/poll`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    pub session_id: String,
    pub token: String,
    pub asset_id: String,
    pub org_id: String,
    pub status: SessionStatus,
}

/// Response of `GET /api/agent/rc/poll`.
#[derive(Debug, Clone, Deserialize)]
pub struct PendingSessionResponse {
    pub success: bool,
    #[serde(default)]
    pub session: Option<SessionDescriptor>,
}

/// SDP description as exchanged in `offer`/`answer` signal payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSdp {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

/// ICE candidate as exchanged in `ice-candidate` signal payloads.
/// Field names follow the browser's `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidatePayload {
    pub candidate: String,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// ICE server configuration consumed at peer-connection init.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerInfo {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// What this agent can do. Immutable after construction; advertised to the
/// server by piggy-backing on the periodic telemetry POST.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub remote_control: bool,
    pub screen_capture: bool,
    pub input_injection: bool,
    pub webrtc_supported: bool,
    pub platform: String,
    pub agent_version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_kind_uses_kebab_case() {
        assert_eq!(
            serde_json::to_string(&SignalKind::IceCandidate).unwrap(),
            r#""ice-candidate""#
        );
        let kind: SignalKind = serde_json::from_str(r#""offer""#).unwrap();
        assert_eq!(kind, SignalKind::Offer);
    }

    #[test]
    fn signal_envelope_from_server_format() {
        let json = r#"{
            "type": "ice-candidate",
            "data": {"candidate": "candidate:1 1 udp 2130706431 192.0.2.1 50000 typ host"},
            "timestamp": 1712345678901
        }"#;
        let env: SignalEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(env.kind, SignalKind::IceCandidate);
        assert_eq!(env.timestamp, 1712345678901);
        assert!(env.data["candidate"].as_str().unwrap().starts_with("candidate:"));
    }

    #[test]
    fn send_signal_request_is_camel_case() {
        let req = SendSignalRequest {
            session_id: "S1".into(),
            token: "T".into(),
            kind: SignalKind::Answer,
            data: serde_json::json!({"type": "answer", "sdp": "v=0"}),
            sender: "agent".into(),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""sessionId":"S1""#));
        assert!(json.contains(r#""type":"answer""#));
        assert!(json.contains(r#""sender":"agent""#));
        assert!(!json.contains("session_id"));
    }

    #[test]
    fn pending_session_response_with_session() {
        let json = r#"{
            "success": true,
            "session": {
                "sessionId": "S1",
                "token": "T",
                "assetId": "A",
                "orgId": "O",
                "status": "pending"
            }
        }"#;
        let resp: PendingSessionResponse = serde_json::from_str(json).unwrap();
        assert!(resp.success);
        let session = resp.session.unwrap();
        assert_eq!(session.session_id, "S1");
        assert_eq!(session.status, SessionStatus::Pending);
    }

    #[test]
    fn pending_session_response_without_session() {
        let resp: PendingSessionResponse = serde_json::from_str(r#"{"success": true}"#).unwrap();
        assert!(resp.success);
        assert!(resp.session.is_none());
    }

    #[test]
    fn poll_signals_response_defaults_to_empty() {
        let resp: PollSignalsResponse = serde_json::from_str(r#"{"success": true}"#).unwrap();
        assert!(resp.data.is_empty());
    }

    #[test]
    fn ice_candidate_payload_roundtrip() {
        let json = r#"{
            "candidate": "candidate:1 1 udp 2130706431 192.0.2.1 50000 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0
        }"#;
        let payload: IceCandidatePayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.sdp_mid.as_deref(), Some("0"));
        assert_eq!(payload.sdp_mline_index, Some(0));

        let out = serde_json::to_string(&payload).unwrap();
        assert!(out.contains(r#""sdpMid":"0""#));
        assert!(out.contains(r#""sdpMLineIndex":0"#));
    }

    #[test]
    fn ice_candidate_payload_optional_fields_omitted() {
        let payload = IceCandidatePayload {
            candidate: "candidate:2".into(),
            sdp_mid: None,
            sdp_mline_index: None,
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(!json.contains("sdpMid"));
        assert!(!json.contains("sdpMLineIndex"));
    }

    #[test]
    fn capabilities_are_camel_case() {
        let caps = Capabilities {
            remote_control: true,
            screen_capture: true,
            input_injection: false,
            webrtc_supported: true,
            platform: "linux".into(),
            agent_version: "1.0.0".into(),
        };
        let json = serde_json::to_string(&caps).unwrap();
        assert!(json.contains(r#""remoteControl":true"#));
        assert!(json.contains(r#""inputInjection":false"#));
        assert!(json.contains(r#""webrtcSupported":true"#));
        assert!(json.contains(r#""agentVersion":"1.0.0""#));
    }

    #[test]
    fn session_sdp_keeps_type_field() {
        let sdp = SessionSdp {
            kind: "offer".into(),
            sdp: "v=0\r\n".into(),
        };
        let json = serde_json::to_string(&sdp).unwrap();
        assert!(json.contains(r#""type":"offer""#));
        let parsed: SessionSdp = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.kind, "offer");
    }
}
