//! WebRTC peer session.
//!
//! The agent is the answerer: it never creates an offer, it waits for
//! the operator's. One outbound VP8 video track carries the encoder's
//! bitstream; the operator opens one reliable data channel that carries
//! input and monitor-change commands back.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use tether_protocol::{ControlEvent, IceCandidatePayload, IceServerInfo};

use crate::error::{AgentError, Result};

pub struct PeerSession {
    pc: Arc<RTCPeerConnection>,
    video_track: Arc<TrackLocalStaticSample>,
    data_channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    connected_rx: watch::Receiver<bool>,
}

impl PeerSession {
    /// Build the peer connection: default codec set, default interceptors,
    /// the supplied ICE servers (STUN fallback when empty), one video
    /// track identified as `(video, screen-capture)`. Post-condition: the
    /// peer is ready to receive the operator's offer.
    pub async fn new(ice_servers: &[IceServerInfo]) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| AgentError::State(format!("interceptor registry: {e}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_ice_servers: Vec<RTCIceServer> = if ice_servers.is_empty() {
            vec![RTCIceServer {
                urls: vec!["stun:stun.l.google.com:19302".to_string()],
                ..Default::default()
            }]
        } else {
            ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone().unwrap_or_default(),
                    credential: s.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect()
        };

        let config = RTCConfiguration {
            ice_servers: rtc_ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await?);

        let video_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
            "video".to_string(),
            "screen-capture".to_string(),
        ));
        pc.add_track(Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        let (connected_tx, connected_rx) = watch::channel(false);
        pc.on_peer_connection_state_change(Box::new(move |state| {
            match state {
                RTCPeerConnectionState::Connected => {
                    info!("Peer connection established");
                    let _ = connected_tx.send(true);
                }
                RTCPeerConnectionState::Failed
                | RTCPeerConnectionState::Disconnected
                | RTCPeerConnectionState::Closed => {
                    warn!(?state, "Peer connection ended");
                    let _ = connected_tx.send(false);
                }
                _ => {
                    debug!(?state, "Peer connection state changed");
                }
            }
            Box::pin(async {})
        }));

        pc.on_ice_connection_state_change(Box::new(move |state| {
            debug!(?state, "ICE connection state changed");
            Box::pin(async {})
        }));

        Ok(Self {
            pc,
            video_track,
            data_channel: Arc::new(Mutex::new(None)),
            connected_rx,
        })
    }

    /// Forward locally discovered ICE candidates into the signalling
    /// path. The session owns both this peer and the signal client; the
    /// channel keeps the reference non-owning. A nil candidate
    /// (end-of-candidates) is dropped.
    pub fn set_signal_sink(&self, tx: mpsc::Sender<IceCandidatePayload>) {
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(json) => {
                        let payload = IceCandidatePayload {
                            candidate: json.candidate,
                            sdp_mid: json.sdp_mid,
                            sdp_mline_index: json.sdp_mline_index,
                        };
                        if tx.try_send(payload).is_err() {
                            warn!("ICE candidate dropped (signal sink unavailable)");
                        }
                    }
                    Err(e) => warn!("Failed to serialize ICE candidate: {e}"),
                }
            }
            Box::pin(async {})
        }));
    }

    /// Dispatch inbound control-channel messages. Malformed JSON is
    /// logged and dropped; the session continues.
    pub fn on_control_event(&self, callback: impl Fn(ControlEvent) + Send + Sync + 'static) {
        let callback = Arc::new(callback);
        let dc_storage = Arc::clone(&self.data_channel);

        self.pc.on_data_channel(Box::new(move |dc| {
            let callback = Arc::clone(&callback);
            let dc_storage = Arc::clone(&dc_storage);
            Box::pin(async move {
                info!(label = dc.label(), "Control channel opened by operator");
                {
                    let mut storage = dc_storage.lock().await;
                    *storage = Some(Arc::clone(&dc));
                }
                let cb = Arc::clone(&callback);
                dc.on_message(Box::new(move |msg| {
                    let cb = Arc::clone(&cb);
                    Box::pin(async move {
                        match serde_json::from_slice::<ControlEvent>(&msg.data) {
                            Ok(event) => cb(event),
                            Err(e) => warn!("Dropping malformed control message: {e}"),
                        }
                    })
                }));
            })
        }));
    }

    /// Apply the operator's offer and produce our answer SDP.
    /// Applying the same SDP twice is a no-op at the negotiation level,
    /// so duplicate delivery from the bus is harmless.
    pub async fn handle_offer(&self, sdp: &str) -> Result<String> {
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| AgentError::Decode(format!("offer SDP: {e}")))?;
        self.pc.set_remote_description(offer).await?;

        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        info!("Answer created for operator offer");
        Ok(answer.sdp)
    }

    /// Apply a remote answer — only meaningful while we hold a local
    /// offer (renegotiation we never initiate in v1). Anything else is
    /// ignored, which also guards against our own answers looping back
    /// from the bus.
    pub async fn apply_answer(&self, sdp: &str) -> Result<()> {
        if self.pc.signaling_state() != RTCSignalingState::HaveLocalOffer {
            debug!("Ignoring answer signal (not expecting one)");
            return Ok(());
        }
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| AgentError::Decode(format!("answer SDP: {e}")))?;
        self.pc.set_remote_description(answer).await?;
        Ok(())
    }

    /// Add a remote ICE candidate. Duplicates are additive and harmless.
    pub async fn add_ice_candidate(&self, payload: IceCandidatePayload) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: payload.candidate,
            sdp_mid: payload.sdp_mid,
            sdp_mline_index: payload.sdp_mline_index,
            ..Default::default()
        };
        self.pc.add_ice_candidate(init).await?;
        debug!("ICE candidate added");
        Ok(())
    }

    /// Write one encoded frame to the video track. Empty samples are
    /// skipped — the encoder is allowed to batch internally.
    pub async fn write_video_sample(&self, data: Vec<u8>, duration: Duration) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.video_track
            .write_sample(&webrtc::media::Sample {
                data: bytes::Bytes::from(data),
                duration,
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.pc.connection_state() == RTCPeerConnectionState::Connected
    }

    /// Watch channel flipping on connected / not-connected transitions.
    pub fn connected_watch(&self) -> watch::Receiver<bool> {
        self.connected_rx.clone()
    }

    /// Close the peer connection; cascades to track and channel closure.
    pub async fn close(&self) -> Result<()> {
        {
            let mut dc = self.data_channel.lock().await;
            if let Some(dc) = dc.take() {
                let _ = dc.close().await;
            }
        }
        self.pc.close().await?;
        info!("Peer connection closed");
        Ok(())
    }
}
