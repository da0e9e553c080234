//! Session lifecycle and wiring.
//!
//! The manager polls the rendezvous server for pending sessions and
//! enforces the single-active-session invariant by stopping the current
//! session before starting a replacement. Each session owns a signal
//! client, a frame source, an input injector and a peer connection, and
//! runs two tasks: the signalling loop (poll + dispatch every 5 s) and
//! the frame delivery pump.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tether_protocol::{
    Capabilities, ControlEvent, IceCandidatePayload, IceServerInfo, MouseEvent,
    PendingSessionResponse, SessionDescriptor, SessionSdp, SessionStatus, SignalEnvelope,
    SignalKind, VideoConfig,
};

use crate::capture::{MonitorSelection, ScreenCapture};
use crate::encoder::{Encoder, ENCODE_HEIGHT, ENCODE_WIDTH};
use crate::error::{AgentError, Result};
use crate::frame::{scale_rgba, Frame};
use crate::input::InputInjector;
use crate::peer::PeerSession;
use crate::signal::SignalClient;

const PENDING_POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// One remote-control session and everything it owns.
pub struct Session {
    pub id: String,
    pub asset_id: String,
    pub org_id: String,
    status: std::sync::RwLock<SessionStatus>,
    cancel: CancellationToken,
    ended: AtomicBool,
    signal: Arc<SignalClient>,
    capture: Arc<ScreenCapture>,
    peer: Arc<PeerSession>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub fn status(&self) -> SessionStatus {
        *self.status.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set_status(&self, status: SessionStatus) {
        *self.status.write().unwrap_or_else(|e| e.into_inner()) = status;
    }

    /// Tear the session down. Order matters: stop the pump first, which
    /// drops the encoder it owns; then close the peer (cascades to track
    /// and channel); then the frame source; finally clear the signal
    /// buffer on the server. Idempotent.
    pub async fn shutdown(&self) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(session = %self.id, "Stopping session");
        self.cancel.cancel();

        let pump = self.pump.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(pump) = pump {
            if pump.await.is_err() {
                warn!(session = %self.id, "Frame pump panicked");
            }
        }

        if let Err(e) = self.peer.close().await {
            warn!(session = %self.id, "Peer close: {e}");
        }
        self.capture.stop();
        if let Err(e) = self.signal.clear().await {
            warn!(session = %self.id, "Signal clear: {e}");
        }

        self.set_status(SessionStatus::Ended);
        info!(session = %self.id, "Session ended");
    }

    /// Apply one polled signal. Malformed payloads and individual
    /// candidate failures never terminate the session.
    async fn dispatch_signal(&self, envelope: SignalEnvelope) {
        match envelope.kind {
            SignalKind::Offer => {
                let offer: SessionSdp = match serde_json::from_value(envelope.data) {
                    Ok(sdp) => sdp,
                    Err(e) => {
                        warn!(session = %self.id, "Invalid offer payload: {e}");
                        return;
                    }
                };
                let answer = match self.peer.handle_offer(&offer.sdp).await {
                    Ok(sdp) => sdp,
                    Err(e) => {
                        warn!(session = %self.id, "Failed to apply offer: {e}");
                        return;
                    }
                };
                let payload = SessionSdp {
                    kind: "answer".to_string(),
                    sdp: answer,
                };
                let value = match serde_json::to_value(&payload) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(session = %self.id, "Failed to encode answer: {e}");
                        return;
                    }
                };
                match self.signal.send(SignalKind::Answer, value).await {
                    Ok(()) => info!(session = %self.id, "Answer sent to operator"),
                    Err(e) => warn!(session = %self.id, "Failed to send answer: {e}"),
                }
            }
            SignalKind::IceCandidate => {
                let candidate: IceCandidatePayload = match serde_json::from_value(envelope.data) {
                    Ok(candidate) => candidate,
                    Err(e) => {
                        warn!(session = %self.id, "Invalid ICE candidate payload: {e}");
                        return;
                    }
                };
                if let Err(e) = self.peer.add_ice_candidate(candidate).await {
                    warn!(session = %self.id, "Failed to add ICE candidate: {e}");
                }
            }
            SignalKind::Answer => {
                let answer: SessionSdp = match serde_json::from_value(envelope.data) {
                    Ok(sdp) => sdp,
                    Err(e) => {
                        warn!(session = %self.id, "Invalid answer payload: {e}");
                        return;
                    }
                };
                if let Err(e) = self.peer.apply_answer(&answer.sdp).await {
                    warn!(session = %self.id, "Failed to apply answer: {e}");
                }
            }
        }
    }
}

/// Handles pending-session discovery and owns the session registry.
pub struct SessionManager {
    server_url: String,
    display: String,
    http: reqwest::Client,
    video: VideoConfig,
    signal_poll: Duration,
    ice_servers: Vec<IceServerInfo>,
    capabilities: Capabilities,
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
}

impl SessionManager {
    pub fn new(
        server_url: &str,
        display: &str,
        video: VideoConfig,
        signal_poll: Duration,
        ice_servers: Vec<IceServerInfo>,
    ) -> Self {
        let capabilities = Capabilities {
            remote_control: true,
            screen_capture: cfg!(target_os = "linux"),
            input_injection: cfg!(target_os = "linux"),
            webrtc_supported: true,
            platform: std::env::consts::OS.to_string(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
        };
        Self {
            server_url: server_url.trim_end_matches('/').to_string(),
            display: display.to_string(),
            http: reqwest::Client::new(),
            video,
            signal_poll,
            ice_servers,
            capabilities,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// The immutable capabilities record advertised via telemetry.
    pub fn snapshot_capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    /// The session whose peer is connected, if any. At most one session
    /// is active at any time.
    pub async fn active_session(&self) -> Option<Arc<Session>> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .find(|s| s.status() == SessionStatus::Active)
            .cloned()
    }

    /// One pending-session poll tick. A new session id replaces the
    /// current session (stop, then start); a known id is a no-op.
    pub async fn poll_pending(&self, agent_credential: &str) {
        let resp = self
            .http
            .get(format!("{}/api/agent/rc/poll", self.server_url))
            .timeout(PENDING_POLL_TIMEOUT)
            .bearer_auth(agent_credential)
            .send()
            .await;
        let resp = match resp {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                debug!(status = %resp.status(), "Pending-session poll rejected");
                return;
            }
            Err(e) => {
                // Routine connectivity hiccups; retried next tick.
                debug!("Pending-session poll failed: {e}");
                return;
            }
        };

        let body: PendingSessionResponse = match resp.json().await {
            Ok(body) => body,
            Err(e) => {
                warn!("Failed to decode pending-session response: {e}");
                return;
            }
        };
        let descriptor = match body.session {
            Some(descriptor) if body.success && !descriptor.session_id.is_empty() => descriptor,
            _ => return,
        };

        if self.sessions.read().await.contains_key(&descriptor.session_id) {
            return;
        }

        self.supersede_sessions(&descriptor.session_id).await;

        if let Err(e) = self.start_session(descriptor).await {
            warn!("Failed to start session: {e}");
        }
    }

    /// Stop every registered session in favour of `new_id`, connected or
    /// not. This is also the only path that reclaims a session that
    /// never reached connected.
    async fn supersede_sessions(&self, new_id: &str) {
        let stale: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for id in stale {
            info!(old = %id, new = %new_id, "Replacing session");
            if let Err(e) = self.stop_session(&id).await {
                warn!("Failed to stop session {id}: {e}");
            }
        }
    }

    /// Create a session's components, wire them together, and launch its
    /// tasks. Registry updates happen under the write lock, so start and
    /// stop are atomic with respect to each other.
    pub async fn start_session(&self, descriptor: SessionDescriptor) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&descriptor.session_id) {
            return Err(AgentError::State(format!(
                "session {} already exists",
                descriptor.session_id
            )));
        }
        let id = descriptor.session_id.clone();
        info!(session = %id, asset = %descriptor.asset_id, "Starting remote control session");

        let cancel = CancellationToken::new();
        let signal = Arc::new(SignalClient::new(
            self.http.clone(),
            &self.server_url,
            &id,
            &descriptor.token,
        ));
        let capture = Arc::new(ScreenCapture::new(&self.display, self.video.framerate));
        let injector = Arc::new(Mutex::new(InputInjector::new(&self.display)));
        let peer = Arc::new(PeerSession::new(&self.ice_servers).await?);

        // Outbound ICE candidates flow through a channel to keep the
        // peer → signal-client reference non-owning; the session owns
        // both and tears the peer down first.
        let (ice_tx, mut ice_rx) = mpsc::channel::<IceCandidatePayload>(32);
        peer.set_signal_sink(ice_tx);
        {
            let signal = Arc::clone(&signal);
            let cancel = cancel.clone();
            let id = id.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        payload = ice_rx.recv() => {
                            let Some(payload) = payload else { break };
                            let value = match serde_json::to_value(&payload) {
                                Ok(value) => value,
                                Err(e) => {
                                    warn!(session = %id, "Failed to encode ICE candidate: {e}");
                                    continue;
                                }
                            };
                            if let Err(e) = signal.send(SignalKind::IceCandidate, value).await {
                                warn!(session = %id, "Failed to send ICE candidate: {e}");
                            }
                        }
                    }
                }
            });
        }

        // Inbound control events drive the injector, and for monitor
        // changes the frame source and remap context together.
        {
            let capture = Arc::clone(&capture);
            let injector = Arc::clone(&injector);
            peer.on_control_event(move |event| dispatch_control(&capture, &injector, event));
        }

        let frame_rx = match capture.start() {
            Ok(frame_rx) => frame_rx,
            Err(e) => {
                cancel.cancel();
                let _ = peer.close().await;
                return Err(e);
            }
        };
        {
            let injector = injector.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = injector.set_monitor_info(capture.selection(), capture.monitors()) {
                warn!(session = %id, "Failed to seed input remap context: {e}");
            }
        }

        let encoder = match Encoder::new(
            ENCODE_WIDTH,
            ENCODE_HEIGHT,
            self.video.framerate,
            self.video.bitrate,
        ) {
            Ok(encoder) => encoder,
            Err(e) => {
                error!(session = %id, "Encoder init failed: {e}");
                cancel.cancel();
                let _ = peer.close().await;
                capture.stop();
                return Err(AgentError::State("codec unavailable".into()));
            }
        };

        let pump = tokio::spawn(run_pump(
            frame_rx,
            encoder,
            Arc::clone(&peer),
            cancel.clone(),
            self.video.framerate,
        ));

        let session = Arc::new(Session {
            id: id.clone(),
            asset_id: descriptor.asset_id,
            org_id: descriptor.org_id,
            status: std::sync::RwLock::new(SessionStatus::Pending),
            cancel,
            ended: AtomicBool::new(false),
            signal,
            capture,
            peer,
            pump: Mutex::new(Some(pump)),
        });

        sessions.insert(id.clone(), Arc::clone(&session));
        drop(sessions);

        tokio::spawn(run_session(
            session,
            Arc::clone(&self.sessions),
            self.signal_poll,
        ));
        Ok(())
    }

    /// Remove the session from the registry and tear it down.
    pub async fn stop_session(&self, id: &str) -> Result<()> {
        let session = self
            .sessions
            .write()
            .await
            .remove(id)
            .ok_or_else(|| AgentError::State(format!("session {id} not found")))?;
        session.shutdown().await;
        Ok(())
    }

    /// Stop every session; used at process shutdown.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.stop_session(&id).await {
                warn!("Failed to stop session {id}: {e}");
            }
        }
    }
}

/// The per-session loop: a 5-second signalling tick plus peer state
/// transitions, exiting on cancellation or peer disconnect.
async fn run_session(
    session: Arc<Session>,
    registry: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    signal_poll: Duration,
) {
    let mut tick = tokio::time::interval(signal_poll);
    let mut connected_rx = session.peer.connected_watch();
    let mut was_connected = false;

    loop {
        tokio::select! {
            _ = session.cancel.cancelled() => {
                debug!(session = %session.id, "Session cancelled");
                break;
            }
            _ = tick.tick() => {
                match session.signal.poll().await {
                    Ok(messages) => {
                        // Server-sorted by timestamp; applied in order.
                        for envelope in messages {
                            session.dispatch_signal(envelope).await;
                        }
                    }
                    Err(e) => {
                        // Transient transport errors never terminate a
                        // session; retried on the next tick.
                        warn!(session = %session.id, "Signalling poll: {e}");
                    }
                }
            }
            changed = connected_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let connected = *connected_rx.borrow();
                if connected && !was_connected {
                    was_connected = true;
                    session.set_status(SessionStatus::Active);
                    info!(session = %session.id, "Session is now active");
                } else if !connected && was_connected {
                    info!(session = %session.id, "Peer disconnected, ending session");
                    break;
                }
            }
        }
    }

    session.shutdown().await;
    registry.write().await.remove(&session.id);
}

/// The frame delivery pump: dequeue → (rescale) → encode → write sample.
/// Runs until cancellation, the frame queue closing, or a fatal encoder
/// error, which tears the session down via the cancellation token. The
/// encoder is owned here and dropped when the pump exits.
async fn run_pump(
    mut frame_rx: mpsc::Receiver<Frame>,
    mut encoder: Encoder,
    peer: Arc<PeerSession>,
    cancel: CancellationToken,
    framerate: u32,
) {
    let frame_duration = Duration::from_secs(1) / framerate;
    let mut frame_index: u64 = 0;
    let mut was_connected = false;
    let mut discarded: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frame_rx.recv() => {
                let Some(frame) = frame else {
                    debug!("Frame queue closed, pump exiting");
                    break;
                };

                if !peer.is_connected() {
                    was_connected = false;
                    discarded += 1;
                    if discarded == 1 || discarded % 300 == 0 {
                        debug!(discarded, "Discarding frame (peer not connected)");
                    }
                    continue;
                }

                if !was_connected {
                    was_connected = true;
                    // Fresh decoder on the operator side; don't make it
                    // wait out the keyframe interval.
                    encoder.force_keyframe();
                    info!(discarded_before_connect = discarded, "Peer connected, pump delivering");
                }

                let scaled = if frame.width == ENCODE_WIDTH && frame.height == ENCODE_HEIGHT {
                    frame
                } else {
                    scale_rgba(&frame, ENCODE_WIDTH, ENCODE_HEIGHT)
                };

                match encoder.encode(&scaled.data, frame_index) {
                    Ok(data) => {
                        frame_index += 1;
                        if let Err(e) = peer.write_video_sample(data, frame_duration).await {
                            debug!("Write video sample: {e}");
                        }
                    }
                    Err(e) => {
                        error!("Encoder failure, tearing session down: {e}");
                        cancel.cancel();
                        break;
                    }
                }
            }
        }
    }
    debug!("Frame pump exited");
}

/// Route one control event. Monitor changes update the frame source and
/// the remap context as a single logical action: the selection is
/// validated up front, and a rejected change leaves both untouched.
fn dispatch_control(
    capture: &Arc<ScreenCapture>,
    injector: &Arc<Mutex<InputInjector>>,
    event: ControlEvent,
) {
    match event {
        ControlEvent::Mouse(MouseEvent::Move { x, y }) => {
            let mut injector = injector.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = injector.inject_mouse_move(x, y) {
                warn!("Mouse move inject: {e}");
            }
        }
        ControlEvent::Mouse(MouseEvent::Button { button, down }) => {
            let mut injector = injector.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = injector.inject_mouse_button(button, down) {
                warn!("Mouse button inject: {e}");
            }
        }
        ControlEvent::Mouse(MouseEvent::Scroll { delta_x, delta_y }) => {
            let mut injector = injector.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = injector.inject_mouse_scroll(delta_x, delta_y) {
                warn!("Scroll inject: {e}");
            }
        }
        ControlEvent::Keyboard { key, down } => {
            let mut injector = injector.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = injector.inject_key(&key, down) {
                warn!("Key inject: {e}");
            }
        }
        ControlEvent::Monitor { monitor_index } => {
            let Some(selection) = MonitorSelection::from_index(monitor_index) else {
                warn!(monitor_index, "Rejecting invalid monitor selection");
                return;
            };
            if !capture.monitors().contains(selection) {
                warn!(monitor_index, "Rejecting out-of-range monitor selection");
                return;
            }
            if let Err(e) = capture.set_monitor(selection) {
                warn!("Monitor change failed, selection preserved: {e}");
                return;
            }
            let injector = injector.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = injector.set_monitor_info(selection, capture.monitors()) {
                warn!("Failed to update input remap context: {e}");
            }
            info!(monitor_index, "Monitor selection changed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_manager() -> SessionManager {
        SessionManager::new(
            "http://localhost:9002",
            ":99",
            VideoConfig {
                bitrate: 5000,
                framerate: 30,
            },
            Duration::from_secs(5),
            Vec::new(),
        )
    }

    async fn bare_session(manager: &SessionManager, id: &str) -> Arc<Session> {
        let signal = Arc::new(SignalClient::new(
            manager.http.clone(),
            &manager.server_url,
            id,
            "T",
        ));
        let capture = Arc::new(ScreenCapture::new(":99", 30));
        let peer = Arc::new(PeerSession::new(&[]).await.unwrap());
        Arc::new(Session {
            id: id.to_string(),
            asset_id: "A".to_string(),
            org_id: "O".to_string(),
            status: std::sync::RwLock::new(SessionStatus::Pending),
            cancel: CancellationToken::new(),
            ended: AtomicBool::new(false),
            signal,
            capture,
            peer,
            pump: Mutex::new(None),
        })
    }

    #[test]
    fn capabilities_snapshot_is_stable() {
        let manager = test_manager();
        let a = manager.snapshot_capabilities();
        let b = manager.snapshot_capabilities();
        assert!(a.remote_control);
        assert!(a.webrtc_supported);
        assert_eq!(a.platform, b.platform);
        assert_eq!(a.agent_version, env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn active_session_ignores_pending_sessions() {
        let manager = test_manager();
        let s1 = bare_session(&manager, "S1").await;
        let s2 = bare_session(&manager, "S2").await;
        manager.sessions.write().await.insert("S1".into(), s1);
        manager.sessions.write().await.insert("S2".into(), Arc::clone(&s2));

        assert!(manager.active_session().await.is_none());

        s2.set_status(SessionStatus::Active);
        let active = manager.active_session().await.unwrap();
        assert_eq!(active.id, "S2");
    }

    #[tokio::test]
    async fn stop_session_removes_and_ends() {
        let manager = test_manager();
        let s1 = bare_session(&manager, "S1").await;
        manager
            .sessions
            .write()
            .await
            .insert("S1".into(), Arc::clone(&s1));

        manager.stop_session("S1").await.unwrap();
        assert!(manager.sessions.read().await.is_empty());
        assert_eq!(s1.status(), SessionStatus::Ended);
    }

    #[tokio::test]
    async fn supersede_stops_pending_sessions_too() {
        let manager = test_manager();
        let pending = bare_session(&manager, "S1").await;
        let active = bare_session(&manager, "S2").await;
        active.set_status(SessionStatus::Active);
        manager
            .sessions
            .write()
            .await
            .insert("S1".into(), Arc::clone(&pending));
        manager
            .sessions
            .write()
            .await
            .insert("S2".into(), Arc::clone(&active));

        manager.supersede_sessions("S3").await;

        assert!(manager.sessions.read().await.is_empty());
        assert_eq!(pending.status(), SessionStatus::Ended);
        assert_eq!(active.status(), SessionStatus::Ended);
    }

    #[tokio::test]
    async fn stop_unknown_session_is_a_state_error() {
        let manager = test_manager();
        assert!(matches!(
            manager.stop_session("nope").await,
            Err(AgentError::State(_))
        ));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let manager = test_manager();
        let s1 = bare_session(&manager, "S1").await;
        s1.shutdown().await;
        s1.shutdown().await;
        assert_eq!(s1.status(), SessionStatus::Ended);
    }
}
