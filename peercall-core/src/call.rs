//! Call state machine
//!
//! [`CallEngine`] owns the single call slot and drives everything else: media
//! acquisition, description shaping, the adaptive quality timer and the
//! pending-request timeout. Every entry point (local API calls, signaling
//! messages, connection-layer callbacks, timer ticks) takes the same lock, so
//! transitions never interleave even across suspension points.
//!
//! ```text
//!     Idle ──initiate──► PendingOutgoing ──call-accepted──► Negotiating ──answer──► Active
//!      │                       │ 30s: call-cancel               ▲   │
//!      │ call-request/offer    ▼                                │   │ offer (callee answers,
//!      └──────────────► PendingIncoming ──accept────────────────┘   │  then `connected`)
//!                                                                     ▼
//!   any phase ── rejected / cancel / end / hang-up / transport lost ──► Idle
//! ```
//!
//! Only the caller ever sends offers. Once active, the adaptive controller may
//! ask the caller's engine to renegotiate when the opus parameters of the
//! selected audio profile differ from the negotiated ones; the callee only
//! adjusts its sender bitrate and waits.

use crate::config::{CallEngineConfig, ConfigError};
use crate::events::{CallEvent, EventNotifier, NoticeSeverity};
use crate::identity::PeerIdentity;
use crate::media::{Acquisition, CaptureProvider, MediaAcquirer, MediaError, TrackSource};
use crate::peer::{
    is_terminal_connection_state, OfferOptions, PeerLink, PeerLinkError, PeerLinkProvider,
    SessionDescription,
};
use crate::quality::{AdaptiveController, ProfileSwitch, QualitySnapshot};
use crate::sdp::{self, DEFAULT_OPUS_FMTP};
use crate::session::{CallSession, RemoteTrack, SessionSnapshot};
use crate::signaling::{SignalingHandler, SignalingMessage, SignalingTransport};
use crate::stats::NetworkSample;
use crate::types::{CallId, CallPhase, CallRole, EndReason, MediaKind, MediaMode, RejectReason};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

/// Call management errors
#[derive(Error, Debug, Clone)]
pub enum CallError {
    /// A session already exists
    #[error("A call is already in progress")]
    Busy,

    /// No session exists
    #[error("No call in progress")]
    NoSession,

    /// The session is in the wrong phase for this operation
    #[error("Invalid call state: expected {expected}, found {actual:?}")]
    InvalidState {
        /// Phase the operation needs
        expected: &'static str,
        /// Phase the session is in
        actual: CallPhase,
    },

    /// The connection layer has no link to the peer
    #[error("Peer not connected: {0}")]
    PeerNotConnected(String),

    /// A signaling message could not be sent or received
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// Local capture failed
    #[error(transparent)]
    Media(#[from] MediaError),

    /// Description exchange failed
    #[error("Negotiation failed: {0}")]
    Negotiation(#[from] PeerLinkError),

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The local media has no track of this kind
    #[error("No local {0} track")]
    TrackUnavailable(MediaKind),
}

struct EngineState<I: PeerIdentity> {
    session: Option<CallSession<I>>,
    quality: AdaptiveController<I>,
}

struct EngineInner<T: SignalingTransport> {
    signaling: Arc<SignalingHandler<T>>,
    links: Arc<dyn PeerLinkProvider<T::PeerId>>,
    acquirer: MediaAcquirer,
    config: CallEngineConfig,
    notifier: EventNotifier<T::PeerId>,
    state: Mutex<EngineState<T::PeerId>>,
}

/// Call negotiation and adaptive quality engine
///
/// Cheap to clone; clones share the same session.
pub struct CallEngine<T: SignalingTransport> {
    inner: Arc<EngineInner<T>>,
}

impl<T: SignalingTransport> Clone for CallEngine<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: SignalingTransport> CallEngine<T> {
    /// Create a builder
    #[must_use]
    pub fn builder(
        signaling: Arc<SignalingHandler<T>>,
        capture: Arc<dyn CaptureProvider>,
        links: Arc<dyn PeerLinkProvider<T::PeerId>>,
    ) -> CallEngineBuilder<T> {
        CallEngineBuilder::new(signaling, capture, links)
    }

    /// Subscribe to call and quality events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent<T::PeerId>> {
        self.inner.notifier.subscribe()
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &CallEngineConfig {
        &self.inner.config
    }

    /// Current phase, `Idle` when there is no session
    pub async fn phase(&self) -> CallPhase {
        let state = self.inner.state.lock().await;
        state.session.as_ref().map_or(CallPhase::Idle, |s| s.phase)
    }

    /// Snapshot of the current session
    pub async fn session(&self) -> Option<SessionSnapshot<T::PeerId>> {
        let state = self.inner.state.lock().await;
        state.session.as_ref().map(CallSession::snapshot)
    }

    /// Adaptive state of `peer`
    pub async fn quality_snapshot(&self, peer: &T::PeerId) -> Option<QualitySnapshot> {
        let state = self.inner.state.lock().await;
        state.quality.snapshot(peer)
    }

    /// Number of live timer tasks (request timeout and quality checks)
    pub async fn scheduled_timers(&self) -> usize {
        let state = self.inner.state.lock().await;
        let timeout = state
            .session
            .as_ref()
            .and_then(|s| s.pending_timeout.as_ref())
            .map_or(0, |t| usize::from(!t.is_finished()));
        timeout + state.quality.timer_count()
    }

    /// Call `peer`
    ///
    /// Sends `call-request` and waits for the callee. The request is cancelled
    /// automatically when no answer arrives within the configured timeout.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Busy`] if a session exists, [`CallError::PeerNotConnected`]
    /// if the connection layer has no link to `peer`, or a signaling error
    #[tracing::instrument(skip(self), fields(peer = %peer, mode = %mode))]
    pub async fn initiate_call(&self, peer: T::PeerId, mode: MediaMode) -> Result<CallId, CallError> {
        let mut state = self.inner.state.lock().await;
        if let Some(existing) = &state.session {
            tracing::warn!(current_peer = %existing.peer, phase = ?existing.phase, "Cannot start a call while another is in progress");
            return Err(CallError::Busy);
        }
        let link = self
            .inner
            .links
            .link(&peer)
            .ok_or_else(|| CallError::PeerNotConnected(peer.to_string_repr()))?;

        let mut session = CallSession::new(peer.clone(), CallRole::Caller, mode, CallPhase::Idle);
        session.link = Some(link);
        session.set_phase(CallPhase::PendingOutgoing);
        let call_id = session.id;

        self.send(
            &peer,
            SignalingMessage::CallRequest {
                audio_only: mode.is_audio_only(),
                is_screen_share: mode.is_screen_share(),
            },
        )
        .await?;

        session.pending_timeout = Some(self.spawn_request_timeout(call_id));
        state.session = Some(session);
        self.inner.notifier.publish(CallEvent::Requested { peer, mode });
        tracing::info!(call_id = %call_id, "Call requested");
        Ok(call_id)
    }

    /// Accept the pending incoming call
    ///
    /// Acquires local media and sends `call-accepted`. If the caller's offer
    /// already arrived it is answered right away.
    ///
    /// # Errors
    ///
    /// Returns error if there is no pending incoming call, no link to the
    /// caller, no usable capture device, or the held offer cannot be answered
    #[tracing::instrument(skip(self))]
    pub async fn accept_call(&self) -> Result<(), CallError> {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        let (peer, mode) = match &state.session {
            Some(s) if s.phase == CallPhase::PendingIncoming => (s.peer.clone(), s.mode),
            Some(s) => {
                return Err(CallError::InvalidState {
                    expected: "pending incoming",
                    actual: s.phase,
                })
            }
            None => return Err(CallError::NoSession),
        };

        let Some(link) = self.inner.links.link(&peer) else {
            self.inner.notifier.notice(
                Some(&peer),
                NoticeSeverity::Error,
                "Connection to the caller was lost",
            );
            self.teardown(state, EndReason::ConnectionLost).await;
            return Err(CallError::PeerNotConnected(peer.to_string_repr()));
        };

        if let Some(session) = state.session.as_mut() {
            session.link = Some(link);
            session.set_phase(CallPhase::Negotiating);
        }

        let acquisition = match self.inner.acquirer.acquire(mode, CallRole::Callee).await {
            Ok(acquisition) => acquisition,
            Err(e) => {
                self.inner.notifier.notice(
                    Some(&peer),
                    NoticeSeverity::Error,
                    "Could not access camera or microphone",
                );
                let reject = SignalingMessage::CallRejected {
                    reason: RejectReason::DeviceError,
                };
                if let Err(send_err) = self.send(&peer, reject).await {
                    tracing::warn!(error = %send_err, "Failed to send device error rejection");
                }
                self.teardown(state, EndReason::DeviceError).await;
                return Err(e.into());
            }
        };

        if let Err(err) = self.install_media(state, acquisition).await {
            self.fail_negotiation(state, &err).await;
            return Err(err);
        }

        let Some(session) = state.session.as_mut() else {
            return Err(CallError::NoSession);
        };
        let accepted = SignalingMessage::CallAccepted {
            audio_only: session.advertised_audio_only(),
            is_screen_share: mode.is_screen_share(),
        };
        let pending_offer = session.pending_offer.take();
        if let Err(err) = self.send(&peer, accepted).await {
            self.teardown(state, EndReason::ConnectionLost).await;
            return Err(err);
        }
        tracing::info!("Call accepted");

        if let Some(offer) = pending_offer {
            if let Err(err) = self.answer_offer(state, offer).await {
                self.fail_negotiation(state, &err).await;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Decline the pending incoming call
    ///
    /// # Errors
    ///
    /// Returns error if there is no pending incoming call
    #[tracing::instrument(skip(self))]
    pub async fn reject_call(&self) -> Result<(), CallError> {
        let mut state = self.inner.state.lock().await;
        let peer = match &state.session {
            Some(s) if s.phase == CallPhase::PendingIncoming => s.peer.clone(),
            Some(s) => {
                return Err(CallError::InvalidState {
                    expected: "pending incoming",
                    actual: s.phase,
                })
            }
            None => return Err(CallError::NoSession),
        };
        let reject = SignalingMessage::CallRejected {
            reason: RejectReason::UserRejected,
        };
        if let Err(e) = self.send(&peer, reject).await {
            tracing::warn!(error = %e, "Failed to send rejection");
        }
        self.teardown(&mut state, EndReason::LocalRejected).await;
        Ok(())
    }

    /// End the current call from this side
    ///
    /// Sends `call-end` and tears the session down. The peer connection
    /// itself is left to the connection layer.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NoSession`] when there is nothing to end
    #[tracing::instrument(skip(self))]
    pub async fn hang_up(&self) -> Result<(), CallError> {
        let mut state = self.inner.state.lock().await;
        let peer = state
            .session
            .as_ref()
            .map(|s| s.peer.clone())
            .ok_or(CallError::NoSession)?;
        if let Err(e) = self.send(&peer, SignalingMessage::CallEnd).await {
            tracing::warn!(error = %e, "Failed to send call-end");
        }
        self.teardown(&mut state, EndReason::LocalHangUp).await;
        Ok(())
    }

    /// Flip the microphone mute state
    ///
    /// Returns the new muted state.
    ///
    /// # Errors
    ///
    /// Returns error when no media is flowing or there is no audio track
    pub async fn toggle_audio(&self) -> Result<bool, CallError> {
        let mut state = self.inner.state.lock().await;
        let session = media_session(&mut state)?;
        let track = session
            .local_media
            .as_ref()
            .and_then(|m| m.audio_track())
            .ok_or(CallError::TrackUnavailable(MediaKind::Audio))?;
        session.muted = !session.muted;
        track.set_enabled(!session.muted);
        tracing::info!(muted = session.muted, "Microphone toggled");
        Ok(session.muted)
    }

    /// Flip the local video state
    ///
    /// Returns whether video is now enabled.
    ///
    /// # Errors
    ///
    /// Returns error when no media is flowing or there is no video track
    pub async fn toggle_camera(&self) -> Result<bool, CallError> {
        let mut state = self.inner.state.lock().await;
        let session = media_session(&mut state)?;
        let track = session
            .local_media
            .as_ref()
            .and_then(|m| m.video_track())
            .ok_or(CallError::TrackUnavailable(MediaKind::Video))?;
        session.video_enabled = !session.video_enabled;
        track.set_enabled(session.video_enabled);
        tracing::info!(video_enabled = session.video_enabled, "Camera toggled");
        Ok(session.video_enabled)
    }

    /// Dispatch one signaling message
    ///
    /// # Errors
    ///
    /// Returns error only when a reply could not be sent; protocol violations
    /// are logged and ignored
    #[tracing::instrument(skip(self, message), fields(peer = %peer, message_type = message.kind_name()))]
    pub async fn handle_message(
        &self,
        peer: T::PeerId,
        message: SignalingMessage,
    ) -> Result<(), CallError> {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        match message {
            SignalingMessage::CallRequest {
                audio_only,
                is_screen_share,
            } => {
                self.on_call_request(state, peer, MediaMode::from_flags(audio_only, is_screen_share))
                    .await
            }
            SignalingMessage::CallAccepted { audio_only, .. } => {
                self.on_call_accepted(state, &peer, audio_only).await;
                Ok(())
            }
            SignalingMessage::CallRejected { reason } => {
                self.on_remote_end(state, &peer, EndReason::RemoteRejected(reason))
                    .await;
                Ok(())
            }
            SignalingMessage::CallCancel => {
                self.on_remote_end(state, &peer, EndReason::RemoteCancelled).await;
                Ok(())
            }
            SignalingMessage::CallEnd => {
                self.on_remote_end(state, &peer, EndReason::RemoteEnded).await;
                Ok(())
            }
            SignalingMessage::Offer {
                sdp,
                audio_only,
                is_screen_share,
            } => {
                self.on_offer(state, peer, sdp, MediaMode::from_flags(audio_only, is_screen_share))
                    .await;
                Ok(())
            }
            SignalingMessage::Answer { sdp, .. } => {
                self.on_answer(state, &peer, sdp).await;
                Ok(())
            }
        }
    }

    /// Connection-layer state change for `peer`
    ///
    /// `connected` promotes a callee whose exchange completed to `Active`.
    /// Closed, failed and disconnected end the session without any message.
    #[tracing::instrument(skip(self), fields(peer = %peer))]
    pub async fn handle_connection_state(&self, peer: &T::PeerId, connection: RTCPeerConnectionState) {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        let Some(session) = state.session.as_mut().filter(|s| &s.peer == peer) else {
            return;
        };

        if connection == RTCPeerConnectionState::Connected {
            if session.phase == CallPhase::Negotiating && session.exchange_complete {
                self.activate(session);
            }
        } else if is_terminal_connection_state(connection)
            && matches!(session.phase, CallPhase::Negotiating | CallPhase::Active)
        {
            tracing::info!(connection = ?connection, "Connection lost, ending call");
            self.teardown(state, EndReason::ConnectionLost).await;
        }
    }

    /// A local capture track stopped on its own
    ///
    /// When the display capture of a screen share ends the call is hung up.
    #[tracing::instrument(skip(self))]
    pub async fn handle_local_track_ended(&self, track_id: &str) {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        let Some(session) = state.session.as_ref() else {
            return;
        };
        let source = session
            .local_media
            .as_ref()
            .and_then(|m| m.find(track_id))
            .map(|t| t.source());
        if source != Some(TrackSource::Display) {
            tracing::debug!(source = ?source, "Local track ended");
            return;
        }

        let peer = session.peer.clone();
        tracing::info!("Screen capture stopped, hanging up");
        if let Err(e) = self.send(&peer, SignalingMessage::CallEnd).await {
            tracing::warn!(error = %e, "Failed to send call-end");
        }
        self.teardown(state, EndReason::LocalHangUp).await;
    }

    /// A remote track was received
    pub async fn handle_remote_track(&self, peer: &T::PeerId, track: RemoteTrack) {
        let mut state = self.inner.state.lock().await;
        if let Some(session) = state.session.as_mut().filter(|s| &s.peer == peer) {
            if !session.remote_media.iter().any(|t| t.id == track.id) {
                tracing::debug!(track_id = %track.id, kind = %track.kind, "Remote track added");
                session.remote_media.push(track);
            }
        }
    }

    /// A remote track ended
    ///
    /// On the viewing side of a screen share the end of the remote video
    /// means the sharer stopped, which ends the call without a message.
    #[tracing::instrument(skip(self), fields(peer = %peer))]
    pub async fn handle_remote_track_ended(&self, peer: &T::PeerId, track_id: &str) {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        let Some(session) = state.session.as_mut().filter(|s| &s.peer == peer) else {
            return;
        };
        let Some(position) = session.remote_media.iter().position(|t| t.id == track_id) else {
            return;
        };
        let track = session.remote_media.remove(position);
        let share_ended = track.kind == MediaKind::Video
            && session.mode.is_screen_share()
            && session.role == CallRole::Callee
            && matches!(session.phase, CallPhase::Negotiating | CallPhase::Active);
        if share_ended {
            self.inner.notifier.notice(
                Some(peer),
                NoticeSeverity::Info,
                "The other side stopped sharing their screen",
            );
            self.teardown(state, EndReason::RemoteShareEnded).await;
        }
    }

    /// Pump the signaling handler until the transport fails
    ///
    /// # Errors
    ///
    /// Returns the receive error that stopped the loop
    pub async fn run(&self) -> Result<(), CallError> {
        loop {
            let (peer, message) = self
                .inner
                .signaling
                .receive_message()
                .await
                .map_err(|e| CallError::Signaling(e.to_string()))?;
            if let Err(e) = self.handle_message(peer, message).await {
                tracing::warn!(error = %e, "Failed to handle signaling message");
            }
        }
    }

    async fn send(&self, peer: &T::PeerId, message: SignalingMessage) -> Result<(), CallError> {
        self.inner
            .signaling
            .send_message(peer, message)
            .await
            .map_err(|e| CallError::Signaling(e.to_string()))
    }

    fn activate(&self, session: &mut CallSession<T::PeerId>) {
        session.set_phase(CallPhase::Active);
        tracing::info!(call_id = %session.id, role = ?session.role, "Call active");
        self.inner.notifier.publish(CallEvent::Active {
            peer: session.peer.clone(),
            role: session.role,
        });
    }

    async fn on_call_request(
        &self,
        state: &mut EngineState<T::PeerId>,
        peer: T::PeerId,
        mode: MediaMode,
    ) -> Result<(), CallError> {
        if let Some(existing) = &state.session {
            tracing::info!(current_peer = %existing.peer, "Busy, rejecting incoming call");
            let busy = SignalingMessage::CallRejected {
                reason: RejectReason::Busy,
            };
            return self.send(&peer, busy).await;
        }
        self.ring(state, peer, mode, None);
        Ok(())
    }

    fn ring(
        &self,
        state: &mut EngineState<T::PeerId>,
        peer: T::PeerId,
        mode: MediaMode,
        offer: Option<String>,
    ) {
        let mut session = CallSession::new(peer.clone(), CallRole::Callee, mode, CallPhase::Idle);
        session.pending_offer = offer;
        session.set_phase(CallPhase::PendingIncoming);
        tracing::info!(call_id = %session.id, mode = %mode, "Incoming call");
        state.session = Some(session);
        self.inner.notifier.publish(CallEvent::Ringing { peer, mode });
    }

    async fn on_call_accepted(
        &self,
        state: &mut EngineState<T::PeerId>,
        peer: &T::PeerId,
        remote_audio_only: bool,
    ) {
        let Some(session) = state.session.as_mut().filter(|s| &s.peer == peer) else {
            tracing::warn!("call-accepted without a matching request, ignoring");
            return;
        };
        if session.phase != CallPhase::PendingOutgoing {
            tracing::warn!(phase = ?session.phase, "call-accepted in unexpected phase, ignoring");
            return;
        }
        if let Some(timeout) = session.pending_timeout.take() {
            timeout.abort();
        }
        session.set_phase(CallPhase::Negotiating);
        tracing::info!(remote_audio_only, "Call accepted by peer");
        let mode = session.mode;

        let acquisition = match self.inner.acquirer.acquire(mode, CallRole::Caller).await {
            Ok(acquisition) => acquisition,
            Err(e) => {
                tracing::warn!(error = %e, "Local media unavailable, cancelling call");
                self.inner.notifier.notice(
                    Some(peer),
                    NoticeSeverity::Error,
                    "Could not access camera, microphone or screen",
                );
                if let Err(send_err) = self.send(peer, SignalingMessage::CallCancel).await {
                    tracing::warn!(error = %send_err, "Failed to send call-cancel");
                }
                self.teardown(state, EndReason::DeviceError).await;
                return;
            }
        };

        if let Err(err) = self.install_media(state, acquisition).await {
            self.fail_negotiation(state, &err).await;
            return;
        }
        if let Err(err) = self.send_offer(state).await {
            self.fail_negotiation(state, &err).await;
        }
    }

    async fn on_remote_end(&self, state: &mut EngineState<T::PeerId>, peer: &T::PeerId, reason: EndReason) {
        if state.session.as_ref().map_or(false, |s| &s.peer == peer) {
            tracing::info!(reason = ?reason, "Call ended by peer");
            self.teardown(state, reason).await;
        } else {
            tracing::debug!(reason = ?reason, "End message for no current session, ignoring");
        }
    }

    async fn on_offer(
        &self,
        state: &mut EngineState<T::PeerId>,
        peer: T::PeerId,
        sdp: String,
        mode: MediaMode,
    ) {
        match state.session.as_mut() {
            None => {
                tracing::info!("Offer while idle, treating it as an incoming call");
                self.ring(state, peer, mode, Some(sdp));
                return;
            }
            Some(session) if session.peer != peer => {
                tracing::warn!(current_peer = %session.peer, "Offer from a peer outside the current call, ignoring");
                return;
            }
            Some(session) if session.phase == CallPhase::PendingIncoming => {
                tracing::debug!("Holding offer until the call is accepted");
                session.pending_offer = Some(sdp);
                return;
            }
            Some(session)
                if !matches!(session.phase, CallPhase::Negotiating | CallPhase::Active) =>
            {
                tracing::warn!(phase = ?session.phase, "Offer in unexpected phase, ignoring");
                return;
            }
            Some(_) => {}
        }

        if let Err(err) = self.answer_offer(state, sdp).await {
            self.fail_negotiation(state, &err).await;
        }
    }

    async fn on_answer(&self, state: &mut EngineState<T::PeerId>, peer: &T::PeerId, sdp: String) {
        let Some(session) = state.session.as_ref() else {
            tracing::warn!("Answer without a session, ignoring");
            return;
        };
        let expected = &session.peer == peer
            && session.role == CallRole::Caller
            && matches!(session.phase, CallPhase::Negotiating | CallPhase::Active);
        let link = session.link.clone();
        let Some(link) = link.filter(|_| expected) else {
            tracing::warn!(phase = ?session.phase, role = ?session.role, "Unexpected answer, ignoring");
            return;
        };
        let signaling = link.signaling_state();
        if signaling != RTCSignalingState::HaveLocalOffer {
            tracing::warn!(signaling_state = ?signaling, "Answer without a pending offer, ignoring");
            return;
        }

        if let Err(err) = self.apply_answer(state, link, sdp).await {
            self.fail_negotiation(state, &err).await;
        }
    }

    async fn apply_answer(
        &self,
        state: &mut EngineState<T::PeerId>,
        link: Arc<dyn PeerLink>,
        sdp: String,
    ) -> Result<(), CallError> {
        link.set_remote_description(SessionDescription::answer(sdp)).await?;

        let EngineState { session, quality } = state;
        let session = session.as_mut().ok_or(CallError::NoSession)?;
        session.exchange_complete = true;
        let offered = session.offered_codec_params.take();
        let peer = session.peer.clone();
        if session.phase == CallPhase::Negotiating {
            self.activate(session);
        }

        self.arm_adaptive(quality, &peer, link.as_ref()).await;
        if let Some(params) = offered {
            quality.record_negotiated(&peer, params);
        }
        Ok(())
    }

    async fn answer_offer(&self, state: &mut EngineState<T::PeerId>, sdp: String) -> Result<(), CallError> {
        let EngineState { session, quality } = state;
        let session = session.as_mut().ok_or(CallError::NoSession)?;
        let link = session
            .link
            .clone()
            .ok_or_else(|| CallError::PeerNotConnected(session.peer.to_string_repr()))?;

        let signaling = link.signaling_state();
        if signaling == RTCSignalingState::HaveLocalOffer {
            tracing::warn!("Offer collided with a local offer, ignoring");
            return Ok(());
        }

        link.set_remote_description(SessionDescription::offer(sdp)).await?;
        self.apply_sender_profile(
            link.as_ref(),
            MediaKind::Audio,
            quality.effective_index(&session.peer, MediaKind::Audio),
        )
        .await;
        sdp::shape_transceivers(
            link.as_ref(),
            &self.inner.config.codec_preferences,
            session.sends_video(),
        )
        .await;

        let params = quality
            .desired_codec_params(&session.peer)
            .unwrap_or(DEFAULT_OPUS_FMTP)
            .to_string();
        let raw = link.create_answer().await?;
        let shaped = sdp::apply_audio_codec_params(&raw, &params);
        link.set_local_description(SessionDescription::answer(shaped.clone()))
            .await?;

        let answer = SignalingMessage::Answer {
            sdp: shaped,
            audio_only: session.advertised_audio_only(),
            is_screen_share: session.advertised_screen_share(),
        };
        self.send(&session.peer, answer).await?;
        tracing::info!("Answer sent");

        session.exchange_complete = true;
        let peer = session.peer.clone();
        self.arm_adaptive(quality, &peer, link.as_ref()).await;
        quality.record_negotiated(&peer, params);

        if session.phase == CallPhase::Negotiating
            && link.connection_state() == RTCPeerConnectionState::Connected
        {
            self.activate(session);
        }
        Ok(())
    }

    async fn send_offer(&self, state: &mut EngineState<T::PeerId>) -> Result<(), CallError> {
        let EngineState { session, quality } = state;
        let session = session.as_mut().ok_or(CallError::NoSession)?;
        let link = session
            .link
            .clone()
            .ok_or_else(|| CallError::PeerNotConnected(session.peer.to_string_repr()))?;

        self.apply_sender_profile(
            link.as_ref(),
            MediaKind::Audio,
            quality.effective_index(&session.peer, MediaKind::Audio),
        )
        .await;
        sdp::shape_transceivers(
            link.as_ref(),
            &self.inner.config.codec_preferences,
            session.sends_video(),
        )
        .await;

        let params = quality
            .desired_codec_params(&session.peer)
            .unwrap_or(DEFAULT_OPUS_FMTP)
            .to_string();
        let raw = link.create_offer(OfferOptions::default()).await?;
        let shaped = sdp::apply_audio_codec_params(&raw, &params);
        link.set_local_description(SessionDescription::offer(shaped.clone()))
            .await?;
        session.offered_codec_params = Some(params);

        let offer = SignalingMessage::Offer {
            sdp: shaped,
            audio_only: session.advertised_audio_only(),
            is_screen_share: session.advertised_screen_share(),
        };
        self.send(&session.peer, offer).await?;
        tracing::info!("Offer sent");
        Ok(())
    }

    async fn install_media(
        &self,
        state: &mut EngineState<T::PeerId>,
        acquisition: Acquisition,
    ) -> Result<(), CallError> {
        let session = state.session.as_mut().ok_or(CallError::NoSession)?;
        let Acquisition { media, notes } = acquisition;
        for note in &notes {
            self.inner
                .notifier
                .notice(Some(&session.peer), NoticeSeverity::Warning, note.to_string());
        }
        session.video_enabled = media.has_video();
        let media = session.local_media.insert(media);
        if let Some(link) = session.link.clone() {
            for track in media.tracks() {
                link.add_local_track(track).await?;
            }
        }
        tracing::debug!(
            tracks = media.tracks().len(),
            video_source = ?media.video_source(),
            "Local media attached"
        );
        Ok(())
    }

    async fn fail_negotiation(&self, state: &mut EngineState<T::PeerId>, err: &CallError) {
        let message = match err {
            CallError::Negotiation(e) if e.is_media_line_order() => {
                "Call setup failed because the media descriptions are incompatible. The call was ended."
            }
            _ => "Call setup failed. The call was ended.",
        };
        tracing::error!(error = %err, "Negotiation failed");
        let peer = state.session.as_ref().map(|s| s.peer.clone());
        self.inner
            .notifier
            .notice(peer.as_ref(), NoticeSeverity::Error, message);
        self.teardown(state, EndReason::NegotiationFailed).await;
    }

    /// Single cleanup routine for every path back to idle
    ///
    /// Returns `false` when there was no session. Awaits on the link happen
    /// before any timer is aborted, since the caller may be running inside
    /// one of those timers.
    async fn teardown(&self, state: &mut EngineState<T::PeerId>, reason: EndReason) -> bool {
        let Some(mut session) = state.session.take() else {
            return false;
        };

        if session.local_media.is_some() {
            if let Some(link) = &session.link {
                if let Err(e) = link.remove_local_tracks().await {
                    tracing::debug!(error = %e, "Failed to detach local tracks");
                }
            }
        }

        if let Some(timeout) = session.pending_timeout.take() {
            timeout.abort();
        }
        state.quality.stop(&session.peer);
        if let Some(mut media) = session.local_media.take() {
            media.release();
        }
        session.remote_media.clear();
        session.set_phase(CallPhase::Idle);

        let duration = chrono::Utc::now() - session.started_at;
        tracing::info!(
            call_id = %session.id,
            reason = ?reason,
            duration_ms = duration.num_milliseconds(),
            "Call ended"
        );
        self.inner.notifier.publish(CallEvent::Ended {
            peer: session.peer,
            reason,
        });
        true
    }

    fn spawn_request_timeout(&self, call_id: CallId) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let timeout = self.inner.config.call_request_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                let engine = CallEngine { inner };
                engine.expire_pending_call(call_id).await;
            }
        })
    }

    async fn expire_pending_call(&self, call_id: CallId) {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        let Some(session) = state
            .session
            .as_mut()
            .filter(|s| s.id == call_id && s.phase == CallPhase::PendingOutgoing)
        else {
            return;
        };
        // Detach without aborting: this task is the timeout.
        drop(session.pending_timeout.take());
        let peer = session.peer.clone();

        tracing::info!(call_id = %call_id, "Call request timed out");
        if let Err(e) = self.send(&peer, SignalingMessage::CallCancel).await {
            tracing::warn!(error = %e, "Failed to send call-cancel");
        }
        self.inner
            .notifier
            .notice(Some(&peer), NoticeSeverity::Info, "No answer");
        self.teardown(state, EndReason::Timeout).await;
    }

    async fn arm_adaptive(
        &self,
        quality: &mut AdaptiveController<T::PeerId>,
        peer: &T::PeerId,
        link: &dyn PeerLink,
    ) {
        if !quality.start(peer) {
            return;
        }
        quality.attach_timer(peer, self.spawn_quality_timer(peer.clone()));
        for kind in MediaKind::ALL {
            self.apply_sender_profile(link, kind, quality.effective_index(peer, kind))
                .await;
        }
        tracing::info!(
            peer = %peer,
            interval_ms = self.inner.config.adaptive.check_interval_ms,
            "Adaptive quality checks armed"
        );
    }

    fn spawn_quality_timer(&self, peer: T::PeerId) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.adaptive.check_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let engine = CallEngine { inner };
                if !engine.run_quality_check(&peer).await {
                    break;
                }
            }
            tracing::debug!(peer = %peer, "Adaptive quality timer stopped");
        })
    }

    /// One controller tick; returns `false` once the peer is gone
    async fn run_quality_check(&self, peer: &T::PeerId) -> bool {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        if !state.quality.is_tracking(peer) {
            return false;
        }
        let Some(session) = state.session.as_ref().filter(|s| &s.peer == peer) else {
            return false;
        };
        let Some(link) = session.link.clone() else {
            return false;
        };
        let role = session.role;
        let sends_video = session.sends_video();

        if link.connection_state() != RTCPeerConnectionState::Connected {
            tracing::trace!(peer = %peer, "Connection not established, skipping quality check");
            return true;
        }

        let reports = match link.get_stats().await {
            Ok(reports) => reports,
            Err(e) => {
                tracing::debug!(error = %e, "Statistics unavailable");
                Vec::new()
            }
        };
        let sample = NetworkSample::from_reports(&reports, &self.inner.config.adaptive.thresholds);
        let now = Instant::now();

        for kind in MediaKind::ALL {
            if kind == MediaKind::Video && !sends_video {
                continue;
            }
            let Some(switch) = state.quality.evaluate(peer, kind, &sample, now) else {
                continue;
            };
            self.apply_switch(state, link.as_ref(), peer, role, switch).await;
            if state.session.is_none() {
                return false;
            }
        }
        true
    }

    async fn apply_switch(
        &self,
        state: &mut EngineState<T::PeerId>,
        link: &dyn PeerLink,
        peer: &T::PeerId,
        role: CallRole,
        switch: ProfileSwitch,
    ) {
        let adaptive = &self.inner.config.adaptive;
        let level_name = match switch.kind {
            MediaKind::Audio => adaptive.audio_profiles.get(switch.to).map(|p| p.level_name.clone()),
            MediaKind::Video => adaptive.video_profiles.get(switch.to).map(|p| p.level_name.clone()),
        }
        .unwrap_or_default();
        tracing::info!(
            peer = %peer,
            kind = %switch.kind,
            from = switch.from,
            to = switch.to,
            level = %level_name,
            direction = ?switch.direction(),
            "Switching quality profile"
        );

        self.apply_sender_profile(link, switch.kind, switch.to).await;
        self.inner.notifier.publish(CallEvent::ProfileChanged {
            peer: peer.clone(),
            kind: switch.kind,
            level_name,
            index: switch.to,
        });

        if switch.kind != MediaKind::Audio {
            return;
        }
        let desired = adaptive.audio_profiles.get(switch.to).map(|p| p.codec_params.as_str());
        let negotiated = state.quality.negotiated(peer).or_else(|| {
            adaptive
                .audio_profiles
                .get(switch.from)
                .map(|p| p.codec_params.as_str())
        });
        if desired.is_none() || desired == negotiated {
            return;
        }

        match role {
            CallRole::Caller => self.renegotiate(state, peer).await,
            CallRole::Callee => tracing::info!(
                peer = %peer,
                "Audio parameters differ from the negotiated ones, waiting for the caller to renegotiate"
            ),
        }
    }

    async fn renegotiate(&self, state: &mut EngineState<T::PeerId>, peer: &T::PeerId) {
        let Some(session) = state.session.as_ref().filter(|s| &s.peer == peer) else {
            return;
        };
        if session.role != CallRole::Caller || session.phase != CallPhase::Active {
            tracing::warn!(role = ?session.role, phase = ?session.phase, "Renegotiation not allowed, dropping");
            return;
        }
        let Some(link) = session.link.clone() else {
            return;
        };
        let signaling = link.signaling_state();
        if signaling != RTCSignalingState::Stable {
            tracing::warn!(signaling_state = ?signaling, "Renegotiation dropped, a description exchange is in progress");
            return;
        }

        tracing::info!(peer = %peer, "Renegotiating audio parameters");
        if let Err(err) = self.send_offer(state).await {
            self.fail_negotiation(state, &err).await;
        }
    }

    /// Push the profile at `index` to the sender of `kind`
    async fn apply_sender_profile(&self, link: &dyn PeerLink, kind: MediaKind, index: usize) {
        let Some(mut params) = link.sender_parameters(kind).await else {
            tracing::trace!(kind = %kind, "No sender to configure");
            return;
        };
        let adaptive = &self.inner.config.adaptive;
        let encoding = params.primary_mut();
        match kind {
            MediaKind::Audio => {
                let Some(profile) = adaptive.audio_profiles.get(index) else {
                    return;
                };
                if encoding.max_bitrate_bps == Some(profile.max_bitrate_bps) {
                    return;
                }
                encoding.max_bitrate_bps = Some(profile.max_bitrate_bps);
            }
            MediaKind::Video => {
                let Some(profile) = adaptive.video_profiles.get(index) else {
                    return;
                };
                encoding.max_bitrate_bps = Some(profile.max_bitrate_bps);
                encoding.max_framerate = Some(profile.max_frame_rate);
                encoding.scale_resolution_down_by = Some(profile.scale_resolution_down_by);
            }
        }
        match link.set_sender_parameters(kind, params).await {
            Ok(()) => tracing::debug!(kind = %kind, index, "Sender parameters applied"),
            Err(e) => tracing::warn!(kind = %kind, error = %e, "Failed to apply sender parameters"),
        }
    }
}

fn media_session<I: PeerIdentity>(
    state: &mut EngineState<I>,
) -> Result<&mut CallSession<I>, CallError> {
    let session = state.session.as_mut().ok_or(CallError::NoSession)?;
    if !matches!(session.phase, CallPhase::Negotiating | CallPhase::Active) {
        return Err(CallError::InvalidState {
            expected: "negotiating or active",
            actual: session.phase,
        });
    }
    Ok(session)
}

/// Builder for [`CallEngine`]
pub struct CallEngineBuilder<T: SignalingTransport> {
    signaling: Arc<SignalingHandler<T>>,
    capture: Arc<dyn CaptureProvider>,
    links: Arc<dyn PeerLinkProvider<T::PeerId>>,
    config: CallEngineConfig,
    event_capacity: usize,
}

impl<T: SignalingTransport> CallEngineBuilder<T> {
    /// Create a builder with default configuration
    #[must_use]
    pub fn new(
        signaling: Arc<SignalingHandler<T>>,
        capture: Arc<dyn CaptureProvider>,
        links: Arc<dyn PeerLinkProvider<T::PeerId>>,
    ) -> Self {
        Self {
            signaling,
            capture,
            links,
            config: CallEngineConfig::default(),
            event_capacity: 64,
        }
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: CallEngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the per-subscriber event buffer
    #[must_use]
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Build the engine
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn build(self) -> Result<CallEngine<T>, CallError> {
        self.config.validate()?;
        let acquirer = MediaAcquirer::new(self.capture, self.config.audio_constraints);
        let quality = AdaptiveController::new(self.config.adaptive.clone());
        Ok(CallEngine {
            inner: Arc::new(EngineInner {
                signaling: self.signaling,
                links: self.links,
                acquirer,
                notifier: EventNotifier::new(self.event_capacity),
                state: Mutex::new(EngineState {
                    session: None,
                    quality,
                }),
                config: self.config,
            }),
        })
    }
}
