//! The call session record
//!
//! At most one [`CallSession`] exists per engine. It is created on the first
//! request or offer and dropped by the engine's cleanup routine; nothing
//! outside the state machine mutates it.

use crate::identity::PeerIdentity;
use crate::media::{LocalMedia, VideoSource};
use crate::peer::PeerLink;
use crate::types::{CallId, CallPhase, CallRole, MediaKind, MediaMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// A track received from the remote peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrack {
    /// Track id
    pub id: String,
    /// Media kind
    pub kind: MediaKind,
}

/// Live state of the single call
pub(crate) struct CallSession<I: PeerIdentity> {
    pub(crate) id: CallId,
    pub(crate) peer: I,
    pub(crate) role: CallRole,
    pub(crate) mode: MediaMode,
    pub(crate) phase: CallPhase,
    pub(crate) local_media: Option<LocalMedia>,
    pub(crate) remote_media: Vec<RemoteTrack>,
    pub(crate) muted: bool,
    pub(crate) video_enabled: bool,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) link: Option<Arc<dyn PeerLink>>,
    pub(crate) pending_timeout: Option<JoinHandle<()>>,
    /// Offer that arrived while idle, answered once the user accepts
    pub(crate) pending_offer: Option<String>,
    /// Opus parameters of the local offer still awaiting an answer
    pub(crate) offered_codec_params: Option<String>,
    pub(crate) exchange_complete: bool,
}

impl<I: PeerIdentity> CallSession<I> {
    pub(crate) fn new(peer: I, role: CallRole, mode: MediaMode, phase: CallPhase) -> Self {
        Self {
            id: CallId::new(),
            peer,
            role,
            mode,
            phase,
            local_media: None,
            remote_media: Vec::new(),
            muted: false,
            video_enabled: true,
            started_at: Utc::now(),
            link: None,
            pending_timeout: None,
            pending_offer: None,
            offered_codec_params: None,
            exchange_complete: false,
        }
    }

    /// Whether local media includes a video track
    pub(crate) fn sends_video(&self) -> bool {
        self.local_media.as_ref().map_or(false, LocalMedia::has_video)
    }

    /// The `audioOnly` flag this side advertises
    pub(crate) fn advertised_audio_only(&self) -> bool {
        !self.sends_video()
    }

    /// The `isScreenShare` flag for descriptions: only the sharer sets it
    pub(crate) fn advertised_screen_share(&self) -> bool {
        self.mode.is_screen_share() && self.role == CallRole::Caller
    }

    pub(crate) fn set_phase(&mut self, new_phase: CallPhase) {
        let old_phase = self.phase;
        if old_phase == new_phase {
            return;
        }
        if !CallPhase::is_valid_transition(old_phase, new_phase) {
            tracing::warn!(
                call_id = %self.id,
                old_phase = ?old_phase,
                new_phase = ?new_phase,
                "Unexpected call phase transition"
            );
        }
        self.phase = new_phase;
        tracing::debug!(
            call_id = %self.id,
            peer = %self.peer,
            old_phase = ?old_phase,
            new_phase = ?new_phase,
            "Call phase transition"
        );
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot<I> {
        SessionSnapshot {
            call_id: self.id,
            peer: self.peer.clone(),
            role: self.role,
            mode: self.mode,
            phase: self.phase,
            muted: self.muted,
            video_enabled: self.video_enabled,
            local_video_source: self.local_media.as_ref().and_then(LocalMedia::video_source),
            local_tracks: self.local_media.as_ref().map_or(0, |m| m.tracks().len()),
            remote_tracks: self.remote_media.clone(),
            started_at: self.started_at,
        }
    }
}

/// Read-only view of the current session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "I: PeerIdentity")]
pub struct SessionSnapshot<I: PeerIdentity> {
    /// Session id
    pub call_id: CallId,
    /// Remote peer
    pub peer: I,
    /// Local role
    pub role: CallRole,
    /// Media mode
    pub mode: MediaMode,
    /// Lifecycle phase
    pub phase: CallPhase,
    /// Local microphone muted
    pub muted: bool,
    /// Local video enabled
    pub video_enabled: bool,
    /// Source of local video, if any
    pub local_video_source: Option<VideoSource>,
    /// Number of captured local tracks
    pub local_tracks: usize,
    /// Tracks received from the peer
    pub remote_tracks: Vec<RemoteTrack>,
    /// When the session was created
    pub started_at: DateTime<Utc>,
}
