//! Call types shared across the engine

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a call session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Media negotiated at the start of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaMode {
    /// Microphone only
    AudioOnly,
    /// Camera and microphone
    AudioVideo,
    /// The caller shares a display; the callee watches
    ScreenShare,
}

impl MediaMode {
    /// Derive the mode from the `audioOnly`/`isScreenShare` wire flags
    ///
    /// Screen sharing wins over the audio-only flag.
    #[must_use]
    pub fn from_flags(audio_only: bool, is_screen_share: bool) -> Self {
        if is_screen_share {
            Self::ScreenShare
        } else if audio_only {
            Self::AudioOnly
        } else {
            Self::AudioVideo
        }
    }

    /// Whether this is a screen-share session
    #[must_use]
    pub fn is_screen_share(self) -> bool {
        matches!(self, Self::ScreenShare)
    }

    /// Whether the request itself asks for audio only
    #[must_use]
    pub fn is_audio_only(self) -> bool {
        matches!(self, Self::AudioOnly)
    }
}

impl std::fmt::Display for MediaMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::AudioOnly => "audio-only",
            Self::AudioVideo => "audio-video",
            Self::ScreenShare => "screen-share",
        };
        f.write_str(name)
    }
}

/// Which side of the call this engine is on
///
/// Fixed for the lifetime of a session. Only the caller may renegotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallRole {
    /// Sent the request and owns every offer
    Caller,
    /// Received the request and only ever answers
    Callee,
}

/// Lifecycle phase of the call session
///
/// ```text
///            initiate                  call-accepted
///   Idle ───────────────► PendingOutgoing ─────────────┐
///    │                                                  ▼
///    │ call-request        accept                  Negotiating ──answer/connected──► Active
///    └─────────────► PendingIncoming ──────────────────▲
///
///   any non-idle phase ── reject / cancel / end / hang-up / transport loss ──► Idle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPhase {
    /// No session
    Idle,
    /// Request sent, waiting for the callee
    PendingOutgoing,
    /// Request received, waiting for the local user
    PendingIncoming,
    /// Media acquired, descriptions being exchanged
    Negotiating,
    /// Description exchange complete
    Active,
}

impl CallPhase {
    /// Check a transition against the call state machine
    #[must_use]
    pub fn is_valid_transition(from: CallPhase, to: CallPhase) -> bool {
        matches!(
            (from, to),
            (CallPhase::Idle, CallPhase::PendingOutgoing)
                | (CallPhase::Idle, CallPhase::PendingIncoming)
                | (CallPhase::PendingOutgoing, CallPhase::Negotiating)
                | (CallPhase::PendingIncoming, CallPhase::Negotiating)
                | (CallPhase::Negotiating, CallPhase::Active)
                | (CallPhase::PendingOutgoing, CallPhase::Idle)
                | (CallPhase::PendingIncoming, CallPhase::Idle)
                | (CallPhase::Negotiating, CallPhase::Idle)
                | (CallPhase::Active, CallPhase::Idle)
        )
    }
}

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

impl MediaKind {
    /// Both kinds, audio first
    pub const ALL: [MediaKind; 2] = [MediaKind::Audio, MediaKind::Video];
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

/// Reason carried by a `call-rejected` message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Callee already has a session
    Busy,
    /// Callee declined
    UserRejected,
    /// Callee could not acquire any media
    DeviceError,
}

/// Why a session returned to idle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Local user hung up
    LocalHangUp,
    /// Local user declined an incoming call
    LocalRejected,
    /// Remote peer declined
    RemoteRejected(RejectReason),
    /// Remote peer withdrew its request
    RemoteCancelled,
    /// Remote peer hung up
    RemoteEnded,
    /// Nobody answered in time
    Timeout,
    /// Local capture failed on every fallback
    DeviceError,
    /// Description exchange failed
    NegotiationFailed,
    /// Connection layer reported closed, failed or disconnected
    ConnectionLost,
    /// The remote side stopped sharing its screen
    RemoteShareEnded,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn call_ids_are_unique() {
        assert_ne!(CallId::new(), CallId::new());
    }

    #[test]
    fn mode_from_flags() {
        assert_eq!(MediaMode::from_flags(false, false), MediaMode::AudioVideo);
        assert_eq!(MediaMode::from_flags(true, false), MediaMode::AudioOnly);
        assert_eq!(MediaMode::from_flags(true, true), MediaMode::ScreenShare);
        assert_eq!(MediaMode::from_flags(false, true), MediaMode::ScreenShare);
    }

    #[test]
    fn transitions_follow_lifecycle() {
        use CallPhase::*;
        assert!(CallPhase::is_valid_transition(Idle, PendingOutgoing));
        assert!(CallPhase::is_valid_transition(PendingIncoming, Negotiating));
        assert!(CallPhase::is_valid_transition(Negotiating, Active));
        assert!(CallPhase::is_valid_transition(Active, Idle));

        assert!(!CallPhase::is_valid_transition(Idle, Active));
        assert!(!CallPhase::is_valid_transition(Active, Negotiating));
        assert!(!CallPhase::is_valid_transition(PendingOutgoing, Active));
        assert!(!CallPhase::is_valid_transition(Idle, Idle));
    }

    #[test]
    fn reject_reason_wire_names() {
        let json = serde_json::to_string(&RejectReason::UserRejected).unwrap();
        assert_eq!(json, "\"user_rejected\"");
        let busy: RejectReason = serde_json::from_str("\"busy\"").unwrap();
        assert_eq!(busy, RejectReason::Busy);
    }
}
