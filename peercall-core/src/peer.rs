//! Peer connection seam
//!
//! The engine never builds transports itself. The connection layer hands it
//! one [`PeerLink`] per remote identity, and the engine drives descriptions,
//! codec preferences and sender parameters through it. Signaling and
//! connection states reuse the `webrtc` crate's enums so a webrtc-rs backed
//! link can forward them unchanged.

use crate::media::MediaTrack;
use crate::stats::StatsReport;
use crate::types::MediaKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

/// Peer connection errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerLinkError {
    /// The remote description orders its media sections differently from ours
    #[error("Media line ordering mismatch: {0}")]
    MediaLineOrder(String),

    /// Operation not allowed in the current signaling state
    #[error("Invalid signaling state: {0}")]
    InvalidState(String),

    /// Description was malformed or refused
    #[error("Description rejected: {0}")]
    Rejected(String),

    /// The local engine does not support the operation
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// The connection has been closed
    #[error("Peer connection closed")]
    Closed,
}

impl PeerLinkError {
    /// Whether this is the unrecoverable media-line ordering failure
    #[must_use]
    pub fn is_media_line_order(&self) -> bool {
        matches!(self, Self::MediaLineOrder(_))
    }
}

/// A session description with its type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    /// Offer or answer
    pub sdp_type: RTCSdpType,
    /// Description text
    pub sdp: String,
}

impl SessionDescription {
    /// An offer
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: RTCSdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// An answer
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: RTCSdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Options for offer creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferOptions {
    /// Add a receive-capable audio section
    pub offer_to_receive_audio: bool,
    /// Add a receive-capable video section
    pub offer_to_receive_video: bool,
}

impl Default for OfferOptions {
    /// Both receive directions are always offered so each side may send
    /// video independently of the other.
    fn default() -> Self {
        Self {
            offer_to_receive_audio: true,
            offer_to_receive_video: true,
        }
    }
}

/// Parameters of one sender encoding
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EncodingParameters {
    /// Bitrate ceiling
    pub max_bitrate_bps: Option<u32>,
    /// Frame rate cap
    pub max_framerate: Option<f64>,
    /// Resolution divisor
    pub scale_resolution_down_by: Option<f64>,
}

/// Sender parameters for one outgoing track
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SendParameters {
    /// Encodings, usually exactly one
    pub encodings: Vec<EncodingParameters>,
}

impl SendParameters {
    /// First encoding, created if missing
    pub fn primary_mut(&mut self) -> &mut EncodingParameters {
        if self.encodings.is_empty() {
            self.encodings.push(EncodingParameters::default());
        }
        &mut self.encodings[0]
    }

    /// First encoding
    #[must_use]
    pub fn primary(&self) -> Option<&EncodingParameters> {
        self.encodings.first()
    }
}

/// One peer connection, as exposed by the connection layer
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Attach a local track, creating its sender
    async fn add_local_track(&self, track: &MediaTrack) -> Result<(), PeerLinkError>;

    /// Detach every local track; the connection itself stays up
    async fn remove_local_tracks(&self) -> Result<(), PeerLinkError>;

    /// Whether transceiver codec preferences can be set
    fn supports_codec_preferences(&self) -> bool {
        true
    }

    /// Codecs the local engine can send for `kind`
    fn codec_capabilities(&self, kind: MediaKind) -> Vec<RTCRtpCodecCapability>;

    /// Restrict the transceiver for `kind` to `codecs`, in order
    async fn set_codec_preferences(
        &self,
        kind: MediaKind,
        codecs: Vec<RTCRtpCodecCapability>,
    ) -> Result<(), PeerLinkError>;

    /// Create an offer
    async fn create_offer(&self, options: OfferOptions) -> Result<String, PeerLinkError>;

    /// Create an answer to the applied remote offer
    async fn create_answer(&self) -> Result<String, PeerLinkError>;

    /// Apply a local description
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerLinkError>;

    /// Apply a remote description
    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), PeerLinkError>;

    /// Current signaling state
    fn signaling_state(&self) -> RTCSignalingState;

    /// Current connection state
    fn connection_state(&self) -> RTCPeerConnectionState;

    /// Parameters of the sender for `kind`, `None` if there is no such sender
    async fn sender_parameters(&self, kind: MediaKind) -> Option<SendParameters>;

    /// Replace the parameters of the sender for `kind`
    async fn set_sender_parameters(
        &self,
        kind: MediaKind,
        params: SendParameters,
    ) -> Result<(), PeerLinkError>;

    /// Statistics snapshot
    async fn get_stats(&self) -> Result<Vec<StatsReport>, PeerLinkError>;
}

/// Looks up the peer connection for a remote identity
pub trait PeerLinkProvider<I>: Send + Sync {
    /// The link to `peer`, if the connection layer has one
    fn link(&self, peer: &I) -> Option<Arc<dyn PeerLink>>;
}

/// Whether a connection state means the transport is gone
#[must_use]
pub fn is_terminal_connection_state(state: RTCPeerConnectionState) -> bool {
    matches!(
        state,
        RTCPeerConnectionState::Closed
            | RTCPeerConnectionState::Failed
            | RTCPeerConnectionState::Disconnected
    )
}
