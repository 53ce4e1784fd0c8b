//! Peercall - call negotiation and adaptive media quality for peer-to-peer calls
//!
//! This library owns everything between "the user pressed call" and "media is
//! flowing at a rate the network can carry":
//!
//! - **Call lifecycle**: request, accept or reject, offer/answer, teardown,
//!   with exactly one session per engine
//! - **Media acquisition**: camera, microphone and display capture with a
//!   graceful fallback chain
//! - **Description shaping**: codec preference ordering and opus parameter
//!   rewriting on every offer and answer
//! - **Adaptive quality**: a periodic controller that classifies transport
//!   statistics, moves sender profiles with hysteresis and cooldowns, and asks
//!   the caller to renegotiate when the opus parameters must change
//!
//! Signaling delivery, device access and the peer connection itself are
//! provided by the application through the [`SignalingTransport`],
//! [`CaptureProvider`] and [`PeerLinkProvider`] traits.
//!
//! # Examples
//!
//! ```rust,no_run
//! use peercall_core::prelude::*;
//! use peercall_core::sim::{CaptureScript, MemoryHub, SimulatedCapture, SimulatedLinks};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let hub = MemoryHub::new();
//! let transport = Arc::new(hub.endpoint(PeerIdentityString::new("alice")));
//! let links = Arc::new(SimulatedLinks::new());
//! links.connect(&PeerIdentityString::new("bob"));
//!
//! let engine = CallEngine::builder(
//!     Arc::new(SignalingHandler::new(transport)),
//!     Arc::new(SimulatedCapture::new(CaptureScript::default())),
//!     links,
//! )
//! .build()?;
//!
//! let mut events = engine.subscribe_events();
//! engine
//!     .initiate_call(PeerIdentityString::new("bob"), MediaMode::AudioVideo)
//!     .await?;
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::unused_async)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::derivable_impls)]

/// Core call types
pub mod types;

/// Peer identity abstraction
pub mod identity;

/// Engine and controller configuration
pub mod config;

/// Quality profile tables
pub mod profiles;

/// Local media capture and fallback
pub mod media;

/// Peer connection seam
pub mod peer;

/// Session description codec shaping
pub mod sdp;

/// Transport statistics
pub mod stats;

/// Adaptive quality controller
pub mod quality;

/// Call and quality events
pub mod events;

/// Signaling protocol and handlers
pub mod signaling;

/// The call session record
pub mod session;

/// Call state machine
pub mod call;

/// In-process collaborators for simulation and tests
pub mod sim;

// Re-export main types at crate root
pub use call::{CallEngine, CallEngineBuilder, CallError};
pub use config::{
    AdaptiveConfig, CallEngineConfig, ClassificationMargins, ConfigError, QualityThresholds,
    TrackPolicy,
};
pub use events::{CallEvent, EventNotifier, NoticeSeverity};
pub use identity::{PeerIdentity, PeerIdentityString};
pub use media::{
    AudioConstraints, CaptureProvider, CaptureRequest, DeviceInfo, DeviceKind, LocalMedia,
    MediaError, MediaTrack, TrackControl, TrackSource, VideoSource,
};
pub use peer::{PeerLink, PeerLinkError, PeerLinkProvider, SendParameters, SessionDescription};
pub use profiles::{AudioProfile, ProfileError, ProfileTable, QualityProfile, VideoProfile};
pub use quality::{AdaptiveController, ProfileSwitch, QualitySnapshot};
pub use session::{RemoteTrack, SessionSnapshot};
pub use signaling::{SignalingError, SignalingHandler, SignalingMessage, SignalingTransport};
pub use stats::{NetworkSample, StatsReport};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{CallEngine, CallError};
    pub use crate::config::CallEngineConfig;
    pub use crate::events::{CallEvent, NoticeSeverity};
    pub use crate::identity::{PeerIdentity, PeerIdentityString};
    pub use crate::media::CaptureProvider;
    pub use crate::peer::{PeerLink, PeerLinkProvider};
    pub use crate::signaling::{SignalingHandler, SignalingMessage, SignalingTransport};
    pub use crate::types::{CallId, CallPhase, CallRole, EndReason, MediaKind, MediaMode};
}
