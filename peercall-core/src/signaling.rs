//! Call signaling protocol
//!
//! Messages travel over an application-provided channel that is reliable,
//! ordered and addressed by peer identity. This module defines the message
//! taxonomy, the transport seam, and a handler that adds tracing and receive
//! backpressure on top of any transport.

use crate::identity::PeerIdentity;
use crate::types::RejectReason;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};

/// Signaling errors
#[derive(Error, Debug)]
pub enum SignalingError {
    /// The transport could not deliver a message
    #[error("Transport error: {0}")]
    TransportError(String),

    /// The channel was closed
    #[error("Signaling channel closed")]
    Closed,
}

/// Signaling transport trait
///
/// Implement this for the channel the application already has (websocket,
/// relay, DHT). Delivery and ordering are the transport's responsibility.
#[async_trait]
pub trait SignalingTransport: Send + Sync + 'static {
    /// Peer identifier type
    type PeerId: PeerIdentity;

    /// Transport error type
    type Error: std::error::Error + Send + Sync + 'static;

    /// Send a signaling message
    async fn send_message(
        &self,
        peer: &Self::PeerId,
        message: SignalingMessage,
    ) -> Result<(), Self::Error>;

    /// Receive the next signaling message
    async fn receive_message(&self) -> Result<(Self::PeerId, SignalingMessage), Self::Error>;
}

/// Call signaling messages
///
/// `audioOnly` in `call-accepted`, `offer` and `answer` describes what the
/// sender itself transmits, not what it expects from the other side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// Propose a call
    #[serde(rename_all = "camelCase")]
    CallRequest {
        /// Caller will only send audio
        #[serde(default)]
        audio_only: bool,
        /// Caller wants to share its screen
        #[serde(default)]
        is_screen_share: bool,
    },

    /// Accept a call
    #[serde(rename_all = "camelCase")]
    CallAccepted {
        /// Callee will only send audio
        #[serde(default)]
        audio_only: bool,
        /// Echo of the session's screen-share flag
        #[serde(default)]
        is_screen_share: bool,
    },

    /// Decline a call
    CallRejected {
        /// Why
        reason: RejectReason,
    },

    /// Withdraw a pending outgoing request
    CallCancel,

    /// Session description offer
    #[serde(rename_all = "camelCase")]
    Offer {
        /// Description text
        sdp: String,
        /// Sender transmits audio only
        #[serde(default)]
        audio_only: bool,
        /// Sender is sharing its screen
        #[serde(default)]
        is_screen_share: bool,
    },

    /// Session description answer
    #[serde(rename_all = "camelCase")]
    Answer {
        /// Description text
        sdp: String,
        /// Sender transmits audio only
        #[serde(default)]
        audio_only: bool,
        /// Sender is sharing its screen
        #[serde(default)]
        is_screen_share: bool,
    },

    /// Tear down media; the peer connection may stay up
    CallEnd,
}

impl SignalingMessage {
    /// Wire name of the message type
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::CallRequest { .. } => "call-request",
            Self::CallAccepted { .. } => "call-accepted",
            Self::CallRejected { .. } => "call-rejected",
            Self::CallCancel => "call-cancel",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::CallEnd => "call-end",
        }
    }

    /// Whether this carries a session description
    #[must_use]
    pub fn is_description(&self) -> bool {
        matches!(self, Self::Offer { .. } | Self::Answer { .. })
    }

    /// Whether this ends or declines a session
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CallRejected { .. } | Self::CallCancel | Self::CallEnd
        )
    }
}

/// Minimum time between messages (10ms for 100 msg/sec rate limit)
const MIN_MESSAGE_INTERVAL: Duration = Duration::from_millis(10);

/// Signaling handler with rate limiting
pub struct SignalingHandler<T: SignalingTransport> {
    transport: std::sync::Arc<T>,
    last_receive_time: tokio::sync::Mutex<Instant>,
    error_count: tokio::sync::Mutex<u32>,
}

impl<T: SignalingTransport> SignalingHandler<T> {
    /// Create new signaling handler
    #[must_use]
    pub fn new(transport: std::sync::Arc<T>) -> Self {
        Self {
            transport,
            last_receive_time: tokio::sync::Mutex::new(Instant::now()),
            error_count: tokio::sync::Mutex::new(0),
        }
    }

    /// Send a signaling message to a peer
    ///
    /// # Errors
    ///
    /// Returns error if sending fails
    #[tracing::instrument(skip(self, message), fields(peer = %peer, message_type = message.kind_name()))]
    pub async fn send_message(
        &self,
        peer: &T::PeerId,
        message: SignalingMessage,
    ) -> Result<(), T::Error> {
        tracing::debug!("Sending signaling message");
        self.transport.send_message(peer, message).await
    }

    /// Receive a signaling message with rate limiting and backpressure
    ///
    /// # Errors
    ///
    /// Returns error if receiving fails
    #[tracing::instrument(skip(self))]
    pub async fn receive_message(&self) -> Result<(T::PeerId, SignalingMessage), T::Error> {
        let mut last_time = self.last_receive_time.lock().await;
        let elapsed = Instant::now().duration_since(*last_time);

        if elapsed < MIN_MESSAGE_INTERVAL {
            let sleep_duration = MIN_MESSAGE_INTERVAL - elapsed;
            tracing::trace!(
                sleep_ms = sleep_duration.as_millis() as u64,
                "Rate limiting applied"
            );
            drop(last_time);
            sleep(sleep_duration).await;
            last_time = self.last_receive_time.lock().await;
        }

        *last_time = Instant::now();
        drop(last_time);

        match self.transport.receive_message().await {
            Ok(result) => {
                *self.error_count.lock().await = 0;
                tracing::debug!(peer = %result.0, message_type = result.1.kind_name(), "Received signaling message");
                Ok(result)
            }
            Err(e) => {
                let mut error_count = self.error_count.lock().await;
                *error_count += 1;
                let count = *error_count;
                drop(error_count);

                let backoff_duration = Duration::from_millis(100 * u64::from(count.min(10)));
                tracing::warn!(
                    error_count = count,
                    backoff_ms = backoff_duration.as_millis() as u64,
                    error = %e,
                    "Error receiving message, backing off"
                );
                sleep(backoff_duration).await;

                Err(e)
            }
        }
    }

    /// Get access to the underlying transport
    #[must_use]
    pub fn transport(&self) -> &std::sync::Arc<T> {
        &self.transport
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::identity::PeerIdentityString;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    struct MockTransport {
        messages: Mutex<VecDeque<(PeerIdentityString, SignalingMessage)>>,
    }

    #[derive(Debug)]
    struct MockError;

    impl std::fmt::Display for MockError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "Mock error")
        }
    }

    impl std::error::Error for MockError {}

    impl MockTransport {
        fn new() -> Self {
            Self {
                messages: Mutex::new(VecDeque::new()),
            }
        }
    }

    #[async_trait]
    impl SignalingTransport for MockTransport {
        type PeerId = PeerIdentityString;
        type Error = MockError;

        async fn send_message(
            &self,
            peer: &PeerIdentityString,
            message: SignalingMessage,
        ) -> Result<(), MockError> {
            self.messages
                .lock()
                .unwrap()
                .push_back((peer.clone(), message));
            Ok(())
        }

        async fn receive_message(&self) -> Result<(PeerIdentityString, SignalingMessage), MockError> {
            let next = self.messages.lock().unwrap().pop_front();
            next.ok_or(MockError)
        }
    }

    #[tokio::test]
    async fn handler_sends_and_receives() {
        let transport = Arc::new(MockTransport::new());
        let handler = SignalingHandler::new(transport.clone());
        let peer = PeerIdentityString::new("bob");

        handler.send_message(&peer, SignalingMessage::CallCancel).await.unwrap();
        let (from, message) = handler.receive_message().await.unwrap();
        assert_eq!(from, peer);
        assert_eq!(message, SignalingMessage::CallCancel);
    }

    #[tokio::test(start_paused = true)]
    async fn receive_errors_back_off() {
        let transport = Arc::new(MockTransport::new());
        let handler = SignalingHandler::new(transport);

        let started = Instant::now();
        assert!(handler.receive_message().await.is_err());
        assert!(handler.receive_message().await.is_err());
        // 100ms after the first failure, 200ms after the second
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[test]
    fn wire_format_uses_kebab_types_and_camel_fields() {
        let msg = SignalingMessage::CallRequest {
            audio_only: true,
            is_screen_share: false,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"call-request\""));
        assert!(json.contains("\"audioOnly\":true"));
        assert!(json.contains("\"isScreenShare\":false"));

        let rejected = serde_json::to_string(&SignalingMessage::CallRejected {
            reason: RejectReason::DeviceError,
        })
        .unwrap();
        assert_eq!(rejected, r#"{"type":"call-rejected","reason":"device_error"}"#);

        assert_eq!(
            serde_json::to_string(&SignalingMessage::CallEnd).unwrap(),
            r#"{"type":"call-end"}"#
        );
    }

    #[test]
    fn missing_flags_default_to_false() {
        let msg: SignalingMessage =
            serde_json::from_str(r#"{"type":"offer","sdp":"v=0\r\n"}"#).unwrap();
        assert_eq!(
            msg,
            SignalingMessage::Offer {
                sdp: "v=0\r\n".to_string(),
                audio_only: false,
                is_screen_share: false,
            }
        );
        assert_eq!(msg.kind_name(), "offer");
        assert!(msg.is_description());
    }

    #[test]
    fn unknown_type_is_rejected() {
        let res = serde_json::from_str::<SignalingMessage>(r#"{"type":"video-call-ring"}"#);
        assert!(res.is_err());
    }

    #[test]
    fn terminal_messages() {
        assert!(SignalingMessage::CallCancel.is_terminal());
        assert!(SignalingMessage::CallEnd.is_terminal());
        assert!(SignalingMessage::CallRejected {
            reason: RejectReason::Busy
        }
        .is_terminal());
        assert!(!SignalingMessage::CallRequest {
            audio_only: false,
            is_screen_share: false
        }
        .is_terminal());
    }
}
