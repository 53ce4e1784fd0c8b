//! Call and quality notifications
//!
//! The engine publishes everything a UI needs to render on one broadcast
//! channel. Publishing never blocks and never fails; with no subscriber the
//! event is simply dropped.

use crate::identity::PeerIdentity;
use crate::types::{CallRole, EndReason, MediaKind, MediaMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Severity of a user-facing notice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeSeverity {
    /// Informational
    Info,
    /// Degraded but continuing
    Warning,
    /// The call could not continue
    Error,
}

/// Events emitted by the call engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "I: PeerIdentity")]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CallEvent<I: PeerIdentity> {
    /// An outgoing request was sent
    Requested {
        /// Callee
        peer: I,
        /// Requested media
        mode: MediaMode,
    },
    /// An incoming request is waiting for the local user
    Ringing {
        /// Caller
        peer: I,
        /// Requested media
        mode: MediaMode,
    },
    /// The description exchange completed
    Active {
        /// Remote peer
        peer: I,
        /// Local role
        role: CallRole,
    },
    /// The session is gone
    Ended {
        /// Remote peer
        peer: I,
        /// Why it ended
        reason: EndReason,
    },
    /// The adaptive controller switched a sender profile
    ProfileChanged {
        /// Remote peer
        peer: I,
        /// Media kind
        kind: MediaKind,
        /// New level name
        level_name: String,
        /// New level index
        index: usize,
    },
    /// Something the user should be told about
    Notice {
        /// Peer concerned, if any
        peer: Option<I>,
        /// Severity
        severity: NoticeSeverity,
        /// Message text
        message: String,
        /// When it happened
        at: DateTime<Utc>,
    },
}

/// Broadcast publisher for [`CallEvent`]s
#[derive(Debug, Clone)]
pub struct EventNotifier<I: PeerIdentity> {
    sender: broadcast::Sender<CallEvent<I>>,
}

impl<I: PeerIdentity> EventNotifier<I> {
    /// Create a notifier buffering up to `capacity` events per subscriber
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to future events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent<I>> {
        self.sender.subscribe()
    }

    /// Publish an event
    pub fn publish(&self, event: CallEvent<I>) {
        tracing::trace!(event = ?event, "Publishing call event");
        let _ = self.sender.send(event);
    }

    /// Publish a user-facing notice
    pub fn notice(&self, peer: Option<&I>, severity: NoticeSeverity, message: impl Into<String>) {
        let message = message.into();
        match severity {
            NoticeSeverity::Info => tracing::info!(message = %message, "Call notice"),
            NoticeSeverity::Warning => tracing::warn!(message = %message, "Call notice"),
            NoticeSeverity::Error => tracing::error!(message = %message, "Call notice"),
        }
        self.publish(CallEvent::Notice {
            peer: peer.cloned(),
            severity,
            message,
            at: Utc::now(),
        });
    }
}

impl<I: PeerIdentity> Default for EventNotifier<I> {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::identity::PeerIdentityString;

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let notifier = EventNotifier::<PeerIdentityString>::default();
        let mut rx = notifier.subscribe();
        let peer = PeerIdentityString::new("bob");

        notifier.publish(CallEvent::Requested {
            peer: peer.clone(),
            mode: MediaMode::AudioOnly,
        });
        notifier.notice(Some(&peer), NoticeSeverity::Warning, "camera off");

        assert!(matches!(rx.recv().await.unwrap(), CallEvent::Requested { .. }));
        assert!(matches!(
            rx.recv().await.unwrap(),
            CallEvent::Notice { severity: NoticeSeverity::Warning, ref message, .. } if message == "camera off"
        ));
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        let notifier = EventNotifier::<PeerIdentityString>::new(1);
        notifier.publish(CallEvent::Ended {
            peer: PeerIdentityString::new("bob"),
            reason: EndReason::Timeout,
        });
    }

    #[test]
    fn profile_change_json_shape() {
        let event = CallEvent::ProfileChanged {
            peer: PeerIdentityString::new("bob"),
            kind: MediaKind::Audio,
            level_name: "Low".to_string(),
            index: 1,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"profile_changed\""));
        assert!(json.contains("\"kind\":\"audio\""));
        assert!(json.contains("\"index\":1"));
    }
}
