//! Signaling wire format and message routing tests

mod common;

use common::{static_quality, Event, Pair};
use peercall_core::sim::{CaptureScript, MemoryHub};
use peercall_core::{
    CallPhase, PeerIdentityString, RejectReason, SignalingHandler, SignalingMessage,
    SignalingTransport,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn parses_messages_as_sent_by_other_clients() {
    let cases = [
        (
            r#"{"type":"call-request","audioOnly":true,"isScreenShare":false}"#,
            SignalingMessage::CallRequest {
                audio_only: true,
                is_screen_share: false,
            },
        ),
        (
            r#"{"type":"call-accepted","audioOnly":false}"#,
            SignalingMessage::CallAccepted {
                audio_only: false,
                is_screen_share: false,
            },
        ),
        (
            r#"{"type":"call-rejected","reason":"busy"}"#,
            SignalingMessage::CallRejected {
                reason: RejectReason::Busy,
            },
        ),
        (r#"{"type":"call-cancel"}"#, SignalingMessage::CallCancel),
        (
            r#"{"type":"answer","sdp":"v=0\r\n","audioOnly":true,"isScreenShare":true}"#,
            SignalingMessage::Answer {
                sdp: "v=0\r\n".to_string(),
                audio_only: true,
                is_screen_share: true,
            },
        ),
        (r#"{"type":"call-end"}"#, SignalingMessage::CallEnd),
    ];
    for (json, expected) in cases {
        let parsed: SignalingMessage = serde_json::from_str(json).unwrap();
        assert_eq!(parsed, expected);
    }
}

#[test]
fn offer_serializes_with_camel_case_fields() {
    let offer = SignalingMessage::Offer {
        sdp: "v=0\r\n".to_string(),
        audio_only: false,
        is_screen_share: true,
    };
    let value = serde_json::to_value(&offer).unwrap();
    assert_eq!(
        value,
        serde_json::json!({
            "type": "offer",
            "sdp": "v=0\r\n",
            "audioOnly": false,
            "isScreenShare": true
        })
    );
}

#[test]
fn malformed_messages_are_rejected() {
    for json in [
        r#"{"type":"call-rejected","reason":"bored"}"#,
        r#"{"type":"offer"}"#,
        r#"{"audioOnly":true}"#,
    ] {
        assert!(serde_json::from_str::<SignalingMessage>(json).is_err(), "{json}");
    }
}

#[tokio::test]
async fn handler_preserves_order() {
    let hub = MemoryHub::new();
    let alice = Arc::new(hub.endpoint(PeerIdentityString::new("alice")));
    let bob = Arc::new(hub.endpoint(PeerIdentityString::new("bob")));
    let handler = SignalingHandler::new(bob.clone());

    alice
        .send_message(bob.id(), SignalingMessage::CallCancel)
        .await
        .unwrap();
    alice
        .send_message(bob.id(), SignalingMessage::CallEnd)
        .await
        .unwrap();

    let (_, first) = handler.receive_message().await.unwrap();
    let (from, second) = handler.receive_message().await.unwrap();
    assert_eq!(first, SignalingMessage::CallCancel);
    assert_eq!(second, SignalingMessage::CallEnd);
    assert_eq!(from, PeerIdentityString::new("alice"));
}

#[tokio::test]
async fn run_loop_dispatches_incoming_requests() {
    let mut pair = Pair::new();
    let bob = pair.bob.engine.clone();
    let pump = tokio::spawn(async move { bob.run().await });

    pair.alice
        .engine
        .initiate_call(pair.bob.id.clone(), peercall_core::MediaMode::AudioOnly)
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), pair.bob.events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, Event::Ringing { ref peer, .. } if *peer == pair.alice.id));
    assert_eq!(pair.bob.engine.phase().await, CallPhase::PendingIncoming);
    pump.abort();
}

#[tokio::test]
async fn messages_from_outside_the_call_are_ignored() {
    let pair = Pair::with(
        static_quality(),
        static_quality(),
        CaptureScript::default(),
        CaptureScript::default(),
    );
    pair.establish(peercall_core::MediaMode::AudioOnly).await;
    pair.hub.clear_log();

    let mallory = PeerIdentityString::new("mallory");
    for message in [
        SignalingMessage::CallEnd,
        SignalingMessage::CallCancel,
        SignalingMessage::CallAccepted {
            audio_only: true,
            is_screen_share: false,
        },
        SignalingMessage::Offer {
            sdp: "v=0\r\n".to_string(),
            audio_only: true,
            is_screen_share: false,
        },
    ] {
        pair.alice
            .engine
            .handle_message(mallory.clone(), message)
            .await
            .unwrap();
    }

    assert_eq!(pair.alice.engine.phase().await, CallPhase::Active);
    assert!(pair.hub.sent().is_empty());
}

#[tokio::test]
async fn stray_accept_while_idle_is_ignored() {
    let pair = Pair::new();
    pair.alice
        .engine
        .handle_message(
            pair.bob.id.clone(),
            SignalingMessage::CallAccepted {
                audio_only: false,
                is_screen_share: false,
            },
        )
        .await
        .unwrap();
    assert_eq!(pair.alice.engine.phase().await, CallPhase::Idle);
    assert_eq!(pair.alice.capture.camera_requests(), 0);
    assert!(pair.hub.sent().is_empty());
}

#[test]
fn test_log_capture_can_be_installed_repeatedly() {
    common::init_tracing();
    common::init_tracing();
    tracing::debug!("log capture installed");
}
