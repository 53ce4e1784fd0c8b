//! Description shaping against generated descriptions and arbitrary parameters

use peercall_core::peer::OfferOptions;
use peercall_core::profiles::default_audio_profiles;
use peercall_core::sdp::{
    apply_audio_codec_params, audio_codec_params, shape_transceivers, CodecPreferences,
};
use peercall_core::sim::SimulatedPeerLink;
use peercall_core::{MediaKind, PeerLink};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8, MIME_TYPE_VP9};

async fn generated_offer() -> String {
    let link = SimulatedPeerLink::new();
    link.create_offer(OfferOptions::default()).await.unwrap()
}

#[tokio::test]
async fn every_audio_profile_lands_in_the_offer() {
    let offer = generated_offer().await;
    for profile in default_audio_profiles().iter() {
        let shaped = apply_audio_codec_params(&offer, &profile.codec_params);
        assert_eq!(audio_codec_params(&shaped), Some(profile.codec_params.clone()));
        assert_eq!(shaped.lines().count(), offer.lines().count());
        assert!(shaped.contains("a=rtpmap:0 PCMU/8000\r\n"));
        assert!(shaped.ends_with("\r\n"));
    }
}

#[tokio::test]
async fn preferences_narrow_audio_and_order_video() {
    let link = SimulatedPeerLink::new();
    shape_transceivers(&link, &CodecPreferences::default(), true).await;

    let audio = link.codec_preferences(MediaKind::Audio).unwrap();
    assert_eq!(audio.len(), 1);
    assert_eq!(audio[0].mime_type, MIME_TYPE_OPUS);
    assert_eq!(audio[0].channels, 1);
    assert_eq!(audio[0].clock_rate, 48_000);

    let video: Vec<String> = link
        .codec_preferences(MediaKind::Video)
        .unwrap()
        .into_iter()
        .map(|c| c.mime_type)
        .collect();
    assert_eq!(video, vec![MIME_TYPE_VP9, MIME_TYPE_VP8, MIME_TYPE_H264]);
}

#[tokio::test]
async fn audio_only_sessions_leave_video_alone() {
    let link = SimulatedPeerLink::new();
    shape_transceivers(&link, &CodecPreferences::default(), false).await;
    assert!(link.codec_preferences(MediaKind::Audio).is_some());
    assert!(link.codec_preferences(MediaKind::Video).is_none());
}

#[tokio::test]
async fn engines_without_preference_support_are_skipped() {
    let link = SimulatedPeerLink::without_codec_preferences();
    shape_transceivers(&link, &CodecPreferences::default(), true).await;
    assert!(link.codec_preferences(MediaKind::Audio).is_none());
    assert!(link.codec_preferences(MediaKind::Video).is_none());
}

#[test]
fn descriptions_without_opus_pass_through() {
    let sdp = "v=0\nm=audio 9 RTP/AVP 0\na=rtpmap:0 PCMU/8000\n";
    assert_eq!(apply_audio_codec_params(sdp, "minptime=10"), sdp);
    assert_eq!(audio_codec_params(sdp), None);
}

#[test]
fn bare_newlines_are_kept() {
    let sdp = "v=0\nm=audio 9 RTP/AVP 111\na=rtpmap:111 opus/48000/2\n";
    let shaped = apply_audio_codec_params(sdp, "cbr=1");
    assert_eq!(
        shaped,
        "v=0\nm=audio 9 RTP/AVP 111\na=rtpmap:111 opus/48000/2\na=fmtp:111 cbr=1\n"
    );
}

fn arb_params() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,12}=[0-9]{1,6}(;[a-z][a-z0-9-]{0,12}=[0-9]{1,6}){0,6}"
}

proptest! {
    #[test]
    fn shaping_is_idempotent(params in arb_params(), crlf in any::<bool>()) {
        let base = "v=0\nm=audio 9 RTP/AVP 111 0\na=rtpmap:111 opus/48000/2\na=fmtp:111 minptime=10\na=rtpmap:0 PCMU/8000\n";
        let sdp = if crlf { base.replace('\n', "\r\n") } else { base.to_string() };
        let once = apply_audio_codec_params(&sdp, &params);
        let twice = apply_audio_codec_params(&once, &params);
        prop_assert_eq!(&once, &twice);
        prop_assert_eq!(audio_codec_params(&once), Some(params));
        prop_assert_eq!(once.lines().count(), sdp.lines().count());
    }

    #[test]
    fn last_applied_parameters_win(first in arb_params(), second in arb_params()) {
        let sdp = "v=0\r\nm=audio 9 RTP/AVP 111\r\na=rtpmap:111 opus/48000\r\n";
        let shaped = apply_audio_codec_params(&apply_audio_codec_params(sdp, &first), &second);
        prop_assert_eq!(audio_codec_params(&shaped), Some(second));
        prop_assert_eq!(shaped.matches("a=fmtp:111").count(), 1);
    }
}
