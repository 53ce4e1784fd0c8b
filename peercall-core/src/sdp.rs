//! Session description codec shaping
//!
//! Two jobs run on every offer and answer the engine creates:
//!
//! - transceiver codec preferences are narrowed to a fixed ordering
//!   (opus mono for audio; VP9, VP8, H264 for video);
//! - the opus `a=fmtp` line in the generated text is rewritten to the codec
//!   parameters of the currently selected audio profile.

use crate::peer::PeerLink;
use crate::types::MediaKind;
use serde::{Deserialize, Serialize};
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8, MIME_TYPE_VP9};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

/// Opus parameters used when no profile string is available
pub const DEFAULT_OPUS_FMTP: &str =
    "minptime=10;useinbandfec=1;stereo=0;maxaveragebitrate=24000;cbr=0;maxplaybackrate=16000;sprop-stereo=0";

/// A codec the engine prefers, matched against engine capabilities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecSpec {
    /// MIME type, compared case-insensitively
    pub mime_type: String,
    /// Clock rate; `None` matches any
    #[serde(default)]
    pub clock_rate: Option<u32>,
    /// Channel count; `None` matches any
    #[serde(default)]
    pub channels: Option<u16>,
}

impl CodecSpec {
    fn new(mime_type: &str, clock_rate: Option<u32>, channels: Option<u16>) -> Self {
        Self {
            mime_type: mime_type.to_string(),
            clock_rate,
            channels,
        }
    }

    /// Whether an engine capability satisfies this entry
    #[must_use]
    pub fn matches(&self, capability: &RTCRtpCodecCapability) -> bool {
        capability.mime_type.eq_ignore_ascii_case(&self.mime_type)
            && self.clock_rate.map_or(true, |rate| capability.clock_rate == rate)
            && self.channels.map_or(true, |ch| capability.channels == ch)
    }
}

/// Codec ordering imposed on transceivers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecPreferences {
    /// Audio codecs, most preferred first
    pub audio: Vec<CodecSpec>,
    /// Video codecs, most preferred first
    pub video: Vec<CodecSpec>,
}

impl Default for CodecPreferences {
    fn default() -> Self {
        Self {
            audio: vec![CodecSpec::new(MIME_TYPE_OPUS, Some(48_000), Some(1))],
            video: vec![
                CodecSpec::new(MIME_TYPE_VP9, None, None),
                CodecSpec::new(MIME_TYPE_VP8, None, None),
                CodecSpec::new(MIME_TYPE_H264, None, None),
            ],
        }
    }
}

impl CodecPreferences {
    /// Specs for a media kind
    #[must_use]
    pub fn for_kind(&self, kind: MediaKind) -> &[CodecSpec] {
        match kind {
            MediaKind::Audio => &self.audio,
            MediaKind::Video => &self.video,
        }
    }

    /// Engine capabilities ordered by preference
    ///
    /// Audio keeps only the first capability per entry so the transceiver ends
    /// up with a single opus entry. Video keeps every matching capability
    /// (several H264 profiles, for example) grouped by entry order.
    #[must_use]
    pub fn select(
        &self,
        kind: MediaKind,
        capabilities: &[RTCRtpCodecCapability],
    ) -> Vec<RTCRtpCodecCapability> {
        let mut selected = Vec::new();
        for spec in self.for_kind(kind) {
            let matching = capabilities.iter().filter(|c| spec.matches(c));
            match kind {
                MediaKind::Audio => selected.extend(matching.take(1).cloned()),
                MediaKind::Video => selected.extend(matching.cloned()),
            }
        }
        selected
    }
}

/// Narrow the link's transceivers to the preferred codecs
///
/// Video is only shaped when the session sends video. Failures are logged and
/// leave the engine defaults in place.
pub async fn shape_transceivers(link: &dyn PeerLink, prefs: &CodecPreferences, sends_video: bool) {
    if !link.supports_codec_preferences() {
        tracing::warn!("Codec preferences not supported, using engine defaults");
        return;
    }

    for kind in MediaKind::ALL {
        if kind == MediaKind::Video && !sends_video {
            continue;
        }
        let selected = prefs.select(kind, &link.codec_capabilities(kind));
        if selected.is_empty() {
            tracing::warn!(kind = %kind, "No preferred codec offered by the engine");
            continue;
        }
        let names: Vec<&str> = selected.iter().map(|c| c.mime_type.as_str()).collect();
        match link.set_codec_preferences(kind, selected.clone()).await {
            Ok(()) => tracing::debug!(kind = %kind, codecs = ?names, "Codec preferences applied"),
            Err(e) => tracing::warn!(kind = %kind, error = %e, "Failed to apply codec preferences"),
        }
    }
}

/// Payload types mapped to opus at 48 kHz
#[must_use]
pub fn opus_payload_types(sdp: &str) -> Vec<String> {
    sdp.lines().filter_map(opus_rtpmap_payload_type).collect()
}

fn opus_rtpmap_payload_type(line: &str) -> Option<String> {
    let rest = line.strip_prefix("a=rtpmap:")?;
    let (pt, encoding) = rest.split_once(' ')?;
    if pt.is_empty() || !pt.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match encoding.trim_end() {
        "opus/48000" | "opus/48000/2" => Some(pt.to_string()),
        _ => None,
    }
}

fn is_fmtp_for(line: &str, pt: &str) -> bool {
    line.strip_prefix("a=fmtp:")
        .and_then(|rest| rest.strip_prefix(pt))
        .map_or(false, |rest| rest.starts_with(' '))
}

/// Rewrite every opus `a=fmtp` line to `params`
///
/// An existing line for an opus payload type is replaced in place; otherwise a
/// new line is inserted right after the `a=rtpmap` line. Line endings and the
/// trailing newline of the input are preserved. Applying the transform twice
/// with the same parameters gives the same text.
#[must_use]
pub fn apply_audio_codec_params(sdp: &str, params: &str) -> String {
    let payload_types = opus_payload_types(sdp);
    if payload_types.is_empty() {
        tracing::debug!("No opus payload type in description, leaving it unchanged");
        return sdp.to_string();
    }

    let eol = if sdp.contains("\r\n") { "\r\n" } else { "\n" };
    let lines: Vec<&str> = sdp.lines().collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len() + payload_types.len());

    for line in &lines {
        if let Some(pt) = payload_types.iter().find(|pt| is_fmtp_for(line, pt)) {
            out.push(format!("a=fmtp:{pt} {params}"));
            continue;
        }
        out.push((*line).to_string());
        if let Some(pt) = opus_rtpmap_payload_type(line) {
            if !lines.iter().any(|l| is_fmtp_for(l, &pt)) {
                out.push(format!("a=fmtp:{pt} {params}"));
            }
        }
    }

    let mut shaped = out.join(eol);
    if sdp.ends_with('\n') {
        shaped.push_str(eol);
    }
    shaped
}

/// The opus parameters currently carried by a description, if any
#[must_use]
pub fn audio_codec_params(sdp: &str) -> Option<String> {
    let pt = opus_payload_types(sdp).into_iter().next()?;
    sdp.lines()
        .find(|line| is_fmtp_for(line, &pt))
        .and_then(|line| line.split_once(' '))
        .map(|(_, params)| params.trim().to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const OFFER: &str = "v=0\r\n\
o=- 1 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111 0\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=fmtp:111 minptime=10;useinbandfec=1\r\n\
a=rtpmap:0 PCMU/8000\r\n";

    fn cap(mime: &str, clock_rate: u32, channels: u16) -> RTCRtpCodecCapability {
        RTCRtpCodecCapability {
            mime_type: mime.to_string(),
            clock_rate,
            channels,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        }
    }

    #[test]
    fn replaces_existing_fmtp_in_place() {
        let shaped = apply_audio_codec_params(OFFER, "minptime=40;cbr=1");
        let expected = OFFER.replace(
            "a=fmtp:111 minptime=10;useinbandfec=1",
            "a=fmtp:111 minptime=40;cbr=1",
        );
        assert_eq!(shaped, expected);
    }

    #[test]
    fn inserts_fmtp_after_rtpmap() {
        let sdp = "m=audio 9 RTP/AVP 109\na=rtpmap:109 opus/48000\na=sendrecv\n";
        let shaped = apply_audio_codec_params(sdp, "stereo=0");
        assert_eq!(
            shaped,
            "m=audio 9 RTP/AVP 109\na=rtpmap:109 opus/48000\na=fmtp:109 stereo=0\na=sendrecv\n"
        );
    }

    #[test]
    fn leaves_other_codecs_alone() {
        let sdp = "a=rtpmap:1111 opus/48000/2\r\na=fmtp:1111 x=1\r\na=fmtp:111 y=2";
        assert_eq!(opus_payload_types(sdp), vec!["1111".to_string()]);
        let shaped = apply_audio_codec_params(sdp, "z=3");
        assert_eq!(shaped, "a=rtpmap:1111 opus/48000/2\r\na=fmtp:1111 z=3\r\na=fmtp:111 y=2");
    }

    #[test]
    fn no_opus_is_a_no_op() {
        let sdp = "m=audio 9 RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\n";
        assert_eq!(apply_audio_codec_params(sdp, "x"), sdp);
    }

    #[test]
    fn reads_back_applied_params() {
        let shaped = apply_audio_codec_params(OFFER, DEFAULT_OPUS_FMTP);
        assert_eq!(audio_codec_params(&shaped).as_deref(), Some(DEFAULT_OPUS_FMTP));
    }

    #[test]
    fn audio_selection_keeps_single_mono_opus() {
        let caps = vec![
            cap("audio/PCMU", 8_000, 1),
            cap("audio/opus", 48_000, 2),
            cap("audio/opus", 48_000, 1),
            cap("audio/OPUS", 48_000, 1),
        ];
        let selected = CodecPreferences::default().select(MediaKind::Audio, &caps);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].channels, 1);
    }

    #[test]
    fn video_selection_follows_preference_order() {
        let caps = vec![
            cap("video/H264", 90_000, 0),
            cap("video/VP8", 90_000, 0),
            cap("video/AV1", 90_000, 0),
            cap("video/VP9", 90_000, 0),
            cap("video/H264", 90_000, 0),
        ];
        let selected = CodecPreferences::default().select(MediaKind::Video, &caps);
        let names: Vec<&str> = selected.iter().map(|c| c.mime_type.as_str()).collect();
        assert_eq!(names, vec!["video/VP9", "video/VP8", "video/H264", "video/H264"]);
    }
}
