//! In-process implementations of the engine's seams
//!
//! [`SimulatedCapture`], [`SimulatedPeerLink`] and [`MemoryHub`] let two
//! engines run a complete call inside one process. The `peercall simulate`
//! command drives them, and so do the test suites.

use crate::identity::PeerIdentityString;
use crate::media::{
    CaptureProvider, CaptureRequest, DeviceInfo, DeviceKind, MediaError, MediaTrack, TrackControl,
    TrackSource,
};
use crate::peer::{
    EncodingParameters, OfferOptions, PeerLink, PeerLinkError, PeerLinkProvider, SendParameters,
    SessionDescription,
};
use crate::signaling::{SignalingError, SignalingMessage, SignalingTransport};
use crate::stats::StatsReport;
use crate::types::MediaKind;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_PCMU, MIME_TYPE_VP8, MIME_TYPE_VP9};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

/// How the simulated devices behave
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureScript {
    /// A camera shows up in enumeration
    pub has_camera: bool,
    /// Opening the camera fails
    pub camera_fails: bool,
    /// Opening the microphone fails
    pub microphone_fails: bool,
    /// Display capture is denied
    pub display_fails: bool,
    /// Display capture comes with an audio track
    pub display_has_audio: bool,
}

impl Default for CaptureScript {
    fn default() -> Self {
        Self {
            has_camera: true,
            camera_fails: false,
            microphone_fails: false,
            display_fails: false,
            display_has_audio: true,
        }
    }
}

#[derive(Debug, Default)]
struct CaptureCounters {
    live: AtomicUsize,
    stops: AtomicUsize,
}

#[derive(Debug)]
struct SimTrackControl {
    enabled: AtomicBool,
    stopped: AtomicBool,
    counters: Arc<CaptureCounters>,
}

impl TrackControl for SimTrackControl {
    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.counters.live.fetch_sub(1, Ordering::SeqCst);
            self.counters.stops.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Scripted capture devices
#[derive(Debug)]
pub struct SimulatedCapture {
    script: Mutex<CaptureScript>,
    counters: Arc<CaptureCounters>,
    camera_requests: AtomicUsize,
    display_requests: AtomicUsize,
    next_id: AtomicUsize,
    tracks: Mutex<Vec<(String, TrackSource, Arc<SimTrackControl>)>>,
}

impl SimulatedCapture {
    /// Devices behaving per `script`
    #[must_use]
    pub fn new(script: CaptureScript) -> Self {
        Self {
            script: Mutex::new(script),
            counters: Arc::new(CaptureCounters::default()),
            camera_requests: AtomicUsize::new(0),
            display_requests: AtomicUsize::new(0),
            next_id: AtomicUsize::new(0),
            tracks: Mutex::new(Vec::new()),
        }
    }

    /// Change device behavior for later requests
    pub fn set_script(&self, script: CaptureScript) {
        *self.script.lock() = script;
    }

    /// Requests that asked for the camera
    #[must_use]
    pub fn camera_requests(&self) -> usize {
        self.camera_requests.load(Ordering::SeqCst)
    }

    /// Display capture requests
    #[must_use]
    pub fn display_requests(&self) -> usize {
        self.display_requests.load(Ordering::SeqCst)
    }

    /// Tracks opened and not yet stopped
    #[must_use]
    pub fn live_tracks(&self) -> usize {
        self.counters.live.load(Ordering::SeqCst)
    }

    /// Tracks stopped so far
    #[must_use]
    pub fn stop_calls(&self) -> usize {
        self.counters.stops.load(Ordering::SeqCst)
    }

    /// Ids of every track opened from `source`, oldest first
    #[must_use]
    pub fn track_ids(&self, source: TrackSource) -> Vec<String> {
        self.tracks
            .lock()
            .iter()
            .filter(|(_, s, _)| *s == source)
            .map(|(id, _, _)| id.clone())
            .collect()
    }

    /// Whether the track is currently enabled
    #[must_use]
    pub fn is_enabled(&self, track_id: &str) -> Option<bool> {
        self.tracks
            .lock()
            .iter()
            .find(|(id, _, _)| id == track_id)
            .map(|(_, _, control)| control.enabled.load(Ordering::SeqCst))
    }

    fn open(&self, source: TrackSource) -> MediaTrack {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("{source:?}-{n}").to_lowercase();
        let control = Arc::new(SimTrackControl {
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            counters: Arc::clone(&self.counters),
        });
        self.counters.live.fetch_add(1, Ordering::SeqCst);
        self.tracks.lock().push((id.clone(), source, Arc::clone(&control)));
        MediaTrack::new(id, source, control)
    }
}

#[async_trait]
impl CaptureProvider for SimulatedCapture {
    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, MediaError> {
        let script = *self.script.lock();
        let mut devices = vec![
            DeviceInfo {
                id: "mic-0".to_string(),
                label: "Simulated microphone".to_string(),
                kind: DeviceKind::AudioInput,
            },
            DeviceInfo {
                id: "speaker-0".to_string(),
                label: "Simulated speaker".to_string(),
                kind: DeviceKind::AudioOutput,
            },
        ];
        if script.has_camera {
            devices.push(DeviceInfo {
                id: "camera-0".to_string(),
                label: "Simulated camera".to_string(),
                kind: DeviceKind::VideoInput,
            });
        }
        Ok(devices)
    }

    async fn get_user_media(&self, request: CaptureRequest) -> Result<Vec<MediaTrack>, MediaError> {
        let script = *self.script.lock();
        if request.video {
            self.camera_requests.fetch_add(1, Ordering::SeqCst);
            if !script.has_camera {
                return Err(MediaError::DeviceNotFound("camera".to_string()));
            }
            if script.camera_fails {
                return Err(MediaError::CaptureFailed("camera is in use".to_string()));
            }
        }
        if request.audio.is_some() && script.microphone_fails {
            return Err(MediaError::CaptureFailed(
                "microphone permission denied".to_string(),
            ));
        }

        let mut tracks = Vec::new();
        if request.audio.is_some() {
            tracks.push(self.open(TrackSource::Microphone));
        }
        if request.video {
            tracks.push(self.open(TrackSource::Camera));
        }
        Ok(tracks)
    }

    async fn get_display_media(&self, with_audio: bool) -> Result<Vec<MediaTrack>, MediaError> {
        let script = *self.script.lock();
        self.display_requests.fetch_add(1, Ordering::SeqCst);
        if script.display_fails {
            return Err(MediaError::CaptureFailed(
                "display capture denied".to_string(),
            ));
        }
        let mut tracks = vec![self.open(TrackSource::Display)];
        if with_audio && script.display_has_audio {
            tracks.push(self.open(TrackSource::DisplayAudio));
        }
        Ok(tracks)
    }
}

/// Network conditions a simulated link reports
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NetworkConditions {
    /// Round-trip time in milliseconds
    pub rtt_ms: f64,
    /// Packet loss ratio
    pub packet_loss: f64,
    /// Jitter in milliseconds
    pub jitter_ms: f64,
}

impl NetworkConditions {
    /// Statistics reports describing these conditions
    ///
    /// Produces an outbound/remote-inbound pair per media kind and one
    /// succeeded candidate pair, with loss expressed over 1000 packets.
    #[must_use]
    pub fn to_reports(&self) -> Vec<StatsReport> {
        let lost = (self.packet_loss.clamp(0.0, 1.0) * 1000.0).round() as i64;
        let received = 1000 - lost.unsigned_abs();
        let mut reports = Vec::new();
        for kind in MediaKind::ALL {
            let remote_id = format!("remote-inbound-{kind}");
            reports.push(StatsReport::OutboundRtp {
                id: format!("outbound-{kind}"),
                kind,
                remote_id: Some(remote_id.clone()),
            });
            reports.push(StatsReport::RemoteInboundRtp {
                id: remote_id,
                kind,
                round_trip_time: Some(self.rtt_ms / 1000.0),
                packets_lost: Some(lost),
                packets_received: Some(received),
                packets_discarded: Some(0),
                jitter: Some(self.jitter_ms / 1000.0),
            });
        }
        reports.push(StatsReport::CandidatePair {
            id: "candidate-pair-0".to_string(),
            succeeded: true,
            current_round_trip_time: Some(self.rtt_ms / 1000.0),
        });
        reports
    }
}

#[derive(Debug)]
struct LinkState {
    signaling: RTCSignalingState,
    connection: RTCPeerConnectionState,
    local_tracks: Vec<(String, MediaKind)>,
    senders: HashMap<MediaKind, SendParameters>,
    sender_updates: usize,
    codec_preferences: HashMap<MediaKind, Vec<RTCRtpCodecCapability>>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    offers_created: usize,
    answers_created: usize,
    stats: Vec<StatsReport>,
    fail_next: Option<PeerLinkError>,
    version: u64,
}

/// A peer connection with a plausible signaling state machine and synthetic
/// descriptions
#[derive(Debug)]
pub struct SimulatedPeerLink {
    state: Mutex<LinkState>,
    codec_preferences_supported: bool,
}

impl Default for SimulatedPeerLink {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedPeerLink {
    /// A connected link in the stable state
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LinkState {
                signaling: RTCSignalingState::Stable,
                connection: RTCPeerConnectionState::Connected,
                local_tracks: Vec::new(),
                senders: HashMap::new(),
                sender_updates: 0,
                codec_preferences: HashMap::new(),
                local_description: None,
                remote_description: None,
                offers_created: 0,
                answers_created: 0,
                stats: Vec::new(),
                fail_next: None,
                version: 1,
            }),
            codec_preferences_supported: true,
        }
    }

    /// A link whose engine cannot reorder codecs
    #[must_use]
    pub fn without_codec_preferences() -> Self {
        Self {
            codec_preferences_supported: false,
            ..Self::new()
        }
    }

    /// Set the reported connection state
    pub fn set_connection_state(&self, connection: RTCPeerConnectionState) {
        self.state.lock().connection = connection;
    }

    /// Force the signaling state
    pub fn set_signaling_state(&self, signaling: RTCSignalingState) {
        self.state.lock().signaling = signaling;
    }

    /// Replace the statistics snapshot
    pub fn set_stats(&self, stats: Vec<StatsReport>) {
        self.state.lock().stats = stats;
    }

    /// Report `conditions` from now on
    pub fn set_network(&self, conditions: NetworkConditions) {
        self.set_stats(conditions.to_reports());
    }

    /// Make the next description operation fail with `error`
    pub fn fail_next(&self, error: PeerLinkError) {
        self.state.lock().fail_next = Some(error);
    }

    /// Last applied local description
    #[must_use]
    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local_description.clone()
    }

    /// Last applied remote description
    #[must_use]
    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote_description.clone()
    }

    /// Offers created so far
    #[must_use]
    pub fn offers_created(&self) -> usize {
        self.state.lock().offers_created
    }

    /// Answers created so far
    #[must_use]
    pub fn answers_created(&self) -> usize {
        self.state.lock().answers_created
    }

    /// Current parameters of the sender for `kind`
    #[must_use]
    pub fn sender(&self, kind: MediaKind) -> Option<SendParameters> {
        self.state.lock().senders.get(&kind).cloned()
    }

    /// Number of sender parameter updates applied
    #[must_use]
    pub fn sender_updates(&self) -> usize {
        self.state.lock().sender_updates
    }

    /// Codec order applied to the transceiver for `kind`
    #[must_use]
    pub fn codec_preferences(&self, kind: MediaKind) -> Option<Vec<RTCRtpCodecCapability>> {
        self.state.lock().codec_preferences.get(&kind).cloned()
    }

    /// Attached local tracks
    #[must_use]
    pub fn local_track_count(&self) -> usize {
        self.state.lock().local_tracks.len()
    }

    fn check_failure(state: &mut LinkState) -> Result<(), PeerLinkError> {
        state.fail_next.take().map_or(Ok(()), Err)
    }

    fn describe(state: &mut LinkState, video: bool) -> String {
        state.version += 1;
        let mut sdp = format!(
            "v=0\r\no=- 4611731400430051336 {} IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            state.version
        );
        sdp.push_str("m=audio 9 UDP/TLS/RTP/SAVPF 111 0\r\nc=IN IP4 0.0.0.0\r\na=mid:0\r\n");
        sdp.push_str("a=rtpmap:111 opus/48000/2\r\na=fmtp:111 minptime=10;useinbandfec=1\r\n");
        sdp.push_str("a=rtpmap:0 PCMU/8000\r\n");
        if video {
            sdp.push_str("m=video 9 UDP/TLS/RTP/SAVPF 98 96\r\nc=IN IP4 0.0.0.0\r\na=mid:1\r\n");
            sdp.push_str("a=rtpmap:98 VP9/90000\r\na=rtpmap:96 VP8/90000\r\n");
        }
        sdp
    }
}

fn capability(mime_type: &str, clock_rate: u32, channels: u16, fmtp: &str) -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: mime_type.to_string(),
        clock_rate,
        channels,
        sdp_fmtp_line: fmtp.to_string(),
        rtcp_feedback: vec![],
    }
}

#[async_trait]
impl PeerLink for SimulatedPeerLink {
    async fn add_local_track(&self, track: &MediaTrack) -> Result<(), PeerLinkError> {
        let mut state = self.state.lock();
        if state.connection == RTCPeerConnectionState::Closed {
            return Err(PeerLinkError::Closed);
        }
        state
            .local_tracks
            .push((track.id().to_string(), track.kind()));
        state.senders.entry(track.kind()).or_insert_with(|| SendParameters {
            encodings: vec![EncodingParameters::default()],
        });
        Ok(())
    }

    async fn remove_local_tracks(&self) -> Result<(), PeerLinkError> {
        let mut state = self.state.lock();
        state.local_tracks.clear();
        state.senders.clear();
        Ok(())
    }

    fn supports_codec_preferences(&self) -> bool {
        self.codec_preferences_supported
    }

    fn codec_capabilities(&self, kind: MediaKind) -> Vec<RTCRtpCodecCapability> {
        match kind {
            MediaKind::Audio => vec![
                capability(MIME_TYPE_OPUS, 48_000, 2, "minptime=10;useinbandfec=1"),
                capability(MIME_TYPE_OPUS, 48_000, 1, "minptime=10;useinbandfec=1"),
                capability(MIME_TYPE_PCMU, 8_000, 1, ""),
            ],
            MediaKind::Video => vec![
                capability(MIME_TYPE_VP8, 90_000, 0, ""),
                capability(MIME_TYPE_H264, 90_000, 0, "profile-level-id=42e01f"),
                capability(MIME_TYPE_VP9, 90_000, 0, "profile-id=0"),
            ],
        }
    }

    async fn set_codec_preferences(
        &self,
        kind: MediaKind,
        codecs: Vec<RTCRtpCodecCapability>,
    ) -> Result<(), PeerLinkError> {
        if !self.codec_preferences_supported {
            return Err(PeerLinkError::Unsupported("codec preferences".to_string()));
        }
        self.state.lock().codec_preferences.insert(kind, codecs);
        Ok(())
    }

    async fn create_offer(&self, options: OfferOptions) -> Result<String, PeerLinkError> {
        let mut state = self.state.lock();
        Self::check_failure(&mut state)?;
        if !matches!(
            state.signaling,
            RTCSignalingState::Stable | RTCSignalingState::HaveLocalOffer
        ) {
            return Err(PeerLinkError::InvalidState(format!(
                "cannot create offer in {:?}",
                state.signaling
            )));
        }
        let video = options.offer_to_receive_video || state.senders.contains_key(&MediaKind::Video);
        state.offers_created += 1;
        Ok(Self::describe(&mut state, video))
    }

    async fn create_answer(&self) -> Result<String, PeerLinkError> {
        let mut state = self.state.lock();
        Self::check_failure(&mut state)?;
        if state.signaling != RTCSignalingState::HaveRemoteOffer {
            return Err(PeerLinkError::InvalidState(format!(
                "cannot create answer in {:?}",
                state.signaling
            )));
        }
        let video = state
            .remote_description
            .as_ref()
            .map_or(false, |d| d.sdp.contains("m=video"));
        state.answers_created += 1;
        Ok(Self::describe(&mut state, video))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerLinkError> {
        let mut state = self.state.lock();
        Self::check_failure(&mut state)?;
        let next = match (desc.sdp_type, state.signaling) {
            (RTCSdpType::Offer, RTCSignalingState::Stable | RTCSignalingState::HaveLocalOffer) => {
                RTCSignalingState::HaveLocalOffer
            }
            (RTCSdpType::Answer, RTCSignalingState::HaveRemoteOffer) => RTCSignalingState::Stable,
            (sdp_type, signaling) => {
                return Err(PeerLinkError::InvalidState(format!(
                    "cannot apply local {sdp_type:?} in {signaling:?}"
                )))
            }
        };
        state.signaling = next;
        state.local_description = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerLinkError> {
        let mut state = self.state.lock();
        Self::check_failure(&mut state)?;
        let next = match (desc.sdp_type, state.signaling) {
            (RTCSdpType::Offer, RTCSignalingState::Stable | RTCSignalingState::HaveRemoteOffer) => {
                RTCSignalingState::HaveRemoteOffer
            }
            (RTCSdpType::Answer, RTCSignalingState::HaveLocalOffer) => RTCSignalingState::Stable,
            (sdp_type, signaling) => {
                return Err(PeerLinkError::InvalidState(format!(
                    "cannot apply remote {sdp_type:?} in {signaling:?}"
                )))
            }
        };
        state.signaling = next;
        state.remote_description = Some(desc);
        Ok(())
    }

    fn signaling_state(&self) -> RTCSignalingState {
        self.state.lock().signaling
    }

    fn connection_state(&self) -> RTCPeerConnectionState {
        self.state.lock().connection
    }

    async fn sender_parameters(&self, kind: MediaKind) -> Option<SendParameters> {
        self.state.lock().senders.get(&kind).cloned()
    }

    async fn set_sender_parameters(
        &self,
        kind: MediaKind,
        params: SendParameters,
    ) -> Result<(), PeerLinkError> {
        let mut state = self.state.lock();
        let Some(sender) = state.senders.get_mut(&kind) else {
            return Err(PeerLinkError::InvalidState(format!("no {kind} sender")));
        };
        *sender = params;
        state.sender_updates += 1;
        Ok(())
    }

    async fn get_stats(&self) -> Result<Vec<StatsReport>, PeerLinkError> {
        let state = self.state.lock();
        if state.connection == RTCPeerConnectionState::Closed {
            return Err(PeerLinkError::Closed);
        }
        Ok(state.stats.clone())
    }
}

/// Connection layer stand-in: one [`SimulatedPeerLink`] per peer
#[derive(Debug, Default)]
pub struct SimulatedLinks {
    links: Mutex<HashMap<PeerIdentityString, Arc<SimulatedPeerLink>>>,
}

impl SimulatedLinks {
    /// No peers connected
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect to `peer`, reusing an existing link
    pub fn connect(&self, peer: &PeerIdentityString) -> Arc<SimulatedPeerLink> {
        Arc::clone(
            self.links
                .lock()
                .entry(peer.clone())
                .or_insert_with(|| Arc::new(SimulatedPeerLink::new())),
        )
    }

    /// Register a specific link for `peer`
    pub fn insert(&self, peer: PeerIdentityString, link: Arc<SimulatedPeerLink>) {
        self.links.lock().insert(peer, link);
    }

    /// The link to `peer`
    #[must_use]
    pub fn get(&self, peer: &PeerIdentityString) -> Option<Arc<SimulatedPeerLink>> {
        self.links.lock().get(peer).cloned()
    }

    /// Drop the link to `peer`
    pub fn disconnect(&self, peer: &PeerIdentityString) -> Option<Arc<SimulatedPeerLink>> {
        self.links.lock().remove(peer)
    }
}

impl PeerLinkProvider<PeerIdentityString> for SimulatedLinks {
    fn link(&self, peer: &PeerIdentityString) -> Option<Arc<dyn PeerLink>> {
        self.get(peer).map(|link| link as Arc<dyn PeerLink>)
    }
}

/// A message recorded by the hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    /// Sender
    pub from: PeerIdentityString,
    /// Addressee
    pub to: PeerIdentityString,
    /// Payload
    pub message: SignalingMessage,
}

type Envelope = (PeerIdentityString, SignalingMessage);

#[derive(Debug, Default)]
struct HubState {
    inboxes: HashMap<PeerIdentityString, mpsc::UnboundedSender<Envelope>>,
    log: Vec<SentMessage>,
}

/// Reliable, ordered in-memory signaling relay
///
/// Every message is logged. Messages to an identity without an endpoint are
/// logged and dropped.
#[derive(Debug, Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    /// Empty hub
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint for `id`, replacing any previous one
    #[must_use]
    pub fn endpoint(&self, id: PeerIdentityString) -> MemoryTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().inboxes.insert(id.clone(), tx);
        MemoryTransport {
            id,
            hub: self.clone(),
            inbox: tokio::sync::Mutex::new(rx),
        }
    }

    /// Every message sent so far
    #[must_use]
    pub fn sent(&self) -> Vec<SentMessage> {
        self.state.lock().log.clone()
    }

    /// Messages sent by `from`
    #[must_use]
    pub fn sent_by(&self, from: &PeerIdentityString) -> Vec<SignalingMessage> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|m| &m.from == from)
            .map(|m| m.message.clone())
            .collect()
    }

    /// Count of messages of a given wire type sent by `from`
    #[must_use]
    pub fn count(&self, from: &PeerIdentityString, kind_name: &str) -> usize {
        self.state
            .lock()
            .log
            .iter()
            .filter(|m| &m.from == from && m.message.kind_name() == kind_name)
            .count()
    }

    /// Forget the log
    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    fn deliver(&self, from: &PeerIdentityString, to: &PeerIdentityString, message: SignalingMessage) {
        let mut state = self.state.lock();
        state.log.push(SentMessage {
            from: from.clone(),
            to: to.clone(),
            message: message.clone(),
        });
        match state.inboxes.get(to) {
            Some(inbox) => {
                if inbox.send((from.clone(), message)).is_err() {
                    tracing::debug!(to = %to, "Endpoint gone, message dropped");
                }
            }
            None => tracing::trace!(to = %to, "No endpoint registered, message dropped"),
        }
    }
}

/// One identity's connection to a [`MemoryHub`]
#[derive(Debug)]
pub struct MemoryTransport {
    id: PeerIdentityString,
    hub: MemoryHub,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>,
}

impl MemoryTransport {
    /// Identity of this endpoint
    #[must_use]
    pub fn id(&self) -> &PeerIdentityString {
        &self.id
    }

    /// Hub this endpoint belongs to
    #[must_use]
    pub fn hub(&self) -> &MemoryHub {
        &self.hub
    }

    /// Next queued message without waiting
    pub async fn try_next(&self) -> Option<Envelope> {
        self.inbox.lock().await.try_recv().ok()
    }
}

#[async_trait]
impl SignalingTransport for MemoryTransport {
    type PeerId = PeerIdentityString;
    type Error = SignalingError;

    async fn send_message(
        &self,
        peer: &PeerIdentityString,
        message: SignalingMessage,
    ) -> Result<(), SignalingError> {
        self.hub.deliver(&self.id, peer, message);
        Ok(())
    }

    async fn receive_message(&self) -> Result<Envelope, SignalingError> {
        self.inbox
            .lock()
            .await
            .recv()
            .await
            .ok_or(SignalingError::Closed)
    }
}
