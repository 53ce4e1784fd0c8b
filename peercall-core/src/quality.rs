//! Adaptive quality controller
//!
//! Turns a stream of [`NetworkSample`]s into profile switches, independently
//! for audio and video. Decisions use hysteresis (a run of consecutive good or
//! bad samples) and asymmetric cooldowns: downgrades may follow a switch after
//! a short pause, upgrades only after a longer one.
//!
//! This module holds the decision logic and per-peer bookkeeping only. The
//! call engine owns the timer, reads statistics, and applies the resulting
//! [`ProfileSwitch`] to senders.

use crate::config::{AdaptiveConfig, ClassificationMargins, QualityThresholds, TrackPolicy};
use crate::identity::PeerIdentity;
use crate::stats::NetworkSample;
use crate::types::MediaKind;
use serde::Serialize;
use std::collections::HashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// How a sample compares to the baseline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Classification {
    /// Every metric at or below the baseline
    pub meets_baseline: bool,
    /// Every metric well below the baseline
    pub significantly_better: bool,
    /// Some metric somewhat above the baseline
    pub slightly_worse: bool,
    /// Some metric far above the baseline
    pub very_poor: bool,
}

impl Classification {
    /// Classify a sample
    #[must_use]
    pub fn classify(
        sample: &NetworkSample,
        baseline: &QualityThresholds,
        margins: &ClassificationMargins,
    ) -> Self {
        let better = margins.significantly_better_factor;
        Self {
            meets_baseline: sample.rtt_ms <= baseline.rtt_ms
                && sample.packet_loss <= baseline.packet_loss
                && sample.jitter_ms <= baseline.jitter_ms,
            significantly_better: sample.rtt_ms < baseline.rtt_ms * better
                && sample.packet_loss < baseline.packet_loss * better
                && sample.jitter_ms < baseline.jitter_ms * better,
            slightly_worse: sample.rtt_ms > baseline.rtt_ms * margins.slightly_worse_factor
                || sample.packet_loss > baseline.packet_loss + margins.slightly_worse_loss_margin
                || sample.jitter_ms > baseline.jitter_ms * margins.slightly_worse_factor,
            very_poor: sample.rtt_ms > baseline.rtt_ms * margins.very_poor_factor
                || sample.packet_loss > baseline.packet_loss + margins.very_poor_loss_margin
                || sample.jitter_ms > baseline.jitter_ms * margins.very_poor_factor,
        }
    }
}

/// Direction of a profile switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SwitchDirection {
    /// Toward a richer profile
    Upgrade,
    /// Toward a more conservative profile
    Downgrade,
}

/// An accepted profile switch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileSwitch {
    /// Media kind
    pub kind: MediaKind,
    /// Previous index
    pub from: usize,
    /// New index
    pub to: usize,
}

impl ProfileSwitch {
    /// Whether the switch moves up or down
    #[must_use]
    pub fn direction(&self) -> SwitchDirection {
        if self.to > self.from {
            SwitchDirection::Upgrade
        } else {
            SwitchDirection::Downgrade
        }
    }
}

/// Switching state of one media kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptiveState {
    /// Index into the profile table
    pub current_profile_index: usize,
    /// When the last switch was applied, `None` before the first one
    pub last_switch: Option<Instant>,
    /// Consecutive samples meeting the baseline
    pub consecutive_good_checks: u32,
    /// Consecutive samples missing the baseline
    pub consecutive_bad_checks: u32,
}

impl AdaptiveState {
    /// Fresh state at `initial_index`
    #[must_use]
    pub fn new(initial_index: usize) -> Self {
        Self {
            current_profile_index: initial_index,
            last_switch: None,
            consecutive_good_checks: 0,
            consecutive_bad_checks: 0,
        }
    }

    /// Update counters and compute the desired index
    ///
    /// The returned index is always within `0..profile_count`.
    pub fn target_index(
        &mut self,
        class: Classification,
        policy: &TrackPolicy,
        profile_count: usize,
    ) -> usize {
        let top = profile_count.saturating_sub(1);
        let current = self.current_profile_index.min(top);
        let mut target = current;

        if class.meets_baseline {
            self.consecutive_good_checks = self.consecutive_good_checks.saturating_add(1);
            self.consecutive_bad_checks = 0;
        } else {
            self.consecutive_bad_checks = self.consecutive_bad_checks.saturating_add(1);
            self.consecutive_good_checks = 0;
        }

        if self.consecutive_good_checks >= policy.stability_count_for_upgrade {
            if class.significantly_better {
                target = (current + 2).min(top);
            } else if class.meets_baseline {
                target = (current + 1).min(top);
            }
            if target > current {
                self.consecutive_good_checks = 0;
            }
        }

        if self.consecutive_bad_checks >= policy.bad_quality_downgrade_threshold {
            if class.very_poor {
                target = current.saturating_sub(2);
            } else if class.slightly_worse {
                target = current.saturating_sub(1);
            }
            if target < current {
                self.consecutive_bad_checks = 0;
            }
        }

        target
    }

    /// Apply `target` if its direction's cooldown has elapsed
    pub fn try_switch(
        &mut self,
        kind: MediaKind,
        target: usize,
        policy: &TrackPolicy,
        now: Instant,
    ) -> Option<ProfileSwitch> {
        let from = self.current_profile_index;
        if target == from {
            return None;
        }
        let cooldown = if target > from {
            policy.upgrade_cooldown()
        } else {
            policy.downgrade_cooldown()
        };
        if let Some(last) = self.last_switch {
            let elapsed = now.saturating_duration_since(last);
            if elapsed <= cooldown {
                tracing::debug!(
                    kind = %kind,
                    from,
                    to = target,
                    elapsed_ms = elapsed.as_millis() as u64,
                    cooldown_ms = cooldown.as_millis() as u64,
                    "Profile switch held back by cooldown"
                );
                return None;
            }
        }

        self.current_profile_index = target;
        self.last_switch = Some(now);
        self.consecutive_good_checks = 0;
        self.consecutive_bad_checks = 0;
        Some(ProfileSwitch {
            kind,
            from,
            to: target,
        })
    }
}

/// Adaptive state for one peer
#[derive(Debug)]
pub struct PeerQuality {
    /// Audio track state
    pub audio: AdaptiveState,
    /// Video track state
    pub video: AdaptiveState,
    /// Opus parameters agreed in the last completed description exchange
    pub negotiated_codec_params: Option<String>,
    timer: Option<JoinHandle<()>>,
}

impl PeerQuality {
    fn state_mut(&mut self, kind: MediaKind) -> &mut AdaptiveState {
        match kind {
            MediaKind::Audio => &mut self.audio,
            MediaKind::Video => &mut self.video,
        }
    }

    /// State of one media kind
    #[must_use]
    pub fn state(&self, kind: MediaKind) -> &AdaptiveState {
        match kind {
            MediaKind::Audio => &self.audio,
            MediaKind::Video => &self.video,
        }
    }
}

/// Read-only view of a peer's adaptive state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QualitySnapshot {
    /// Audio profile index
    pub audio_index: usize,
    /// Video profile index
    pub video_index: usize,
    /// Opus parameters agreed in the last completed exchange
    pub negotiated_codec_params: Option<String>,
    /// Whether the check timer is running
    pub timer_running: bool,
}

/// Per-peer adaptive state and timers
pub struct AdaptiveController<I: PeerIdentity> {
    config: AdaptiveConfig,
    peers: HashMap<I, PeerQuality>,
}

impl<I: PeerIdentity> AdaptiveController<I> {
    /// Create a controller with no peers
    #[must_use]
    pub fn new(config: AdaptiveConfig) -> Self {
        Self {
            config,
            peers: HashMap::new(),
        }
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &AdaptiveConfig {
        &self.config
    }

    /// Create state for `peer` at the initial profiles
    ///
    /// Returns `false` when the peer is already tracked; its state is left as is.
    pub fn start(&mut self, peer: &I) -> bool {
        if self.peers.contains_key(peer) {
            return false;
        }
        let quality = PeerQuality {
            audio: AdaptiveState::new(
                self.config
                    .audio_profiles
                    .clamp(self.config.audio.initial_profile_index),
            ),
            video: AdaptiveState::new(
                self.config
                    .video_profiles
                    .clamp(self.config.video.initial_profile_index),
            ),
            negotiated_codec_params: None,
            timer: None,
        };
        self.peers.insert(peer.clone(), quality);
        tracing::debug!(peer = %peer, "Adaptive quality state created");
        true
    }

    /// Attach the check timer of `peer`, aborting any previous one
    pub fn attach_timer(&mut self, peer: &I, timer: JoinHandle<()>) {
        match self.peers.get_mut(peer) {
            Some(quality) => {
                if let Some(previous) = quality.timer.replace(timer) {
                    previous.abort();
                }
            }
            None => timer.abort(),
        }
    }

    /// Whether `peer` is tracked
    #[must_use]
    pub fn is_tracking(&self, peer: &I) -> bool {
        self.peers.contains_key(peer)
    }

    /// Abort the timer and drop every state of `peer`
    ///
    /// Returns `false` when the peer was not tracked.
    pub fn stop(&mut self, peer: &I) -> bool {
        match self.peers.remove(peer) {
            Some(quality) => {
                if let Some(timer) = quality.timer {
                    timer.abort();
                }
                tracing::debug!(peer = %peer, "Adaptive quality state discarded");
                true
            }
            None => false,
        }
    }

    /// Number of live check timers
    #[must_use]
    pub fn timer_count(&self) -> usize {
        self.peers
            .values()
            .filter(|q| q.timer.as_ref().map_or(false, |t| !t.is_finished()))
            .count()
    }

    /// Current profile index of `peer` for `kind`
    #[must_use]
    pub fn current_index(&self, peer: &I, kind: MediaKind) -> Option<usize> {
        self.peers
            .get(peer)
            .map(|q| q.state(kind).current_profile_index)
    }

    /// Index used for descriptions: the tracked one, else the initial one
    #[must_use]
    pub fn effective_index(&self, peer: &I, kind: MediaKind) -> usize {
        self.current_index(peer, kind).unwrap_or_else(|| match kind {
            MediaKind::Audio => self
                .config
                .audio_profiles
                .clamp(self.config.audio.initial_profile_index),
            MediaKind::Video => self
                .config
                .video_profiles
                .clamp(self.config.video.initial_profile_index),
        })
    }

    /// Opus parameters for the profile `peer` should currently use
    #[must_use]
    pub fn desired_codec_params(&self, peer: &I) -> Option<&str> {
        self.config
            .audio_profiles
            .get(self.effective_index(peer, MediaKind::Audio))
            .map(|p| p.codec_params.as_str())
    }

    /// Record the opus parameters of a completed exchange
    pub fn record_negotiated(&mut self, peer: &I, params: String) {
        if let Some(quality) = self.peers.get_mut(peer) {
            tracing::debug!(peer = %peer, params = %params, "Negotiated audio parameters recorded");
            quality.negotiated_codec_params = Some(params);
        }
    }

    /// Opus parameters of the last completed exchange
    #[must_use]
    pub fn negotiated(&self, peer: &I) -> Option<&str> {
        self.peers
            .get(peer)
            .and_then(|q| q.negotiated_codec_params.as_deref())
    }

    /// Feed one sample for one media kind
    ///
    /// Returns the switch to apply, if any. Untracked peers and disabled kinds
    /// never switch.
    pub fn evaluate(
        &mut self,
        peer: &I,
        kind: MediaKind,
        sample: &NetworkSample,
        now: Instant,
    ) -> Option<ProfileSwitch> {
        let policy = *self.config.policy(kind);
        if !policy.enabled {
            return None;
        }
        let profile_count = self.config.profile_count(kind);
        let class = Classification::classify(sample, &self.config.thresholds, &self.config.margins);
        let state = self.peers.get_mut(peer)?.state_mut(kind);

        let target = state.target_index(class, &policy, profile_count);
        tracing::trace!(
            peer = %peer,
            kind = %kind,
            rtt_ms = sample.rtt_ms,
            loss = sample.packet_loss,
            jitter_ms = sample.jitter_ms,
            current = state.current_profile_index,
            target,
            good = state.consecutive_good_checks,
            bad = state.consecutive_bad_checks,
            "Quality check"
        );
        state.try_switch(kind, target, &policy, now)
    }

    /// Snapshot of `peer`
    #[must_use]
    pub fn snapshot(&self, peer: &I) -> Option<QualitySnapshot> {
        self.peers.get(peer).map(|q| QualitySnapshot {
            audio_index: q.audio.current_profile_index,
            video_index: q.video.current_profile_index,
            negotiated_codec_params: q.negotiated_codec_params.clone(),
            timer_running: q.timer.as_ref().map_or(false, |t| !t.is_finished()),
        })
    }
}

impl<I: PeerIdentity> Drop for AdaptiveController<I> {
    fn drop(&mut self) {
        for quality in self.peers.values() {
            if let Some(timer) = &quality.timer {
                timer.abort();
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::identity::PeerIdentityString;
    use proptest::prelude::*;
    use std::time::Duration;

    fn sample(rtt_ms: f64, packet_loss: f64, jitter_ms: f64) -> NetworkSample {
        NetworkSample {
            rtt_ms,
            packet_loss,
            jitter_ms,
        }
    }

    fn good() -> NetworkSample {
        sample(100.0, 0.005, 15.0)
    }

    fn excellent() -> NetworkSample {
        sample(50.0, 0.001, 5.0)
    }

    fn terrible() -> NetworkSample {
        sample(450.0, 0.06, 80.0)
    }

    fn mediocre() -> NetworkSample {
        sample(130.0, 0.01, 20.0)
    }

    #[test]
    fn classification_bands() {
        let t = QualityThresholds::default();
        let m = ClassificationMargins::default();

        let c = Classification::classify(&excellent(), &t, &m);
        assert!(c.meets_baseline && c.significantly_better);

        let c = Classification::classify(&good(), &t, &m);
        assert!(c.meets_baseline && !c.significantly_better);

        let c = Classification::classify(&mediocre(), &t, &m);
        assert!(!c.meets_baseline && !c.slightly_worse && !c.very_poor);

        let c = Classification::classify(&sample(160.0, 0.0, 0.0), &t, &m);
        assert!(c.slightly_worse && !c.very_poor);

        let c = Classification::classify(&terrible(), &t, &m);
        assert!(c.slightly_worse && c.very_poor);
    }

    #[test]
    fn very_poor_run_drops_two_levels() {
        let baseline = QualityThresholds {
            rtt_ms: 150.0,
            packet_loss: 0.02,
            jitter_ms: 30.0,
        };
        let m = ClassificationMargins::default();
        let policy = TrackPolicy::default();
        let mut state = AdaptiveState::new(4);
        let class = Classification::classify(&terrible(), &baseline, &m);

        assert_eq!(state.target_index(class, &policy, 5), 4);
        assert_eq!(state.target_index(class, &policy, 5), 2);
        assert_eq!(state.consecutive_bad_checks, 0);
    }

    #[test]
    fn counters_are_mutually_exclusive() {
        let t = QualityThresholds::default();
        let m = ClassificationMargins::default();
        let policy = TrackPolicy {
            stability_count_for_upgrade: 5,
            bad_quality_downgrade_threshold: 5,
            ..TrackPolicy::default()
        };
        let mut state = AdaptiveState::new(2);
        state.target_index(Classification::classify(&good(), &t, &m), &policy, 5);
        state.target_index(Classification::classify(&good(), &t, &m), &policy, 5);
        assert_eq!((state.consecutive_good_checks, state.consecutive_bad_checks), (2, 0));
        state.target_index(Classification::classify(&mediocre(), &t, &m), &policy, 5);
        assert_eq!((state.consecutive_good_checks, state.consecutive_bad_checks), (0, 1));
    }

    #[test]
    fn mediocre_run_keeps_counting_toward_a_downgrade() {
        let t = QualityThresholds::default();
        let m = ClassificationMargins::default();
        let policy = TrackPolicy::default();
        let mut state = AdaptiveState::new(2);

        for _ in 0..2 {
            let class = Classification::classify(&mediocre(), &t, &m);
            assert_eq!(state.target_index(class, &policy, 5), 2);
        }
        assert_eq!(state.consecutive_bad_checks, 2);

        let worse = Classification::classify(&sample(160.0, 0.0, 0.0), &t, &m);
        assert_eq!(state.target_index(worse, &policy, 5), 1);
        assert_eq!(state.consecutive_bad_checks, 0);
    }

    #[test]
    fn good_run_at_the_top_is_not_reset() {
        let t = QualityThresholds::default();
        let m = ClassificationMargins::default();
        let policy = TrackPolicy::default();
        let mut state = AdaptiveState::new(4);
        for expected in 1..=3 {
            let class = Classification::classify(&excellent(), &t, &m);
            assert_eq!(state.target_index(class, &policy, 5), 4);
            assert_eq!(state.consecutive_good_checks, expected);
        }
    }

    #[test]
    fn mediocre_samples_never_move_the_index() {
        let t = QualityThresholds::default();
        let m = ClassificationMargins::default();
        let policy = TrackPolicy::default();
        let mut state = AdaptiveState::new(2);
        for _ in 0..10 {
            let class = Classification::classify(&mediocre(), &t, &m);
            assert_eq!(state.target_index(class, &policy, 5), 2);
        }
    }

    #[test]
    fn upgrade_cooldown_is_longer_than_downgrade() {
        let policy = TrackPolicy::default();
        let start = Instant::now();
        let mut state = AdaptiveState::new(2);

        let first = state.try_switch(MediaKind::Audio, 1, &policy, start).unwrap();
        assert_eq!(first.direction(), SwitchDirection::Downgrade);

        // Six seconds later a downgrade may follow but an upgrade may not.
        let later = start + Duration::from_secs(6);
        assert!(state.try_switch(MediaKind::Audio, 2, &policy, later).is_none());
        let mut copy = state;
        assert!(copy.try_switch(MediaKind::Audio, 0, &policy, later).is_some());

        let much_later = start + Duration::from_millis(10_001);
        assert!(state.try_switch(MediaKind::Audio, 2, &policy, much_later).is_some());
    }

    #[test]
    fn cooldown_boundary_is_exclusive() {
        let policy = TrackPolicy::default();
        let start = Instant::now();
        let mut state = AdaptiveState::new(2);
        state.try_switch(MediaKind::Video, 1, &policy, start).unwrap();
        assert!(state
            .try_switch(MediaKind::Video, 0, &policy, start + Duration::from_secs(5))
            .is_none());
        assert!(state
            .try_switch(MediaKind::Video, 0, &policy, start + Duration::from_millis(5_001))
            .is_some());
    }

    #[tokio::test]
    async fn controller_lifecycle() {
        let mut controller = AdaptiveController::new(AdaptiveConfig::default());
        let peer = PeerIdentityString::new("bob");
        assert!(controller.start(&peer));
        assert!(!controller.start(&peer));
        assert_eq!(controller.current_index(&peer, MediaKind::Audio), Some(2));

        controller.attach_timer(&peer, tokio::spawn(std::future::pending()));
        assert_eq!(controller.timer_count(), 1);

        assert!(controller.stop(&peer));
        assert!(!controller.stop(&peer));
        assert_eq!(controller.timer_count(), 0);
        assert!(controller.snapshot(&peer).is_none());
        assert_eq!(controller.effective_index(&peer, MediaKind::Audio), 2);
    }

    #[test]
    fn disabled_kind_never_switches() {
        let mut config = AdaptiveConfig::default();
        config.video.enabled = false;
        let mut controller = AdaptiveController::new(config);
        let peer = PeerIdentityString::new("bob");
        controller.start(&peer);
        for _ in 0..4 {
            assert!(controller
                .evaluate(&peer, MediaKind::Video, &terrible(), Instant::now())
                .is_none());
        }
        assert_eq!(controller.current_index(&peer, MediaKind::Video), Some(2));
    }

    fn arb_sample() -> impl Strategy<Value = NetworkSample> {
        (0.0f64..1000.0, 0.0f64..0.5, 0.0f64..200.0).prop_map(|(r, l, j)| sample(r, l, j))
    }

    proptest! {
        #[test]
        fn index_stays_in_range(
            samples in proptest::collection::vec((arb_sample(), 0u64..20_000), 1..200),
            initial in 0usize..5,
        ) {
            let config = AdaptiveConfig::default();
            let mut state = AdaptiveState::new(initial);
            let mut now = Instant::now();
            for (s, step_ms) in samples {
                now += Duration::from_millis(step_ms);
                let class = Classification::classify(&s, &config.thresholds, &config.margins);
                let target = state.target_index(class, &config.audio, 5);
                prop_assert!(target < 5);
                state.try_switch(MediaKind::Audio, target, &config.audio, now);
                prop_assert!(state.current_profile_index < 5);
            }
        }

        #[test]
        fn accepted_switches_respect_cooldowns(
            samples in proptest::collection::vec((arb_sample(), 0u64..8_000), 1..200),
        ) {
            let config = AdaptiveConfig::default();
            let policy = config.audio;
            let mut state = AdaptiveState::new(2);
            let mut now = Instant::now();
            let mut last: Option<Instant> = None;
            for (s, step_ms) in samples {
                now += Duration::from_millis(step_ms);
                let class = Classification::classify(&s, &config.thresholds, &config.margins);
                let target = state.target_index(class, &policy, 5);
                if let Some(switch) = state.try_switch(MediaKind::Audio, target, &policy, now) {
                    if let Some(previous) = last {
                        let cooldown = match switch.direction() {
                            SwitchDirection::Upgrade => policy.upgrade_cooldown(),
                            SwitchDirection::Downgrade => policy.downgrade_cooldown(),
                        };
                        prop_assert!(now.duration_since(previous) > cooldown);
                    }
                    last = Some(now);
                }
            }
        }
    }
}
