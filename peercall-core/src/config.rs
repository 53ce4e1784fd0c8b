//! Engine configuration
//!
//! Every tunable of the call engine lives here. `Default` reproduces the
//! production constants; all structs deserialize with missing fields filled
//! from those defaults so partial JSON files are accepted.

use crate::media::AudioConstraints;
use crate::profiles::{
    default_audio_profiles, default_video_profiles, AudioProfile, ProfileTable, VideoProfile,
};
use crate::sdp::CodecPreferences;
use crate::types::MediaKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// A value is outside its allowed range
    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidValue {
        /// Field path
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
}

/// The "good network" baseline the controller classifies against
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityThresholds {
    /// Round-trip time in milliseconds
    pub rtt_ms: f64,
    /// Packet loss ratio, 0.0 to 1.0
    pub packet_loss: f64,
    /// Jitter in milliseconds
    pub jitter_ms: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            rtt_ms: 120.0,
            packet_loss: 0.01,
            jitter_ms: 20.0,
        }
    }
}

/// Margins around the baseline used to classify a sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationMargins {
    /// Every metric below `baseline * factor` counts as significantly better
    pub significantly_better_factor: f64,
    /// RTT/jitter factor above which a sample is slightly worse
    pub slightly_worse_factor: f64,
    /// Additive loss margin above which a sample is slightly worse
    pub slightly_worse_loss_margin: f64,
    /// RTT/jitter factor above which a sample is very poor
    pub very_poor_factor: f64,
    /// Additive loss margin above which a sample is very poor
    pub very_poor_loss_margin: f64,
}

impl Default for ClassificationMargins {
    fn default() -> Self {
        Self {
            significantly_better_factor: 0.7,
            slightly_worse_factor: 1.3,
            slightly_worse_loss_margin: 0.01,
            very_poor_factor: 2.0,
            very_poor_loss_margin: 0.03,
        }
    }
}

/// Switching policy for one media kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackPolicy {
    /// Whether this kind adapts at all
    pub enabled: bool,
    /// Profile index used when adaptation starts
    pub initial_profile_index: usize,
    /// Minimum time between a switch and a following upgrade
    pub upgrade_cooldown_ms: u64,
    /// Minimum time between a switch and a following downgrade
    pub downgrade_cooldown_ms: u64,
    /// Consecutive good samples before an upgrade is considered
    pub stability_count_for_upgrade: u32,
    /// Consecutive bad samples before a downgrade is considered
    pub bad_quality_downgrade_threshold: u32,
}

impl Default for TrackPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_profile_index: 2,
            upgrade_cooldown_ms: 10_000,
            downgrade_cooldown_ms: 5_000,
            stability_count_for_upgrade: 2,
            bad_quality_downgrade_threshold: 2,
        }
    }
}

impl TrackPolicy {
    /// Upgrade cooldown as a duration
    #[must_use]
    pub fn upgrade_cooldown(&self) -> Duration {
        Duration::from_millis(self.upgrade_cooldown_ms)
    }

    /// Downgrade cooldown as a duration
    #[must_use]
    pub fn downgrade_cooldown(&self) -> Duration {
        Duration::from_millis(self.downgrade_cooldown_ms)
    }
}

/// Adaptive quality controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    /// Interval between statistics checks
    pub check_interval_ms: u64,
    /// Good-network baseline
    pub thresholds: QualityThresholds,
    /// Classification margins
    pub margins: ClassificationMargins,
    /// Audio switching policy
    pub audio: TrackPolicy,
    /// Video switching policy
    pub video: TrackPolicy,
    /// Audio levels, worst to best
    pub audio_profiles: ProfileTable<AudioProfile>,
    /// Video levels, worst to best
    pub video_profiles: ProfileTable<VideoProfile>,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 5_000,
            thresholds: QualityThresholds::default(),
            margins: ClassificationMargins::default(),
            audio: TrackPolicy::default(),
            video: TrackPolicy::default(),
            audio_profiles: default_audio_profiles(),
            video_profiles: default_video_profiles(),
        }
    }
}

impl AdaptiveConfig {
    /// Check interval as a duration
    #[must_use]
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    /// Policy for a media kind
    #[must_use]
    pub fn policy(&self, kind: MediaKind) -> &TrackPolicy {
        match kind {
            MediaKind::Audio => &self.audio,
            MediaKind::Video => &self.video,
        }
    }

    /// Number of levels for a media kind
    #[must_use]
    pub fn profile_count(&self, kind: MediaKind) -> usize {
        match kind {
            MediaKind::Audio => self.audio_profiles.len(),
            MediaKind::Video => self.video_profiles.len(),
        }
    }

    /// Validate ranges and cross-field consistency
    ///
    /// # Errors
    ///
    /// Returns the first invalid field found
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.check_interval_ms == 0 {
            return Err(invalid("adaptive.check_interval_ms", "must be positive"));
        }
        let t = &self.thresholds;
        if !(t.rtt_ms > 0.0 && t.jitter_ms > 0.0) {
            return Err(invalid("adaptive.thresholds", "rtt and jitter must be positive"));
        }
        if !(0.0..=1.0).contains(&t.packet_loss) {
            return Err(invalid("adaptive.thresholds.packet_loss", "must be within 0..=1"));
        }
        let m = &self.margins;
        if !(m.significantly_better_factor > 0.0 && m.significantly_better_factor < 1.0) {
            return Err(invalid(
                "adaptive.margins.significantly_better_factor",
                "must be within (0, 1)",
            ));
        }
        if m.very_poor_factor < m.slightly_worse_factor
            || m.very_poor_loss_margin < m.slightly_worse_loss_margin
        {
            return Err(invalid(
                "adaptive.margins",
                "very poor margins must not be tighter than slightly worse margins",
            ));
        }
        for kind in MediaKind::ALL {
            let policy = self.policy(kind);
            if policy.initial_profile_index >= self.profile_count(kind) {
                return Err(invalid(
                    "adaptive.initial_profile_index",
                    format!(
                        "{kind} index {} outside table of {}",
                        policy.initial_profile_index,
                        self.profile_count(kind)
                    ),
                ));
            }
            if policy.stability_count_for_upgrade == 0
                || policy.bad_quality_downgrade_threshold == 0
            {
                return Err(invalid(
                    "adaptive.stability",
                    format!("{kind} check counts must be at least 1"),
                ));
            }
        }
        Ok(())
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallEngineConfig {
    /// How long an outgoing request waits for an answer before it is cancelled
    pub call_request_timeout_ms: u64,
    /// Microphone capture constraints
    pub audio_constraints: AudioConstraints,
    /// Codec ordering imposed on transceivers
    pub codec_preferences: CodecPreferences,
    /// Adaptive quality controller
    pub adaptive: AdaptiveConfig,
}

impl Default for CallEngineConfig {
    fn default() -> Self {
        Self {
            call_request_timeout_ms: 30_000,
            audio_constraints: AudioConstraints::default(),
            codec_preferences: CodecPreferences::default(),
            adaptive: AdaptiveConfig::default(),
        }
    }
}

impl CallEngineConfig {
    /// Outgoing request timeout as a duration
    #[must_use]
    pub fn call_request_timeout(&self) -> Duration {
        Duration::from_millis(self.call_request_timeout_ms)
    }

    /// Validate the whole configuration
    ///
    /// # Errors
    ///
    /// Returns the first invalid field found
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.call_request_timeout_ms == 0 {
            return Err(invalid("call_request_timeout_ms", "must be positive"));
        }
        if self.codec_preferences.audio.is_empty() {
            return Err(invalid("codec_preferences.audio", "must name at least one codec"));
        }
        self.adaptive.validate()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = CallEngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.call_request_timeout(), Duration::from_secs(30));
        assert_eq!(config.adaptive.check_interval(), Duration::from_secs(5));
        assert_eq!(config.adaptive.audio.upgrade_cooldown(), Duration::from_secs(10));
        assert_eq!(config.adaptive.audio.downgrade_cooldown(), Duration::from_secs(5));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let json = r#"{"adaptive": {"check_interval_ms": 250, "audio": {"initial_profile_index": 1}}}"#;
        let config: CallEngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.adaptive.check_interval_ms, 250);
        assert_eq!(config.adaptive.audio.initial_profile_index, 1);
        assert_eq!(config.adaptive.audio.upgrade_cooldown_ms, 10_000);
        assert_eq!(config.call_request_timeout_ms, 30_000);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range_initial_index() {
        let mut config = CallEngineConfig::default();
        config.adaptive.video.initial_profile_index = 5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "adaptive.initial_profile_index", .. })
        ));
    }

    #[test]
    fn rejects_inverted_margins() {
        let mut config = AdaptiveConfig::default();
        config.margins.very_poor_factor = 1.1;
        assert!(config.validate().is_err());
    }
}
