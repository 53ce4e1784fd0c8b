//! Quality profile tables
//!
//! Ordered, immutable lists of sender-side quality descriptors. Index 0 is the
//! most conservative profile and the last index the richest one; the adaptive
//! controller only ever moves an index within `0..len()`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Profile table errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProfileError {
    /// The table has no entries
    #[error("Profile table must not be empty")]
    Empty,

    /// Bitrates are not strictly ascending
    #[error("Profile {index} ({name}) does not increase the bitrate of the previous profile")]
    NotAscending {
        /// Offending position
        index: usize,
        /// Level name at that position
        name: String,
    },
}

/// Common view over audio and video profiles
pub trait QualityProfile {
    /// Human readable level name
    fn level_name(&self) -> &str;

    /// Sender bitrate ceiling in bits per second
    fn max_bitrate_bps(&self) -> u32;
}

/// Audio quality level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioProfile {
    /// Level name
    pub level_name: String,
    /// Sender bitrate ceiling
    pub max_bitrate_bps: u32,
    /// Opus `fmtp` parameter string negotiated for this level
    pub codec_params: String,
    /// Human-readable summary of the network this level suits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl QualityProfile for AudioProfile {
    fn level_name(&self) -> &str {
        &self.level_name
    }

    fn max_bitrate_bps(&self) -> u32 {
        self.max_bitrate_bps
    }
}

/// Video quality level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoProfile {
    /// Level name
    pub level_name: String,
    /// Sender bitrate ceiling
    pub max_bitrate_bps: u32,
    /// Frame rate cap
    pub max_frame_rate: f64,
    /// Resolution divisor applied by the encoder
    pub scale_resolution_down_by: f64,
    /// Human-readable summary of the network this level suits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl QualityProfile for VideoProfile {
    fn level_name(&self) -> &str {
        &self.level_name
    }

    fn max_bitrate_bps(&self) -> u32 {
        self.max_bitrate_bps
    }
}

/// Non-empty table of profiles, strictly ascending by bitrate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<P>", into = "Vec<P>")]
#[serde(bound(
    serialize = "P: Serialize + Clone",
    deserialize = "P: Deserialize<'de> + QualityProfile"
))]
pub struct ProfileTable<P> {
    profiles: Vec<P>,
}

impl<P: QualityProfile> ProfileTable<P> {
    /// Build a table, validating ordering
    ///
    /// # Errors
    ///
    /// Returns error if the list is empty or bitrates do not strictly increase
    pub fn new(profiles: Vec<P>) -> Result<Self, ProfileError> {
        if profiles.is_empty() {
            return Err(ProfileError::Empty);
        }
        for (index, pair) in profiles.windows(2).enumerate() {
            if pair[1].max_bitrate_bps() <= pair[0].max_bitrate_bps() {
                return Err(ProfileError::NotAscending {
                    index: index + 1,
                    name: pair[1].level_name().to_string(),
                });
            }
        }
        Ok(Self { profiles })
    }
}

impl<P> ProfileTable<P> {
    /// Profile at `index`
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&P> {
        self.profiles.get(index)
    }

    /// Number of levels
    #[must_use]
    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    /// Always false, tables are never empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Index of the richest profile
    #[must_use]
    pub fn top_index(&self) -> usize {
        self.profiles.len().saturating_sub(1)
    }

    /// Clamp an index into the table
    #[must_use]
    pub fn clamp(&self, index: usize) -> usize {
        index.min(self.top_index())
    }

    /// Iterate from worst to best
    pub fn iter(&self) -> std::slice::Iter<'_, P> {
        self.profiles.iter()
    }
}

impl<P: QualityProfile> TryFrom<Vec<P>> for ProfileTable<P> {
    type Error = ProfileError;

    fn try_from(profiles: Vec<P>) -> Result<Self, Self::Error> {
        Self::new(profiles)
    }
}

impl<P> From<ProfileTable<P>> for Vec<P> {
    fn from(table: ProfileTable<P>) -> Self {
        table.profiles
    }
}

fn audio(level_name: &str, max_bitrate_bps: u32, codec_params: &str, description: &str) -> AudioProfile {
    AudioProfile {
        level_name: level_name.to_string(),
        max_bitrate_bps,
        codec_params: codec_params.to_string(),
        description: Some(description.to_string()),
    }
}

fn video(level_name: &str, max_bitrate_bps: u32, fps: f64, scale: f64, description: &str) -> VideoProfile {
    VideoProfile {
        level_name: level_name.to_string(),
        max_bitrate_bps,
        max_frame_rate: fps,
        scale_resolution_down_by: scale,
        description: Some(description.to_string()),
    }
}

/// Built-in audio levels
#[must_use]
pub fn default_audio_profiles() -> ProfileTable<AudioProfile> {
    ProfileTable {
        profiles: vec![
            audio(
                "Very Low",
                8_000,
                "minptime=40;useinbandfec=1;stereo=0;maxaveragebitrate=8000;cbr=1;maxplaybackrate=8000",
                "Very poor network, keep the call connected",
            ),
            audio(
                "Low",
                12_000,
                "minptime=20;useinbandfec=1;stereo=0;maxaveragebitrate=12000;cbr=1;maxplaybackrate=12000",
                "Poor network, basic voice",
            ),
            audio(
                "Standard",
                16_000,
                "minptime=10;useinbandfec=1;stereo=0;maxaveragebitrate=16000;cbr=0;maxplaybackrate=16000",
                "Average network, standard audio",
            ),
            audio(
                "High",
                20_000,
                "minptime=10;useinbandfec=1;stereo=0;maxaveragebitrate=20000;cbr=0;maxplaybackrate=20000",
                "Good network, improved audio",
            ),
            audio(
                "Very High",
                48_000,
                "minptime=5;useinbandfec=1;stereo=1;maxaveragebitrate=48000;cbr=0;maxplaybackrate=48000",
                "Excellent network, best audio",
            ),
        ],
    }
}

/// Built-in video levels
#[must_use]
pub fn default_video_profiles() -> ProfileTable<VideoProfile> {
    ProfileTable {
        profiles: vec![
            video("Very Low", 150_000, 15.0, 4.0, "Very poor network, keep motion smooth"),
            video("Low", 300_000, 15.0, 2.0, "Poor network, reduced resolution"),
            video("Standard", 800_000, 30.0, 1.0, "Average network, standard video"),
            video("High", 1_500_000, 30.0, 1.0, "Good network, HD video"),
            video("Very High", 2_500_000, 30.0, 1.0, "Excellent network, full quality video"),
        ],
    }
}
