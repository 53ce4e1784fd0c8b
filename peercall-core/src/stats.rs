//! Transport statistics and network samples
//!
//! The connection layer reports raw statistics as a list of [`StatsReport`]s
//! (the same shapes a browser or webrtc-rs exposes). The controller only ever
//! looks at a condensed [`NetworkSample`].

use crate::config::QualityThresholds;
use crate::types::MediaKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One statistics report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum StatsReport {
    /// Local sender stream
    OutboundRtp {
        /// Report id
        id: String,
        /// Media kind
        kind: MediaKind,
        /// Id of the matching remote-inbound report
        #[serde(default)]
        remote_id: Option<String>,
    },
    /// What the remote receiver reported about our stream
    RemoteInboundRtp {
        /// Report id
        id: String,
        /// Media kind
        kind: MediaKind,
        /// Round-trip time in seconds
        #[serde(default)]
        round_trip_time: Option<f64>,
        /// Packets lost
        #[serde(default)]
        packets_lost: Option<i64>,
        /// Packets received
        #[serde(default)]
        packets_received: Option<u64>,
        /// Packets discarded
        #[serde(default)]
        packets_discarded: Option<u64>,
        /// Jitter in seconds
        #[serde(default)]
        jitter: Option<f64>,
    },
    /// Remote sender stream as received locally
    InboundRtp {
        /// Report id
        id: String,
        /// Media kind
        kind: MediaKind,
        /// Packets lost
        #[serde(default)]
        packets_lost: Option<i64>,
        /// Packets received
        #[serde(default)]
        packets_received: Option<u64>,
        /// Packets discarded
        #[serde(default)]
        packets_discarded: Option<u64>,
        /// Jitter in seconds
        #[serde(default)]
        jitter: Option<f64>,
    },
    /// ICE candidate pair
    CandidatePair {
        /// Report id
        id: String,
        /// Whether the pair has succeeded
        succeeded: bool,
        /// Current round-trip time in seconds
        #[serde(default)]
        current_round_trip_time: Option<f64>,
    },
}

impl StatsReport {
    /// Report id
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::OutboundRtp { id, .. }
            | Self::RemoteInboundRtp { id, .. }
            | Self::InboundRtp { id, .. }
            | Self::CandidatePair { id, .. } => id,
        }
    }
}

/// Per-check view of the network
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NetworkSample {
    /// Round-trip time in milliseconds
    pub rtt_ms: f64,
    /// Packet loss ratio
    pub packet_loss: f64,
    /// Jitter in milliseconds
    pub jitter_ms: f64,
}

#[derive(Default)]
struct Minimum(Option<f64>);

impl Minimum {
    fn offer(&mut self, value: Option<f64>) {
        if let Some(v) = value.filter(|v| v.is_finite() && *v >= 0.0) {
            self.0 = Some(self.0.map_or(v, |current| current.min(v)));
        }
    }
}

fn loss_ratio(lost: Option<i64>, received: Option<u64>, discarded: Option<u64>) -> Option<f64> {
    let lost = lost?.max(0) as f64;
    let received = received? as f64;
    let discarded = discarded.unwrap_or(0) as f64;
    let total = lost + received + discarded;
    (total > 0.0).then(|| (lost + discarded) / total)
}

impl NetworkSample {
    /// Condense a statistics snapshot
    ///
    /// Each metric takes the most favorable value across every report that
    /// measures it. A metric no report measures falls back to three times its
    /// threshold (RTT, jitter) or threshold plus 0.10 (loss), so a silent
    /// connection is treated as degraded rather than stalling the controller.
    #[must_use]
    pub fn from_reports(reports: &[StatsReport], thresholds: &QualityThresholds) -> Self {
        let by_id: HashMap<&str, &StatsReport> = reports.iter().map(|r| (r.id(), r)).collect();
        let mut rtt = Minimum::default();
        let mut loss = Minimum::default();
        let mut jitter = Minimum::default();

        for report in reports {
            match report {
                StatsReport::OutboundRtp {
                    remote_id: Some(remote_id),
                    ..
                } => {
                    if let Some(StatsReport::RemoteInboundRtp {
                        round_trip_time,
                        packets_lost,
                        packets_received,
                        packets_discarded,
                        jitter: remote_jitter,
                        ..
                    }) = by_id.get(remote_id.as_str()).copied()
                    {
                        rtt.offer(round_trip_time.map(|s| s * 1000.0));
                        loss.offer(loss_ratio(*packets_lost, *packets_received, *packets_discarded));
                        jitter.offer(remote_jitter.map(|s| s * 1000.0));
                    }
                }
                StatsReport::CandidatePair {
                    succeeded: true,
                    current_round_trip_time,
                    ..
                } => rtt.offer(current_round_trip_time.map(|s| s * 1000.0)),
                StatsReport::InboundRtp {
                    packets_lost,
                    packets_received,
                    packets_discarded,
                    jitter: inbound_jitter,
                    ..
                } => {
                    jitter.offer(inbound_jitter.map(|s| s * 1000.0));
                    loss.offer(loss_ratio(*packets_lost, *packets_received, *packets_discarded));
                }
                _ => {}
            }
        }

        if rtt.0.is_none() && loss.0.is_none() && jitter.0.is_none() {
            tracing::debug!(reports = reports.len(), "No usable statistics, using fallback sample");
        }

        Self {
            rtt_ms: rtt.0.unwrap_or(thresholds.rtt_ms * 3.0),
            packet_loss: loss.0.unwrap_or(thresholds.packet_loss + 0.1),
            jitter_ms: jitter.0.unwrap_or(thresholds.jitter_ms * 3.0),
        }
    }
}
