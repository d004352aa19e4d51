//! Per-message timestamp correction from the synchronization estimates.

use std::collections::HashMap;

use log::{debug, info};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_FUTURE_SKEW: f64 = 5.0;
pub const DEFAULT_MAX_PAST_SKEW: f64 = 60.0;

const BASE_UNCERTAINTY: f64 = 0.05;

/// The closed set of correction methods.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionMethod {
    Offset,
    DriftCompensated,
    Hybrid,
}

impl CorrectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CorrectionMethod::Offset => "offset",
            CorrectionMethod::DriftCompensated => "drift_compensated",
            CorrectionMethod::Hybrid => "hybrid",
        }
    }
}

/// What was done to a timestamp; stored with the message as
/// `correction_metadata`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CorrectionInfo {
    pub method: CorrectionMethod,
    pub applied_offset: f64,
    pub magnitude: f64,
    pub original_ts: f64,
    pub corrected_ts: f64,
}

/// Symmetric confidence interval around a corrected timestamp.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct AccuracyEstimate {
    pub uncertainty: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct CorrectionStatistics {
    pub corrections_applied: u64,
    pub average_correction_magnitude: f64,
    pub max_correction_magnitude: f64,
    pub total_correction_magnitude: f64,
    pub current_method: CorrectionMethod,
    pub current_clock_offset: f64,
    pub current_drift_rate: f64,
    pub current_network_delay: f64,
    pub peers_tracked: usize,
    pub last_sync_time: f64,
}

/// Applies the configured correction method to message timestamps, using
/// the estimates pushed in after every sync round.
pub struct TimestampCorrector {
    method: CorrectionMethod,

    clock_offset: f64,
    drift_rate: f64,
    network_delay: f64,
    sync_accuracy: f64,
    sample_count: usize,
    last_sync_time: f64,

    max_future_skew: f64,
    max_past_skew: f64,

    peer_offsets: HashMap<String, f64>,
    peer_delays: HashMap<String, f64>,

    corrections_applied: u64,
    total_magnitude: f64,
    max_magnitude: f64,
}

impl Default for TimestampCorrector {
    fn default() -> Self {
        TimestampCorrector::new(CorrectionMethod::Hybrid)
    }
}

impl TimestampCorrector {
    pub fn new(method: CorrectionMethod) -> Self {
        TimestampCorrector {
            method,
            clock_offset: 0.0,
            drift_rate: 0.0,
            network_delay: 0.0,
            sync_accuracy: 0.0,
            sample_count: 0,
            last_sync_time: 0.0,
            max_future_skew: DEFAULT_MAX_FUTURE_SKEW,
            max_past_skew: DEFAULT_MAX_PAST_SKEW,
            peer_offsets: HashMap::new(),
            peer_delays: HashMap::new(),
            corrections_applied: 0,
            total_magnitude: 0.0,
            max_magnitude: 0.0,
        }
    }

    pub fn method(&self) -> CorrectionMethod {
        self.method
    }

    pub fn max_future_skew(&self) -> f64 {
        self.max_future_skew
    }

    pub fn max_past_skew(&self) -> f64 {
        self.max_past_skew
    }

    /// Refresh the synchronization estimates after a sync round.
    pub fn update_sync_data(
        &mut self,
        clock_offset: f64,
        drift_rate: f64,
        network_delay: f64,
        sync_accuracy: f64,
        sample_count: usize,
        sync_timestamp: f64,
    ) {
        self.clock_offset = clock_offset;
        self.drift_rate = drift_rate;
        self.network_delay = network_delay;
        self.sync_accuracy = sync_accuracy;
        self.sample_count = sample_count;
        self.last_sync_time = sync_timestamp;
        debug!(
            "corrector updated: offset={:.6}s drift={:.9}s/s delay={:.6}s",
            clock_offset, drift_rate, network_delay
        );
    }

    pub fn update_peer_data(&mut self, peer: &str, offset: f64, delay: f64) {
        self.peer_offsets.insert(peer.to_owned(), offset);
        self.peer_delays.insert(peer.to_owned(), delay);
    }

    fn predicted_offset(&self, at: f64) -> f64 {
        self.clock_offset + self.drift_rate * (at - self.last_sync_time)
    }

    /// Correct `original_ts` with the configured method. `sender` selects
    /// per-peer data for the accuracy estimate when known.
    pub fn correct(&mut self, original_ts: f64, _sender: Option<&str>) -> (f64, CorrectionInfo) {
        let applied_offset = match self.method {
            CorrectionMethod::Offset => self.clock_offset,
            CorrectionMethod::DriftCompensated => self.clock_offset + 0.5 * self.drift_rate,
            CorrectionMethod::Hybrid => {
                (2.0 * self.clock_offset + self.predicted_offset(original_ts)) / 3.0
                    + 0.25 * self.drift_rate
            }
        };
        let corrected_ts = original_ts + applied_offset;
        let magnitude = applied_offset.abs();

        self.corrections_applied += 1;
        self.total_magnitude += magnitude;
        if magnitude > self.max_magnitude {
            self.max_magnitude = magnitude;
        }
        if magnitude > 0.1 {
            info!(
                "large timestamp correction applied: {:.6}s (method: {})",
                magnitude,
                self.method.as_str()
            );
        }

        (
            corrected_ts,
            CorrectionInfo {
                method: self.method,
                applied_offset,
                magnitude,
                original_ts,
                corrected_ts,
            },
        )
    }

    /// Reject timestamps implausibly far from the local clock.
    pub fn validate_timestamp(&self, timestamp: f64, now: f64) -> Result<(), String> {
        if timestamp > now + self.max_future_skew {
            return Err(format!(
                "timestamp {:.2}s ahead of local clock",
                timestamp - now
            ));
        }
        if timestamp < now - self.max_past_skew {
            return Err(format!(
                "timestamp {:.2}s behind local clock",
                now - timestamp
            ));
        }
        Ok(())
    }

    /// Confidence interval for a correction: wider with poor sync accuracy,
    /// drift, per-sender offset, and large corrections; narrower as the
    /// sample count grows.
    pub fn estimate_accuracy(
        &self,
        corrected_ts: f64,
        original_ts: f64,
        sender: Option<&str>,
    ) -> AccuracyEstimate {
        let peer_offset = sender
            .and_then(|peer| self.peer_offsets.get(peer))
            .copied()
            .unwrap_or(self.clock_offset);
        let magnitude = (corrected_ts - original_ts).abs();
        let uncertainty = (BASE_UNCERTAINTY
            + self.sync_accuracy
            + 0.5 * self.drift_rate.abs()
            + 0.2 * peer_offset.abs()
            + 0.1 * magnitude)
            / (1.0 + self.sample_count as f64).sqrt();
        AccuracyEstimate {
            uncertainty,
            lower_bound: corrected_ts - uncertainty,
            upper_bound: corrected_ts + uncertainty,
        }
    }

    pub fn statistics(&self) -> CorrectionStatistics {
        CorrectionStatistics {
            corrections_applied: self.corrections_applied,
            average_correction_magnitude: self.total_magnitude
                / self.corrections_applied.max(1) as f64,
            max_correction_magnitude: self.max_magnitude,
            total_correction_magnitude: self.total_magnitude,
            current_method: self.method,
            current_clock_offset: self.clock_offset,
            current_drift_rate: self.drift_rate,
            current_network_delay: self.network_delay,
            peers_tracked: self.peer_offsets.len(),
            last_sync_time: self.last_sync_time,
        }
    }

    pub fn reset_statistics(&mut self) {
        self.corrections_applied = 0;
        self.total_magnitude = 0.0;
        self.max_magnitude = 0.0;
    }
}
