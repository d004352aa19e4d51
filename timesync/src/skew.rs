//! Clock skew and drift analysis over the offset measurement history.

use std::collections::{HashMap, VecDeque};

use log::warn;
use serde::Serialize;

use crate::least_squares_slope;

pub const DEFAULT_WINDOW_SIZE: usize = 100;
pub const DEFAULT_MAX_SKEW: f64 = 0.1;
pub const DEFAULT_JUMP_THRESHOLD: f64 = 0.5;

/// Tracks offset measurements over a bounded window and estimates the
/// first derivative (drift rate) by least-squares regression, both in
/// aggregate and per peer.
pub struct ClockSkewAnalyzer {
    window_size: usize,
    max_skew: f64,

    history: VecDeque<(f64, f64)>,
    current_skew: f64,
    drift_rate: f64,
    last_analysis_time: f64,

    peer_history: HashMap<String, VecDeque<(f64, f64)>>,
    peer_drift_rates: HashMap<String, f64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PeerSkewStatistics {
    pub current_offset: f64,
    pub drift_rate: f64,
    pub measurements: usize,
    pub mean_offset: f64,
    pub std_deviation: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct SkewStatistics {
    pub current_skew: f64,
    pub drift_rate: f64,
    pub measurements: usize,
    pub mean_offset: f64,
    pub median_offset: f64,
    pub std_deviation: f64,
    pub min_offset: f64,
    pub max_offset: f64,
    pub range: f64,
    pub acceptable: bool,
    pub last_analysis: f64,
    pub peer_statistics: HashMap<String, PeerSkewStatistics>,
}

impl Default for ClockSkewAnalyzer {
    fn default() -> Self {
        ClockSkewAnalyzer::new(DEFAULT_WINDOW_SIZE, DEFAULT_MAX_SKEW)
    }
}

impl ClockSkewAnalyzer {
    pub fn new(window_size: usize, max_skew: f64) -> Self {
        ClockSkewAnalyzer {
            window_size,
            max_skew,
            history: VecDeque::new(),
            current_skew: 0.0,
            drift_rate: 0.0,
            last_analysis_time: 0.0,
            peer_history: HashMap::new(),
            peer_drift_rates: HashMap::new(),
        }
    }

    pub fn drift_rate(&self) -> f64 {
        self.drift_rate
    }

    pub fn current_skew(&self) -> f64 {
        self.current_skew
    }

    pub fn sample_count(&self) -> usize {
        self.history.len()
    }

    pub fn peer_drift_rate(&self, peer: &str) -> Option<f64> {
        self.peer_drift_rates.get(peer).copied()
    }

    /// Record an aggregate offset measurement. Regression kicks in once
    /// three samples are available.
    pub fn record_offset(&mut self, offset: f64, timestamp: f64) {
        self.history.push_back((timestamp, offset));
        if self.history.len() > self.window_size {
            self.history.pop_front();
        }
        self.current_skew = offset;

        if self.history.len() >= 3 {
            self.drift_rate = least_squares_slope(self.history.make_contiguous());
            self.last_analysis_time = timestamp;
            if self.drift_rate.abs() > 1e-6 {
                warn!("clock drift detected: {:.9} s/s", self.drift_rate);
            }
        }
    }

    /// Record an offset measurement for one peer.
    pub fn record_peer_offset(&mut self, peer: &str, offset: f64, timestamp: f64) {
        let history = self.peer_history.entry(peer.to_owned()).or_default();
        history.push_back((timestamp, offset));
        if history.len() > self.window_size {
            history.pop_front();
        }
        if history.len() >= 3 {
            let drift = least_squares_slope(history.make_contiguous());
            self.peer_drift_rates.insert(peer.to_owned(), drift);
        }
    }

    /// Offset expected at `future_time` along the current drift line.
    pub fn predict_future_offset(&self, future_time: f64) -> f64 {
        match self.history.back() {
            Some((last_t, _)) => self.current_skew + self.drift_rate * (future_time - last_t),
            None => 0.0,
        }
    }

    pub fn is_skew_acceptable(&self) -> bool {
        self.current_skew.abs() <= self.max_skew
    }

    /// Adjacent-sample differences above `threshold`, as `(timestamp,
    /// jump)` pairs.
    pub fn detect_clock_jumps(&self, threshold: f64) -> Vec<(f64, f64)> {
        let mut jumps = Vec::new();
        let samples: Vec<_> = self.history.iter().copied().collect();
        for pair in samples.windows(2) {
            let jump = (pair[1].1 - pair[0].1).abs();
            if jump > threshold {
                warn!("clock jump detected at {}: {:.6}s", pair[1].0, jump);
                jumps.push((pair[1].0, jump));
            }
        }
        jumps
    }

    /// Sync cadence suited to the observed drift: stable clocks can sync
    /// rarely, drifty clocks often.
    pub fn recommend_sync_interval(&self) -> f64 {
        let drift = self.drift_rate.abs();
        if drift < 1e-9 {
            300.0
        } else if drift < 1e-7 {
            120.0
        } else if drift < 1e-6 {
            60.0
        } else {
            30.0
        }
    }

    pub fn statistics(&self) -> Option<SkewStatistics> {
        if self.history.is_empty() {
            return None;
        }
        let offsets: Vec<f64> = self.history.iter().map(|(_, o)| *o).collect();
        let mean = offsets.iter().sum::<f64>() / offsets.len() as f64;
        let std_deviation = if offsets.len() > 1 {
            let variance = offsets.iter().map(|o| (o - mean).powi(2)).sum::<f64>()
                / (offsets.len() - 1) as f64;
            variance.sqrt()
        } else {
            0.0
        };
        let min = offsets.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = offsets.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let mut sorted = offsets.clone();
        let median_offset = crate::median(&mut sorted);

        let peer_statistics = self
            .peer_history
            .iter()
            .filter(|(_, history)| !history.is_empty())
            .map(|(peer, history)| {
                let peer_offsets: Vec<f64> = history.iter().map(|(_, o)| *o).collect();
                let peer_mean = peer_offsets.iter().sum::<f64>() / peer_offsets.len() as f64;
                let peer_std = if peer_offsets.len() > 1 {
                    let variance = peer_offsets
                        .iter()
                        .map(|o| (o - peer_mean).powi(2))
                        .sum::<f64>()
                        / (peer_offsets.len() - 1) as f64;
                    variance.sqrt()
                } else {
                    0.0
                };
                (
                    peer.clone(),
                    PeerSkewStatistics {
                        current_offset: peer_offsets[peer_offsets.len() - 1],
                        drift_rate: self.peer_drift_rates.get(peer).copied().unwrap_or(0.0),
                        measurements: peer_offsets.len(),
                        mean_offset: peer_mean,
                        std_deviation: peer_std,
                    },
                )
            })
            .collect();

        Some(SkewStatistics {
            current_skew: self.current_skew,
            drift_rate: self.drift_rate,
            measurements: offsets.len(),
            mean_offset: mean,
            median_offset,
            std_deviation,
            min_offset: min,
            max_offset: max,
            range: max - min,
            acceptable: self.is_skew_acceptable(),
            last_analysis: self.last_analysis_time,
            peer_statistics,
        })
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.peer_history.clear();
        self.peer_drift_rates.clear();
        self.current_skew = 0.0;
        self.drift_rate = 0.0;
        self.last_analysis_time = 0.0;
    }
}
