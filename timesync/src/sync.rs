//! NTP-style clock offset estimation against cluster peers.

use std::collections::HashMap;

use log::{debug, warn};
use serde::Serialize;

use crate::{least_squares_slope, median};

pub const DEFAULT_SYNC_INTERVAL: f64 = 30.0;
pub const DEFAULT_MAX_OFFSET: f64 = 1.0;

/// Delays outside (0, MAX_PLAUSIBLE_DELAY] are measurement artifacts and
/// the sample is discarded.
pub const MAX_PLAUSIBLE_DELAY: f64 = 1.0;

const OFFSET_HISTORY_SIZE: usize = 20;

/// One accepted measurement from a peer exchange.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SyncSample {
    pub offset: f64,
    pub delay: f64,
}

/// Four-timestamp exchange: `t1` client send, `t2` server receive, `t3`
/// server send, `t4` client receive. Returns `None` when the measured
/// round-trip delay is implausible.
pub fn offset_sample(t1: f64, t2: f64, t3: f64, t4: f64) -> Option<SyncSample> {
    let offset = ((t2 - t1) + (t3 - t4)) / 2.0;
    let delay = (t4 - t1) - (t3 - t2);
    if delay < 0.0 || delay > MAX_PLAUSIBLE_DELAY {
        warn!("rejected time sample: implausible delay {:.6}s", delay);
        return None;
    }
    Some(SyncSample { offset, delay })
}

/// Aggregated synchronization state. Fed one round of per-peer samples at a
/// time by the periodic sync task; the medians of a round become the
/// current offset and delay estimates.
pub struct TimeSync {
    sync_interval: f64,
    max_offset: f64,

    clock_offset: f64,
    network_delay: f64,
    last_sync_time: f64,
    sync_accuracy: f64,
    drift_rate: f64,

    offset_history: Vec<(f64, f64)>,

    peer_offsets: HashMap<String, f64>,
    peer_delays: HashMap<String, f64>,
    peer_last_sync: HashMap<String, f64>,

    sync_attempts: u64,
    successful_syncs: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct SyncStatus {
    pub synchronized: bool,
    pub clock_offset: f64,
    pub network_delay: f64,
    pub sync_accuracy: f64,
    pub drift_rate: f64,
    pub predicted_offset: f64,
    pub offset_history_size: usize,
    pub last_sync_time: f64,
    pub sync_attempts: u64,
    pub successful_syncs: u64,
    pub success_rate: f64,
    pub peer_offsets: HashMap<String, f64>,
    pub peer_delays: HashMap<String, f64>,
}

impl Default for TimeSync {
    fn default() -> Self {
        TimeSync::new(DEFAULT_SYNC_INTERVAL, DEFAULT_MAX_OFFSET)
    }
}

impl TimeSync {
    pub fn new(sync_interval: f64, max_offset: f64) -> Self {
        TimeSync {
            sync_interval,
            max_offset,
            clock_offset: 0.0,
            network_delay: 0.0,
            last_sync_time: 0.0,
            sync_accuracy: 0.0,
            drift_rate: 0.0,
            offset_history: Vec::new(),
            peer_offsets: HashMap::new(),
            peer_delays: HashMap::new(),
            peer_last_sync: HashMap::new(),
            sync_attempts: 0,
            successful_syncs: 0,
        }
    }

    pub fn clock_offset(&self) -> f64 {
        self.clock_offset
    }

    pub fn network_delay(&self) -> f64 {
        self.network_delay
    }

    pub fn sync_accuracy(&self) -> f64 {
        self.sync_accuracy
    }

    pub fn drift_rate(&self) -> f64 {
        self.drift_rate
    }

    pub fn last_sync_time(&self) -> f64 {
        self.last_sync_time
    }

    pub fn sync_interval(&self) -> f64 {
        self.sync_interval
    }

    pub fn sample_count(&self) -> usize {
        self.offset_history.len()
    }

    pub fn peer_offset(&self, peer: &str) -> Option<f64> {
        self.peer_offsets.get(peer).copied()
    }

    pub fn peer_delay(&self, peer: &str) -> Option<f64> {
        self.peer_delays.get(peer).copied()
    }

    /// Local time adjusted by the current offset estimate.
    pub fn synchronized_time(&self, now: f64) -> f64 {
        now + self.clock_offset
    }

    /// Synchronized means a recent successful round and an offset within
    /// the configured bound.
    pub fn is_synchronized(&self, now: f64) -> bool {
        let since_sync = now - self.last_sync_time;
        since_sync < self.sync_interval * 2.0 && self.clock_offset.abs() < self.max_offset
    }

    /// Count a sync round being started, successful or not.
    pub fn record_attempt(&mut self) {
        self.sync_attempts += 1;
    }

    /// Fold one round of per-peer samples into the aggregate estimates.
    /// Returns false when the round produced no usable measurements.
    pub fn apply_round(&mut self, samples: &[(String, SyncSample)], now: f64) -> bool {
        if samples.is_empty() {
            warn!("no valid time measurements obtained from peers");
            return false;
        }

        let mut offsets: Vec<f64> = samples.iter().map(|(_, s)| s.offset).collect();
        let mut delays: Vec<f64> = samples.iter().map(|(_, s)| s.delay).collect();

        self.clock_offset = median(&mut offsets);
        self.network_delay = median(&mut delays);

        for (peer, sample) in samples {
            self.peer_offsets.insert(peer.clone(), sample.offset);
            self.peer_delays.insert(peer.clone(), sample.delay);
            self.peer_last_sync.insert(peer.clone(), now);
        }

        // population standard deviation of the round's offsets
        self.sync_accuracy = if offsets.len() > 1 {
            let mean = offsets.iter().sum::<f64>() / offsets.len() as f64;
            let variance =
                offsets.iter().map(|o| (o - mean).powi(2)).sum::<f64>() / offsets.len() as f64;
            variance.sqrt()
        } else {
            0.0
        };

        self.offset_history.push((now, self.clock_offset));
        if self.offset_history.len() > OFFSET_HISTORY_SIZE {
            self.offset_history.remove(0);
        }
        self.drift_rate = if self.offset_history.len() >= 3 {
            least_squares_slope(&self.offset_history)
        } else {
            0.0
        };
        if self.drift_rate.abs() > 1e-6 {
            warn!("significant clock drift detected: {:.9} s/s", self.drift_rate);
        }

        self.last_sync_time = now;
        self.successful_syncs += 1;
        debug!(
            "time synchronized: offset={:.6}s accuracy={:.6}s drift={:.9}s/s peers={}",
            self.clock_offset,
            self.sync_accuracy,
            self.drift_rate,
            samples.len()
        );
        true
    }

    /// Offset expected at `future_time`, extrapolated along the drift rate.
    pub fn predicted_offset(&self, future_time: f64) -> f64 {
        if self.offset_history.is_empty() {
            return self.clock_offset;
        }
        self.clock_offset + self.drift_rate * (future_time - self.last_sync_time)
    }

    /// Project a peer's current clock from the recorded per-peer offset.
    /// Returns `None` once the measurement is older than three intervals.
    pub fn estimate_peer_time(&self, peer: &str, now: f64) -> Option<f64> {
        let offset = self.peer_offsets.get(peer)?;
        let last = self.peer_last_sync.get(peer).copied().unwrap_or(0.0);
        if now - last > self.sync_interval * 3.0 {
            return None;
        }
        Some(now + offset)
    }

    pub fn status(&self, now: f64) -> SyncStatus {
        SyncStatus {
            synchronized: self.is_synchronized(now),
            clock_offset: self.clock_offset,
            network_delay: self.network_delay,
            sync_accuracy: self.sync_accuracy,
            drift_rate: self.drift_rate,
            predicted_offset: self.predicted_offset(now),
            offset_history_size: self.offset_history.len(),
            last_sync_time: self.last_sync_time,
            sync_attempts: self.sync_attempts,
            successful_syncs: self.successful_syncs,
            success_rate: self.successful_syncs as f64 / self.sync_attempts.max(1) as f64,
            peer_offsets: self.peer_offsets.clone(),
            peer_delays: self.peer_delays.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(offset: f64, delay: f64) -> SyncSample {
        SyncSample { offset, delay }
    }

    #[test]
    fn offset_recovered_within_half_the_delay() {
        // peer clock runs 0.4s ahead, 60ms network each way
        let true_offset = 0.4;
        let t1 = 100.0;
        let t2 = t1 + 0.06 + true_offset;
        let t3 = t2 + 0.001;
        let t4 = t1 + 0.121;
        let sample = offset_sample(t1, t2, t3, t4).unwrap();
        assert!((sample.offset - true_offset).abs() <= sample.delay / 2.0);
    }

    #[test]
    fn implausible_delays_are_rejected() {
        // negative delay
        assert!(offset_sample(100.0, 100.5, 100.5, 100.4).is_none());
        // delay above one second
        assert!(offset_sample(100.0, 100.1, 100.1, 101.5).is_none());
    }

    #[test]
    fn round_takes_the_median_offset() {
        let mut sync = TimeSync::default();
        sync.record_attempt();
        let applied = sync.apply_round(
            &[
                ("http://a".into(), sample(0.10, 0.02)),
                ("http://b".into(), sample(0.30, 0.04)),
                ("http://c".into(), sample(5.00, 0.03)),
            ],
            1000.0,
        );
        assert!(applied);
        // the outlier does not move the median
        assert_eq!(sync.clock_offset(), 0.30);
        assert_eq!(sync.network_delay(), 0.03);
        assert!(sync.sync_accuracy() > 0.0);
        assert!((sync.synchronized_time(1000.0) - 1000.30).abs() < 1e-9);
    }

    #[test]
    fn empty_round_is_a_failure() {
        let mut sync = TimeSync::default();
        sync.record_attempt();
        assert!(!sync.apply_round(&[], 1000.0));
        assert_eq!(sync.status(1000.0).success_rate, 0.0);
    }

    #[test]
    fn synchronized_goes_stale_and_bounded() {
        let mut sync = TimeSync::new(30.0, 1.0);
        sync.apply_round(&[("http://a".into(), sample(0.1, 0.02))], 1000.0);
        assert!(sync.is_synchronized(1010.0));
        // stale after two intervals
        assert!(!sync.is_synchronized(1061.0));

        // an offset beyond the bound is never "synchronized"
        let mut skewed = TimeSync::new(30.0, 1.0);
        skewed.apply_round(&[("http://a".into(), sample(0.9, 0.02))], 1000.0);
        skewed.apply_round(&[("http://a".into(), sample(1.5, 0.02))], 1001.0);
        assert!(!skewed.is_synchronized(1002.0));
    }

    #[test]
    fn drift_tracks_a_growing_offset() {
        let mut sync = TimeSync::default();
        for n in 0..5 {
            let at = 1000.0 + n as f64 * 30.0;
            let offset = 0.1 + n as f64 * 30.0 * 2e-6;
            sync.apply_round(&[("http://a".into(), sample(offset, 0.01))], at);
        }
        assert!((sync.drift_rate() - 2e-6).abs() < 1e-9);
        let predicted = sync.predicted_offset(sync.last_sync_time() + 100.0);
        assert!(predicted > sync.clock_offset());
    }

    #[test]
    fn peer_time_estimates_expire() {
        let mut sync = TimeSync::new(30.0, 1.0);
        sync.apply_round(&[("http://a".into(), sample(0.25, 0.01))], 1000.0);
        assert_eq!(sync.estimate_peer_time("http://a", 1010.0), Some(1010.25));
        assert_eq!(sync.estimate_peer_time("http://a", 1100.0), None);
        assert_eq!(sync.estimate_peer_time("http://unknown", 1010.0), None);
    }
}
