//! Time synchronization pipeline for a cluster node.
//!
//! Four cooperating pieces, all pure state (the node drives them and does
//! the networking):
//!
//! * [`sync::TimeSync`] — NTP-style clock offset and network delay
//!   estimation against peers;
//! * [`skew::ClockSkewAnalyzer`] — drift-rate estimation by linear
//!   regression over the offset history;
//! * [`correction::TimestampCorrector`] — per-message timestamp correction
//!   and validation;
//! * [`ordering::MessageOrderingBuffer`] — a bounded reordering buffer that
//!   emits messages in corrected-timestamp order.
//!
//! All timestamps are wall-clock seconds as `f64`.

pub mod correction;
pub mod ordering;
pub mod skew;
pub mod sync;

pub use correction::{CorrectionInfo, CorrectionMethod, TimestampCorrector};
pub use ordering::{CausalOrderingManager, MessageOrderingBuffer, TimedMessage};
pub use skew::ClockSkewAnalyzer;
pub use sync::{offset_sample, SyncSample, TimeSync};

use std::time::{SystemTime, UNIX_EPOCH};

/// Local wall clock as unix seconds.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}

/// Ordinary least-squares slope of offset over time. Returns 0 when the
/// points are too few or degenerate to regress.
pub(crate) fn least_squares_slope(points: &[(f64, f64)]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }
    let n = points.len() as f64;
    let t_mean = points.iter().map(|(t, _)| t).sum::<f64>() / n;
    let o_mean = points.iter().map(|(_, o)| o).sum::<f64>() / n;
    let numerator: f64 = points
        .iter()
        .map(|(t, o)| (t - t_mean) * (o - o_mean))
        .sum();
    let denominator: f64 = points.iter().map(|(t, _)| (t - t_mean).powi(2)).sum();
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

pub(crate) fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}
