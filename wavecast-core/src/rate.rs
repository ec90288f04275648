//! Rolling-window byte-rate estimation for throttled handles and the
//! server-wide outgoing bitrate.

use std::collections::VecDeque;

/// Windowed mean of bytes/sec, accumulated into fixed-width buckets.
///
/// The serving engine feeds it one sample per wake (possibly zero bytes, so
/// idle periods pull the average down) and reads the mean back for the
/// `outgoing_kbitrate` stat.
#[derive(Debug)]
pub struct RateEstimator {
    window_ms: u64,
    bucket_ms: u64,
    buckets: VecDeque<(u64, u64)>,
    total: u64,
}

impl RateEstimator {
    /// The fallback-stream estimator: 10 s window of 1 s buckets.
    pub fn new() -> RateEstimator {
        RateEstimator::with_window(10_000, 1000)
    }

    pub fn with_window(window_ms: u64, bucket_ms: u64) -> RateEstimator {
        RateEstimator {
            window_ms,
            bucket_ms: bucket_ms.max(1),
            buckets: VecDeque::new(),
            total: 0,
        }
    }

    pub fn add(&mut self, bytes: u64, now_ms: u64) {
        let start = now_ms - now_ms % self.bucket_ms;
        match self.buckets.back_mut() {
            Some((at, count)) if *at == start => *count += bytes,
            _ => self.buckets.push_back((start, bytes)),
        }
        self.total += bytes;
        self.evict(now_ms);
    }

    /// Windowed mean in bytes per second.
    pub fn avg(&mut self, now_ms: u64) -> u64 {
        self.evict(now_ms);
        let first = match self.buckets.front() {
            Some((at, _)) => *at,
            None => return 0,
        };
        let last = self.buckets.back().map(|(at, _)| *at).unwrap_or(first);
        let span_ms = (last - first) + self.bucket_ms;
        self.total * 1000 / span_ms
    }

    pub fn kbitrate(&mut self, now_ms: u64) -> u64 {
        8 * self.avg(now_ms) / 1024
    }

    /// Drop the stale half of the window. Called when the listener set
    /// changes so the mean tracks the new load quickly.
    pub fn reduce_sampling(&mut self, now_ms: u64) {
        let cutoff = now_ms.saturating_sub(self.window_ms / 2);
        while let Some((at, bytes)) = self.buckets.front().copied() {
            if at + self.bucket_ms > cutoff {
                break;
            }
            self.total -= bytes;
            self.buckets.pop_front();
        }
    }

    fn evict(&mut self, now_ms: u64) {
        let cutoff = now_ms.saturating_sub(self.window_ms);
        while let Some((at, bytes)) = self.buckets.front().copied() {
            if at + self.bucket_ms > cutoff {
                break;
            }
            self.total -= bytes;
            self.buckets.pop_front();
        }
    }
}

impl Default for RateEstimator {
    fn default() -> Self {
        RateEstimator::new()
    }
}
