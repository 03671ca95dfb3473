//! Upload progress and a sliding-window ETA estimate

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

const DEFAULT_WINDOW: Duration = Duration::from_secs(5);

/// Snapshot handed to progress callbacks
#[derive(Debug, Clone, PartialEq)]
pub struct UploadProgress {
    /// Octets received so far
    pub uploaded: usize,
    /// Octets requested
    pub total: usize,
    /// Recent transfer rate in octets per second
    pub rate: Option<f64>,
    /// Estimated time to completion at the recent rate
    pub eta: Option<Duration>,
}

impl UploadProgress {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.uploaded as f64 * 100.0 / self.total as f64
    }

    pub fn is_complete(&self) -> bool {
        self.uploaded >= self.total
    }
}

/// Rate estimator over the samples of the last `window`
#[derive(Debug, Clone)]
pub struct EtaEstimator {
    total: usize,
    window: Duration,
    samples: VecDeque<(Instant, usize)>,
}

impl EtaEstimator {
    pub fn new(total: usize) -> Self {
        Self::with_window(total, DEFAULT_WINDOW)
    }

    pub fn with_window(total: usize, window: Duration) -> Self {
        Self {
            total,
            window,
            samples: VecDeque::new(),
        }
    }

    /// Record the running total now
    pub fn record(&mut self, uploaded: usize) -> UploadProgress {
        self.record_at(Instant::now(), uploaded)
    }

    /// Record the running total at `now`
    pub fn record_at(&mut self, now: Instant, uploaded: usize) -> UploadProgress {
        self.samples.push_back((now, uploaded));
        // keep two samples at least so a slow link still yields a rate
        while self.samples.len() > 2 {
            match self.samples.front() {
                Some((t, _)) if now.duration_since(*t) > self.window => {
                    self.samples.pop_front();
                }
                _ => break,
            }
        }

        let rate = self.rate();
        let remaining = self.total.saturating_sub(uploaded);
        let eta = match rate {
            _ if remaining == 0 => Some(Duration::ZERO),
            Some(rate) if rate > 0.0 => Some(Duration::from_secs_f64(remaining as f64 / rate)),
            _ => None,
        };

        UploadProgress {
            uploaded,
            total: self.total,
            rate,
            eta,
        }
    }

    fn rate(&self) -> Option<f64> {
        let (first_at, first) = self.samples.front()?;
        let (last_at, last) = self.samples.back()?;
        let elapsed = last_at.duration_since(*first_at).as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        Some(last.saturating_sub(*first) as f64 / elapsed)
    }
}
