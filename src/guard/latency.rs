//! Rolling latency window for upstream calls

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Time- and count-bounded window of latency samples (milliseconds)
#[derive(Debug)]
pub struct LatencyWindow {
    samples: VecDeque<(Instant, f64)>,
    window_duration: Duration,
    max_samples: usize,
}

impl LatencyWindow {
    pub fn new(window_duration: Duration) -> Self {
        Self::with_max_samples(window_duration, 1000)
    }

    pub fn with_max_samples(window_duration: Duration, max_samples: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            window_duration,
            max_samples: max_samples.max(1),
        }
    }

    pub fn record(&mut self, latency: Duration) {
        self.samples
            .push_back((Instant::now(), latency.as_secs_f64() * 1000.0));
        self.prune();
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
    }

    fn prune(&mut self) {
        let now = Instant::now();
        while let Some((time, _)) = self.samples.front() {
            if now.duration_since(*time) > self.window_duration {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Nearest-rank percentile in ms, `None` with no samples in the window
    pub fn percentile(&mut self, pct: f64) -> Option<f64> {
        self.prune();
        if self.samples.is_empty() {
            return None;
        }
        let mut values: Vec<f64> = self.samples.iter().map(|(_, v)| *v).collect();
        values.sort_by(|a, b| a.total_cmp(b));
        let rank = ((pct / 100.0) * values.len() as f64).ceil() as usize;
        let idx = rank.clamp(1, values.len()) - 1;
        Some(values[idx])
    }

    pub fn p95(&mut self) -> Option<f64> {
        self.percentile(95.0)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_p95() {
        let mut w = LatencyWindow::new(Duration::from_secs(60));
        assert_eq!(w.p95(), None);
        for ms in 1..=100 {
            w.record(Duration::from_millis(ms));
        }
        assert_eq!(w.p95(), Some(95.0));
        assert_eq!(w.percentile(100.0), Some(100.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_samples_expire() {
        let mut w = LatencyWindow::new(Duration::from_secs(10));
        w.record(Duration::from_millis(5000));
        tokio::time::advance(Duration::from_secs(11)).await;
        w.record(Duration::from_millis(10));
        assert_eq!(w.p95(), Some(10.0));
        assert_eq!(w.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_samples_cap() {
        let mut w = LatencyWindow::with_max_samples(Duration::from_secs(60), 3);
        for ms in [100, 200, 300, 1] {
            w.record(Duration::from_millis(ms));
        }
        assert_eq!(w.len(), 3);
        assert_eq!(w.percentile(100.0), Some(300.0));
    }
}
