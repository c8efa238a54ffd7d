//! Response outcome counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info};

/// One response in flight.
#[derive(Debug)]
pub struct ResponseTimer {
    started: Instant,
    prompt_chars: usize,
    parts: u64,
}

impl ResponseTimer {
    pub fn log_part(&mut self) {
        self.parts += 1;
    }

    pub fn parts(&self) -> u64 {
        self.parts
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub cancellations: u64,
    pub parts: u64,
}

/// Process-wide counters. Cancellation is neither a success nor a failure.
#[derive(Debug, Default)]
pub struct ResponseStats {
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    cancellations: AtomicU64,
    parts: AtomicU64,
    latency_ms: AtomicU64,
}

impl ResponseStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log_request_arrived(&self, prompt: &str) -> ResponseTimer {
        self.requests.fetch_add(1, Ordering::Relaxed);
        ResponseTimer {
            started: Instant::now(),
            prompt_chars: prompt.chars().count(),
            parts: 0,
        }
    }

    pub fn log_success(&self, timer: ResponseTimer, label: &str) {
        let latency = timer.elapsed();
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.parts.fetch_add(timer.parts, Ordering::Relaxed);
        self.latency_ms
            .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
        info!(
            parts = timer.parts,
            prompt_chars = timer.prompt_chars,
            latency_ms = latency.as_millis() as u64,
            "{label} done!"
        );
    }

    pub fn log_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn log_cancelled(&self) {
        self.cancellations.fetch_add(1, Ordering::Relaxed);
        debug!("Response cancelled");
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
            parts: self.parts.load(Ordering::Relaxed),
        }
    }

    /// Mean latency of successful responses.
    pub fn average_latency(&self) -> Option<Duration> {
        let successes = self.successes.load(Ordering::Relaxed);
        (successes > 0)
            .then(|| Duration::from_millis(self.latency_ms.load(Ordering::Relaxed) / successes))
    }

    /// One-line summary, logged at shutdown.
    pub fn write_summary(&self) {
        let snapshot = self.snapshot();
        info!(
            requests = snapshot.requests,
            successes = snapshot.successes,
            failures = snapshot.failures,
            cancellations = snapshot.cancellations,
            parts = snapshot.parts,
            average_latency_ms = self.average_latency().map(|d| d.as_millis() as u64),
            "Response statistics"
        );
    }
}
