// Latency Tracker - per-update processing and end-to-end latency
// Running mean and extremes are over processing latency; no sample history kept

use std::fmt;
use std::time::Instant;

use crate::core::types::LatencySample;

/// Handed out by `begin`, consumed by `end`
#[derive(Debug, Clone, Copy)]
pub struct LatencyToken {
    received_at: Instant,
    started_at: Instant,
    venue_transit_ms: Option<f64>,
}

#[derive(Debug, Default)]
pub struct LatencyTracker {
    samples: u64,
    average_ms: f64,
    min_ms: f64,
    max_ms: f64,
    last: Option<LatencySample>,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark processing start for a frame received at `received_at`.
    /// `venue_transit_ms` is venue timestamp to local receipt, when known.
    pub fn begin(&self, received_at: Instant, venue_transit_ms: Option<f64>) -> LatencyToken {
        LatencyToken {
            received_at,
            started_at: Instant::now(),
            venue_transit_ms,
        }
    }

    pub fn end(&mut self, token: LatencyToken) -> LatencySample {
        let processing_ms = token.started_at.elapsed().as_secs_f64() * 1000.0;
        // Clock skew can make transit negative
        let transit_ms = token.venue_transit_ms.unwrap_or(0.0).max(0.0);
        let total_ms = transit_ms + token.received_at.elapsed().as_secs_f64() * 1000.0;
        self.record(processing_ms, total_ms)
    }

    pub(crate) fn record(&mut self, processing_ms: f64, total_ms: f64) -> LatencySample {
        self.samples = self.samples.saturating_add(1);
        self.average_ms += (processing_ms - self.average_ms) / self.samples as f64;

        if self.samples == 1 {
            self.min_ms = processing_ms;
            self.max_ms = processing_ms;
        } else {
            self.min_ms = self.min_ms.min(processing_ms);
            self.max_ms = self.max_ms.max(processing_ms);
        }

        let sample = LatencySample {
            processing_ms,
            total_ms,
            running_average_ms: self.average_ms,
            min_ms: self.min_ms,
            max_ms: self.max_ms,
            samples: self.samples,
        };
        self.last = Some(sample);
        sample
    }

    pub fn last(&self) -> Option<LatencySample> {
        self.last
    }

    pub fn average_ms(&self) -> f64 {
        self.average_ms
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }
}

impl fmt::Display for LatencyTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LatencyTracker(samples={}, avg={:.3}ms, min={:.3}ms, max={:.3}ms)",
            self.samples, self.average_ms, self.min_ms, self.max_ms
        )
    }
}
