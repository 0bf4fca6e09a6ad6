// Pipeline Metrics - Collects and formats stats from all pipeline components
// Aggregates connection, normalizer, engine, latency and mailbox stats into a single view

use std::fmt;
use std::time::Duration;
use tracing::info;

use crate::core::types::LatencySample;
use crate::layer1::connection::ConnectionStats;
use crate::layer2::mailbox::MailboxStats;
use crate::layer2::metric_engine::EngineStats;
use crate::layer2::normalizer::NormalizerStats;

/// Point-in-time stats for a running (or stopped) pipeline
#[derive(Debug, Clone)]
pub struct PipelineStats {
    pub connection: ConnectionStats,
    pub frames_processed: u64,
    pub published: u64,
    pub validation_failures: u64,
    pub stale_dropped: u64,
    pub normalizer: NormalizerStats,
    pub engine: EngineStats,
    pub latency: Option<LatencySample>,
    pub mailbox: MailboxStats,
    pub uptime: Duration,
}

impl PipelineStats {
    /// Frames that never reached the mailbox
    pub fn total_dropped(&self) -> u64 {
        self.connection.corrupt_dropped + self.validation_failures + self.stale_dropped
    }

    pub fn average_latency_ms(&self) -> f64 {
        self.latency.map(|l| l.running_average_ms).unwrap_or(0.0)
    }

    /// Print detailed multi-line report
    pub fn print_report(&self) {
        info!("=== PIPELINE METRICS ===");

        let c = &self.connection;
        info!("  Connection:   state={} session={} frames={} reconnects={} gaps={} corrupt={}",
            c.state, c.session, c.frames_emitted, c.reconnects, c.sequence_gaps, c.corrupt_dropped);

        let n = &self.normalizer;
        info!("  Normalizer:   snapshots={} deltas={} rejected={} resets={}",
            n.snapshots_applied, n.deltas_applied, n.rejected, n.resets);

        let e = &self.engine;
        info!("  Engine:       updates={} invocations={} hit_rate={:.1}% fallbacks={} unavailable={}",
            e.updates, e.model_invocations, e.cache_hit_rate() * 100.0, e.fallbacks, e.unavailable);
        info!("                refits={} retrain_failures={}", e.refits, e.retrain_failures);

        if let Some(l) = &self.latency {
            info!("  Latency:      avg={:.3}ms min={:.3}ms max={:.3}ms last_total={:.3}ms samples={}",
                l.running_average_ms, l.min_ms, l.max_ms, l.total_ms, l.samples);
        }

        let m = &self.mailbox;
        info!("  Mailbox:      published={} overwritten={} taken={}",
            m.published, m.overwritten, m.taken);
        info!("  Pipeline:     processed={} stale={} invalid={} uptime={}s",
            self.frames_processed, self.stale_dropped, self.validation_failures, self.uptime.as_secs());
    }

    /// Print compact single-line stats for periodic logging
    pub fn print_compact(&self) {
        info!("[{:>3}s] {} | processed={} published={} dropped={} | hit={:.0}% fallbacks={} | lat={:.3}ms",
            self.uptime.as_secs(),
            self.connection.state,
            self.frames_processed,
            self.published,
            self.total_dropped(),
            self.engine.cache_hit_rate() * 100.0,
            self.engine.fallbacks,
            self.average_latency_ms());
    }
}

impl fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PipelineStats(state={}, processed={}, published={}, dropped={})",
            self.connection.state,
            self.frames_processed,
            self.published,
            self.total_dropped()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ConnectionState;

    fn stats() -> PipelineStats {
        PipelineStats {
            connection: ConnectionStats {
                state: ConnectionState::Subscribed,
                session: 1,
                frames_emitted: 20,
                corrupt_dropped: 2,
                control_messages: 1,
                reconnects: 0,
                sequence_gaps: 0,
            },
            frames_processed: 18,
            published: 15,
            validation_failures: 2,
            stale_dropped: 1,
            normalizer: NormalizerStats::default(),
            engine: EngineStats::default(),
            latency: None,
            mailbox: MailboxStats::default(),
            uptime: Duration::from_secs(3),
        }
    }

    #[test]
    fn test_total_dropped() {
        // 2 corrupt + 2 invalid + 1 stale
        assert_eq!(stats().total_dropped(), 5);
    }

    #[test]
    fn test_average_latency_defaults_to_zero() {
        let mut s = stats();
        assert_eq!(s.average_latency_ms(), 0.0);
        s.latency = Some(LatencySample {
            processing_ms: 0.2,
            total_ms: 1.0,
            running_average_ms: 0.25,
            min_ms: 0.1,
            max_ms: 0.4,
            samples: 4,
        });
        assert_eq!(s.average_latency_ms(), 0.25);
    }

    #[test]
    fn test_reports_without_latency_sample() {
        // Before the first publish there is no latency to report
        let s = stats();
        s.print_compact();
        s.print_report();
        assert!(s.latency.is_none());
    }

    #[test]
    fn test_display() {
        let s = format!("{}", stats());
        assert!(s.contains("state=Subscribed"));
        assert!(s.contains("published=15"));
        assert!(s.contains("dropped=5"));
    }
}
