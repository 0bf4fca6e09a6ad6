// Core Type Definitions for the Trade-Cost Pipeline
// Snapshots, metric results, latency samples and the published output bundle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Connection State
// ============================================================================

/// Lifecycle state of the streaming connection.
///
/// Only `StreamConnection` writes this; everything else observes it through a
/// `ConnectionStateHandle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribed,
    Backoff,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================================================
// Order Book
// ============================================================================

/// A price level [price, size]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: f64,
    pub size: f64,
}

impl PriceLevel {
    pub fn new(price: f64, size: f64) -> Self {
        Self { price, size }
    }

    pub fn notional(&self) -> f64 {
        self.price * self.size
    }
}

/// Canonical orderbook view produced by the normalizer.
///
/// Bids are sorted descending and asks ascending by price.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderbookSnapshot {
    pub symbol: String,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub sequence_id: u64,
    pub received_at: DateTime<Utc>,
    pub venue_timestamp: Option<DateTime<Utc>>,
}

impl OrderbookSnapshot {
    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids.first().copied()
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks.first().copied()
    }

    pub fn mid_price(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid.price + ask.price) / 2.0),
            _ => None,
        }
    }

    pub fn spread(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask.price - bid.price),
            _ => None,
        }
    }

    /// Both sides must be populated before metrics are computed
    pub fn is_eligible(&self) -> bool {
        !self.bids.is_empty() && !self.asks.is_empty()
    }
}

impl fmt::Display for OrderbookSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OrderbookSnapshot(symbol={}, seq={}, bids={}, asks={}, mid={:.4})",
            self.symbol,
            self.sequence_id,
            self.bids.len(),
            self.asks.len(),
            self.mid_price().unwrap_or(0.0)
        )
    }
}

// ============================================================================
// Fees
// ============================================================================

/// Maker/taker fee rates expressed as fractions (0.001 = 10 bps)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeeTier {
    pub maker_rate: f64,
    pub taker_rate: f64,
}

impl FeeTier {
    pub fn new(maker_rate: f64, taker_rate: f64) -> Self {
        Self { maker_rate, taker_rate }
    }

    /// Single rate for venues that do not distinguish maker and taker
    pub fn flat(rate: f64) -> Self {
        Self { maker_rate: rate, taker_rate: rate }
    }

    /// Fee rate blended by the maker share (percent)
    pub fn blended_rate(&self, maker_share_pct: f64) -> f64 {
        let maker = (maker_share_pct / 100.0).clamp(0.0, 1.0);
        maker * self.maker_rate + (1.0 - maker) * self.taker_rate
    }
}

impl Default for FeeTier {
    fn default() -> Self {
        Self { maker_rate: 0.0008, taker_rate: 0.0010 }
    }
}

impl fmt::Display for FeeTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FeeTier(maker={:.4}%, taker={:.4}%)", self.maker_rate * 100.0, self.taker_rate * 100.0)
    }
}

// ============================================================================
// Metric Results
// ============================================================================

/// One metric field. A failed computation degrades the field, never the result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum MetricValue {
    Fresh(f64),
    CarriedForward(f64),
    Unavailable,
}

impl MetricValue {
    pub fn value(&self) -> Option<f64> {
        match self {
            MetricValue::Fresh(v) | MetricValue::CarriedForward(v) => Some(*v),
            MetricValue::Unavailable => None,
        }
    }

    pub fn value_or_zero(&self) -> f64 {
        self.value().unwrap_or(0.0)
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, MetricValue::Fresh(_))
    }

    pub fn is_available(&self) -> bool {
        !matches!(self, MetricValue::Unavailable)
    }

    /// Apply `f` to the value, keeping the freshness status
    pub fn map(self, f: impl FnOnce(f64) -> f64) -> MetricValue {
        match self {
            MetricValue::Fresh(v) => MetricValue::Fresh(f(v)),
            MetricValue::CarriedForward(v) => MetricValue::CarriedForward(f(v)),
            MetricValue::Unavailable => MetricValue::Unavailable,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Fresh(v) => write!(f, "{:.6}", v),
            MetricValue::CarriedForward(v) => write!(f, "{:.6}*", v),
            MetricValue::Unavailable => write!(f, "n/a"),
        }
    }
}

/// Trading-cost metrics for one orderbook update
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricResult {
    /// Expected slippage as a fraction of the best ask
    pub slippage: MetricValue,
    /// Temporary + permanent impact as a fraction of the best ask
    pub market_impact: MetricValue,
    /// Fee in quote currency
    pub fee: MetricValue,
    /// Percent of the order expected to execute as maker
    pub maker_share: MetricValue,
    pub taker_share: MetricValue,
    /// order_size * (slippage + impact) + fee, in quote currency
    pub net_cost: MetricValue,
}

impl MetricResult {
    pub fn assemble(
        order_size: f64,
        slippage: MetricValue,
        market_impact: MetricValue,
        fee: MetricValue,
        maker_share: MetricValue,
    ) -> Self {
        let taker_share = maker_share.map(|m| 100.0 - m);

        let net_cost = match (slippage.value(), market_impact.value(), fee.value()) {
            (Some(s), Some(i), Some(fe)) => {
                let cost = order_size * (s + i) + fe;
                if slippage.is_fresh() && market_impact.is_fresh() && fee.is_fresh() {
                    MetricValue::Fresh(cost)
                } else {
                    MetricValue::CarriedForward(cost)
                }
            }
            _ => MetricValue::Unavailable,
        };

        Self { slippage, market_impact, fee, maker_share, taker_share, net_cost }
    }

    pub fn is_fully_fresh(&self) -> bool {
        self.slippage.is_fresh()
            && self.market_impact.is_fresh()
            && self.fee.is_fresh()
            && self.maker_share.is_fresh()
    }
}

impl fmt::Display for MetricResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MetricResult(slippage={}, impact={}, fee={}, maker={}, taker={}, net={})",
            self.slippage, self.market_impact, self.fee, self.maker_share, self.taker_share, self.net_cost
        )
    }
}

// ============================================================================
// Latency
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencySample {
    /// Normalization start to metric completion
    pub processing_ms: f64,
    /// Venue send (or local receipt) to publish
    pub total_ms: f64,
    pub running_average_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub samples: u64,
}

impl fmt::Display for LatencySample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Latency(processing={:.3}ms, total={:.3}ms, avg={:.3}ms)",
            self.processing_ms, self.total_ms, self.running_average_ms
        )
    }
}

// ============================================================================
// Pipeline Output
// ============================================================================

/// Immutable bundle published once per processed update
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutput {
    pub snapshot: OrderbookSnapshot,
    pub metrics: MetricResult,
    pub latency: LatencySample,
    /// Connection session the snapshot came from
    pub session: u64,
}

impl fmt::Display for PipelineOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PipelineOutput(seq={}, {}, {})", self.snapshot.sequence_id, self.metrics, self.latency)
    }
}
