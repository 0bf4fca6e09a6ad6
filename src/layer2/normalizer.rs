// Orderbook Normalizer - raw venue frames -> canonical snapshots
// Validates every level before touching the retained book

use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tracing::debug;

use crate::core::types::{OrderbookSnapshot, PriceLevel};
use crate::layer1::frame::{FrameKind, RawFrame};
use crate::layer2::orderbook::OrderBook;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Bid,
    Ask,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Bid => write!(f, "bid"),
            Side::Ask => write!(f, "ask"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("{side} level {index} malformed: {reason}")]
    MalformedLevel { side: Side, index: usize, reason: String },
    #[error("{side} level {index} has a non-finite value")]
    NonFinite { side: Side, index: usize },
    #[error("{side} level {index} price {price} is not positive")]
    NonPositivePrice { side: Side, index: usize, price: f64 },
    #[error("{side} level {index} size {size} is negative")]
    NegativeSize { side: Side, index: usize, size: f64 },
    #[error("book has no bids")]
    EmptyBids,
    #[error("book has no asks")]
    EmptyAsks,
    #[error("crossed book: best bid {best_bid} >= best ask {best_ask}")]
    CrossedBook { best_bid: f64, best_ask: f64 },
    #[error("delta received before any snapshot")]
    DeltaWithoutSnapshot,
    #[error("frame for symbol {got}, expected {expected}")]
    SymbolMismatch { expected: String, got: String },
}

#[derive(Debug, Clone, Default)]
pub struct NormalizerStats {
    pub snapshots_applied: u64,
    pub deltas_applied: u64,
    pub rejected: u64,
    pub resets: u64,
}

impl fmt::Display for NormalizerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NormalizerStats(snapshots={}, deltas={}, rejected={}, resets={})",
            self.snapshots_applied, self.deltas_applied, self.rejected, self.resets
        )
    }
}

/// Converts `RawFrame`s into `OrderbookSnapshot`s, retaining the one book
/// needed to apply the next delta.
pub struct OrderbookNormalizer {
    symbol: String,
    book: Option<OrderBook>,
    stats: NormalizerStats,
}

impl OrderbookNormalizer {
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            book: None,
            stats: NormalizerStats::default(),
        }
    }

    pub fn normalize(&mut self, frame: &RawFrame) -> Result<OrderbookSnapshot, ValidationError> {
        let result = self.apply(frame);
        if let Err(e) = &result {
            self.stats.rejected += 1;
            debug!(error = %e, seq = frame.sequence_id, kind = %frame.kind, "Frame rejected");
        }
        result
    }

    /// Drop retained state, e.g. on a new connection session
    pub fn reset(&mut self) {
        self.book = None;
        self.stats.resets += 1;
    }

    pub fn has_book(&self) -> bool {
        self.book.is_some()
    }

    pub fn stats(&self) -> NormalizerStats {
        self.stats.clone()
    }

    fn apply(&mut self, frame: &RawFrame) -> Result<OrderbookSnapshot, ValidationError> {
        if frame.symbol != self.symbol {
            return Err(ValidationError::SymbolMismatch {
                expected: self.symbol.clone(),
                got: frame.symbol.clone(),
            });
        }

        let bids = parse_levels(&frame.bids, Side::Bid)?;
        let asks = parse_levels(&frame.asks, Side::Ask)?;

        match frame.kind {
            FrameKind::Snapshot => {
                let best_bid = best_price(&bids, |a, b| a > b).ok_or(ValidationError::EmptyBids)?;
                let best_ask = best_price(&asks, |a, b| a < b).ok_or(ValidationError::EmptyAsks)?;
                check_crossed(best_bid, best_ask)?;

                let book = self.book.get_or_insert_with(|| OrderBook::new(&frame.symbol));
                book.replace(&bids, &asks, frame.sequence_id);
                self.stats.snapshots_applied += 1;
            }
            FrameKind::Delta => {
                let book = self.book.as_mut().ok_or(ValidationError::DeltaWithoutSnapshot)?;
                let best_bid = book.projected_best_bid(&bids).ok_or(ValidationError::EmptyBids)?;
                let best_ask = book.projected_best_ask(&asks).ok_or(ValidationError::EmptyAsks)?;
                check_crossed(best_bid, best_ask)?;

                book.apply_delta(&bids, &asks, frame.sequence_id);
                self.stats.deltas_applied += 1;
            }
        }

        let book = self.book.as_ref().ok_or(ValidationError::DeltaWithoutSnapshot)?;
        Ok(OrderbookSnapshot {
            symbol: self.symbol.clone(),
            bids: book.top_bids(usize::MAX),
            asks: book.top_asks(usize::MAX),
            sequence_id: frame.sequence_id,
            received_at: frame.received_wall,
            venue_timestamp: frame.venue_timestamp,
        })
    }
}

impl fmt::Display for OrderbookNormalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.book {
            Some(book) => write!(f, "OrderbookNormalizer({})", book),
            None => write!(f, "OrderbookNormalizer(symbol={}, no book)", self.symbol),
        }
    }
}

fn parse_levels(raw: &[Vec<Value>], side: Side) -> Result<Vec<PriceLevel>, ValidationError> {
    raw.iter()
        .enumerate()
        .map(|(index, entry)| parse_level(entry, side, index))
        .collect()
}

fn parse_level(entry: &[Value], side: Side, index: usize) -> Result<PriceLevel, ValidationError> {
    if entry.len() < 2 {
        return Err(ValidationError::MalformedLevel {
            side,
            index,
            reason: format!("expected [price, size], got {} entries", entry.len()),
        });
    }

    let price = parse_number(&entry[0]).ok_or_else(|| ValidationError::MalformedLevel {
        side,
        index,
        reason: format!("price {} is not a number", entry[0]),
    })?;
    let size = parse_number(&entry[1]).ok_or_else(|| ValidationError::MalformedLevel {
        side,
        index,
        reason: format!("size {} is not a number", entry[1]),
    })?;

    if !price.is_finite() || !size.is_finite() {
        return Err(ValidationError::NonFinite { side, index });
    }
    if price <= 0.0 {
        return Err(ValidationError::NonPositivePrice { side, index, price });
    }
    if size < 0.0 {
        return Err(ValidationError::NegativeSize { side, index, size });
    }

    Ok(PriceLevel::new(price, size))
}

/// JSON number or numeric string
fn parse_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Best price among non-empty levels
fn best_price(levels: &[PriceLevel], better: impl Fn(f64, f64) -> bool) -> Option<f64> {
    levels
        .iter()
        .filter(|l| l.size > 0.0)
        .map(|l| l.price)
        .reduce(|best, p| if better(p, best) { p } else { best })
}

fn check_crossed(best_bid: f64, best_ask: f64) -> Result<(), ValidationError> {
    if best_bid >= best_ask {
        return Err(ValidationError::CrossedBook { best_bid, best_ask });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::time::Instant;

    const SYMBOL: &str = "BTC-USDT-SWAP";

    fn frame(kind: FrameKind, seq: u64, bids: Value, asks: Value) -> RawFrame {
        let to_levels = |v: Value| -> Vec<Vec<Value>> {
            v.as_array()
                .unwrap()
                .iter()
                .map(|l| l.as_array().cloned().unwrap_or_default())
                .collect()
        };
        RawFrame {
            kind,
            sequence_id: seq,
            prev_sequence_id: None,
            venue_timestamp: None,
            symbol: SYMBOL.to_string(),
            bids: to_levels(bids),
            asks: to_levels(asks),
            received_at: Instant::now(),
            received_wall: Utc::now(),
            session: 1,
        }
    }

    fn seeded() -> OrderbookNormalizer {
        let mut normalizer = OrderbookNormalizer::new(SYMBOL);
        normalizer
            .normalize(&frame(
                FrameKind::Snapshot,
                1,
                json!([["99", "5"], ["100", "2"]]),
                json!([[101.0, 3.0], ["102", "4"]]),
            ))
            .unwrap();
        normalizer
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let mut normalizer = OrderbookNormalizer::new(SYMBOL);
        let snap = normalizer
            .normalize(&frame(
                FrameKind::Snapshot,
                1,
                json!([["99", "5"], ["100", "2"], ["98", "0"]]),
                json!([["102", "4"], ["101", "3"]]),
            ))
            .unwrap();

        assert_eq!(snap.bids, vec![PriceLevel::new(100.0, 2.0), PriceLevel::new(99.0, 5.0)]);
        assert_eq!(snap.asks, vec![PriceLevel::new(101.0, 3.0), PriceLevel::new(102.0, 4.0)]);
        assert_eq!(snap.sequence_id, 1);
        assert!(normalizer.has_book());
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut normalizer = OrderbookNormalizer::new(SYMBOL);
        let asks = json!([["101", "1"]]);

        let cases = vec![
            (json!([["abc", "1"]]), "malformed"),
            (json!([["100"]]), "malformed"),
            (json!([["-1", "1"]]), "price"),
            (json!([["100", "-2"]]), "size"),
            (json!([["NaN", "1"]]), "non-finite"),
        ];
        for (bids, label) in cases {
            let err = normalizer
                .normalize(&frame(FrameKind::Snapshot, 1, bids, asks.clone()))
                .unwrap_err();
            match (&err, label) {
                (ValidationError::MalformedLevel { side: Side::Bid, .. }, "malformed")
                | (ValidationError::NonPositivePrice { .. }, "price")
                | (ValidationError::NegativeSize { .. }, "size")
                | (ValidationError::NonFinite { .. }, "non-finite") => {}
                _ => panic!("case {} gave {:?}", label, err),
            }
        }
        assert_eq!(normalizer.stats().rejected, 5);
        assert!(!normalizer.has_book());
    }

    #[test]
    fn test_rejects_empty_and_crossed() {
        let mut normalizer = OrderbookNormalizer::new(SYMBOL);
        assert_eq!(
            normalizer
                .normalize(&frame(FrameKind::Snapshot, 1, json!([]), json!([["101", "1"]])))
                .unwrap_err(),
            ValidationError::EmptyBids
        );
        assert_eq!(
            normalizer
                .normalize(&frame(FrameKind::Snapshot, 1, json!([["100", "1"]]), json!([["101", "0"]])))
                .unwrap_err(),
            ValidationError::EmptyAsks
        );
        assert!(matches!(
            normalizer
                .normalize(&frame(FrameKind::Snapshot, 1, json!([["102", "1"]]), json!([["101", "1"]])))
                .unwrap_err(),
            ValidationError::CrossedBook { .. }
        ));
    }

    #[test]
    fn test_delta_without_snapshot() {
        let mut normalizer = OrderbookNormalizer::new(SYMBOL);
        let err = normalizer
            .normalize(&frame(FrameKind::Delta, 2, json!([["100", "1"]]), json!([])))
            .unwrap_err();
        assert_eq!(err, ValidationError::DeltaWithoutSnapshot);
    }

    #[test]
    fn test_delta_applies_onto_book() {
        let mut normalizer = seeded();
        let snap = normalizer
            .normalize(&frame(FrameKind::Delta, 2, json!([["100", "0"], ["99.5", "1"]]), json!([])))
            .unwrap();
        assert_eq!(snap.best_bid(), Some(PriceLevel::new(99.5, 1.0)));
        assert_eq!(snap.asks.len(), 2);
        assert_eq!(snap.sequence_id, 2);
    }

    #[test]
    fn test_rejected_delta_leaves_book_untouched() {
        let mut normalizer = seeded();

        // Second level is invalid: nothing from this delta may land
        let err = normalizer
            .normalize(&frame(FrameKind::Delta, 2, json!([["100", "0"], ["bad", "1"]]), json!([])))
            .unwrap_err();
        assert!(matches!(err, ValidationError::MalformedLevel { index: 1, .. }));

        // Crossing delta is rejected too
        let err = normalizer
            .normalize(&frame(FrameKind::Delta, 3, json!([["105", "1"]]), json!([])))
            .unwrap_err();
        assert!(matches!(err, ValidationError::CrossedBook { .. }));

        // Removing every ask would empty the side
        let err = normalizer
            .normalize(&frame(FrameKind::Delta, 4, json!([]), json!([["101", "0"], ["102", "0"]])))
            .unwrap_err();
        assert_eq!(err, ValidationError::EmptyAsks);

        let snap = normalizer
            .normalize(&frame(FrameKind::Delta, 5, json!([]), json!([])))
            .unwrap();
        assert_eq!(snap.bids, vec![PriceLevel::new(100.0, 2.0), PriceLevel::new(99.0, 5.0)]);
        assert_eq!(snap.asks, vec![PriceLevel::new(101.0, 3.0), PriceLevel::new(102.0, 4.0)]);
    }

    #[test]
    fn test_reset_drops_book() {
        let mut normalizer = seeded();
        normalizer.reset();
        assert!(!normalizer.has_book());
        assert_eq!(
            normalizer
                .normalize(&frame(FrameKind::Delta, 2, json!([]), json!([])))
                .unwrap_err(),
            ValidationError::DeltaWithoutSnapshot
        );
    }

    #[test]
    fn test_symbol_mismatch() {
        let mut normalizer = OrderbookNormalizer::new("ETH-USDT-SWAP");
        let err = normalizer
            .normalize(&frame(FrameKind::Snapshot, 1, json!([["1", "1"]]), json!([["2", "1"]])))
            .unwrap_err();
        assert!(matches!(err, ValidationError::SymbolMismatch { .. }));
    }
}
