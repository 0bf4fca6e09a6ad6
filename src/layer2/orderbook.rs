// Order Book - retained L2 book for delta application
// BTreeMap keyed by OrderedFloat keeps both sides sorted

use ordered_float::OrderedFloat;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use tracing::debug;

use crate::core::types::PriceLevel;

type Price = OrderedFloat<f64>;
type Quantity = f64;

/// Most recent book for one symbol. Inputs are assumed validated.
#[derive(Debug, Clone)]
pub struct OrderBook {
    pub symbol: String,
    bids: BTreeMap<Price, Quantity>,
    asks: BTreeMap<Price, Quantity>,
    last_sequence: u64,
    update_count: u64,
}

impl OrderBook {
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_sequence: 0,
            update_count: 0,
        }
    }

    /// Replace both sides. Zero-size levels are skipped.
    pub fn replace(&mut self, bids: &[PriceLevel], asks: &[PriceLevel], sequence: u64) {
        self.bids.clear();
        self.asks.clear();

        for level in bids.iter().filter(|l| l.size > 0.0) {
            self.bids.insert(OrderedFloat(level.price), level.size);
        }
        for level in asks.iter().filter(|l| l.size > 0.0) {
            self.asks.insert(OrderedFloat(level.price), level.size);
        }

        self.last_sequence = sequence;
        self.update_count += 1;
        debug!(
            symbol = %self.symbol,
            bid_levels = self.bids.len(),
            ask_levels = self.asks.len(),
            "Book replaced from snapshot"
        );
    }

    /// Apply incremental changes. Size 0 removes the level.
    pub fn apply_delta(&mut self, bids: &[PriceLevel], asks: &[PriceLevel], sequence: u64) {
        apply_side(&mut self.bids, bids);
        apply_side(&mut self.asks, asks);
        self.last_sequence = sequence;
        self.update_count += 1;
    }

    /// Best bid after `changes` would be applied, without applying them
    pub fn projected_best_bid(&self, changes: &[PriceLevel]) -> Option<f64> {
        projected_best(self.bids.keys().rev(), changes, |a, b| a > b)
    }

    /// Best ask after `changes` would be applied, without applying them
    pub fn projected_best_ask(&self, changes: &[PriceLevel]) -> Option<f64> {
        projected_best(self.asks.keys(), changes, |a, b| a < b)
    }

    /// Top N bid levels, highest first
    pub fn top_bids(&self, n: usize) -> Vec<PriceLevel> {
        self.bids
            .iter()
            .rev()
            .take(n)
            .map(|(price, &size)| PriceLevel::new(price.0, size))
            .collect()
    }

    /// Top N ask levels, lowest first
    pub fn top_asks(&self, n: usize) -> Vec<PriceLevel> {
        self.asks
            .iter()
            .take(n)
            .map(|(price, &size)| PriceLevel::new(price.0, size))
            .collect()
    }

    pub fn bid_levels(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_levels(&self) -> usize {
        self.asks.len()
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn update_count(&self) -> u64 {
        self.update_count
    }
}

impl fmt::Display for OrderBook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OrderBook(symbol={}, seq={}, bids={}, asks={})",
            self.symbol,
            self.last_sequence,
            self.bids.len(),
            self.asks.len()
        )
    }
}

fn apply_side(side: &mut BTreeMap<Price, Quantity>, changes: &[PriceLevel]) {
    for level in changes {
        let price_key = OrderedFloat(level.price);
        if level.size == 0.0 {
            side.remove(&price_key);
        } else {
            side.insert(price_key, level.size);
        }
    }
}

/// `existing` must iterate best-first; `better(a, b)` is true when `a` outranks `b`
fn projected_best<'a>(
    existing: impl Iterator<Item = &'a Price>,
    changes: &[PriceLevel],
    better: impl Fn(f64, f64) -> bool,
) -> Option<f64> {
    let removed: HashSet<Price> = changes
        .iter()
        .filter(|l| l.size == 0.0)
        .map(|l| OrderedFloat(l.price))
        .collect();

    let surviving = existing.map(|p| p.0).find(|p| !removed.contains(&OrderedFloat(*p)));
    let inserted = changes
        .iter()
        .filter(|l| l.size > 0.0)
        .map(|l| l.price)
        .fold(None, |best: Option<f64>, p| match best {
            Some(b) if !better(p, b) => Some(b),
            _ => Some(p),
        });

    match (surviving, inserted) {
        (Some(s), Some(i)) => Some(if better(i, s) { i } else { s }),
        (s, i) => s.or(i),
    }
}
