// Cost Models - slippage, market impact, maker/taker, fee
// Pure functions over a reduced book view plus fitted parameters

use std::fmt;
use std::time::Instant;
use thiserror::Error;

use crate::core::types::{FeeTier, OrderbookSnapshot, PriceLevel};

const EPS: f64 = 1e-12;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ComputationError {
    #[error("insufficient data: {0}")]
    InsufficientData(String),
    #[error("insufficient liquidity: {requested:.4} requested, {available:.4} visible")]
    InsufficientLiquidity { requested: f64, available: f64 },
    #[error("numeric domain error: {0}")]
    NumericDomain(String),
    #[error("{0} model not fitted")]
    ModelNotFitted(&'static str),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RetrainError {
    #[error("{model}: {have} samples, need {need}")]
    InsufficientData { model: &'static str, have: usize, need: usize },
    #[error("{model}: fit exceeded its time budget")]
    BudgetExceeded { model: &'static str },
    #[error("{model}: fit diverged")]
    Diverged { model: &'static str },
}

// ============================================================================
// Book View
// ============================================================================

/// Top-N levels with prices rounded to the tick size. Every model reads only
/// this view, so equal views give equal results.
#[derive(Debug, Clone, PartialEq)]
pub struct BookView {
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

impl BookView {
    pub fn from_snapshot(snapshot: &OrderbookSnapshot, depth: usize, tick_size: f64) -> Self {
        let round = |level: &PriceLevel| {
            let price = if tick_size > 0.0 {
                (level.price / tick_size).round() * tick_size
            } else {
                level.price
            };
            PriceLevel::new(price, level.size)
        };
        Self {
            bids: snapshot.bids.iter().take(depth).map(round).collect(),
            asks: snapshot.asks.iter().take(depth).map(round).collect(),
        }
    }

    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }

    pub fn mid_price(&self) -> Option<f64> {
        Some((self.best_bid()? + self.best_ask()?) / 2.0)
    }

    /// Visible ask liquidity in quote currency
    pub fn ask_quote_depth(&self) -> f64 {
        self.asks.iter().map(PriceLevel::notional).sum()
    }

    /// Visible ask liquidity in base currency
    pub fn ask_base_depth(&self) -> f64 {
        self.asks.iter().map(|l| l.size).sum()
    }

    /// Exact bit pattern of every level, for cache keys
    pub fn fingerprint(&self) -> Vec<u64> {
        let mut bits = Vec::with_capacity(2 * (self.bids.len() + self.asks.len()) + 1);
        for level in &self.bids {
            bits.push(level.price.to_bits());
            bits.push(level.size.to_bits());
        }
        // Separator so [b1][a1 a2] and [b1 a1][a2] differ
        bits.push(u64::MAX);
        for level in &self.asks {
            bits.push(level.price.to_bits());
            bits.push(level.size.to_bits());
        }
        bits
    }
}

/// Volume-weighted price for buying `quote_amount` against the asks
pub fn walk_book(asks: &[PriceLevel], quote_amount: f64) -> Result<f64, ComputationError> {
    if !quote_amount.is_finite() || quote_amount <= 0.0 {
        return Err(ComputationError::NumericDomain(format!("order size {}", quote_amount)));
    }

    let mut remaining = quote_amount;
    let mut base_acquired = 0.0;
    for level in asks {
        if remaining <= EPS {
            break;
        }
        let take = remaining.min(level.notional());
        base_acquired += take / level.price;
        remaining -= take;
    }

    if remaining > EPS * quote_amount.max(1.0) {
        return Err(ComputationError::InsufficientLiquidity {
            requested: quote_amount,
            available: quote_amount - remaining,
        });
    }
    Ok(quote_amount / base_acquired)
}

// ============================================================================
// Slippage: walk-the-book observation + median regression on participation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    pub intercept: f64,
    pub slope: f64,
}

#[derive(Debug, Clone, Default)]
pub struct SlippageModel {
    pub fit: Option<LinearFit>,
}

impl SlippageModel {
    pub const NAME: &'static str = "slippage";
    const MIN_SAMPLES: usize = 3;
    const MAX_ITERATIONS: usize = 50;

    /// (VWAP - best ask) / best ask for a buy of `order_size` quote
    pub fn observed(view: &BookView, order_size: f64) -> Result<f64, ComputationError> {
        let best_ask = view
            .best_ask()
            .ok_or_else(|| ComputationError::InsufficientData("no asks".to_string()))?;
        let vwap = walk_book(&view.asks, order_size)?;
        Ok(((vwap - best_ask) / best_ask).max(0.0))
    }

    pub fn participation(view: &BookView, order_size: f64) -> Result<f64, ComputationError> {
        let depth = view.ask_quote_depth();
        if depth <= 0.0 {
            return Err(ComputationError::InsufficientData("no ask depth".to_string()));
        }
        Ok(order_size / depth)
    }

    /// Expected slippage. Empty bids or asks means nothing to walk: 0.
    pub fn estimate(&self, view: &BookView, order_size: f64) -> Result<f64, ComputationError> {
        if view.bids.is_empty() || view.asks.is_empty() {
            return Ok(0.0);
        }
        match self.fit {
            Some(fit) => {
                let x = Self::participation(view, order_size)?;
                let predicted = fit.intercept + fit.slope * x;
                if !predicted.is_finite() {
                    return Err(ComputationError::NumericDomain("slippage prediction".to_string()));
                }
                Ok(predicted.max(0.0))
            }
            None => Self::observed(view, order_size),
        }
    }

    /// Median (q = 0.5) regression of observed slippage on participation,
    /// fitted by iteratively reweighted least squares.
    pub fn fit(views: &[BookView], order_size: f64, deadline: Instant) -> Result<LinearFit, RetrainError> {
        let samples: Vec<(f64, f64)> = views
            .iter()
            .filter_map(|v| {
                let x = Self::participation(v, order_size).ok()?;
                let y = Self::observed(v, order_size).ok()?;
                Some((x, y))
            })
            .collect();

        if samples.len() < Self::MIN_SAMPLES {
            return Err(RetrainError::InsufficientData {
                model: Self::NAME,
                have: samples.len(),
                need: Self::MIN_SAMPLES,
            });
        }

        let mut weights = vec![1.0; samples.len()];
        let mut fit = weighted_least_squares(&samples, &weights)
            .unwrap_or_else(|| LinearFit { intercept: median(samples.iter().map(|s| s.1)), slope: 0.0 });

        for _ in 0..Self::MAX_ITERATIONS {
            if Instant::now() > deadline {
                return Err(RetrainError::BudgetExceeded { model: Self::NAME });
            }
            for (w, (x, y)) in weights.iter_mut().zip(&samples) {
                let residual = y - (fit.intercept + fit.slope * x);
                *w = 1.0 / residual.abs().max(1e-9);
            }
            let next = match weighted_least_squares(&samples, &weights) {
                Some(next) => next,
                None => break,
            };
            let converged = (next.intercept - fit.intercept).abs() < 1e-12
                && (next.slope - fit.slope).abs() < 1e-12;
            fit = next;
            if converged {
                break;
            }
        }

        if !fit.intercept.is_finite() || !fit.slope.is_finite() {
            return Err(RetrainError::Diverged { model: Self::NAME });
        }
        Ok(fit)
    }
}

/// None when x has no spread
fn weighted_least_squares(samples: &[(f64, f64)], weights: &[f64]) -> Option<LinearFit> {
    let sw: f64 = weights.iter().sum();
    if sw <= 0.0 {
        return None;
    }
    let mx = samples.iter().zip(weights).map(|((x, _), w)| w * x).sum::<f64>() / sw;
    let my = samples.iter().zip(weights).map(|((_, y), w)| w * y).sum::<f64>() / sw;
    let sxx: f64 = samples.iter().zip(weights).map(|((x, _), w)| w * (x - mx).powi(2)).sum();
    let sxy: f64 = samples.iter().zip(weights).map(|((x, y), w)| w * (x - mx) * (y - my)).sum();

    if sxx <= EPS * sw {
        return None;
    }
    let slope = sxy / sxx;
    Some(LinearFit { intercept: my - slope * mx, slope })
}

fn median(values: impl Iterator<Item = f64>) -> f64 {
    let mut sorted: Vec<f64> = values.collect();
    if sorted.is_empty() {
        return 0.0;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

// ============================================================================
// Market impact: Almgren-Chriss temporary + permanent
// ============================================================================

#[derive(Debug, Clone)]
pub struct ImpactModel {
    /// Temporary impact coefficient
    pub eta: f64,
    /// Permanent / temporary ratio
    pub gamma: f64,
    pub volatility: f64,
}

impl ImpactModel {
    pub const NAME: &'static str = "impact";
    const MIN_MIDS: usize = 3;

    pub fn new(eta: f64, gamma: f64, volatility: f64) -> Self {
        Self { eta, gamma, volatility }
    }

    /// Total impact as a fraction of the best ask
    pub fn estimate(&self, view: &BookView, order_size: f64) -> Result<f64, ComputationError> {
        if !order_size.is_finite() || order_size < 0.0 {
            return Err(ComputationError::NumericDomain(format!("order size {}", order_size)));
        }
        let best_ask = view
            .best_ask()
            .ok_or_else(|| ComputationError::InsufficientData("no asks".to_string()))?;
        let depth = view.ask_base_depth();
        if depth <= 0.0 {
            return Err(ComputationError::InsufficientData("no ask depth".to_string()));
        }

        let participation = (order_size / best_ask) / depth;
        let temporary = self.eta * self.volatility * participation.sqrt();
        let permanent = self.gamma * temporary;
        let total = temporary + permanent;
        if !total.is_finite() {
            return Err(ComputationError::NumericDomain("impact".to_string()));
        }
        Ok(total)
    }

    /// Standard deviation of log mid returns. A flat window keeps the
    /// current volatility.
    pub fn fit_volatility(&self, mids: &[f64]) -> Result<f64, RetrainError> {
        if mids.len() < Self::MIN_MIDS {
            return Err(RetrainError::InsufficientData {
                model: Self::NAME,
                have: mids.len(),
                need: Self::MIN_MIDS,
            });
        }

        let returns: Vec<f64> = mids.windows(2).map(|w| (w[1] / w[0]).ln()).collect();
        let n = returns.len() as f64;
        let mean = returns.iter().sum::<f64>() / n;
        let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
        let sigma = variance.sqrt();

        if !sigma.is_finite() {
            return Err(RetrainError::Diverged { model: Self::NAME });
        }
        if sigma <= 0.0 {
            return Ok(self.volatility);
        }
        Ok(sigma)
    }
}

// ============================================================================
// Maker/taker: L2-regularised logistic regression
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct LogisticFit {
    /// [bias, distance, size]
    pub weights: [f64; 3],
    pub feature_mean: [f64; 2],
    pub feature_scale: [f64; 2],
}

impl LogisticFit {
    fn probability(&self, features: [f64; 2]) -> f64 {
        let z0 = (features[0] - self.feature_mean[0]) / self.feature_scale[0];
        let z1 = (features[1] - self.feature_mean[1]) / self.feature_scale[1];
        sigmoid(self.weights[0] + self.weights[1] * z0 + self.weights[2] * z1)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MakerTakerModel {
    pub fit: Option<LogisticFit>,
}

impl MakerTakerModel {
    pub const NAME: &'static str = "maker_taker";
    const MIN_SAMPLES: usize = 4;
    const LEARNING_RATE: f64 = 0.5;
    const L2: f64 = 0.01;
    const MAX_ITERATIONS: usize = 300;

    /// [distance from mid in bps, ln(size)]
    pub fn features(level: &PriceLevel, mid: f64) -> [f64; 2] {
        [(level.price - mid) / mid * 10_000.0, level.size.max(1e-3).ln()]
    }

    /// Mean maker probability across the view, in percent
    pub fn estimate(&self, view: &BookView) -> Result<f64, ComputationError> {
        let fit = self.fit.as_ref().ok_or(ComputationError::ModelNotFitted(Self::NAME))?;
        let mid = view
            .mid_price()
            .ok_or_else(|| ComputationError::InsufficientData("no mid price".to_string()))?;

        let levels = view.bids.iter().chain(view.asks.iter());
        let (sum, count) = levels.fold((0.0, 0usize), |(sum, count), level| {
            (sum + fit.probability(Self::features(level, mid)), count + 1)
        });
        let share = sum / count as f64 * 100.0;
        if !share.is_finite() {
            return Err(ComputationError::NumericDomain("maker share".to_string()));
        }
        Ok(share.clamp(0.0, 100.0))
    }

    /// Bid levels are labelled maker (1), ask levels taker (0)
    pub fn fit(views: &[BookView], deadline: Instant) -> Result<LogisticFit, RetrainError> {
        let mut samples: Vec<([f64; 2], f64)> = Vec::new();
        for view in views {
            let mid = match view.mid_price() {
                Some(mid) => mid,
                None => continue,
            };
            samples.extend(view.bids.iter().map(|l| (Self::features(l, mid), 1.0)));
            samples.extend(view.asks.iter().map(|l| (Self::features(l, mid), 0.0)));
        }

        if samples.len() < Self::MIN_SAMPLES {
            return Err(RetrainError::InsufficientData {
                model: Self::NAME,
                have: samples.len(),
                need: Self::MIN_SAMPLES,
            });
        }

        let n = samples.len() as f64;
        let mut feature_mean = [0.0; 2];
        let mut feature_scale = [0.0; 2];
        for j in 0..2 {
            feature_mean[j] = samples.iter().map(|(f, _)| f[j]).sum::<f64>() / n;
            let var = samples.iter().map(|(f, _)| (f[j] - feature_mean[j]).powi(2)).sum::<f64>() / n;
            feature_scale[j] = if var.sqrt() > EPS { var.sqrt() } else { 1.0 };
        }

        let standardized: Vec<([f64; 3], f64)> = samples
            .iter()
            .map(|(f, y)| {
                (
                    [
                        1.0,
                        (f[0] - feature_mean[0]) / feature_scale[0],
                        (f[1] - feature_mean[1]) / feature_scale[1],
                    ],
                    *y,
                )
            })
            .collect();

        let mut weights = [0.0; 3];
        for iteration in 0..Self::MAX_ITERATIONS {
            if iteration % 16 == 0 && Instant::now() > deadline {
                return Err(RetrainError::BudgetExceeded { model: Self::NAME });
            }

            let mut gradient = [0.0; 3];
            for (x, y) in &standardized {
                let p = sigmoid(weights[0] * x[0] + weights[1] * x[1] + weights[2] * x[2]);
                for j in 0..3 {
                    gradient[j] += (p - y) * x[j];
                }
            }
            for j in 0..3 {
                let penalty = if j == 0 { 0.0 } else { Self::L2 * weights[j] };
                weights[j] -= Self::LEARNING_RATE * (gradient[j] / n + penalty);
            }
        }

        if weights.iter().any(|w| !w.is_finite()) {
            return Err(RetrainError::Diverged { model: Self::NAME });
        }
        Ok(LogisticFit { weights, feature_mean, feature_scale })
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

// ============================================================================
// Fee
// ============================================================================

/// Order size times the maker/taker blended rate. No maker share means all taker.
pub fn fee(order_size: f64, tier: &FeeTier, maker_share: Option<f64>) -> Result<f64, ComputationError> {
    if !order_size.is_finite() || order_size < 0.0 {
        return Err(ComputationError::NumericDomain(format!("order size {}", order_size)));
    }
    let rate = tier.blended_rate(maker_share.unwrap_or(0.0));
    if !rate.is_finite() || rate < 0.0 {
        return Err(ComputationError::NumericDomain(format!("fee rate {}", rate)));
    }
    Ok(order_size * rate)
}

impl fmt::Display for LinearFit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LinearFit(intercept={:.6}, slope={:.6})", self.intercept, self.slope)
    }
}
