// Metric Engine - slippage / impact / maker-taker / fee per orderbook update
// Per-field fallback, LRU result cache, time-budgeted periodic refits

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::core::config::PipelineConfig;
use crate::core::events::{Event, EventBus, EventKind};
use crate::core::types::{FeeTier, MetricResult, MetricValue, OrderbookSnapshot};
use crate::layer2::cache::LruCache;
use crate::layer2::models::{
    self, BookView, ComputationError, ImpactModel, MakerTakerModel, RetrainError, SlippageModel,
};

const SOURCE: &str = "metric_engine";

#[derive(Debug, Clone)]
pub struct MetricEngineConfig {
    pub cache_capacity: usize,
    pub fingerprint_depth: usize,
    pub tick_size: f64,
    pub retrain_every_updates: u64,
    pub retrain_interval: Duration,
    pub retrain_budget: Duration,
    pub model_window: usize,
    pub impact_eta: f64,
    pub impact_gamma: f64,
    pub default_volatility: f64,
}

impl MetricEngineConfig {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            cache_capacity: config.cache_capacity,
            fingerprint_depth: config.fingerprint_depth,
            tick_size: config.tick_size,
            retrain_every_updates: config.retrain_every_updates,
            retrain_interval: config.retrain_interval(),
            retrain_budget: config.retrain_budget(),
            model_window: config.model_window,
            impact_eta: config.impact_eta,
            impact_gamma: config.impact_gamma,
            default_volatility: config.default_volatility,
        }
    }
}

impl Default for MetricEngineConfig {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

// ============================================================================
// Model State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricField {
    Slippage,
    MarketImpact,
    MakerShare,
    Fee,
}

impl MetricField {
    pub fn name(&self) -> &'static str {
        match self {
            MetricField::Slippage => "slippage",
            MetricField::MarketImpact => "market_impact",
            MetricField::MakerShare => "maker_share",
            MetricField::Fee => "fee",
        }
    }
}

/// Last successfully computed value per field
#[derive(Debug, Clone, Default)]
pub struct LastGood {
    pub slippage: Option<f64>,
    pub market_impact: Option<f64>,
    pub maker_share: Option<f64>,
    pub fee: Option<f64>,
}

impl LastGood {
    fn slot(&mut self, field: MetricField) -> &mut Option<f64> {
        match field {
            MetricField::Slippage => &mut self.slippage,
            MetricField::MarketImpact => &mut self.market_impact,
            MetricField::MakerShare => &mut self.maker_share,
            MetricField::Fee => &mut self.fee,
        }
    }
}

/// Everything the engine learns; owned per engine instance
#[derive(Debug, Clone)]
pub struct ModelState {
    pub slippage: SlippageModel,
    pub impact: ImpactModel,
    pub maker_taker: MakerTakerModel,
    pub last_good: LastGood,
    pub last_fit_at: Option<Instant>,
    pub updates_since_fit: u64,
}

impl ModelState {
    fn new(config: &MetricEngineConfig) -> Self {
        Self {
            slippage: SlippageModel::default(),
            impact: ImpactModel::new(config.impact_eta, config.impact_gamma, config.default_volatility),
            maker_taker: MakerTakerModel::default(),
            last_good: LastGood::default(),
            last_fit_at: None,
            updates_since_fit: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub updates: u64,
    /// Sub-model calls; four per cache miss, none per hit
    pub model_invocations: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub fallbacks: u64,
    pub unavailable: u64,
    pub refits: u64,
    pub retrain_failures: u64,
}

impl EngineStats {
    pub fn cache_hit_rate(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }
}

impl fmt::Display for EngineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EngineStats(updates={}, invocations={}, hit_rate={:.1}%, fallbacks={}, refits={}, retrain_failures={})",
            self.updates,
            self.model_invocations,
            self.cache_hit_rate() * 100.0,
            self.fallbacks,
            self.refits,
            self.retrain_failures
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    view: Vec<u64>,
    order_size: u64,
    maker_rate: u64,
    taker_rate: u64,
}

// ============================================================================
// Metric Engine
// ============================================================================

pub struct MetricEngine {
    config: MetricEngineConfig,
    state: ModelState,
    cache: LruCache<CacheKey, MetricResult>,
    window: VecDeque<BookView>,
    mids: VecDeque<f64>,
    events: Arc<EventBus>,
    stats: EngineStats,
}

impl MetricEngine {
    pub fn new(config: MetricEngineConfig, events: Arc<EventBus>) -> Self {
        info!(
            cache_capacity = config.cache_capacity,
            depth = config.fingerprint_depth,
            window = config.model_window,
            "MetricEngine initialized"
        );
        Self {
            state: ModelState::new(&config),
            cache: LruCache::new(config.cache_capacity),
            window: VecDeque::with_capacity(config.model_window),
            mids: VecDeque::with_capacity(config.model_window),
            config,
            events,
            stats: EngineStats::default(),
        }
    }

    /// Compute all metrics for one snapshot. Never fails: a failing
    /// sub-computation degrades only its own field.
    pub fn compute(&mut self, snapshot: &OrderbookSnapshot, order_size: f64, fee_tier: FeeTier) -> MetricResult {
        self.stats.updates += 1;
        self.state.updates_since_fit = self.state.updates_since_fit.saturating_add(1);

        let view = BookView::from_snapshot(snapshot, self.config.fingerprint_depth, self.config.tick_size);
        let key = CacheKey {
            view: view.fingerprint(),
            order_size: order_size.to_bits(),
            maker_rate: fee_tier.maker_rate.to_bits(),
            taker_rate: fee_tier.taker_rate.to_bits(),
        };
        self.record(&view);
        // A refit clears the cache, so hits never outlive the models behind them
        self.maybe_refit(order_size);

        if let Some(hit) = self.cache.get(&key) {
            self.stats.cache_hits += 1;
            return hit;
        }
        self.stats.cache_misses += 1;

        let slippage = self.state.slippage.estimate(&view, order_size);
        let slippage = self.resolve(MetricField::Slippage, slippage);

        let impact = self.state.impact.estimate(&view, order_size);
        let impact = self.resolve(MetricField::MarketImpact, impact);

        let maker_share = self.state.maker_taker.estimate(&view);
        let maker_share = self.resolve(MetricField::MakerShare, maker_share);

        let fee = models::fee(order_size, &fee_tier, maker_share.value());
        let fee = self.resolve(MetricField::Fee, fee);

        self.stats.model_invocations += 4;

        let result = MetricResult::assemble(order_size, slippage, impact, fee, maker_share);
        if result.is_fully_fresh() {
            self.cache.insert(key, result);
        }
        result
    }

    pub fn stats(&self) -> EngineStats {
        self.stats.clone()
    }

    pub fn model_state(&self) -> &ModelState {
        &self.state
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    fn record(&mut self, view: &BookView) {
        if self.window.len() >= self.config.model_window {
            self.window.pop_front();
        }
        self.window.push_back(view.clone());

        if let Some(mid) = view.mid_price() {
            if self.mids.len() >= self.config.model_window {
                self.mids.pop_front();
            }
            self.mids.push_back(mid);
        }
    }

    /// Explicit fallback policy: fresh, else last good, else unavailable
    fn resolve(&mut self, field: MetricField, outcome: Result<f64, ComputationError>) -> MetricValue {
        match outcome {
            Ok(value) => {
                *self.state.last_good.slot(field) = Some(value);
                MetricValue::Fresh(value)
            }
            Err(e) => {
                self.stats.fallbacks += 1;
                let carried = *self.state.last_good.slot(field);
                self.events.publish(
                    Event::new(EventKind::ComputationFallback, SOURCE)
                        .with("field", field.name())
                        .with("error", e.to_string())
                        .with("carried_forward", carried.is_some()),
                );
                match carried {
                    Some(value) => MetricValue::CarriedForward(value),
                    None => {
                        self.stats.unavailable += 1;
                        MetricValue::Unavailable
                    }
                }
            }
        }
    }

    fn maybe_refit(&mut self, order_size: f64) {
        let due = match self.state.last_fit_at {
            None => true,
            Some(at) => {
                self.state.updates_since_fit >= self.config.retrain_every_updates
                    || at.elapsed() >= self.config.retrain_interval
            }
        };
        if !due {
            return;
        }
        self.state.last_fit_at = Some(Instant::now());
        self.state.updates_since_fit = 0;

        let views: Vec<BookView> = self.window.iter().cloned().collect();
        let mids: Vec<f64> = self.mids.iter().copied().collect();
        let budget = self.config.retrain_budget;
        let mut refitted: Vec<&'static str> = Vec::new();

        match SlippageModel::fit(&views, order_size, Instant::now() + budget) {
            Ok(fit) => {
                self.state.slippage.fit = Some(fit);
                refitted.push(SlippageModel::NAME);
            }
            Err(e) => self.retrain_failed(e),
        }

        match self.state.impact.fit_volatility(&mids) {
            Ok(sigma) => {
                self.state.impact.volatility = sigma;
                refitted.push(ImpactModel::NAME);
            }
            Err(e) => self.retrain_failed(e),
        }

        match MakerTakerModel::fit(&views, Instant::now() + budget) {
            Ok(fit) => {
                self.state.maker_taker.fit = Some(fit);
                refitted.push(MakerTakerModel::NAME);
            }
            Err(e) => self.retrain_failed(e),
        }

        if !refitted.is_empty() {
            self.cache.clear();
            self.stats.refits += 1;
            debug!(models = ?refitted, window = views.len(), "Models refit");
            self.events.publish(
                Event::new(EventKind::ModelRefit, SOURCE)
                    .with("models", refitted.join(","))
                    .with("window", views.len() as u64)
                    .with("volatility", self.state.impact.volatility),
            );
        }
    }

    /// Previous parameters stay in place
    fn retrain_failed(&mut self, err: RetrainError) {
        self.stats.retrain_failures += 1;
        self.events.publish(Event::new(EventKind::RetrainFailed, SOURCE).with("error", err.to_string()));
    }
}

impl fmt::Display for MetricEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MetricEngine({}, {})", self.stats, self.cache)
    }
}
