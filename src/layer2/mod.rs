// Layer 2 - Normalization, Metrics & Pipeline
// Turns raw frames into validated snapshots, prices them, hands results to consumers

pub mod cache;
pub mod latency;
pub mod mailbox;
pub mod metric_engine;
pub mod metrics;
pub mod models;
pub mod normalizer;
pub mod orderbook;
pub mod pipeline;

// Re-export commonly used items
pub use cache::LruCache;
pub use latency::{LatencyToken, LatencyTracker};
pub use mailbox::{Mailbox, MailboxStats};
pub use metric_engine::{EngineStats, MetricEngine, MetricEngineConfig, MetricField, ModelState};
pub use metrics::PipelineStats;
pub use models::{BookView, ComputationError, ImpactModel, MakerTakerModel, RetrainError, SlippageModel};
pub use normalizer::{NormalizerStats, OrderbookNormalizer, Side, ValidationError};
pub use orderbook::OrderBook;
pub use pipeline::{IngestionPipeline, PipelineError};
