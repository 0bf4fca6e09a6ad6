// L2 Trade-Cost Pipeline
// Streaming orderbook ingestion -> normalization -> cost metrics -> latest-value mailbox

pub mod core;
pub mod layer1;
pub mod layer2;

pub use crate::core::{
    ConnectionState, FeeTier, LatencySample, MetricResult, MetricValue, OrderbookSnapshot,
    PipelineConfig, PipelineOutput, PriceLevel,
};
pub use crate::layer2::{IngestionPipeline, Mailbox, PipelineError};
