pub mod aggregator;
pub mod candle_store;
pub mod dedupe;
pub mod partial;
pub mod tick_cache;
pub mod tick_pipeline;

pub use candle_store::CandleStore;
pub use tick_cache::{FeedLiveness, TickCache};
pub use tick_pipeline::{PipelineContext, TickPipeline};
