// =============================================================================
// Time-Series Manager (component H)
// =============================================================================

pub mod bucket;
pub mod manager;

pub use bucket::{Candle, Granularity};
pub use manager::{LaggingSubscriber, SeriesDelta, SeriesId, TimeSeriesManager, DEFAULT_RETENTION};
