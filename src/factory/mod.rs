// =============================================================================
// Instance Factory (component I)
// =============================================================================

pub mod allocation;
pub mod pipeline;
pub mod template;

pub use pipeline::{FactoryConfig, InstanceFactory, ProgressRecord, Stage};
pub use template::{AllocationStrategy, InMemoryTemplateStore, MarketTemplate, StockTemplate, TemplateStore, TraderCohortTemplate};
