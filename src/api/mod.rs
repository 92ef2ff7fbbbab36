// =============================================================================
// External Interface Adapter (component L)
// =============================================================================

pub mod auth;
pub mod rest;
pub mod ws;

pub use rest::{router, AppState};
