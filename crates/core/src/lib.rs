//! Shared domain types, configuration, errors, and capability traits for the
//! campaign dispatch and reward orchestrator.

pub mod clock;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod store;
pub mod templates;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AppConfig;
pub use error::{OrchestratorError, OrchestratorResult, TransportError};
pub use store::Store;
