// Core engine for the flowrun multi-tenant flow orchestrator

pub mod actions;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod metrics;
pub mod queue;
pub mod state;
pub mod storage;
pub mod tenant;
pub mod types;
pub mod workflow;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use types::*;
