pub mod condition;
pub mod dag;
pub mod executor;

pub use condition::Predicate;
pub use dag::{FlowGraph, Readiness};
pub use executor::{ExecutionController, RunFilter, RunStats};
