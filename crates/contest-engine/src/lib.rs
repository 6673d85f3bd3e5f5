//! The scenario execution core: condition queries, the expectation state
//! machine that sequences and polls them, and the action dispatcher that
//! actions a match into container/host operations.

mod compare;
mod condition;
mod context;
mod dispatch;
mod duration;
mod engine;
mod error;

pub use condition::{compile as compile_condition, ConditionQuery};
pub use context::{container_name, EngineContext, NodeRunFlags};
pub use dispatch::dispatch;
pub use duration::parse_duration;
pub use engine::ExpectationEngine;
pub use error::*;
