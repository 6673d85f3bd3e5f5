//! Scenario model: designs, expectations, conditions, actions and registers.
//!
//! [`Scenario::parse`]/[`Scenario::load_from`] turn a YAML file into a
//! validated in-memory tree; everything downstream (condition compilation,
//! action dispatch) operates on these types rather than raw YAML.

mod error;
mod model;

pub use error::*;
pub use model::*;
