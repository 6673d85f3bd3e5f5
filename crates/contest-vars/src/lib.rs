//! Hierarchical variable store and template compiler for contest scenarios
//!
//! Every scenario, node design, and expectation is rendered through this
//! crate: dotted paths like `.self.alias` resolve against a shared [`Vars`]
//! tree, and `{{ ... }}` expressions in scenario strings are expanded by
//! [`template::compile`] before use.

mod error;
mod store;
mod template;

pub use error::*;
pub use store::{VarFn, Vars};
pub use template::compile;
