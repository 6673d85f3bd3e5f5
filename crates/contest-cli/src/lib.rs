//! The `contest` binary's non-CLI guts: host-flag parsing and the scheduler
//! loop that drives a scenario run from start to shutdown.

mod error;
mod hostspec;
mod scheduler;

pub use error::{CliError, Result};
pub use hostspec::HostSpec;
pub use scheduler::{run, RunArgs};
