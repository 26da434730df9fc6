//! Concrete executors.
//!
//! The sandbox that actually runs a module stays outside this crate. The
//! command executor drives it as an external process.

mod command;

pub use command::{CommandExecutor, CommandExecutorFactory};
