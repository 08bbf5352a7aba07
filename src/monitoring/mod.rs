//! Monitoring Module
//!
//! Observability for audit storage:
//! - Coloured console echo of records
//! - Tracing subscriber setup

pub mod console;
pub mod tracing_init;

pub use console::{ConsoleLogger, ConsoleOutput, LevelStyle, Stdout};
pub use tracing_init::init_tracing;
