//! Runtime glue that wires configs, scan signals, telemetry, and runner
//! orchestration.

pub mod config;
pub mod runner;
pub mod signals;
pub mod telemetry;
