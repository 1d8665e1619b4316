//! Scan orchestration: the in-flight registry, the replay scheduler loop and
//! the service factory that wires them to a scanner and a worker pool.

pub mod inflight;
pub mod scheduler;
pub mod service;
