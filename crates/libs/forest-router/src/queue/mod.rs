//! Per-link weighted deficit round-robin output scheduling (spec §4.3).

pub mod manager;

pub use manager::{QueueId, QueueManager, DEFAULT_BYTE_LIM, DEFAULT_PKT_LIM, DEFAULT_QUANTUM};
