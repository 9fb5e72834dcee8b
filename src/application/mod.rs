//! Application layer: the per-payment anchoring workflow and the queue
//! that feeds it.

pub mod orchestrator;
pub mod queue;
