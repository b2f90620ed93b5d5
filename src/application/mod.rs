//! Application layer - orchestration of domain logic.
//!
//! This layer owns the runtime state of admission control:
//! - Classifier (request to flow schema and priority level)
//! - Queue sets (per-level seat budgets and fair queuing)
//! - Configuration controller (sync, rebalance, reap)
//! - Filter (the per-request entry point)
//! - Watch tracker (open watches, for work estimation)
//!
//! ## Ports
//!
//! The application layer defines ports (traits) that infrastructure
//! adapters must implement: the clock, the config store, the status writer
//! and the metrics recorder.

pub mod classifier;
pub mod context;
pub mod controller;
pub mod debug;
pub mod filter;
pub mod metrics;
pub mod ports;
pub mod queueset;
pub mod seat_pool;
pub mod watch_tracker;
