//! Domain layer - pure admission-control logic with no I/O.
//!
//! This layer contains the core concepts of priority and fairness:
//! - Request digests and configuration objects
//! - Flow schema rule matching
//! - Shuffle-shard dealing
//! - Seat allocation across priority levels
//!
//! All types in this layer are pure and easily testable.

pub mod allocation;
pub mod config;
pub mod digest;
pub mod matching;
pub mod shuffle;
pub mod work;
