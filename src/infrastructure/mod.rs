//! Infrastructure layer - external adapters.
//!
//! This layer provides adapters for:
//! - Clock abstraction (system time vs mock)
//! - An in-memory config store that is both source and status writer

pub mod clock;
pub mod config_store;

/// Mock implementations for testing.
///
/// This module is only available when the `test-helpers` feature is enabled,
/// or during test builds. It provides a controllable clock and a tracing
/// layer that captures log events.
///
/// To use these mocks in integration tests, add to your `Cargo.toml`:
/// ```toml
/// [dev-dependencies]
/// flowgate = { version = "*", features = ["test-helpers"] }
/// ```
#[cfg(any(test, feature = "test-helpers"))]
pub mod mocks;
