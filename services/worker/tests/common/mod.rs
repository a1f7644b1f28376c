//! Shared test utilities for worker integration tests.
//!
//! This module provides:
//! - In-memory stand-ins for object storage, the file repository and the
//!   frame source
//! - `WorkerHarness` wiring them into a real `Ingestor` and `Orchestrator`

pub mod fakes;
pub mod harness;

pub use fakes::*;
pub use harness::WorkerHarness;
