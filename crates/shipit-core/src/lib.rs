//! Core domain types and traits for the shipit build orchestrator.
//!
//! This crate contains:
//! - Build identifiers and the job record with its lifecycle state machine
//! - Build outcomes reported by the execution monitor
//! - Launcher trait (compute substrate)
//! - Artifact sink trait (object storage)
//! - Log bus trait and subscriptions

pub mod artifact;
pub mod bus;
pub mod error;
pub mod id;
pub mod job;
pub mod launcher;
pub mod outcome;

pub use error::{Error, Result};
pub use id::BuildId;
pub use job::{Job, JobStatus, StatusUpdate};
pub use outcome::{BuildOutcome, StatusReporter};
