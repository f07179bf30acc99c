//! Job scheduling for shipit.
//!
//! Owns the dispatch queue (in-memory, or PostgreSQL with SKIP LOCKED for
//! distributed claiming), the log bus implementations, and the orchestrator
//! that moves jobs through their lifecycle.

pub mod bus;
pub mod orchestrator;
pub mod pg_queue;
pub mod queue;
pub mod worker;

pub use bus::{InMemoryLogBus, PgLogBus};
pub use orchestrator::{BuildOrchestrator, DispatchResult, OutcomeRecorder};
pub use pg_queue::PgDispatchQueue;
pub use queue::{
    Delivery, DispatchQueue, MemoryDispatchQueue, QueueError, QueueReceipt, QueueResult,
    RetryDecision, RetryPolicy,
};
pub use worker::Worker;
