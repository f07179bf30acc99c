//! API server for shipit.
//!
//! Accepts build submissions over HTTP and streams build logs to WebSocket
//! subscribers. Also hosts the process wiring shared with the CLI.

pub mod error;
pub mod logging;
pub mod routes;
pub mod runtime;
pub mod state;
pub mod ws;

pub use state::AppState;
