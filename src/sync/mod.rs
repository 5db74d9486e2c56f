//! Outbox reconciliation with the remote mutation endpoint.
//!
//! - `engine`: a single pass over the queue (claim, batch, submit, record)
//! - `scheduler`: the coalescing trigger every sync source goes through
//! - `endpoint`: wire format and the HTTP client
//! - `backoff`: retry schedule and dead-letter bound

mod backoff;
mod endpoint;
mod engine;
pub mod scheduler;
#[cfg(test)]
pub(crate) mod testing;

pub use backoff::RetryPolicy;
pub use endpoint::{HttpEndpoint, MutationEndpoint, SubmitError};
pub use engine::{PassReport, SyncEngine, SyncSettings};
pub use scheduler::SyncHandle;
