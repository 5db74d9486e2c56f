//! Read-through response cache.
//!
//! Requests are classified by path (`routes`): static assets are served
//! cache-first, whitelisted dynamic reads network-first with a cached
//! fallback, and everything else network-first with an offline placeholder.
//! Entries live in versioned generations; activating a version purges the
//! rest. The layer runs inside its own task (`worker`).

mod layer;
mod routes;
mod storage;
#[cfg(test)]
mod testing;
mod traits;
mod worker;

pub use layer::CacheLayer;
pub use routes::RoutePolicy;
pub use storage::{NoopStorage, SqliteStorage};
pub use traits::{CacheRequest, CacheSource, HttpFetcher};
pub use worker::{spawn, CacheClient};
