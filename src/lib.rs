//! Multi-tenant warehouse booking allocation with a WAL-backed in-memory
//! store and a batch expiry-notification pipeline.

pub mod depot;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod scheduler;
pub mod wal;
