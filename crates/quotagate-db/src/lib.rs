//! Quotagate Database Layer
//!
//! The [`CounterStore`] abstraction over the three counter families (daily quota
//! counters, concurrency counters, task tree tracking) plus daily usage statistics,
//! with a PostgreSQL implementation shared by every server process and an in-memory
//! implementation for tests and single-process tools.

pub mod memory;
pub mod pool;
pub mod postgres;
pub mod store;

pub use memory::MemoryCounterStore;
pub use pool::{connect, run_migrations};
pub use postgres::PgCounterStore;
pub use store::CounterStore;
