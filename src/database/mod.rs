//! # Database Operations
//!
//! The progress store is the single source of truth for task, unit and host
//! state. Two backends implement it:
//!
//! - [`in_memory::InMemoryStore`] for embedded use and tests
//! - [`postgres::PgStore`] for deployments, backed by `sqlx`
//!
//! Both also implement [`ResultStore`] for the per-task result document.

pub mod in_memory;
pub mod postgres;
pub mod progress_store;

pub use in_memory::InMemoryStore;
pub use postgres::PgStore;
pub use progress_store::{ProgressMode, ProgressStore, ResultStore, StoreError, StoreResult};
