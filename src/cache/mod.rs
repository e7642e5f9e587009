//! In-process caching of task membership.

pub mod task_cache;

pub use task_cache::{CacheStats, MemberHost, TaskCache, TaskMembership};
