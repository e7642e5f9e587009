pub mod builders;
pub mod runners;
pub mod strategies;

pub use builders::*;
pub use runners::*;

/// Generate a unique name for test isolation
pub fn unique_name(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
}
