//! Secret sync target implementations
//!
//! Targets are systems that cannot read a derived secret from the store
//! themselves and need a copy pushed to them after each rotation.

mod databricks;
mod sync;
mod target;

pub use databricks::DatabricksTarget;
pub use sync::{SyncJob, SOURCE_SECRET_KEY, TARGET_HOST_KEY, TARGET_TOKEN_KEY};
pub use target::SyncTarget;

/// Target type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetType {
    Databricks,
}

impl std::str::FromStr for TargetType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "databricks" => Ok(TargetType::Databricks),
            _ => Err(format!("Unknown target type: {}. Supported: databricks", s)),
        }
    }
}

/// Type alias for target trait object
pub type TargetInstance = Box<dyn SyncTarget>;
