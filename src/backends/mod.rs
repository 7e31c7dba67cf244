//! Secret store implementations
//!
//! This module provides the secret store abstraction, its AWS and in-memory
//! implementations, and the parameter store used alongside it.

mod aws_secrets;
mod memory;
mod parameters;
mod secret_store;

pub use aws_secrets::{caller_identity, load_sdk_config, role_arn_from_assumed, AwsSecretsStore};
pub use memory::MemoryStore;
pub use parameters::{MemoryParameterStore, ParameterStore, SsmParameterStore};
pub use secret_store::{
    RotationBinding, SecretDescription, SecretHandle, SecretStore, SecretValue, AWSCURRENT,
    AWSPENDING, AWSPREVIOUS,
};

/// Store type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreType {
    Memory,
    Aws,
}

impl std::str::FromStr for StoreType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(StoreType::Memory),
            "aws" => Ok(StoreType::Aws),
            _ => Err(format!("Unknown store type: {}. Supported: memory, aws", s)),
        }
    }
}

/// Type alias for the shared store trait object
pub type Store = std::sync::Arc<dyn SecretStore>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_type_parse() {
        assert_eq!("AWS".parse::<StoreType>().unwrap(), StoreType::Aws);
        assert_eq!("memory".parse::<StoreType>().unwrap(), StoreType::Memory);
        assert!("vault".parse::<StoreType>().is_err());
    }
}
