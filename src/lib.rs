//! Credential rotation library
//!
//! Rotates short-lived credentials derived from a master secret, keeps both
//! secrets behind deny-by-default resource policies and reports rotation
//! outcomes to a notifier.

pub mod authority;
pub mod backends;
pub mod cli;
pub mod collector;
pub mod config;
pub mod error;
pub mod events;
pub mod federation;
pub mod identity;
pub mod integration;
pub mod jwt;
pub mod notify;
pub mod policy;
pub mod rotation;
pub mod scheduler;
pub mod targets;

pub use config::Config;
pub use error::{ErrorClass, Result, RotationError};
pub use integration::{Integration, ProvisionedIntegration};
pub use rotation::Rotator;
