use crate::backends::SecretValue;
use crate::error::Result;

/// Trait for downstream systems that keep their own copy of a derived
/// credential (Databricks secret scopes, ...)
#[async_trait::async_trait]
pub trait SyncTarget: Send + Sync {
    /// Store `value` under `scope`/`key` in the target system
    async fn put_secret(&self, scope: &str, key: &str, value: &SecretValue) -> Result<()>;

    /// Get the target type name for display purposes
    fn target_type(&self) -> &'static str;
}
