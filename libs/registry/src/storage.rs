//! The record store the registry persists to
use std::fmt;

use async_trait::async_trait;

/// Named groups of records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    /// `Device`s keyed by MAC
    Devices,
    /// subnet policy overrides keyed by MAC
    Policies,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Devices => "devices",
            Collection::Policies => "policies",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A keyed store of serialized records
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    // send/sync/static required for async trait bounds
    type Error: std::error::Error + Send + Sync + 'static;

    async fn get(&self, collection: Collection, key: &str) -> Result<Option<String>, Self::Error>;

    /// insert `value` if `key` is absent. Returns the stored value and
    /// whether it was inserted by this call
    async fn get_or_insert(
        &self,
        collection: Collection,
        key: &str,
        value: String,
    ) -> Result<(String, bool), Self::Error>;

    /// insert or overwrite
    async fn put(&self, collection: Collection, key: &str, value: String)
        -> Result<(), Self::Error>;

    /// returns true if a record was removed
    async fn delete(&self, collection: Collection, key: &str) -> Result<bool, Self::Error>;

    /// every `(key, value)` in `collection`, ordered by key
    async fn select_all(&self, collection: Collection) -> Result<Vec<(String, String)>, Self::Error>;
}
