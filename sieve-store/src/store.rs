//! Store contract and JSON record helpers

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Errors from store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("No such key: {0}")]
    NoSuchKey(String),

    #[error("Key {0} holds the wrong kind of value")]
    WrongType(String),

    #[error("Record codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// List, set and scalar operations on string keys
///
/// Each operation is atomic on its own; there are no multi-key transactions.
#[async_trait]
pub trait Store: Send + Sync {
    /// Append to the tail of a list
    async fn push_right(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Remove and return the head of a list
    async fn pop_left(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Inclusive slice of a list; negative indices count from the tail
    async fn range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, StoreError>;

    /// Length of a list, zero when missing
    async fn length(&self, key: &str) -> Result<usize, StoreError>;

    /// Move a key, replacing any value at `to`
    async fn rename(&self, from: &str, to: &str) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Pop the tail of `from` and push it onto the head of `to`
    async fn pop_right_push_left(&self, from: &str, to: &str) -> Result<Option<String>, StoreError>;

    /// Add a member; returns whether it was new
    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn set_is_member(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Increment an integer scalar, starting from zero
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;
}

/// Serialize a record as JSON and append it to a list
pub async fn push_record<T>(store: &dyn Store, key: &str, record: &T) -> Result<(), StoreError>
where
    T: Serialize + ?Sized + Sync,
{
    let json = serde_json::to_string(record)?;
    store.push_right(key, &json).await
}

/// Pop the head of a list and decode it
///
/// An undecodable entry has already been removed when `Codec` is returned.
pub async fn pop_record<T>(store: &dyn Store, key: &str) -> Result<Option<T>, StoreError>
where
    T: DeserializeOwned,
{
    match store.pop_left(key).await? {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

/// Read and decode every entry of a list without removing them
pub async fn list_records<T>(store: &dyn Store, key: &str) -> Result<Vec<T>, StoreError>
where
    T: DeserializeOwned,
{
    store
        .range(key, 0, -1)
        .await?
        .iter()
        .map(|json| serde_json::from_str(json).map_err(StoreError::from))
        .collect()
}
