//! Collaborator contracts
//!
//! Seams to components outside the engine: reader/import transforms, the
//! merge confirmation round-trip, and the plain (unversioned) document store
//! the winning versions are synchronized into.

use async_trait::async_trait;
use bson::Document;
use thiserror::Error;

use crate::item::Item;

/// Error from a hook; opaque to the engine.
#[derive(Debug, Error)]
#[error("hook failed: {0}")]
pub struct HookError(pub String);

/// An ordered reader/import transform.
///
/// Returning `None` drops the item from the stream; the reader then treats
/// it like a filtered item and projects its ancestors instead.
#[async_trait]
pub trait Hook: Send + Sync {
    async fn run(&self, item: Item, opts: &Document) -> Result<Option<Item>, HookError>;
}

/// Error from a merge handler; opaque to the engine.
#[derive(Debug, Error)]
#[error("merge handler failed: {0}")]
pub struct MergeHandlerError(pub String);

/// Receives every engine-generated merge before it is confirmed.
///
/// The handler typically persists the merged document in the application's
/// own store; the resulting change feeds back through the local write sink
/// and confirms the staged merge.
#[async_trait]
pub trait MergeHandler: Send + Sync {
    async fn merge(&self, merged: &Item, prev_head: Option<&Item>) -> Result<(), MergeHandlerError>;
}

/// Error from the plain document store; opaque to the engine.
#[derive(Debug, Error)]
#[error("document store failed: {0}")]
pub struct DocStoreError(pub String);

/// The companion unversioned collection winning heads are written back to.
#[async_trait]
pub trait DocStore: Send + Sync {
    async fn upsert(&self, id: &[u8], body: &Document) -> Result<(), DocStoreError>;
    async fn remove(&self, id: &[u8]) -> Result<(), DocStoreError>;
}

/// Synchronous per-item rewrite applied before staging.
pub trait Transform: Send + Sync {
    fn apply(&self, item: Item) -> Item;
}
