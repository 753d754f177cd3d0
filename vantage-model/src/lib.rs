//! Vantage Model
//!
//! Pure data types and contracts for the vantage replication engine,
//! decoupled from storage engines and ingestion pipelines.

pub mod config;
pub mod hooks;
pub mod item;
pub mod merge;
pub mod version;

pub use config::{ConfigError, MergeTreeOptions, ReaderOptions, TreeOptions};
pub use hooks::{DocStore, DocStoreError, Hook, HookError, MergeHandler, MergeHandlerError, Transform};
pub use item::{
    DocId, Header, Item, ItemBuilder, ItemError, Meta, Perspective, LOCAL_PERSPECTIVE,
    MAX_ID_SIZE, STAGE_PERSPECTIVE,
};
pub use merge::{merge3, merge_bodies, canonical_eq, MergeConflict};
pub use version::{Version, VersionError, DEFAULT_VERSION_SIZE, MAX_VERSION_SIZE};
