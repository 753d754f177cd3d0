//! Vantage Tree
//!
//! Durable per-perspective DAG storage over an ordered byte-keyed store.
//! Keys follow a fixed binary grammar so lexicographic order in the store is
//! exactly insertion order, per-id head enumeration and version lookup.

pub mod keys;
pub mod store;
pub mod tree;

pub use keys::{KeyError, ParsedKey};
pub use store::{Store, StoreError};
pub use tree::{Tree, TreeError, TreeEvent};
