//! Vantage Engine
//!
//! The ingestion and emission machinery over per-perspective trees: the
//! writer pipeline that adopts foreign history into the local perspective,
//! lowest-common-ancestor search, the tailable projecting reader, the
//! staged merge-tree façade and oplog ingestion.

pub mod lca;
pub mod merge_tree;
pub mod oplog;
pub mod overlay;
pub mod reader;
pub mod writer;

pub use lca::{find_lcas, LcaError};
pub use merge_tree::{MergeTree, OplogSink, WriteSink};
pub use oplog::{OplogEntry, OplogError, OplogOp};
pub use overlay::{Chain, DagSource, Overlay};
pub use reader::{Reader, ReaderCloser, ReaderError, ReaderItem};
pub use writer::WriteError;
