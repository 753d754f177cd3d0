//! Engine configuration
//!
//! Plain option structs with defaults; validation happens once at open time
//! so the data path can assume well-formed settings.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bson::Document;
use thiserror::Error;

use crate::hooks::{DocStore, Hook, MergeHandler, Transform};
use crate::item::{Perspective, LOCAL_PERSPECTIVE, STAGE_PERSPECTIVE};
use crate::version::{Version, DEFAULT_VERSION_SIZE, MAX_VERSION_SIZE};

/// Errors from option validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("version width must be 1..={MAX_VERSION_SIZE}, got {0}")]
    BadVersionSize(usize),

    #[error("insertion index width must be 1..={MAX_VERSION_SIZE}, got {0}")]
    BadIndexSize(usize),

    #[error("invalid tree name {0:?}: {1}")]
    BadName(String, String),

    #[error("perspective names must be pairwise distinct: {0:?} repeats")]
    DuplicatePerspective(String),

    #[error("perspective {0:?} collides with a reserved tree name")]
    ReservedPerspective(String),
}

/// Per-tree settings.
#[derive(Debug, Clone, Copy)]
pub struct TreeOptions {
    /// Version byte width.
    pub v_size: usize,
    /// Insertion index byte width.
    pub i_size: usize,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            v_size: DEFAULT_VERSION_SIZE,
            i_size: DEFAULT_VERSION_SIZE,
        }
    }
}

impl TreeOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.v_size == 0 || self.v_size > MAX_VERSION_SIZE {
            return Err(ConfigError::BadVersionSize(self.v_size));
        }
        if self.i_size == 0 || self.i_size > MAX_VERSION_SIZE {
            return Err(ConfigError::BadIndexSize(self.i_size));
        }
        Ok(())
    }
}

/// Settings for the merge-tree façade.
#[derive(Clone)]
pub struct MergeTreeOptions {
    /// Name of the local tree.
    pub local: String,
    /// Name of the stage tree.
    pub stage: String,
    /// Declared remote perspective names.
    pub perspectives: Vec<String>,
    /// Version byte width.
    pub v_size: usize,
    /// Insertion index byte width.
    pub i_size: usize,
    /// Ingress buffer capacity per write sink.
    pub queue_limit: usize,
    /// Backoff before retrying a full ingress queue.
    pub queue_limit_retry_timeout: Duration,
    /// Periodic queue drain, if any.
    pub auto_process_interval: Option<Duration>,
    /// Log and skip ids that fail instead of aborting the batch.
    pub proceed_on_error: bool,
    /// Per-item rewrite applied before staging.
    pub transform: Option<Arc<dyn Transform>>,
    /// Sink for engine-generated merges; merges auto-confirm when absent.
    pub merge_handler: Option<Arc<dyn MergeHandler>>,
    /// Companion plain store winning heads are synchronized into.
    pub doc_store: Option<Arc<dyn DocStore>>,
}

impl Default for MergeTreeOptions {
    fn default() -> Self {
        Self {
            local: LOCAL_PERSPECTIVE.to_string(),
            stage: STAGE_PERSPECTIVE.to_string(),
            perspectives: Vec::new(),
            v_size: DEFAULT_VERSION_SIZE,
            i_size: DEFAULT_VERSION_SIZE,
            queue_limit: 5000,
            queue_limit_retry_timeout: Duration::from_millis(4000),
            auto_process_interval: None,
            proceed_on_error: false,
            transform: None,
            merge_handler: None,
            doc_store: None,
        }
    }
}

impl fmt::Debug for MergeTreeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeTreeOptions")
            .field("local", &self.local)
            .field("stage", &self.stage)
            .field("perspectives", &self.perspectives)
            .field("v_size", &self.v_size)
            .field("i_size", &self.i_size)
            .field("queue_limit", &self.queue_limit)
            .field("proceed_on_error", &self.proceed_on_error)
            .finish_non_exhaustive()
    }
}

impl MergeTreeOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        TreeOptions {
            v_size: self.v_size,
            i_size: self.i_size,
        }
        .validate()?;

        for name in [&self.local, &self.stage]
            .into_iter()
            .chain(self.perspectives.iter())
        {
            Perspective::new(name.clone())
                .map_err(|e| ConfigError::BadName(name.clone(), e.to_string()))?;
        }
        if self.local == self.stage {
            return Err(ConfigError::ReservedPerspective(self.stage.clone()));
        }
        let mut seen = std::collections::BTreeSet::new();
        for pe in &self.perspectives {
            if pe == &self.local || pe == &self.stage {
                return Err(ConfigError::ReservedPerspective(pe.clone()));
            }
            if !seen.insert(pe.clone()) {
                return Err(ConfigError::DuplicatePerspective(pe.clone()));
            }
        }
        Ok(())
    }

    pub fn tree_options(&self) -> TreeOptions {
        TreeOptions {
            v_size: self.v_size,
            i_size: self.i_size,
        }
    }
}

/// Settings for one reader stream.
#[derive(Clone, Default)]
pub struct ReaderOptions {
    /// Start emitting at this version; everything before is suppressed.
    pub offset: Option<Version>,
    /// Attribute-equality predicate over item bodies.
    pub filter: Option<Document>,
    /// Ordered transforms applied to each emitted item.
    pub hooks: Vec<Arc<dyn Hook>>,
    /// Options handed to every hook invocation.
    pub hooks_opts: Document,
    /// Keep tailing the tree after catching up.
    pub follow: bool,
    /// Emit encoded bytes instead of parsed documents.
    pub raw: bool,
}

impl fmt::Debug for ReaderOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderOptions")
            .field("offset", &self.offset)
            .field("filter", &self.filter)
            .field("hooks", &self.hooks.len())
            .field("follow", &self.follow)
            .field("raw", &self.raw)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        TreeOptions::default().validate().unwrap();
        MergeTreeOptions::default().validate().unwrap();
    }

    #[test]
    fn rejects_bad_widths() {
        let opts = TreeOptions { v_size: 0, i_size: 6 };
        assert!(opts.validate().is_err());
        let opts = TreeOptions { v_size: 6, i_size: 7 };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn rejects_reserved_and_duplicate_perspectives() {
        let mut opts = MergeTreeOptions::default();
        opts.perspectives = vec!["_local".into()];
        assert!(opts.validate().is_err());

        opts.perspectives = vec!["a".into(), "a".into()];
        assert!(opts.validate().is_err());

        opts.perspectives = vec!["a".into(), "b".into()];
        assert!(opts.validate().is_ok());
    }
}
