//! Writer pipeline steps
//!
//! Pure-ish helpers the merge tree drives batch by batch: validating and
//! normalizing an ingress batch against its perspective's DAG, adopting
//! foreign items into the local history (with perspective-bound merges so
//! local-only fields survive), reducing one clean head per id, and merging
//! diverged heads with deterministic content-hash versions.

use std::collections::{HashMap, HashSet};

use thiserror::Error;
use tracing::warn;

use vantage_model::{
    merge3, merge_bodies, DocId, DocStoreError, Header, Item, ItemError, MergeConflict,
    MergeHandlerError, Meta, Perspective, Version,
};
use vantage_tree::TreeError;

use crate::lca::{find_lcas, LcaError};
use crate::overlay::{DagSource, Overlay};

/// Errors from the writer pipeline.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("invalid item: {0}")]
    Item(#[from] ItemError),

    #[error("batch perspective mismatch: expected {expected}, got {got}")]
    PerspectiveMismatch { expected: String, got: String },

    #[error("perspective {0} is reserved")]
    ReservedPerspective(String),

    #[error("perspective {0} is not declared")]
    UnknownPerspective(String),

    #[error("new root for {0} not permitted: previous item is not a tombstone")]
    RootPreceded(DocId),

    #[error("parent {0} not found")]
    ParentNotFound(Version),

    #[error("multiple clean heads for {0} where one is required")]
    AmbiguousHeads(DocId),

    #[error("items written locally may not carry parents")]
    ParentsPreset,

    #[error("confirmation of {0} arrived out of stage order")]
    OutOfOrderConfirmation(Version),

    #[error(transparent)]
    Lca(#[from] LcaError),

    #[error(transparent)]
    Merge(#[from] MergeConflict),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Handler(#[from] MergeHandlerError),

    #[error(transparent)]
    DocStore(#[from] DocStoreError),

    #[error("invalid options: {0}")]
    Config(#[from] vantage_model::ConfigError),

    #[error(transparent)]
    Oplog(#[from] crate::oplog::OplogError),

    #[error("write queue closed")]
    QueueClosed,
}

/// Validate and normalize one ingress batch against its perspective's DAG.
///
/// All items must carry the batch perspective. Roots are only allowed for
/// unseen ids or on top of a tombstone, in which case the root is rewired
/// to reconnect through it; every other parent must resolve in the view of
/// the persisted tree plus the batch prefix. Batch order is preserved.
///
/// With `proceed_on_error`, a failing id is logged and its remaining items
/// skipped; other ids are unaffected. A perspective mismatch always fails
/// the whole batch.
pub(crate) fn prepare_batch(
    pe: &Perspective,
    items: Vec<Item>,
    existing: &dyn DagSource,
    v_size: usize,
    proceed_on_error: bool,
) -> Result<Vec<Item>, WriteError> {
    let mut out: Vec<Item> = Vec::with_capacity(items.len());
    let mut failed: HashSet<DocId> = HashSet::new();

    for mut item in items {
        if &item.h.pe != pe {
            return Err(WriteError::PerspectiveMismatch {
                expected: pe.to_string(),
                got: item.h.pe.to_string(),
            });
        }
        if failed.contains(&item.h.id) {
            continue;
        }
        let res = (|| -> Result<(), WriteError> {
            item.validate(v_size)?;
            // Foreign acknowledgement state refers to the sender's store.
            item.m.ack = false;

            let view = Overlay::new(existing, &out);
            if view.get_by_version(item.version()?)?.is_some() {
                return Ok(());
            }
            if item.is_root() {
                match view.iter_id_reverse(&item.h.id)?.into_iter().next() {
                    None => {}
                    Some(prev) if prev.h.d => {
                        item.h.pa = vec![prev.version()?.clone()];
                    }
                    Some(_) => return Err(WriteError::RootPreceded(item.h.id.clone())),
                }
            } else {
                for p in item.h.pa.clone() {
                    match view.get_by_version(&p)? {
                        Some(found) if found.h.id == item.h.id => {}
                        _ => return Err(WriteError::ParentNotFound(p)),
                    }
                }
            }
            Ok(())
        })();

        match res {
            Ok(()) => out.push(item),
            Err(e) if proceed_on_error => {
                warn!(id = %item.h.id, error = %e, "skipping id");
                failed.insert(item.h.id.clone());
            }
            Err(e) => return Err(e),
        }
    }
    Ok(out)
}

fn sibling_of(x: &Item, pa: Vec<Version>, body: bson::Document, conflicted: bool) -> Item {
    Item {
        h: Header {
            id: x.h.id.clone(),
            v: x.h.v.clone(),
            pa,
            pe: x.h.pe.clone(),
            d: x.h.d,
            c: conflicted,
            i: None,
        },
        m: Meta::default(),
        b: body,
    }
}

fn load_all(view: &dyn DagSource, versions: &[Version]) -> Result<Vec<Item>, WriteError> {
    versions
        .iter()
        .map(|v| {
            view.get_by_version(v)?
                .ok_or_else(|| WriteError::ParentNotFound(v.clone()))
        })
        .collect()
}

/// Reduce several ancestors to one virtual ancestor.
///
/// Ancestors are merged pairwise in canonical (version, perspective) order,
/// each partial result feeding the next merge; nested ancestor sets reduce
/// recursively.
pub(crate) fn reduce_lcas(
    mut items: Vec<Item>,
    view: &dyn DagSource,
    v_size: usize,
) -> Result<Item, WriteError> {
    if items.len() == 1 {
        return Ok(items.remove(0));
    }
    items.sort_by(|a, b| {
        (&a.h.v, a.h.pe.as_str()).cmp(&(&b.h.v, b.h.pe.as_str()))
    });
    let mut acc = items.remove(0);
    for next in items {
        let lcas = find_lcas(&acc, view, &next, None)?;
        let base = reduce_lcas(load_all(view, &lcas)?, view, v_size)?;
        acc = merge3(&acc, &next, &base, None)?;
    }
    Ok(acc)
}

/// Adopt one perspective's new items into the local history.
///
/// For each foreign item with no local counterpart this produces a local
/// node with the same version and parents; the body is the item's delta
/// against its own perspective's ancestor, replayed on top of the local
/// ancestor so fields private to the local history survive adoption. A
/// body that cannot be reconciled is adopted as-is, flagged as a conflict.
pub(crate) fn ensure_local(
    batch: &[Item],
    src: &dyn DagSource,
    local: &dyn DagSource,
    v_size: usize,
    proceed_on_error: bool,
) -> Result<Vec<Item>, WriteError> {
    let mut out: Vec<Item> = Vec::new();
    let mut failed: HashSet<DocId> = HashSet::new();
    for x in batch {
        if failed.contains(&x.h.id) {
            continue;
        }
        let res = (|| -> Result<Option<Item>, WriteError> {
            let xv = x.version()?.clone();
            let view = Overlay::new(local, &out);
            if view.get_by_version(&xv)?.is_some() {
                return Ok(None);
            }
            local_sibling(x, src, &view, v_size).map(Some)
        })();
        match res {
            Ok(Some(sib)) => out.push(sib),
            Ok(None) => {}
            Err(e) if proceed_on_error => {
                warn!(id = %x.h.id, error = %e, "skipping id");
                failed.insert(x.h.id.clone());
            }
            Err(e) => return Err(e),
        }
    }
    Ok(out)
}

fn local_sibling(
    x: &Item,
    src: &dyn DagSource,
    view: &Overlay<'_>,
    v_size: usize,
) -> Result<Item, WriteError> {
    let heads = view.heads(&x.h.id)?;
    if heads.is_empty() {
        return Ok(sibling_of(x, x.h.pa.clone(), x.b.clone(), false));
    }

    let clean: Vec<&Item> = heads.iter().filter(|it| !it.h.c && !it.h.d).collect();
    let head = match clean.len() {
        1 => clean[0],
        0 => heads
            .iter()
            .max_by_key(|it| it.h.i)
            .ok_or_else(|| WriteError::AmbiguousHeads(x.h.id.clone()))?,
        _ => return Err(WriteError::AmbiguousHeads(x.h.id.clone())),
    };

    let lcas = match find_lcas(x, src, head, Some(view)) {
        Ok(lcas) => lcas,
        Err(LcaError::NoLca) => {
            if head.h.d && x.is_root() {
                // Reconnect a fresh root through the local tombstone.
                return Ok(sibling_of(
                    x,
                    vec![head.version()?.clone()],
                    x.b.clone(),
                    false,
                ));
            }
            return Err(LcaError::NoLca.into());
        }
        Err(e) => return Err(e.into()),
    };

    let reduced = (|| -> Result<(Item, Item), WriteError> {
        let vlx = reduce_lcas(load_all(src, &lcas)?, src, v_size)?;
        let vly = reduce_lcas(load_all(view, &lcas)?, view, v_size)?;
        Ok((vlx, vly))
    })();

    let (vlx, vly) = match reduced {
        Ok(pair) => pair,
        Err(WriteError::Merge(conflict)) => {
            warn!(id = %x.h.id, attrs = ?conflict.attrs, "ancestor reduction conflict, adopting as-is");
            return Ok(sibling_of(x, x.h.pa.clone(), x.b.clone(), true));
        }
        Err(e) => return Err(e),
    };

    match merge_bodies(&vly.b, &x.b, &vly.b, &vlx.b) {
        Ok(body) => Ok(sibling_of(x, x.h.pa.clone(), body, false)),
        Err(conflict) => {
            warn!(id = %x.h.id, attrs = ?conflict.attrs, "adoption conflict");
            Ok(sibling_of(x, x.h.pa.clone(), x.b.clone(), true))
        }
    }
}

/// Reduce each id's new items to one clean head: the first new leaf (by
/// batch order) stays clean, every later clean leaf picks up the conflict
/// flag before it is persisted.
pub(crate) fn enforce_single_head(items: &mut [Item]) {
    let mut by_id: HashMap<DocId, Vec<usize>> = HashMap::new();
    for (ix, item) in items.iter().enumerate() {
        by_id.entry(item.h.id.clone()).or_default().push(ix);
    }
    for idxs in by_id.values() {
        let parents: HashSet<Version> = idxs
            .iter()
            .flat_map(|ix| items[*ix].h.pa.iter().cloned())
            .collect();
        let mut clean_seen = false;
        for ix in idxs {
            let item = &mut items[*ix];
            let is_leaf = item
                .h
                .v
                .as_ref()
                .map(|v| !parents.contains(v))
                .unwrap_or(false);
            if !is_leaf || item.h.c || item.h.d {
                continue;
            }
            if clean_seen {
                item.h.c = true;
            } else {
                clean_seen = true;
            }
        }
    }
}

/// Index of the single clean new leaf of one id within a batch, if any.
pub(crate) fn clean_leaf(items: &[Item], id: &DocId) -> Option<usize> {
    let parents: HashSet<&Version> = items
        .iter()
        .filter(|it| &it.h.id == id)
        .flat_map(|it| it.h.pa.iter())
        .collect();
    items.iter().position(|it| {
        &it.h.id == id
            && !it.h.c
            && !it.h.d
            && it.h.v.as_ref().map(|v| !parents.contains(v)).unwrap_or(false)
    })
}

/// Outcome of merging a new local head against the persisted one.
pub(crate) enum HeadMerge {
    /// One head is an ancestor of the other; nothing to do.
    FastForward,
    /// A genuine merge node, version already assigned.
    Merged(Item),
    /// Irreconcilable; the new head keeps the conflict flag.
    Conflict(Vec<String>),
}

pub(crate) fn merge_new_head(
    new_head: &Item,
    prev_head: &Item,
    view: &dyn DagSource,
    v_size: usize,
) -> Result<HeadMerge, WriteError> {
    let lcas = find_lcas(new_head, view, prev_head, None)?;
    if lcas
        .iter()
        .any(|v| Some(v) == prev_head.h.v.as_ref() || Some(v) == new_head.h.v.as_ref())
    {
        return Ok(HeadMerge::FastForward);
    }
    let base = match reduce_lcas(load_all(view, &lcas)?, view, v_size) {
        Ok(base) => base,
        Err(WriteError::Merge(c)) => return Ok(HeadMerge::Conflict(c.attrs)),
        Err(e) => return Err(e),
    };
    match merge3(new_head, prev_head, &base, None) {
        Ok(mut merged) => {
            let v = merged.content_version(v_size)?;
            merged.h.v = Some(v);
            Ok(HeadMerge::Merged(merged))
        }
        Err(c) => Ok(HeadMerge::Conflict(c.attrs)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use tempfile::TempDir;
    use vantage_model::TreeOptions;
    use vantage_tree::{Store, Tree};

    fn vers(b: u8) -> Version {
        Version::from_bytes(&[b; 6]).unwrap()
    }

    fn item(pe: &str, id: &[u8], v: u8, pa: &[u8], body: bson::Document) -> Item {
        Item::builder(DocId::new(id.to_vec()).unwrap(), Perspective::new(pe).unwrap())
            .version(vers(v))
            .parents(pa.iter().map(|p| vers(*p)).collect())
            .body(body)
            .build()
    }

    fn tree(dir: &TempDir, name: &str) -> Tree {
        let store = Store::open(dir.path().join(format!("{name}.db"))).unwrap();
        Tree::open(store, name, TreeOptions::default()).unwrap()
    }

    #[test]
    fn prepare_rejects_foreign_perspective() {
        let dir = TempDir::new().unwrap();
        let t = tree(&dir, "t");
        let pe = Perspective::new("p1").unwrap();
        let batch = vec![item("p2", b"d", 1, &[], doc! {})];
        assert!(matches!(
            prepare_batch(&pe, batch, &t, 6, false),
            Err(WriteError::PerspectiveMismatch { .. })
        ));
    }

    #[test]
    fn prepare_resolves_intra_batch_parents() {
        let dir = TempDir::new().unwrap();
        let t = tree(&dir, "t");
        let pe = Perspective::new("p").unwrap();
        let batch = vec![
            item("p", b"d", 1, &[], doc! {}),
            item("p", b"d", 2, &[1], doc! {}),
        ];
        assert!(prepare_batch(&pe, batch, &t, 6, false).is_ok());
    }

    #[test]
    fn prepare_rejects_missing_parent() {
        let dir = TempDir::new().unwrap();
        let t = tree(&dir, "t");
        let pe = Perspective::new("p").unwrap();
        let batch = vec![item("p", b"d", 2, &[9], doc! {})];
        assert!(matches!(
            prepare_batch(&pe, batch, &t, 6, false),
            Err(WriteError::ParentNotFound(_))
        ));
    }

    #[test]
    fn prepare_rejects_root_over_live_history() {
        let dir = TempDir::new().unwrap();
        let t = tree(&dir, "t");
        let pe = Perspective::new("p").unwrap();
        t.write(&item("p", b"d", 1, &[], doc! {})).unwrap();
        let batch = vec![item("p", b"d", 2, &[], doc! {})];
        assert!(matches!(
            prepare_batch(&pe, batch, &t, 6, false),
            Err(WriteError::RootPreceded(_))
        ));
    }

    #[test]
    fn prepare_reconnects_root_through_tombstone() {
        let dir = TempDir::new().unwrap();
        let t = tree(&dir, "t");
        let pe = Perspective::new("p").unwrap();
        t.write(&item("p", b"d", 1, &[], doc! {})).unwrap();
        let mut tomb = item("p", b"d", 2, &[1], doc! {});
        tomb.h.d = true;
        t.write(&tomb).unwrap();

        let batch = vec![item("p", b"d", 3, &[], doc! { "fresh": true })];
        let prepared = prepare_batch(&pe, batch, &t, 6, false).unwrap();
        assert_eq!(prepared[0].h.pa, vec![vers(2)]);
    }

    #[test]
    fn ensure_clones_unseen_history() {
        let dir = TempDir::new().unwrap();
        let remote = tree(&dir, "remote");
        let local = tree(&dir, "local");
        let a = remote.write(&item("r", b"d", 1, &[], doc! { "x": 1i32 })).unwrap();
        let b = remote.write(&item("r", b"d", 2, &[1], doc! { "x": 2i32 })).unwrap();

        let sibs = ensure_local(&[a, b], &remote, &local, 6, false).unwrap();
        assert_eq!(sibs.len(), 2);
        assert_eq!(sibs[0].h.v, Some(vers(1)));
        assert_eq!(sibs[1].h.v, Some(vers(2)));
        assert_eq!(sibs[1].h.pa, vec![vers(1)]);
    }

    #[test]
    fn ensure_skips_already_adopted() {
        let dir = TempDir::new().unwrap();
        let remote = tree(&dir, "remote");
        let local = tree(&dir, "local");
        let a = remote.write(&item("r", b"d", 1, &[], doc! {})).unwrap();
        local.write(&a).unwrap();

        let sibs = ensure_local(&[a], &remote, &local, 6, false).unwrap();
        assert!(sibs.is_empty());
    }

    #[test]
    fn ensure_keeps_local_private_fields() {
        let dir = TempDir::new().unwrap();
        let remote = tree(&dir, "remote");
        let local = tree(&dir, "local");

        // Shared root; the local copy carries an extra private field.
        let a = remote.write(&item("r", b"d", 1, &[], doc! { "x": 1i32 })).unwrap();
        local
            .write(&item("r", b"d", 1, &[], doc! { "x": 1i32, "private": "keep" }))
            .unwrap();

        // Remote edits x.
        let b = remote.write(&item("r", b"d", 2, &[1], doc! { "x": 9i32 })).unwrap();
        drop(a);

        let sibs = ensure_local(&[b], &remote, &local, 6, false).unwrap();
        assert_eq!(sibs.len(), 1);
        assert_eq!(sibs[0].b.get_i32("x").unwrap(), 9);
        assert_eq!(sibs[0].b.get_str("private").unwrap(), "keep");
    }

    #[test]
    fn enforce_flags_extra_leaves() {
        let mut items = vec![
            item("p", b"d", 1, &[], doc! {}),
            item("p", b"d", 2, &[1], doc! {}),
            item("p", b"d", 3, &[1], doc! {}),
        ];
        enforce_single_head(&mut items);
        assert!(!items[1].h.c);
        assert!(items[2].h.c);
        let leaf = clean_leaf(&items, &DocId::new(b"d".to_vec()).unwrap()).unwrap();
        assert_eq!(items[leaf].h.v, Some(vers(2)));
    }

    #[test]
    fn merge_new_head_fast_forwards() {
        let dir = TempDir::new().unwrap();
        let local = tree(&dir, "local");
        let a = local.write(&item("l", b"d", 1, &[], doc! {})).unwrap();
        let b = local.write(&item("l", b"d", 2, &[1], doc! {})).unwrap();
        match merge_new_head(&b, &a, &local, 6).unwrap() {
            HeadMerge::FastForward => {}
            _ => panic!("expected fast-forward"),
        }
    }

    #[test]
    fn merge_new_head_produces_deterministic_merge() {
        let dir = TempDir::new().unwrap();
        let local = tree(&dir, "local");
        local.write(&item("l", b"d", 1, &[], doc! { "a": 1i32 })).unwrap();
        let b = local
            .write(&item("l", b"d", 2, &[1], doc! { "a": 1i32, "x": 1i32 }))
            .unwrap();
        let c = local
            .write(&item("l", b"d", 3, &[1], doc! { "a": 1i32, "y": 1i32 }))
            .unwrap();

        let m1 = match merge_new_head(&c, &b, &local, 6).unwrap() {
            HeadMerge::Merged(m) => m,
            _ => panic!("expected merge"),
        };
        let m2 = match merge_new_head(&c, &b, &local, 6).unwrap() {
            HeadMerge::Merged(m) => m,
            _ => panic!("expected merge"),
        };
        assert_eq!(m1.h.v, m2.h.v);
        assert_eq!(m1.b.get_i32("x").unwrap(), 1);
        assert_eq!(m1.b.get_i32("y").unwrap(), 1);
    }

    #[test]
    fn merge_new_head_reports_conflicts() {
        let dir = TempDir::new().unwrap();
        let local = tree(&dir, "local");
        local.write(&item("l", b"d", 1, &[], doc! { "a": 1i32 })).unwrap();
        let b = local.write(&item("l", b"d", 2, &[1], doc! { "a": 2i32 })).unwrap();
        let c = local.write(&item("l", b"d", 3, &[1], doc! { "a": 3i32 })).unwrap();
        match merge_new_head(&c, &b, &local, 6).unwrap() {
            HeadMerge::Conflict(attrs) => assert_eq!(attrs, vec!["a".to_string()]),
            _ => panic!("expected conflict"),
        }
    }
}
