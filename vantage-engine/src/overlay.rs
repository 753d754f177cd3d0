//! Read-only DAG views
//!
//! The writer pipeline resolves parents and walks ancestry against a view
//! that may span a persisted tree, a second tree layered on top (stage over
//! local), and an in-flight batch that is not persisted yet. `DagSource`
//! is the common query surface; `Overlay` and `Chain` compose views without
//! copying anything into the store.

use vantage_model::{DocId, Item, Version};
use vantage_tree::{Tree, TreeError};

/// Query surface for one id-partitioned DAG view.
pub trait DagSource {
    /// Look an item up by version.
    fn get_by_version(&self, v: &Version) -> Result<Option<Item>, TreeError>;

    /// All items of one id, newest first.
    fn iter_id_reverse(&self, id: &DocId) -> Result<Vec<Item>, TreeError>;

    /// Current heads of one id (conflicted and deleted included).
    fn heads(&self, id: &DocId) -> Result<Vec<Item>, TreeError>;
}

impl DagSource for Tree {
    fn get_by_version(&self, v: &Version) -> Result<Option<Item>, TreeError> {
        Tree::get_by_version(self, v)
    }

    fn iter_id_reverse(&self, id: &DocId) -> Result<Vec<Item>, TreeError> {
        self.iter_id(id, true)
    }

    fn heads(&self, id: &DocId) -> Result<Vec<Item>, TreeError> {
        Tree::heads(self, id, false, false)
    }
}

/// A persisted view with an in-flight batch on top.
///
/// Batch items read as newer than everything persisted; parent lookups
/// resolve within the batch so intra-batch ancestry works before anything
/// is written.
pub struct Overlay<'a> {
    base: &'a dyn DagSource,
    batch: &'a [Item],
}

impl<'a> Overlay<'a> {
    pub fn new(base: &'a dyn DagSource, batch: &'a [Item]) -> Self {
        Self { base, batch }
    }
}

impl DagSource for Overlay<'_> {
    fn get_by_version(&self, v: &Version) -> Result<Option<Item>, TreeError> {
        for item in self.batch.iter().rev() {
            if item.h.v.as_ref() == Some(v) {
                return Ok(Some(item.clone()));
            }
        }
        self.base.get_by_version(v)
    }

    fn iter_id_reverse(&self, id: &DocId) -> Result<Vec<Item>, TreeError> {
        let mut out: Vec<Item> = self
            .batch
            .iter()
            .rev()
            .filter(|it| &it.h.id == id)
            .cloned()
            .collect();
        out.extend(self.base.iter_id_reverse(id)?);
        Ok(out)
    }

    fn heads(&self, id: &DocId) -> Result<Vec<Item>, TreeError> {
        let batch: Vec<&Item> = self.batch.iter().filter(|it| &it.h.id == id).collect();
        let mut parents: Vec<Version> = Vec::new();
        for it in &batch {
            parents.extend(it.h.pa.iter().cloned());
        }

        let mut out: Vec<Item> = Vec::new();
        for it in self.base.heads(id)? {
            if let Some(v) = &it.h.v {
                if !parents.contains(v) && !batch.iter().any(|b| b.h.v.as_ref() == Some(v)) {
                    out.push(it);
                }
            }
        }
        for it in batch {
            if let Some(v) = &it.h.v {
                if !parents.contains(v) {
                    out.push(it.clone());
                }
            }
        }
        Ok(out)
    }
}

/// Two trees read as one DAG, `upper` strictly newer than `lower`.
///
/// Used to read staged items and the local tree as a single local history.
pub struct Chain<'a> {
    upper: &'a Tree,
    lower: &'a Tree,
}

impl<'a> Chain<'a> {
    pub fn new(upper: &'a Tree, lower: &'a Tree) -> Self {
        Self { upper, lower }
    }
}

impl DagSource for Chain<'_> {
    fn get_by_version(&self, v: &Version) -> Result<Option<Item>, TreeError> {
        if let Some(item) = Tree::get_by_version(self.upper, v)? {
            return Ok(Some(item));
        }
        Tree::get_by_version(self.lower, v)
    }

    fn iter_id_reverse(&self, id: &DocId) -> Result<Vec<Item>, TreeError> {
        let mut out = self.upper.iter_id(id, true)?;
        out.extend(self.lower.iter_id(id, true)?);
        Ok(out)
    }

    fn heads(&self, id: &DocId) -> Result<Vec<Item>, TreeError> {
        let upper_items = self.upper.iter_id(id, false)?;
        let mut parents: Vec<Version> = Vec::new();
        for it in &upper_items {
            parents.extend(it.h.pa.iter().cloned());
        }

        let mut out: Vec<Item> = Vec::new();
        for it in Tree::heads(self.lower, id, false, false)? {
            if let Some(v) = &it.h.v {
                if !parents.contains(v) {
                    out.push(it);
                }
            }
        }
        out.extend(Tree::heads(self.upper, id, false, false)?);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use tempfile::TempDir;
    use vantage_model::{Perspective, TreeOptions};
    use vantage_tree::Store;

    fn vers(b: u8) -> Version {
        Version::from_bytes(&[b; 6]).unwrap()
    }

    fn item(id: &[u8], v: u8, pa: &[u8]) -> Item {
        Item::builder(DocId::new(id.to_vec()).unwrap(), Perspective::new("p").unwrap())
            .version(vers(v))
            .parents(pa.iter().map(|p| vers(*p)).collect())
            .body(doc! { "v": v as i32 })
            .build()
    }

    #[test]
    fn overlay_resolves_batch_parents() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("d.db")).unwrap();
        let tree = Tree::open(store, "t", TreeOptions::default()).unwrap();
        tree.write(&item(b"d", 1, &[])).unwrap();

        let batch = vec![item(b"d", 2, &[1]), item(b"d", 3, &[2])];
        let view = Overlay::new(&tree, &batch);

        assert!(view.get_by_version(&vers(1)).unwrap().is_some());
        assert!(view.get_by_version(&vers(3)).unwrap().is_some());
        assert!(view.get_by_version(&vers(9)).unwrap().is_none());

        let id = DocId::new(b"d".to_vec()).unwrap();
        let heads = view.heads(&id).unwrap();
        assert_eq!(heads.len(), 1);
        assert_eq!(heads[0].h.v, Some(vers(3)));

        let rev = view.iter_id_reverse(&id).unwrap();
        assert_eq!(
            rev.iter().map(|it| it.h.v.clone().unwrap()).collect::<Vec<_>>(),
            vec![vers(3), vers(2), vers(1)]
        );
    }

    #[test]
    fn chain_reads_upper_as_newer() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("d.db")).unwrap();
        let lower = Tree::open(store.clone(), "low", TreeOptions::default()).unwrap();
        let upper = Tree::open(store, "up", TreeOptions::default()).unwrap();

        lower.write(&item(b"d", 1, &[])).unwrap();
        upper.write(&item(b"d", 2, &[1])).unwrap();

        let chain = Chain::new(&upper, &lower);
        let id = DocId::new(b"d".to_vec()).unwrap();

        let heads = chain.heads(&id).unwrap();
        assert_eq!(heads.len(), 1);
        assert_eq!(heads[0].h.v, Some(vers(2)));

        let rev = chain.iter_id_reverse(&id).unwrap();
        assert_eq!(rev[0].h.v, Some(vers(2)));
        assert_eq!(rev[1].h.v, Some(vers(1)));
    }
}
