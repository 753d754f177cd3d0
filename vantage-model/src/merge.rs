//! Pure three-way merge over open document bodies
//!
//! Both sides diff against a common ancestor and the deltas are combined
//! attribute by attribute. With two ancestors (one per perspective) each side
//! diffs against its own, which keeps fields private to one perspective from
//! reading as deletions in the other.

use std::collections::{BTreeMap, BTreeSet};

use bson::{Bson, Document};
use thiserror::Error;

use crate::item::{Header, Item, Meta};

/// The attribute names a merge could not reconcile.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("merge conflict on attributes: {}", attrs.join(", "))]
pub struct MergeConflict {
    pub attrs: Vec<String>,
}

/// Per-attribute change of one side relative to its ancestor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Added,
    Changed,
    Deleted,
}

/// Keys excluded from diffing: the id envelope is not document content.
fn diffable(key: &str) -> bool {
    key != "_id"
}

/// Structural equality with document keys compared order-independently.
pub fn canonical_eq(a: &Bson, b: &Bson) -> bool {
    match (a, b) {
        (Bson::Document(da), Bson::Document(db)) => {
            if da.len() != db.len() {
                return false;
            }
            let keys: BTreeSet<&String> = da.keys().collect();
            if keys != db.keys().collect() {
                return false;
            }
            keys.into_iter().all(|k| match (da.get(k), db.get(k)) {
                (Some(va), Some(vb)) => canonical_eq(va, vb),
                _ => false,
            })
        }
        (Bson::Array(aa), Bson::Array(ab)) => {
            aa.len() == ab.len() && aa.iter().zip(ab).all(|(va, vb)| canonical_eq(va, vb))
        }
        _ => a == b,
    }
}

/// Compute one side's delta against its ancestor.
fn diff(ancestor: &Document, side: &Document) -> BTreeMap<String, Change> {
    let mut out = BTreeMap::new();
    for (key, value) in side {
        if !diffable(key) {
            continue;
        }
        match ancestor.get(key) {
            None => {
                out.insert(key.clone(), Change::Added);
            }
            Some(prev) if !canonical_eq(prev, value) => {
                out.insert(key.clone(), Change::Changed);
            }
            Some(_) => {}
        }
    }
    for key in ancestor.keys() {
        if diffable(key) && !side.contains_key(key) {
            out.insert(key.clone(), Change::Deleted);
        }
    }
    out
}

/// Merge two bodies given each side's ancestor.
///
/// The result takes `x`'s view and folds `y`'s delta into it; with a single
/// shared ancestor this is the symmetric three-way merge. Returns the
/// conflicting attribute names when the deltas cannot be reconciled.
pub fn merge_bodies(
    x: &Document,
    y: &Document,
    lca_x: &Document,
    lca_y: &Document,
) -> Result<Document, MergeConflict> {
    let dx = diff(lca_x, x);
    let dy = diff(lca_y, y);

    let mut merged = x.clone();
    let mut conflicts = BTreeSet::new();

    for (attr, change) in &dy {
        // diff only reports Added/Changed for attributes present in the side
        let Some(yv) = y.get(attr).or_else(|| lca_y.get(attr)) else {
            continue;
        };
        match change {
            Change::Added => {
                match x.get(attr) {
                    Some(xv) => {
                        if !canonical_eq(xv, yv) {
                            conflicts.insert(attr.clone());
                        }
                    }
                    None => {
                        if dx.get(attr) == Some(&Change::Deleted) {
                            conflicts.insert(attr.clone());
                        } else {
                            merged.insert(attr.clone(), yv.clone());
                        }
                    }
                }
            }
            Change::Changed => {
                match dx.get(attr) {
                    Some(Change::Changed) | Some(Change::Added) => match x.get(attr) {
                        Some(xv) if canonical_eq(xv, yv) => {}
                        _ => {
                            conflicts.insert(attr.clone());
                        }
                    },
                    Some(Change::Deleted) => {
                        conflicts.insert(attr.clone());
                    }
                    None => {
                        merged.insert(attr.clone(), yv.clone());
                    }
                }
            }
            Change::Deleted => match dx.get(attr) {
                Some(Change::Changed) | Some(Change::Added) => {
                    conflicts.insert(attr.clone());
                }
                Some(Change::Deleted) | None => {
                    merged.remove(attr);
                }
            },
        }
    }

    if conflicts.is_empty() {
        Ok(merged)
    } else {
        Err(MergeConflict {
            attrs: conflicts.into_iter().collect(),
        })
    }
}

/// Three-way merge of two items.
///
/// With one ancestor both sides diff against it; with two, each side diffs
/// against its own perspective's ancestor. The merged item carries a fresh
/// header: no version, both inputs as parents, `x`'s perspective, and a
/// tombstone only when both sides were deleted.
pub fn merge3(
    x: &Item,
    y: &Item,
    lca_x: &Item,
    lca_y: Option<&Item>,
) -> Result<Item, MergeConflict> {
    let lca_y = lca_y.unwrap_or(lca_x);
    let body = merge_bodies(&x.b, &y.b, &lca_x.b, &lca_y.b)?;

    let mut pa = Vec::new();
    match &x.h.v {
        Some(v) => pa.push(v.clone()),
        None => pa.extend(x.h.pa.iter().cloned()),
    }
    match &y.h.v {
        Some(v) => {
            if !pa.contains(v) {
                pa.push(v.clone());
            }
        }
        None => {
            for p in &y.h.pa {
                if !pa.contains(p) {
                    pa.push(p.clone());
                }
            }
        }
    }

    Ok(Item {
        h: Header {
            id: x.h.id.clone(),
            v: None,
            pa,
            pe: x.h.pe.clone(),
            d: x.h.d && y.h.d,
            c: false,
            i: None,
        },
        m: Meta::default(),
        b: body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{DocId, Perspective};
    use crate::version::Version;
    use bson::doc;

    fn item(v: u8, pa: &[u8], body: Document) -> Item {
        let parents = pa
            .iter()
            .map(|p| Version::from_bytes(&[*p; 6]).unwrap())
            .collect();
        Item::builder(DocId::new(b"d".to_vec()).unwrap(), Perspective::local())
            .version(Version::from_bytes(&[v; 6]).unwrap())
            .parents(parents)
            .body(body)
            .build()
    }

    #[test]
    fn reflexive() {
        let a = item(1, &[], doc! { "foo": "bar" });
        let m = merge3(&a, &a, &a, None).unwrap();
        assert_eq!(m.b, a.b);
        assert!(!m.h.d);
    }

    #[test]
    fn commutative_bodies() {
        let lca = item(1, &[], doc! { "a": 1i32, "b": 1i32 });
        let x = item(2, &[1], doc! { "a": 2i32, "b": 1i32 });
        let y = item(3, &[1], doc! { "a": 1i32, "b": 3i32, "c": 4i32 });
        let m1 = merge3(&x, &y, &lca, None).unwrap();
        let m2 = merge3(&y, &x, &lca, None).unwrap();
        assert!(canonical_eq(
            &Bson::Document(m1.b.clone()),
            &Bson::Document(m2.b.clone())
        ));
        assert_eq!(m1.b, doc! { "a": 2i32, "b": 3i32, "c": 4i32 });
    }

    #[test]
    fn delete_vs_unchanged_drops() {
        let lca = item(1, &[], doc! { "a": 1i32, "gone": true });
        let x = item(2, &[1], doc! { "a": 1i32 });
        let y = item(3, &[1], doc! { "a": 1i32, "gone": true });
        let m = merge3(&x, &y, &lca, None).unwrap();
        assert!(!m.b.contains_key("gone"));
    }

    #[test]
    fn delete_vs_change_conflicts() {
        let lca = item(1, &[], doc! { "a": 1i32 });
        let x = item(2, &[1], doc! {});
        let y = item(3, &[1], doc! { "a": 2i32 });
        let err = merge3(&x, &y, &lca, None).unwrap_err();
        assert_eq!(err.attrs, vec!["a".to_string()]);
    }

    #[test]
    fn both_changed_equal_copies() {
        let lca = item(1, &[], doc! { "a": 1i32 });
        let x = item(2, &[1], doc! { "a": 7i32 });
        let y = item(3, &[1], doc! { "a": 7i32 });
        let m = merge3(&x, &y, &lca, None).unwrap();
        assert_eq!(m.b, doc! { "a": 7i32 });
    }

    #[test]
    fn both_changed_unequal_conflicts() {
        let lca = item(1, &[], doc! { "a": 1i32 });
        let x = item(2, &[1], doc! { "a": 2i32 });
        let y = item(3, &[1], doc! { "a": 3i32 });
        assert!(merge3(&x, &y, &lca, None).is_err());
    }

    #[test]
    fn added_both_different_conflicts() {
        let lca = item(1, &[], doc! {});
        let x = item(2, &[1], doc! { "n": 1i32 });
        let y = item(3, &[1], doc! { "n": 2i32 });
        assert!(merge3(&x, &y, &lca, None).is_err());
    }

    #[test]
    fn id_envelope_excluded() {
        let lca = item(1, &[], doc! { "_id": "d", "a": 1i32 });
        let x = item(2, &[1], doc! { "_id": "d", "a": 2i32 });
        let y = item(3, &[1], doc! { "a": 1i32 });
        let m = merge3(&x, &y, &lca, None).unwrap();
        assert_eq!(m.b.get_str("_id").unwrap(), "d");
        assert_eq!(m.b.get_i32("a").unwrap(), 2);
    }

    #[test]
    fn perspective_bound_field_sets() {
        // The y perspective never carried "secret"; with per-side ancestors
        // its absence must not read as a deletion.
        let lca_x = item(1, &[], doc! { "a": 1i32, "secret": "s" });
        let lca_y = item(1, &[], doc! { "a": 1i32 });
        let x = item(2, &[1], doc! { "a": 1i32, "secret": "s" });
        let y = item(3, &[1], doc! { "a": 9i32 });
        let m = merge3(&x, &y, &lca_x, Some(&lca_y)).unwrap();
        assert_eq!(m.b.get_str("secret").unwrap(), "s");
        assert_eq!(m.b.get_i32("a").unwrap(), 9);
    }

    #[test]
    fn tombstone_only_when_both_deleted() {
        let lca = item(1, &[], doc! { "a": 1i32 });
        let mut x = item(2, &[1], doc! {});
        x.h.d = true;
        let y = item(3, &[1], doc! { "a": 1i32 });
        let m = merge3(&x, &y, &lca, None).unwrap();
        assert!(!m.h.d);

        let mut y2 = item(4, &[1], doc! {});
        y2.h.d = true;
        let m2 = merge3(&x, &y2, &lca, None).unwrap();
        assert!(m2.h.d);
    }

    #[test]
    fn merge_header_shape() {
        let lca = item(1, &[], doc! { "a": 1i32 });
        let x = item(2, &[1], doc! { "a": 1i32, "x": 1i32 });
        let y = item(3, &[1], doc! { "a": 1i32, "y": 1i32 });
        let m = merge3(&x, &y, &lca, None).unwrap();
        assert!(m.h.v.is_none());
        assert_eq!(
            m.h.pa,
            vec![x.h.v.clone().unwrap(), y.h.v.clone().unwrap()]
        );
        assert_eq!(m.h.pe, x.h.pe);
        assert!(!m.h.c);
    }
}
