//! Reader integration: ordering, connected projections, hooks, tailing.

use std::sync::Arc;

use async_trait::async_trait;
use bson::{doc, Document};
use tempfile::TempDir;

use vantage_engine::{Reader, ReaderError, ReaderItem};
use vantage_model::{
    DocId, Hook, HookError, Item, Perspective, ReaderOptions, TreeOptions, Version,
};
use vantage_tree::{Store, Tree};

fn vers(b: u8) -> Version {
    Version::from_bytes(&[b; 6]).unwrap()
}

fn item(v: u8, pa: &[u8], body: Document) -> Item {
    Item::builder(DocId::new(b"doc".to_vec()).unwrap(), Perspective::local())
        .version(vers(v))
        .parents(pa.iter().map(|p| vers(*p)).collect())
        .body(body)
        .build()
}

/// The shared scenario DAG:
///
/// ```text
/// A - B - C - D
///      \   \
///       E - F - G
/// ```
///
/// A, D, G carry `baz: qux`; C carries `baz: mux`.
fn scenario_tree(dir: &TempDir) -> Tree {
    let store = Store::open(dir.path().join("data.db")).unwrap();
    let tree = Tree::open(store, "_local", TreeOptions::default()).unwrap();
    tree.write(&item(1, &[], doc! { "name": "A", "baz": "qux" })).unwrap();
    tree.write(&item(2, &[1], doc! { "name": "B" })).unwrap();
    tree.write(&item(3, &[2], doc! { "name": "C", "baz": "mux" })).unwrap();
    tree.write(&item(4, &[3], doc! { "name": "D", "baz": "qux" })).unwrap();
    tree.write(&item(5, &[2], doc! { "name": "E" })).unwrap();
    tree.write(&item(6, &[5, 3], doc! { "name": "F" })).unwrap();
    tree.write(&item(7, &[6], doc! { "name": "G", "baz": "qux" })).unwrap();
    tree
}

/// Collect (name, parents) pairs from a finished reader.
async fn collect(mut reader: Reader) -> Vec<(String, Vec<Version>)> {
    let mut out = Vec::new();
    while let Some(next) = reader.next().await {
        let doc = match next.unwrap() {
            ReaderItem::Doc(doc) => doc,
            ReaderItem::Raw(bytes) => {
                Document::from_reader(&mut bytes.as_slice()).unwrap()
            }
        };
        let name = doc.get_document("b").unwrap().get_str("name").unwrap().to_string();
        let pa = doc
            .get_document("h")
            .unwrap()
            .get_array("pa")
            .unwrap()
            .iter()
            .map(|p| Version::from_base64(p.as_str().unwrap()).unwrap())
            .collect();
        out.push((name, pa));
    }
    out
}

#[tokio::test]
async fn emits_whole_dag_in_insertion_order() {
    let dir = TempDir::new().unwrap();
    let tree = scenario_tree(&dir);
    let reader = Reader::open(
        tree,
        ReaderOptions { offset: Some(vers(1)), ..ReaderOptions::default() },
    );
    let got = collect(reader).await;
    assert_eq!(
        got,
        vec![
            ("A".to_string(), vec![]),
            ("B".to_string(), vec![vers(1)]),
            ("C".to_string(), vec![vers(2)]),
            ("D".to_string(), vec![vers(3)]),
            ("E".to_string(), vec![vers(2)]),
            ("F".to_string(), vec![vers(5), vers(3)]),
            ("G".to_string(), vec![vers(6)]),
        ]
    );
}

#[tokio::test]
async fn filter_projects_connected_subgraph() {
    let dir = TempDir::new().unwrap();
    let tree = scenario_tree(&dir);
    let reader = Reader::open(
        tree,
        ReaderOptions {
            filter: Some(doc! { "baz": "qux" }),
            ..ReaderOptions::default()
        },
    );
    let got = collect(reader).await;
    assert_eq!(
        got,
        vec![
            ("A".to_string(), vec![]),
            ("D".to_string(), vec![vers(1)]),
            ("G".to_string(), vec![vers(1)]),
        ]
    );
}

#[tokio::test]
async fn filter_can_replant_a_root() {
    let dir = TempDir::new().unwrap();
    let tree = scenario_tree(&dir);
    let reader = Reader::open(
        tree,
        ReaderOptions {
            filter: Some(doc! { "baz": "mux" }),
            ..ReaderOptions::default()
        },
    );
    let got = collect(reader).await;
    assert_eq!(got, vec![("C".to_string(), vec![])]);
}

struct DropName(&'static str);

#[async_trait]
impl Hook for DropName {
    async fn run(&self, item: Item, _opts: &Document) -> Result<Option<Item>, HookError> {
        if item.b.get_str("name") == Ok(self.0) {
            Ok(None)
        } else {
            Ok(Some(item))
        }
    }
}

#[tokio::test]
async fn hook_filtering_projects_surrogate_parents() {
    let dir = TempDir::new().unwrap();
    let tree = scenario_tree(&dir);
    let reader = Reader::open(
        tree,
        ReaderOptions {
            offset: Some(vers(5)),
            hooks: vec![Arc::new(DropName("F"))],
            ..ReaderOptions::default()
        },
    );
    let got = collect(reader).await;
    assert_eq!(
        got,
        vec![
            ("E".to_string(), vec![vers(2)]),
            ("G".to_string(), vec![vers(5), vers(3)]),
        ]
    );
}

struct Redact(&'static str);

#[async_trait]
impl Hook for Redact {
    async fn run(&self, mut item: Item, _opts: &Document) -> Result<Option<Item>, HookError> {
        item.b.remove(self.0);
        Ok(Some(item))
    }
}

#[tokio::test]
async fn hooks_transform_emitted_bodies() {
    let dir = TempDir::new().unwrap();
    let tree = scenario_tree(&dir);
    let mut reader = Reader::open(
        tree,
        ReaderOptions {
            hooks: vec![Arc::new(Redact("baz"))],
            ..ReaderOptions::default()
        },
    );
    while let Some(next) = reader.next().await {
        let ReaderItem::Doc(doc) = next.unwrap() else { panic!("expected doc") };
        assert!(!doc.get_document("b").unwrap().contains_key("baz"));
    }
}

#[tokio::test]
async fn emitted_items_are_stripped() {
    let dir = TempDir::new().unwrap();
    let tree = scenario_tree(&dir);
    let mut reader = Reader::open(tree, ReaderOptions::default());
    let first = reader.next().await.unwrap().unwrap();
    let ReaderItem::Doc(doc) = first else { panic!("expected doc") };
    let h = doc.get_document("h").unwrap();
    assert!(!h.contains_key("pe"));
    assert!(!h.contains_key("i"));
    assert!(!doc.contains_key("m"));
    reader.close();
}

#[tokio::test]
async fn missing_offset_fails() {
    let dir = TempDir::new().unwrap();
    let tree = scenario_tree(&dir);
    let mut reader = Reader::open(
        tree,
        ReaderOptions { offset: Some(vers(99)), ..ReaderOptions::default() },
    );
    match reader.next().await.unwrap() {
        Err(ReaderError::OffsetNotFound(v)) => assert_eq!(v, vers(99)),
        other => panic!("expected OffsetNotFound, got {other:?}"),
    }
    assert!(reader.next().await.is_none());
}

#[tokio::test]
async fn follow_mode_tails_new_writes() {
    let dir = TempDir::new().unwrap();
    let tree = scenario_tree(&dir);
    let mut reader = Reader::open(
        tree.clone(),
        ReaderOptions { follow: true, ..ReaderOptions::default() },
    );
    for _ in 0..7 {
        reader.next().await.unwrap().unwrap();
    }

    tree.write(&item(8, &[7], doc! { "name": "H" })).unwrap();
    let next = reader.next().await.unwrap().unwrap();
    let ReaderItem::Doc(doc) = next else { panic!("expected doc") };
    assert_eq!(doc.get_document("b").unwrap().get_str("name").unwrap(), "H");

    // Close is idempotent and ends the stream.
    reader.close();
    reader.close();
    assert!(reader.next().await.is_none());
}

#[tokio::test]
async fn raw_mode_round_trips() {
    let dir = TempDir::new().unwrap();
    let tree = scenario_tree(&dir);
    let mut reader = Reader::open(
        tree,
        ReaderOptions { raw: true, ..ReaderOptions::default() },
    );
    let mut count = 0;
    while let Some(next) = reader.next().await {
        let ReaderItem::Raw(bytes) = next.unwrap() else { panic!("expected raw") };
        let doc = Document::from_reader(&mut bytes.as_slice()).unwrap();
        let pe = Perspective::new("peer-x").unwrap();
        let back = Item::from_doc_with_perspective(&doc, Some(&pe)).unwrap();
        assert_eq!(back.h.pe, pe);
        count += 1;
    }
    assert_eq!(count, 7);
}
