//! Per-perspective append-only DAG store
//!
//! A `Tree` owns one name's slice of the shared store. Every node write is
//! one atomic group covering the data store, the insertion-order index, the
//! version index and the head index. Heads are maintained on the way in:
//! parents of a new node stop being heads, and when more than one clean head
//! remains for an id all but the oldest are flagged as conflicts.

use std::sync::{Arc, Mutex};

use redb::ReadableTable;
use tokio::sync::broadcast;
use tracing::debug;

use vantage_model::{DocId, Item, ItemError, Perspective, TreeOptions, Version};

use crate::keys::{self, KeyError};
use crate::store::{Store, StoreError, DATA_TABLE};

/// Notification of a committed write, for tailing readers.
#[derive(Debug, Clone)]
pub struct TreeEvent {
    /// Insertion index of the new item.
    pub i: u64,
}

/// Errors from tree operations.
#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    #[error("invalid item: {0}")]
    Item(#[from] ItemError),

    #[error("invalid key: {0}")]
    Key(#[from] KeyError),

    #[error("invalid options: {0}")]
    Config(#[from] vantage_model::ConfigError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("version {0} already exists with different content")]
    VersionExists(Version),

    #[error("item carries no insertion index")]
    MissingIndex,

    #[error("insertion index {0} exceeds the configured index width")]
    IndexExhausted(u64),

    #[error("corrupt tree entry: {0}")]
    Corrupt(String),
}

/// One perspective's durable DAG.
#[derive(Clone)]
pub struct Tree {
    name: String,
    store: Store,
    opts: TreeOptions,
    next_i: Arc<Mutex<u64>>,
    events: broadcast::Sender<TreeEvent>,
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree").field("name", &self.name).finish_non_exhaustive()
    }
}

struct HeadEntry {
    version: Version,
    conflict: bool,
    i: u64,
}

impl Tree {
    /// Open a tree by name, resuming the insertion counter from the store.
    pub fn open(store: Store, name: &str, opts: TreeOptions) -> Result<Self, TreeError> {
        opts.validate()?;
        // Name rules match key grammar rules; fail here, not on first write.
        keys::i_prefix(name)?;

        let next_i = last_insertion_index(&store, name)?.map(|i| i + 1).unwrap_or(1);
        let (events, _) = broadcast::channel(1024);
        Ok(Self {
            name: name.to_string(),
            store,
            opts,
            next_i: Arc::new(Mutex::new(next_i)),
            events,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> TreeOptions {
        self.opts
    }

    /// Subscribe to committed writes.
    pub fn subscribe(&self) -> broadcast::Receiver<TreeEvent> {
        self.events.subscribe()
    }

    /// Write one item atomically, assigning its insertion index.
    ///
    /// Re-writing an equivalent item is a no-op returning the stored copy;
    /// a different item under an existing version is an error.
    pub fn write(&self, item: &Item) -> Result<Item, TreeError> {
        item.validate(self.opts.v_size)?;
        let v = item.version()?.clone();
        let id = item.h.id.clone();

        let mut guard = self.next_i.lock().unwrap_or_else(|e| e.into_inner());
        let i = *guard;
        if self.opts.i_size < 8 && i >= 1u64 << (8 * self.opts.i_size) {
            return Err(TreeError::IndexExhausted(i));
        }

        let txn = self.store.begin_write()?;
        let stored = {
            let mut table = txn.open_table(DATA_TABLE)?;

            // Idempotence: same version, same node -> return the stored copy.
            let vkey = keys::v_key(&self.name, v.as_bytes())?;
            let existing_ds = table.get(vkey.as_slice())?.map(|g| g.value().to_vec());
            if let Some(ds) = existing_ds {
                let bytes = table
                    .get(ds.as_slice())?
                    .map(|g| g.value().to_vec())
                    .ok_or_else(|| TreeError::Corrupt("version index points nowhere".into()))?;
                let existing = Item::from_bytes(&bytes)?;
                if existing.equivalent(item) {
                    return Ok(existing);
                }
                return Err(TreeError::VersionExists(v));
            }

            let mut stored = item.clone();
            stored.h.i = Some(i);

            // Parents stop being heads. A superseded conflict head is
            // resolved by the child that covers it, so its flag clears.
            let mut old_heads = read_heads(&table, &self.name, &id)?;
            for p in &item.h.pa {
                let Some(h) = old_heads.iter().find(|h| &h.version == p) else {
                    continue;
                };
                let hk = keys::head_key(&self.name, id.as_bytes(), p.as_bytes())?;
                table.remove(hk.as_slice())?;
                if h.conflict {
                    if let Some(mut prev) = load_item(&table, &self.name, &id, h.i)? {
                        if prev.h.c {
                            prev.h.c = false;
                            let dk = keys::ds_key(&self.name, id.as_bytes(), h.i)?;
                            table.insert(dk.as_slice(), prev.to_bytes()?.as_slice())?;
                        }
                    }
                }
            }
            old_heads.retain(|h| !item.h.pa.contains(&h.version));

            // Single clean head per id: later clean heads pick up the
            // conflict flag, in both the head index and the stored item.
            let mut all_heads = Vec::with_capacity(old_heads.len() + 1);
            for h in old_heads {
                let deleted = load_item(&table, &self.name, &id, h.i)?
                    .map(|it| it.h.d)
                    .unwrap_or(false);
                all_heads.push((h, deleted));
            }
            all_heads.push((
                HeadEntry { version: v.clone(), conflict: stored.h.c, i },
                stored.h.d,
            ));
            all_heads.sort_by_key(|(h, _)| h.i);

            let mut clean_seen = false;
            for (h, deleted) in &mut all_heads {
                if h.conflict || *deleted {
                    continue;
                }
                if !clean_seen {
                    clean_seen = true;
                    continue;
                }
                h.conflict = true;
                if h.version == v {
                    stored.h.c = true;
                } else if let Some(mut other) = load_item(&table, &self.name, &id, h.i)? {
                    other.h.c = true;
                    let dk = keys::ds_key(&self.name, id.as_bytes(), h.i)?;
                    table.insert(dk.as_slice(), other.to_bytes()?.as_slice())?;
                }
            }

            for (h, _) in &all_heads {
                if h.version == v || h.conflict {
                    let hk = keys::head_key(&self.name, id.as_bytes(), h.version.as_bytes())?;
                    table.insert(hk.as_slice(), keys::head_value(h.conflict, h.i).as_slice())?;
                }
            }

            // The atomic group: data store, insertion index, version index.
            let dk = keys::ds_key(&self.name, id.as_bytes(), i)?;
            let hk = keys::head_key(&self.name, id.as_bytes(), v.as_bytes())?;
            let ik = keys::i_key(&self.name, i)?;
            table.insert(dk.as_slice(), stored.to_bytes()?.as_slice())?;
            table.insert(ik.as_slice(), hk.as_slice())?;
            table.insert(vkey.as_slice(), dk.as_slice())?;

            stored
        };
        txn.commit()?;
        *guard = i + 1;
        drop(guard);

        debug!(tree = %self.name, id = %stored.h.id, v = %v, i, "item written");
        let _ = self.events.send(TreeEvent { i });
        Ok(stored)
    }

    /// Look an item up by version.
    pub fn get_by_version(&self, v: &Version) -> Result<Option<Item>, TreeError> {
        let txn = self.store.begin_read()?;
        let table = txn.open_table(DATA_TABLE)?;
        let vkey = keys::v_key(&self.name, v.as_bytes())?;
        let Some(ds) = table.get(vkey.as_slice())?.map(|g| g.value().to_vec()) else {
            return Ok(None);
        };
        let bytes = table
            .get(ds.as_slice())?
            .map(|g| g.value().to_vec())
            .ok_or_else(|| TreeError::Corrupt("version index points nowhere".into()))?;
        Ok(Some(Item::from_bytes(&bytes)?))
    }

    /// Current heads of one id.
    pub fn heads(
        &self,
        id: &DocId,
        skip_deletes: bool,
        skip_conflicts: bool,
    ) -> Result<Vec<Item>, TreeError> {
        let txn = self.store.begin_read()?;
        let table = txn.open_table(DATA_TABLE)?;
        let entries = read_heads(&table, &self.name, id)?;
        let mut out = Vec::with_capacity(entries.len());
        for h in entries {
            if skip_conflicts && h.conflict {
                continue;
            }
            let item = load_item(&table, &self.name, id, h.i)?
                .ok_or_else(|| TreeError::Corrupt("head index points nowhere".into()))?;
            if skip_deletes && item.h.d {
                continue;
            }
            out.push(item);
        }
        out.sort_by_key(|it| it.h.i);
        Ok(out)
    }

    /// All items of one id in insertion order.
    pub fn iter_id(&self, id: &DocId, reverse: bool) -> Result<Vec<Item>, TreeError> {
        let txn = self.store.begin_read()?;
        let table = txn.open_table(DATA_TABLE)?;
        let prefix = keys::ds_prefix(&self.name, id.as_bytes())?;
        let mut out = Vec::new();
        for entry in range_prefix(&table, &prefix)? {
            let (_, value) = entry?;
            out.push(Item::from_bytes(&value.value())?);
        }
        if reverse {
            out.reverse();
        }
        Ok(out)
    }

    /// Items in insertion order, per id or tree-wide, bounded by versions.
    ///
    /// Bounds are inclusive unless excluded; a bound version that does not
    /// resolve leaves that side open.
    pub fn iter_insertion_order(
        &self,
        id: Option<&DocId>,
        first: Option<&Version>,
        last: Option<&Version>,
        exclude_first: bool,
        exclude_last: bool,
    ) -> Result<Vec<Item>, TreeError> {
        let first_i = match first {
            Some(v) => self.get_by_version(v)?.and_then(|it| it.h.i),
            None => None,
        };
        let last_i = match last {
            Some(v) => self.get_by_version(v)?.and_then(|it| it.h.i),
            None => None,
        };
        let mut items = match id {
            Some(id) => self.iter_id(id, false)?,
            None => self.batch(None, usize::MAX)?,
        };
        items.retain(|it| {
            let Some(i) = it.h.i else { return false };
            if let Some(f) = first_i {
                if i < f || (exclude_first && i == f) {
                    return false;
                }
            }
            if let Some(l) = last_i {
                if i > l || (exclude_last && i == l) {
                    return false;
                }
            }
            true
        });
        Ok(items)
    }

    /// Up to `limit` items in global insertion order, after index `after_i`.
    pub fn batch(&self, after_i: Option<u64>, limit: usize) -> Result<Vec<Item>, TreeError> {
        let txn = self.store.begin_read()?;
        let table = txn.open_table(DATA_TABLE)?;
        let prefix = keys::i_prefix(&self.name)?;
        let start = match after_i {
            Some(i) => keys::i_key(&self.name, i + 1)?,
            None => prefix.clone(),
        };
        let end = keys::prefix_successor(&prefix);
        let iter = match &end {
            Some(end) => table.range(start.as_slice()..end.as_slice())?,
            None => table.range(start.as_slice()..)?,
        };
        let mut out = Vec::new();
        for entry in iter {
            if out.len() >= limit {
                break;
            }
            let (key, value) = entry?;
            let i = insertion_index_of(key.value())?;
            let id = head_key_id(value.value())?;
            let item = load_item(&table, &self.name, &id, i)?
                .ok_or_else(|| TreeError::Corrupt("insertion index points nowhere".into()))?;
            out.push(item);
        }
        Ok(out)
    }

    /// Number of items in the tree.
    pub fn len(&self) -> Result<u64, TreeError> {
        let txn = self.store.begin_read()?;
        let table = txn.open_table(DATA_TABLE)?;
        let prefix = keys::i_prefix(&self.name)?;
        let mut count = 0u64;
        for entry in range_prefix(&table, &prefix)? {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    pub fn is_empty(&self) -> Result<bool, TreeError> {
        Ok(self.last_item()?.is_none())
    }

    /// The most recently inserted item.
    pub fn last_item(&self) -> Result<Option<Item>, TreeError> {
        self.last_matching(|_| true)
    }

    /// Version of the most recently inserted item.
    pub fn last_version(&self) -> Result<Option<Version>, TreeError> {
        Ok(self.last_item()?.and_then(|it| it.h.v))
    }

    /// The newest item whose provenance is the given perspective, used as a
    /// replication watermark.
    pub fn last_by_perspective(&self, pe: &Perspective) -> Result<Option<Item>, TreeError> {
        self.last_matching(|it| &it.h.pe == pe)
    }

    fn last_matching(&self, pred: impl Fn(&Item) -> bool) -> Result<Option<Item>, TreeError> {
        let txn = self.store.begin_read()?;
        let table = txn.open_table(DATA_TABLE)?;
        let prefix = keys::i_prefix(&self.name)?;
        for entry in range_prefix(&table, &prefix)?.rev() {
            let (key, value) = entry?;
            let i = insertion_index_of(key.value())?;
            let id = head_key_id(value.value())?;
            let item = load_item(&table, &self.name, &id, i)?
                .ok_or_else(|| TreeError::Corrupt("insertion index points nowhere".into()))?;
            if pred(&item) {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    /// Remove an item and its index entries. Only the stage tree does this,
    /// when promoting confirmed items to local.
    pub fn del(&self, item: &Item) -> Result<(), TreeError> {
        let i = item.h.i.ok_or(TreeError::MissingIndex)?;
        let v = item.version()?;
        let txn = self.store.begin_write()?;
        {
            let mut table = txn.open_table(DATA_TABLE)?;
            table.remove(keys::ds_key(&self.name, item.h.id.as_bytes(), i)?.as_slice())?;
            table.remove(keys::i_key(&self.name, i)?.as_slice())?;
            table.remove(keys::v_key(&self.name, v.as_bytes())?.as_slice())?;
            table.remove(
                keys::head_key(&self.name, item.h.id.as_bytes(), v.as_bytes())?.as_slice(),
            )?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Store arbitrary bytes under the tree's user range.
    pub fn put_user(&self, key: &[u8], value: &[u8]) -> Result<(), TreeError> {
        let uk = keys::us_key(&self.name, key)?;
        let txn = self.store.begin_write()?;
        {
            let mut table = txn.open_table(DATA_TABLE)?;
            table.insert(uk.as_slice(), value)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Read bytes from the tree's user range.
    pub fn get_user(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TreeError> {
        let uk = keys::us_key(&self.name, key)?;
        let txn = self.store.begin_read()?;
        let table = txn.open_table(DATA_TABLE)?;
        Ok(table.get(uk.as_slice())?.map(|g| g.value().to_vec()))
    }

    /// Rewrite one item's acknowledgement flag in place.
    pub fn set_ack(&self, v: &Version, ack: bool) -> Result<(), TreeError> {
        let txn = self.store.begin_write()?;
        {
            let mut table = txn.open_table(DATA_TABLE)?;
            let vkey = keys::v_key(&self.name, v.as_bytes())?;
            let Some(ds) = table.get(vkey.as_slice())?.map(|g| g.value().to_vec()) else {
                return Ok(());
            };
            let bytes = table
                .get(ds.as_slice())?
                .map(|g| g.value().to_vec())
                .ok_or_else(|| TreeError::Corrupt("version index points nowhere".into()))?;
            let mut item = Item::from_bytes(&bytes)?;
            if item.m.ack == ack {
                return Ok(());
            }
            item.m.ack = ack;
            table.insert(ds.as_slice(), item.to_bytes()?.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }
}

// --- key plumbing ---

fn range_prefix<'a, T>(
    table: &'a T,
    prefix: &[u8],
) -> Result<redb::Range<'a, &'static [u8], &'static [u8]>, TreeError>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    let start = prefix.to_vec();
    match keys::prefix_successor(prefix) {
        Some(end) => Ok(table.range(start.as_slice()..end.as_slice())?),
        None => Ok(table.range(start.as_slice()..)?),
    }
}

fn insertion_index_of(i_key: &[u8]) -> Result<u64, TreeError> {
    match keys::ParsedKey::parse(i_key)? {
        keys::ParsedKey::I { i, .. } => Ok(i),
        _ => Err(TreeError::Corrupt("expected insertion-order key".into())),
    }
}

fn head_key_id(head_key: &[u8]) -> Result<DocId, TreeError> {
    match keys::ParsedKey::parse(head_key)? {
        keys::ParsedKey::Head { id, .. } => Ok(DocId::new(id)?),
        _ => Err(TreeError::Corrupt("expected head key".into())),
    }
}

fn load_item<T>(table: &T, name: &str, id: &DocId, i: u64) -> Result<Option<Item>, TreeError>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    let dk = keys::ds_key(name, id.as_bytes(), i)?;
    match table.get(dk.as_slice())? {
        Some(g) => Ok(Some(Item::from_bytes(&g.value())?)),
        None => Ok(None),
    }
}

fn read_heads<T>(table: &T, name: &str, id: &DocId) -> Result<Vec<HeadEntry>, TreeError>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    let prefix = keys::head_prefix(name, id.as_bytes())?;
    let mut out = Vec::new();
    for entry in range_prefix(table, &prefix)? {
        let (key, value) = entry?;
        let version = match keys::ParsedKey::parse(key.value())? {
            keys::ParsedKey::Head { version, .. } => Version::from_bytes(&version)
                .map_err(|e| TreeError::Corrupt(e.to_string()))?,
            _ => return Err(TreeError::Corrupt("expected head key".into())),
        };
        let (conflict, i) = keys::parse_head_value(&value.value())?;
        out.push(HeadEntry { version, conflict, i });
    }
    Ok(out)
}

fn last_insertion_index(store: &Store, name: &str) -> Result<Option<u64>, TreeError> {
    let txn = store.begin_read()?;
    let table = txn.open_table(DATA_TABLE)?;
    let prefix = keys::i_prefix(name)?;
    let result = match range_prefix(&table, &prefix)?.next_back() {
        Some(entry) => {
            let (key, _) = entry?;
            Ok(Some(insertion_index_of(key.value())?))
        }
        None => Ok(None),
    };
    result
}
