//! Merge-tree façade
//!
//! Owns one tree per declared remote perspective, the local tree, and a
//! stage tree for merges awaiting confirmation. Remote items land in their
//! perspective's tree, are adopted into the local history (via the stage
//! when a merge handler is configured), and winning heads are synchronized
//! into the companion plain store.
//!
//! Ingress is a bounded FIFO: one batch is processed to completion before
//! the next starts, and a full queue backs callers off instead of
//! rejecting them.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::sleep;
use tracing::{debug, warn};

use vantage_model::{
    DocId, Item, ItemBuilder, Meta, MergeTreeOptions, Perspective, ReaderOptions, Version,
};
use vantage_tree::{Store, Tree, TreeError};

use crate::oplog::OplogEntry;
use crate::overlay::{Chain, DagSource, Overlay};
use crate::reader::Reader;
use crate::writer::{self, HeadMerge, WriteError};

const MERGE_CURSOR_KEY: &[u8] = b"merge_cursor";
const SCAN_BATCH: usize = 256;

pub(crate) enum Ingress {
    Remote { pe: Perspective, item: Item },
    Local(Item),
    Oplog(OplogEntry),
}

/// Clonable handle feeding one kind of item into the ingress queue.
///
/// A full queue is retried with backoff until space frees up.
#[derive(Clone)]
pub struct WriteSink {
    pe: Option<Perspective>,
    tx: mpsc::Sender<Ingress>,
    retry: Duration,
}

impl WriteSink {
    /// Queue one item. Remote sinks check the item's perspective; the local
    /// sink rejects preset parents, which the engine chooses itself.
    pub async fn write(&self, item: Item) -> Result<(), WriteError> {
        let msg = match &self.pe {
            Some(pe) => {
                if &item.h.pe != pe {
                    return Err(WriteError::PerspectiveMismatch {
                        expected: pe.to_string(),
                        got: item.h.pe.to_string(),
                    });
                }
                Ingress::Remote { pe: pe.clone(), item }
            }
            None => {
                if !item.h.pa.is_empty() {
                    return Err(WriteError::ParentsPreset);
                }
                Ingress::Local(item)
            }
        };
        send_with_backoff(&self.tx, msg, self.retry).await
    }
}

/// Clonable handle feeding oplog entries into the ingress queue.
#[derive(Clone)]
pub struct OplogSink {
    tx: mpsc::Sender<Ingress>,
    retry: Duration,
}

impl OplogSink {
    pub async fn write(&self, entry: OplogEntry) -> Result<(), WriteError> {
        send_with_backoff(&self.tx, Ingress::Oplog(entry), self.retry).await
    }
}

async fn send_with_backoff(
    tx: &mpsc::Sender<Ingress>,
    msg: Ingress,
    retry: Duration,
) -> Result<(), WriteError> {
    let mut msg = msg;
    loop {
        match tx.try_send(msg) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Full(m)) => {
                warn!(backoff_ms = retry.as_millis() as u64, "ingress queue full, backing off");
                msg = m;
                sleep(retry).await;
            }
            Err(TrySendError::Closed(_)) => return Err(WriteError::QueueClosed),
        }
    }
}

/// The replication engine over one shared store.
pub struct MergeTree {
    pub(crate) opts: MergeTreeOptions,
    pub(crate) local_pe: Perspective,
    pub(crate) local: Tree,
    pub(crate) stage: Tree,
    pub(crate) perspectives: BTreeMap<String, Tree>,
    ingress_tx: Option<mpsc::Sender<Ingress>>,
    ingress_rx: mpsc::Receiver<Ingress>,
}

impl std::fmt::Debug for MergeTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeTree")
            .field("local", &self.opts.local)
            .field("stage", &self.opts.stage)
            .field("perspectives", &self.opts.perspectives)
            .finish_non_exhaustive()
    }
}

impl MergeTree {
    /// Open all trees over the shared store.
    pub fn open(store: Store, opts: MergeTreeOptions) -> Result<Self, WriteError> {
        opts.validate()?;
        let topts = opts.tree_options();
        let local = Tree::open(store.clone(), &opts.local, topts)?;
        let stage = Tree::open(store.clone(), &opts.stage, topts)?;
        let mut perspectives = BTreeMap::new();
        for pe in &opts.perspectives {
            perspectives.insert(pe.clone(), Tree::open(store.clone(), pe, topts)?);
        }
        let local_pe = Perspective::new(opts.local.clone())?;
        let (ingress_tx, ingress_rx) = mpsc::channel(opts.queue_limit);
        Ok(Self {
            opts,
            local_pe,
            local,
            stage,
            perspectives,
            ingress_tx: Some(ingress_tx),
            ingress_rx,
        })
    }

    /// Sink for one declared remote perspective.
    pub fn remote_write_sink(&self, pe: &str) -> Result<WriteSink, WriteError> {
        if pe == self.opts.local || pe == self.opts.stage {
            return Err(WriteError::ReservedPerspective(pe.to_string()));
        }
        if !self.perspectives.contains_key(pe) {
            return Err(WriteError::UnknownPerspective(pe.to_string()));
        }
        Ok(WriteSink {
            pe: Some(Perspective::new(pe)?),
            tx: self.ingress().ok_or(WriteError::QueueClosed)?,
            retry: self.opts.queue_limit_retry_timeout,
        })
    }

    /// Sink for the owning application's writes and merge confirmations.
    pub fn local_write_sink(&self) -> Result<WriteSink, WriteError> {
        Ok(WriteSink {
            pe: None,
            tx: self.ingress().ok_or(WriteError::QueueClosed)?,
            retry: self.opts.queue_limit_retry_timeout,
        })
    }

    /// Sink for the companion store's change log.
    pub fn oplog_sink(&self) -> Result<OplogSink, WriteError> {
        Ok(OplogSink {
            tx: self.ingress().ok_or(WriteError::QueueClosed)?,
            retry: self.opts.queue_limit_retry_timeout,
        })
    }

    fn ingress(&self) -> Option<mpsc::Sender<Ingress>> {
        self.ingress_tx.clone()
    }

    /// Stop handing out sinks; `run` ends once existing sinks are dropped
    /// and the queue drains.
    pub fn close_ingress(&mut self) {
        self.ingress_tx = None;
    }

    /// Drain and process everything currently queued.
    pub async fn process_pending(&mut self) -> Result<usize, WriteError> {
        let mut drained = VecDeque::new();
        while let Ok(msg) = self.ingress_rx.try_recv() {
            drained.push_back(msg);
        }
        let n = drained.len();
        self.process_queue(drained).await?;
        Ok(n)
    }

    /// Process ingress until all sinks are gone (see [`Self::close_ingress`]).
    pub async fn run(&mut self) -> Result<(), WriteError> {
        loop {
            let msg = match self.opts.auto_process_interval {
                Some(period) => {
                    match tokio::time::timeout(period, self.ingress_rx.recv()).await {
                        Ok(msg) => msg,
                        Err(_) => {
                            self.process_pending().await?;
                            continue;
                        }
                    }
                }
                None => self.ingress_rx.recv().await,
            };
            let Some(msg) = msg else { break };
            let mut q = VecDeque::new();
            q.push_back(msg);
            while let Ok(more) = self.ingress_rx.try_recv() {
                q.push_back(more);
            }
            self.process_queue(q).await?;
        }
        Ok(())
    }

    /// One batch to completion before the next; consecutive items of one
    /// perspective form a batch.
    async fn process_queue(&mut self, mut q: VecDeque<Ingress>) -> Result<(), WriteError> {
        while let Some(msg) = q.pop_front() {
            let result = match msg {
                Ingress::Remote { pe, item } => {
                    let mut items = vec![item];
                    while matches!(q.front(), Some(Ingress::Remote { pe: p, .. }) if p == &pe) {
                        if let Some(Ingress::Remote { item, .. }) = q.pop_front() {
                            items.push(item);
                        }
                    }
                    self.write_remote(pe.as_str(), items).await
                }
                Ingress::Local(item) => self.write_local(item).await.map(|_| ()),
                Ingress::Oplog(entry) => self
                    .apply_oplog(entry)
                    .await
                    .map(|_| ())
                    .map_err(WriteError::from),
            };
            if let Err(e) = result {
                if self.opts.proceed_on_error {
                    warn!(error = %e, "ingress batch failed, proceeding");
                } else {
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Ingest a batch for one remote perspective and adopt it locally.
    pub async fn write_remote(&mut self, pe: &str, items: Vec<Item>) -> Result<(), WriteError> {
        let tree = self
            .perspectives
            .get(pe)
            .cloned()
            .ok_or_else(|| WriteError::UnknownPerspective(pe.to_string()))?;
        let pe_label = Perspective::new(pe)?;

        let prepared = writer::prepare_batch(
            &pe_label,
            items,
            &tree,
            self.opts.v_size,
            self.opts.proceed_on_error,
        )?;
        for item in &prepared {
            tree.write(item)?;
        }
        self.merge_with_local(pe).await
    }

    /// Drain new items from one perspective's tree into the local history,
    /// via the stage when a merge handler is configured.
    pub async fn merge_with_local(&mut self, pe: &str) -> Result<(), WriteError> {
        let tree = self
            .perspectives
            .get(pe)
            .cloned()
            .ok_or_else(|| WriteError::UnknownPerspective(pe.to_string()))?;
        loop {
            let cursor = read_cursor(&tree)?;
            let batch = tree.batch(cursor, SCAN_BATCH)?;
            let Some(last) = batch.last().and_then(|it| it.h.i) else { break };
            self.adopt_batch(&tree, batch).await?;
            write_cursor(&tree, last)?;
        }
        Ok(())
    }

    /// Adopt one batch of foreign items, in their insertion order: ensure
    /// local counterparts, reduce each id to one clean head, merge against
    /// the previous local heads, persist.
    async fn adopt_batch(&mut self, src_tree: &Tree, batch: Vec<Item>) -> Result<(), WriteError> {
        let ids: Vec<DocId> = {
            let mut seen = Vec::new();
            for it in &batch {
                if !seen.contains(&it.h.id) {
                    seen.push(it.h.id.clone());
                }
            }
            seen
        };

        let (siblings, merges, prev_heads) = {
            let chain = Chain::new(&self.stage, &self.local);

            let mut prev_heads: Vec<(DocId, Option<Item>)> = Vec::new();
            for id in &ids {
                let heads = chain.heads(id)?;
                let clean: Vec<&Item> = heads.iter().filter(|it| !it.h.c && !it.h.d).collect();
                let prev = match clean.len() {
                    0 => None,
                    1 => Some(clean[0].clone()),
                    _ => {
                        if self.opts.proceed_on_error {
                            warn!(id = %id, "multiple clean heads, skipping id");
                            continue;
                        }
                        return Err(WriteError::AmbiguousHeads(id.clone()));
                    }
                };
                prev_heads.push((id.clone(), prev));
            }

            let mut siblings = writer::ensure_local(
                &batch,
                src_tree,
                &chain,
                self.opts.v_size,
                self.opts.proceed_on_error,
            )?;
            if let Some(t) = &self.opts.transform {
                siblings = siblings.into_iter().map(|it| t.apply(it)).collect();
            }
            writer::enforce_single_head(&mut siblings);

            // Head merging, one merge at most per id.
            let mut merges: Vec<(DocId, Item)> = Vec::new();
            let mut conflicted: Vec<usize> = Vec::new();
            for (id, prev) in &prev_heads {
                let Some(prev) = prev else { continue };
                let Some(ix) = writer::clean_leaf(&siblings, id) else { continue };
                let new_head = &siblings[ix];
                if new_head.h.v == prev.h.v || prev.h.d {
                    continue;
                }
                let view = Overlay::new(&chain, &siblings);
                match writer::merge_new_head(new_head, prev, &view, self.opts.v_size)? {
                    HeadMerge::FastForward => {}
                    HeadMerge::Merged(m) => merges.push((id.clone(), m)),
                    HeadMerge::Conflict(attrs) => {
                        warn!(id = %id, attrs = ?attrs, "head merge conflict");
                        conflicted.push(ix);
                    }
                }
            }
            for ix in conflicted {
                siblings[ix].h.c = true;
            }
            (siblings, merges, prev_heads)
        };

        if siblings.is_empty() && merges.is_empty() {
            return Ok(());
        }

        if let Some(handler) = self.opts.merge_handler.clone() {
            let mut staged: Vec<Item> = Vec::new();
            for sib in &siblings {
                staged.push(self.stage.write(sib)?);
            }
            // The handler is offered every clean new stage head: the merge
            // when one was generated, the fast-forwarded leaf otherwise.
            // Conflicted heads are staged without a handler call.
            for (id, prev) in &prev_heads {
                let merged = merges.iter().find(|(mid, _)| mid == id);
                let announced = match merged {
                    Some((_, m)) => Some(self.stage.write(m)?),
                    None => writer::clean_leaf(&siblings, id)
                        .and_then(|ix| staged.get(ix).cloned()),
                };
                if let Some(new_head) = announced {
                    handler.merge(&new_head, prev.as_ref()).await?;
                }
            }
        } else {
            for sib in &siblings {
                self.local.write(sib)?;
            }
            for (_, m) in &merges {
                self.local.write(m)?;
            }
            for id in &ids {
                self.sync_head(id).await?;
            }
        }
        debug!(ids = ids.len(), "batch adopted");
        Ok(())
    }

    /// Write back the winning head for one id into the plain store and
    /// acknowledge it.
    async fn sync_head(&self, id: &DocId) -> Result<(), WriteError> {
        let Some(ds) = &self.opts.doc_store else { return Ok(()) };
        let heads = self.local.heads(id, false, true)?;
        let Some(head) = heads.last() else { return Ok(()) };
        if head.m.ack {
            return Ok(());
        }
        if head.h.d {
            ds.remove(id.as_bytes()).await?;
        } else {
            ds.upsert(id.as_bytes(), &head.b).await?;
        }
        self.local.set_ack(head.version()?, true)?;
        Ok(())
    }

    /// Apply one local write: a confirmation of a staged merge, an
    /// idempotent replay, or a fresh head whose parents the engine picks.
    pub async fn write_local(&mut self, item: Item) -> Result<Option<Version>, WriteError> {
        if !item.h.pa.is_empty() {
            return Err(WriteError::ParentsPreset);
        }
        if let Some(v) = &item.h.v {
            if let Some(staged) = self.stage.get_by_version(v)? {
                let confirmed = self.confirm(staged).await?;
                return Ok(Some(confirmed));
            }
            if self.local.get_by_version(v)?.is_some() {
                return Ok(Some(v.clone()));
            }
        }
        self.fresh_local_write(item.h.id.clone(), item.h.v.clone(), item.b, item.h.d, item.m)
            .await
    }

    pub(crate) async fn fresh_local_write(
        &mut self,
        id: DocId,
        v: Option<Version>,
        body: bson::Document,
        deleted: bool,
        meta: Meta,
    ) -> Result<Option<Version>, WriteError> {
        let heads = self.local.heads(&id, false, true)?;
        let pa = match heads.len() {
            0 => Vec::new(),
            1 => vec![heads[0].version()?.clone()],
            _ => return Err(WriteError::AmbiguousHeads(id)),
        };
        let builder = ItemBuilder::new(id, self.local_pe.clone())
            .parents(pa)
            .deleted(deleted)
            .meta(meta)
            .body(body);
        let item = match v {
            Some(v) => builder.version(v).build(),
            None => builder.build_hashed(self.opts.v_size)?,
        };
        let stored = self.local.write(&item)?;
        Ok(stored.h.v)
    }

    /// Promote the staged prefix for one id, up to and including the
    /// confirmed version. Confirmations must follow stage insertion order
    /// across ids; gaps within one id are tolerated.
    async fn confirm(&mut self, staged: Item) -> Result<Version, WriteError> {
        let si = staged.h.i.ok_or(TreeError::MissingIndex)?;
        let sv = staged.version()?.clone();

        for it in self.stage.batch(None, usize::MAX)? {
            let Some(i) = it.h.i else { continue };
            if i >= si {
                break;
            }
            // Conflicted heads never get a handler call, so they do not
            // gate confirmations of other ids.
            if it.h.id != staged.h.id && !it.h.c {
                return Err(WriteError::OutOfOrderConfirmation(sv));
            }
        }

        for it in self.stage.iter_id(&staged.h.id, false)? {
            if it.h.i.map(|i| i > si).unwrap_or(true) {
                continue;
            }
            let mut promoted = it.clone();
            promoted.h.i = None;
            // The confirmed head itself is already in the plain store.
            promoted.m.ack = it.h.v.as_ref() == Some(&sv);
            self.local.write(&promoted)?;
            self.stage.del(&it)?;
        }
        debug!(id = %staged.h.id, v = %sv, "stage confirmed");
        Ok(sv)
    }

    /// Open a reader over the local history.
    pub fn reader(&self, opts: ReaderOptions) -> Reader {
        Reader::open(self.local.clone(), opts)
    }

    /// Replication watermark: the newest local item originating in the
    /// given perspective.
    pub fn last_by_perspective(&self, pe: &str) -> Result<Option<Version>, WriteError> {
        let pe = Perspective::new(pe)?;
        Ok(self.local.last_by_perspective(&pe)?.and_then(|it| it.h.v))
    }

    pub fn local_tree(&self) -> &Tree {
        &self.local
    }

    pub fn stage_tree(&self) -> &Tree {
        &self.stage
    }

    pub fn perspective_tree(&self, pe: &str) -> Option<&Tree> {
        self.perspectives.get(pe)
    }
}

fn read_cursor(tree: &Tree) -> Result<Option<u64>, TreeError> {
    Ok(tree.get_user(MERGE_CURSOR_KEY)?.and_then(|b| {
        b.try_into().ok().map(u64::from_be_bytes)
    }))
}

fn write_cursor(tree: &Tree, i: u64) -> Result<(), TreeError> {
    tree.put_user(MERGE_CURSOR_KEY, &i.to_be_bytes())
}
