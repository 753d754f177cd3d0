//! Tailable projecting reader
//!
//! Streams a tree in insertion order from an offset version, through an
//! attribute filter and a hook chain, while keeping the emitted subgraph
//! connected: parents of an emitted item are rewritten to its nearest
//! emitted ancestors, so filtered-out intermediates never orphan a node.
//!
//! The stream is backed by a bounded channel; a slow consumer pauses the
//! walk. `close` is idempotent and lets queued emissions drain.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bson::Document;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use vantage_model::{canonical_eq, HookError, Item, ItemError, ReaderOptions, Version};
use vantage_tree::{Tree, TreeError};

const EMIT_QUEUE: usize = 64;
const SCAN_BATCH: usize = 256;

/// Errors surfaced on the reader stream.
#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("offset version {0} not found in tree")]
    OffsetNotFound(Version),

    #[error("tree error: {0}")]
    Tree(#[from] TreeError),

    #[error("item error: {0}")]
    Item(#[from] ItemError),

    #[error(transparent)]
    Hook(#[from] HookError),

    #[error("emit encode error: {0}")]
    Encode(#[from] bson::ser::Error),
}

/// One emitted element: a parsed wire document, or its raw bytes.
#[derive(Debug, Clone)]
pub enum ReaderItem {
    Doc(Document),
    Raw(Vec<u8>),
}

/// Handle for closing a reader from elsewhere.
#[derive(Clone)]
pub struct ReaderCloser {
    close_tx: Arc<watch::Sender<bool>>,
}

impl ReaderCloser {
    pub fn close(&self) {
        let _ = self.close_tx.send(true);
    }
}

/// A running reader stream.
pub struct Reader {
    rx: mpsc::Receiver<Result<ReaderItem, ReaderError>>,
    close_tx: Arc<watch::Sender<bool>>,
}

impl Reader {
    /// Start a reader over the given tree. Must be called on a runtime.
    pub fn open(tree: Tree, opts: ReaderOptions) -> Self {
        let (tx, rx) = mpsc::channel(EMIT_QUEUE);
        let (close_tx, close_rx) = watch::channel(false);
        let close_tx = Arc::new(close_tx);
        tokio::spawn(run(tree, opts, tx, close_rx));
        Self { rx, close_tx }
    }

    /// Next element, or `None` at end of stream.
    pub async fn next(&mut self) -> Option<Result<ReaderItem, ReaderError>> {
        self.rx.recv().await
    }

    /// Stop the source; queued emissions still drain. Idempotent.
    pub fn close(&self) {
        let _ = self.close_tx.send(true);
    }

    pub fn closer(&self) -> ReaderCloser {
        ReaderCloser {
            close_tx: self.close_tx.clone(),
        }
    }

    /// Consume into a `Stream`; pair with [`Reader::closer`] for shutdown.
    pub fn into_stream(self) -> ReceiverStream<Result<ReaderItem, ReaderError>> {
        ReceiverStream::new(self.rx)
    }
}

async fn run(
    tree: Tree,
    opts: ReaderOptions,
    tx: mpsc::Sender<Result<ReaderItem, ReaderError>>,
    close_rx: watch::Receiver<bool>,
) {
    if let Err(e) = walk(tree, opts, &tx, close_rx).await {
        let _ = tx.send(Err(e)).await;
    }
}

async fn walk(
    tree: Tree,
    opts: ReaderOptions,
    tx: &mpsc::Sender<Result<ReaderItem, ReaderError>>,
    mut close_rx: watch::Receiver<bool>,
) -> Result<(), ReaderError> {
    let total = tree.len()?;
    // Subscribe before the catch-up scan so no write slips through the gap.
    let mut events = if opts.follow { Some(tree.subscribe()) } else { None };

    let mut heads: HashMap<Version, Vec<Version>> = HashMap::new();
    let mut awaiting_offset = opts.offset.clone();
    let mut processed: u64 = 0;
    let mut last_i: Option<u64> = None;

    'outer: loop {
        if *close_rx.borrow() {
            break;
        }
        let batch = tree.batch(last_i, SCAN_BATCH)?;
        if batch.is_empty() {
            if let Some(offset) = &awaiting_offset {
                if processed >= total {
                    return Err(ReaderError::OffsetNotFound(offset.clone()));
                }
            }
            let Some(rx) = &mut events else { break };
            tokio::select! {
                _ = close_rx.changed() => {
                    if *close_rx.borrow() {
                        break;
                    }
                }
                res = rx.recv() => match res {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
            continue;
        }

        for item in batch {
            last_i = item.h.i;
            processed += 1;
            let Some(v) = item.h.v.clone() else { continue };

            // Projected parents: inherit the entry of each parent, or walk
            // back along that branch to its nearest visible ancestor.
            let mut pa_proj: Vec<Version> = Vec::new();
            for p in &item.h.pa {
                match heads.remove(p) {
                    Some(list) => {
                        for e in list {
                            if !pa_proj.contains(&e) {
                                pa_proj.push(e);
                            }
                        }
                    }
                    None => {
                        for e in walk_back(&tree, p, &opts, &heads).await? {
                            if !pa_proj.contains(&e) {
                                pa_proj.push(e);
                            }
                        }
                    }
                }
            }

            if awaiting_offset.as_ref() == Some(&v) {
                awaiting_offset = None;
            }
            let suppressed = awaiting_offset.is_some();

            match visible_item(item, &opts).await? {
                Some(out_item) => {
                    heads.insert(v.clone(), vec![v.clone()]);
                    if !suppressed {
                        let payload = emit(out_item, &pa_proj, opts.raw)?;
                        tokio::select! {
                            _ = close_rx.changed() => {
                                if *close_rx.borrow() {
                                    break 'outer;
                                }
                            }
                            res = tx.send(Ok(payload)) => {
                                if res.is_err() {
                                    break 'outer;
                                }
                            }
                        }
                    }
                }
                None => {
                    heads.insert(v, pa_proj);
                }
            }
        }
    }
    debug!(tree = %tree.name(), processed, "reader done");
    Ok(())
}

/// Apply filter and hooks; `None` means the item is projected away.
async fn visible_item(item: Item, opts: &ReaderOptions) -> Result<Option<Item>, ReaderError> {
    if !matches_filter(&item.b, opts.filter.as_ref()) {
        return Ok(None);
    }
    let mut current = item;
    for hook in &opts.hooks {
        match hook.run(current, &opts.hooks_opts).await? {
            Some(next) => current = next,
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}

fn matches_filter(body: &Document, filter: Option<&Document>) -> bool {
    let Some(filter) = filter else { return true };
    filter.iter().all(|(k, want)| {
        body.get(k).map(|have| canonical_eq(have, want)).unwrap_or(false)
    })
}

/// Nearest visible ancestors along one parent branch.
async fn walk_back(
    tree: &Tree,
    start: &Version,
    opts: &ReaderOptions,
    heads: &HashMap<Version, Vec<Version>>,
) -> Result<Vec<Version>, ReaderError> {
    let mut out = Vec::new();
    let mut stack = vec![start.clone()];
    let mut visited: HashSet<Version> = HashSet::new();
    while let Some(v) = stack.pop() {
        if !visited.insert(v.clone()) {
            continue;
        }
        if let Some(entry) = heads.get(&v) {
            for e in entry {
                if !out.contains(e) {
                    out.push(e.clone());
                }
            }
            continue;
        }
        let Some(item) = tree.get_by_version(&v)? else { continue };
        if visible_item(item.clone(), opts).await?.is_some() {
            if !out.contains(&v) {
                out.push(v);
            }
        } else {
            stack.extend(item.h.pa.iter().cloned());
        }
    }
    Ok(out)
}

/// Build the emitted wire document: projected parents substituted,
/// perspective, insertion index and meta stripped.
fn emit(mut item: Item, pa: &[Version], raw: bool) -> Result<ReaderItem, ReaderError> {
    item.h.pa = pa.to_vec();
    item.h.i = None;
    let mut doc = item.to_doc();
    doc.remove("m");
    if let Ok(h) = doc.get_document_mut("h") {
        h.remove("pe");
    }
    if raw {
        let mut buf = Vec::new();
        doc.to_writer(&mut buf)?;
        Ok(ReaderItem::Raw(buf))
    } else {
        Ok(ReaderItem::Doc(doc))
    }
}
