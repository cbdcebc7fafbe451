//! Bookkeeping for one in-flight block download batch

use crate::message::BlockMessage;
use crate::types::Hash;
use std::collections::HashMap;
use tokio::sync::oneshot;

/// Blocks requested together and resolved together, in request order
#[derive(Debug)]
pub struct DownloadBatch {
    id: u64,
    order: Vec<Hash>,
    slots: HashMap<Hash, Option<BlockMessage>>,
    done: Option<oneshot::Sender<Vec<BlockMessage>>>,
}

impl DownloadBatch {
    pub fn new(id: u64, hashes: Vec<Hash>) -> (Self, oneshot::Receiver<Vec<BlockMessage>>) {
        let (done, rx) = oneshot::channel();
        let slots = hashes.iter().map(|hash| (*hash, None)).collect();
        let batch = DownloadBatch {
            id,
            order: hashes,
            slots,
            done: Some(done),
        };
        (batch, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn requested(&self) -> &[Hash] {
        &self.order
    }

    /// Whether `hash` is still awaited
    pub fn wants(&self, hash: &Hash) -> bool {
        matches!(self.slots.get(hash), Some(None))
    }

    pub fn missing(&self) -> usize {
        self.slots.values().filter(|slot| slot.is_none()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.missing() == 0
    }

    /// Fill the placeholder for `block`, resolving the batch once every
    /// placeholder is filled. Unrequested and duplicate blocks are ignored.
    pub fn fill(&mut self, block: BlockMessage) -> bool {
        if !self.wants(&block.hash) {
            return false;
        }
        self.slots.insert(block.hash, Some(block));
        if self.is_complete() {
            self.resolve();
        }
        true
    }

    fn resolve(&mut self) {
        let Some(done) = self.done.take() else {
            return;
        };
        let blocks = self
            .order
            .iter()
            .filter_map(|hash| self.slots.get(hash).cloned().flatten())
            .collect();
        // the caller may have given up already
        let _ = done.send(blocks);
    }
}
