use std::sync::Arc;

use bytes::Bytes;
use log::warn;

use crate::buffer::PageId;
use crate::error::{LatchTreeError, LatchTreeResult};
use crate::storage::frame::{latch_frame, FrameRef};
use crate::storage::ops;
use crate::storage::tree::Tree;

/// A position in a [`Tree`] that stays attached to its entry while other
/// cursors split the nodes underneath it.
///
/// The cursor owns its leaf frame; every frame links to the frame one level
/// up, so the chain describes the path from the root down to the leaf.
#[derive(Debug)]
pub struct Cursor {
    tree: Arc<Tree>,
    key: Option<Bytes>,
    value: Option<Bytes>,
    leaf: Option<FrameRef>,
}

impl Cursor {
    pub fn new(tree: Arc<Tree>) -> Self {
        Self {
            tree,
            key: None,
            value: None,
            leaf: None,
        }
    }

    pub fn tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    pub fn key(&self) -> Option<&Bytes> {
        self.key.as_ref()
    }

    /// Value seen by the last find, load or store.
    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    pub fn is_positioned(&self) -> bool {
        self.leaf.is_some()
    }

    pub fn find(&mut self, key: impl Into<Bytes>) -> LatchTreeResult<()> {
        let tree = Arc::clone(&self.tree);
        let leaf = ops::find(&tree, self, key.into())?;
        leaf.release();
        Ok(())
    }

    pub fn store(&mut self, value: impl Into<Bytes>) -> LatchTreeResult<()> {
        let tree = Arc::clone(&self.tree);
        ops::store(&tree, self, value.into())
    }

    /// Re-reads the value under the cursor from its current leaf.
    pub fn load(&mut self) -> LatchTreeResult<Option<Bytes>> {
        let frame = self.leaf.clone().ok_or(LatchTreeError::Unpositioned)?;
        let leaf = latch_frame(self.tree.store(), &frame)?;
        self.value = if frame.is_found() {
            leaf.value_at(frame.position()).cloned()
        } else {
            None
        };
        Ok(self.value.clone())
    }

    /// Key of the entry the leaf frame rests on, `None` while it waits on a
    /// gap.
    pub fn positioned_key(&self) -> LatchTreeResult<Option<Bytes>> {
        let frame = self.leaf.as_ref().ok_or(LatchTreeError::Unpositioned)?;
        let leaf = latch_frame(self.tree.store(), frame)?;
        if !frame.is_found() {
            return Ok(None);
        }
        Ok(leaf.key_at(frame.position()).cloned())
    }

    pub fn reset(&mut self) -> LatchTreeResult<()> {
        let tree = Arc::clone(&self.tree);
        ops::reset(&tree, self)
    }

    /// `(node, position)` of every frame, root first.
    pub fn frames(&self) -> Vec<(PageId, usize)> {
        let mut frames = Vec::new();
        let mut next = self.leaf.clone();
        while let Some(frame) = next {
            let state = frame.snapshot();
            frames.push((state.node, state.position));
            next = state.parent;
        }
        frames.reverse();
        frames
    }

    pub(crate) fn leaf_frame(&self) -> Option<&FrameRef> {
        self.leaf.as_ref()
    }

    pub(crate) fn take_leaf_frame(&mut self) -> Option<FrameRef> {
        self.leaf.take()
    }

    pub(crate) fn set_leaf_frame(&mut self, frame: Option<FrameRef>) {
        self.leaf = frame;
    }

    pub(crate) fn set_key(&mut self, key: Option<Bytes>) {
        self.key = key;
    }

    pub(crate) fn set_value(&mut self, value: Option<Bytes>) {
        self.value = value;
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if self.leaf.is_some() {
            if let Err(e) = self.reset() {
                warn!("failed to release cursor frames: {}", e);
            }
        }
    }
}
