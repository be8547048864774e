use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};

use crate::buffer::{NodeStore, NodeWriteGuard, PageId};
use crate::error::LatchTreeResult;
use crate::storage::node::{Node, SiblingDirection};

pub type FrameRef = Arc<CursorFrame>;

static NEXT_FRAME_ID: AtomicU64 = AtomicU64::new(1);

/// A cursor's binding to one slot of one node.
///
/// The state is only changed by a thread holding the exclusive latch of the
/// node the frame is bound to. The mutex exists so readers that do not hold
/// that latch still see a consistent snapshot.
#[derive(Debug)]
pub struct CursorFrame {
    id: u64,
    state: Mutex<FrameState>,
}

#[derive(Debug, Clone)]
pub struct FrameState {
    pub node: PageId,
    /// Entry index in a leaf, child index in an internal node.
    pub position: usize,
    /// Set when a leaf search missed; `position` is then the insertion gap.
    pub not_found_key: Option<Bytes>,
    pub parent: Option<FrameRef>,
}

impl CursorFrame {
    pub fn new(
        node: PageId,
        position: usize,
        not_found_key: Option<Bytes>,
        parent: Option<FrameRef>,
    ) -> FrameRef {
        Arc::new(CursorFrame {
            id: NEXT_FRAME_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(FrameState {
                node,
                position,
                not_found_key,
                parent,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn node(&self) -> PageId {
        self.state.lock().node
    }

    pub fn position(&self) -> usize {
        self.state.lock().position
    }

    pub fn is_found(&self) -> bool {
        self.state.lock().not_found_key.is_none()
    }

    pub fn parent(&self) -> Option<FrameRef> {
        self.state.lock().parent.clone()
    }

    pub fn snapshot(&self) -> FrameState {
        self.state.lock().clone()
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, FrameState> {
        self.state.lock()
    }
}

impl FrameState {
    /// Adjusts a leaf frame for an entry inserted at `position`.
    ///
    /// A gap frame sitting exactly at the insertion point compares its
    /// search key with the inserted one: equal means the frame now rests on
    /// the new entry, greater means its gap moved right.
    pub(crate) fn shift_for_entry_insert(&mut self, position: usize, key: &[u8]) {
        if self.position > position {
            self.position += 1;
        } else if self.position == position {
            match self.not_found_key.as_ref().map(|k| k.as_ref().cmp(key)) {
                None | Some(std::cmp::Ordering::Greater) => self.position += 1,
                Some(std::cmp::Ordering::Equal) => self.not_found_key = None,
                Some(std::cmp::Ordering::Less) => {}
            }
        }
    }

    /// Adjusts an internal frame for a key and child inserted at key index
    /// `position`. Frames at that child index follow either the original
    /// child or the new one, as decided by `follows_new_child`.
    pub(crate) fn shift_for_child_insert(
        &mut self,
        position: usize,
        direction: SiblingDirection,
        follows_new_child: bool,
    ) {
        if self.position > position {
            self.position += 1;
        } else if self.position == position {
            let new_child_right = direction == SiblingDirection::Right;
            if follows_new_child == new_child_right {
                self.position += 1;
            }
        }
    }
}

/// Latches the node a frame is bound to. A concurrent split may move the
/// frame between reading its node and acquiring the latch, so the binding
/// is checked again and the latch retried until they agree.
pub fn latch_frame(store: &NodeStore, frame: &FrameRef) -> LatchTreeResult<NodeWriteGuard> {
    loop {
        let page_id = frame.node();
        let guard = store.fetch_write(page_id)?;
        if frame.node() == page_id {
            return Ok(guard);
        }
    }
}

/// Moves the frames of a node that was just split into `sibling`.
///
/// Positions are in the coordinates of the combined sequence the split was
/// computed over, whose first `split_pos` items form the lower half. A gap
/// frame exactly at `split_pos` waits on a key below the lowest key of the
/// upper half and so stays with the lower half. With
/// [`SiblingDirection::Right`] the sibling takes the upper frames, with
/// [`SiblingDirection::Left`] the lower ones.
pub fn move_frames(
    source: &mut Node,
    sibling: &mut Node,
    split_pos: usize,
    direction: SiblingDirection,
) {
    let sibling_id = sibling.page_id();
    let frames = source.take_visitors();
    for frame in frames {
        let mut state = frame.state();
        let upper = state.position > split_pos
            || (state.position == split_pos && state.not_found_key.is_none());
        let moves = match direction {
            SiblingDirection::Right => upper,
            SiblingDirection::Left => !upper,
        };
        if upper {
            state.position -= split_pos;
        }
        if moves {
            state.node = sibling_id;
        }
        drop(state);
        if moves {
            sibling.bind(frame);
        } else {
            source.bind(frame);
        }
    }
}
