use std::mem;
use std::sync::Arc;

use bytes::Bytes;
use log::debug;

use crate::buffer::PageId;
use crate::error::{LatchTreeError, LatchTreeResult};
use crate::storage::frame::{move_frames, FrameRef};

/// Bytes charged for a child reference held by an internal node.
pub const CHILD_REF_SIZE: usize = mem::size_of::<PageId>();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiblingDirection {
    /// The sibling holds the higher keys.
    Right,
    /// The sibling holds the lower keys.
    Left,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    Inserted,
    FailedNoSpace,
}

/// A split that happened in a node but is not yet known to its parent.
#[derive(Debug, Clone)]
pub struct Split {
    pub sibling: PageId,
    pub direction: SiblingDirection,
    /// Separator taken out of an internal node. Leaf splits leave it empty,
    /// their separator is the lowest key of the upper half when the split is
    /// propagated.
    pub migrated_key: Option<Bytes>,
}

#[derive(Debug)]
pub enum NodeBody {
    Leaf {
        entries: Vec<(Bytes, Bytes)>,
    },
    Internal {
        keys: Vec<Bytes>,
        children: Vec<PageId>,
    },
}

#[derive(Debug)]
pub struct Node {
    page_id: PageId,
    capacity: usize,
    used_bytes: usize,
    split: Option<Split>,
    /// False for a split sibling its parent does not reference yet.
    linked: bool,
    visitors: Vec<FrameRef>,
    body: NodeBody,
}

impl Node {
    pub fn new_leaf(page_id: PageId, capacity: usize) -> Self {
        Self {
            page_id,
            capacity,
            used_bytes: 0,
            split: None,
            linked: false,
            visitors: Vec::new(),
            body: NodeBody::Leaf {
                entries: Vec::new(),
            },
        }
    }

    pub fn new_internal(page_id: PageId, capacity: usize, leftmost: Option<PageId>) -> Self {
        Self {
            page_id,
            capacity,
            used_bytes: 0,
            split: None,
            linked: false,
            visitors: Vec::new(),
            body: NodeBody::Internal {
                keys: Vec::new(),
                children: leftmost.into_iter().collect(),
            },
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn body(&self) -> &NodeBody {
        &self.body
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.body, NodeBody::Leaf { .. })
    }

    /// Entries of a leaf, children of an internal node.
    pub fn size(&self) -> usize {
        match &self.body {
            NodeBody::Leaf { entries } => entries.len(),
            NodeBody::Internal { children, .. } => children.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    pub fn available_bytes(&self) -> usize {
        self.capacity.saturating_sub(self.used_bytes)
    }

    pub fn max_entry_size(&self) -> usize {
        self.capacity / 4
    }

    pub fn is_linked(&self) -> bool {
        self.linked
    }

    pub(crate) fn set_linked(&mut self) {
        self.linked = true;
    }

    pub fn has_split(&self) -> bool {
        self.split.is_some()
    }

    pub fn split(&self) -> Option<&Split> {
        self.split.as_ref()
    }

    pub fn record_split(&mut self, split: Split) -> LatchTreeResult<()> {
        if self.split.is_some() {
            return Err(LatchTreeError::SplitInvariantViolation(format!(
                "node {} already has a pending split",
                self.page_id
            )));
        }
        self.split = Some(split);
        Ok(())
    }

    pub fn take_split(&mut self) -> Option<Split> {
        self.split.take()
    }

    pub fn visitors(&self) -> &[FrameRef] {
        &self.visitors
    }

    pub fn bind(&mut self, frame: FrameRef) {
        self.visitors.push(frame);
    }

    pub fn unbind(&mut self, frame: &FrameRef) -> bool {
        let before = self.visitors.len();
        self.visitors.retain(|f| !Arc::ptr_eq(f, frame));
        self.visitors.len() != before
    }

    pub(crate) fn take_visitors(&mut self) -> Vec<FrameRef> {
        mem::take(&mut self.visitors)
    }

    pub fn leaf_entries(&self) -> Option<&[(Bytes, Bytes)]> {
        match &self.body {
            NodeBody::Leaf { entries } => Some(entries.as_slice()),
            NodeBody::Internal { .. } => None,
        }
    }

    pub fn internal_keys(&self) -> Option<&[Bytes]> {
        match &self.body {
            NodeBody::Internal { keys, .. } => Some(keys.as_slice()),
            NodeBody::Leaf { .. } => None,
        }
    }

    pub fn children(&self) -> Option<&[PageId]> {
        match &self.body {
            NodeBody::Internal { children, .. } => Some(children.as_slice()),
            NodeBody::Leaf { .. } => None,
        }
    }

    /// Lowest key held by the node.
    pub fn first_key(&self) -> Option<&Bytes> {
        match &self.body {
            NodeBody::Leaf { entries } => entries.first().map(|(k, _)| k),
            NodeBody::Internal { keys, .. } => keys.first(),
        }
    }

    pub fn key_at(&self, index: usize) -> Option<&Bytes> {
        match &self.body {
            NodeBody::Leaf { entries } => entries.get(index).map(|(k, _)| k),
            NodeBody::Internal { keys, .. } => keys.get(index),
        }
    }

    pub fn value_at(&self, index: usize) -> Option<&Bytes> {
        self.leaf_entries()?.get(index).map(|(_, v)| v)
    }

    pub fn child_at(&self, index: usize) -> Option<PageId> {
        self.children()?.get(index).copied()
    }

    /// Binary search of a leaf: `Ok(index)` when the key is present,
    /// `Err(gap)` with the insertion position otherwise.
    pub fn search(&self, key: &[u8]) -> LatchTreeResult<Result<usize, usize>> {
        let entries = self.leaf_entries().ok_or_else(|| self.kind_error("search"))?;
        Ok(entries.binary_search_by(|(k, _)| k.as_ref().cmp(key)))
    }

    /// Index of the child whose subtree covers `key`.
    pub fn child_index(&self, key: &[u8]) -> LatchTreeResult<usize> {
        let keys = self
            .internal_keys()
            .ok_or_else(|| self.kind_error("child_index"))?;
        Ok(keys.partition_point(|k| k.as_ref() <= key))
    }

    pub fn is_sorted(&self) -> bool {
        match &self.body {
            NodeBody::Leaf { entries } => entries.windows(2).all(|w| w[0].0 < w[1].0),
            NodeBody::Internal { keys, .. } => keys.windows(2).all(|w| w[0] < w[1]),
        }
    }

    /// Inserts into a leaf at a position obtained from [`Node::search`].
    pub fn insert(
        &mut self,
        position: usize,
        key: Bytes,
        value: Bytes,
    ) -> LatchTreeResult<InsertResult> {
        let entry_size = self.verified_leaf_entry_size(&key, &value)?;
        let page_id = self.page_id;
        let NodeBody::Leaf { entries } = &mut self.body else {
            return Err(LatchTreeError::Internal(format!(
                "entry insert into internal node {}",
                page_id
            )));
        };
        check_slot(entries.iter().map(|(k, _)| k), entries.len(), position, &key, page_id)?;
        if entry_size > self.capacity - self.used_bytes {
            return Ok(InsertResult::FailedNoSpace);
        }
        entries.insert(position, (key.clone(), value));
        self.used_bytes += entry_size;
        for frame in &self.visitors {
            frame.state().shift_for_entry_insert(position, &key);
        }
        Ok(InsertResult::Inserted)
    }

    /// Searches for the slot of `key` and inserts there.
    pub fn insert_sorted(&mut self, key: Bytes, value: Bytes) -> LatchTreeResult<InsertResult> {
        match self.search(&key)? {
            Ok(_) => Err(LatchTreeError::DuplicateKey),
            Err(position) => self.insert(position, key, value),
        }
    }

    /// Inserts a separator key at key index `position` together with a new
    /// child on the given side of it. Frames of this node that were
    /// descending into the split child and belong to `relocated` are moved
    /// onto the new child.
    pub fn insert_child(
        &mut self,
        position: usize,
        key: Bytes,
        child: PageId,
        direction: SiblingDirection,
        relocated: &[FrameRef],
    ) -> LatchTreeResult<InsertResult> {
        let entry_size = self.verified_entry_size(key.len() + CHILD_REF_SIZE)?;
        let page_id = self.page_id;
        let NodeBody::Internal { keys, children } = &mut self.body else {
            return Err(LatchTreeError::Internal(format!(
                "child insert into leaf node {}",
                page_id
            )));
        };
        check_slot(keys.iter(), keys.len(), position, &key, page_id)?;
        if entry_size > self.capacity - self.used_bytes {
            return Ok(InsertResult::FailedNoSpace);
        }
        keys.insert(position, key);
        children.insert(new_child_index(position, direction), child);
        self.used_bytes += entry_size;
        self.shift_frames_for_child(position, direction, relocated);
        Ok(InsertResult::Inserted)
    }

    /// Splits a full leaf into `sibling` while inserting `key`.
    ///
    /// The sibling always receives the half holding the new entry, and the
    /// split is recorded on this node until a parent learns about it.
    pub fn split_and_insert(
        &mut self,
        key: Bytes,
        value: Bytes,
        sibling: &mut Node,
    ) -> LatchTreeResult<()> {
        let entry_size = self.verified_leaf_entry_size(&key, &value)?;
        self.check_split_preconditions(entry_size, sibling)?;
        let insert_pos = match self.search(&key)? {
            Ok(_) => return Err(LatchTreeError::DuplicateKey),
            Err(gap) => gap,
        };
        if !sibling.is_leaf() {
            return Err(self.kind_error("split_and_insert"));
        }

        for frame in &self.visitors {
            frame.state().shift_for_entry_insert(insert_pos, &key);
        }

        let NodeBody::Leaf { entries } = &mut self.body else {
            return Err(LatchTreeError::Internal("leaf body expected".to_string()));
        };
        let original_size = entries.len();
        let mut combined = mem::take(entries);
        combined.insert(insert_pos, (key, value));

        let sizes: Vec<usize> = combined.iter().map(|(k, v)| k.len() + v.len()).collect();
        let split_pos = leaf_split_point(&sizes, insert_pos, self.capacity);
        let direction = if insert_pos >= split_pos {
            SiblingDirection::Right
        } else {
            SiblingDirection::Left
        };

        let upper = combined.split_off(split_pos);
        let (kept, moved) = match direction {
            SiblingDirection::Right => (combined, upper),
            SiblingDirection::Left => (upper, combined),
        };
        self.used_bytes = kept.iter().map(|(k, v)| k.len() + v.len()).sum();
        sibling.used_bytes = moved.iter().map(|(k, v)| k.len() + v.len()).sum();
        self.body = NodeBody::Leaf { entries: kept };
        sibling.body = NodeBody::Leaf { entries: moved };

        move_frames(self, sibling, split_pos, direction);
        self.record_split(Split {
            sibling: sibling.page_id,
            direction,
            migrated_key: None,
        })?;
        debug!(
            "split leaf {} ({} entries) into {} and {} at {}, sibling {:?}",
            self.page_id,
            original_size,
            self.size(),
            sibling.size(),
            split_pos,
            direction
        );
        Ok(())
    }

    /// Splits a full internal node into `sibling` while inserting a separator
    /// and child, as [`Node::insert_child`] would. The key at the split
    /// boundary leaves both halves and is recorded as the migrated key.
    pub fn split_and_insert_child(
        &mut self,
        position: usize,
        key: Bytes,
        child: PageId,
        direction: SiblingDirection,
        relocated: &[FrameRef],
        sibling: &mut Node,
    ) -> LatchTreeResult<()> {
        let entry_size = self.verified_entry_size(key.len() + CHILD_REF_SIZE)?;
        self.check_split_preconditions(entry_size, sibling)?;
        let page_id = self.page_id;
        let NodeBody::Internal { keys, .. } = &self.body else {
            return Err(self.kind_error("split_and_insert_child"));
        };
        check_slot(keys.iter(), keys.len(), position, &key, page_id)?;
        if sibling.is_leaf() {
            return Err(sibling.kind_error("split_and_insert_child"));
        }

        self.shift_frames_for_child(position, direction, relocated);

        let NodeBody::Internal { keys, children } = &mut self.body else {
            return Err(LatchTreeError::Internal("internal body expected".to_string()));
        };
        let original_size = children.len();
        let mut keys = mem::take(keys);
        let mut children = mem::take(children);
        let child_pos = new_child_index(position, direction);
        keys.insert(position, key);
        children.insert(child_pos, child);

        let sizes: Vec<usize> = keys.iter().map(|k| k.len() + CHILD_REF_SIZE).collect();
        let migrated_pos = internal_split_point(&sizes, child_pos, self.capacity);
        let split_pos = migrated_pos + 1;
        let split_direction = if child_pos >= split_pos {
            SiblingDirection::Right
        } else {
            SiblingDirection::Left
        };

        let upper_keys = keys.split_off(split_pos);
        let migrated_key = keys.pop().ok_or_else(|| {
            LatchTreeError::Internal(format!("node {} split without a boundary key", page_id))
        })?;
        let upper_children = children.split_off(split_pos);
        let lower = (keys, children);
        let upper = (upper_keys, upper_children);
        let ((kept_keys, kept_children), (moved_keys, moved_children)) = match split_direction {
            SiblingDirection::Right => (lower, upper),
            SiblingDirection::Left => (upper, lower),
        };
        self.used_bytes = kept_keys.iter().map(|k| k.len() + CHILD_REF_SIZE).sum();
        sibling.used_bytes = moved_keys.iter().map(|k| k.len() + CHILD_REF_SIZE).sum();
        self.body = NodeBody::Internal {
            keys: kept_keys,
            children: kept_children,
        };
        sibling.body = NodeBody::Internal {
            keys: moved_keys,
            children: moved_children,
        };

        move_frames(self, sibling, split_pos, split_direction);
        self.record_split(Split {
            sibling: sibling.page_id,
            direction: split_direction,
            migrated_key: Some(migrated_key),
        })?;
        debug!(
            "split internal {} ({} children) into {} and {}, sibling {:?}",
            self.page_id,
            original_size,
            self.size(),
            sibling.size(),
            split_direction
        );
        Ok(())
    }

    fn shift_frames_for_child(
        &self,
        position: usize,
        direction: SiblingDirection,
        relocated: &[FrameRef],
    ) {
        for frame in &self.visitors {
            let follows_new_child = relocated.iter().any(|r| Arc::ptr_eq(r, frame));
            frame
                .state()
                .shift_for_child_insert(position, direction, follows_new_child);
        }
    }

    fn check_split_preconditions(&self, entry_size: usize, sibling: &Node) -> LatchTreeResult<()> {
        if self.split.is_some() {
            return Err(LatchTreeError::SplitInvariantViolation(format!(
                "node {} already has a pending split",
                self.page_id
            )));
        }
        if entry_size <= self.available_bytes() {
            return Err(LatchTreeError::SplitInvariantViolation(format!(
                "node {} still has room for a {} byte entry",
                self.page_id, entry_size
            )));
        }
        if !sibling.is_empty() {
            return Err(LatchTreeError::SplitInvariantViolation(format!(
                "split target {} is not empty",
                sibling.page_id
            )));
        }
        Ok(())
    }

    fn verified_entry_size(&self, size: usize) -> LatchTreeResult<usize> {
        let max = self.max_entry_size();
        if size > max {
            return Err(LatchTreeError::EntryTooLarge { size, max });
        }
        Ok(size)
    }

    /// A leaf key may later be copied into a parent as a separator, so it
    /// must also fit there together with a child reference.
    fn verified_leaf_entry_size(&self, key: &[u8], value: &[u8]) -> LatchTreeResult<usize> {
        let entry_size = self.verified_entry_size(key.len() + value.len())?;
        self.verified_entry_size(key.len() + CHILD_REF_SIZE)?;
        Ok(entry_size)
    }

    fn kind_error(&self, op: &str) -> LatchTreeError {
        LatchTreeError::Internal(format!(
            "{} is not supported on {} node {}",
            op,
            if self.is_leaf() { "leaf" } else { "internal" },
            self.page_id
        ))
    }
}

fn new_child_index(key_pos: usize, direction: SiblingDirection) -> usize {
    match direction {
        SiblingDirection::Right => key_pos + 1,
        SiblingDirection::Left => key_pos,
    }
}

/// Rejects a key that is already present next to `position` or that would
/// break the ordering of the node.
fn check_slot<'a>(
    mut keys: impl Iterator<Item = &'a Bytes> + Clone,
    len: usize,
    position: usize,
    key: &[u8],
    page_id: PageId,
) -> LatchTreeResult<()> {
    if position > len {
        return Err(LatchTreeError::Internal(format!(
            "position {} out of bounds for node {} of {} keys",
            position, page_id, len
        )));
    }
    let before = position.checked_sub(1).and_then(|i| keys.clone().nth(i));
    let at = keys.nth(position);
    if before.is_some_and(|k| k.as_ref() == key) || at.is_some_and(|k| k.as_ref() == key) {
        return Err(LatchTreeError::DuplicateKey);
    }
    if before.is_some_and(|k| k.as_ref() > key) || at.is_some_and(|k| k.as_ref() < key) {
        return Err(LatchTreeError::Internal(format!(
            "position {} breaks key order of node {}",
            position, page_id
        )));
    }
    Ok(())
}

/// Count based split point over a sequence that grew by one at
/// `insert_pos`; the half receiving the new item is the one that started
/// shorter. When the new item lands exactly on the midpoint the more even
/// division wins, and the upper half takes it on a draw.
fn balanced_split_point(original_size: usize, insert_pos: usize) -> usize {
    let mid = original_size / 2;
    if insert_pos > mid {
        mid
    } else if insert_pos < mid {
        mid + 1
    } else {
        let combined = original_size + 1;
        let upper_gap = combined.abs_diff(2 * mid);
        let lower_gap = combined.abs_diff(2 * (mid + 1));
        if lower_gap < upper_gap {
            mid + 1
        } else {
            mid
        }
    }
}

/// Number of combined entries kept in the lower half of a leaf split. Both
/// halves hold at least one entry and fit `capacity`.
fn leaf_split_point(sizes: &[usize], insert_pos: usize, capacity: usize) -> usize {
    let len = sizes.len();
    let total: usize = sizes.iter().sum();
    let mut split = balanced_split_point(len - 1, insert_pos).clamp(1, len - 1);
    let lower = |split: usize| sizes[..split].iter().sum::<usize>();
    while split > 1 && lower(split) > capacity {
        split -= 1;
    }
    while split + 1 < len && total - lower(split) > capacity {
        split += 1;
    }
    split
}

/// Index of the key migrated out of an internal split, `sizes` being the
/// charges of the combined keys and `child_pos` the new child's index.
fn internal_split_point(sizes: &[usize], child_pos: usize, capacity: usize) -> usize {
    let len = sizes.len();
    let lower_children = balanced_split_point(len, child_pos);
    let mut migrated = lower_children.saturating_sub(1).clamp(1, len.saturating_sub(2).max(1));
    let lower = |m: usize| sizes[..m].iter().sum::<usize>();
    let upper = |m: usize| sizes[m + 1..].iter().sum::<usize>();
    while migrated > 1 && lower(migrated) > capacity {
        migrated -= 1;
    }
    while migrated + 2 < len && upper(migrated) > capacity {
        migrated += 1;
    }
    migrated
}
