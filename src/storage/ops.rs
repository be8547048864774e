//! Structural operations shared by cursors: latch coupled descent, inserts,
//! node splits and the lazy propagation of splits into parents.
//!
//! Latches are always taken top down. A split only touches the node being
//! split and a freshly allocated sibling; the parent learns about it the next
//! time any descent passes through, while it still holds the parent latch.

use bytes::Bytes;
use log::{debug, info, trace};

use crate::buffer::{NodeWriteGuard, PageId};
use crate::error::{LatchTreeError, LatchTreeResult};
use crate::storage::cursor::Cursor;
use crate::storage::frame::{latch_frame, CursorFrame, FrameRef};
use crate::storage::node::{InsertResult, SiblingDirection};
use crate::storage::tree::Tree;

/// Outcome of linking a pending split into its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repair {
    /// The parent had room for the new separator.
    Linked,
    /// The parent split in turn and now carries a pending split itself.
    ParentSplit,
    /// The parent was the root and the tree grew by one level.
    RootGrown,
}

/// Positions `cursor` on `key` and returns the leaf it landed on, still
/// latched. Any previous position of the cursor is released first.
pub fn find(tree: &Tree, cursor: &mut Cursor, key: Bytes) -> LatchTreeResult<NodeWriteGuard> {
    cursor.set_key(Some(key.clone()));
    cursor.set_value(None);
    let mut node = match cursor.take_leaf_frame() {
        Some(frame) => unwind_to_root(tree, frame)?,
        None => tree.latch_root()?,
    };
    let mut parent_frame: Option<FrameRef> = None;

    while !node.is_leaf() {
        let index = node.child_index(&key)?;
        let child_id = node.child_at(index).ok_or_else(|| {
            LatchTreeError::Internal(format!(
                "node {} has no child at {}",
                node.page_id(),
                index
            ))
        })?;
        let mut child = tree.store().fetch_write(child_id)?;

        if child.has_split() {
            match bubble_split_up_one_level(tree, &mut node, index, &mut child)? {
                // the key may now belong to the new sibling
                Repair::Linked => continue,
                Repair::ParentSplit | Repair::RootGrown => {
                    drop(child);
                    drop(node);
                    node = match parent_frame.take() {
                        Some(frame) => unwind_to_root(tree, frame)?,
                        None => tree.latch_root()?,
                    };
                    continue;
                }
            }
        }

        trace!("descend {} -> {} at child {}", node.page_id(), child_id, index);
        let frame = CursorFrame::new(node.page_id(), index, None, parent_frame.take());
        node.bind(frame.clone());
        parent_frame = Some(frame);
        node = child;
    }

    let (position, found) = match node.search(&key)? {
        Ok(position) => (position, true),
        Err(gap) => (gap, false),
    };
    if found {
        cursor.set_value(node.value_at(position).cloned());
    }
    let frame = CursorFrame::new(
        node.page_id(),
        position,
        (!found).then_some(key),
        parent_frame,
    );
    node.bind(frame.clone());
    cursor.set_leaf_frame(Some(frame));
    Ok(node)
}

/// Inserts `value` under the key the cursor was last positioned on.
pub fn store(tree: &Tree, cursor: &mut Cursor, value: Bytes) -> LatchTreeResult<()> {
    let key = cursor.key().cloned().ok_or(LatchTreeError::Unpositioned)?;
    let mut frame = cursor
        .leaf_frame()
        .cloned()
        .ok_or(LatchTreeError::Unpositioned)?;
    let mut leaf = latch_frame(tree.store(), &frame)?;

    loop {
        if frame.is_found() {
            return Err(LatchTreeError::DuplicateKey);
        }
        match leaf.insert(frame.position(), key.clone(), value.clone())? {
            InsertResult::Inserted => {
                tree.store().dirty(leaf.page_id());
                break;
            }
            // a node splits at most once before its parent links the sibling
            InsertResult::FailedNoSpace if leaf.has_split() || !leaf.is_linked() => {
                debug!(
                    "leaf {} is full and cannot split yet, repositioning",
                    leaf.page_id()
                );
                drop(leaf);
                leaf = find(tree, cursor, key.clone())?;
                frame = cursor.leaf_frame().cloned().ok_or_else(|| {
                    LatchTreeError::Internal("find left the cursor unpositioned".to_string())
                })?;
            }
            InsertResult::FailedNoSpace => {
                split_leaf(tree, &mut leaf, key.clone(), value.clone())?;
                break;
            }
        }
    }
    drop(leaf);
    cursor.set_value(Some(value));
    Ok(())
}

/// Unbinds every frame of the cursor, leaf first.
pub fn reset(tree: &Tree, cursor: &mut Cursor) -> LatchTreeResult<()> {
    cursor.set_key(None);
    cursor.set_value(None);
    if let Some(frame) = cursor.take_leaf_frame() {
        unwind(tree, frame, false)?;
    }
    Ok(())
}

/// Splits a full leaf into a new sibling while inserting the entry.
pub fn split_leaf(
    tree: &Tree,
    leaf: &mut NodeWriteGuard,
    key: Bytes,
    value: Bytes,
) -> LatchTreeResult<PageId> {
    let mut sibling = tree.store().allocate_leaf()?;
    leaf.split_and_insert(key, value, &mut sibling)?;
    tree.store().dirty(leaf.page_id());
    tree.store().dirty(sibling.page_id());
    Ok(sibling.page_id())
}

/// Splits a full internal node into a new sibling while inserting a
/// separator and child. The sibling is returned still latched.
pub fn split_internal(
    tree: &Tree,
    node: &mut NodeWriteGuard,
    position: usize,
    key: Bytes,
    child: PageId,
    direction: SiblingDirection,
    relocated: &[FrameRef],
) -> LatchTreeResult<NodeWriteGuard> {
    let mut sibling = tree.store().allocate_internal(None)?;
    node.split_and_insert_child(position, key, child, direction, relocated, &mut sibling)?;
    tree.store().dirty(node.page_id());
    tree.store().dirty(sibling.page_id());
    Ok(sibling)
}

/// Links the pending split of `child` into `parent`, both latched by the
/// caller. The parent may split or the root may grow as a result.
pub fn bubble_split_up_one_level(
    tree: &Tree,
    parent: &mut NodeWriteGuard,
    child_index: usize,
    child: &mut NodeWriteGuard,
) -> LatchTreeResult<Repair> {
    let split = child.split().cloned().ok_or_else(|| {
        LatchTreeError::Internal(format!("node {} has no pending split", child.page_id()))
    })?;
    if parent.child_at(child_index) != Some(child.page_id()) {
        return Err(LatchTreeError::Internal(format!(
            "node {} is not child {} of {}",
            child.page_id(),
            child_index,
            parent.page_id()
        )));
    }
    let mut sibling = tree.store().fetch_write(split.sibling)?;
    let separator = match &split.migrated_key {
        Some(key) => key.clone(),
        None => {
            let upper = match split.direction {
                SiblingDirection::Right => &sibling,
                SiblingDirection::Left => &*child,
            };
            upper.first_key().cloned().ok_or_else(|| {
                LatchTreeError::Internal(format!(
                    "split of node {} left an empty half",
                    child.page_id()
                ))
            })?
        }
    };
    // parent frames whose descent continues in the sibling
    let relocated: Vec<FrameRef> = sibling
        .visitors()
        .iter()
        .filter_map(|frame| frame.parent())
        .collect();

    let result = parent.insert_child(
        child_index,
        separator.clone(),
        split.sibling,
        split.direction,
        &relocated,
    )?;
    let repair = match result {
        InsertResult::Inserted => Repair::Linked,
        InsertResult::FailedNoSpace if parent.page_id() == tree.root_page_id() => {
            grow_root(
                tree,
                parent,
                child_index,
                separator,
                split.sibling,
                split.direction,
                &relocated,
            )?;
            Repair::RootGrown
        }
        InsertResult::FailedNoSpace => {
            split_internal(
                tree,
                parent,
                child_index,
                separator,
                split.sibling,
                split.direction,
                &relocated,
            )?;
            Repair::ParentSplit
        }
    };

    child.take_split();
    sibling.set_linked();
    tree.store().dirty(parent.page_id());
    tree.store().dirty(child.page_id());
    tree.store().dirty(sibling.page_id());
    debug!(
        "linked sibling {} of node {} into {}: {:?}",
        sibling.page_id(),
        child.page_id(),
        parent.page_id(),
        repair
    );
    Ok(repair)
}

/// Splits the full root and installs a new root above both halves. Frames
/// bound to either half receive parent frames on the new root.
fn grow_root(
    tree: &Tree,
    root: &mut NodeWriteGuard,
    child_index: usize,
    separator: Bytes,
    child: PageId,
    direction: SiblingDirection,
    relocated: &[FrameRef],
) -> LatchTreeResult<()> {
    let mut root_sibling = split_internal(
        tree,
        root,
        child_index,
        separator,
        child,
        direction,
        relocated,
    )?;
    let split = root.take_split().ok_or_else(|| {
        LatchTreeError::Internal(format!("root {} split without a record", root.page_id()))
    })?;
    let migrated_key = split.migrated_key.ok_or_else(|| {
        LatchTreeError::Internal(format!("root {} split without a separator", root.page_id()))
    })?;

    let mut new_root = tree.store().allocate_internal(Some(root.page_id()))?;
    let inserted = new_root.insert_child(
        0,
        migrated_key,
        root_sibling.page_id(),
        split.direction,
        &[],
    )?;
    if inserted != InsertResult::Inserted {
        return Err(LatchTreeError::Internal(format!(
            "new root {} has no room for its first separator",
            new_root.page_id()
        )));
    }

    let halves = [
        (root.page_id(), root.visitors().to_vec()),
        (root_sibling.page_id(), root_sibling.visitors().to_vec()),
    ];
    for (page_id, frames) in halves {
        let index = new_root
            .children()
            .and_then(|children| children.iter().position(|c| *c == page_id))
            .ok_or_else(|| {
                LatchTreeError::Internal(format!("node {} missing from new root", page_id))
            })?;
        for frame in frames {
            let parent = CursorFrame::new(new_root.page_id(), index, None, None);
            frame.state().parent = Some(parent.clone());
            new_root.bind(parent);
        }
    }

    root_sibling.set_linked();
    new_root.set_linked();
    tree.set_root(new_root.page_id());
    info!(
        "root {} split with sibling {}, tree grew under new root {}",
        root.page_id(),
        root_sibling.page_id(),
        new_root.page_id()
    );
    Ok(())
}

/// Unbinds `frame` and its ancestors one latch at a time. With `keep_root`
/// the latch of the topmost frame is kept and returned when its node is
/// still the root.
fn unwind(
    tree: &Tree,
    mut frame: FrameRef,
    keep_root: bool,
) -> LatchTreeResult<Option<NodeWriteGuard>> {
    loop {
        let mut node = latch_frame(tree.store(), &frame)?;
        node.unbind(&frame);
        match frame.parent() {
            Some(parent) => {
                drop(node);
                frame = parent;
            }
            None => {
                if keep_root && node.page_id() == tree.root_page_id() {
                    return Ok(Some(node));
                }
                return Ok(None);
            }
        }
    }
}

fn unwind_to_root(tree: &Tree, frame: FrameRef) -> LatchTreeResult<NodeWriteGuard> {
    match unwind(tree, frame, true)? {
        Some(root) => Ok(root),
        None => tree.latch_root(),
    }
}
