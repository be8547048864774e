use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use log::info;

use crate::buffer::{AtomicPageId, NodeReadGuard, NodeStore, NodeWriteGuard, PageId};
use crate::config::TreeConfig;
use crate::error::{LatchTreeError, LatchTreeResult};
use crate::storage::cursor::Cursor;
use crate::storage::node::{NodeBody, SiblingDirection};

/// Anything cursors can be opened on.
pub trait View {
    fn new_cursor(&self) -> Cursor;
}

/// A B+tree whose root is always an internal node, so that growing the tree
/// is a single swap of the root page id.
#[derive(Debug)]
pub struct Tree {
    store: NodeStore,
    root: AtomicPageId,
}

impl View for Arc<Tree> {
    fn new_cursor(&self) -> Cursor {
        Cursor::new(Arc::clone(self))
    }
}

impl Tree {
    pub fn new(config: TreeConfig) -> LatchTreeResult<Self> {
        let store = NodeStore::new(config)?;
        let mut leaf = store.allocate_leaf()?;
        leaf.set_linked();
        let mut root = store.allocate_internal(Some(leaf.page_id()))?;
        root.set_linked();
        let root_id = root.page_id();
        drop(root);
        drop(leaf);
        info!(
            "created tree with root {} and {} byte pages",
            root_id, config.page_size
        );
        Ok(Self {
            store,
            root: AtomicPageId::new(root_id),
        })
    }

    pub fn config(&self) -> &TreeConfig {
        self.store.config()
    }

    pub fn store(&self) -> &NodeStore {
        &self.store
    }

    pub fn root_page_id(&self) -> PageId {
        self.root.load(Ordering::Acquire)
    }

    /// Only called while holding the exclusive latch of the current root.
    pub(crate) fn set_root(&self, page_id: PageId) {
        self.root.store(page_id, Ordering::Release);
    }

    /// Latches the root exclusively. The root may be replaced between
    /// reading its id and acquiring the latch, in which case the new root is
    /// tried.
    pub(crate) fn latch_root(&self) -> LatchTreeResult<NodeWriteGuard> {
        loop {
            let root_id = self.root_page_id();
            let guard = self.store.fetch_write(root_id)?;
            if self.root_page_id() == root_id {
                return Ok(guard);
            }
        }
    }

    fn latch_root_shared(&self) -> LatchTreeResult<NodeReadGuard> {
        loop {
            let root_id = self.root_page_id();
            let guard = self.store.fetch_read(root_id)?;
            if self.root_page_id() == root_id {
                return Ok(guard);
            }
        }
    }

    pub fn insert(
        self: &Arc<Self>,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> LatchTreeResult<()> {
        let mut cursor = self.new_cursor();
        cursor.find(key)?;
        cursor.store(value)
    }

    pub fn get(self: &Arc<Self>, key: impl Into<Bytes>) -> LatchTreeResult<Option<Bytes>> {
        let mut cursor = self.new_cursor();
        cursor.find(key)?;
        Ok(cursor.value().cloned())
    }

    /// Number of levels from the root down to the leaves.
    pub fn height(&self) -> LatchTreeResult<usize> {
        let mut node = self.latch_root_shared()?;
        let mut height = 1;
        while let Some(child_id) = node.child_at(0) {
            let child = self.store.fetch_read(child_id)?;
            node = child;
            height += 1;
        }
        Ok(height)
    }

    /// All entries in key order, including those held by split siblings the
    /// parents do not reference yet.
    pub fn entries(&self) -> LatchTreeResult<Vec<(Bytes, Bytes)>> {
        let root = self.latch_root_shared()?;
        let mut entries = Vec::new();
        self.collect_entries(&root, &mut entries)?;
        Ok(entries)
    }

    fn collect_entries(
        &self,
        node: &NodeReadGuard,
        out: &mut Vec<(Bytes, Bytes)>,
    ) -> LatchTreeResult<()> {
        let sibling = match node.split() {
            Some(split) => Some((split.direction, self.store.fetch_read(split.sibling)?)),
            None => None,
        };
        if let Some((SiblingDirection::Left, sibling)) = &sibling {
            self.collect_entries(sibling, out)?;
        }
        match node.body() {
            NodeBody::Leaf { entries } => out.extend(entries.iter().cloned()),
            NodeBody::Internal { children, .. } => {
                for child_id in children {
                    let child = self.store.fetch_read(*child_id)?;
                    self.collect_entries(&child, out)?;
                }
            }
        }
        if let Some((SiblingDirection::Right, sibling)) = &sibling {
            self.collect_entries(sibling, out)?;
        }
        Ok(())
    }

    /// Walks the whole tree and verifies ordering, key ranges, byte
    /// accounting, uniform leaf depth and the bindings of cursor frames.
    pub fn check_invariants(&self) -> LatchTreeResult<()> {
        let root = self.latch_root_shared()?;
        if root.is_leaf() || root.has_split() {
            return Err(violation(format!(
                "root {} must be an internal node without a pending split",
                root.page_id()
            )));
        }
        let mut leaf_depth = None;
        self.check_node(&root, None, None, 1, &mut leaf_depth)
    }

    fn check_node(
        &self,
        node: &NodeReadGuard,
        lower: Option<&Bytes>,
        upper: Option<&Bytes>,
        depth: usize,
        leaf_depth: &mut Option<usize>,
    ) -> LatchTreeResult<()> {
        let Some(split) = node.split() else {
            return self.check_contents(node, lower, upper, depth, leaf_depth);
        };
        let sibling = self.store.fetch_read(split.sibling)?;
        if sibling.has_split() || sibling.is_leaf() != node.is_leaf() {
            return Err(violation(format!(
                "split sibling {} of node {} is malformed",
                sibling.page_id(),
                node.page_id()
            )));
        }
        let (low, high) = match split.direction {
            SiblingDirection::Right => (node, &sibling),
            SiblingDirection::Left => (&sibling, node),
        };
        let separator = match &split.migrated_key {
            Some(key) => key.clone(),
            None => high.first_key().cloned().ok_or_else(|| {
                violation(format!("split half {} is empty", high.page_id()))
            })?,
        };
        self.check_contents(low, lower, Some(&separator), depth, leaf_depth)?;
        self.check_contents(high, Some(&separator), upper, depth, leaf_depth)
    }

    fn check_contents(
        &self,
        node: &NodeReadGuard,
        lower: Option<&Bytes>,
        upper: Option<&Bytes>,
        depth: usize,
        leaf_depth: &mut Option<usize>,
    ) -> LatchTreeResult<()> {
        let page_id = node.page_id();
        if !node.is_sorted() {
            return Err(violation(format!("node {} is not sorted", page_id)));
        }
        if node.used_bytes() > node.capacity() {
            return Err(violation(format!(
                "node {} holds {} bytes over its {} byte capacity",
                page_id,
                node.used_bytes(),
                node.capacity()
            )));
        }
        let in_range = |key: &Bytes| -> bool {
            lower.map_or(true, |low| key >= low) && upper.map_or(true, |high| key < high)
        };

        for frame in node.visitors() {
            let state = frame.snapshot();
            let limit = match (node.is_leaf(), state.not_found_key.is_some()) {
                (true, true) => node.size() + 1,
                _ => node.size(),
            };
            if state.node != page_id || state.position >= limit {
                return Err(violation(format!(
                    "frame {} bound to node {} points at {}:{}",
                    frame.id(),
                    page_id,
                    state.node,
                    state.position
                )));
            }
        }

        match node.body() {
            NodeBody::Leaf { entries } => {
                let used: usize = entries.iter().map(|(k, v)| k.len() + v.len()).sum();
                if used != node.used_bytes() {
                    return Err(violation(format!(
                        "leaf {} accounts {} bytes but holds {}",
                        page_id,
                        node.used_bytes(),
                        used
                    )));
                }
                if let Some((key, _)) = entries.iter().find(|(k, _)| !in_range(k)) {
                    return Err(violation(format!(
                        "leaf {} holds {:?} outside its key range",
                        page_id, key
                    )));
                }
                match *leaf_depth {
                    None => *leaf_depth = Some(depth),
                    Some(expected) if expected != depth => {
                        return Err(violation(format!(
                            "leaf {} at depth {} but other leaves at {}",
                            page_id, depth, expected
                        )));
                    }
                    Some(_) => {}
                }
                Ok(())
            }
            NodeBody::Internal { keys, children } => {
                if children.len() != keys.len() + 1 {
                    return Err(violation(format!(
                        "internal {} has {} keys and {} children",
                        page_id,
                        keys.len(),
                        children.len()
                    )));
                }
                if let Some(key) = keys.iter().find(|k| !in_range(*k)) {
                    return Err(violation(format!(
                        "internal {} holds {:?} outside its key range",
                        page_id, key
                    )));
                }
                for (i, child_id) in children.iter().enumerate() {
                    let child_lower = if i == 0 { lower } else { keys.get(i - 1) };
                    let child_upper = if i == keys.len() { upper } else { keys.get(i) };
                    let child = self.store.fetch_read(*child_id)?;
                    self.check_node(&child, child_lower, child_upper, depth + 1, leaf_depth)?;
                }
                Ok(())
            }
        }
    }
}

fn violation(message: String) -> LatchTreeError {
    LatchTreeError::Internal(format!("tree invariant violated: {}", message))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use super::{Tree, View};
    use crate::config::TreeConfig;
    use crate::error::LatchTreeError;

    #[test]
    fn test_new_tree_shape() {
        let tree = Tree::new(TreeConfig::default()).unwrap();
        let root = tree.store().fetch_read(tree.root_page_id()).unwrap();
        assert!(!root.is_leaf());
        assert_eq!(root.size(), 1);
        assert!(root.is_linked());
        drop(root);
        assert_eq!(tree.height().unwrap(), 2);
        assert_eq!(tree.store().node_count(), 2);
        assert!(tree.entries().unwrap().is_empty());
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = Tree::new(TreeConfig::default().page_size(100)).unwrap_err();
        assert!(matches!(err, LatchTreeError::InvalidConfig(_)));
    }

    #[test]
    fn test_insert_get_entries() {
        let tree = Arc::new(Tree::new(TreeConfig::default().page_size(512)).unwrap());
        for i in (0..500).rev() {
            tree.insert(format!("k{:03}", i), format!("v{}", i)).unwrap();
        }
        assert_eq!(tree.get("k123").unwrap(), Some(Bytes::from("v123")));
        assert_eq!(tree.get("k999").unwrap(), None);

        let entries = tree.entries().unwrap();
        assert_eq!(entries.len(), 500);
        for (i, (key, value)) in entries.iter().enumerate() {
            assert_eq!(key, &Bytes::from(format!("k{:03}", i)));
            assert_eq!(value, &Bytes::from(format!("v{}", i)));
        }
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_dirty_pages_track_inserts() {
        let tree = Arc::new(Tree::new(TreeConfig::default()).unwrap());
        tree.store().take_dirty();
        let mut cursor = tree.new_cursor();
        cursor.find("a").unwrap();
        cursor.store("1").unwrap();
        let leaf = cursor.frames()[1].0;
        assert_eq!(tree.store().take_dirty(), vec![leaf]);
    }
}
