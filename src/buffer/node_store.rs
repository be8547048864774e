use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use log::{debug, warn};
use parking_lot::Mutex;

use crate::buffer::latch::{ExclusiveGuard, Latch, SharedGuard};
use crate::buffer::{AtomicPageId, PageId, INVALID_PAGE_ID};
use crate::config::TreeConfig;
use crate::error::{LatchTreeError, LatchTreeResult};
use crate::storage::node::Node;

pub type NodeLatch = Latch<Node>;
pub type NodeReadGuard = SharedGuard<Node>;
pub type NodeWriteGuard = ExclusiveGuard<Node>;

/// Recency ordered set of dirty pages.
///
/// Re-dirtying a page moves it to the tail. Stale queue entries are skipped
/// when draining and compacted away once they dominate the queue.
#[derive(Debug, Default)]
struct DirtyList {
    seq: u64,
    latest: HashMap<PageId, u64>,
    order: VecDeque<(PageId, u64)>,
}

impl DirtyList {
    fn touch(&mut self, page_id: PageId) {
        if let Some(&(last, seq)) = self.order.back() {
            if last == page_id && self.latest.get(&page_id) == Some(&seq) {
                return;
            }
        }
        self.seq += 1;
        self.latest.insert(page_id, self.seq);
        self.order.push_back((page_id, self.seq));
        if self.order.len() > 2 * self.latest.len() + 64 {
            let latest = &self.latest;
            self.order
                .retain(|(page_id, seq)| latest.get(page_id) == Some(seq));
        }
    }

    fn snapshot(&self) -> Vec<PageId> {
        self.order
            .iter()
            .filter(|(page_id, seq)| self.latest.get(page_id) == Some(seq))
            .map(|(page_id, _)| *page_id)
            .collect()
    }

    fn drain(&mut self) -> Vec<PageId> {
        let pages = self.snapshot();
        self.order.clear();
        self.latest.clear();
        pages
    }
}

/// Owns every node of a tree, keyed by page id.
#[derive(Debug)]
pub struct NodeStore {
    config: TreeConfig,
    pages: DashMap<PageId, NodeLatch>,
    next_page_id: AtomicPageId,
    dirty: Mutex<DirtyList>,
    over_budget_warned: AtomicBool,
}

impl NodeStore {
    pub fn new(config: TreeConfig) -> LatchTreeResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            pages: DashMap::new(),
            next_page_id: AtomicPageId::new(INVALID_PAGE_ID + 1),
            dirty: Mutex::new(DirtyList::default()),
            over_budget_warned: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    /// Places a new empty leaf and returns it already latched and dirty.
    pub fn allocate_leaf(&self) -> LatchTreeResult<NodeWriteGuard> {
        let page_id = self.next_page_id()?;
        self.install(Node::new_leaf(page_id, self.config.page_size))
    }

    /// Places a new internal node. Without a leftmost child the node is an
    /// empty split target that will be filled by a split.
    pub fn allocate_internal(&self, leftmost: Option<PageId>) -> LatchTreeResult<NodeWriteGuard> {
        let page_id = self.next_page_id()?;
        self.install(Node::new_internal(
            page_id,
            self.config.page_size,
            leftmost,
        ))
    }

    pub fn fetch(&self, page_id: PageId) -> LatchTreeResult<NodeLatch> {
        self.pages
            .get(&page_id)
            .map(|entry| entry.value().clone())
            .ok_or(LatchTreeError::PageNotFound(page_id))
    }

    pub fn fetch_read(&self, page_id: PageId) -> LatchTreeResult<NodeReadGuard> {
        Ok(self.fetch(page_id)?.acquire_shared())
    }

    pub fn fetch_write(&self, page_id: PageId) -> LatchTreeResult<NodeWriteGuard> {
        Ok(self.fetch(page_id)?.acquire_exclusive())
    }

    /// Records a modification of `page_id`, moving it to the tail of the
    /// dirty list.
    pub fn dirty(&self, page_id: PageId) {
        self.dirty.lock().touch(page_id);
    }

    pub fn dirty_pages(&self) -> Vec<PageId> {
        self.dirty.lock().snapshot()
    }

    /// Drains the dirty list, oldest modification first.
    pub fn take_dirty(&self) -> Vec<PageId> {
        self.dirty.lock().drain()
    }

    pub fn node_count(&self) -> usize {
        self.pages.len()
    }

    pub fn cached_bytes(&self) -> usize {
        self.pages.len() * self.config.page_size
    }

    pub fn over_budget(&self) -> bool {
        self.cached_bytes() > self.config.max_cache_bytes
    }

    fn next_page_id(&self) -> LatchTreeResult<PageId> {
        let page_id = self.next_page_id.fetch_add(1, Ordering::Relaxed);
        if page_id == INVALID_PAGE_ID {
            return Err(LatchTreeError::Internal(
                "page id space exhausted".to_string(),
            ));
        }
        Ok(page_id)
    }

    fn install(&self, node: Node) -> LatchTreeResult<NodeWriteGuard> {
        let page_id = node.page_id();
        let latch = Latch::new(page_id, node);
        // latched before it becomes visible to other threads
        let guard = latch.acquire_exclusive();
        if self.pages.insert(page_id, latch).is_some() {
            return Err(LatchTreeError::Internal(format!(
                "page {} allocated twice",
                page_id
            )));
        }
        self.dirty(page_id);
        debug!(
            "allocated {} node {}",
            if guard.is_leaf() { "leaf" } else { "internal" },
            page_id
        );
        if self.over_budget() && !self.over_budget_warned.swap(true, Ordering::Relaxed) {
            warn!(
                "node store holds {} bytes, above the {} byte budget",
                self.cached_bytes(),
                self.config.max_cache_bytes
            );
        }
        Ok(guard)
    }
}

#[cfg(test)]
mod tests {
    use super::NodeStore;
    use crate::config::TreeConfig;
    use crate::error::LatchTreeError;

    fn store() -> NodeStore {
        NodeStore::new(TreeConfig::default().page_size(512)).unwrap()
    }

    #[test]
    fn test_allocate_returns_latched_nodes() {
        let store = store();
        let leaf = store.allocate_leaf().unwrap();
        let leaf_id = leaf.page_id();
        assert!(leaf.is_leaf());
        assert_eq!(leaf.capacity(), 512);
        assert!(store.fetch(leaf_id).unwrap().try_acquire_shared().is_none());
        drop(leaf);

        let internal = store.allocate_internal(Some(leaf_id)).unwrap();
        assert!(!internal.is_leaf());
        assert_eq!(internal.children(), Some(&[leaf_id][..]));
        assert!(internal.page_id() > leaf_id);
        drop(internal);

        assert_eq!(store.node_count(), 2);
        assert_eq!(store.cached_bytes(), 1024);
        assert!(store.fetch_read(leaf_id).unwrap().is_leaf());
    }

    #[test]
    fn test_fetch_missing_page() {
        let store = store();
        assert!(matches!(
            store.fetch(42),
            Err(LatchTreeError::PageNotFound(42))
        ));
    }

    #[test]
    fn test_dirty_list_moves_to_tail() {
        let store = store();
        let a = store.allocate_leaf().unwrap().page_id();
        let b = store.allocate_leaf().unwrap().page_id();
        let c = store.allocate_leaf().unwrap().page_id();
        assert_eq!(store.dirty_pages(), vec![a, b, c]);

        store.dirty(a);
        store.dirty(a);
        assert_eq!(store.dirty_pages(), vec![b, c, a]);

        assert_eq!(store.take_dirty(), vec![b, c, a]);
        assert!(store.dirty_pages().is_empty());

        store.dirty(c);
        assert_eq!(store.take_dirty(), vec![c]);
    }

    #[test]
    fn test_dirty_list_compaction_keeps_order() {
        let store = store();
        let a = store.allocate_leaf().unwrap().page_id();
        let b = store.allocate_leaf().unwrap().page_id();
        for _ in 0..200 {
            store.dirty(a);
            store.dirty(b);
        }
        store.dirty(a);
        assert_eq!(store.dirty_pages(), vec![b, a]);
    }

    #[test]
    fn test_over_budget() {
        let store = NodeStore::new(
            TreeConfig::default()
                .page_size(512)
                .min_cache_size(0)
                .max_cache_size(1024),
        )
        .unwrap();
        store.allocate_leaf().unwrap();
        store.allocate_leaf().unwrap();
        assert!(!store.over_budget());
        store.allocate_leaf().unwrap();
        assert!(store.over_budget());
    }

    #[test]
    fn test_rejects_invalid_config() {
        assert!(matches!(
            NodeStore::new(TreeConfig::default().page_size(1000)),
            Err(LatchTreeError::InvalidConfig(_))
        ));
    }
}
