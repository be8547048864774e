pub mod latch;
pub mod node_store;

use std::sync::atomic::AtomicU32;

pub use latch::{ExclusiveGuard, Latch, SharedGuard};
pub use node_store::{NodeLatch, NodeReadGuard, NodeStore, NodeWriteGuard};

pub type PageId = u32;
pub type AtomicPageId = AtomicU32;

pub const INVALID_PAGE_ID: PageId = 0;
