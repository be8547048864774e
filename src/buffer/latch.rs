use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};

use crate::buffer::PageId;

/// Reader/writer latch guarding one node slot.
///
/// Guards are owned (they keep the underlying lock alive through an `Arc`),
/// so a traversal can hand a guard from one stack frame to another and keep
/// two levels latched at once while it crabs down the tree.
pub struct Latch<T> {
    page_id: PageId,
    lock: Arc<RwLock<T>>,
}

impl<T> Clone for Latch<T> {
    fn clone(&self) -> Self {
        Self {
            page_id: self.page_id,
            lock: Arc::clone(&self.lock),
        }
    }
}

impl<T> fmt::Debug for Latch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Latch")
            .field("page_id", &self.page_id)
            .field("locked", &self.lock.is_locked())
            .finish()
    }
}

impl<T> Latch<T> {
    pub fn new(page_id: PageId, value: T) -> Self {
        Self {
            page_id,
            lock: Arc::new(RwLock::new(value)),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn acquire_shared(&self) -> SharedGuard<T> {
        SharedGuard {
            page_id: self.page_id,
            guard: self.lock.read_arc(),
        }
    }

    pub fn acquire_exclusive(&self) -> ExclusiveGuard<T> {
        ExclusiveGuard {
            page_id: self.page_id,
            guard: self.lock.write_arc(),
        }
    }

    #[cfg(test)]
    pub(crate) fn try_acquire_shared(&self) -> Option<SharedGuard<T>> {
        self.lock.try_read_arc().map(|guard| SharedGuard {
            page_id: self.page_id,
            guard,
        })
    }

    pub fn try_acquire_exclusive(&self) -> Option<ExclusiveGuard<T>> {
        self.lock.try_write_arc().map(|guard| ExclusiveGuard {
            page_id: self.page_id,
            guard,
        })
    }

    #[cfg(test)]
    pub(crate) fn is_latched(&self) -> bool {
        self.lock.is_locked()
    }

    #[cfg(test)]
    pub(crate) fn is_exclusive(&self) -> bool {
        self.lock.is_locked_exclusive()
    }
}

pub struct SharedGuard<T> {
    page_id: PageId,
    guard: ArcRwLockReadGuard<RawRwLock, T>,
}

impl<T> SharedGuard<T> {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn release(self) {}
}

impl<T> Deref for SharedGuard<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T> fmt::Debug for SharedGuard<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedGuard")
            .field("page_id", &self.page_id)
            .finish()
    }
}

pub struct ExclusiveGuard<T> {
    page_id: PageId,
    guard: ArcRwLockWriteGuard<RawRwLock, T>,
}

impl<T> ExclusiveGuard<T> {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn release(self) {}
}

impl<T> Deref for ExclusiveGuard<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T> DerefMut for ExclusiveGuard<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl<T> fmt::Debug for ExclusiveGuard<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExclusiveGuard")
            .field("page_id", &self.page_id)
            .finish()
    }
}
