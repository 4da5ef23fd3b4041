// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The shared buffer: a page set with an optional grant relationship to a
//! remote domain, kept alive by an explicit reference count.

use crate::exporter;
use crate::exporter::ExportedGrants;
use crate::importer;
use crate::importer::ImportedGrants;
use crate::wait::WaitHandle;
use crate::wait::WaitRegistry;
use crate::Error;
use gntdef::DomainId;
use gntdef::GrantRef;
use page_pool_alloc::PoolPage;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;

/// The grant relationship of a [`SharedBuffer`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    /// Local pages with no grant relationship.
    None,
    /// Backed by pages granted by a remote domain.
    Imported,
    /// Local pages granted to a remote domain.
    Exported,
}

pub(crate) enum Grants {
    None,
    Imported(ImportedGrants),
    Exported(ExportedGrants),
}

pub(crate) struct BufferState {
    pub pages: Vec<PoolPage>,
    pub grants: Grants,
}

pub(crate) struct BufferInner {
    refcount: AtomicUsize,
    /// Zero until a wait handle is assigned. Only written with the wait
    /// registry's lock held.
    wait_handle: AtomicU64,
    size: u64,
    state: Mutex<BufferState>,
    registry: Arc<WaitRegistry>,
}

impl BufferInner {
    pub(crate) fn wait_handle(&self) -> Option<WaitHandle> {
        WaitHandle::from_raw(self.wait_handle.load(Ordering::Acquire))
    }
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if matches!(state.grants, Grants::None) {
            return;
        }
        // The last pointer went away without the reference count reaching
        // zero. Nothing reversed the grants, so the pages cannot go back to
        // the pool.
        tracing::warn!(
            refcount = self.refcount.load(Ordering::Relaxed),
            pages = state.pages.len(),
            "shared buffer dropped with live grants, leaking pages"
        );
        for page in state.pages.drain(..) {
            page.leak();
        }
    }
}

/// A buffer shared, or shareable, with a remote domain.
///
/// Cloning a `SharedBuffer` copies the pointer but does not take a reference;
/// references are counted explicitly with [`Self::add_ref`] and
/// [`Self::release`]. The caller whose release drops the count to zero
/// reverses the buffer's grants, wakes anyone waiting on its wait handle, and
/// returns its pages to their pools.
#[derive(Clone)]
pub struct SharedBuffer {
    inner: Arc<BufferInner>,
}

impl std::fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("direction", &self.direction())
            .field("size", &self.inner.size)
            .field("refcount", &self.refcount())
            .field("wait_handle", &self.wait_handle())
            .finish()
    }
}

impl SharedBuffer {
    pub(crate) fn new(
        pages: Vec<PoolPage>,
        grants: Grants,
        size: u64,
        registry: Arc<WaitRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                refcount: AtomicUsize::new(1),
                wait_handle: AtomicU64::new(0),
                size,
                state: Mutex::new(BufferState { pages, grants }),
                registry,
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<BufferInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<BufferInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, BufferState> {
        self.inner.state.lock()
    }

    pub(crate) fn registry(&self) -> &Arc<WaitRegistry> {
        &self.inner.registry
    }

    pub(crate) fn set_wait_handle(&self, handle: WaitHandle) {
        self.inner
            .wait_handle
            .store(handle.as_raw(), Ordering::Release);
    }

    /// The size of the buffer in bytes.
    pub fn size(&self) -> u64 {
        self.inner.size
    }

    /// The grant relationship of the buffer.
    pub fn direction(&self) -> Direction {
        match self.state().grants {
            Grants::None => Direction::None,
            Grants::Imported(_) => Direction::Imported,
            Grants::Exported(_) => Direction::Exported,
        }
    }

    /// The remote domain the buffer is shared with, if any.
    pub fn remote_domain(&self) -> Option<DomainId> {
        match &self.state().grants {
            Grants::None => None,
            Grants::Imported(imported) => Some(imported.remote_domain()),
            Grants::Exported(exported) => Some(exported.remote_domain()),
        }
    }

    /// The grant references backing (imported) or exposing (exported) the
    /// buffer, in page order.
    pub fn grant_refs(&self) -> Vec<GrantRef> {
        match &self.state().grants {
            Grants::None => Vec::new(),
            Grants::Imported(imported) => imported.refs().to_vec(),
            Grants::Exported(exported) => exported.refs().to_vec(),
        }
    }

    /// The page frame numbers of the buffer's local pages, in order.
    ///
    /// Empty once the buffer has been released.
    pub fn pfns(&self) -> Vec<u64> {
        self.state().pages.iter().map(PoolPage::pfn).collect()
    }

    /// The current reference count.
    pub fn refcount(&self) -> usize {
        self.inner.refcount.load(Ordering::Acquire)
    }

    /// The wait handle, if one has been assigned.
    pub fn wait_handle(&self) -> Option<WaitHandle> {
        self.inner.wait_handle()
    }

    /// Takes an additional reference.
    ///
    /// Panics if the buffer has already been released.
    pub fn add_ref(&self) {
        assert!(self.try_add_ref(), "add_ref on a released shared buffer");
    }

    /// Takes an additional reference unless the count already reached zero.
    pub(crate) fn try_add_ref(&self) -> bool {
        self.inner
            .refcount
            .fetch_update(Ordering::Acquire, Ordering::Relaxed, |n| {
                (n != 0).then(|| n + 1)
            })
            .is_ok()
    }

    /// Drops a reference. Dropping the last one tears the buffer down.
    pub fn release(&self) {
        let prev = self
            .inner
            .refcount
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |n| n.checked_sub(1))
            .expect("shared buffer reference count underflow");
        if prev == 1 {
            self.teardown();
        }
    }

    fn teardown(&self) {
        let BufferState { pages, grants } = {
            let mut state = self.state();
            BufferState {
                pages: std::mem::take(&mut state.pages),
                grants: std::mem::replace(&mut state.grants, Grants::None),
            }
        };
        let page_count = pages.len();

        let reclaim = match grants {
            Grants::None => pages,
            Grants::Imported(imported) => {
                let remote = imported.remote_domain();
                if let Err(err) = importer::unmap(imported, &pages) {
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        %remote,
                        "failed to fully unmap imported buffer"
                    );
                }
                // The local frames are unreachable either way.
                pages
            }
            Grants::Exported(exported) => {
                let remote = exported.remote_domain();
                match exporter::revoke(exported) {
                    Ok(()) => pages,
                    Err(Error::RevokeRefused { pages: refused, .. }) => {
                        tracing::warn!(
                            %remote,
                            refused = refused.len(),
                            "remote domain still maps exported pages"
                        );
                        // Pages the remote can still reach must never be
                        // handed out again.
                        let mut reclaim = Vec::with_capacity(pages.len());
                        for (index, page) in pages.into_iter().enumerate() {
                            if refused.contains(&index) {
                                page.leak();
                            } else {
                                reclaim.push(page);
                            }
                        }
                        reclaim
                    }
                    Err(err) => {
                        tracing::warn!(
                            error = &err as &dyn std::error::Error,
                            %remote,
                            "failed to revoke exported buffer"
                        );
                        pages
                    }
                }
            }
        };

        // Waiters learn of the release only once the memory is reclaimed.
        drop(reclaim);
        let wait_handle = self.inner.registry.notify_released(&self.inner);

        tracing::debug!(
            pages = page_count,
            wait_handle = wait_handle.map(WaitHandle::as_raw),
            "shared buffer released"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use page_pool_alloc::PagePool;
    use page_pool_alloc::PoolKind;
    use std::sync::Barrier;
    use test_with_tracing::test;

    fn local_buffer(pool: &PagePool, pages: usize) -> SharedBuffer {
        let pages = pool
            .allocator()
            .alloc_pages(pages.try_into().unwrap(), "test")
            .unwrap();
        let size = pages.len() as u64 * gntdef::PAGE_SIZE;
        SharedBuffer::new(pages, Grants::None, size, Arc::new(WaitRegistry::new()))
    }

    #[test]
    fn release_returns_pages() {
        let pool = PagePool::new(PoolKind::Local, &[0..8]);
        let buffer = local_buffer(&pool, 3);
        assert_eq!(buffer.refcount(), 1);
        assert_eq!(buffer.direction(), Direction::None);
        assert_eq!(buffer.pfns().len(), 3);

        buffer.add_ref();
        buffer.release();
        assert_eq!(pool.allocated_pages(), 3);

        buffer.release();
        assert_eq!(buffer.refcount(), 0);
        assert_eq!(pool.allocated_pages(), 0);
        assert!(buffer.pfns().is_empty());
        assert!(!buffer.try_add_ref());
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn release_past_zero_panics() {
        let pool = PagePool::new(PoolKind::Local, &[0..1]);
        let buffer = local_buffer(&pool, 1);
        buffer.release();
        buffer.release();
    }

    #[test]
    fn concurrent_release_tears_down_once() {
        const THREADS: usize = 8;
        const REFS_PER_THREAD: usize = 64;

        let pool = PagePool::new(PoolKind::Local, &[0..4]);
        let buffer = local_buffer(&pool, 4);
        for _ in 1..THREADS * REFS_PER_THREAD {
            buffer.add_ref();
        }

        let barrier = Barrier::new(THREADS);
        std::thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    barrier.wait();
                    for _ in 0..REFS_PER_THREAD {
                        buffer.release();
                    }
                });
            }
        });

        // Any extra decrement would have hit the underflow check.
        assert_eq!(buffer.refcount(), 0);
        assert_eq!(pool.allocated_pages(), 0);
    }
}
