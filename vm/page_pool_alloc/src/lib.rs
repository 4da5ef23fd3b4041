// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! This module implements a page allocator handing out individual pages from
//! fixed ranges of the physical address space.
//!
//! Two kinds of pools exist. A [`PoolKind::Local`] pool backs ordinary buffers
//! owned by this domain. A [`PoolKind::Foreign`] pool holds frames that are not
//! in use by any local allocator (ballooned out) and are therefore eligible to
//! have a remote domain's granted pages mapped over them.

#![warn(missing_docs)]

use gntdef::PAGE_SIZE;
use parking_lot::Mutex;
use std::fmt::Debug;
use std::num::NonZeroUsize;
use std::ops::Range;
use std::sync::Arc;
use thiserror::Error;

/// Errors returned on allocation methods.
#[derive(Debug, Error)]
pub enum Error {
    /// Unable to allocate memory due to not enough free pages.
    #[error("unable to allocate {requested} pages with tag {tag}, {free} pages free")]
    PagePoolOutOfMemory {
        /// The number of pages requested.
        requested: usize,
        /// The number of pages free at the time of the request.
        free: u64,
        /// The tag of the allocation.
        tag: String,
    },
}

/// What kind of memory this pool hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// Pages backed by local memory.
    Local,
    /// Pages with no local backing, usable as targets for foreign mappings.
    Foreign,
}

#[derive(Debug, PartialEq, Eq)]
struct Slot {
    base_pfn: u64,
    size_pages: u64,
    state: SlotState,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum SlotState {
    Free,
    Allocated { tag: String },
    /// The page can never be handed out again, because something outside this
    /// domain may still reference it.
    Leaked { tag: String },
}

#[derive(Debug)]
struct PagePoolInner {
    /// The internal slots for the pool, representing page state.
    slots: Vec<Slot>,
    total_pages: u64,
    allocated_pages: u64,
    leaked_pages: u64,
}

impl PagePoolInner {
    fn free_pages(&self) -> u64 {
        self.total_pages - self.allocated_pages - self.leaked_pages
    }

    fn find_page(&mut self, pfn: u64) -> &mut Slot {
        self.slots
            .iter_mut()
            .find(|slot| {
                matches!(
                    slot.state,
                    SlotState::Allocated { .. } | SlotState::Leaked { .. }
                ) && slot.base_pfn == pfn
                    && slot.size_pages == 1
            })
            .expect("must find allocation")
    }

    /// Carves a single page out of the first free slot.
    fn take_page(&mut self, tag: &str) -> Option<u64> {
        let index = self
            .slots
            .iter()
            .position(|slot| matches!(slot.state, SlotState::Free))?;

        let slot = self.slots.swap_remove(index);
        let pfn = slot.base_pfn;
        self.slots.push(Slot {
            base_pfn: pfn,
            size_pages: 1,
            state: SlotState::Allocated { tag: tag.into() },
        });
        if slot.size_pages > 1 {
            self.slots.push(Slot {
                base_pfn: pfn + 1,
                size_pages: slot.size_pages - 1,
                state: SlotState::Free,
            });
        }
        self.allocated_pages += 1;
        Some(pfn)
    }
}

/// A handle for a single pool page. When dropped, the page is returned to the
/// pool.
pub struct PoolPage {
    inner: Arc<Mutex<PagePoolInner>>,
    pfn: u64,
    kind: PoolKind,
}

impl PoolPage {
    /// The page frame number of this page.
    pub fn pfn(&self) -> u64 {
        self.pfn
    }

    /// The physical address of this page.
    pub fn address(&self) -> u64 {
        self.pfn * PAGE_SIZE
    }

    /// The kind of pool this page came from.
    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    /// Permanently removes this page from the pool instead of freeing it.
    pub fn leak(self) {
        let mut inner = self.inner.lock();
        let slot = inner.find_page(self.pfn);
        let SlotState::Allocated { tag } = &slot.state else {
            unreachable!("page leaked twice")
        };
        tracing::warn!(pfn = self.pfn, tag = tag.as_str(), "leaking pool page");
        slot.state = SlotState::Leaked { tag: tag.clone() };
        inner.allocated_pages -= 1;
        inner.leaked_pages += 1;
    }
}

impl Debug for PoolPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolPage")
            .field("pfn", &format_args!("{:#x}", self.pfn))
            .field("kind", &self.kind)
            .finish()
    }
}

impl Drop for PoolPage {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();

        let slot = inner.find_page(self.pfn);
        if matches!(slot.state, SlotState::Leaked { .. }) {
            return;
        }
        slot.state = SlotState::Free;
        inner.allocated_pages -= 1;
    }
}

/// A page allocator over a fixed set of page frame ranges.
///
/// Pages are allocated via [`PagePoolAllocator`] from [`Self::allocator`].
pub struct PagePool {
    inner: Arc<Mutex<PagePoolInner>>,
    ranges: Vec<Range<u64>>,
    kind: PoolKind,
}

impl PagePool {
    /// Creates a pool of `kind` over the page frame number ranges `pfns`. The
    /// frames must not be used by any other entity.
    pub fn new(kind: PoolKind, pfns: &[Range<u64>]) -> Self {
        let slots: Vec<_> = pfns
            .iter()
            .filter(|range| !range.is_empty())
            .map(|range| Slot {
                base_pfn: range.start,
                size_pages: range.end - range.start,
                state: SlotState::Free,
            })
            .collect();
        let total_pages = slots.iter().map(|slot| slot.size_pages).sum();

        Self {
            inner: Arc::new(Mutex::new(PagePoolInner {
                slots,
                total_pages,
                allocated_pages: 0,
                leaked_pages: 0,
            })),
            ranges: pfns.to_vec(),
            kind,
        }
    }

    /// Creates an allocator instance that can be used to allocate pages.
    pub fn allocator(&self) -> PagePoolAllocator {
        PagePoolAllocator {
            inner: self.inner.clone(),
            kind: self.kind,
        }
    }

    /// The page frame ranges this pool was created with.
    pub fn ranges(&self) -> &[Range<u64>] {
        &self.ranges
    }

    /// The kind of pages this pool hands out.
    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    /// The number of pages currently handed out.
    pub fn allocated_pages(&self) -> u64 {
        self.inner.lock().allocated_pages
    }

    /// The number of pages that were leaked and will never be reused.
    pub fn leaked_pages(&self) -> u64 {
        self.inner.lock().leaked_pages
    }

    /// The number of pages available for allocation.
    pub fn free_pages(&self) -> u64 {
        self.inner.lock().free_pages()
    }

    /// Returns true if `pfn` falls inside one of this pool's ranges.
    pub fn contains(&self, pfn: u64) -> bool {
        self.ranges.iter().any(|range| range.contains(&pfn))
    }
}

/// A page allocator for a [`PagePool`].
///
/// Pages are allocated via [`Self::alloc_pages`] and freed by dropping the
/// returned handles.
#[derive(Clone)]
pub struct PagePoolAllocator {
    inner: Arc<Mutex<PagePoolInner>>,
    kind: PoolKind,
}

impl PagePoolAllocator {
    /// Allocates `count` pages with the given tag. The pages need not be
    /// physically contiguous.
    ///
    /// Either all pages are allocated or none are.
    pub fn alloc_pages(&self, count: NonZeroUsize, tag: &str) -> Result<Vec<PoolPage>, Error> {
        let mut inner = self.inner.lock();
        let free = inner.free_pages();
        if free < count.get() as u64 {
            tracing::debug!(
                requested = count.get(),
                free,
                tag,
                kind = ?self.kind,
                "page pool exhausted"
            );
            return Err(Error::PagePoolOutOfMemory {
                requested: count.get(),
                free,
                tag: tag.into(),
            });
        }

        let mut pages = Vec::with_capacity(count.get());
        for _ in 0..count.get() {
            let pfn = inner
                .take_page(tag)
                .expect("free page count was checked");
            pages.push(PoolPage {
                inner: self.inner.clone(),
                pfn,
                kind: self.kind,
            });
        }
        Ok(pages)
    }

    /// The kind of pages this allocator hands out.
    pub fn kind(&self) -> PoolKind {
        self.kind
    }
}
