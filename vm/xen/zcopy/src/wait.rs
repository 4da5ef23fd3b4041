// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wait handles let a caller block until a shared buffer is released.
//!
//! A handle is an opaque nonzero 64-bit value. The low 32 bits index a slot in
//! the registry and the high 32 bits hold the slot's generation, so a handle
//! whose buffer was released and whose slot was reused later looks up as
//! absent instead of aliasing the new buffer.

use crate::buffer::BufferInner;
use crate::buffer::SharedBuffer;
use parking_lot::Condvar;
use parking_lot::Mutex;
use std::num::NonZeroU64;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;
use std::time::Instant;
use thiserror::Error;

/// An opaque token naming a shared buffer for release notification.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct WaitHandle(NonZeroU64);

impl WaitHandle {
    fn new(index: u32, generation: u32) -> Self {
        let raw = (u64::from(generation) << 32) | u64::from(index);
        Self(NonZeroU64::new(raw).expect("generation is never zero"))
    }

    /// The raw value handed to callers.
    pub fn as_raw(self) -> u64 {
        self.0.get()
    }

    /// Rebuilds a handle from its raw value. Zero is never a valid handle.
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    fn index(self) -> usize {
        self.0.get() as u32 as usize
    }

    fn generation(self) -> u32 {
        (self.0.get() >> 32) as u32
    }
}

impl std::fmt::Display for WaitHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0.get())
    }
}

/// Errors returned by [`WaitRegistry`].
#[derive(Debug, Error)]
pub enum WaitError {
    /// The buffer was still alive when the timeout expired.
    #[error("timed out waiting for buffer with wait handle {0} to be released")]
    TimedOut(WaitHandle),
    /// The buffer was released before a handle could be assigned.
    #[error("buffer already released")]
    Released,
    /// Every handle slot names a live buffer.
    #[error("all {0} wait handles are in use")]
    HandlesExhausted(usize),
}

/// Slot indexes are the low 32 bits of a handle.
const MAX_SLOTS: usize = 1 << 32;

struct Slot {
    generation: u32,
    buffer: Option<Weak<BufferInner>>,
}

struct Waiter {
    id: u64,
    target: Weak<BufferInner>,
    done: bool,
}

struct RegistryState {
    max_slots: usize,
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
    waiters: Vec<Waiter>,
    next_waiter_id: u64,
}

impl RegistryState {
    fn lookup(&self, handle: WaitHandle) -> Option<&Weak<BufferInner>> {
        let slot = self.slots.get(handle.index())?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.buffer.as_ref()
    }

    fn insert(&mut self, buffer: Weak<BufferInner>) -> Option<WaitHandle> {
        if let Some(index) = self.free_slots.pop() {
            let slot = &mut self.slots[index as usize];
            slot.buffer = Some(buffer);
            return Some(WaitHandle::new(index, slot.generation));
        }
        if self.slots.len() >= self.max_slots {
            return None;
        }
        let index = u32::try_from(self.slots.len()).ok()?;
        self.slots.push(Slot {
            generation: 1,
            buffer: Some(buffer),
        });
        Some(WaitHandle::new(index, 1))
    }

    fn remove(&mut self, handle: WaitHandle) {
        let Some(slot) = self.slots.get_mut(handle.index()) else {
            return;
        };
        if slot.generation != handle.generation() || slot.buffer.is_none() {
            return;
        }
        slot.buffer = None;
        slot.generation = match slot.generation.wrapping_add(1) {
            0 => 1,
            n => n,
        };
        self.free_slots.push(handle.index() as u32);
    }

    fn remove_waiter(&mut self, id: u64) -> Option<Waiter> {
        let index = self.waiters.iter().position(|w| w.id == id)?;
        Some(self.waiters.swap_remove(index))
    }
}

/// Maps wait handles to live shared buffers and wakes waiters when those
/// buffers are released.
///
/// Notification and timeout handling are serialized by a single lock, so a
/// waiter either observes the release or times out, never both.
pub struct WaitRegistry {
    state: Mutex<RegistryState>,
    released: Condvar,
}

impl WaitRegistry {
    /// Returns a new, empty registry.
    pub fn new() -> Self {
        Self::with_max_handles(MAX_SLOTS)
    }

    /// Returns a new, empty registry naming at most `max_handles` live
    /// buffers at once.
    pub fn with_max_handles(max_handles: usize) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                max_slots: max_handles.min(MAX_SLOTS),
                slots: Vec::new(),
                free_slots: Vec::new(),
                waiters: Vec::new(),
                next_waiter_id: 0,
            }),
            released: Condvar::new(),
        }
    }

    /// Returns the wait handle for `buffer`, assigning one on first use.
    ///
    /// Assigning a handle to a buffer that already has one returns the
    /// existing handle. A buffer whose last reference is gone gets no handle,
    /// since its release notification may already have run.
    pub fn assign_handle(&self, buffer: &SharedBuffer) -> Result<WaitHandle, WaitError> {
        assert!(
            std::ptr::eq(self, &**buffer.registry()),
            "buffer belongs to another wait registry"
        );
        let mut state = self.state.lock();
        if let Some(handle) = buffer.wait_handle() {
            return Ok(handle);
        }
        // Teardown reads the handle under this lock after the count reaches
        // zero, so a handle stored while the count is nonzero is always seen.
        if buffer.refcount() == 0 {
            return Err(WaitError::Released);
        }
        let max_slots = state.max_slots;
        let handle = state
            .insert(buffer.downgrade())
            .ok_or(WaitError::HandlesExhausted(max_slots))?;
        buffer.set_wait_handle(handle);
        tracing::trace!(%handle, "assigned wait handle");
        Ok(handle)
    }

    /// Blocks until the buffer named by `handle` is released or `timeout`
    /// expires.
    ///
    /// Handles that were never assigned, or whose buffer is already gone,
    /// complete immediately.
    pub fn wait_until_released(
        &self,
        handle: WaitHandle,
        timeout: Duration,
    ) -> Result<(), WaitError> {
        let deadline = Instant::now().checked_add(timeout);

        let mut state = self.state.lock();
        let Some(target) = state.lookup(handle).cloned() else {
            return Ok(());
        };
        let Some(inner) = target.upgrade() else {
            state.remove(handle);
            return Ok(());
        };

        // Hold a reference while registering so the buffer cannot be torn
        // down between the lookup and the waiter being visible. A buffer
        // whose count already reached zero is mid-teardown; its notification
        // still needs this lock, so registering now cannot miss it.
        let buffer = SharedBuffer::from_inner(inner);
        let referenced = buffer.try_add_ref();
        let id = state.next_waiter_id;
        state.next_waiter_id += 1;
        state.waiters.push(Waiter {
            id,
            target,
            done: false,
        });
        drop(state);

        tracing::trace!(%handle, timeout = ?timeout, "waiting for buffer release");
        if referenced {
            // This may be the last reference, in which case the release
            // notifies the waiter registered above.
            buffer.release();
        }
        drop(buffer);

        let mut state = self.state.lock();
        loop {
            let waiter = state
                .waiters
                .iter()
                .find(|w| w.id == id)
                .expect("waiters are only removed by their owner");
            if waiter.done {
                state.remove_waiter(id);
                return Ok(());
            }
            let timed_out = match deadline {
                Some(deadline) => self.released.wait_until(&mut state, deadline).timed_out(),
                None => {
                    self.released.wait(&mut state);
                    false
                }
            };
            if timed_out {
                // The lock is held again, so a release racing the timeout has
                // either set `done` already or will find no waiter.
                let waiter = state.remove_waiter(id);
                if waiter.is_some_and(|w| w.done) {
                    return Ok(());
                }
                tracing::debug!(%handle, "timed out waiting for buffer release");
                return Err(WaitError::TimedOut(handle));
            }
        }
    }

    /// Retires the wait handle of `buffer`, if it has one, and wakes
    /// everyone waiting on it.
    pub(crate) fn notify_released(&self, buffer: &Arc<BufferInner>) -> Option<WaitHandle> {
        let mut state = self.state.lock();
        let handle = buffer.wait_handle()?;
        state.remove(handle);
        let mut woken = 0;
        for waiter in &mut state.waiters {
            if std::ptr::eq(waiter.target.as_ptr(), Arc::as_ptr(buffer)) {
                waiter.done = true;
                woken += 1;
            }
        }
        drop(state);
        if woken > 0 {
            tracing::trace!(%handle, woken, "buffer released, waking waiters");
            self.released.notify_all();
        }
        Some(handle)
    }

    /// The number of handles naming live buffers.
    pub fn outstanding_handles(&self) -> usize {
        let state = self.state.lock();
        state.slots.iter().filter(|slot| slot.buffer.is_some()).count()
    }

    /// The number of callers currently blocked in
    /// [`Self::wait_until_released`].
    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Grants;
    use gntdef::PAGE_SIZE;
    use page_pool_alloc::PagePool;
    use page_pool_alloc::PoolKind;
    use std::sync::Barrier;
    use test_with_tracing::test;

    fn buffer_with_pages(
        pool: &PagePool,
        registry: &Arc<WaitRegistry>,
        pages: usize,
    ) -> SharedBuffer {
        let pages = pool
            .allocator()
            .alloc_pages(pages.try_into().unwrap(), "test")
            .unwrap();
        let size = pages.len() as u64 * PAGE_SIZE;
        SharedBuffer::new(pages, Grants::None, size, registry.clone())
    }

    fn buffer(pool: &PagePool, registry: &Arc<WaitRegistry>) -> SharedBuffer {
        buffer_with_pages(pool, registry, 1)
    }

    fn wait_for_waiters(registry: &WaitRegistry, count: usize) {
        while registry.waiter_count() < count {
            std::thread::yield_now();
        }
    }

    #[test]
    fn assign_is_idempotent() {
        let pool = PagePool::new(PoolKind::Local, &[0..4]);
        let registry = Arc::new(WaitRegistry::new());
        let a = buffer(&pool, &registry);
        let b = buffer(&pool, &registry);

        let handle = registry.assign_handle(&a).unwrap();
        assert_eq!(registry.assign_handle(&a).unwrap(), handle);
        assert_eq!(a.wait_handle(), Some(handle));
        assert_ne!(registry.assign_handle(&b).unwrap(), handle);
        assert_eq!(registry.outstanding_handles(), 2);
        assert_eq!(WaitHandle::from_raw(handle.as_raw()), Some(handle));
        assert_eq!(WaitHandle::from_raw(0), None);

        a.release();
        b.release();
        assert_eq!(registry.outstanding_handles(), 0);
    }

    #[test]
    fn release_wakes_waiter() {
        let pool = PagePool::new(PoolKind::Local, &[0..1]);
        let registry = Arc::new(WaitRegistry::new());
        let buffer = buffer(&pool, &registry);
        let handle = registry.assign_handle(&buffer).unwrap();

        std::thread::scope(|s| {
            let waiter =
                s.spawn(|| registry.wait_until_released(handle, Duration::from_secs(30)));
            wait_for_waiters(&registry, 1);
            buffer.release();
            waiter.join().unwrap().unwrap();
        });
        assert_eq!(registry.waiter_count(), 0);
        assert_eq!(pool.allocated_pages(), 0);
    }

    #[test]
    fn woken_waiter_sees_pages_reclaimed() {
        const ROUNDS: usize = 50;
        const PAGES: usize = 256;
        let pool = PagePool::new(PoolKind::Local, &[0..PAGES as u64]);
        let registry = Arc::new(WaitRegistry::new());

        for _ in 0..ROUNDS {
            let buffer = buffer_with_pages(&pool, &registry, PAGES);
            let handle = registry.assign_handle(&buffer).unwrap();
            let allocated = std::thread::scope(|s| {
                let waiter = s.spawn(|| {
                    registry
                        .wait_until_released(handle, Duration::from_secs(30))
                        .unwrap();
                    pool.allocated_pages()
                });
                wait_for_waiters(&registry, 1);
                buffer.release();
                waiter.join().unwrap()
            });
            assert_eq!(allocated, 0);
        }
    }

    #[test]
    fn unknown_handles_complete_immediately() {
        let pool = PagePool::new(PoolKind::Local, &[0..1]);
        let registry = Arc::new(WaitRegistry::new());

        let never = WaitHandle::new(5, 1);
        registry
            .wait_until_released(never, Duration::from_secs(30))
            .unwrap();

        let buffer = buffer(&pool, &registry);
        let handle = registry.assign_handle(&buffer).unwrap();
        buffer.release();
        registry
            .wait_until_released(handle, Duration::from_secs(30))
            .unwrap();
    }

    #[test]
    fn released_buffer_gets_no_handle() {
        let pool = PagePool::new(PoolKind::Local, &[0..1]);
        let registry = Arc::new(WaitRegistry::new());
        let buffer = buffer(&pool, &registry);
        let stale = buffer.clone();
        buffer.release();

        assert!(matches!(
            registry.assign_handle(&stale),
            Err(WaitError::Released)
        ));
        assert_eq!(stale.wait_handle(), None);
        assert_eq!(registry.outstanding_handles(), 0);
    }

    #[test]
    fn assign_racing_release() {
        const ROUNDS: usize = 200;
        let pool = PagePool::new(PoolKind::Local, &[0..1]);
        let registry = Arc::new(WaitRegistry::new());

        for _ in 0..ROUNDS {
            let buffer = buffer(&pool, &registry);
            let barrier = Barrier::new(2);
            std::thread::scope(|s| {
                let waiter = s.spawn(|| {
                    barrier.wait();
                    match registry.assign_handle(&buffer) {
                        Ok(handle) => {
                            registry.wait_until_released(handle, Duration::from_secs(30))
                        }
                        Err(WaitError::Released) => Ok(()),
                        Err(err) => Err(err),
                    }
                });
                barrier.wait();
                buffer.release();
                waiter.join().unwrap().unwrap();
            });
            assert_eq!(registry.outstanding_handles(), 0);
            assert_eq!(registry.waiter_count(), 0);
        }
    }

    #[test]
    fn timeout_racing_release() {
        const ROUNDS: usize = 200;
        let pool = PagePool::new(PoolKind::Local, &[0..4]);
        let registry = Arc::new(WaitRegistry::new());

        for round in 0..ROUNDS {
            let buffer = buffer_with_pages(&pool, &registry, 4);
            let handle = registry.assign_handle(&buffer).unwrap();
            let barrier = Barrier::new(2);
            // Spread the release across the timeout window.
            let delay = Duration::from_micros((round % 20) as u64 * 100);
            std::thread::scope(|s| {
                let waiter = s.spawn(|| {
                    barrier.wait();
                    let result = registry.wait_until_released(handle, Duration::from_millis(1));
                    (result, pool.allocated_pages())
                });
                barrier.wait();
                std::thread::sleep(delay);
                buffer.release();
                match waiter.join().unwrap() {
                    (Ok(()), allocated) => assert_eq!(allocated, 0),
                    (Err(WaitError::TimedOut(h)), _) => assert_eq!(h, handle),
                    (Err(err), _) => panic!("unexpected error {err:?}"),
                }
            });
            assert_eq!(registry.waiter_count(), 0);
            assert_eq!(registry.outstanding_handles(), 0);
            assert_eq!(pool.allocated_pages(), 0);
        }
    }

    #[test]
    fn stale_generation_does_not_alias() {
        let pool = PagePool::new(PoolKind::Local, &[0..2]);
        let registry = Arc::new(WaitRegistry::new());

        let first = buffer(&pool, &registry);
        let old = registry.assign_handle(&first).unwrap();
        first.release();

        // The slot is reused with a new generation.
        let second = buffer(&pool, &registry);
        let new = registry.assign_handle(&second).unwrap();
        assert_eq!(old.index(), new.index());
        assert_ne!(old, new);

        registry
            .wait_until_released(old, Duration::from_millis(10))
            .unwrap();
        assert!(matches!(
            registry.wait_until_released(new, Duration::from_millis(10)),
            Err(WaitError::TimedOut(h)) if h == new
        ));
        assert_eq!(registry.waiter_count(), 0);
        second.release();
    }

    #[test]
    fn handle_slots_are_bounded() {
        let pool = PagePool::new(PoolKind::Local, &[0..2]);
        let registry = Arc::new(WaitRegistry::with_max_handles(1));
        let first = buffer(&pool, &registry);
        let second = buffer(&pool, &registry);

        registry.assign_handle(&first).unwrap();
        assert!(matches!(
            registry.assign_handle(&second),
            Err(WaitError::HandlesExhausted(1))
        ));
        assert_eq!(second.wait_handle(), None);

        first.release();
        registry.assign_handle(&second).unwrap();
        second.release();
        assert_eq!(registry.outstanding_handles(), 0);
    }

    #[test]
    fn timeout_leaves_buffer_alive() {
        let pool = PagePool::new(PoolKind::Local, &[0..1]);
        let registry = Arc::new(WaitRegistry::new());
        let buffer = buffer(&pool, &registry);
        let handle = registry.assign_handle(&buffer).unwrap();

        let err = registry
            .wait_until_released(handle, Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, WaitError::TimedOut(_)));
        assert_eq!(buffer.refcount(), 1);
        assert_eq!(registry.waiter_count(), 0);
        assert_eq!(pool.allocated_pages(), 1);

        buffer.release();
        assert_eq!(pool.allocated_pages(), 0);
    }

    #[test]
    fn all_waiters_wake() {
        const WAITERS: usize = 4;
        let pool = PagePool::new(PoolKind::Local, &[0..1]);
        let registry = Arc::new(WaitRegistry::new());
        let buffer = buffer(&pool, &registry);
        let handle = registry.assign_handle(&buffer).unwrap();

        let barrier = Barrier::new(WAITERS);
        std::thread::scope(|s| {
            let waiters: Vec<_> = (0..WAITERS)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        registry.wait_until_released(handle, Duration::from_secs(30))
                    })
                })
                .collect();
            wait_for_waiters(&registry, WAITERS);
            buffer.release();
            for waiter in waiters {
                waiter.join().unwrap().unwrap();
            }
        });
        assert_eq!(registry.waiter_count(), 0);
    }
}
