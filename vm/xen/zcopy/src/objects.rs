// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A table of buffer objects, each holding one reference to a shared buffer.

use crate::buffer::Grants;
use crate::buffer::SharedBuffer;
use crate::dumb::BufferGeometry;
use crate::wait::WaitRegistry;
use crate::Error;
use page_pool_alloc::PagePoolAllocator;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Names a buffer object in an [`ObjectTable`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectHandle(pub u32);

impl std::fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct TableState {
    next_handle: u32,
    objects: HashMap<ObjectHandle, SharedBuffer>,
}

impl TableState {
    fn insert(&mut self, buffer: SharedBuffer) -> ObjectHandle {
        let handle = loop {
            let handle = ObjectHandle(self.next_handle);
            self.next_handle = self.next_handle.wrapping_add(1).max(1);
            if !self.objects.contains_key(&handle) {
                break handle;
            }
        };
        self.objects.insert(handle, buffer);
        handle
    }
}

/// Buffer objects backed by [`SharedBuffer`]s.
///
/// Every object owns one reference to its buffer. Destroying the object
/// releases that reference; the buffer itself goes away once the last object
/// naming it (and any other holder) has released it.
pub struct ObjectTable {
    pages: PagePoolAllocator,
    registry: Arc<WaitRegistry>,
    state: Mutex<TableState>,
}

impl ObjectTable {
    /// Returns an empty table allocating new buffers from `pages`.
    pub fn new(pages: PagePoolAllocator, registry: Arc<WaitRegistry>) -> Self {
        Self {
            pages,
            registry,
            state: Mutex::new(TableState {
                next_handle: 1,
                objects: HashMap::new(),
            }),
        }
    }

    /// Creates an unshared buffer object large enough for `geometry`.
    pub fn create(&self, geometry: &BufferGeometry) -> Result<ObjectHandle, Error> {
        let size = geometry
            .size()
            .ok_or(Error::InvalidArgument("buffer geometry overflows"))?;
        let count = geometry
            .page_count()
            .and_then(|n| usize::try_from(n).ok())
            .and_then(NonZeroUsize::new)
            .ok_or(Error::InvalidArgument("buffer geometry is empty"))?;
        let pages = self
            .pages
            .alloc_pages(count, "zcopy dumb buffer")
            .map_err(Error::NoMemory)?;
        let buffer = SharedBuffer::new(pages, Grants::None, size, self.registry.clone());
        let handle = self.insert(buffer);
        tracing::debug!(%handle, size, pages = count.get(), "created buffer object");
        Ok(handle)
    }

    /// Adds an object owning the caller's reference to `buffer`.
    pub(crate) fn insert(&self, buffer: SharedBuffer) -> ObjectHandle {
        self.state.lock().insert(buffer)
    }

    /// Returns the buffer behind `handle`.
    ///
    /// The returned buffer holds no reference of its own; it stays usable
    /// while the object exists.
    pub fn lookup(&self, handle: ObjectHandle) -> Result<SharedBuffer, Error> {
        self.state
            .lock()
            .objects
            .get(&handle)
            .cloned()
            .ok_or(Error::NoSuchObject(handle))
    }

    /// Creates a second object naming the same buffer, taking a reference
    /// for it.
    pub fn duplicate(&self, handle: ObjectHandle) -> Result<ObjectHandle, Error> {
        let mut state = self.state.lock();
        let buffer = state
            .objects
            .get(&handle)
            .cloned()
            .ok_or(Error::NoSuchObject(handle))?;
        // The object's own reference cannot be released while it is in the
        // table, and destroy removes it under this lock.
        buffer.add_ref();
        Ok(state.insert(buffer))
    }

    /// Destroys the object, releasing its reference to the buffer.
    pub fn destroy(&self, handle: ObjectHandle) -> Result<(), Error> {
        let buffer = self
            .state
            .lock()
            .objects
            .remove(&handle)
            .ok_or(Error::NoSuchObject(handle))?;
        tracing::debug!(%handle, "destroying buffer object");
        // Released outside the table lock.
        buffer.release();
        Ok(())
    }

    /// The number of live objects.
    pub fn len(&self) -> usize {
        self.state.lock().objects.len()
    }

    /// Returns true if there are no live objects.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
