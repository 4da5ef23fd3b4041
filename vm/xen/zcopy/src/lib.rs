// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Zero-copy buffer sharing between domains over hypervisor grants.
//!
//! A buffer is either imported, by mapping pages a remote domain granted to
//! us, or exported, by granting a remote domain access to local pages. Either
//! way the pages are shared, never copied. Buffers are reference counted
//! explicitly; the last release reverses the grant relationship, returns the
//! pages to their pool and wakes anyone blocked on the buffer's wait handle.
//!
//! [`ZcopyDevice`] ties the pieces together behind a table of buffer objects.

#![forbid(unsafe_code)]

mod buffer;
mod config;
mod dumb;
mod exporter;
mod importer;
mod objects;
mod wait;

pub use buffer::Direction;
pub use buffer::SharedBuffer;
pub use config::ZcopyConfig;
pub use dumb::BufferGeometry;
pub use exporter::GrantExporter;
pub use importer::GrantImporter;
pub use objects::ObjectHandle;
pub use objects::ObjectTable;
pub use wait::WaitError;
pub use wait::WaitHandle;
pub use wait::WaitRegistry;

use gntdef::DomainId;
use gntdef::GrantRefId;
use gntdef::GrantStatus;
use gnttab::GrantAccess;
use gnttab::GrantMapper;
use page_pool_alloc::PagePoolAllocator;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors from sharing operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("failed to allocate buffer pages")]
    NoMemory(#[source] page_pool_alloc::Error),
    #[error("{mapped} of {} pages mapped before a page failed to map", .statuses.len())]
    PartialMapFailure {
        mapped: usize,
        statuses: Vec<GrantStatus>,
    },
    #[error("remote domain revoked access, {mapped} of {} pages mapped", .statuses.len())]
    RemoteRevoked {
        mapped: usize,
        statuses: Vec<GrantStatus>,
    },
    #[error("no free grant references")]
    NoGrantSlots,
    #[error("buffer is already shared")]
    AlreadyShared,
    #[error("timed out waiting for wait handle {0}")]
    TimedOut(WaitHandle),
    #[error("no buffer object {0}")]
    NoSuchObject(ObjectHandle),
    #[error("{failed} of {total} pages failed to unmap")]
    UnmapFailed { failed: usize, total: usize },
    #[error("remote domain still maps {} of {total} pages", .pages.len())]
    RevokeRefused { pages: Vec<usize>, total: usize },
    #[error("grant table operation failed")]
    Backend(#[source] anyhow::Error),
    #[error("failed to assign a wait handle")]
    WaitHandle(#[source] WaitError),
}

impl From<WaitError> for Error {
    fn from(err: WaitError) -> Self {
        match err {
            WaitError::TimedOut(handle) => Self::TimedOut(handle),
            err => Self::WaitHandle(err),
        }
    }
}

/// A request to import a remote buffer.
#[derive(Debug, Clone)]
pub struct FromRefsRequest {
    /// The domain that granted the pages.
    pub otherend_id: DomainId,
    /// The layout of the buffer.
    pub geometry: BufferGeometry,
    /// One grant reference per page, in page order.
    pub grefs: Vec<GrantRefId>,
}

/// The result of a successful import.
#[derive(Debug, Copy, Clone)]
pub struct FromRefsResponse {
    /// The new buffer object.
    pub handle: ObjectHandle,
    /// Signals when the imported buffer has been released.
    pub wait_handle: WaitHandle,
}

/// A request to grant a remote domain access to a local buffer object.
#[derive(Debug, Copy, Clone)]
pub struct ToRefsRequest {
    /// The buffer object to export.
    pub handle: ObjectHandle,
    /// The domain to grant access to.
    pub otherend_id: DomainId,
    /// The number of grant references the caller expects, one per page.
    pub num_grefs: usize,
}

/// The zero-copy sharing device: buffer objects plus import, export and
/// release notification.
pub struct ZcopyDevice {
    config: ZcopyConfig,
    importer: GrantImporter,
    exporter: GrantExporter,
    registry: Arc<WaitRegistry>,
    objects: ObjectTable,
}

impl ZcopyDevice {
    /// Returns a new device.
    ///
    /// Imports map over pages from `foreign_pages`; new buffer objects use
    /// `local_pages`.
    pub fn new(
        config: ZcopyConfig,
        mapper: Arc<dyn GrantMapper>,
        access: Arc<dyn GrantAccess>,
        foreign_pages: PagePoolAllocator,
        local_pages: PagePoolAllocator,
    ) -> Self {
        let registry = Arc::new(WaitRegistry::new());
        Self {
            importer: GrantImporter::new(
                mapper,
                foreign_pages,
                registry.clone(),
                config.map_readonly,
            ),
            exporter: GrantExporter::new(access, config.grant_readonly),
            objects: ObjectTable::new(local_pages, registry.clone()),
            registry,
            config,
        }
    }

    /// The device's buffer objects.
    pub fn objects(&self) -> &ObjectTable {
        &self.objects
    }

    /// The device's wait registry.
    pub fn wait_registry(&self) -> &Arc<WaitRegistry> {
        &self.registry
    }

    fn check_gref_count(&self, count: usize, pages: u64) -> Result<(), Error> {
        if count == 0 {
            return Err(Error::InvalidArgument("no grant references"));
        }
        if count > self.config.max_grefs {
            return Err(Error::InvalidArgument("too many grant references"));
        }
        if count as u64 != pages {
            return Err(Error::InvalidArgument(
                "grant reference count does not match buffer size",
            ));
        }
        Ok(())
    }

    /// Creates a local buffer object for `geometry`.
    pub fn create_dumb(&self, geometry: &BufferGeometry) -> Result<ObjectHandle, Error> {
        self.objects.create(geometry)
    }

    /// Maps a buffer granted by a remote domain and wraps it in a new buffer
    /// object with a wait handle.
    pub fn import_from_refs(&self, request: &FromRefsRequest) -> Result<FromRefsResponse, Error> {
        let pages = request
            .geometry
            .page_count()
            .ok_or(Error::InvalidArgument("buffer geometry overflows"))?;
        self.check_gref_count(request.grefs.len(), pages)?;

        let buffer = self.importer.import(request.otherend_id, &request.grefs)?;
        let wait_handle = match self.registry.assign_handle(&buffer) {
            Ok(wait_handle) => wait_handle,
            Err(err) => {
                buffer.release();
                return Err(err.into());
            }
        };
        let handle = self.objects.insert(buffer);
        tracing::debug!(
            %handle,
            %wait_handle,
            otherend_id = %request.otherend_id,
            "imported buffer object"
        );
        Ok(FromRefsResponse {
            handle,
            wait_handle,
        })
    }

    /// Grants a remote domain access to a local buffer object, returning one
    /// grant reference per page.
    pub fn export_to_refs(&self, request: &ToRefsRequest) -> Result<Vec<GrantRefId>, Error> {
        let buffer = self.objects.lookup(request.handle)?;
        // Keep the buffer alive across the export even if the object is
        // destroyed concurrently.
        if !buffer.try_add_ref() {
            return Err(Error::NoSuchObject(request.handle));
        }
        let result = self
            .check_gref_count(request.num_grefs, buffer.pfns().len() as u64)
            .and_then(|()| self.exporter.export(&buffer, request.otherend_id));
        buffer.release();
        let refs = result?;
        tracing::debug!(
            handle = %request.handle,
            otherend_id = %request.otherend_id,
            grefs = refs.len(),
            "exported buffer object"
        );
        Ok(refs.into_iter().map(|grant| grant.gref).collect())
    }

    /// Returns the wait handle of a buffer object, assigning one if needed.
    pub fn assign_wait_handle(&self, handle: ObjectHandle) -> Result<WaitHandle, Error> {
        let buffer = self.objects.lookup(handle)?;
        self.registry
            .assign_handle(&buffer)
            .map_err(|err| match err {
                // Destroyed concurrently.
                WaitError::Released => Error::NoSuchObject(handle),
                err => err.into(),
            })
    }

    /// Blocks until the buffer behind the raw wait handle `wait_handle` is
    /// released, or until `timeout` (the configured default if `None`)
    /// expires.
    pub fn wait_until_released(
        &self,
        wait_handle: u64,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        let Some(handle) = WaitHandle::from_raw(wait_handle) else {
            return Ok(());
        };
        let timeout = timeout.unwrap_or(self.config.default_wait_timeout);
        Ok(self.registry.wait_until_released(handle, timeout)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gntdef::decode_ref_list;
    use gntdef::encode_ref_list;
    use gnttab::emulated::EmulatedDomain;
    use gnttab::emulated::EmulatedHypervisor;
    use page_pool_alloc::PagePool;
    use page_pool_alloc::PoolKind;
    use test_with_tracing::test;

    struct Guest {
        domain: EmulatedDomain,
        local: PagePool,
        foreign: PagePool,
        device: ZcopyDevice,
    }

    fn guest(hv: &EmulatedHypervisor, id: u16) -> Guest {
        let domain = hv.add_domain(DomainId(id), 64);
        let local = PagePool::new(PoolKind::Local, &[0x100..0x200]);
        let foreign = PagePool::new(PoolKind::Foreign, &[0x1000..0x1100]);
        let device = ZcopyDevice::new(
            ZcopyConfig {
                max_grefs: 32,
                ..Default::default()
            },
            Arc::new(domain.clone()),
            Arc::new(domain.clone()),
            foreign.allocator(),
            local.allocator(),
        );
        Guest {
            domain,
            local,
            foreign,
            device,
        }
    }

    const GEOMETRY: BufferGeometry = BufferGeometry {
        width: 64,
        height: 64,
        bpp: 32,
    };

    #[test]
    fn share_between_domains() {
        let hv = EmulatedHypervisor::new();
        let back = guest(&hv, 1);
        let front = guest(&hv, 2);

        let exported = back.device.create_dumb(&GEOMETRY).unwrap();
        let back_pfns = back.device.objects().lookup(exported).unwrap().pfns();
        assert_eq!(back_pfns.len(), 4);
        back.domain.write(back_pfns[3], 100, b"scanout");

        let grefs = back
            .device
            .export_to_refs(&ToRefsRequest {
                handle: exported,
                otherend_id: DomainId(2),
                num_grefs: 4,
            })
            .unwrap();
        assert_eq!(back.domain.stats().granted, 4);

        let wire = encode_ref_list(DomainId(1), &grefs);
        let (otherend_id, grefs) = decode_ref_list(&wire).unwrap();
        assert_eq!(otherend_id, DomainId(1));

        let response = front
            .device
            .import_from_refs(&FromRefsRequest {
                otherend_id,
                geometry: GEOMETRY,
                grefs,
            })
            .unwrap();
        let imported = front.device.objects().lookup(response.handle).unwrap();
        assert_eq!(imported.direction(), Direction::Imported);
        assert_eq!(imported.wait_handle(), Some(response.wait_handle));
        let front_pfns = imported.pfns();
        assert!(front_pfns.iter().all(|&pfn| front.foreign.contains(pfn)));

        // Both sides see the same memory.
        let mut data = [0; 7];
        front.domain.read(front_pfns[3], 100, &mut data);
        assert_eq!(&data, b"scanout");
        front.domain.write(front_pfns[0], 0, b"ack");
        back.domain.read(back_pfns[0], 0, &mut data[..3]);
        assert_eq!(&data[..3], b"ack");

        std::thread::scope(|s| {
            let waiter = s.spawn(|| {
                front
                    .device
                    .wait_until_released(response.wait_handle.as_raw(), None)
            });
            while front.device.wait_registry().waiter_count() == 0 {
                std::thread::yield_now();
            }
            front.device.objects().destroy(response.handle).unwrap();
            waiter.join().unwrap().unwrap();
        });
        assert_eq!(front.domain.stats().mapped, 0);
        assert_eq!(front.foreign.allocated_pages(), 0);

        // Nothing maps the exported pages anymore, so revocation succeeds.
        back.device.objects().destroy(exported).unwrap();
        assert_eq!(back.domain.stats().granted, 0);
        assert_eq!(back.local.allocated_pages(), 0);
        assert_eq!(back.local.leaked_pages(), 0);
    }

    #[test]
    fn import_validates_request() {
        let hv = EmulatedHypervisor::new();
        let front = guest(&hv, 2);
        hv.add_domain(DomainId(1), 64);

        for grefs in [vec![], vec![GrantRefId(8); 3], vec![GrantRefId(8); 5]] {
            assert!(matches!(
                front.device.import_from_refs(&FromRefsRequest {
                    otherend_id: DomainId(1),
                    geometry: GEOMETRY,
                    grefs,
                }),
                Err(Error::InvalidArgument(_))
            ));
        }

        let big = BufferGeometry {
            width: 4096,
            height: 64,
            bpp: 8,
        };
        assert!(matches!(
            front.device.import_from_refs(&FromRefsRequest {
                otherend_id: DomainId(1),
                geometry: big,
                grefs: vec![GrantRefId(8); 64],
            }),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(front.domain.stats().map_ops, 0);
        assert!(front.device.objects().is_empty());
    }

    #[test]
    fn import_of_ungranted_refs_fails_cleanly() {
        let hv = EmulatedHypervisor::new();
        let front = guest(&hv, 2);
        hv.add_domain(DomainId(1), 64);

        let err = front
            .device
            .import_from_refs(&FromRefsRequest {
                otherend_id: DomainId(1),
                geometry: GEOMETRY,
                grefs: (8..12).map(GrantRefId).collect(),
            })
            .unwrap_err();
        assert!(matches!(err, Error::RemoteRevoked { mapped: 0, .. }));
        assert_eq!(front.foreign.allocated_pages(), 0);
        assert_eq!(front.device.wait_registry().outstanding_handles(), 0);
        assert!(front.device.objects().is_empty());
    }

    #[test]
    fn export_validates_request() {
        let hv = EmulatedHypervisor::new();
        let back = guest(&hv, 1);
        let handle = back.device.create_dumb(&GEOMETRY).unwrap();

        let request = |num_grefs| ToRefsRequest {
            handle,
            otherend_id: DomainId(2),
            num_grefs,
        };
        assert!(matches!(
            back.device.export_to_refs(&request(3)),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            back.device.export_to_refs(&ToRefsRequest {
                handle: ObjectHandle(99),
                ..request(4)
            }),
            Err(Error::NoSuchObject(_))
        ));
        back.device.export_to_refs(&request(4)).unwrap();
        assert!(matches!(
            back.device.export_to_refs(&request(4)),
            Err(Error::AlreadyShared)
        ));
        assert_eq!(
            back.device.objects().lookup(handle).unwrap().refcount(),
            1
        );
    }

    #[test]
    fn wait_on_live_buffer_times_out() {
        let hv = EmulatedHypervisor::new();
        let back = guest(&hv, 1);
        let handle = back.device.create_dumb(&GEOMETRY).unwrap();
        let wait_handle = back.device.assign_wait_handle(handle).unwrap();
        assert_eq!(back.device.assign_wait_handle(handle).unwrap(), wait_handle);

        let err = back
            .device
            .wait_until_released(wait_handle.as_raw(), Some(Duration::from_millis(10)))
            .unwrap_err();
        assert!(matches!(err, Error::TimedOut(h) if h == wait_handle));

        back.device.wait_until_released(0, None).unwrap();

        back.device.objects().destroy(handle).unwrap();
        back.device
            .wait_until_released(wait_handle.as_raw(), None)
            .unwrap();
    }
}
