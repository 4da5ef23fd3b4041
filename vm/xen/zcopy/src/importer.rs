// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Maps a remote domain's granted pages into local memory.

use crate::buffer::Grants;
use crate::buffer::SharedBuffer;
use crate::wait::WaitRegistry;
use crate::Error;
use gntdef::DomainId;
use gntdef::GrantHandle;
use gntdef::GrantMapFlags;
use gntdef::GrantRef;
use gntdef::GrantRefId;
use gntdef::GrantStatus;
use gntdef::PAGE_SIZE;
use gnttab::GrantMapper;
use gnttab::MapOp;
use gnttab::UnmapOp;
use page_pool_alloc::PagePoolAllocator;
use page_pool_alloc::PoolKind;
use page_pool_alloc::PoolPage;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// The grant state of an imported buffer.
pub(crate) struct ImportedGrants {
    mapper: Arc<dyn GrantMapper>,
    flags: GrantMapFlags,
    remote_domain: DomainId,
    refs: Vec<GrantRef>,
    /// One per page. Invalid for pages that never mapped.
    map_tokens: Vec<GrantHandle>,
}

impl ImportedGrants {
    pub fn remote_domain(&self) -> DomainId {
        self.remote_domain
    }

    pub fn refs(&self) -> &[GrantRef] {
        &self.refs
    }
}

/// Creates [`SharedBuffer`]s backed by pages granted by remote domains.
pub struct GrantImporter {
    mapper: Arc<dyn GrantMapper>,
    pages: PagePoolAllocator,
    registry: Arc<WaitRegistry>,
    flags: GrantMapFlags,
}

impl GrantImporter {
    /// Returns a new importer mapping grants with `mapper` over pages from
    /// `pages`, which must come from a [`PoolKind::Foreign`] pool.
    pub fn new(
        mapper: Arc<dyn GrantMapper>,
        pages: PagePoolAllocator,
        registry: Arc<WaitRegistry>,
        readonly: bool,
    ) -> Self {
        assert_eq!(
            pages.kind(),
            PoolKind::Foreign,
            "imports need pages eligible for foreign mapping"
        );
        Self {
            mapper,
            pages,
            registry,
            flags: GrantMapFlags::new()
                .with_host_map(true)
                .with_readonly(readonly),
        }
    }

    /// Maps the pages `refs` granted by `remote_domain`, in order, into a new
    /// buffer with a reference count of one.
    ///
    /// Either every page maps or the import fails with nothing left mapped
    /// and no pages held.
    pub fn import(
        &self,
        remote_domain: DomainId,
        refs: &[GrantRefId],
    ) -> Result<SharedBuffer, Error> {
        let count = NonZeroUsize::new(refs.len())
            .ok_or(Error::InvalidArgument("no grant references to import"))?;
        let pages = self
            .pages
            .alloc_pages(count, "zcopy import")
            .map_err(Error::NoMemory)?;

        let refs: Vec<_> = refs
            .iter()
            .map(|&gref| GrantRef {
                domain: remote_domain,
                gref,
            })
            .collect();
        let mut ops: Vec<_> = pages
            .iter()
            .zip(&refs)
            .map(|(page, &grant)| MapOp::new(page.pfn(), self.flags, grant))
            .collect();

        let result = self.mapper.map_refs(&mut ops);

        let map_tokens: Vec<_> = ops
            .iter()
            .map(|op| {
                if op.status.is_ok() {
                    op.handle
                } else {
                    GrantHandle::INVALID
                }
            })
            .collect();
        let mapped = map_tokens.iter().filter(|token| token.is_valid()).count();

        let grants = ImportedGrants {
            mapper: self.mapper.clone(),
            flags: self.flags,
            remote_domain,
            refs,
            map_tokens,
        };

        if result.is_err() || mapped < pages.len() {
            let statuses: Vec<_> = ops.iter().map(|op| op.status).collect();
            tracing::debug!(
                %remote_domain,
                mapped,
                pages = pages.len(),
                "rolling back partial import"
            );
            if let Err(err) = unmap(grants, &pages) {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    %remote_domain,
                    "failed to roll back partial import"
                );
            }
            drop(pages);

            return Err(match result {
                Err(err) => Error::Backend(err),
                Ok(()) if statuses.iter().any(|status| status.is_access_revoked()) => {
                    Error::RemoteRevoked { mapped, statuses }
                }
                Ok(()) => Error::PartialMapFailure { mapped, statuses },
            });
        }

        tracing::debug!(%remote_domain, pages = pages.len(), "imported buffer");
        let size = pages.len() as u64 * PAGE_SIZE;
        Ok(SharedBuffer::new(
            pages,
            Grants::Imported(grants),
            size,
            self.registry.clone(),
        ))
    }
}

/// Unmaps every page of `grants` that holds a map token.
///
/// Failures are logged per page and do not stop the remaining pages from
/// being unmapped. The caller returns `pages` to the pool afterwards
/// regardless of the outcome.
pub(crate) fn unmap(grants: ImportedGrants, pages: &[PoolPage]) -> Result<(), Error> {
    let mut ops: Vec<_> = pages
        .iter()
        .zip(&grants.map_tokens)
        .filter(|(_, token)| token.is_valid())
        .map(|(page, &token)| UnmapOp::new(page.pfn(), grants.flags, token))
        .collect();
    if ops.is_empty() {
        return Ok(());
    }

    let result = grants.mapper.unmap_refs(&mut ops);

    let mut failed = 0;
    for op in ops.iter().filter(|op| op.status != GrantStatus::OKAY) {
        failed += 1;
        tracing::warn!(
            pfn = op.pfn,
            handle = op.handle.0,
            status = ?op.status,
            remote_domain = %grants.remote_domain,
            "failed to unmap foreign page"
        );
    }

    result.map_err(Error::Backend)?;
    if failed > 0 {
        return Err(Error::UnmapFailed {
            failed,
            total: ops.len(),
        });
    }
    Ok(())
}
