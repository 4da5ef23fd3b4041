// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Interfaces to the hypervisor's grant table.
//!
//! [`GrantMapper`] maps pages granted by a remote domain into this domain's
//! address space. [`GrantAccess`] grants remote domains access to pages owned
//! by this domain. Both are implemented by the platform layer; [`emulated`]
//! provides an in-process implementation of the hypervisor side.

#![warn(missing_docs)]

pub mod emulated;

use gntdef::DomainId;
use gntdef::GrantHandle;
use gntdef::GrantMapFlags;
use gntdef::GrantRef;
use gntdef::GrantRefId;
use gntdef::GrantStatus;
use thiserror::Error;

/// Errors returned by grant access operations.
#[derive(Debug, Error)]
pub enum GrantTableError {
    /// Not enough free grant references to satisfy a reservation.
    #[error("unable to reserve {requested} grant references, {available} available")]
    NoFreeReferences {
        /// The number of references requested.
        requested: usize,
        /// The number of references free at the time of the request.
        available: usize,
    },
    /// The remote domain still maps the page, so access cannot be ended.
    #[error("grant reference {0:?} is still in use by the remote domain")]
    StillInUse(GrantRefId),
    /// The reference is not currently granted.
    #[error("grant reference {0:?} is not granted")]
    NotGranted(GrantRefId),
}

/// A single grant map request, along with its results.
#[derive(Debug, Clone)]
pub struct MapOp {
    /// The local page frame the grant is mapped over.
    pub pfn: u64,
    /// The mapping flags.
    pub flags: GrantMapFlags,
    /// The granting domain and reference.
    pub grant: GrantRef,
    /// Set by the mapper.
    pub status: GrantStatus,
    /// Set by the mapper. Only valid if `status` is okay.
    pub handle: GrantHandle,
}

impl MapOp {
    /// Returns a new, not yet issued, map operation.
    pub fn new(pfn: u64, flags: GrantMapFlags, grant: GrantRef) -> Self {
        Self {
            pfn,
            flags,
            grant,
            status: GrantStatus::GENERAL_ERROR,
            handle: GrantHandle::INVALID,
        }
    }
}

/// A single grant unmap request, along with its result.
#[derive(Debug, Clone)]
pub struct UnmapOp {
    /// The local page frame the grant was mapped over.
    pub pfn: u64,
    /// The flags the page was mapped with.
    pub flags: GrantMapFlags,
    /// The handle returned by the map operation.
    pub handle: GrantHandle,
    /// Set by the mapper.
    pub status: GrantStatus,
}

impl UnmapOp {
    /// Returns a new, not yet issued, unmap operation.
    pub fn new(pfn: u64, flags: GrantMapFlags, handle: GrantHandle) -> Self {
        Self {
            pfn,
            flags,
            handle,
            status: GrantStatus::GENERAL_ERROR,
        }
    }
}

/// Maps pages granted by other domains.
pub trait GrantMapper: Send + Sync {
    /// Issues the map operations as a batch.
    ///
    /// Per-page results are written to each op's `status` and `handle`. An
    /// error means the batch could not be completed as a whole; ops may still
    /// have succeeded individually and must be inspected.
    fn map_refs(&self, ops: &mut [MapOp]) -> anyhow::Result<()>;

    /// Issues the unmap operations as a batch, with the same result
    /// conventions as [`Self::map_refs`].
    fn unmap_refs(&self, ops: &mut [UnmapOp]) -> anyhow::Result<()>;
}

/// A batch of grant references set aside for a caller.
///
/// References are claimed one at a time with [`GrantAccess::claim_ref`]; any
/// left unclaimed go back to the table via
/// [`GrantAccess::release_reservation`].
#[derive(Debug)]
pub struct RefReservation {
    refs: Vec<GrantRefId>,
}

impl RefReservation {
    /// Creates a reservation over `refs`. References are claimed in order.
    pub fn new(mut refs: Vec<GrantRefId>) -> Self {
        refs.reverse();
        Self { refs }
    }

    /// The number of unclaimed references.
    pub fn len(&self) -> usize {
        self.refs.len()
    }

    /// Returns true if every reference has been claimed.
    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    /// Takes the next unclaimed reference.
    pub fn take(&mut self) -> Option<GrantRefId> {
        self.refs.pop()
    }

    /// Consumes the reservation, returning the unclaimed references.
    pub fn into_refs(self) -> Vec<GrantRefId> {
        self.refs
    }
}

/// Grants other domains access to this domain's pages.
pub trait GrantAccess: Send + Sync {
    /// Reserves `count` grant references. Either all are reserved or none.
    fn reserve_refs(&self, count: usize) -> Result<RefReservation, GrantTableError>;

    /// Claims a reference from `reservation`. Returns `None` if the
    /// reservation is exhausted.
    fn claim_ref(&self, reservation: &mut RefReservation) -> Option<GrantRefId>;

    /// Grants `domain` access to `pfn` through the claimed reference `gref`.
    fn grant_foreign_access(&self, gref: GrantRefId, domain: DomainId, pfn: u64, readonly: bool);

    /// Ends foreign access through `gref`. On success the reference goes back
    /// to the table's free list.
    ///
    /// Fails if the remote domain still has the page mapped. The reference is
    /// then retired and never handed out again.
    fn end_foreign_access(&self, gref: GrantRefId) -> Result<(), GrantTableError>;

    /// Returns unclaimed references in `reservation` to the table.
    fn release_reservation(&self, reservation: RefReservation);
}
