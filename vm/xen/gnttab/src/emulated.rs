// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An in-process emulation of the hypervisor's grant table, for tests.
//!
//! Every domain gets a grant table of fixed capacity and a sparse set of page
//! frames. Mapping a grant aliases the local frame to the granting domain's
//! frame, so data written on one side is visible on the other without a copy.

use crate::GrantAccess;
use crate::GrantMapper;
use crate::GrantTableError;
use crate::MapOp;
use crate::RefReservation;
use crate::UnmapOp;
use gntdef::DomainId;
use gntdef::GrantHandle;
use gntdef::GrantRefId;
use gntdef::GrantStatus;
use gntdef::PAGE_SIZE_USIZE;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;

/// The first grant references are reserved for the toolstack.
const FIRST_FREE_REF: u32 = 8;

#[derive(Debug)]
struct GrantEntry {
    grantee: DomainId,
    pfn: u64,
    readonly: bool,
    map_count: u32,
}

#[derive(Debug)]
struct Mapping {
    owner: DomainId,
    gref: GrantRefId,
    pfn: u64,
}

#[derive(Default)]
struct DomainState {
    free_refs: VecDeque<GrantRefId>,
    reserved: usize,
    entries: HashMap<GrantRefId, GrantEntry>,
    /// Entries whose access was ended while still mapped remotely.
    retired: HashMap<GrantRefId, GrantEntry>,
    frames: HashMap<u64, Box<[u8; PAGE_SIZE_USIZE]>>,
    /// Local frames currently aliased to another domain's frame.
    foreign: HashMap<u64, (DomainId, u64)>,
    mappings: HashMap<GrantHandle, Mapping>,
    next_handle: u32,
    claim_budget: Option<usize>,
    unmap_failures: usize,
    map_ops: usize,
    unmap_ops: usize,
}

impl DomainState {
    fn entry_mut(&mut self, gref: GrantRefId) -> Option<&mut GrantEntry> {
        if self.entries.contains_key(&gref) {
            self.entries.get_mut(&gref)
        } else {
            self.retired.get_mut(&gref)
        }
    }
}

#[derive(Default)]
struct HvState {
    domains: HashMap<DomainId, DomainState>,
}

/// Counters describing a domain's view of the grant table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainStats {
    /// References granted to another domain.
    pub granted: usize,
    /// References set aside by outstanding reservations.
    pub reserved: usize,
    /// References whose access ended while still mapped; never reused.
    pub retired: usize,
    /// References available for reservation.
    pub free: usize,
    /// Foreign pages currently mapped into this domain.
    pub mapped: usize,
    /// Total map operations issued by this domain.
    pub map_ops: usize,
    /// Total unmap operations issued by this domain.
    pub unmap_ops: usize,
}

/// An emulated hypervisor hosting any number of domains.
#[derive(Clone, Default)]
pub struct EmulatedHypervisor {
    state: Arc<Mutex<HvState>>,
}

impl EmulatedHypervisor {
    /// Returns a new hypervisor with no domains.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a domain with room for `grant_capacity` grant references, and
    /// returns its view of the grant table.
    pub fn add_domain(&self, id: DomainId, grant_capacity: u32) -> EmulatedDomain {
        let mut state = self.state.lock();
        let domain = state.domains.entry(id).or_default();
        domain.free_refs = (FIRST_FREE_REF..FIRST_FREE_REF + grant_capacity)
            .map(GrantRefId)
            .collect();
        EmulatedDomain {
            hv: self.clone(),
            id,
        }
    }

    /// Returns the view of an existing domain.
    pub fn domain(&self, id: DomainId) -> Option<EmulatedDomain> {
        self.state
            .lock()
            .domains
            .contains_key(&id)
            .then(|| EmulatedDomain {
                hv: self.clone(),
                id,
            })
    }
}

/// One domain's view of an [`EmulatedHypervisor`].
#[derive(Clone)]
pub struct EmulatedDomain {
    hv: EmulatedHypervisor,
    id: DomainId,
}

impl EmulatedDomain {
    /// The id of this domain.
    pub fn id(&self) -> DomainId {
        self.id
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut HvState, &mut DomainState) -> R) -> R {
        let mut state = self.hv.state.lock();
        let mut domain = state.domains.remove(&self.id).unwrap_or_default();
        let r = f(&mut state, &mut domain);
        state.domains.insert(self.id, domain);
        r
    }

    /// Returns the current counters for this domain.
    pub fn stats(&self) -> DomainStats {
        self.with_state(|_, domain| DomainStats {
            granted: domain.entries.len(),
            reserved: domain.reserved,
            retired: domain.retired.len(),
            free: domain.free_refs.len(),
            mapped: domain.mappings.len(),
            map_ops: domain.map_ops,
            unmap_ops: domain.unmap_ops,
        })
    }

    /// Makes every claim after the next `count` fail until reset with `None`.
    pub fn set_claim_budget(&self, count: Option<usize>) {
        self.with_state(|_, domain| domain.claim_budget = count);
    }

    /// Makes the next `count` unmap operations fail, leaving the mapping in
    /// place.
    pub fn fail_next_unmaps(&self, count: usize) {
        self.with_state(|_, domain| domain.unmap_failures = count);
    }

    /// Writes `data` to local frame `pfn` at `offset`, following foreign
    /// mappings.
    pub fn write(&self, pfn: u64, offset: usize, data: &[u8]) {
        self.with_state(|state, domain| {
            let frame = resolve_frame(state, domain, self.id, pfn);
            frame[offset..offset + data.len()].copy_from_slice(data);
        })
    }

    /// Reads from local frame `pfn` at `offset`, following foreign mappings.
    pub fn read(&self, pfn: u64, offset: usize, data: &mut [u8]) {
        self.with_state(|state, domain| {
            let frame = resolve_frame(state, domain, self.id, pfn);
            data.copy_from_slice(&frame[offset..offset + data.len()]);
        })
    }
}

fn resolve_frame<'a>(
    state: &'a mut HvState,
    domain: &'a mut DomainState,
    id: DomainId,
    pfn: u64,
) -> &'a mut [u8; PAGE_SIZE_USIZE] {
    let (frames, pfn) = match domain.foreign.get(&pfn).copied() {
        Some((owner, owner_pfn)) if owner != id => match state.domains.get_mut(&owner) {
            Some(owner) => (&mut owner.frames, owner_pfn),
            None => (&mut domain.frames, pfn),
        },
        _ => (&mut domain.frames, pfn),
    };
    frames
        .entry(pfn)
        .or_insert_with(|| Box::new([0; PAGE_SIZE_USIZE]))
}

impl GrantMapper for EmulatedDomain {
    fn map_refs(&self, ops: &mut [MapOp]) -> anyhow::Result<()> {
        self.with_state(|state, domain| {
            for op in ops.iter_mut() {
                domain.map_ops += 1;
                op.handle = GrantHandle::INVALID;
                let Some(owner) = state.domains.get_mut(&op.grant.domain) else {
                    op.status = GrantStatus::BAD_DOMAIN;
                    continue;
                };
                let Some(entry) = owner.entries.get_mut(&op.grant.gref) else {
                    op.status = GrantStatus::BAD_GNTREF;
                    continue;
                };
                if entry.grantee != self.id || (entry.readonly && !op.flags.readonly()) {
                    op.status = GrantStatus::PERMISSION_DENIED;
                    continue;
                }
                if domain.foreign.contains_key(&op.pfn) {
                    op.status = GrantStatus::BAD_VIRT_ADDR;
                    continue;
                }

                entry.map_count += 1;
                let handle = GrantHandle(domain.next_handle);
                domain.next_handle = domain.next_handle.wrapping_add(1);
                domain.foreign.insert(op.pfn, (op.grant.domain, entry.pfn));
                domain.mappings.insert(
                    handle,
                    Mapping {
                        owner: op.grant.domain,
                        gref: op.grant.gref,
                        pfn: op.pfn,
                    },
                );
                op.handle = handle;
                op.status = GrantStatus::OKAY;
            }
        });
        Ok(())
    }

    fn unmap_refs(&self, ops: &mut [UnmapOp]) -> anyhow::Result<()> {
        self.with_state(|state, domain| {
            for op in ops.iter_mut() {
                domain.unmap_ops += 1;
                if domain.unmap_failures > 0 {
                    domain.unmap_failures -= 1;
                    op.status = GrantStatus::GENERAL_ERROR;
                    continue;
                }
                let mapping = match domain.mappings.remove(&op.handle) {
                    Some(mapping) if mapping.pfn == op.pfn => mapping,
                    other => {
                        if let Some(mapping) = other {
                            domain.mappings.insert(op.handle, mapping);
                        }
                        op.status = GrantStatus::BAD_HANDLE;
                        continue;
                    }
                };

                domain.foreign.remove(&mapping.pfn);
                // Retired entries stay retired after the last unmap.
                if let Some(entry) = state
                    .domains
                    .get_mut(&mapping.owner)
                    .and_then(|owner| owner.entry_mut(mapping.gref))
                {
                    entry.map_count -= 1;
                }
                op.status = GrantStatus::OKAY;
            }
        });
        Ok(())
    }
}

impl GrantAccess for EmulatedDomain {
    fn reserve_refs(&self, count: usize) -> Result<RefReservation, GrantTableError> {
        self.with_state(|_, domain| {
            if domain.free_refs.len() < count {
                return Err(GrantTableError::NoFreeReferences {
                    requested: count,
                    available: domain.free_refs.len(),
                });
            }
            domain.reserved += count;
            Ok(RefReservation::new(domain.free_refs.drain(..count).collect()))
        })
    }

    fn claim_ref(&self, reservation: &mut RefReservation) -> Option<GrantRefId> {
        self.with_state(|_, domain| {
            if let Some(budget) = &mut domain.claim_budget {
                if *budget == 0 {
                    return None;
                }
                *budget -= 1;
            }
            let gref = reservation.take()?;
            domain.reserved -= 1;
            Some(gref)
        })
    }

    fn grant_foreign_access(&self, gref: GrantRefId, domain_id: DomainId, pfn: u64, readonly: bool) {
        self.with_state(|_, domain| {
            let prev = domain.entries.insert(
                gref,
                GrantEntry {
                    grantee: domain_id,
                    pfn,
                    readonly,
                    map_count: 0,
                },
            );
            assert!(prev.is_none(), "grant reference {gref:?} granted twice");
        })
    }

    fn end_foreign_access(&self, gref: GrantRefId) -> Result<(), GrantTableError> {
        self.with_state(|_, domain| {
            let entry = domain
                .entries
                .remove(&gref)
                .ok_or(GrantTableError::NotGranted(gref))?;
            if entry.map_count > 0 {
                tracing::debug!(
                    domain = self.id.0,
                    gref = gref.0,
                    map_count = entry.map_count,
                    "retiring grant reference still mapped remotely"
                );
                domain.retired.insert(gref, entry);
                return Err(GrantTableError::StillInUse(gref));
            }
            domain.free_refs.push_back(gref);
            Ok(())
        })
    }

    fn release_reservation(&self, reservation: RefReservation) {
        self.with_state(|_, domain| {
            let refs = reservation.into_refs();
            domain.reserved -= refs.len();
            domain.free_refs.extend(refs.into_iter().rev());
        })
    }
}
