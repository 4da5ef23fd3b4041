// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Grant table definitions shared between domains.
//!
//! These are the fixed-width identifiers that cross the trust boundary
//! between two domains: domain ids, grant references, map handles and the
//! per-operation status codes reported by the hypervisor.

#![warn(missing_docs)]

use bitfield_struct::bitfield;
use static_assertions::const_assert_eq;
use std::fmt::Debug;
use std::mem::size_of;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// The size of a grantable page.
pub const PAGE_SIZE: u64 = 4096;
/// The size of a grantable page, as a `usize`.
pub const PAGE_SIZE_USIZE: usize = 4096;
/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u64 = 12;

/// Identifies a domain (an isolated OS instance) running under the
/// hypervisor.
#[repr(transparent)]
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, IntoBytes, Immutable, KnownLayout, FromBytes,
)]
pub struct DomainId(pub u16);

impl DomainId {
    /// Refers to the calling domain.
    pub const SELF: Self = Self(0x7ff0);
}

impl std::fmt::Display for DomainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dom{}", self.0)
    }
}

/// An index into the granting domain's grant table.
#[repr(transparent)]
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, IntoBytes, Immutable, KnownLayout, FromBytes,
)]
pub struct GrantRefId(pub u32);

/// A grant reference: a capability letting `domain` exchange access to a
/// single page identified by `gref`.
///
/// For imported pages `domain` is the granting domain. For exported pages it
/// is the domain that was granted access.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct GrantRef {
    /// The remote side of the grant.
    pub domain: DomainId,
    /// The grant table entry.
    pub gref: GrantRefId,
}

/// The handle returned by a successful grant map operation, needed to unmap
/// the page again.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct GrantHandle(pub u32);

impl GrantHandle {
    /// No mapping was established.
    pub const INVALID: Self = Self(!0);

    /// Returns true if this handle refers to an established mapping.
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

/// Flags for a grant map operation.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct GrantMapFlags {
    /// Map for device (DMA) access.
    pub device_map: bool,
    /// Map into the host's address space.
    pub host_map: bool,
    /// Map without write access.
    pub readonly: bool,
    /// Map into the application's address space.
    pub application_map: bool,
    /// The host address refers to a page table entry.
    pub contains_pte: bool,
    #[bits(27)]
    _reserved: u32,
}

/// The status of a single grant table operation.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct GrantStatus(pub i16);

impl GrantStatus {
    /// The operation succeeded.
    pub const OKAY: Self = Self(0);
    /// Unspecified failure.
    pub const GENERAL_ERROR: Self = Self(-1);
    /// The domain id does not name a running domain.
    pub const BAD_DOMAIN: Self = Self(-2);
    /// The grant reference is not valid in the granting domain.
    pub const BAD_GNTREF: Self = Self(-3);
    /// The map handle is not valid.
    pub const BAD_HANDLE: Self = Self(-4);
    /// The host virtual address is not valid.
    pub const BAD_VIRT_ADDR: Self = Self(-5);
    /// The device address is not valid.
    pub const BAD_DEV_ADDR: Self = Self(-6);
    /// No space left for device mappings.
    pub const NO_DEVICE_SPACE: Self = Self(-7);
    /// The granting domain did not allow this access.
    pub const PERMISSION_DENIED: Self = Self(-8);
    /// The page frame is not valid.
    pub const BAD_PAGE: Self = Self(-9);
    /// The copy arguments are not valid.
    pub const BAD_COPY_ARG: Self = Self(-10);
    /// The address is too large.
    pub const ADDRESS_TOO_BIG: Self = Self(-11);
    /// The operation should be retried.
    pub const EAGAIN: Self = Self(-12);

    /// Returns true if the operation succeeded.
    pub fn is_ok(self) -> bool {
        self == Self::OKAY
    }

    /// Returns true if the status means the granting domain no longer (or
    /// never did) give this domain access to the page.
    pub fn is_access_revoked(self) -> bool {
        matches!(
            self,
            Self::BAD_DOMAIN | Self::BAD_GNTREF | Self::PERMISSION_DENIED
        )
    }

    fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::OKAY => "OKAY",
            Self::GENERAL_ERROR => "GENERAL_ERROR",
            Self::BAD_DOMAIN => "BAD_DOMAIN",
            Self::BAD_GNTREF => "BAD_GNTREF",
            Self::BAD_HANDLE => "BAD_HANDLE",
            Self::BAD_VIRT_ADDR => "BAD_VIRT_ADDR",
            Self::BAD_DEV_ADDR => "BAD_DEV_ADDR",
            Self::NO_DEVICE_SPACE => "NO_DEVICE_SPACE",
            Self::PERMISSION_DENIED => "PERMISSION_DENIED",
            Self::BAD_PAGE => "BAD_PAGE",
            Self::BAD_COPY_ARG => "BAD_COPY_ARG",
            Self::ADDRESS_TOO_BIG => "ADDRESS_TOO_BIG",
            Self::EAGAIN => "EAGAIN",
            _ => return None,
        };
        Some(name)
    }
}

impl Debug for GrantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => f.pad(name),
            None => write!(f, "GrantStatus({})", self.0),
        }
    }
}

/// The header of a grant reference list as exchanged with a remote domain.
///
/// The header is followed by `count` [`GrantRefId`] values in page order.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct GrantRefListHeader {
    /// The domain the references were granted to.
    pub domain: DomainId,
    /// Must be zero.
    pub reserved: u16,
    /// The number of references that follow.
    pub count: u32,
}

const_assert_eq!(size_of::<GrantRefListHeader>(), 8);

/// Error returned when a grant reference list cannot be decoded.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RefListError {
    /// The buffer is too short to hold the header.
    #[error("grant ref list truncated before header end")]
    TruncatedHeader,
    /// The reserved header field is not zero.
    #[error("grant ref list reserved field is {0:#x}")]
    Reserved(u16),
    /// The buffer length does not match the header's count.
    #[error("grant ref list holds {actual} bytes of refs, header claims {count} refs")]
    CountMismatch {
        /// The count from the header.
        count: u32,
        /// The number of bytes following the header.
        actual: usize,
    },
}

/// Encodes grant references for `domain` in the order given.
pub fn encode_ref_list(domain: DomainId, refs: &[GrantRefId]) -> Vec<u8> {
    let header = GrantRefListHeader {
        domain,
        reserved: 0,
        count: refs.len() as u32,
    };
    let mut buf = Vec::with_capacity(size_of::<GrantRefListHeader>() + refs.as_bytes().len());
    buf.extend_from_slice(header.as_bytes());
    buf.extend_from_slice(refs.as_bytes());
    buf
}

/// Decodes a list produced by [`encode_ref_list`], preserving order.
pub fn decode_ref_list(buf: &[u8]) -> Result<(DomainId, Vec<GrantRefId>), RefListError> {
    let (header, rest) =
        GrantRefListHeader::read_from_prefix(buf).map_err(|_| RefListError::TruncatedHeader)?;
    if header.reserved != 0 {
        return Err(RefListError::Reserved(header.reserved));
    }
    let entry_size = size_of::<GrantRefId>();
    if rest.len() % entry_size != 0 || rest.len() / entry_size != header.count as usize {
        return Err(RefListError::CountMismatch {
            count: header.count,
            actual: rest.len(),
        });
    }
    let refs = rest
        .chunks_exact(entry_size)
        .map(|chunk| GrantRefId(u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])))
        .collect();
    Ok((header.domain, refs))
}

/// Returns the number of pages needed to back `len` bytes.
pub const fn pages_for_len(len: u64) -> u64 {
    len.div_ceil(PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ref_list_preserves_order() {
        let refs = [GrantRefId(9), GrantRefId(3), GrantRefId(70000), GrantRefId(4)];
        let buf = encode_ref_list(DomainId(9), &refs);
        assert_eq!(buf.len(), 8 + 4 * 4);

        let (domain, decoded) = decode_ref_list(&buf).unwrap();
        assert_eq!(domain, DomainId(9));
        assert_eq!(decoded, refs);
    }

    #[test]
    fn ref_list_rejects_bad_lengths() {
        assert_eq!(
            decode_ref_list(&[0; 4]).unwrap_err(),
            RefListError::TruncatedHeader
        );

        let mut buf = encode_ref_list(DomainId(1), &[GrantRefId(5), GrantRefId(6)]);
        buf.pop();
        assert!(matches!(
            decode_ref_list(&buf).unwrap_err(),
            RefListError::CountMismatch { count: 2, .. }
        ));

        let mut buf = encode_ref_list(DomainId(1), &[]);
        buf[2] = 1;
        assert_eq!(decode_ref_list(&buf).unwrap_err(), RefListError::Reserved(1));
    }

    #[test]
    fn status_classification() {
        assert!(GrantStatus::OKAY.is_ok());
        assert!(GrantStatus::PERMISSION_DENIED.is_access_revoked());
        assert!(GrantStatus::BAD_GNTREF.is_access_revoked());
        assert!(!GrantStatus::EAGAIN.is_access_revoked());
        assert_eq!(format!("{:?}", GrantStatus::BAD_HANDLE), "BAD_HANDLE");
        assert_eq!(format!("{:?}", GrantStatus(-99)), "GrantStatus(-99)");
    }

    #[test]
    fn map_flags_bits() {
        let flags = GrantMapFlags::new().with_host_map(true).with_readonly(true);
        assert_eq!(u32::from(flags), 0b110);
    }

    #[test]
    fn page_rounding() {
        assert_eq!(pages_for_len(0), 0);
        assert_eq!(pages_for_len(1), 1);
        assert_eq!(pages_for_len(PAGE_SIZE), 1);
        assert_eq!(pages_for_len(PAGE_SIZE + 1), 2);
    }
}
