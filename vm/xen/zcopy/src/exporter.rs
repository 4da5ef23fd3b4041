// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Grants remote domains access to the pages of local buffers.

use crate::buffer::Grants;
use crate::buffer::SharedBuffer;
use crate::Error;
use gntdef::DomainId;
use gntdef::GrantRef;
use gnttab::GrantAccess;
use std::sync::Arc;

/// The grant state of an exported buffer.
pub(crate) struct ExportedGrants {
    access: Arc<dyn GrantAccess>,
    remote_domain: DomainId,
    /// One per page, in page order.
    refs: Vec<GrantRef>,
}

impl ExportedGrants {
    pub fn remote_domain(&self) -> DomainId {
        self.remote_domain
    }

    pub fn refs(&self) -> &[GrantRef] {
        &self.refs
    }
}

/// Grants remote domains access to existing local buffers.
pub struct GrantExporter {
    access: Arc<dyn GrantAccess>,
    readonly: bool,
}

impl GrantExporter {
    /// Returns a new exporter granting access through `access`.
    pub fn new(access: Arc<dyn GrantAccess>, readonly: bool) -> Self {
        Self { access, readonly }
    }

    /// Grants `remote_domain` access to every page of `buffer`.
    ///
    /// The returned references are in the buffer's page order, which is how
    /// the remote domain reassembles the buffer. On failure nothing stays
    /// granted and the buffer is unchanged.
    pub fn export(
        &self,
        buffer: &SharedBuffer,
        remote_domain: DomainId,
    ) -> Result<Vec<GrantRef>, Error> {
        let mut state = buffer.state();
        if !matches!(state.grants, Grants::None) {
            return Err(Error::AlreadyShared);
        }
        if state.pages.is_empty() {
            return Err(Error::InvalidArgument("buffer has no pages to export"));
        }

        let mut reservation = self.access.reserve_refs(state.pages.len()).map_err(|err| {
            tracing::debug!(
                error = &err as &dyn std::error::Error,
                "grant reference reservation failed"
            );
            Error::NoGrantSlots
        })?;

        let mut refs = Vec::with_capacity(state.pages.len());
        for page in &state.pages {
            let Some(gref) = self.access.claim_ref(&mut reservation) else {
                tracing::debug!(
                    %remote_domain,
                    granted = refs.len(),
                    pages = state.pages.len(),
                    "grant reservation exhausted, rolling back export"
                );
                let partial = ExportedGrants {
                    access: self.access.clone(),
                    remote_domain,
                    refs,
                };
                if let Err(err) = revoke(partial) {
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        %remote_domain,
                        "failed to roll back partial export"
                    );
                }
                self.access.release_reservation(reservation);
                return Err(Error::NoGrantSlots);
            };
            self.access
                .grant_foreign_access(gref, remote_domain, page.pfn(), self.readonly);
            refs.push(GrantRef {
                domain: remote_domain,
                gref,
            });
        }
        self.access.release_reservation(reservation);

        tracing::debug!(%remote_domain, pages = refs.len(), "exported buffer");
        state.grants = Grants::Exported(ExportedGrants {
            access: self.access.clone(),
            remote_domain,
            refs: refs.clone(),
        });
        Ok(refs)
    }
}

/// Ends foreign access for every reference in `grants`.
///
/// Every reference is consumed whether or not revocation succeeds. The error
/// names the page indices the remote domain still maps.
pub(crate) fn revoke(grants: ExportedGrants) -> Result<(), Error> {
    let total = grants.refs.len();
    let mut refused = Vec::new();
    for (index, grant) in grants.refs.into_iter().enumerate() {
        if let Err(err) = grants.access.end_foreign_access(grant.gref) {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                gref = grant.gref.0,
                remote_domain = %grant.domain,
                "failed to end foreign access"
            );
            refused.push(index);
        }
    }
    if !refused.is_empty() {
        return Err(Error::RevokeRefused {
            pages: refused,
            total,
        });
    }
    Ok(())
}
