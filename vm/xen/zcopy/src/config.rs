// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

/// Configuration for a [`ZcopyDevice`](crate::ZcopyDevice).
#[derive(Debug, Clone)]
pub struct ZcopyConfig {
    /// The largest number of grant references a single import or export may
    /// use.
    pub max_grefs: usize,
    /// The timeout used by waits that do not specify one.
    pub default_wait_timeout: Duration,
    /// Grant remote domains read-only access to exported buffers.
    pub grant_readonly: bool,
    /// Map imported buffers read-only.
    pub map_readonly: bool,
}

impl Default for ZcopyConfig {
    fn default() -> Self {
        Self {
            max_grefs: 2048,
            default_wait_timeout: Duration::from_secs(3),
            grant_readonly: false,
            map_readonly: false,
        }
    }
}
