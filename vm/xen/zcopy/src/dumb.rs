// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Geometry of linear ("dumb") scanout buffers.

use gntdef::pages_for_len;

/// The dimensions of a linear buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BufferGeometry {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Bits per pixel.
    pub bpp: u32,
}

impl BufferGeometry {
    /// Bytes per row. `None` on overflow.
    pub fn pitch(&self) -> Option<u64> {
        u64::from(self.width).checked_mul(u64::from(self.bpp.div_ceil(8)))
    }

    /// Total bytes. `None` on overflow.
    pub fn size(&self) -> Option<u64> {
        self.pitch()?.checked_mul(u64::from(self.height))
    }

    /// Pages needed to back the buffer. `None` on overflow.
    pub fn page_count(&self) -> Option<u64> {
        Some(pages_for_len(self.size()?))
    }
}
