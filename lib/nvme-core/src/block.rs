// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The boundary to the generic block-device collaborator.
//!
//! The driver exposes each discovered namespace as a [`BlockDevice`];
//! the block layer implements [`BlockRegistrar`] to receive them by name
//! and route external I/O to the entry points.

use std::sync::Arc;

use crate::NvmeError;

/// Block-oriented entry points exposed per namespace.
///
/// All three I/O calls block the caller until the command completes and
/// map command errors and timeouts to an error return.
pub trait BlockDevice: Send + Sync {
    fn read(
        &self,
        start_sector: u64,
        count: u32,
        buf: &mut [u8],
    ) -> Result<(), NvmeError>;

    fn write(
        &self,
        start_sector: u64,
        count: u32,
        buf: &[u8],
    ) -> Result<(), NvmeError>;

    fn flush(&self) -> Result<(), NvmeError>;

    fn sector_count(&self) -> u64;

    fn sector_size(&self) -> u32;
}

/// Implemented by the block layer; consumed during namespace discovery.
pub trait BlockRegistrar {
    /// Take ownership of a newly discovered device under `name`.
    fn register(&self, name: &str, dev: Arc<dyn BlockDevice>);
}
