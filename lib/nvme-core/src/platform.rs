// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The boundary to the bus/platform collaborator.
//!
//! Enumerating the device, mapping its register window, and allocating
//! interrupt vectors all happen before this crate is involved; the
//! collaborator hands over the results as a [`DeviceHandle`]. Everything
//! the core needs from the outside world is expressed as one of the traits
//! below so the whole driver can be exercised against simulated hardware.

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

use crate::common::{DmaBuffer, PhysAddr};

/// Errors surfaced by platform collaborators.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("interrupt vector binding failed: {0}")]
    VectorBind(String),

    #[error("DMA allocation of {0} bytes failed")]
    DmaAlloc(usize),

    #[error("host buffer is not DMA-addressable")]
    DmaMap,
}

/// An already-mapped MMIO register window.
///
/// Offsets are byte offsets from the start of the controller register
/// block. 64-bit registers may be accessed as two 32-bit halves
/// (low dword first), which is what the default implementations do.
pub trait Mmio: Send + Sync {
    fn read32(&self, off: usize) -> u32;
    fn write32(&self, off: usize, val: u32);

    fn read64(&self, off: usize) -> u64 {
        let lo = self.read32(off) as u64;
        let hi = self.read32(off + 4) as u64;
        hi << 32 | lo
    }

    fn write64(&self, off: usize, val: u64) {
        self.write32(off, val as u32);
        self.write32(off + 4, (val >> 32) as u32);
    }
}

/// One allocated message-signaled interrupt vector.
///
/// The core binds each queue pair's completion handler to the vector the
/// bus collaborator assigned to that queue id. The handler may be invoked
/// from interrupt context; it must not block.
pub trait MsiVector: Send + Sync {
    fn bind(
        &self,
        priority: u8,
        handler: Box<dyn Fn() + Send + Sync>,
    ) -> Result<(), PlatformError>;
}

/// DMA memory services.
pub trait DmaOps: Send + Sync {
    /// Allocate a zeroed, page-aligned region visible to the device.
    fn alloc(&self, len: usize) -> Result<DmaBuffer, PlatformError>;

    /// Resolve the device-visible address of an externally-owned host
    /// buffer (a block-layer payload). The buffer must be physically
    /// contiguous over `len` bytes.
    fn map_host(&self, ptr: *const u8, len: usize) -> Result<PhysAddr, PlatformError>;
}

/// A one-shot timer used for the request timeout sweep.
///
/// `arm` replaces any previously armed deadline. The platform invokes the
/// callback the timer was created with (see [`TimerFactory`]) once the
/// deadline passes; the callback re-arms as needed.
pub trait DeferredTimer: Send + Sync {
    fn arm(&self, deadline: Instant);
    fn cancel(&self);
}

/// Factory for [`DeferredTimer`]s, one per queue pair.
pub trait TimerFactory: Send + Sync {
    fn create(&self, on_fire: Box<dyn Fn() + Send + Sync>) -> Arc<dyn DeferredTimer>;
}

/// PCI-style bus/device/function identifier of the controller.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PciLocation {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl std::fmt::Display for PciLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02x}:{:02x}.{:x}", self.bus, self.device, self.function)
    }
}

/// Everything the bus collaborator hands the core at attach time.
pub struct DeviceHandle {
    /// The mapped controller register block.
    pub regs: Arc<dyn Mmio>,

    /// Where the device lives on the bus.
    pub location: PciLocation,

    /// Stable controller index assigned by the collaborator; used to name
    /// namespaces ("nvme2n1" is namespace 1 of controller instance 2).
    pub instance: u32,

    /// Allocated interrupt vectors. Vector `i` services queue id `i`; the
    /// usable I/O queue count is capped at one less than this length.
    pub vectors: Vec<Arc<dyn MsiVector>>,

    /// DMA memory services.
    pub dma: Arc<dyn DmaOps>,

    /// Timeout sweep timers.
    pub timers: Arc<dyn TimerFactory>,
}
