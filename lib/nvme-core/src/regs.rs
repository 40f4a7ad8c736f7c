// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed access to the controller register block.
//!
//! See NVMe 1.4 Section 3.1 Register Definition for the layout. The
//! doorbell array starts at `DOORBELL_BASE` and is indexed by queue id
//! and the stride advertised in CAP.DSTRD.

use std::sync::Arc;

use crate::bits::{AdminQueueAttrs, Capabilities, Configuration, Status};
use crate::common::PhysAddr;
use crate::platform::Mmio;
use crate::NvmeError;

/// Controller register byte offsets.
pub const REG_CAP: usize = 0x00;
pub const REG_VS: usize = 0x08;
pub const REG_INTMS: usize = 0x0C;
pub const REG_INTMC: usize = 0x10;
pub const REG_CC: usize = 0x14;
pub const REG_CSTS: usize = 0x1C;
pub const REG_NSSR: usize = 0x20;
pub const REG_AQA: usize = 0x24;
pub const REG_ASQ: usize = 0x28;
pub const REG_ACQ: usize = 0x30;
pub const REG_CMBLOC: usize = 0x38;
pub const REG_CMBSZ: usize = 0x3C;
pub const REG_PMRCAP: usize = 0xE00;
pub const REG_PMRCTL: usize = 0xE04;

/// Start of the doorbell register array.
pub const DOORBELL_BASE: usize = 0x1000;

/// The all-ones value a dead or surprise-removed device returns for every
/// register read.
const REG_GONE: u32 = u32::MAX;

/// Doorbell offsets for one queue pair.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Doorbells {
    /// Submission Queue y Tail Doorbell offset.
    pub sq_tail: usize,
    /// Completion Queue y Head Doorbell offset.
    pub cq_head: usize,
}

/// Handle to the mapped register block with typed accessors.
#[derive(Clone)]
pub struct CtrlRegs {
    mmio: Arc<dyn Mmio>,
}

impl CtrlRegs {
    pub fn new(mmio: Arc<dyn Mmio>) -> Self {
        Self { mmio }
    }

    /// Read a 32-bit register, failing if the device has disappeared from
    /// the bus (reads as all ones).
    fn read32_checked(&self, off: usize) -> Result<u32, NvmeError> {
        match self.mmio.read32(off) {
            REG_GONE => Err(NvmeError::DeviceGone),
            val => Ok(val),
        }
    }

    pub fn cap(&self) -> Result<Capabilities, NvmeError> {
        // Check the low dword for the gone sentinel before assembling the
        // full 64-bit value.
        let lo = self.read32_checked(REG_CAP)? as u64;
        let hi = self.mmio.read32(REG_CAP + 4) as u64;
        Ok(Capabilities(hi << 32 | lo))
    }

    pub fn vs(&self) -> Result<u32, NvmeError> {
        self.read32_checked(REG_VS)
    }

    pub fn cc(&self) -> Result<Configuration, NvmeError> {
        Ok(Configuration(self.read32_checked(REG_CC)?))
    }

    pub fn set_cc(&self, cc: Configuration) {
        self.mmio.write32(REG_CC, cc.0);
    }

    pub fn csts(&self) -> Result<Status, NvmeError> {
        Ok(Status(self.read32_checked(REG_CSTS)?))
    }

    pub fn set_aqa(&self, aqa: AdminQueueAttrs) {
        self.mmio.write32(REG_AQA, aqa.0);
    }

    pub fn set_asq(&self, base: PhysAddr) {
        self.mmio.write64(REG_ASQ, base.0);
    }

    pub fn set_acq(&self, base: PhysAddr) {
        self.mmio.write64(REG_ACQ, base.0);
    }

    /// Doorbell offsets for queue id `qid` at doorbell stride `dstrd`.
    ///
    /// Submission Queue y Tail Doorbell offset
    ///   = 0x1000 + (2y) * (4 << CAP.DSTRD)
    /// Completion Queue y Head Doorbell offset
    ///   = 0x1000 + (2y + 1) * (4 << CAP.DSTRD)
    ///
    /// See NVMe 1.4 Section 3.1.24 & 3.1.25
    pub fn doorbells(qid: u16, dstrd: u8) -> Doorbells {
        let stride = 4usize << dstrd;
        Doorbells {
            sq_tail: DOORBELL_BASE + (2 * qid as usize) * stride,
            cq_head: DOORBELL_BASE + (2 * qid as usize + 1) * stride,
        }
    }

    /// Ring a doorbell. Doorbell registers are 32 bits with the top half
    /// reserved.
    pub fn ring_doorbell(&self, off: usize, val: u16) {
        self.mmio.write32(off, val as u32);
    }
}
