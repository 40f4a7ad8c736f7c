// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Namespaces and the block-device adapter.
//!
//! A [`Namespace`] caches the Identify Namespace payload and the geometry
//! derived from it, and translates block-oriented calls into read, write,
//! and flush commands on the controller's first I/O queue. Callers get
//! synchronous semantics; underneath each call is the usual
//! submit-then-callback path with a one-shot wait.

use std::sync::{Arc, Weak};

use bitflags::bitflags;

use crate::bits::IdentifyNamespace;
use crate::block::BlockDevice;
use crate::cmds::{FlushCmd, ReadCmd, WriteCmd};
use crate::common::Payload;
use crate::controller::Controller;
use crate::NvmeError;

bitflags! {
    /// Per-namespace capability flags, derived from controller-wide
    /// feature bits at discovery time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NsFeatures: u32 {
        /// Dataset Management deallocate is usable on this namespace.
        const DEALLOCATE = 1 << 0;
        /// A volatile write cache exists, so Flush is meaningful.
        const FLUSH = 1 << 1;
    }
}

/// One logical volume of a controller. Read-only after discovery apart
/// from the I/O entry points.
pub struct Namespace {
    ctrl: Weak<Controller>,
    id: u32,
    ident: Box<IdentifyNamespace>,
    sector_size: u32,
    sector_count: u64,
    /// Optimal I/O boundary in bytes; zero when the controller does not
    /// report one.
    stripe_size: u32,
    flags: NsFeatures,
    name: String,
    log: slog::Logger,
}

impl Namespace {
    pub(crate) fn new(
        ctrl: &Arc<Controller>,
        id: u32,
        ident: IdentifyNamespace,
        vwc: bool,
        dsm: bool,
        name: String,
        log: slog::Logger,
    ) -> Arc<Self> {
        let lbaf = ident.current_lba_format();
        let sector_size = lbaf.data_size() as u32;
        let mut flags = NsFeatures::empty();
        if vwc {
            flags |= NsFeatures::FLUSH;
        }
        if dsm {
            flags |= NsFeatures::DEALLOCATE;
        }
        let log = log.new(slog::o!("ns" => id));
        Arc::new(Self {
            ctrl: Arc::downgrade(ctrl),
            id,
            sector_size,
            sector_count: ident.nsze,
            stripe_size: ident.noiob as u32 * sector_size,
            flags,
            name,
            ident: Box::new(ident),
            log,
        })
    }

    pub fn nsid(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    pub fn sector_count(&self) -> u64 {
        self.sector_count
    }

    pub fn stripe_size(&self) -> u32 {
        self.stripe_size
    }

    pub fn features(&self) -> NsFeatures {
        self.flags
    }

    pub fn identify_data(&self) -> &IdentifyNamespace {
        &self.ident
    }

    /// Read `count` sectors starting at `start_sector` into `buf`,
    /// blocking until the transfer completes.
    pub fn read(
        &self,
        start_sector: u64,
        count: u32,
        buf: &mut [u8],
    ) -> Result<(), NvmeError> {
        self.rw(false, start_sector, count, buf.as_ptr(), buf.len())
    }

    /// Write `count` sectors starting at `start_sector` from `buf`,
    /// blocking until the transfer completes.
    pub fn write(
        &self,
        start_sector: u64,
        count: u32,
        buf: &[u8],
    ) -> Result<(), NvmeError> {
        self.rw(true, start_sector, count, buf.as_ptr(), buf.len())
    }

    /// Commit the volatile write cache. Only valid on namespaces with
    /// the FLUSH capability flag; callers are expected to check.
    pub fn flush(&self) -> Result<(), NvmeError> {
        if !self.flags.contains(NsFeatures::FLUSH) {
            return Err(NvmeError::FlushUnsupported(self.id));
        }
        let ctrl = self.ctrl.upgrade().ok_or(NvmeError::ControllerGone)?;
        let (waiter, qp) =
            ctrl.submit_io(FlushCmd { nsid: self.id }.build(), None)?;
        waiter.wait(&qp)?.into_result().map(|_| ())
    }

    fn rw(
        &self,
        write: bool,
        start_sector: u64,
        count: u32,
        buf: *const u8,
        buf_len: usize,
    ) -> Result<(), NvmeError> {
        if count == 0 {
            return Ok(());
        }
        let len = count as usize * self.sector_size as usize;
        if buf_len < len {
            return Err(NvmeError::ShortBuffer { need: len, have: buf_len });
        }
        // The wire NLB field is 16 bits (0's based).
        if count > u16::MAX as u32 {
            return Err(NvmeError::TransferTooLarge {
                len,
                max: u16::MAX as usize * self.sector_size as usize,
            });
        }

        let ctrl = self.ctrl.upgrade().ok_or(NvmeError::ControllerGone)?;
        let addr = ctrl.dma().map_host(buf, len)?;
        let sqe = if write {
            WriteCmd { nsid: self.id, slba: start_sector, nlb: count as u16 }
                .build()
        } else {
            ReadCmd { nsid: self.id, slba: start_sector, nlb: count as u16 }
                .build()
        };

        let (waiter, qp) =
            ctrl.submit_io(sqe, Some(Payload { addr, len }))?;
        match waiter.wait(&qp)?.into_result() {
            Ok(_) => Ok(()),
            Err(e) => {
                slog::warn!(self.log, "I/O failed: {}", e;
                    "op" => if write { "write" } else { "read" },
                    "slba" => start_sector,
                    "count" => count,
                );
                Err(e)
            }
        }
    }
}

impl BlockDevice for Namespace {
    fn read(&self, start_sector: u64, count: u32, buf: &mut [u8]) -> Result<(), NvmeError> {
        Namespace::read(self, start_sector, count, buf)
    }

    fn write(&self, start_sector: u64, count: u32, buf: &[u8]) -> Result<(), NvmeError> {
        Namespace::write(self, start_sector, count, buf)
    }

    fn flush(&self) -> Result<(), NvmeError> {
        Namespace::flush(self)
    }

    fn sector_count(&self) -> u64 {
        self.sector_count
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }
}
