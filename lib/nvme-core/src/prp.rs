// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Physical Region Page (PRP) construction.
//!
//! A payload that fits one page travels in PRP1 alone; one that crosses a
//! single page boundary uses PRP1 plus PRP2; anything larger needs a
//! page-sized PRP list holding the remaining page addresses, allocated
//! from a fixed pool owned here.
//!
//! See NVMe 1.4 Section 4.3 Physical Region Page Entry and List

use std::sync::Mutex;

use thiserror::Error;

use crate::bits::SubmissionQueueEntry;
use crate::common::{DmaBuffer, PageParams, Payload, PhysAddr};
use crate::platform::{DmaOps, PlatformError};

/// Errors from PRP construction.
#[derive(Debug, Error)]
pub enum PrpError {
    /// All descriptor lists are in use. The request must not be submitted.
    #[error("no free PRP descriptor list")]
    Exhausted,

    /// The payload spans more pages than a single PRP list can describe.
    /// The transfer-size limit normally prevents this.
    #[error("payload spans {pages} pages, limit is {max}")]
    TooManyPages { pages: usize, max: usize },
}

/// Handle to a PRP list owned by a request; an index into the pool.
pub type PrpListHandle = u16;

/// Fixed-capacity pool of page-sized PRP list buffers.
///
/// Allocation and release are free-list pop/push under a short critical
/// section, callable from both thread and interrupt context.
pub struct PrpListPool {
    lists: Box<[DmaBuffer]>,
    free: Mutex<Vec<u16>>,
    page: PageParams,
}

impl PrpListPool {
    pub fn new(
        capacity: u16,
        page: PageParams,
        dma: &dyn DmaOps,
    ) -> Result<Self, PlatformError> {
        let mut lists = Vec::with_capacity(capacity as usize);
        for _ in 0..capacity {
            lists.push(dma.alloc(page.size())?);
        }
        let free = (0..capacity).rev().collect();
        Ok(Self { lists: lists.into_boxed_slice(), free: Mutex::new(free), page })
    }

    /// Entries one list can hold: one 64-bit pointer per 8 bytes of page.
    pub fn entries_per_list(&self) -> usize {
        self.page.size() / 8
    }

    fn allocate(&self) -> Option<PrpListHandle> {
        self.free.lock().unwrap().pop()
    }

    /// Return a list to the pool, scrubbing its contents so stale page
    /// addresses cannot leak into a future reuse.
    pub fn release(&self, handle: PrpListHandle) {
        self.lists[handle as usize].zero();
        self.free.lock().unwrap().push(handle);
    }

    fn addr(&self, handle: PrpListHandle) -> PhysAddr {
        self.lists[handle as usize].addr()
    }

    fn write_entry(&self, handle: PrpListHandle, slot: usize, addr: PhysAddr) {
        self.lists[handle as usize].write::<u64>(slot * 8, addr.0);
    }

    #[cfg(test)]
    pub fn free_count(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    #[cfg(test)]
    pub fn entry(&self, handle: PrpListHandle, slot: usize) -> u64 {
        self.lists[handle as usize].read::<u64>(slot * 8)
    }
}

/// Populate a command's data-pointer fields for `payload`.
///
/// Returns the PRP list handle the request now owns, if one was needed.
/// On failure the command is untouched as far as hardware is concerned
/// and nothing is left allocated.
pub fn build_data_pointer(
    sqe: &mut SubmissionQueueEntry,
    payload: Option<&Payload>,
    pool: &PrpListPool,
) -> Result<Option<PrpListHandle>, PrpError> {
    let payload = match payload {
        // No payload: the data-pointer fields stay as the command builder
        // left them (create-queue commands preset PRP1 themselves).
        None => return Ok(None),
        Some(p) => p,
    };

    let page = pool.page;
    let pages = page.pages_spanned(payload.addr, payload.len);
    match pages {
        0 => Ok(None),
        1 => {
            sqe.prp1 = payload.addr.0;
            sqe.prp2 = 0;
            Ok(None)
        }
        2 => {
            sqe.prp1 = payload.addr.0;
            sqe.prp2 = next_page(payload.addr, page).0;
            Ok(None)
        }
        n => {
            // One list describes the first-page remainder plus a full
            // list of entries; deeper chains are out of scope and the
            // transfer-size limit keeps us under this.
            if n - 1 > pool.entries_per_list() {
                return Err(PrpError::TooManyPages {
                    pages: n,
                    max: pool.entries_per_list() + 1,
                });
            }
            let handle = pool.allocate().ok_or(PrpError::Exhausted)?;
            let mut entry = next_page(payload.addr, page);
            for slot in 0..(n - 1) {
                pool.write_entry(handle, slot, entry);
                entry = PhysAddr(entry.0 + page.size() as u64);
            }
            sqe.prp1 = payload.addr.0;
            sqe.prp2 = pool.addr(handle).0;
            Ok(Some(handle))
        }
    }
}

/// Base address of the page following the one containing `addr`.
fn next_page(addr: PhysAddr, page: PageParams) -> PhysAddr {
    PhysAddr(addr.page_base(page).0 + page.size() as u64)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::IdentityDma;

    const PAGE_4K: PageParams = PageParams { shift: 12 };

    fn pool(capacity: u16) -> PrpListPool {
        PrpListPool::new(capacity, PAGE_4K, &IdentityDma).unwrap()
    }

    fn sqe() -> SubmissionQueueEntry {
        SubmissionQueueEntry::default()
    }

    #[test]
    fn no_payload_leaves_pointers_alone() {
        let pool = pool(1);
        let mut cmd = sqe();
        cmd.prp1 = 0xABCD_E000;
        let handle = build_data_pointer(&mut cmd, None, &pool).unwrap();
        assert!(handle.is_none());
        assert_eq!({ cmd.prp1 }, 0xABCD_E000);
    }

    #[test]
    fn single_page_uses_prp1_only() {
        let pool = pool(1);
        let mut cmd = sqe();
        let payload = Payload { addr: PhysAddr(0x10200), len: 0x200 };
        let handle =
            build_data_pointer(&mut cmd, Some(&payload), &pool).unwrap();
        assert!(handle.is_none());
        assert_eq!({ cmd.prp1 }, 0x10200);
        assert_eq!({ cmd.prp2 }, 0);
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn two_pages_use_direct_pointers() {
        let pool = pool(1);
        let mut cmd = sqe();
        // Unaligned start, 4096 bytes: touches two pages.
        let payload = Payload { addr: PhysAddr(0x10800), len: 0x1000 };
        let handle =
            build_data_pointer(&mut cmd, Some(&payload), &pool).unwrap();
        assert!(handle.is_none());
        assert_eq!({ cmd.prp1 }, 0x10800);
        assert_eq!({ cmd.prp2 }, 0x11000);
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn three_pages_need_one_list_with_two_entries() {
        let pool = pool(2);
        let mut cmd = sqe();
        // Unaligned start, two pages of data: ceil((0x800 + 0x2000)/4K) = 3.
        let payload = Payload { addr: PhysAddr(0x10800), len: 0x2000 };
        let handle = build_data_pointer(&mut cmd, Some(&payload), &pool)
            .unwrap()
            .expect("descriptor list allocated");
        assert_eq!({ cmd.prp1 }, 0x10800);
        assert_eq!({ cmd.prp2 }, pool.addr(handle).0);
        assert_eq!(pool.entry(handle, 0), 0x11000);
        assert_eq!(pool.entry(handle, 1), 0x12000);
        // Third slot untouched.
        assert_eq!(pool.entry(handle, 2), 0);
        assert_eq!(pool.free_count(), 1);

        pool.release(handle);
        assert_eq!(pool.free_count(), 2);
        // Scrubbed on release.
        assert_eq!(pool.entry(handle, 0), 0);
    }

    #[test]
    fn list_pool_exhaustion_is_an_error() {
        let pool = pool(1);
        let payload = Payload { addr: PhysAddr(0x10000), len: 0x4000 };
        let mut cmd = sqe();
        let held = build_data_pointer(&mut cmd, Some(&payload), &pool)
            .unwrap()
            .unwrap();

        let mut cmd2 = sqe();
        let err =
            build_data_pointer(&mut cmd2, Some(&payload), &pool).unwrap_err();
        assert!(matches!(err, PrpError::Exhausted));
        // The failed build must not touch the command.
        assert_eq!({ cmd2.prp1 }, 0);

        pool.release(held);
        assert!(build_data_pointer(&mut cmd2, Some(&payload), &pool)
            .unwrap()
            .is_some());
    }
}
