// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The fixed-capacity request pool.
//!
//! Every outstanding command is one slot here. A slot's index *is* the
//! command identifier stamped into the submission entry, which makes
//! completion-to-request matching a bounds check plus an array index --
//! no allocation, no search, safe from interrupt context.

use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use crate::bits::SubmissionQueueEntry;
use crate::cmds::CmdOutcome;
use crate::common::Payload;
use crate::prp::{PrpListHandle, PrpListPool};
use crate::NvmeError;

/// Completion callback: invoked exactly once per live request, with either
/// the completion record or the timed-out indicator.
pub type CmdCallback = Box<dyn FnOnce(CmdOutcome) + Send>;

/// One request control block.
///
/// A request is either free (on the pool's free list) or live (owned by a
/// queue pair's pending list) -- never both, never neither.
#[derive(Default)]
pub struct Request {
    /// The built command. The CID field is stamped at submit time.
    pub sqe: SubmissionQueueEntry,

    /// Data buffer, if the command transfers any.
    pub payload: Option<Payload>,

    /// PRP descriptor list owned by this request, released with it.
    pub prp_list: Option<PrpListHandle>,

    /// Retries consumed so far.
    pub retries: u8,

    /// When the request was last written to hardware; refreshed on retry.
    pub submitted_at: Option<Instant>,

    /// Terminal-outcome callback. Taking this is how a finalizer claims
    /// the request; a `None` here means someone else already did.
    pub callback: Option<CmdCallback>,

    /// Whether the slot is allocated.
    pub live: bool,
}

/// Fixed-capacity pool of [`Request`] slots with an index free list.
///
/// The free list is a short critical section; per-slot state has its own
/// lock so the completion path never contends with unrelated submissions.
pub struct RequestPool {
    slots: Box<[Mutex<Request>]>,
    free: Mutex<Vec<u16>>,
}

impl RequestPool {
    pub fn new(capacity: u16) -> Self {
        let slots = (0..capacity)
            .map(|_| Mutex::new(Request::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        // Pop order: lowest index first.
        let free = (0..capacity).rev().collect();
        Self { slots, free: Mutex::new(free) }
    }

    pub fn capacity(&self) -> u16 {
        self.slots.len() as u16
    }

    /// Claim a slot and fill it with a fresh request.
    ///
    /// Fails immediately when the pool is dry; never blocks.
    pub fn allocate(
        &self,
        sqe: SubmissionQueueEntry,
        payload: Option<Payload>,
        callback: CmdCallback,
    ) -> Result<u16, NvmeError> {
        let idx = self
            .free
            .lock()
            .unwrap()
            .pop()
            .ok_or(NvmeError::RequestsExhausted)?;
        let mut slot = self.slots[idx as usize].lock().unwrap();
        debug_assert!(!slot.live);
        *slot = Request {
            sqe,
            payload,
            prp_list: None,
            retries: 0,
            submitted_at: None,
            callback: Some(callback),
            live: true,
        };
        Ok(idx)
    }

    /// Look up a slot by command identifier. Out-of-range identifiers
    /// return `None`; the caller logs and drops the completion.
    pub fn slot(&self, idx: u16) -> Option<&Mutex<Request>> {
        self.slots.get(idx as usize)
    }

    /// Free a slot whose lock the caller already holds.
    ///
    /// Scrubs the slot (stale pointers and lengths must not survive into
    /// a future reuse), releases any owned PRP list, and pushes the index
    /// back on the free list.
    pub fn release_locked(
        &self,
        idx: u16,
        slot: &mut MutexGuard<'_, Request>,
        prps: &PrpListPool,
    ) {
        debug_assert!(slot.live);
        if let Some(handle) = slot.prp_list.take() {
            prps.release(handle);
        }
        **slot = Request::default();
        self.free.lock().unwrap().push(idx);
    }

    #[cfg(test)]
    pub fn free_count(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}
