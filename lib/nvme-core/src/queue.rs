// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Queue pairs: ring discipline, submission, and completion handling.
//!
//! One [`QueuePair`] drives one hardware queue (admin or I/O): the
//! submission ring it writes, the completion ring it drains, the two
//! doorbells, and the pending list the timeout sweep walks.
//!
//! Lock order, outermost first: completion ring, request slot, submission
//! ring, pending list. The pending list is never held while taking a
//! slot lock.

use std::collections::VecDeque;
use std::mem::size_of;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering::Relaxed};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use crate::bits::{CompletionQueueEntry, SubmissionQueueEntry};
use crate::cmds::{completion_retriable, CmdOutcome};
use crate::common::{DmaBuffer, PhysAddr};
use crate::platform::{DeferredTimer, DmaOps, MsiVector, TimerFactory};
use crate::pool::{CmdCallback, Request, RequestPool};
use crate::prp::{build_data_pointer, PrpListPool};
use crate::regs::{CtrlRegs, Doorbells};
use crate::NvmeError;

/// Each queue is identified by a 16-bit ID.
///
/// See NVMe 1.4 Section 4.1.4 Queue Identifier
pub type QueueId = u16;

/// The Admin Completion and Submission Queues are defined to have ID 0.
pub const ADMIN_QUEUE_ID: QueueId = 0;

/// Controller-wide limits shared by every queue pair.
pub struct QueueLimits {
    /// Maximum transfer size in bytes. Starts from the page-count
    /// heuristic at enable time and is tightened by Identify MDTS.
    pub max_xfer: AtomicUsize,

    /// Resubmission attempts per request before its error is surfaced.
    pub retry_limit: u8,

    /// Per-request completion timeout budget.
    pub timeout: Duration,
}

/// Submission ring state.
///
/// The tail is ours to advance; the head is learned from the SQHD field
/// of completions and gates how many commands may be in flight.
struct SubRing {
    tail: u16,
    head: u16,
    ring: DmaBuffer,
}

/// Completion ring state.
///
/// The head is ours to advance. The phase expectation starts at 1 on a
/// fresh queue and flips every time the head wraps.
struct CompRing {
    head: u16,
    phase: bool,
    ring: DmaBuffer,
}

/// A pending-list entry. The list is kept in submission order, so the
/// deadlines are monotonically non-decreasing front to back.
struct Pending {
    idx: u16,
    deadline: Instant,
}

/// Per-queue operation counters.
#[derive(Default)]
pub struct QueueStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    retried: AtomicU64,
    timed_out: AtomicU64,
}

impl QueueStats {
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Relaxed)
    }
    pub fn completed(&self) -> u64 {
        self.completed.load(Relaxed)
    }
    pub fn retried(&self) -> u64 {
        self.retried.load(Relaxed)
    }
    pub fn timed_out(&self) -> u64 {
        self.timed_out.load(Relaxed)
    }
}

/// One submission/completion queue pair.
pub struct QueuePair {
    id: QueueId,
    depth: u16,
    db: Doorbells,
    regs: CtrlRegs,
    sq: Mutex<SubRing>,
    cq: Mutex<CompRing>,
    pending: Mutex<VecDeque<Pending>>,
    pool: Arc<RequestPool>,
    prps: Arc<PrpListPool>,
    limits: Arc<QueueLimits>,
    timer: OnceLock<Arc<dyn DeferredTimer>>,
    stats: QueueStats,
    log: slog::Logger,
}

impl QueuePair {
    /// Allocate the rings for a queue pair of `depth` entries.
    ///
    /// The doorbell offsets are a function of the queue id and the
    /// doorbell stride the controller advertised in CAP.DSTRD.
    pub fn new(
        id: QueueId,
        depth: u16,
        dstrd: u8,
        regs: CtrlRegs,
        pool: Arc<RequestPool>,
        prps: Arc<PrpListPool>,
        limits: Arc<QueueLimits>,
        dma: &dyn DmaOps,
        log: slog::Logger,
    ) -> Result<Arc<Self>, NvmeError> {
        assert!(depth >= 2);
        let sq_ring = dma.alloc(depth as usize * size_of::<SubmissionQueueEntry>())?;
        let cq_ring = dma.alloc(depth as usize * size_of::<CompletionQueueEntry>())?;
        let log = log.new(slog::o!("queue" => id));
        Ok(Arc::new(Self {
            id,
            depth,
            db: CtrlRegs::doorbells(id, dstrd),
            regs,
            sq: Mutex::new(SubRing { tail: 0, head: 0, ring: sq_ring }),
            cq: Mutex::new(CompRing { head: 0, phase: true, ring: cq_ring }),
            pending: Mutex::new(VecDeque::new()),
            pool,
            prps,
            limits,
            timer: OnceLock::new(),
            stats: QueueStats::default(),
            log,
        }))
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    pub fn depth(&self) -> u16 {
        self.depth
    }

    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    pub fn sq_base(&self) -> PhysAddr {
        self.sq.lock().unwrap().ring.addr()
    }

    pub fn cq_base(&self) -> PhysAddr {
        self.cq.lock().unwrap().ring.addr()
    }

    pub(crate) fn pool(&self) -> &Arc<RequestPool> {
        &self.pool
    }

    pub(crate) fn limits(&self) -> &QueueLimits {
        &self.limits
    }

    /// Zero both rings and reinitialize the ring indices.
    ///
    /// Hardware begins a fresh queue lap signaling phase 1, so that is
    /// the initial expectation. Must be called before the queue's
    /// addresses are handed to hardware, and again whenever the hardware
    /// queue is recreated.
    pub fn reset(&self) {
        let mut cq = self.cq.lock().unwrap();
        let mut sq = self.sq.lock().unwrap();
        debug_assert!(self.pending.lock().unwrap().is_empty());
        sq.ring.zero();
        cq.ring.zero();
        sq.tail = 0;
        sq.head = 0;
        cq.head = 0;
        cq.phase = true;
    }

    /// Connect this queue pair to its interrupt vector and timeout timer.
    ///
    /// Fails if the vector cannot be bound, in which case the queue must
    /// not be used.
    pub fn setup(
        self: &Arc<Self>,
        vector: &Arc<dyn MsiVector>,
        timers: &Arc<dyn TimerFactory>,
        intr_priority: u8,
    ) -> Result<(), NvmeError> {
        let weak = Arc::downgrade(self);
        vector.bind(
            intr_priority,
            Box::new(move || {
                if let Some(qp) = weak.upgrade() {
                    qp.process_completions();
                }
            }),
        )?;

        let weak = Arc::downgrade(self);
        let timer = timers.create(Box::new(move || {
            if let Some(qp) = weak.upgrade() {
                qp.sweep_timeouts(Instant::now());
            }
        }));
        let _ = self.timer.set(timer);
        Ok(())
    }

    /// Submit the request in pool slot `idx`.
    ///
    /// Stamps the command identifier (always the pool index), builds the
    /// data pointer, writes the ring slot, registers the request as
    /// pending, and rings the submission doorbell. On any failure the
    /// request is freed and hardware state is untouched; the callback is
    /// dropped unfired and the error returned synchronously instead.
    pub fn submit(&self, idx: u16) -> Result<(), NvmeError> {
        let slot_mx = self.pool.slot(idx).expect("request index within pool");
        let mut slot = slot_mx.lock().unwrap();
        debug_assert!(slot.live);

        if let Some(p) = &slot.payload {
            let max = self.limits.max_xfer.load(Relaxed);
            if p.len > max {
                let len = p.len;
                self.pool.release_locked(idx, &mut slot, &self.prps);
                return Err(NvmeError::TransferTooLarge { len, max });
            }
        }

        let payload = slot.payload;
        match build_data_pointer(&mut slot.sqe, payload.as_ref(), &self.prps) {
            Ok(handle) => slot.prp_list = handle,
            Err(e) => {
                self.pool.release_locked(idx, &mut slot, &self.prps);
                return Err(e.into());
            }
        }

        slot.sqe.set_cid(idx);

        if let Err(e) = self.push_hw(&mut slot, idx) {
            self.pool.release_locked(idx, &mut slot, &self.prps);
            return Err(e);
        }
        Ok(())
    }

    /// Write the slot's command to the submission ring and ring the
    /// doorbell. Shared by first submission and retry resubmission.
    ///
    /// Does not free the request on failure; callers decide.
    fn push_hw(
        &self,
        slot: &mut MutexGuard<'_, Request>,
        idx: u16,
    ) -> Result<(), NvmeError> {
        let now = Instant::now();
        let mut sq = self.sq.lock().unwrap();
        if wrap_add(self.depth, sq.tail, 1) == sq.head {
            return Err(NvmeError::QueueFull(self.id));
        }

        let off = sq.tail as usize * size_of::<SubmissionQueueEntry>();
        sq.ring.write(off, slot.sqe);
        sq.tail = wrap_add(self.depth, sq.tail, 1);

        slot.submitted_at = Some(now);
        let deadline = now + self.limits.timeout;
        {
            let mut pending = self.pending.lock().unwrap();
            let arm = pending.is_empty();
            pending.push_back(Pending { idx, deadline });
            if arm {
                if let Some(t) = self.timer.get() {
                    t.arm(deadline);
                }
            }
        }

        // The request must be fully registered as pending before this
        // doorbell write: a maximally fast completion must never find it
        // unregistered.
        self.regs.ring_doorbell(self.db.sq_tail, sq.tail);
        self.stats.submitted.fetch_add(1, Relaxed);
        Ok(())
    }

    /// Drain the completion ring.
    ///
    /// Runs on whatever context services this queue's interrupt vector.
    /// Processes entries strictly in ring order while their phase bit
    /// matches the expectation, then writes the head doorbell once if
    /// anything was consumed. Terminal callbacks are invoked after all
    /// queue locks are dropped.
    pub fn process_completions(&self) {
        let mut finished: Vec<(CmdCallback, CmdOutcome)> = Vec::new();
        let mut last_sqhd = None;

        {
            let mut cq = self.cq.lock().unwrap();
            let mut consumed = 0u32;
            loop {
                let off = cq.head as usize * size_of::<CompletionQueueEntry>();
                // Defensive copy: hardware owns the slot's memory until
                // the head doorbell is advanced past it.
                let cqe: CompletionQueueEntry = cq.ring.read(off);
                if cqe.phase() != cq.phase {
                    break;
                }
                consumed += 1;
                last_sqhd = Some(cqe.sqhd);
                self.handle_completion(cqe, &mut finished);
                cq.head = wrap_add(self.depth, cq.head, 1);
                if cq.head == 0 {
                    cq.phase = !cq.phase;
                }
            }
            if consumed > 0 {
                self.regs.ring_doorbell(self.db.cq_head, cq.head);
            }
        }

        if let Some(sqhd) = last_sqhd {
            self.sq.lock().unwrap().head = sqhd;
        }

        for (cb, outcome) in finished {
            cb(outcome);
        }
    }

    /// Resolve one completion to its request and retry or finalize it.
    fn handle_completion(
        &self,
        cqe: CompletionQueueEntry,
        finished: &mut Vec<(CmdCallback, CmdOutcome)>,
    ) {
        let idx = cqe.cid;
        let slot_mx = match self.pool.slot(idx) {
            Some(s) => s,
            None => {
                slog::warn!(self.log, "completion with out-of-range cid";
                    "cid" => idx);
                return;
            }
        };
        let mut slot = slot_mx.lock().unwrap();
        if !slot.live || slot.submitted_at.is_none() {
            // Desynchronized with hardware (or the timeout sweep beat us
            // to this request). Drop the completion, keep draining.
            slog::warn!(self.log, "completion for idle request; dropped";
                "cid" => idx);
            return;
        }

        let status = cqe.status();
        if status.is_error()
            && completion_retriable(status)
            && slot.retries < self.limits.retry_limit
        {
            slot.retries += 1;
            self.stats.retried.fetch_add(1, Relaxed);
            self.pending_remove(idx);
            // Back through the submission path: same slot, same command
            // identifier, fresh timestamp at the pending tail.
            if let Err(e) = self.push_hw(&mut slot, idx) {
                slog::warn!(self.log, "retry resubmission failed: {}", e;
                    "cid" => idx);
                let cb = slot.callback.take();
                self.pool.release_locked(idx, &mut slot, &self.prps);
                drop(slot);
                if let Some(cb) = cb {
                    finished.push((cb, CmdOutcome::Completed(cqe)));
                }
            }
        } else {
            let cb = slot.callback.take();
            self.pending_remove(idx);
            self.pool.release_locked(idx, &mut slot, &self.prps);
            self.stats.completed.fetch_add(1, Relaxed);
            drop(slot);
            if let Some(cb) = cb {
                finished.push((cb, CmdOutcome::Completed(cqe)));
            }
        }
    }

    fn pending_remove(&self, idx: u16) {
        self.pending.lock().unwrap().retain(|p| p.idx != idx);
    }

    /// Reap requests that have outlived the timeout budget.
    ///
    /// The pending list is in submission order, so the scan stops at the
    /// first entry still within budget. Returns the next deadline if
    /// requests remain (the timer is re-armed for it); `None` leaves the
    /// timer unscheduled until the next submission arms it.
    pub fn sweep_timeouts(&self, now: Instant) -> Option<Instant> {
        let mut expired = Vec::new();
        {
            let mut pending = self.pending.lock().unwrap();
            while let Some(front) = pending.front() {
                if front.deadline <= now {
                    expired.push(pending.pop_front().unwrap());
                } else {
                    break;
                }
            }
        }

        let mut finished: Vec<CmdCallback> = Vec::new();
        for ent in expired {
            let slot_mx = match self.pool.slot(ent.idx) {
                Some(s) => s,
                None => continue,
            };
            let mut slot = slot_mx.lock().unwrap();
            if !slot.live {
                // A completion finalized it between our pop and now.
                continue;
            }
            if let Some(at) = slot.submitted_at {
                if at + self.limits.timeout > now {
                    // Retried since we sampled its deadline; the retry
                    // already re-registered it at the pending tail.
                    continue;
                }
            }
            let cb = slot.callback.take();
            self.pool.release_locked(ent.idx, &mut slot, &self.prps);
            self.stats.timed_out.fetch_add(1, Relaxed);
            drop(slot);
            slog::warn!(self.log, "request timed out"; "cid" => ent.idx);
            if let Some(cb) = cb {
                finished.push(cb);
            }
        }
        for cb in finished {
            cb(CmdOutcome::TimedOut);
        }

        let next = self.pending.lock().unwrap().front().map(|p| p.deadline);
        if let Some(deadline) = next {
            if let Some(t) = self.timer.get() {
                t.arm(deadline);
            }
        }
        next
    }

    #[cfg(test)]
    pub(crate) fn inject_completion(&self, at: u16, cqe: CompletionQueueEntry) {
        let cq = self.cq.lock().unwrap();
        cq.ring.write(at as usize * size_of::<CompletionQueueEntry>(), cqe);
    }

    #[cfg(test)]
    pub(crate) fn sq_entry(&self, at: u16) -> SubmissionQueueEntry {
        let sq = self.sq.lock().unwrap();
        sq.ring.read(at as usize * size_of::<SubmissionQueueEntry>())
    }

    #[cfg(test)]
    pub(crate) fn cq_state(&self) -> (u16, bool) {
        let cq = self.cq.lock().unwrap();
        (cq.head, cq.phase)
    }

    #[cfg(test)]
    pub(crate) fn sq_tail(&self) -> u16 {
        self.sq.lock().unwrap().tail
    }

    #[cfg(test)]
    pub(crate) fn pending_snapshot(&self) -> Vec<u16> {
        self.pending.lock().unwrap().iter().map(|p| p.idx).collect()
    }
}

/// Positive offset from a ring index, wrapping at the queue depth.
fn wrap_add(depth: u16, idx: u16, off: u16) -> u16 {
    debug_assert!(idx < depth);
    let res = idx as u32 + off as u32;
    if res >= depth as u32 {
        (res - depth as u32) as u16
    } else {
        res as u16
    }
}

/// One-shot synchronous wrapper over the completion callback.
///
/// Creates the synchronization handle, submits with a callback that
/// signals it, and lets the caller block until the callback fires. This
/// is the only blocking primitive in the core.
pub struct SyncWaiter {
    rx: mpsc::Receiver<CmdOutcome>,
}

impl SyncWaiter {
    /// Allocate a request for `sqe` and submit it on `qp`.
    pub fn submit(
        qp: &QueuePair,
        sqe: SubmissionQueueEntry,
        payload: Option<crate::common::Payload>,
    ) -> Result<Self, NvmeError> {
        let (tx, rx) = mpsc::channel();
        let idx = qp.pool().allocate(
            sqe,
            payload,
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        )?;
        qp.submit(idx)?;
        Ok(Self { rx })
    }

    /// Block until the request's terminal outcome arrives.
    ///
    /// The wait is bounded a little past the request timeout budget; if
    /// the platform timer has not fired by then the sweep is forced here
    /// so the request is reaped rather than leaked.
    pub fn wait(self, qp: &QueuePair) -> Result<CmdOutcome, NvmeError> {
        let budget = qp.limits().timeout + Duration::from_millis(100);
        match self.rx.recv_timeout(budget) {
            Ok(outcome) => Ok(outcome),
            Err(_) => {
                qp.sweep_timeouts(Instant::now());
                self.rx.try_recv().map_err(|_| NvmeError::CommandTimeout)
            }
        }
    }
}
