// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test scaffolding: identity DMA mapping, a register-write recorder for
//! queue-level tests, and a scripted controller model (`SimInner`) that
//! services admin and I/O commands against a RAM disk so the lifecycle
//! and block paths can be exercised end to end.
//!
//! The simulated device runs its own worker thread and delivers
//! completions by firing the bound interrupt handler from that thread,
//! which is exactly the concurrency shape real hardware produces.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use zerocopy::{FromZeros, IntoBytes};

use crate::bits::{
    self, Capabilities, CompletionQueueEntry, IdentifyController,
    IdentifyNamespace, StatusCodeType, StatusField, SubmissionQueueEntry,
};
use crate::block::{BlockDevice, BlockRegistrar};
use crate::common::{DmaBuffer, PhysAddr};
use crate::config::Config;
use crate::controller::Controller;
use crate::platform::{
    DeferredTimer, DeviceHandle, DmaOps, Mmio, MsiVector, PciLocation,
    PlatformError, TimerFactory,
};
use crate::regs::{DOORBELL_BASE, REG_ACQ, REG_AQA, REG_ASQ, REG_CAP, REG_CC, REG_CSTS, REG_VS};

const SIM_PAGE: usize = 4096;

/// Host-virtual == device-visible: the trivial DMA mapping for tests.
pub struct IdentityDma;

impl DmaOps for IdentityDma {
    fn alloc(&self, len: usize) -> Result<DmaBuffer, PlatformError> {
        Ok(DmaBuffer::alloc_zeroed(len, |p| PhysAddr(p.as_ptr() as u64)))
    }

    fn map_host(&self, ptr: *const u8, _len: usize) -> Result<PhysAddr, PlatformError> {
        Ok(PhysAddr(ptr as u64))
    }
}

pub fn discard_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

/// An MMIO window that remembers every write; queue tests assert on the
/// doorbell traffic.
pub struct RegRecorder {
    regs: Mutex<HashMap<usize, u32>>,
    writes: Mutex<Vec<(usize, u32)>>,
}

impl RegRecorder {
    pub fn new() -> Self {
        Self { regs: Mutex::new(HashMap::new()), writes: Mutex::new(Vec::new()) }
    }

    pub fn writes(&self) -> Vec<(usize, u32)> {
        self.writes.lock().unwrap().clone()
    }
}

impl Mmio for RegRecorder {
    fn read32(&self, off: usize) -> u32 {
        self.regs.lock().unwrap().get(&off).copied().unwrap_or(0)
    }

    fn write32(&self, off: usize, val: u32) {
        self.regs.lock().unwrap().insert(off, val);
        self.writes.lock().unwrap().push((off, val));
    }
}

/// A timer that records its deadline and never fires; tests drive sweeps
/// explicitly.
#[derive(Default)]
pub struct ManualTimer {
    pub armed: Mutex<Option<Instant>>,
}

impl DeferredTimer for ManualTimer {
    fn arm(&self, deadline: Instant) {
        *self.armed.lock().unwrap() = Some(deadline);
    }

    fn cancel(&self) {
        *self.armed.lock().unwrap() = None;
    }
}

pub struct NullTimers;

impl TimerFactory for NullTimers {
    fn create(&self, _on_fire: Box<dyn Fn() + Send + Sync>) -> Arc<dyn DeferredTimer> {
        Arc::new(ManualTimer::default())
    }
}

/// One simulated MSI vector.
#[derive(Default)]
pub struct SimVector {
    handler: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl SimVector {
    fn fire(&self) {
        let handler = self.handler.lock().unwrap();
        if let Some(h) = handler.as_ref() {
            h();
        }
    }
}

impl MsiVector for SimVector {
    fn bind(
        &self,
        _priority: u8,
        handler: Box<dyn Fn() + Send + Sync>,
    ) -> Result<(), PlatformError> {
        *self.handler.lock().unwrap() = Some(handler);
        Ok(())
    }
}

/// Behavior knobs for the simulated controller.
#[derive(Clone, Copy)]
pub struct SimKnobs {
    /// Never raise CSTS.RDY after CC.EN is set.
    pub stuck_ready: bool,
    /// CAP.TO in 500 ms units.
    pub to: u8,
    /// I/O submission queues the controller "allocates".
    pub grant_sq: u16,
    /// I/O completion queues the controller "allocates".
    pub grant_cq: u16,
    /// Reported namespace count.
    pub nn: u32,
    /// Reported maximum data transfer size (power of two of pages).
    pub mdts: u8,
    /// Identify VWC byte.
    pub vwc: u8,
    /// Identify ONCS word.
    pub oncs: u16,
    /// LBA data size shift of the only LBA format.
    pub lbads: u8,
    /// RAM disk size in blocks.
    pub disk_blocks: u64,
    /// Fail this many I/O commands with namespace-not-ready first.
    pub fail_first_io: u32,
}

impl Default for SimKnobs {
    fn default() -> Self {
        Self {
            stuck_ready: false,
            to: 1,
            grant_sq: 2,
            grant_cq: 2,
            nn: 1,
            mdts: 0,
            vwc: bits::VWC_PRESENT,
            oncs: bits::ONCS_DSM,
            lbads: 9,
            disk_blocks: 2048,
            fail_first_io: 0,
        }
    }
}

struct SimSq {
    base: u64,
    depth: u16,
    head: u16,
    cqid: u16,
}

struct SimCq {
    base: u64,
    depth: u16,
    tail: u16,
    phase: bool,
    iv: u16,
}

#[derive(Default)]
struct SimQueues {
    admin_sq_head: u16,
    admin_cq_tail: u16,
    admin_cq_phase_zero: bool,
    sqs: HashMap<u16, SimSq>,
    cqs: HashMap<u16, SimCq>,
}

struct DoorbellMsg {
    off: usize,
    val: u32,
}

/// The simulated controller. Implements [`Mmio`]; doorbell writes are
/// queued to a worker thread that plays the device role.
pub struct SimInner {
    knobs: SimKnobs,
    regs: Mutex<Vec<u8>>,
    queues: Mutex<SimQueues>,
    disk: Mutex<Vec<u8>>,
    admin_log: Mutex<Vec<u8>>,
    fail_io: Mutex<u32>,
    vectors: Vec<Arc<SimVector>>,
    tx: crossbeam_channel::Sender<DoorbellMsg>,
}

impl SimInner {
    pub fn admin_opcodes(&self) -> Vec<u8> {
        self.admin_log.lock().unwrap().clone()
    }

    pub fn disk_slice(&self, off: usize, len: usize) -> Vec<u8> {
        self.disk.lock().unwrap()[off..off + len].to_vec()
    }

    fn raw32(&self, off: usize) -> u32 {
        let regs = self.regs.lock().unwrap();
        u32::from_le_bytes(regs[off..off + 4].try_into().unwrap())
    }

    fn set_raw32(&self, off: usize, val: u32) {
        let mut regs = self.regs.lock().unwrap();
        regs[off..off + 4].copy_from_slice(&val.to_le_bytes());
    }

    fn raw64(&self, off: usize) -> u64 {
        self.raw32(off) as u64 | (self.raw32(off + 4) as u64) << 32
    }

    fn block_size(&self) -> usize {
        1 << self.knobs.lbads
    }

    fn handle_cc(&self, val: u32) {
        self.set_raw32(REG_CC, val);
        let mut csts = self.raw32(REG_CSTS);
        if val & 1 != 0 {
            if !self.knobs.stuck_ready {
                csts |= 1;
            }
        } else {
            csts &= !1;
        }
        self.set_raw32(REG_CSTS, csts);
    }

    fn handle_doorbell(&self, msg: DoorbellMsg) {
        let rel = msg.off - DOORBELL_BASE;
        let qid = (rel / 8) as u16;
        let is_cq = (rel / 4) % 2 == 1;
        if is_cq {
            // Host head updates need no reaction from this model.
            return;
        }
        if qid == 0 {
            self.process_admin(msg.val as u16);
        } else {
            self.process_io(qid, msg.val as u16);
        }
    }

    fn process_admin(&self, new_tail: u16) {
        let asq = self.raw64(REG_ASQ);
        let depth = (self.raw32(REG_AQA) & 0xFFF) as u16 + 1;
        loop {
            let head = self.queues.lock().unwrap().admin_sq_head;
            if head == new_tail {
                break;
            }
            let sqe: SubmissionQueueEntry =
                unsafe { phys_read(asq + head as u64 * 64) };
            {
                let mut q = self.queues.lock().unwrap();
                q.admin_sq_head = (head + 1) % depth;
            }
            let (dw0, status) = self.exec_admin(&sqe);
            self.post_admin_completion(sqe.cid(), dw0, status, depth);
        }
        self.vectors[0].fire();
    }

    fn post_admin_completion(&self, cid: u16, dw0: u32, status: u16, depth: u16) {
        let acq = self.raw64(REG_ACQ);
        let mut q = self.queues.lock().unwrap();
        let phase = !q.admin_cq_phase_zero;
        let cqe = CompletionQueueEntry {
            dw0,
            rsvd: 0,
            sqhd: q.admin_sq_head,
            sqid: 0,
            cid,
            status_phase: status | phase as u16,
        };
        unsafe { phys_write(acq + q.admin_cq_tail as u64 * 16, cqe) };
        q.admin_cq_tail = (q.admin_cq_tail + 1) % depth;
        if q.admin_cq_tail == 0 {
            q.admin_cq_phase_zero = !q.admin_cq_phase_zero;
        }
    }

    fn exec_admin(&self, sqe: &SubmissionQueueEntry) -> (u32, u16) {
        self.admin_log.lock().unwrap().push(sqe.opcode());
        let cdw10 = sqe.cdw10;
        let cdw11 = sqe.cdw11;
        match sqe.opcode() {
            bits::ADMIN_OPC_IDENTIFY => {
                match (cdw10 & 0xFF) as u8 {
                    bits::IDENT_CNS_CONTROLLER => {
                        let ident = self.ident_controller();
                        unsafe { phys_write_bytes(sqe.prp1, ident.as_bytes()) };
                        (0, 0)
                    }
                    bits::IDENT_CNS_NAMESPACE => {
                        let ident = self.ident_namespace(sqe.nsid);
                        unsafe { phys_write_bytes(sqe.prp1, ident.as_bytes()) };
                        (0, 0)
                    }
                    _ => (0, err_status(StatusCodeType::Generic, bits::STS_INVAL_FIELD)),
                }
            }
            bits::ADMIN_OPC_SET_FEATURES | bits::ADMIN_OPC_GET_FEATURES => {
                if (cdw10 & 0xFF) as u8 == bits::FEAT_ID_NUM_QUEUES {
                    let dw0 = ((self.knobs.grant_cq as u32 - 1) << 16)
                        | (self.knobs.grant_sq as u32 - 1);
                    (dw0, 0)
                } else {
                    (0, err_status(StatusCodeType::Generic, bits::STS_INVAL_FIELD))
                }
            }
            bits::ADMIN_OPC_CREATE_IO_CQ => {
                let qid = (cdw10 & 0xFFFF) as u16;
                let cq = SimCq {
                    base: sqe.prp1,
                    depth: (cdw10 >> 16) as u16 + 1,
                    tail: 0,
                    phase: true,
                    iv: (cdw11 >> 16) as u16,
                };
                self.queues.lock().unwrap().cqs.insert(qid, cq);
                (0, 0)
            }
            bits::ADMIN_OPC_CREATE_IO_SQ => {
                let qid = (cdw10 & 0xFFFF) as u16;
                let sq = SimSq {
                    base: sqe.prp1,
                    depth: (cdw10 >> 16) as u16 + 1,
                    head: 0,
                    cqid: (cdw11 >> 16) as u16,
                };
                self.queues.lock().unwrap().sqs.insert(qid, sq);
                (0, 0)
            }
            bits::ADMIN_OPC_DELETE_IO_SQ => {
                self.queues.lock().unwrap().sqs.remove(&((cdw10 & 0xFFFF) as u16));
                (0, 0)
            }
            bits::ADMIN_OPC_DELETE_IO_CQ => {
                self.queues.lock().unwrap().cqs.remove(&((cdw10 & 0xFFFF) as u16));
                (0, 0)
            }
            _ => (0, err_status(StatusCodeType::Generic, bits::STS_INVAL_OPC)),
        }
    }

    fn ident_controller(&self) -> Box<IdentifyController> {
        let mut id = IdentifyController::new_zeroed();
        fill_ascii(&mut id.sn, "SIMNVME001");
        fill_ascii(&mut id.mn, "nvme-core sim");
        fill_ascii(&mut id.fr, "1.0");
        id.nn = self.knobs.nn;
        id.mdts = self.knobs.mdts;
        id.vwc = self.knobs.vwc;
        id.oncs = self.knobs.oncs;
        // 64-byte SQEs, 16-byte CQEs, required == maximum.
        id.sqes = 0x66;
        id.cqes = 0x44;
        Box::new(id)
    }

    fn ident_namespace(&self, nsid: u32) -> Box<IdentifyNamespace> {
        let mut id = IdentifyNamespace::new_zeroed();
        if nsid >= 1 && nsid <= self.knobs.nn {
            id.nsze = self.knobs.disk_blocks;
            id.ncap = self.knobs.disk_blocks;
            id.nuse = self.knobs.disk_blocks;
            id.lbaf[0].lbads = self.knobs.lbads;
        }
        Box::new(id)
    }

    fn process_io(&self, qid: u16, new_tail: u16) {
        let (base, depth, cqid) = {
            let q = self.queues.lock().unwrap();
            match q.sqs.get(&qid) {
                Some(sq) => (sq.base, sq.depth, sq.cqid),
                None => return,
            }
        };
        loop {
            let head = self.queues.lock().unwrap().sqs[&qid].head;
            if head == new_tail {
                break;
            }
            let sqe: SubmissionQueueEntry =
                unsafe { phys_read(base + head as u64 * 64) };
            let sqhd = (head + 1) % depth;
            self.queues.lock().unwrap().sqs.get_mut(&qid).unwrap().head = sqhd;
            let (dw0, status) = self.exec_io(&sqe);
            self.post_io_completion(cqid, qid, sqhd, sqe.cid(), dw0, status);
        }
        let iv = self.queues.lock().unwrap().cqs[&cqid].iv;
        self.vectors[iv as usize].fire();
    }

    fn post_io_completion(
        &self,
        cqid: u16,
        sqid: u16,
        sqhd: u16,
        cid: u16,
        dw0: u32,
        status: u16,
    ) {
        let mut q = self.queues.lock().unwrap();
        let cq = q.cqs.get_mut(&cqid).unwrap();
        let cqe = CompletionQueueEntry {
            dw0,
            rsvd: 0,
            sqhd,
            sqid,
            cid,
            status_phase: status | cq.phase as u16,
        };
        unsafe { phys_write(cq.base + cq.tail as u64 * 16, cqe) };
        cq.tail = (cq.tail + 1) % cq.depth;
        if cq.tail == 0 {
            cq.phase = !cq.phase;
        }
    }

    fn exec_io(&self, sqe: &SubmissionQueueEntry) -> (u32, u16) {
        match sqe.opcode() {
            bits::NVM_OPC_FLUSH => (0, 0),
            bits::NVM_OPC_READ | bits::NVM_OPC_WRITE => {
                {
                    let mut fail = self.fail_io.lock().unwrap();
                    if *fail > 0 {
                        *fail -= 1;
                        return (
                            0,
                            err_status(
                                StatusCodeType::Generic,
                                bits::STS_NAMESPACE_NOT_READY,
                            ),
                        );
                    }
                }
                let bs = self.block_size();
                let slba = sqe.cdw10 as u64 | (sqe.cdw11 as u64) << 32;
                let nlb = (sqe.cdw12 & 0xFFFF) as usize + 1;
                let off = slba as usize * bs;
                let len = nlb * bs;
                let mut disk = self.disk.lock().unwrap();
                assert!(off + len <= disk.len(), "I/O beyond simulated medium");
                let mut pos = off;
                for (addr, rlen) in prp_regions(sqe.prp1, sqe.prp2, len) {
                    unsafe {
                        if sqe.opcode() == bits::NVM_OPC_READ {
                            std::ptr::copy_nonoverlapping(
                                disk[pos..].as_ptr(),
                                addr as *mut u8,
                                rlen,
                            );
                        } else {
                            std::ptr::copy_nonoverlapping(
                                addr as *const u8,
                                disk[pos..].as_mut_ptr(),
                                rlen,
                            );
                        }
                    }
                    pos += rlen;
                }
                (0, 0)
            }
            _ => (0, err_status(StatusCodeType::Generic, bits::STS_INVAL_OPC)),
        }
    }
}

impl Mmio for SimInner {
    fn read32(&self, off: usize) -> u32 {
        self.raw32(off)
    }

    fn write32(&self, off: usize, val: u32) {
        if off == REG_CC {
            self.handle_cc(val);
        } else {
            self.set_raw32(off, val);
        }
        if off >= DOORBELL_BASE {
            let _ = self.tx.send(DoorbellMsg { off, val });
        }
    }
}

fn err_status(sct: StatusCodeType, sc: u8) -> u16 {
    StatusField::encode(sct, sc, false).0
}

fn fill_ascii(dst: &mut [u8], s: &str) {
    dst.fill(b' ');
    dst[..s.len()].copy_from_slice(s.as_bytes());
}

/// Walk PRP1/PRP2 (direct or one list) into (address, length) chunks.
fn prp_regions(prp1: u64, prp2: u64, len: usize) -> Vec<(u64, usize)> {
    let mut out = Vec::new();
    let off = prp1 as usize & (SIM_PAGE - 1);
    let first = (SIM_PAGE - off).min(len);
    out.push((prp1, first));
    let mut remain = len - first;
    if remain == 0 {
        return out;
    }
    if remain <= SIM_PAGE {
        out.push((prp2, remain));
        return out;
    }
    let mut idx = 0u64;
    while remain > 0 {
        let entry: u64 = unsafe { phys_read(prp2 + idx * 8) };
        let chunk = remain.min(SIM_PAGE);
        out.push((entry, chunk));
        remain -= chunk;
        idx += 1;
    }
    out
}

unsafe fn phys_read<T: Copy>(addr: u64) -> T {
    (addr as *const T).read_volatile()
}

unsafe fn phys_write<T: Copy>(addr: u64, val: T) {
    (addr as *mut T).write_volatile(val)
}

unsafe fn phys_write_bytes(addr: u64, bytes: &[u8]) {
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
}

/// Build a simulated device and the [`DeviceHandle`] the driver consumes.
pub fn sim_device(knobs: SimKnobs) -> (DeviceHandle, Arc<SimInner>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    let vectors: Vec<Arc<SimVector>> =
        (0..4).map(|_| Arc::new(SimVector::default())).collect();

    let mut regs = vec![0u8; 0x2000];
    let cap = Capabilities(0)
        .with_mqes(1023)
        .with_cqr(true)
        .with_to(knobs.to)
        .with_dstrd(0)
        .with_css_nvm(true);
    regs[REG_CAP..REG_CAP + 8].copy_from_slice(&cap.0.to_le_bytes());
    regs[REG_VS..REG_VS + 4].copy_from_slice(&bits::NVME_VER_1_4.to_le_bytes());

    let disk_len = knobs.disk_blocks as usize * (1usize << knobs.lbads);
    let inner = Arc::new(SimInner {
        knobs,
        regs: Mutex::new(regs),
        queues: Mutex::new(SimQueues::default()),
        disk: Mutex::new(vec![0u8; disk_len]),
        admin_log: Mutex::new(Vec::new()),
        fail_io: Mutex::new(knobs.fail_first_io),
        vectors: vectors.clone(),
        tx,
    });

    // The worker only holds a weak reference; dropping the last handle to
    // the device closes the channel and retires the thread.
    let weak = Arc::downgrade(&inner);
    std::thread::spawn(move || {
        while let Ok(msg) = rx.recv() {
            match weak.upgrade() {
                Some(sim) => sim.handle_doorbell(msg),
                None => break,
            }
        }
    });

    let handle = DeviceHandle {
        regs: inner.clone(),
        location: PciLocation { bus: 0, device: 4, function: 0 },
        instance: 0,
        vectors: vectors
            .into_iter()
            .map(|v| v as Arc<dyn MsiVector>)
            .collect(),
        dma: Arc::new(IdentityDma),
        timers: Arc::new(NullTimers),
    };
    (handle, inner)
}

/// A block layer that just collects what it is handed.
#[derive(Default)]
pub struct CollectRegistrar {
    devices: Mutex<Vec<(String, Arc<dyn BlockDevice>)>>,
}

impl CollectRegistrar {
    pub fn names(&self) -> Vec<String> {
        self.devices.lock().unwrap().iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn device(&self, name: &str) -> Option<Arc<dyn BlockDevice>> {
        self.devices
            .lock()
            .unwrap()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, d)| d.clone())
    }
}

impl BlockRegistrar for CollectRegistrar {
    fn register(&self, name: &str, dev: Arc<dyn BlockDevice>) {
        self.devices.lock().unwrap().push((name.to_string(), dev));
    }
}

/// Attach and fully initialize a controller against a simulated device.
pub fn bring_up(
    knobs: SimKnobs,
) -> (Arc<Controller>, Arc<SimInner>, Arc<CollectRegistrar>) {
    let (handle, sim) = sim_device(knobs);
    let cfg = Config {
        admin_queue_depth: 16,
        io_queue_depth: 16,
        max_requests: 16,
        request_timeout_ms: 2_000,
        ..Default::default()
    };
    let ctrl = Controller::attach(handle, cfg, discard_logger()).unwrap();
    let registrar = Arc::new(CollectRegistrar::default());
    ctrl.init(registrar.as_ref()).unwrap();
    (ctrl, sim, registrar)
}
