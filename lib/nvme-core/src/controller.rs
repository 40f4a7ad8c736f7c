// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Controller lifecycle.
//!
//! [`Controller::init`] drives the mandatory bring-up sequence: disable,
//! configure the admin queue, enable, create the I/O queues, identify the
//! controller, and discover its namespaces. Transitions are strictly
//! sequential; a register-poll timeout or command failure aborts the
//! sequence and leaves the controller in its last-reached state for
//! diagnosis.

use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use zerocopy::FromBytes;

use crate::bits::{
    self, AdminQueueAttrs, Configuration, IdentifyController, IdentifyNamespace,
};
use crate::block::{BlockDevice, BlockRegistrar};
use crate::cmds::{
    num_queues_granted, CreateIoCqCmd, CreateIoSqCmd, DeleteIoQCmd,
    GetFeaturesCmd, IdentifyCmd, SetFeaturesCmd,
};
use crate::common::{PageParams, Payload};
use crate::config::Config;
use crate::ns::Namespace;
use crate::platform::{DeviceHandle, DmaOps, MsiVector, PciLocation, TimerFactory};
use crate::pool::RequestPool;
use crate::prp::PrpListPool;
use crate::queue::{QueueLimits, QueuePair, SyncWaiter, ADMIN_QUEUE_ID};
use crate::regs::CtrlRegs;
use crate::bits::SubmissionQueueEntry;
use crate::NvmeError;

/// Bring-up progress of a controller.
///
/// `Unconfigured` exists only conceptually before [`Controller::attach`];
/// a constructed controller starts at `Mapped`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ControllerState {
    Unconfigured,
    Mapped,
    Disabled,
    AdminQueueReady,
    Enabled,
    IoQueuesReady,
    Identified,
    NamespacesDiscovered,
}

/// State behind the controller-wide exclusive lock: everything touched by
/// administrative and configuration operations.
struct CtrlInner {
    state: ControllerState,
    io_queues: Vec<Arc<QueuePair>>,
    namespaces: Vec<Arc<Namespace>>,
    ident: Option<Box<IdentifyController>>,
    serial: String,
    model: String,
    firmware: String,
}

/// One NVMe controller function.
pub struct Controller {
    regs: CtrlRegs,
    location: PciLocation,
    instance: u32,
    vectors: Vec<Arc<dyn MsiVector>>,
    dma: Arc<dyn DmaOps>,
    timers: Arc<dyn TimerFactory>,
    cfg: Config,

    /// Doorbell stride from CAP.DSTRD.
    dstrd: u8,

    /// Memory page geometry selected for this controller.
    page: PageParams,

    /// CAP.TO-derived budget for CSTS.RDY transitions.
    ready_timeout: Duration,

    limits: Arc<QueueLimits>,
    pool: Arc<RequestPool>,
    prps: Arc<PrpListPool>,
    admin: Arc<QueuePair>,

    inner: Mutex<CtrlInner>,
    log: slog::Logger,
}

impl Controller {
    /// Take ownership of an already-mapped controller function.
    ///
    /// Reads CAP to derive the doorbell stride, page size, and ready
    /// timeout, sizes the request and PRP pools, and allocates the admin
    /// queue pair. No hardware state is changed yet.
    pub fn attach(
        handle: DeviceHandle,
        cfg: Config,
        log: slog::Logger,
    ) -> Result<Arc<Self>, NvmeError> {
        cfg.validate()?;
        if handle.vectors.is_empty() {
            return Err(NvmeError::NoInterruptVectors);
        }

        let regs = CtrlRegs::new(handle.regs);
        let cap = regs.cap()?;
        let vs = regs.vs()?;
        slog::info!(log, "controller mapped";
            "location" => handle.location.to_string(),
            "version" => format!("{}.{}", vs >> 16, (vs >> 8) & 0xFF),
        );

        if !cap.css_nvm() {
            return Err(NvmeError::NoNvmCommandSet);
        }

        let page = PageParams { shift: 12 + cap.mpsmin() };
        // Transfer-size heuristic until Identify refines it: one PRP list
        // of pages plus the first direct page.
        let max_xfer = page.size() * (page.size() / 8 + 1);
        let limits = Arc::new(QueueLimits {
            max_xfer: AtomicUsize::new(max_xfer),
            retry_limit: cfg.retry_limit,
            timeout: Duration::from_millis(cfg.request_timeout_ms),
        });

        let pool = Arc::new(RequestPool::new(cfg.max_requests));
        let prps = Arc::new(PrpListPool::new(
            cfg.max_prp_lists,
            page,
            handle.dma.as_ref(),
        )?);

        let admin = QueuePair::new(
            ADMIN_QUEUE_ID,
            cfg.admin_queue_depth,
            cap.dstrd(),
            regs.clone(),
            pool.clone(),
            prps.clone(),
            limits.clone(),
            handle.dma.as_ref(),
            log.clone(),
        )?;

        Ok(Arc::new(Self {
            regs,
            location: handle.location,
            instance: handle.instance,
            vectors: handle.vectors,
            dma: handle.dma,
            timers: handle.timers,
            cfg,
            dstrd: cap.dstrd(),
            page,
            ready_timeout: Duration::from_millis(cap.ready_timeout_ms()),
            limits,
            pool,
            prps,
            admin,
            inner: Mutex::new(CtrlInner {
                state: ControllerState::Mapped,
                io_queues: Vec::new(),
                namespaces: Vec::new(),
                ident: None,
                serial: String::new(),
                model: String::new(),
                firmware: String::new(),
            }),
            log,
        }))
    }

    /// Run the full bring-up sequence and register discovered namespaces
    /// with the block-device collaborator.
    pub fn init(
        self: &Arc<Self>,
        registrar: &dyn BlockRegistrar,
    ) -> Result<(), NvmeError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != ControllerState::Mapped {
            return Err(NvmeError::InvalidState(inner.state));
        }
        self.disable(&mut inner)?;
        self.setup_admin_queue(&mut inner)?;
        self.enable(&mut inner)?;
        self.setup_io_queues(&mut inner)?;
        self.identify_controller(&mut inner)?;
        self.discover_namespaces(&mut inner, registrar)?;
        Ok(())
    }

    pub fn state(&self) -> ControllerState {
        self.inner.lock().unwrap().state
    }

    pub fn location(&self) -> PciLocation {
        self.location
    }

    pub fn serial(&self) -> String {
        self.inner.lock().unwrap().serial.clone()
    }

    pub fn model(&self) -> String {
        self.inner.lock().unwrap().model.clone()
    }

    pub fn firmware(&self) -> String {
        self.inner.lock().unwrap().firmware.clone()
    }

    /// Current maximum transfer size in bytes.
    pub fn max_transfer_size(&self) -> usize {
        self.limits.max_xfer.load(Relaxed)
    }

    pub fn io_queue_count(&self) -> usize {
        self.inner.lock().unwrap().io_queues.len()
    }

    pub fn namespaces(&self) -> Vec<Arc<Namespace>> {
        self.inner.lock().unwrap().namespaces.clone()
    }

    /// Poll CSTS.RDY for `want` with exponential backoff, bounded by the
    /// CAP.TO budget.
    fn wait_ready(&self, want: bool) -> Result<(), NvmeError> {
        let deadline = Instant::now() + self.ready_timeout;
        let mut delay = Duration::from_millis(1);
        loop {
            let csts = self.regs.csts()?;
            if csts.cfs() {
                return Err(NvmeError::ControllerFatal);
            }
            if csts.ready() == want {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(NvmeError::ReadyTimeout(want, self.ready_timeout));
            }
            std::thread::sleep(delay);
            delay = (delay * 2).min(Duration::from_millis(100));
        }
    }

    /// Mapped -> Disabled: make sure the controller is quiescent before
    /// the admin queue registers are touched.
    fn disable(&self, inner: &mut MutexGuard<'_, CtrlInner>) -> Result<(), NvmeError> {
        let mut cc = self.regs.cc()?;
        if cc.enabled() {
            // Let a pending enable settle before clearing EN; clearing it
            // mid-transition puts some controllers in an undefined state.
            self.wait_ready(true)?;
            cc.set_enabled(false);
            self.regs.set_cc(cc);
        }
        self.wait_ready(false)?;
        inner.state = ControllerState::Disabled;
        Ok(())
    }

    /// Disabled -> AdminQueueReady: reset the admin queue pair, bind it
    /// to queue id 0, and program AQA/ASQ/ACQ.
    fn setup_admin_queue(
        self: &Arc<Self>,
        inner: &mut MutexGuard<'_, CtrlInner>,
    ) -> Result<(), NvmeError> {
        self.admin.reset();
        self.admin.setup(&self.vectors[0], &self.timers, self.cfg.intr_priority)?;

        let depth = self.cfg.admin_queue_depth;
        self.regs.set_aqa(
            AdminQueueAttrs(0)
                .with_asqs(depth - 1)
                .with_acqs(depth - 1),
        );
        self.regs.set_asq(self.admin.sq_base());
        self.regs.set_acq(self.admin.cq_base());

        inner.state = ControllerState::AdminQueueReady;
        Ok(())
    }

    /// AdminQueueReady -> Enabled: program CC and wait for ready.
    fn enable(&self, inner: &mut MutexGuard<'_, CtrlInner>) -> Result<(), NvmeError> {
        slog::info!(self.log, "enabling controller");
        let cc = Configuration(0)
            // NVM command set, round robin arbitration
            .with_css(0)
            .with_ams(0)
            .with_mps(self.page.shift - 12)
            // 64-byte submission and 16-byte completion entries
            .with_iosqes(6)
            .with_iocqes(4)
            .with_enabled(true);
        self.regs.set_cc(cc);
        self.wait_ready(true)?;
        inner.state = ControllerState::Enabled;
        Ok(())
    }

    /// Enabled -> IOQueuesReady: negotiate the queue count, then create
    /// each queue pair (completion queue first), polling each admin
    /// command to completion.
    fn setup_io_queues(
        self: &Arc<Self>,
        inner: &mut MutexGuard<'_, CtrlInner>,
    ) -> Result<(), NvmeError> {
        // One vector per queue id, and id 0 belongs to the admin queue.
        let max_by_vectors = (self.vectors.len() - 1) as u16;
        let want = self.cfg.io_queue_count.min(max_by_vectors);
        if want == 0 {
            return Err(NvmeError::NoIoQueues);
        }

        let cqe = self.sync_admin(
            SetFeaturesCmd::number_of_queues(want, want).build(),
            None,
        )?;
        let (nsqa, ncqa) = num_queues_granted(cqe.dw0);
        let count = want.min(nsqa).min(ncqa);
        slog::info!(self.log, "I/O queue allocation";
            "requested" => want, "granted" => count);
        if count == 0 {
            return Err(NvmeError::NoIoQueues);
        }

        for qid in 1..=count {
            let qp = QueuePair::new(
                qid,
                self.cfg.io_queue_depth,
                self.dstrd,
                self.regs.clone(),
                self.pool.clone(),
                self.prps.clone(),
                self.limits.clone(),
                self.dma.as_ref(),
                self.log.clone(),
            )?;
            qp.reset();
            qp.setup(
                &self.vectors[qid as usize],
                &self.timers,
                self.cfg.intr_priority,
            )?;

            self.sync_admin(
                CreateIoCqCmd {
                    qid,
                    depth: self.cfg.io_queue_depth,
                    intr_vector: qid,
                    base: qp.cq_base(),
                }
                .build(),
                None,
            )?;
            self.sync_admin(
                CreateIoSqCmd {
                    qid,
                    cqid: qid,
                    depth: self.cfg.io_queue_depth,
                    base: qp.sq_base(),
                }
                .build(),
                None,
            )?;

            inner.io_queues.push(qp);
        }

        inner.state = ControllerState::IoQueuesReady;
        Ok(())
    }

    /// IOQueuesReady -> Identified: fetch the controller data structure
    /// and refine the transfer-size bound from MDTS.
    fn identify_controller(
        &self,
        inner: &mut MutexGuard<'_, CtrlInner>,
    ) -> Result<(), NvmeError> {
        let buf = self.dma.alloc(std::mem::size_of::<IdentifyController>())?;
        self.sync_admin(
            IdentifyCmd { cns: bits::IDENT_CNS_CONTROLLER, nsid: 0 }.build(),
            Some(Payload { addr: buf.addr(), len: buf.len() }),
        )?;

        let bytes = buf.copy_to_vec();
        let ident = IdentifyController::read_from_bytes(bytes.as_slice())
            .map_err(|_| NvmeError::IdentifyParse)?;

        if let Some(mdts) = ident.mdts_bytes(self.page.size()) {
            self.limits.max_xfer.fetch_min(mdts as usize, Relaxed);
        }

        inner.serial = ident.serial();
        inner.model = ident.model();
        inner.firmware = ident.firmware();
        slog::info!(self.log, "controller identified";
            "serial" => inner.serial.clone(),
            "model" => inner.model.clone(),
            "firmware" => inner.firmware.clone(),
            "namespaces" => ident.nn,
            "max_xfer" => self.limits.max_xfer.load(Relaxed),
        );

        inner.ident = Some(Box::new(ident));
        inner.state = ControllerState::Identified;
        Ok(())
    }

    /// Identified -> NamespacesDiscovered: probe namespace ids, derive
    /// per-namespace geometry and capability flags, and hand each present
    /// namespace to the block layer.
    fn discover_namespaces(
        self: &Arc<Self>,
        inner: &mut MutexGuard<'_, CtrlInner>,
        registrar: &dyn BlockRegistrar,
    ) -> Result<(), NvmeError> {
        let (nn, vwc, dsm) = {
            let ident = inner.ident.as_ref().unwrap();
            (ident.nn, ident.has_volatile_write_cache(), ident.supports_dsm())
        };

        for nsid in 1..=nn.min(self.cfg.max_namespaces) {
            let buf = self.dma.alloc(std::mem::size_of::<IdentifyNamespace>())?;
            let res = self.sync_admin(
                IdentifyCmd { cns: bits::IDENT_CNS_NAMESPACE, nsid }.build(),
                Some(Payload { addr: buf.addr(), len: buf.len() }),
            );
            match res {
                Ok(_) => {}
                // An inactive id is not an error, just absent.
                Err(NvmeError::CommandError {
                    sc: bits::STS_INVALID_NS, ..
                }) => continue,
                Err(e) => return Err(e),
            }

            let bytes = buf.copy_to_vec();
            let ident = IdentifyNamespace::read_from_bytes(bytes.as_slice())
                .map_err(|_| NvmeError::IdentifyParse)?;
            if !ident.is_active() {
                continue;
            }
            let lbaf = ident.current_lba_format();
            if lbaf.lbads < 9 {
                slog::warn!(self.log, "namespace has unusable LBA format";
                    "nsid" => nsid, "lbads" => lbaf.lbads);
                continue;
            }

            let name = format!("nvme{}n{}", self.instance, nsid);
            let ns = Namespace::new(
                self,
                nsid,
                ident,
                vwc,
                dsm,
                name,
                self.log.clone(),
            );
            slog::info!(self.log, "namespace discovered";
                "name" => ns.name(),
                "sectors" => ns.sector_count(),
                "sector_size" => ns.sector_size(),
            );
            registrar.register(ns.name(), ns.clone() as Arc<dyn BlockDevice>);
            inner.namespaces.push(ns);
        }

        inner.state = ControllerState::NamespacesDiscovered;
        Ok(())
    }

    /// Best-effort teardown: delete the I/O queues (submission side
    /// first) and disable the controller. Errors are logged, not
    /// propagated; the device may already be gone.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        for qp in inner.io_queues.drain(..) {
            for submission in [true, false] {
                let cmd = DeleteIoQCmd { qid: qp.id(), submission };
                if let Err(e) = self.sync_admin(cmd.build(), None) {
                    slog::warn!(self.log, "queue deletion failed: {}", e;
                        "qid" => qp.id());
                }
            }
        }
        inner.namespaces.clear();

        if let Ok(mut cc) = self.regs.cc() {
            if cc.enabled() {
                cc.set_enabled(false);
                self.regs.set_cc(cc);
                if let Err(e) = self.wait_ready(false) {
                    slog::warn!(self.log, "controller did not disable: {}", e);
                }
            }
        }
        inner.state = ControllerState::Disabled;
    }

    /// Read the current value of a feature (Get Features).
    pub fn get_features(&self, fid: u8) -> Result<u32, NvmeError> {
        // Serialize against configuration changes.
        let _inner = self.inner.lock().unwrap();
        let cqe = self.sync_admin(GetFeaturesCmd { fid }.build(), None)?;
        Ok(cqe.dw0)
    }

    /// Issue one admin command and block for its outcome.
    fn sync_admin(
        &self,
        sqe: SubmissionQueueEntry,
        payload: Option<Payload>,
    ) -> Result<crate::bits::CompletionQueueEntry, NvmeError> {
        let waiter = SyncWaiter::submit(&self.admin, sqe, payload)?;
        waiter.wait(&self.admin)?.into_result()
    }

    /// Submit an I/O command on the first I/O queue, holding the
    /// controller lock for the submission but not across the wait (the
    /// completion runs on the interrupt path).
    pub(crate) fn submit_io(
        &self,
        sqe: SubmissionQueueEntry,
        payload: Option<Payload>,
    ) -> Result<(SyncWaiter, Arc<QueuePair>), NvmeError> {
        let inner = self.inner.lock().unwrap();
        let qp = inner
            .io_queues
            .first()
            .cloned()
            .ok_or(NvmeError::NoIoQueues)?;
        let waiter = SyncWaiter::submit(&qp, sqe, payload)?;
        Ok((waiter, qp))
    }

    pub(crate) fn dma(&self) -> &Arc<dyn DmaOps> {
        &self.dma
    }

    #[cfg(test)]
    pub(crate) fn first_io_queue(&self) -> Option<Arc<QueuePair>> {
        self.inner.lock().unwrap().io_queues.first().cloned()
    }
}
