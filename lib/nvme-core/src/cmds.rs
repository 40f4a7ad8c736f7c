// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed command construction.
//!
//! Each admin or NVM command the driver issues has a builder here that
//! serializes to the common 64-byte [`SubmissionQueueEntry`] wire layout.
//! The command-specific dwords are only ever written through these
//! builders; nothing else in the driver packs raw dwords.

use crate::bits::{self, CompletionQueueEntry, StatusCodeType, StatusField, SubmissionQueueEntry};
use crate::common::PhysAddr;
use crate::queue::QueueId;

/// Identify Command Parameters
///
/// The 4096-byte destination buffer travels as the request payload; the
/// data-pointer builder fills PRP1 from it at submit time.
///
/// See NVMe 1.4 Section 5.15 Identify command
#[derive(Debug)]
pub struct IdentifyCmd {
    /// Controller or Namespace Structure (CNS)
    pub cns: u8,

    /// Namespace Identifier (NSID); zero for controller-scoped CNS values.
    pub nsid: u32,
}

impl IdentifyCmd {
    pub fn build(&self) -> SubmissionQueueEntry {
        SubmissionQueueEntry {
            cdw0: bits::ADMIN_OPC_IDENTIFY as u32,
            nsid: self.nsid,
            cdw10: self.cns as u32,
            ..Default::default()
        }
    }
}

/// Create I/O Completion Queue Command Parameters
///
/// See NVMe 1.4 Section 5.3 Create I/O Completion Queue command
#[derive(Debug)]
pub struct CreateIoCqCmd {
    /// Queue Identifier (QID) to assign.
    pub qid: QueueId,

    /// Queue depth in entries (converted to the 0's based QSIZE on the
    /// wire).
    pub depth: u16,

    /// Interrupt Vector (IV) servicing this queue.
    pub intr_vector: u16,

    /// Base address of the physically contiguous ring.
    pub base: PhysAddr,
}

impl CreateIoCqCmd {
    pub fn build(&self) -> SubmissionQueueEntry {
        SubmissionQueueEntry {
            cdw0: bits::ADMIN_OPC_CREATE_IO_CQ as u32,
            prp1: self.base.0,
            cdw10: (self.depth as u32 - 1) << 16 | self.qid as u32,
            // IV, interrupts enabled (IEN), physically contiguous (PC)
            cdw11: (self.intr_vector as u32) << 16 | 0b10 | 0b01,
            ..Default::default()
        }
    }
}

/// Create I/O Submission Queue Command Parameters
///
/// See NVMe 1.4 Section 5.4 Create I/O Submission Queue command
#[derive(Debug)]
pub struct CreateIoSqCmd {
    /// Queue Identifier (QID) to assign.
    pub qid: QueueId,

    /// The Completion Queue (CQID) this Submission Queue posts to.
    pub cqid: QueueId,

    /// Queue depth in entries (converted to the 0's based QSIZE on the
    /// wire).
    pub depth: u16,

    /// Base address of the physically contiguous ring.
    pub base: PhysAddr,
}

impl CreateIoSqCmd {
    pub fn build(&self) -> SubmissionQueueEntry {
        SubmissionQueueEntry {
            cdw0: bits::ADMIN_OPC_CREATE_IO_SQ as u32,
            prp1: self.base.0,
            cdw10: (self.depth as u32 - 1) << 16 | self.qid as u32,
            // CQID, urgent priority class, physically contiguous (PC)
            cdw11: (self.cqid as u32) << 16 | 0b01,
            ..Default::default()
        }
    }
}

/// Delete I/O Submission or Completion Queue Command Parameters
///
/// See NVMe 1.4 Sections 5.6 & 5.5
#[derive(Debug)]
pub struct DeleteIoQCmd {
    /// Queue Identifier (QID) to delete.
    pub qid: QueueId,

    /// True to delete the submission queue, false for the completion
    /// queue. A submission queue must be deleted before its completion
    /// queue.
    pub submission: bool,
}

impl DeleteIoQCmd {
    pub fn build(&self) -> SubmissionQueueEntry {
        let opc = if self.submission {
            bits::ADMIN_OPC_DELETE_IO_SQ
        } else {
            bits::ADMIN_OPC_DELETE_IO_CQ
        };
        SubmissionQueueEntry {
            cdw0: opc as u32,
            cdw10: self.qid as u32,
            ..Default::default()
        }
    }
}

/// Set Features Command Parameters
///
/// See NVMe 1.4 Section 5.21 Set Features command
#[derive(Debug)]
pub struct SetFeaturesCmd {
    /// Feature Identifier (FID)
    pub fid: u8,

    /// Feature-specific attribute dword.
    pub cdw11: u32,
}

impl SetFeaturesCmd {
    /// Request `nsq` I/O submission queues and `ncq` I/O completion
    /// queues (admin queues excluded; both 0's based on the wire).
    ///
    /// See NVMe 1.4 Section 5.21.1.7 Number of Queues (Feature Identifier 07h)
    pub fn number_of_queues(nsq: u16, ncq: u16) -> Self {
        Self {
            fid: bits::FEAT_ID_NUM_QUEUES,
            cdw11: (ncq as u32 - 1) << 16 | (nsq as u32 - 1),
        }
    }

    pub fn build(&self) -> SubmissionQueueEntry {
        SubmissionQueueEntry {
            cdw0: bits::ADMIN_OPC_SET_FEATURES as u32,
            cdw10: self.fid as u32,
            cdw11: self.cdw11,
            ..Default::default()
        }
    }
}

/// Get Features Command Parameters
///
/// See NVMe 1.4 Section 5.14 Get Features command
#[derive(Debug)]
pub struct GetFeaturesCmd {
    /// Feature Identifier (FID); the current value is selected.
    pub fid: u8,
}

impl GetFeaturesCmd {
    pub fn build(&self) -> SubmissionQueueEntry {
        SubmissionQueueEntry {
            cdw0: bits::ADMIN_OPC_GET_FEATURES as u32,
            cdw10: self.fid as u32,
            ..Default::default()
        }
    }
}

/// Completion result dword of a Number of Queues feature command: the
/// number of I/O submission and completion queues the controller actually
/// allocated (both reported 0's based).
pub fn num_queues_granted(dw0: u32) -> (u16, u16) {
    let nsqa = (dw0 & 0xFFFF) as u16 + 1;
    let ncqa = (dw0 >> 16) as u16 + 1;
    (nsqa, ncqa)
}

/// Read Command Parameters
///
/// See NVMe 1.4 Section 6.9 Read command
#[derive(Debug)]
pub struct ReadCmd {
    /// Namespace Identifier (NSID)
    pub nsid: u32,

    /// Starting LBA (SLBA)
    pub slba: u64,

    /// Number of Logical Blocks (NLB); converted to 0's based on the wire.
    pub nlb: u16,
}

impl ReadCmd {
    pub fn build(&self) -> SubmissionQueueEntry {
        build_rw(bits::NVM_OPC_READ, self.nsid, self.slba, self.nlb)
    }
}

/// Write Command Parameters
///
/// See NVMe 1.4 Section 6.15 Write command
#[derive(Debug)]
pub struct WriteCmd {
    /// Namespace Identifier (NSID)
    pub nsid: u32,

    /// Starting LBA (SLBA)
    pub slba: u64,

    /// Number of Logical Blocks (NLB); converted to 0's based on the wire.
    pub nlb: u16,
}

impl WriteCmd {
    pub fn build(&self) -> SubmissionQueueEntry {
        build_rw(bits::NVM_OPC_WRITE, self.nsid, self.slba, self.nlb)
    }
}

fn build_rw(opc: u8, nsid: u32, slba: u64, nlb: u16) -> SubmissionQueueEntry {
    SubmissionQueueEntry {
        cdw0: opc as u32,
        nsid,
        cdw10: slba as u32,
        cdw11: (slba >> 32) as u32,
        cdw12: nlb as u32 - 1,
        ..Default::default()
    }
}

/// Flush Command Parameters
///
/// See NVMe 1.4 Section 6.8 Flush command
#[derive(Debug)]
pub struct FlushCmd {
    /// Namespace Identifier (NSID)
    pub nsid: u32,
}

impl FlushCmd {
    pub fn build(&self) -> SubmissionQueueEntry {
        SubmissionQueueEntry {
            cdw0: bits::NVM_OPC_FLUSH as u32,
            nsid: self.nsid,
            ..Default::default()
        }
    }
}

/// The terminal outcome delivered to a request's completion callback.
#[derive(Debug)]
pub enum CmdOutcome {
    /// The controller posted a completion (possibly an error completion).
    Completed(CompletionQueueEntry),

    /// No completion was observed within the timeout budget. Distinct
    /// from a hardware-reported error; the controller's health is suspect.
    TimedOut,
}

impl CmdOutcome {
    pub fn is_success(&self) -> bool {
        match self {
            CmdOutcome::Completed(cqe) => !cqe.status().is_error(),
            CmdOutcome::TimedOut => false,
        }
    }

    /// Collapse the outcome into the completion record or the matching
    /// error.
    pub fn into_result(self) -> Result<CompletionQueueEntry, crate::NvmeError> {
        match self {
            CmdOutcome::Completed(cqe) => {
                let status = cqe.status();
                if status.is_error() {
                    Err(crate::NvmeError::CommandError {
                        sct: status.sct(),
                        sc: status.code(),
                        dnr: status.dnr(),
                    })
                } else {
                    Ok(cqe)
                }
            }
            CmdOutcome::TimedOut => Err(crate::NvmeError::CommandTimeout),
        }
    }
}

/// Whether a completion error is worth retrying.
///
/// Transient conditions (an abort the driver requested, a namespace still
/// spinning up, an internal path hiccup) are retried unless the
/// controller set Do Not Retry; everything else is surfaced immediately.
pub fn completion_retriable(status: StatusField) -> bool {
    if status.dnr() {
        return false;
    }
    match (status.sct(), status.code()) {
        (StatusCodeType::Generic, bits::STS_ABORT_REQ)
        | (StatusCodeType::Generic, bits::STS_NAMESPACE_NOT_READY) => true,
        (StatusCodeType::PathRelated, bits::STS_INTERNAL_PATH_ERROR) => true,
        _ => false,
    }
}
