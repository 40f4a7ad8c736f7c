// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#![allow(dead_code)]

//! Wire-format structures and register bit layouts.
//!
//! Everything in here is mechanical: fixed-size records the controller
//! reads and writes, and the bit fields of the memory-mapped registers.
//! All multi-byte fields are little-endian on the wire; this driver
//! targets little-endian hosts and stores them natively.

use bitstruct::bitstruct;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// A Submission Queue Entry as represented in memory.
///
/// See NVMe 1.4 Section 4.2 Submission Queue Entry - Command Format
#[derive(Debug, Default, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed(1))]
pub struct SubmissionQueueEntry {
    /// Command Dword 0 (CDW0)
    ///
    /// Bits
    /// 31:16 - Command Identifier (CID)
    /// 15:10 - Reserved
    /// 09:08 - Fused Operation (FUSE)
    /// 07:00 - Opcode (OPC)
    pub cdw0: u32,

    /// Namespace Identifier (NSID)
    pub nsid: u32,

    /// Reserved - Bytes 15:08
    pub rsvd: u64,

    /// Metadata Pointer (MPTR)
    pub mptr: u64,

    /// The first Physical Region Page (PRP) entry for the command.
    ///
    /// See NVMe 1.4 Section 4.3 Physical Region Page Entry and List
    pub prp1: u64,

    /// Either reserved, the second PRP entry, or a PRP List pointer.
    pub prp2: u64,

    /// Command Dwords 10 through 15; command specific.
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

impl SubmissionQueueEntry {
    /// Returns the Command Identifier (CID) of this entry.
    pub fn cid(&self) -> u16 {
        (self.cdw0 >> 16) as u16
    }

    /// Stamps the Command Identifier (CID) into CDW0.
    pub fn set_cid(&mut self, cid: u16) {
        self.cdw0 = (self.cdw0 & 0xFFFF) | (cid as u32) << 16;
    }

    /// Returns the Opcode (OPC) of this entry.
    pub fn opcode(&self) -> u8 {
        self.cdw0 as u8
    }
}

/// A Completion Queue Entry as represented in memory.
///
/// See NVMe 1.4 Section 4.6 Completion Queue Entry
#[derive(Debug, Default, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed(1))]
pub struct CompletionQueueEntry {
    /// Dword 0 (DW0) - command specific result.
    pub dw0: u32,

    /// Reserved (DW1)
    pub rsvd: u32,

    /// Submission Queue Head Pointer (SQHD)
    ///
    /// The current head of the Submission Queue identified by `sqid`, as
    /// consumed by the controller. Lets the driver reclaim ring slots.
    pub sqhd: u16,

    /// Submission Queue Identifier (SQID)
    pub sqid: u16,

    /// Command Identifier (CID) of the completed command.
    pub cid: u16,

    /// Phase Tag (bit 0) and Status Field (bits 15:1).
    ///
    /// See NVMe 1.4 Section 4.6.1 Status Field Definition
    pub status_phase: u16,
}

impl CompletionQueueEntry {
    pub fn status(&self) -> StatusField {
        StatusField(self.status_phase)
    }

    pub fn phase(&self) -> bool {
        self.status().phase()
    }
}

bitstruct! {
    /// The Phase Tag and Status Field of a Completion Queue Entry.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct StatusField(pub u16) {
        /// Phase Tag (P). Flips every lap the controller makes around the
        /// Completion Queue; how the driver spots new entries.
        pub phase: bool = 0;

        /// Status Code (SC)
        pub code: u8 = 1..9;

        /// Status Code Type (SCT)
        pub code_type: u8 = 9..12;

        /// Command Retry Delay (CRD)
        pub crd: u8 = 12..14;

        /// More (M): more status information available via Get Log Page.
        pub more: bool = 14;

        /// Do Not Retry (DNR)
        pub dnr: bool = 15;
    }
}

impl StatusField {
    /// Build a status word (used when synthesizing completions in tests).
    pub fn encode(sct: StatusCodeType, sc: u8, dnr: bool) -> Self {
        StatusField(0)
            .with_code_type(sct as u8)
            .with_code(sc)
            .with_dnr(dnr)
    }

    /// Any nonzero status code or status code type is an error.
    pub fn is_error(&self) -> bool {
        self.code() != 0 || self.code_type() != 0
    }

    pub fn sct(&self) -> StatusCodeType {
        StatusCodeType::from(self.code_type())
    }
}

/// The type of value specified in the Status Field of a completion.
///
/// See NVMe 1.4 Section 4.6.1.1 Status Code Type (SCT)
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StatusCodeType {
    Generic = 0,
    CmdSpecific = 1,
    MediaDataIntegrity = 2,
    PathRelated = 3,
    VendorSpecific = 7,
}

impl From<u8> for StatusCodeType {
    fn from(raw: u8) -> Self {
        match raw {
            0 => StatusCodeType::Generic,
            1 => StatusCodeType::CmdSpecific,
            2 => StatusCodeType::MediaDataIntegrity,
            3 => StatusCodeType::PathRelated,
            // Reserved types are lumped with vendor-specific: the driver
            // treats both as opaque, non-retriable errors.
            _ => StatusCodeType::VendorSpecific,
        }
    }
}

// Register bits

bitstruct! {
    /// Representation of the Controller Capabilities (CAP) register.
    ///
    /// See NVMe 1.4 Section 3.1.1 Offset 00h: CAP - Controller Capabilities
    #[derive(Clone, Copy, Debug, Default)]
    pub struct Capabilities(pub u64) {
        /// Maximum Queue Entries Supported (MQES), 0's based.
        pub mqes: u16 = 0..16;

        /// Contiguous Queues Required (CQR)
        pub cqr: bool = 16;

        /// Arbitration Mechanisms Supported (AMS)
        pub ams: u8 = 17..19;

        reserved1: u8 = 19..24;

        /// Timeout (TO): worst-case time to wait for CSTS.RDY to change,
        /// in 500 ms units.
        pub to: u8 = 24..32;

        /// Doorbell Stride (DSTRD): doorbells are spaced 2^(2 + DSTRD)
        /// bytes apart.
        pub dstrd: u8 = 32..36;

        /// NVM Subsystem Reset Supported (NSSRS)
        pub nssrs: bool = 36;

        /// Command Sets Supported (CSS): NVM command set.
        pub css_nvm: bool = 37;

        css_reserved: u8 = 38..45;

        /// Boot Partition Support (BPS)
        pub bps: bool = 45;

        reserved2: u8 = 46..48;

        /// Memory Page Size Minimum (MPSMIN): 2^(12 + MPSMIN) bytes.
        pub mpsmin: u8 = 48..52;

        /// Memory Page Size Maximum (MPSMAX): 2^(12 + MPSMAX) bytes.
        pub mpsmax: u8 = 52..56;

        /// Persistent Memory Region Supported (PMRS)
        pub pmrs: bool = 56;

        /// Controller Memory Buffer Supported (CMBS)
        pub cmbs: bool = 57;

        reserved3: u8 = 58..64;
    }
}

impl Capabilities {
    /// Size in bytes represented by the MPSMIN value.
    pub fn mpsmin_sz(&self) -> usize {
        1 << (12 + self.mpsmin())
    }

    /// Worst-case ready-transition wait, in milliseconds.
    pub fn ready_timeout_ms(&self) -> u64 {
        self.to() as u64 * 500
    }
}

bitstruct! {
    /// Representation of the Controller Configuration (CC) register.
    ///
    /// See NVMe 1.4 Section 3.1.5 Offset 14h: CC - Controller Configuration
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Configuration(pub u32) {
        /// Enable (EN). Transitioning 1 -> 0 is a controller reset.
        pub enabled: bool = 0;

        reserved1: u8 = 1..4;

        /// I/O Command Set Selected (CSS); 0 = NVM command set.
        pub css: u8 = 4..7;

        /// Memory Page Size (MPS): 2^(12 + MPS) bytes, within
        /// CAP.MPSMIN/MPSMAX.
        pub mps: u8 = 7..11;

        /// Arbitration Mechanism Selected (AMS); 0 = round robin.
        pub ams: u8 = 11..14;

        /// Shutdown Notification (SHN)
        pub shn: u8 = 14..16;

        /// I/O Submission Queue Entry Size (IOSQES): 2^IOSQES bytes.
        pub iosqes: u8 = 16..20;

        /// I/O Completion Queue Entry Size (IOCQES): 2^IOCQES bytes.
        pub iocqes: u8 = 20..24;

        reserved2: u8 = 24..32;
    }
}

bitstruct! {
    /// Representation of the Controller Status (CSTS) register.
    ///
    /// See NVMe 1.4 Section 3.1.6 Offset 1Ch: CSTS - Controller Status
    #[derive(Clone, Copy, Debug, Default)]
    pub struct Status(pub u32) {
        /// Ready (RDY): follows CC.EN once the controller has processed
        /// the transition.
        pub ready: bool = 0;

        /// Controller Fatal Status (CFS)
        pub cfs: bool = 1;

        /// Shutdown Status (SHST)
        pub shst: u8 = 2..4;

        /// NVM Subsystem Reset Occurred (NSSRO)
        pub nssro: bool = 4;

        /// Processing Paused (PP)
        pub pp: bool = 5;

        reserved: u32 = 6..32;
    }
}

bitstruct! {
    /// Representation of the Admin Queue Attributes (AQA) register.
    ///
    /// See NVMe 1.4 Section 3.1.7 Offset 24h: AQA - Admin Queue Attributes
    #[derive(Clone, Copy, Debug, Default)]
    pub struct AdminQueueAttrs(pub u32) {
        /// Admin Submission Queue Size (ASQS), 0's based.
        pub asqs: u16 = 0..12;

        reserved1: u8 = 12..16;

        /// Admin Completion Queue Size (ACQS), 0's based.
        pub acqs: u16 = 16..28;

        reserved2: u8 = 28..32;
    }
}

// Version definitions

/// Controller Version NVM Express 1.4 (VS register encoding).
pub const NVME_VER_1_4: u32 = 0x0001_0400;

// Admin Command Opcodes
// See NVMe 1.4 Section 5, Figure 139 Opcodes for Admin Commands

/// Delete I/O Submission Queue Command Opcode
pub const ADMIN_OPC_DELETE_IO_SQ: u8 = 0x00;
/// Create I/O Submission Queue Command Opcode
pub const ADMIN_OPC_CREATE_IO_SQ: u8 = 0x01;
/// Get Log Page Command Opcode
pub const ADMIN_OPC_GET_LOG_PAGE: u8 = 0x02;
/// Delete I/O Completion Queue Command Opcode
pub const ADMIN_OPC_DELETE_IO_CQ: u8 = 0x04;
/// Create I/O Completion Queue Command Opcode
pub const ADMIN_OPC_CREATE_IO_CQ: u8 = 0x05;
/// Identify Command Opcode
pub const ADMIN_OPC_IDENTIFY: u8 = 0x06;
/// Abort Command Opcode
pub const ADMIN_OPC_ABORT: u8 = 0x08;
/// Set Features Command Opcode
pub const ADMIN_OPC_SET_FEATURES: u8 = 0x09;
/// Get Features Command Opcode
pub const ADMIN_OPC_GET_FEATURES: u8 = 0x0A;

// NVM Command Opcodes
// See NVMe 1.4 Section 6, Figure 346 Opcodes for NVM Commands

/// Flush Command Opcode
pub const NVM_OPC_FLUSH: u8 = 0x00;
/// Write Command Opcode
pub const NVM_OPC_WRITE: u8 = 0x01;
/// Read Command Opcode
pub const NVM_OPC_READ: u8 = 0x02;

// Generic Command Status values
// See NVMe 1.4 Section 4.6.1.2.1 Generic Command Status Definition

/// Successful Completion
pub const STS_SUCCESS: u8 = 0x0;
/// Invalid Command Opcode
pub const STS_INVAL_OPC: u8 = 0x1;
/// Invalid Field in Command
pub const STS_INVAL_FIELD: u8 = 0x2;
/// Command ID Conflict
pub const STS_CID_CONFLICT: u8 = 0x3;
/// Data Transfer Error
pub const STS_DATA_XFER_ERR: u8 = 0x4;
/// Internal Error
pub const STS_INTERNAL_ERR: u8 = 0x6;
/// Command Abort Requested
pub const STS_ABORT_REQ: u8 = 0x7;
/// Invalid Namespace or Format
pub const STS_INVALID_NS: u8 = 0xB;
/// Namespace is Not Ready
///
/// The namespace is temporarily unable to service commands; retriable
/// unless DNR is set.
pub const STS_NAMESPACE_NOT_READY: u8 = 0x82;

// Path Related Status values
// See NVMe 1.4 Section 4.6.1.2.4 Path Related Status Definition

/// Internal Path Error: retriable on another attempt unless DNR is set.
pub const STS_INTERNAL_PATH_ERROR: u8 = 0x00;

// Feature identifiers
// See NVMe 1.4 Section 5.21.1, Figure 272 Set Features - Feature Identifiers

/// Arbitration
pub const FEAT_ID_ARBITRATION: u8 = 0x01;
/// Power Management
pub const FEAT_ID_POWER_MGMT: u8 = 0x02;
/// Volatile Write Cache
pub const FEAT_ID_VOLATILE_WRITE_CACHE: u8 = 0x06;
/// Number of Queues
pub const FEAT_ID_NUM_QUEUES: u8 = 0x07;

// Identify CNS values

/// Identify - Namespace data structure for the specified NSID.
pub const IDENT_CNS_NAMESPACE: u8 = 0x0;
/// Identify - Controller data structure.
pub const IDENT_CNS_CONTROLLER: u8 = 0x1;

/// ONCS bit 2: Dataset Management (deallocate) command support.
pub const ONCS_DSM: u16 = 1 << 2;
/// VWC bit 0: a volatile write cache is present (Flush is meaningful).
pub const VWC_PRESENT: u8 = 1 << 0;

/// Identify Controller Data Structure
///
/// Only the fields that drive driver control flow are broken out; the
/// remainder is carried as reserved blocks so the layout stays 4096 bytes.
///
/// See NVMe 1.4 Section 5.15.2, Figure 247 Identify - Identify Controller
/// Data Structure
#[derive(Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed(1))]
pub struct IdentifyController {
    /// PCI Vendor ID (VID)
    pub vid: u16,
    /// PCI Subsystem Vendor ID (SSVID)
    pub ssvid: u16,
    /// Serial Number (SN), ASCII, space padded.
    pub sn: [u8; 20],
    /// Model Number (MN), ASCII, space padded.
    pub mn: [u8; 40],
    /// Firmware Revision (FR), ASCII, space padded.
    pub fr: [u8; 8],
    /// Recommended Arbitration Burst (RAB)
    pub rab: u8,
    /// IEEE OUI Identifier (IEEE)
    pub ieee: [u8; 3],
    /// Controller Multi-Path I/O and Namespace Sharing Capabilities (CMIC)
    pub cmic: u8,
    /// Maximum Data Transfer Size (MDTS)
    ///
    /// In units of the minimum memory page size (CAP.MPSMIN), as a power
    /// of two. Zero means no reported restriction.
    pub mdts: u8,
    /// Controller ID (CNTLID)
    pub cntlid: u16,
    /// Version (VER): same encoding as the VS register.
    pub ver: u32,
    /// Reserved - Bytes 255:84
    pub _resv1: [u8; 172],

    /// Optional Admin Command Support (OACS)
    pub oacs: u16,
    /// Abort Command Limit (ACL), 0's based.
    pub acl: u8,
    /// Asynchronous Event Request Limit (AERL), 0's based.
    pub aerl: u8,
    /// Firmware Updates (FRMW)
    pub frmw: u8,
    /// Log Page Attributes (LPA)
    pub lpa: u8,
    /// Error Log Page Entries (ELPE), 0's based.
    pub elpe: u8,
    /// Number of Power States Support (NPSS), 0's based.
    pub npss: u8,
    /// Admin Vendor Specific Command Configuration (AVSCC)
    pub avscc: u8,
    /// Reserved - Bytes 511:265
    pub _resv2: [u8; 247],

    /// Submission Queue Entry Size (SQES): required (3:0) and maximum
    /// (7:4), both as powers of two.
    pub sqes: u8,
    /// Completion Queue Entry Size (CQES): required (3:0) and maximum
    /// (7:4), both as powers of two.
    pub cqes: u8,
    /// Maximum Outstanding Commands (MAXCMD)
    pub maxcmd: u16,
    /// Number of Namespaces (NN)
    ///
    /// Namespaces start with ID 1 and are packed sequentially.
    pub nn: u32,
    /// Optional NVM Command Support (ONCS)
    pub oncs: u16,
    /// Fused Operation Support (FUSES)
    pub fuses: u16,
    /// Format NVM Attributes (FNA)
    pub fna: u8,
    /// Volatile Write Cache (VWC): bit 0 indicates presence.
    pub vwc: u8,
    /// Atomic Write Unit Normal (AWUN), 0's based, in logical blocks.
    pub awun: u16,
    /// Atomic Write Unit Power Fail (AWUPF), 0's based, in logical blocks.
    pub awupf: u16,
    /// NVM Vendor Specific Command Configuration (NVSCC)
    pub nvscc: u8,
    /// Reserved - Bytes 703:531
    pub _resv3: [u8; 173],
    /// Reserved (I/O Command Set Attributes) - Bytes 2047:704
    pub _resv4: [u8; 1344],

    /// Power State Descriptors (PSD0-PSD31); not consumed by the driver.
    pub psd: [u8; 1024],
    /// Vendor Specific (VS)
    pub vs: [u8; 1024],
}

impl IdentifyController {
    pub fn serial(&self) -> String {
        ascii_field(&self.sn)
    }

    pub fn model(&self) -> String {
        ascii_field(&self.mn)
    }

    pub fn firmware(&self) -> String {
        ascii_field(&self.fr)
    }

    /// MDTS converted to bytes, or `None` when the controller reports no
    /// restriction.
    pub fn mdts_bytes(&self, mpsmin_sz: usize) -> Option<u64> {
        match self.mdts {
            0 => None,
            shift => Some((mpsmin_sz as u64) << shift),
        }
    }

    /// Whether the Dataset Management (deallocate) command is supported.
    pub fn supports_dsm(&self) -> bool {
        self.oncs & ONCS_DSM != 0
    }

    /// Whether a volatile write cache is present (Flush does something).
    pub fn has_volatile_write_cache(&self) -> bool {
        self.vwc & VWC_PRESENT != 0
    }
}

/// ASCII identify fields are space padded; render them trimmed.
fn ascii_field(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches(|c| c == ' ' || c == '\0')
        .to_string()
}

/// LBA Format Data Structure
///
/// See NVMe 1.4 Section 5.15.2, Figure 249 LBA Format Data Structure
#[derive(Debug, Default, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed(1))]
pub struct LbaFormat {
    /// Metadata Size (MS): metadata bytes per LBA.
    pub ms: u16,
    /// LBA Data Size (LBADS) as a power of two; 0 means the format is
    /// unsupported, and the minimum valid value is 9 (512 bytes).
    pub lbads: u8,
    /// Relative Performance (RP)
    pub rp: u8,
}

impl LbaFormat {
    pub fn data_size(&self) -> u64 {
        1u64 << self.lbads
    }
}

/// Identify Namespace Data Structure
///
/// See NVMe 1.4 Section 5.15.2, Figure 245 Identify - Identify Namespace
/// Data Structure
#[derive(Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed(1))]
pub struct IdentifyNamespace {
    /// Namespace Size (NSZE) in logical blocks. Zero means the namespace
    /// is not present.
    pub nsze: u64,
    /// Namespace Capacity (NCAP) in logical blocks; NCAP <= NSZE.
    pub ncap: u64,
    /// Namespace Utilization (NUSE) in logical blocks; NUSE <= NCAP.
    pub nuse: u64,
    /// Namespace Features (NSFEAT)
    pub nsfeat: u8,
    /// Number of LBA Formats (NLBAF), 0's based.
    pub nlbaf: u8,
    /// Formatted LBA Size (FLBAS): bits 3:0 index into `lbaf`.
    pub flbas: u8,
    /// Metadata Capabilities (MC)
    pub mc: u8,
    /// End-to-end Data Protection Capabilities (DPC)
    pub dpc: u8,
    /// End-to-end Data Protection Type Settings (DPS)
    pub dps: u8,
    /// Namespace Multi-path I/O and Sharing Capabilities (NMIC)
    pub nmic: u8,
    /// Reservation Capabilities (RESCAP)
    pub rescap: u8,
    /// Format Progress Indicator (FPI)
    pub fpi: u8,
    /// Deallocate Logical Block Features (DLFEAT)
    pub dlfeat: u8,
    /// Namespace Atomic Write Unit Normal (NAWUN), 0's based.
    pub nawun: u16,
    /// Namespace Atomic Write Unit Power Fail (NAWUPF), 0's based.
    pub nawupf: u16,
    /// Namespace Atomic Compare & Write Unit (NACWU), 0's based.
    pub nacwu: u16,
    /// Namespace Atomic Boundary Size Normal (NABSN), 0's based.
    pub nabsn: u16,
    /// Namespace Atomic Boundary Offset (NABO)
    pub nabo: u16,
    /// Namespace Atomic Boundary Size Power Fail (NABSPF), 0's based.
    pub nabspf: u16,
    /// Namespace Optimal I/O Boundary (NOIOB) in logical blocks; zero
    /// when not reported.
    pub noiob: u16,
    /// NVM Capacity (NVMCAP) in bytes, 128-bit little endian.
    pub nvmcap: [u8; 16],
    /// Reserved - Bytes 103:64
    pub _resv1: [u8; 40],
    /// Namespace Globally Unique Identifier (NGUID)
    pub nguid: [u8; 16],
    /// IEEE Extended Unique Identifier (EUI64)
    pub eui64: [u8; 8],
    /// LBA Formats (LBAF0-LBAF15)
    pub lbaf: [LbaFormat; 16],
    /// Reserved - Bytes 383:192
    pub _resv2: [u8; 192],
    /// Vendor Specific (VS)
    pub vs: [u8; 3712],
}

impl IdentifyNamespace {
    /// A namespace reporting zero size is absent.
    pub fn is_active(&self) -> bool {
        self.nsze != 0
    }

    /// The currently formatted LBA format entry.
    pub fn current_lba_format(&self) -> LbaFormat {
        self.lbaf[(self.flbas & 0xF) as usize]
    }
}
