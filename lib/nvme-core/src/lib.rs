// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command/queue engine for an NVMe block-storage controller.
//!
//! This crate owns the hardware-facing protocol of an NVMe host driver:
//! building and submitting commands, matching completions to in-flight
//! requests, managing the PRP scatter-gather lists that describe
//! arbitrarily sized transfers, and sequencing the controller through its
//! mandatory bring-up state machine.
//!
//! Bus enumeration, register mapping, and interrupt vector allocation are
//! a collaborator's problem; it hands the results over as a
//! [`platform::DeviceHandle`]. The generic block layer sits on the other
//! side of the [`block`] traits and receives one device per discovered
//! namespace.

use thiserror::Error;

pub mod bits;
pub mod block;
pub mod cmds;
pub mod common;
pub mod config;
pub mod controller;
pub mod ns;
pub mod platform;
pub mod pool;
pub mod prp;
pub mod queue;
pub mod regs;

#[cfg(test)]
mod testutil;

pub use config::Config;
pub use controller::{Controller, ControllerState};
pub use ns::Namespace;

use bits::StatusCodeType;
use config::ConfigError;
use platform::PlatformError;
use prp::PrpError;
use queue::QueueId;

/// Driver errors.
#[derive(Debug, Error)]
pub enum NvmeError {
    /// A register read returned the all-ones sentinel: the device has
    /// fallen off the bus.
    #[error("controller is gone (register read returned all ones)")]
    DeviceGone,

    /// CSTS.RDY did not reach the wanted value within the CAP.TO budget.
    #[error("controller did not reach ready={0} within {1:?}")]
    ReadyTimeout(bool, std::time::Duration),

    /// CSTS.CFS is set.
    #[error("controller reports fatal status")]
    ControllerFatal,

    /// The controller does not implement the NVM command set.
    #[error("controller does not support the NVM command set")]
    NoNvmCommandSet,

    /// The bus collaborator provided no usable interrupt vectors.
    #[error("no interrupt vectors provided")]
    NoInterruptVectors,

    /// The request pool is empty. Surfaced synchronously; never blocks.
    #[error("no free request slot")]
    RequestsExhausted,

    /// PRP construction failed.
    #[error(transparent)]
    Prp(#[from] PrpError),

    /// The payload exceeds the controller's maximum transfer size.
    #[error("transfer of {len} bytes exceeds the controller limit of {max}")]
    TransferTooLarge { len: usize, max: usize },

    /// The submission ring has no free slot.
    #[error("submission queue {0} is full")]
    QueueFull(QueueId),

    /// The controller completed a command with an error status.
    #[error("command failed: {sct:?}/{sc:#04x} (dnr={dnr})")]
    CommandError { sct: StatusCodeType, sc: u8, dnr: bool },

    /// No completion was observed within the timeout budget.
    #[error("command timed out awaiting completion")]
    CommandTimeout,

    /// The controller granted no usable I/O queues.
    #[error("no I/O queues available")]
    NoIoQueues,

    /// An identify payload could not be parsed.
    #[error("short or malformed identify payload")]
    IdentifyParse,

    /// The operation is not valid in the controller's current state.
    #[error("operation invalid in controller state {0:?}")]
    InvalidState(ControllerState),

    /// Flush issued on a namespace without a volatile write cache.
    #[error("namespace {0} does not support flush")]
    FlushUnsupported(u32),

    /// The caller's buffer cannot hold the requested transfer.
    #[error("buffer too small: need {need} bytes, have {have}")]
    ShortBuffer { need: usize, have: usize },

    /// The owning controller has been torn down.
    #[error("controller has been detached")]
    ControllerGone,

    /// An error from a platform collaborator.
    #[error(transparent)]
    Platform(#[from] PlatformError),

    /// An invalid configuration was supplied.
    #[error(transparent)]
    Config(#[from] ConfigError),
}
