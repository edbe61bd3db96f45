// SPDX-License-Identifier: Apache-2.0
// Copyright Cxlkit Authors

//! Mailbox command engine for CXL memory devices.
//!
//! A CXL memory device exposes its firmware mailbox through a character
//! device and two ioctls: one that reports the catalog of commands the
//! device supports, and one that submits a single command.  This crate
//! drives that interface as a small state machine:
//!
//! ```text
//! new -> queried -> validated -> built -> submitted -> completed/failed
//! ```
//!
//! [`Command`] owns the catalog, the input/output payload buffers, and the
//! firmware status of one transaction.  The catalog is authoritative: a
//! command id the device did not report is rejected as
//! [`MboxError::Unsupported`] before any buffer is allocated or ioctl
//! issued.
//!
//! The ioctl boundary is the [`Transport`] trait; [`CharDev`] is the real
//! implementation.  Tests drive the engine through an in-memory transport,
//! so everything above the ioctl is exercised without a device.
//!
//! Device payloads are little-endian wire data decoded by the typed views
//! in [`payload`]; label-storage transfers are chunked by [`label`].

#![deny(clippy::all, clippy::unwrap_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]

use std::path::PathBuf;

pub mod command;
pub mod label;
pub mod payload;
pub mod transport;

pub use command::{Command, SetPartitionMode};
pub use label::{read_label, write_label, zero_label};
pub use payload::{
    CAPACITY_MULTIPLIER, HealthInfo, HealthStatus, Identify, MediaStatus, PartitionInfo, Severity,
};
pub use transport::{CharDev, CommandInfo, SendRequest, Transport};

/// Command ids assigned by the kernel's CXL memory-device interface.
///
/// The numeric values are kernel ABI and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[repr(u32)]
pub enum CommandId {
    Invalid = 0,
    Identify = 1,
    Raw = 2,
    GetSupportedLogs = 3,
    GetFwInfo = 4,
    GetPartitionInfo = 5,
    GetLsa = 6,
    GetHealthInfo = 7,
    GetLog = 8,
    SetPartitionInfo = 9,
    SetLsa = 10,
    GetAlertConfig = 11,
    SetAlertConfig = 12,
    GetShutdownState = 13,
    SetShutdownState = 14,
    GetPoison = 15,
    InjectPoison = 16,
    ClearPoison = 17,
    GetScanMediaCaps = 18,
    ScanMedia = 19,
    GetScanMedia = 20,
}

impl CommandId {
    #[must_use]
    pub fn raw(self) -> u32 {
        self as u32
    }
}

/// The mailbox identity of one memory device: which `/dev/cxl` node to
/// open, the char-device numbers it must present, and the payload ceiling
/// the device advertised at discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MboxTarget {
    pub devname: String,
    pub major: u64,
    pub minor: u64,
    pub payload_max: usize,
}

/// Errors raised by the mailbox engine.
#[derive(Debug, thiserror::Error)]
pub enum MboxError {
    /// The device's command catalog does not list the requested command.
    #[error("command {0} is not supported by the device")]
    Unsupported(CommandId),

    /// The command was submitted before its catalog query ran.
    #[error("command has not been queried against the device")]
    NotQueried,

    /// A caller-supplied payload size exceeds the device maximum.
    #[error("payload size {size} exceeds device maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },

    /// The device's payload ceiling cannot fit even one label transfer.
    #[error("device payload maximum {0} cannot fit a label transfer")]
    PayloadMaxTooSmall(usize),

    /// Raw commands may not use the reserved opcode zero.
    #[error("raw opcode 0 is reserved")]
    ReservedOpcode,

    /// A label transfer would run past the 32-bit label address space.
    #[error("label range {offset:#x}+{len:#x} exceeds the 32-bit label space")]
    LabelRangeTooLarge { offset: u64, len: u64 },

    /// A read requested more bytes than the command transferred.
    #[error("requested {requested} bytes but the command transferred {transferred}")]
    ReadBeyondTransfer { requested: usize, transferred: usize },

    /// The mailbox node could not be opened.
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The opened node is not the expected character device.
    #[error("{path} is not the expected character device")]
    BadDeviceNode { path: PathBuf },

    /// The ioctl itself failed.
    #[error("mailbox ioctl failed: {0}")]
    Ioctl(#[source] nix::errno::Errno),

    /// The device firmware completed the command with a non-zero status.
    #[error("device firmware returned status {0}")]
    Firmware(i32),

    /// A decoder was applied to a command of a different id.
    #[error("expected output of {expected}, command is {actual}")]
    WrongCommand { expected: CommandId, actual: CommandId },

    /// The command failed before producing a decodable payload.
    #[error("command failed with status {0}, output not decodable")]
    FailedCommand(i32),

    /// The output payload is shorter than the decoded layout.
    #[error("output payload truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    /// A chunked label write failed partway; the given device byte range
    /// may hold a mix of old and new labels.
    #[error("labels in range {start:#x}..{end:#x} may be in an inconsistent state: {source}")]
    LabelsInconsistent {
        start: u64,
        end: u64,
        #[source]
        source: Box<MboxError>,
    },
}
