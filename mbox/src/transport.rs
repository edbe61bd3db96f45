// SPDX-License-Identifier: Apache-2.0
// Copyright Cxlkit Authors

//! The ioctl boundary of the mailbox engine.
//!
//! The kernel interface is two ioctls on the memory device's character
//! node.  `CXL_MEM_QUERY_COMMANDS` fills a caller-sized array of
//! [`CommandInfo`] entries and reports the device's total command count;
//! `CXL_MEM_SEND_COMMAND` submits one command and returns the firmware
//! status and the output length actually produced.  Both parameter blocks
//! are host-endian kernel ABI and reproduced here field for field.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::PathBuf;

use nix::errno::Errno;
use nix::libc;
use nix::sys::stat::{SFlag, fstat, major, minor};
use tracing::debug;

use crate::{MboxError, MboxTarget};

/// One entry of the device's command catalog.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct CommandInfo {
    pub id: u32,
    pub flags: u32,
    pub size_in: i32,
    pub size_out: i32,
}

/// One mailbox submission, as seen by a [`Transport`].
///
/// The transport reads `id`, `raw_opcode`, and the buffers, and writes
/// `retval` (firmware status) and `out_len` (bytes of output produced).
#[derive(Debug)]
pub struct SendRequest<'a> {
    pub id: u32,
    pub raw_opcode: u16,
    pub input: &'a [u8],
    pub output: &'a mut [u8],
    pub retval: i32,
    pub out_len: usize,
}

/// Carries mailbox traffic to a device.
///
/// [`CharDev`] is the production implementation; tests substitute an
/// in-memory one.
pub trait Transport: std::fmt::Debug {
    /// Fill `infos` with the device's command catalog.
    ///
    /// Returns the total number of commands the device supports, which may
    /// exceed `infos.len()`; querying with an empty slice is the idiom for
    /// learning the count.
    fn query_commands(&mut self, infos: &mut [CommandInfo]) -> Result<u32, MboxError>;

    /// Submit one command and record its results into `req`.
    fn send(&mut self, req: &mut SendRequest<'_>) -> Result<(), MboxError>;
}

// struct cxl_send_command from the kernel UAPI, with the raw-opcode union
// flattened.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
struct SendCommand {
    id: u32,
    flags: u32,
    raw_opcode: u16,
    raw_rsvd: u16,
    retval: u32,
    in_size: i32,
    in_rsvd: i32,
    in_payload: u64,
    out_size: i32,
    out_rsvd: i32,
    out_payload: u64,
}

const CXL_MEM_IOC_MAGIC: u8 = 0xCE;
const QUERY_HEADER_SIZE: usize = 8;
const COMMAND_INFO_SIZE: usize = std::mem::size_of::<CommandInfo>();

const CXL_MEM_QUERY_COMMANDS: libc::c_ulong =
    nix::request_code_read!(CXL_MEM_IOC_MAGIC, 1, QUERY_HEADER_SIZE);
const CXL_MEM_SEND_COMMAND: libc::c_ulong =
    nix::request_code_readwrite!(CXL_MEM_IOC_MAGIC, 2, std::mem::size_of::<SendCommand>());

/// Mailbox transport over the device's `/dev/cxl/<devname>` node.
///
/// The node is opened per call and validated against the expected
/// char-device major/minor before any ioctl is issued, so a renamed or
/// renumbered node is caught instead of commanded.
#[derive(Debug, Clone)]
pub struct CharDev {
    target: MboxTarget,
}

impl CharDev {
    #[must_use]
    pub fn new(target: MboxTarget) -> Self {
        CharDev { target }
    }

    fn open_validated(&self) -> Result<File, MboxError> {
        let path = PathBuf::from(format!("/dev/cxl/{}", self.target.devname));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| MboxError::Open {
                path: path.clone(),
                source,
            })?;

        let st = fstat(&file).map_err(MboxError::Ioctl)?;
        let is_chr = SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT == SFlag::S_IFCHR;
        if !is_chr
            || major(st.st_rdev) != self.target.major
            || minor(st.st_rdev) != self.target.minor
        {
            debug!("failed to validate {} as a CXL memdev node", path.display());
            return Err(MboxError::BadDeviceNode { path });
        }
        Ok(file)
    }
}

impl Transport for CharDev {
    fn query_commands(&mut self, infos: &mut [CommandInfo]) -> Result<u32, MboxError> {
        let file = self.open_validated()?;

        let n = u32::try_from(infos.len()).map_err(|_| MboxError::PayloadTooLarge {
            size: infos.len(),
            max: u32::MAX as usize,
        })?;
        let mut buf = vec![0u8; QUERY_HEADER_SIZE + infos.len() * COMMAND_INFO_SIZE];
        buf[..4].copy_from_slice(&n.to_ne_bytes());

        // SAFETY: buf is sized for the n entries announced in its header and
        // lives across the call.
        #[allow(unsafe_code)]
        let rc = unsafe {
            libc::ioctl(
                file.as_raw_fd(),
                CXL_MEM_QUERY_COMMANDS,
                buf.as_mut_ptr().cast::<libc::c_void>(),
            )
        };
        Errno::result(rc).map_err(MboxError::Ioctl)?;

        let total = u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let filled = infos.len().min(total as usize);
        for (i, info) in infos.iter_mut().enumerate().take(filled) {
            let at = |field: usize| {
                let off = QUERY_HEADER_SIZE + i * COMMAND_INFO_SIZE + field * 4;
                [buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]
            };
            info.id = u32::from_ne_bytes(at(0));
            info.flags = u32::from_ne_bytes(at(1));
            info.size_in = i32::from_ne_bytes(at(2));
            info.size_out = i32::from_ne_bytes(at(3));
        }
        Ok(total)
    }

    fn send(&mut self, req: &mut SendRequest<'_>) -> Result<(), MboxError> {
        let file = self.open_validated()?;

        let mut cmd = SendCommand {
            id: req.id,
            raw_opcode: req.raw_opcode,
            in_size: i32::try_from(req.input.len()).map_err(|_| MboxError::PayloadTooLarge {
                size: req.input.len(),
                max: i32::MAX as usize,
            })?,
            out_size: i32::try_from(req.output.len()).map_err(|_| MboxError::PayloadTooLarge {
                size: req.output.len(),
                max: i32::MAX as usize,
            })?,
            ..SendCommand::default()
        };
        if !req.input.is_empty() {
            cmd.in_payload = req.input.as_ptr() as u64;
        }
        if !req.output.is_empty() {
            cmd.out_payload = req.output.as_mut_ptr() as u64;
        }

        // SAFETY: cmd and the payload buffers it points at live across the
        // call; the kernel writes only within the sizes given.
        #[allow(unsafe_code)]
        let rc = unsafe {
            libc::ioctl(
                file.as_raw_fd(),
                CXL_MEM_SEND_COMMAND,
                std::ptr::from_mut(&mut cmd).cast::<libc::c_void>(),
            )
        };
        Errno::result(rc).map_err(MboxError::Ioctl)?;

        #[allow(clippy::cast_possible_wrap)]
        {
            req.retval = cmd.retval as i32;
        }
        req.out_len = usize::try_from(cmd.out_size).unwrap_or(0);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::{COMMAND_INFO_SIZE, QUERY_HEADER_SIZE, SendCommand};

    #[test]
    fn kernel_abi_sizes() {
        assert_eq!(COMMAND_INFO_SIZE, 16);
        assert_eq!(QUERY_HEADER_SIZE, 8);
        assert_eq!(std::mem::size_of::<SendCommand>(), 48);
    }
}
