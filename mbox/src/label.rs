// SPDX-License-Identifier: Apache-2.0
// Copyright Cxlkit Authors

//! Chunked transfers against the Label Storage Area.
//!
//! A label transfer larger than the device's payload ceiling is split into
//! per-command chunks of `payload_max - <set-LSA header>` bytes.  A chunk
//! failure stops the transfer immediately.  For writes and zeroing that
//! leaves the device holding a mix of old and new labels, so the error
//! names the byte range that can no longer be trusted; reads have no
//! device-side effect and fail plainly.

use crate::command::Command;
use crate::payload::SET_LSA_HEADER_SIZE;
use crate::transport::Transport;
use crate::{MboxError, MboxTarget};

fn chunk_limit(target: &MboxTarget) -> Result<usize, MboxError> {
    let limit = target.payload_max.saturating_sub(SET_LSA_HEADER_SIZE);
    if limit == 0 {
        return Err(MboxError::PayloadMaxTooSmall(target.payload_max));
    }
    Ok(limit)
}

fn check_range(offset: u32, len: usize) -> Result<(), MboxError> {
    if u64::from(offset) + len as u64 > u64::from(u32::MAX) {
        return Err(MboxError::LabelRangeTooLarge {
            offset: u64::from(offset),
            len: len as u64,
        });
    }
    Ok(())
}

fn submit_checked(cmd: &mut Command, transport: &mut dyn Transport) -> Result<(), MboxError> {
    cmd.submit(transport)?;
    match cmd.mbox_status() {
        0 => Ok(()),
        status => Err(MboxError::Firmware(status)),
    }
}

#[allow(clippy::cast_possible_truncation)]
fn chunk_offset(offset: u32, done: usize) -> u32 {
    // bounded by the check_range() at entry
    offset + done as u32
}

/// Read `buf.len()` bytes of label storage starting at `offset`.
pub fn read_label(
    target: &MboxTarget,
    transport: &mut dyn Transport,
    buf: &mut [u8],
    offset: u32,
) -> Result<(), MboxError> {
    if buf.is_empty() {
        return Ok(());
    }
    check_range(offset, buf.len())?;
    let limit = chunk_limit(target)?;

    let mut done = 0;
    while done < buf.len() {
        let cur = limit.min(buf.len() - done);
        let at = chunk_offset(offset, done);
        let len = u32::try_from(cur).map_err(|_| MboxError::LabelRangeTooLarge {
            offset: u64::from(at),
            len: cur as u64,
        })?;
        let mut cmd = Command::new_read_label(target, transport, at, len)?;
        cmd.set_output_size(cur)?;
        submit_checked(&mut cmd, transport)?;
        cmd.read_label_payload(&mut buf[done..done + cur])?;
        done += cur;
    }
    Ok(())
}

fn write_chunks(
    target: &MboxTarget,
    transport: &mut dyn Transport,
    data: &[u8],
    offset: u32,
) -> Result<(), MboxError> {
    check_range(offset, data.len())?;
    let limit = chunk_limit(target)?;

    let mut done = 0;
    while done < data.len() {
        let cur = limit.min(data.len() - done);
        let at = chunk_offset(offset, done);
        let result = Command::new_write_label(target, transport, &data[done..done + cur], at)
            .and_then(|mut cmd| submit_checked(&mut cmd, transport));
        if let Err(source) = result {
            return Err(MboxError::LabelsInconsistent {
                start: u64::from(at),
                end: u64::from(offset) + data.len() as u64,
                source: Box::new(source),
            });
        }
        done += cur;
    }
    Ok(())
}

/// Write `buf` to label storage starting at `offset`.
///
/// On failure the device may hold a mix of old and new labels; the error
/// reports the affected byte range.
pub fn write_label(
    target: &MboxTarget,
    transport: &mut dyn Transport,
    buf: &[u8],
    offset: u32,
) -> Result<(), MboxError> {
    if buf.is_empty() {
        return Ok(());
    }
    write_chunks(target, transport, buf, offset)
}

/// Zero `length` bytes of label storage starting at `offset`.
pub fn zero_label(
    target: &MboxTarget,
    transport: &mut dyn Transport,
    length: usize,
    offset: u32,
) -> Result<(), MboxError> {
    if length == 0 {
        return Ok(());
    }
    let zeroes = vec![0u8; length];
    write_chunks(target, transport, &zeroes, offset)
}

#[cfg(test)]
mod test {
    use super::{read_label, write_label, zero_label};
    use crate::command::testutil::{FakeDevice, target};
    use crate::payload::SET_LSA_HEADER_SIZE;
    use crate::{CommandId, MboxError};

    fn lsa_device() -> FakeDevice {
        FakeDevice::with_catalog(&[(CommandId::GetLsa, 8, 0), (CommandId::SetLsa, 0, 0)])
    }

    #[test]
    fn write_spans_chunks_of_payload_max_minus_header() {
        // payload_max 16 -> 8 data bytes per chunk
        let target = target(16);
        let mut device = lsa_device();
        device.push_ok(Vec::new());
        device.push_ok(Vec::new());
        device.push_ok(Vec::new());

        let data: Vec<u8> = (0..20).collect();
        write_label(&target, &mut device, &data, 0x40).expect("write");

        assert_eq!(device.sent.len(), 3);
        let chunk_starts: Vec<u32> = device
            .sent
            .iter()
            .map(|s| u32::from_le_bytes([s.input[0], s.input[1], s.input[2], s.input[3]]))
            .collect();
        assert_eq!(chunk_starts, vec![0x40, 0x48, 0x50]);
        assert_eq!(&device.sent[1].input[SET_LSA_HEADER_SIZE..], &data[8..16]);
    }

    #[test]
    fn write_failure_reports_inconsistent_range_and_stops() {
        let target = target(16);
        let mut device = lsa_device();
        device.push_ok(Vec::new());
        device.push_firmware_status(5);
        // no third response scripted: a third send would panic

        let data = vec![0xaa; 24];
        let err = write_label(&target, &mut device, &data, 0x100).expect_err("chunk 2 fails");
        match err {
            MboxError::LabelsInconsistent { start, end, source } => {
                assert_eq!(start, 0x108);
                assert_eq!(end, 0x100 + 24);
                assert!(matches!(*source, MboxError::Firmware(5)));
            }
            other => panic!("expected LabelsInconsistent, got {other}"),
        }
        assert_eq!(device.sent.len(), 2);
    }

    #[test]
    fn read_failure_is_plain() {
        let target = target(16);
        let mut device = lsa_device();
        device.push_firmware_status(7);

        let mut buf = vec![0u8; 24];
        let err = read_label(&target, &mut device, &mut buf, 0).expect_err("read fails");
        assert!(matches!(err, MboxError::Firmware(7)));
    }

    #[test]
    fn read_reassembles_chunks() {
        let target = target(16);
        let mut device = lsa_device();
        device.push_ok((0..8).collect());
        device.push_ok((8..12).collect());

        let mut buf = vec![0u8; 12];
        read_label(&target, &mut device, &mut buf, 0).expect("read");
        assert_eq!(buf, (0..12).collect::<Vec<u8>>());
    }

    #[test]
    fn zero_sends_zeroed_payloads() {
        let target = target(16);
        let mut device = lsa_device();
        device.push_ok(Vec::new());

        zero_label(&target, &mut device, 6, 0x20).expect("zero");
        assert_eq!(device.sent.len(), 1);
        assert!(
            device.sent[0].input[SET_LSA_HEADER_SIZE..]
                .iter()
                .all(|&b| b == 0)
        );
    }

    #[test]
    fn zero_length_is_a_no_op() {
        let target = target(16);
        let mut device = lsa_device();
        write_label(&target, &mut device, &[], 0).expect("empty write");
        zero_label(&target, &mut device, 0, 0).expect("empty zero");
        assert!(device.sent.is_empty());
    }
}
