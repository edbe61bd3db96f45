// SPDX-License-Identifier: Apache-2.0
// Copyright Cxlkit Authors

//! The per-transaction command state machine.

use tracing::debug;

use crate::payload::{
    CAPACITY_MULTIPLIER, GET_LSA_IN_SIZE, HealthInfo, Identify, PartitionInfo,
    SET_LSA_HEADER_SIZE,
};
use crate::transport::{CommandInfo, SendRequest, Transport};
use crate::{CommandId, MboxError, MboxTarget};

/// Result of the catalog query, cached on the command.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, strum::EnumIs)]
pub enum QueryStatus {
    #[default]
    NotRun,
    Ok,
    Unsupported,
}

/// One mailbox transaction against a memory device.
///
/// Construction performs the query/validate/build phases eagerly, so a
/// successfully constructed command is ready to [`submit`](Command::submit).
/// A command whose id the device does not list never constructs; the
/// failure is [`MboxError::Unsupported`], which callers treat as "device
/// lacks the feature", not as a program error.
#[derive(Debug)]
pub struct Command {
    target: MboxTarget,
    id: CommandId,
    raw_opcode: u16,
    catalog: Vec<CommandInfo>,
    query_status: QueryStatus,
    catalog_idx: usize,
    input: Vec<u8>,
    output: Vec<u8>,
    status: i32,
    out_len: usize,
}

/// When a partition change takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetPartitionMode {
    /// Apply immediately; loses data on the affected capacity.
    Immediate,
    /// Apply at the next device reset.
    NextBoot,
}

impl Command {
    /// Build a command for `id`, querying and validating against the
    /// device's catalog.
    pub fn new_generic(
        target: &MboxTarget,
        transport: &mut dyn Transport,
        id: CommandId,
    ) -> Result<Command, MboxError> {
        let mut cmd = Command {
            target: target.clone(),
            id,
            raw_opcode: 0,
            catalog: Vec::new(),
            query_status: QueryStatus::default(),
            catalog_idx: 0,
            input: Vec::new(),
            output: Vec::new(),
            // Pre-submission marker; decoders only require non-negative.
            status: 1,
            out_len: 0,
        };
        cmd.query(transport)?;
        cmd.validate()?;
        cmd.build();
        Ok(cmd)
    }

    /// Build a raw passthrough command.  Opcode zero is reserved.
    pub fn new_raw(
        target: &MboxTarget,
        transport: &mut dyn Transport,
        opcode: u16,
    ) -> Result<Command, MboxError> {
        if opcode == 0 {
            return Err(MboxError::ReservedOpcode);
        }
        let mut cmd = Command::new_generic(target, transport, CommandId::Raw)?;
        cmd.raw_opcode = opcode;
        Ok(cmd)
    }

    pub fn new_identify(
        target: &MboxTarget,
        transport: &mut dyn Transport,
    ) -> Result<Command, MboxError> {
        Command::new_generic(target, transport, CommandId::Identify)
    }

    pub fn new_health_info(
        target: &MboxTarget,
        transport: &mut dyn Transport,
    ) -> Result<Command, MboxError> {
        Command::new_generic(target, transport, CommandId::GetHealthInfo)
    }

    pub fn new_partition_info(
        target: &MboxTarget,
        transport: &mut dyn Transport,
    ) -> Result<Command, MboxError> {
        Command::new_generic(target, transport, CommandId::GetPartitionInfo)
    }

    /// Build a Set Partition Info command for the given volatile capacity
    /// in bytes.
    pub fn new_set_partition(
        target: &MboxTarget,
        transport: &mut dyn Transport,
        volatile_bytes: u64,
        mode: SetPartitionMode,
    ) -> Result<Command, MboxError> {
        let mut cmd = Command::new_generic(target, transport, CommandId::SetPartitionInfo)?;
        if cmd.input.len() < 9 {
            cmd.set_input_size(9)?;
        }
        let raw = volatile_bytes / CAPACITY_MULTIPLIER;
        cmd.input[..8].copy_from_slice(&raw.to_le_bytes());
        cmd.input[8] = match mode {
            SetPartitionMode::Immediate => 1,
            SetPartitionMode::NextBoot => 0,
        };
        Ok(cmd)
    }

    /// Build a Get LSA command reading `length` bytes at `offset`.
    pub fn new_read_label(
        target: &MboxTarget,
        transport: &mut dyn Transport,
        offset: u32,
        length: u32,
    ) -> Result<Command, MboxError> {
        let mut cmd = Command::new_generic(target, transport, CommandId::GetLsa)?;
        if cmd.input.len() < GET_LSA_IN_SIZE {
            cmd.set_input_size(GET_LSA_IN_SIZE)?;
        }
        cmd.input[..4].copy_from_slice(&offset.to_le_bytes());
        cmd.input[4..8].copy_from_slice(&length.to_le_bytes());
        Ok(cmd)
    }

    /// Build a Set LSA command writing `data` at `offset`.
    pub fn new_write_label(
        target: &MboxTarget,
        transport: &mut dyn Transport,
        data: &[u8],
        offset: u32,
    ) -> Result<Command, MboxError> {
        let mut cmd = Command::new_generic(target, transport, CommandId::SetLsa)?;
        cmd.set_input_size(SET_LSA_HEADER_SIZE + data.len())?;
        cmd.input[..4].copy_from_slice(&offset.to_le_bytes());
        cmd.input[SET_LSA_HEADER_SIZE..].copy_from_slice(data);
        Ok(cmd)
    }

    fn query(&mut self, transport: &mut dyn Transport) -> Result<(), MboxError> {
        match self.query_status {
            QueryStatus::Ok => return Ok(()),
            QueryStatus::Unsupported => return Err(MboxError::Unsupported(self.id)),
            QueryStatus::NotRun => {}
        }

        let total = transport.query_commands(&mut [])?;
        let mut infos = vec![CommandInfo::default(); total as usize];
        let total = transport.query_commands(&mut infos)?;
        infos.truncate(total as usize);
        debug!("{}: supports {} commands", self.target.devname, infos.len());
        self.catalog = infos;
        Ok(())
    }

    fn validate(&mut self) -> Result<(), MboxError> {
        for (idx, info) in self.catalog.iter().enumerate() {
            if info.id != self.id.raw() {
                continue;
            }
            debug!(
                "{}: {}: in: {}, out: {}, flags: {:#08x}",
                self.target.devname, self.id, info.size_in, info.size_out, info.flags
            );
            self.catalog_idx = idx;
            self.query_status = QueryStatus::Ok;
            return Ok(());
        }
        self.query_status = QueryStatus::Unsupported;
        Err(MboxError::Unsupported(self.id))
    }

    fn build(&mut self) {
        let info = self.catalog[self.catalog_idx];
        if info.size_in > 0 {
            #[allow(clippy::cast_sign_loss)]
            {
                self.input = vec![0; info.size_in as usize];
            }
        }
        if info.size_out > 0 {
            #[allow(clippy::cast_sign_loss)]
            {
                self.output = vec![0; info.size_out as usize];
            }
        }
    }

    /// Replace the input buffer with a zeroed one of `size` bytes,
    /// overriding the catalog-declared size.
    pub fn set_input_size(&mut self, size: usize) -> Result<(), MboxError> {
        if size > self.target.payload_max {
            return Err(MboxError::PayloadTooLarge {
                size,
                max: self.target.payload_max,
            });
        }
        self.input = vec![0; size];
        Ok(())
    }

    /// Replace the output buffer with a zeroed one of `size` bytes,
    /// overriding the catalog-declared size.
    pub fn set_output_size(&mut self, size: usize) -> Result<(), MboxError> {
        if size > self.target.payload_max {
            return Err(MboxError::PayloadTooLarge {
                size,
                max: self.target.payload_max,
            });
        }
        self.output = vec![0; size];
        Ok(())
    }

    #[must_use]
    pub fn id(&self) -> CommandId {
        self.id
    }

    #[must_use]
    pub fn input(&self) -> &[u8] {
        &self.input
    }

    pub fn input_mut(&mut self) -> &mut [u8] {
        &mut self.input
    }

    #[must_use]
    pub fn output(&self) -> &[u8] {
        &self.output
    }

    /// Submit the command and record the firmware status and output size.
    ///
    /// The `Ok` return means the ioctl round trip succeeded; the device's
    /// own verdict is [`mbox_status`](Command::mbox_status) and must be
    /// checked before decoding output.
    pub fn submit(&mut self, transport: &mut dyn Transport) -> Result<(), MboxError> {
        match self.query_status {
            QueryStatus::Ok => {}
            QueryStatus::Unsupported => return Err(MboxError::Unsupported(self.id)),
            QueryStatus::NotRun => return Err(MboxError::NotQueried),
        }

        let mut req = SendRequest {
            id: self.id.raw(),
            raw_opcode: self.raw_opcode,
            input: &self.input,
            output: &mut self.output,
            retval: 0,
            out_len: 0,
        };
        debug!(
            "{}: submitting {}: in: {}, out: {}",
            self.target.devname,
            self.id,
            req.input.len(),
            req.output.len()
        );
        transport.send(&mut req)?;
        self.status = req.retval;
        self.out_len = req.out_len;
        debug!(
            "{}: {} completed: status: {}, out: {}",
            self.target.devname, self.id, self.status, self.out_len
        );
        Ok(())
    }

    /// Firmware status of the last submission.  Zero is success; positive
    /// values are device-defined failure codes.
    #[must_use]
    pub fn mbox_status(&self) -> i32 {
        self.status
    }

    /// Bytes of output the device actually produced.
    #[must_use]
    pub fn out_size(&self) -> usize {
        self.out_len
    }

    /// The output payload, after verifying this command carries `id` and
    /// did not fail.
    fn checked_output(&self, id: CommandId) -> Result<&[u8], MboxError> {
        if self.id != id {
            return Err(MboxError::WrongCommand {
                expected: id,
                actual: self.id,
            });
        }
        if self.status < 0 {
            return Err(MboxError::FailedCommand(self.status));
        }
        Ok(&self.output)
    }

    /// Decode the output as an Identify payload.
    pub fn identify(&self) -> Result<Identify<'_>, MboxError> {
        Identify::new(self.checked_output(CommandId::Identify)?)
    }

    /// Decode the output as a Get Health Info payload.
    pub fn health_info(&self) -> Result<HealthInfo<'_>, MboxError> {
        HealthInfo::new(self.checked_output(CommandId::GetHealthInfo)?)
    }

    /// Decode the output as a Get Partition Info payload.
    pub fn partition_info(&self) -> Result<PartitionInfo<'_>, MboxError> {
        PartitionInfo::new(self.checked_output(CommandId::GetPartitionInfo)?)
    }

    /// Copy label data read by a Get LSA command into `buf`.
    ///
    /// `buf` may not be longer than the length the command requested.
    pub fn read_label_payload(&self, buf: &mut [u8]) -> Result<usize, MboxError> {
        let output = self.checked_output(CommandId::GetLsa)?;
        let requested = self.input.get(4..8).map_or(0, |len| {
            u32::from_le_bytes([len[0], len[1], len[2], len[3]]) as usize
        });
        if buf.len() > requested {
            return Err(MboxError::ReadBeyondTransfer {
                requested: buf.len(),
                transferred: requested,
            });
        }
        if output.len() < buf.len() {
            return Err(MboxError::Truncated {
                need: buf.len(),
                have: output.len(),
            });
        }
        buf.copy_from_slice(&output[..buf.len()]);
        Ok(buf.len())
    }
}


#[cfg(test)]
mod test {
    use super::testutil::{FakeDevice, target};
    use super::{Command, SetPartitionMode};
    use crate::payload::Identify;
    use crate::{CommandId, MboxError};

    fn full_catalog() -> FakeDevice {
        FakeDevice::with_catalog(&[
            (CommandId::Identify, 0, 0x43),
            (CommandId::GetHealthInfo, 0, 0x12),
            (CommandId::GetPartitionInfo, 0, 0x20),
        ])
    }

    #[test]
    fn absent_command_is_unsupported_and_never_submitted() {
        let mut device = full_catalog();
        let err = Command::new_generic(&target(4096), &mut device, CommandId::GetLsa)
            .expect_err("GetLsa not in catalog");
        assert!(matches!(err, MboxError::Unsupported(CommandId::GetLsa)));
        // validation failed before build/submit: nothing was sent
        assert!(device.sent.is_empty());
    }

    #[test]
    fn catalog_sizes_shape_the_buffers() {
        let mut device = full_catalog();
        let cmd = Command::new_identify(&target(4096), &mut device).expect("identify");
        assert_eq!(cmd.input().len(), 0);
        assert_eq!(cmd.output().len(), 0x43);
    }

    #[test]
    fn query_runs_two_passes() {
        let mut device = full_catalog();
        let _ = Command::new_identify(&target(4096), &mut device).expect("identify");
        assert_eq!(device.query_calls, 2);
    }

    #[test]
    fn oversized_override_is_rejected() {
        let mut device = full_catalog();
        let mut cmd = Command::new_identify(&target(64), &mut device).expect("identify");
        let err = cmd.set_output_size(65).expect_err("over payload_max");
        assert!(matches!(
            err,
            MboxError::PayloadTooLarge { size: 65, max: 64 }
        ));
    }

    #[test]
    fn submit_records_firmware_status() {
        let mut device = full_catalog();
        let mut cmd = Command::new_identify(&target(4096), &mut device).expect("identify");
        device.push_firmware_status(3);
        cmd.submit(&mut device).expect("ioctl ok");
        assert_eq!(cmd.mbox_status(), 3);
    }

    #[test]
    fn identify_decodes_after_successful_submit() {
        let mut device = full_catalog();
        let mut cmd = Command::new_identify(&target(4096), &mut device).expect("identify");

        let mut image = vec![0u8; Identify::SIZE];
        image[..5].copy_from_slice(b"fw1.0");
        image[0x10..0x18].copy_from_slice(&4u64.to_le_bytes());
        device.push_ok(image);

        cmd.submit(&mut device).expect("submit");
        let id = cmd.identify().expect("decode");
        assert_eq!(id.fw_revision(), "fw1.0");
        assert_eq!(id.total_capacity(), 1 << 30);
    }

    #[test]
    fn decoder_rejects_wrong_command() {
        let mut device = full_catalog();
        let cmd = Command::new_health_info(&target(4096), &mut device).expect("health");
        let err = cmd.identify().expect_err("not an identify");
        assert!(matches!(err, MboxError::WrongCommand { .. }));
    }

    #[test]
    fn raw_opcode_zero_is_reserved() {
        let mut device = FakeDevice::with_catalog(&[(CommandId::Raw, 0, 0)]);
        let err = Command::new_raw(&target(4096), &mut device, 0).expect_err("reserved");
        assert!(matches!(err, MboxError::ReservedOpcode));
    }

    #[test]
    fn set_partition_encodes_raw_units_and_mode() {
        let mut device = FakeDevice::with_catalog(&[(CommandId::SetPartitionInfo, 9, 0)]);
        let cmd = Command::new_set_partition(
            &target(4096),
            &mut device,
            1 << 30,
            SetPartitionMode::Immediate,
        )
        .expect("set partition");
        assert_eq!(&cmd.input()[..8], &4u64.to_le_bytes());
        assert_eq!(cmd.input()[8], 1);
    }

    #[test]
    fn read_label_encodes_window() {
        let mut device = FakeDevice::with_catalog(&[(CommandId::GetLsa, 8, 0)]);
        let cmd = Command::new_read_label(&target(4096), &mut device, 0x100, 0x40).expect("read");
        assert_eq!(&cmd.input()[..4], &0x100u32.to_le_bytes());
        assert_eq!(&cmd.input()[4..8], &0x40u32.to_le_bytes());
    }
}
