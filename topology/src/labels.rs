// SPDX-License-Identifier: Apache-2.0
// Copyright Cxlkit Authors

//! Mailbox convenience surface over discovered memory devices.
//!
//! The engine itself lives in the `mbox` crate; these wrappers supply the
//! device identity ([`Memdev::mbox_target`](crate::Memdev::mbox_target))
//! and the production [`CharDev`] transport, so callers holding a
//! [`MemdevKey`] can command the device directly.

use mbox::{CharDev, Command, SetPartitionMode};

use crate::{Context, MemdevKey, TopologyError};

impl Context {
    fn mbox_pair(&self, memdev: MemdevKey) -> Result<(mbox::MboxTarget, CharDev), TopologyError> {
        let target = self
            .memdev(memdev)
            .ok_or(TopologyError::Stale)?
            .mbox_target();
        let transport = CharDev::new(target.clone());
        Ok((target, transport))
    }

    /// Build a command by catalog id against `memdev`.
    pub fn memdev_command(
        &self,
        memdev: MemdevKey,
        id: mbox::CommandId,
    ) -> Result<Command, TopologyError> {
        let (target, mut transport) = self.mbox_pair(memdev)?;
        Ok(Command::new_generic(&target, &mut transport, id)?)
    }

    /// Build a raw passthrough command against `memdev`.
    pub fn memdev_raw_command(
        &self,
        memdev: MemdevKey,
        opcode: u16,
    ) -> Result<Command, TopologyError> {
        let (target, mut transport) = self.mbox_pair(memdev)?;
        Ok(Command::new_raw(&target, &mut transport, opcode)?)
    }

    pub fn memdev_identify_command(&self, memdev: MemdevKey) -> Result<Command, TopologyError> {
        let (target, mut transport) = self.mbox_pair(memdev)?;
        Ok(Command::new_identify(&target, &mut transport)?)
    }

    pub fn memdev_health_command(&self, memdev: MemdevKey) -> Result<Command, TopologyError> {
        let (target, mut transport) = self.mbox_pair(memdev)?;
        Ok(Command::new_health_info(&target, &mut transport)?)
    }

    pub fn memdev_partition_command(&self, memdev: MemdevKey) -> Result<Command, TopologyError> {
        let (target, mut transport) = self.mbox_pair(memdev)?;
        Ok(Command::new_partition_info(&target, &mut transport)?)
    }

    /// Build a partition change to `volatile_bytes` of volatile capacity.
    pub fn memdev_set_partition_command(
        &self,
        memdev: MemdevKey,
        volatile_bytes: u64,
        mode: SetPartitionMode,
    ) -> Result<Command, TopologyError> {
        let (target, mut transport) = self.mbox_pair(memdev)?;
        Ok(Command::new_set_partition(
            &target,
            &mut transport,
            volatile_bytes,
            mode,
        )?)
    }

    /// Build a label read of `length` bytes at `offset`.
    pub fn memdev_read_label_command(
        &self,
        memdev: MemdevKey,
        offset: u32,
        length: u32,
    ) -> Result<Command, TopologyError> {
        let (target, mut transport) = self.mbox_pair(memdev)?;
        Ok(Command::new_read_label(
            &target,
            &mut transport,
            offset,
            length,
        )?)
    }

    /// Build a label write of `data` at `offset`.
    pub fn memdev_write_label_command(
        &self,
        memdev: MemdevKey,
        data: &[u8],
        offset: u32,
    ) -> Result<Command, TopologyError> {
        let (target, mut transport) = self.mbox_pair(memdev)?;
        Ok(Command::new_write_label(
            &target,
            &mut transport,
            data,
            offset,
        )?)
    }

    /// Submit a built command to `memdev`.
    pub fn memdev_submit(
        &self,
        memdev: MemdevKey,
        cmd: &mut Command,
    ) -> Result<(), TopologyError> {
        let (_, mut transport) = self.mbox_pair(memdev)?;
        cmd.submit(&mut transport)?;
        Ok(())
    }

    /// Read the device's label storage into `buf`, chunked to the payload
    /// ceiling.
    pub fn memdev_read_label(
        &self,
        memdev: MemdevKey,
        buf: &mut [u8],
        offset: u32,
    ) -> Result<(), TopologyError> {
        let (target, mut transport) = self.mbox_pair(memdev)?;
        mbox::read_label(&target, &mut transport, buf, offset)?;
        Ok(())
    }

    /// Write `buf` into the device's label storage, chunked to the payload
    /// ceiling.  A partial failure reports the possibly inconsistent byte
    /// range via [`mbox::MboxError::LabelsInconsistent`].
    pub fn memdev_write_label(
        &self,
        memdev: MemdevKey,
        buf: &[u8],
        offset: u32,
    ) -> Result<(), TopologyError> {
        let (target, mut transport) = self.mbox_pair(memdev)?;
        mbox::write_label(&target, &mut transport, buf, offset)?;
        Ok(())
    }

    /// Zero `length` bytes of the device's label storage.
    pub fn memdev_zero_label(
        &self,
        memdev: MemdevKey,
        length: usize,
        offset: u32,
    ) -> Result<(), TopologyError> {
        let (target, mut transport) = self.mbox_pair(memdev)?;
        mbox::zero_label(&target, &mut transport, length, offset)?;
        Ok(())
    }
}
