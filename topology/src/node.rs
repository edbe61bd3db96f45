// SPDX-License-Identifier: Apache-2.0
// Copyright Cxlkit Authors

//! The typed nodes of the topology graph.
//!
//! All nodes are owned by the [`Context`](crate::Context) arenas; the
//! types here are data plus read-only accessors.  Discovery and traversal
//! live on the context.

use std::path::{Path, PathBuf};

use mbox::MboxTarget;
use sysfs::devname;

use crate::{MemdevKey, PortKey};

/// What a port is, plus the variant-specific state it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumIs)]
pub enum PortVariant {
    /// The root of a fabric topology; the port doubles as the bus.
    Root,
    /// An intermediate switch port.
    Switch,
    /// A leaf port terminating at a memory device.
    Endpoint { memdev: Option<MemdevKey> },
}

/// A fabric node: a bus root, a switch, or an endpoint.
///
/// Child collections are populated at most once per validity epoch; the
/// per-collection `*_scanned` flags gate the scan, and bus invalidation
/// resets them together with the nodes themselves.
#[derive(Debug)]
pub struct Port {
    pub(crate) key: PortKey,
    pub(crate) id: u32,
    pub(crate) variant: PortVariant,
    pub(crate) parent: Option<PortKey>,
    pub(crate) dev_path: PathBuf,
    pub(crate) host_path: PathBuf,
    pub(crate) module: Option<String>,
    pub(crate) bus: Option<PortKey>,
    pub(crate) children: Vec<PortKey>,
    pub(crate) children_scanned: bool,
    pub(crate) endpoints: Vec<PortKey>,
    pub(crate) endpoints_scanned: bool,
    pub(crate) dports: Vec<Dport>,
    pub(crate) dports_scanned: bool,
    pub(crate) decoders: Vec<Decoder>,
    pub(crate) decoders_scanned: bool,
}

impl Port {
    #[must_use]
    pub fn key(&self) -> PortKey {
        self.key
    }

    /// The port's sysfs id: the `N` of `portN`, `endpointN`, or `rootN`.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn variant(&self) -> PortVariant {
        self.variant
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.variant.is_root()
    }

    #[must_use]
    pub fn is_switch(&self) -> bool {
        self.variant.is_switch()
    }

    #[must_use]
    pub fn is_endpoint(&self) -> bool {
        self.variant.is_endpoint()
    }

    /// The memory device bound to this endpoint, if resolved.  Always
    /// `None` for root and switch ports.
    #[must_use]
    pub fn endpoint_memdev(&self) -> Option<MemdevKey> {
        match self.variant {
            PortVariant::Endpoint { memdev } => memdev,
            PortVariant::Root | PortVariant::Switch => None,
        }
    }

    #[must_use]
    pub fn parent(&self) -> Option<PortKey> {
        self.parent
    }

    #[must_use]
    pub fn dev_path(&self) -> &Path {
        &self.dev_path
    }

    #[must_use]
    pub fn devname(&self) -> &str {
        devname(&self.dev_path)
    }

    /// Basename of the resolved `uport` link: the upstream device this
    /// port attaches to.
    #[must_use]
    pub fn host(&self) -> &str {
        devname(&self.host_path)
    }

    /// Module name resolved from the port's `modalias`, if any.
    #[must_use]
    pub fn module(&self) -> Option<&str> {
        self.module.as_deref()
    }
}

/// A downstream connection point of a port.
#[derive(Debug, Clone)]
pub struct Dport {
    pub(crate) id: u32,
    pub(crate) dev_path: PathBuf,
    pub(crate) phys_path: Option<PathBuf>,
}

impl Dport {
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn devname(&self) -> &str {
        devname(&self.dev_path)
    }

    /// Basename of the physical node behind the dport, when the kernel
    /// exposes one.
    #[must_use]
    pub fn physical_node(&self) -> Option<&str> {
        self.phys_path.as_deref().map(devname)
    }

    /// Whether this dport lies on the path to `memdev`.
    ///
    /// Matches by substring containment of the paths, as the kernel tools
    /// do; see DESIGN.md for the compatibility note.
    #[must_use]
    pub fn maps_memdev(&self, memdev: &Memdev) -> bool {
        let host = memdev.host_path.to_string_lossy();
        match &self.phys_path {
            Some(phys) => host.contains(&*phys.to_string_lossy()),
            None => host.contains(&*self.dev_path.to_string_lossy()),
        }
    }
}

/// Classification of what a decoder routes to.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum TargetType {
    #[default]
    Unknown,
    Expander,
    Accelerator,
}

/// An address-range decoder owned by a port.
#[derive(Debug)]
pub struct Decoder {
    pub(crate) id: u32,
    pub(crate) dev_path: PathBuf,
    pub(crate) start: u64,
    pub(crate) size: u64,
    pub(crate) pmem_capable: bool,
    pub(crate) volatile_capable: bool,
    pub(crate) mem_capable: bool,
    pub(crate) accelmem_capable: bool,
    pub(crate) locked: bool,
    pub(crate) target_type: TargetType,
    pub(crate) targets: Vec<Target>,
}

impl Decoder {
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn devname(&self) -> &str {
        devname(&self.dev_path)
    }

    /// Start of the decoded address range; `u64::MAX` when the kernel does
    /// not publish one.
    #[must_use]
    pub fn resource(&self) -> u64 {
        self.start
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn is_pmem_capable(&self) -> bool {
        self.pmem_capable
    }

    #[must_use]
    pub fn is_volatile_capable(&self) -> bool {
        self.volatile_capable
    }

    #[must_use]
    pub fn is_mem_capable(&self) -> bool {
        self.mem_capable
    }

    #[must_use]
    pub fn is_accelmem_capable(&self) -> bool {
        self.accelmem_capable
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    #[must_use]
    pub fn target_type(&self) -> TargetType {
        self.target_type
    }

    /// Targets committed during discovery, in routing-table order.
    #[must_use]
    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    #[must_use]
    pub fn nr_targets(&self) -> usize {
        self.targets.len()
    }

    /// The target slot that routes to `memdev`, if any.
    #[must_use]
    pub fn target_by_memdev(&self, memdev: &Memdev) -> Option<&Target> {
        self.targets.iter().find(|t| t.maps_memdev(memdev))
    }

    #[must_use]
    pub fn target_by_position(&self, position: usize) -> Option<&Target> {
        self.targets.iter().find(|t| t.position == position)
    }
}

/// One slot of a decoder's routing table, mapping to a dport.
#[derive(Debug, Clone)]
pub struct Target {
    pub(crate) id: u32,
    pub(crate) position: usize,
    pub(crate) dev_path: PathBuf,
    pub(crate) phys_path: Option<PathBuf>,
}

impl Target {
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn position(&self) -> usize {
        self.position
    }

    #[must_use]
    pub fn devname(&self) -> &str {
        devname(&self.dev_path)
    }

    #[must_use]
    pub fn physical_node(&self) -> Option<&str> {
        self.phys_path.as_deref().map(devname)
    }

    /// Whether this slot routes to `memdev`; same matching rule as
    /// [`Dport::maps_memdev`].
    #[must_use]
    pub fn maps_memdev(&self, memdev: &Memdev) -> bool {
        let host = memdev.host_path.to_string_lossy();
        match &self.phys_path {
            Some(phys) => host.contains(&*phys.to_string_lossy()),
            None => host.contains(&*self.dev_path.to_string_lossy()),
        }
    }
}

/// The persistent-memory bridge child of a memory device.
#[derive(Debug, Clone)]
pub struct Pmem {
    pub(crate) id: u32,
    pub(crate) dev_path: PathBuf,
}

impl Pmem {
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn devname(&self) -> &str {
        devname(&self.dev_path)
    }
}

/// A CXL-attached memory device.
#[derive(Debug)]
pub struct Memdev {
    pub(crate) key: MemdevKey,
    pub(crate) id: u32,
    pub(crate) major: u64,
    pub(crate) minor: u64,
    pub(crate) pmem_size: u64,
    pub(crate) ram_size: u64,
    pub(crate) payload_max: usize,
    pub(crate) lsa_size: u64,
    pub(crate) serial: u64,
    pub(crate) numa_node: i64,
    pub(crate) firmware_version: String,
    pub(crate) dev_path: PathBuf,
    pub(crate) host_path: PathBuf,
    pub(crate) endpoint: Option<PortKey>,
    pub(crate) pmem: Option<Pmem>,
}

impl Memdev {
    #[must_use]
    pub fn key(&self) -> MemdevKey {
        self.key
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn major(&self) -> u64 {
        self.major
    }

    #[must_use]
    pub fn minor(&self) -> u64 {
        self.minor
    }

    /// Persistent capacity in bytes.
    #[must_use]
    pub fn pmem_size(&self) -> u64 {
        self.pmem_size
    }

    /// Volatile capacity in bytes.
    #[must_use]
    pub fn ram_size(&self) -> u64 {
        self.ram_size
    }

    /// Largest mailbox payload the device accepts, in bytes.
    #[must_use]
    pub fn payload_max(&self) -> usize {
        self.payload_max
    }

    /// Label Storage Area size in bytes.
    #[must_use]
    pub fn label_size(&self) -> u64 {
        self.lsa_size
    }

    /// Device serial number; `u64::MAX` when the kernel does not publish
    /// one.
    #[must_use]
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// NUMA node the device memory is local to; `-1` when unknown.
    #[must_use]
    pub fn numa_node(&self) -> i64 {
        self.numa_node
    }

    #[must_use]
    pub fn firmware_version(&self) -> &str {
        &self.firmware_version
    }

    #[must_use]
    pub fn dev_path(&self) -> &Path {
        &self.dev_path
    }

    #[must_use]
    pub fn devname(&self) -> &str {
        devname(&self.dev_path)
    }

    /// Basename of the upstream device hosting this memdev.
    #[must_use]
    pub fn host(&self) -> &str {
        devname(&self.host_path)
    }

    /// The resolved endpoint back-reference, if established.
    #[must_use]
    pub fn endpoint(&self) -> Option<PortKey> {
        self.endpoint
    }

    /// The persistent-memory bridge child, if the device has one.
    #[must_use]
    pub fn pmem(&self) -> Option<&Pmem> {
        self.pmem.as_ref()
    }

    /// The identity the mailbox engine needs to command this device.
    #[must_use]
    pub fn mbox_target(&self) -> MboxTarget {
        MboxTarget {
            devname: self.devname().to_string(),
            major: self.major,
            minor: self.minor,
            payload_max: self.payload_max,
        }
    }
}
