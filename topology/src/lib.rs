// SPDX-License-Identifier: Apache-2.0
// Copyright Cxlkit Authors

//! CXL fabric topology discovery and management.
//!
//! The kernel exposes the CXL device hierarchy as a tree of attribute
//! directories under `/sys/bus/cxl/devices`: root buses, switch ports,
//! endpoints, downstream ports, address decoders, and memory devices.
//! [`Context`] mirrors that namespace as a typed object graph, built
//! lazily: a node's child collections are scanned on first access and then
//! cached, and rediscovery of an already-known id always returns the
//! existing node.
//!
//! Nodes live in arenas owned by the context and are addressed by
//! [`PortKey`]/[`MemdevKey`] handles.  Keys are never reused, so after a
//! subtree is invalidated (see below) rediscovery observably produces new
//! nodes.  Back-references — a memory device to its endpoint, a port to
//! its bus — are plain keys resolved through the arena, never a second
//! ownership path.
//!
//! Disabling a port or memory device unbinds its kernel driver.  Device
//! numbering below a bus is not stable across such reconfiguration, so a
//! successful disable discards the owning bus's entire child-port subtree
//! and forces rediscovery; see [`Context::port_disable_invalidate`] and
//! [`Context::memdev_disable_invalidate`].
//!
//! The graph reads through the [`sysfs::AttrStore`] trait, so tests drive
//! the whole engine against an in-memory tree.

#![deny(clippy::all, clippy::unwrap_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]

pub mod context;
pub mod labels;
pub mod navigate;
pub mod node;
pub mod state;

pub use context::Context;
pub use navigate::PortWalk;
pub use node::{Decoder, Dport, Memdev, Pmem, Port, PortVariant, Target, TargetType};

/// Base of the device hierarchy.
pub const CXL_DEVICES: &str = "/sys/bus/cxl/devices";
/// Directory holding the memory devices' character nodes.
pub const CXL_DEV_DIR: &str = "/dev/cxl";
/// The bus name used for driver bind/unbind.
pub const CXL_BUS: &str = "cxl";
/// Attribute that asks the kernel to settle pending device updates.
pub const CXL_FLUSH: &str = "/sys/bus/cxl/flush";

/// Handle of a port node (bus root, switch, or endpoint) in a [`Context`].
///
/// Keys are monotonic and never reused; a key for an invalidated node
/// stays dangling forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortKey(pub(crate) u32);

/// Handle of a memory device in a [`Context`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemdevKey(pub(crate) u32);

/// Errors raised by topology operations.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    /// A required attribute was missing while constructing an entity.
    #[error("{devname}: required attribute {attr} missing")]
    MissingAttr { devname: String, attr: String },

    /// The node's handle no longer resolves (its subtree was invalidated).
    #[error("stale node reference")]
    Stale,

    /// The owning bus of a node could not be resolved for invalidation.
    #[error("{devname}: failed to invalidate")]
    NoBus { devname: String },

    /// The node was still enabled after an unbind request.
    #[error("{devname}: failed to disable")]
    DeviceBusy { devname: String },

    /// The node was still disabled after a bind request.
    #[error("{devname}: failed to enable")]
    BindFailed { devname: String },

    /// Root ports are not independently controllable.
    #[error("{devname}: can not be disabled through this interface")]
    RootPort { devname: String },

    /// An attribute-store operation failed.
    #[error(transparent)]
    Sysfs(#[from] sysfs::SysfsError),

    /// A mailbox operation failed.
    #[error(transparent)]
    Mbox(#[from] mbox::MboxError),
}
