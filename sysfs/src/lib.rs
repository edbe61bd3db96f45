// SPDX-License-Identifier: Apache-2.0
// Copyright Cxlkit Authors

//! Attribute-store access for kernel device hierarchies.
//!
//! The CXL topology and mailbox layers never touch `/sys` or `/dev`
//! directly; they go through the [`AttrStore`] trait defined here.  The
//! production implementation is [`SysStore`].  With the `mem` feature (or in
//! tests) the crate also provides [`mem::MemStore`], an in-memory tree that
//! simulates the kernel behaviors the higher layers depend on, notably the
//! driver bind/unbind side effects.
//!
//! Beyond the store itself this crate carries the small set of sysfs
//! conventions the discovery engine is built on:
//!
//! - [`scan_devices`]: enumerate `<prefix><N>` entries under a directory,
//!   yielding `(N, path)` pairs in directory order.
//! - [`bind`] / [`unbind`]: attach or detach a kernel driver by writing a
//!   device name into the bus driver's `bind`/`unbind` attributes.
//! - [`ModuleResolver`]: the seam for mapping a `modalias` string to a
//!   loadable module name.  Module insertion itself is the platform's
//!   concern; the default resolver maps nothing.

#![deny(clippy::all, clippy::unwrap_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]

use std::path::{Path, PathBuf};

use tracing::debug;

pub mod binding;
#[cfg(any(test, feature = "mem"))]
pub mod mem;
pub mod sys;

pub use binding::{ModuleResolver, NullResolver, bind, unbind};
pub use sys::SysStore;

/// Errors raised by attribute-store operations.
#[derive(Debug, thiserror::Error)]
pub enum SysfsError {
    /// The attribute, directory, or link does not exist.
    #[error("attribute {path} not found")]
    NotFound { path: PathBuf },

    /// The attribute exists but could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The attribute rejected the written value, or cannot be written.
    #[error("failed to write {value:?} to {path}: {source}")]
    Write {
        path: PathBuf,
        value: String,
        #[source]
        source: std::io::Error,
    },

    /// No driver on the bus accepted a bind request for the device.
    #[error("no driver accepted bind of {devname}")]
    BindRejected { devname: String },
}

impl SysfsError {
    /// True when the error simply means the attribute is absent.
    ///
    /// Discovery treats absent attributes as defaults; any other failure is
    /// fatal to the entity being constructed.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, SysfsError::NotFound { .. })
    }
}

/// Read and mutate a hierarchical attribute namespace.
///
/// Modeled on the sysfs contract: attributes are small text files, device
/// state is expressed through symlinks (a device with a `driver` link is
/// bound), and character-device identity is validated against `/dev`.
pub trait AttrStore: std::fmt::Debug {
    /// Read an attribute as text, with any trailing newline removed.
    fn read_attr(&self, path: &Path) -> Result<String, SysfsError>;

    /// Write a value to an attribute.
    fn write_attr(&mut self, path: &Path, value: &str) -> Result<(), SysfsError>;

    /// Canonicalize `path`, following symlinks.  `None` if the path does not
    /// exist or the link dangles.
    fn resolve_link(&self, path: &Path) -> Option<PathBuf>;

    /// True when `path` itself is a symlink (dangling or not).
    fn is_link(&self, path: &Path) -> bool;

    /// Names of the entries directly under `path`.
    fn list_dir(&self, path: &Path) -> Result<Vec<String>, SysfsError>;

    /// Major/minor of `path` if it is a character-device node.
    fn char_device(&self, path: &Path) -> Option<(u64, u64)>;
}

/// The basename of a device path, e.g. `mem0` for
/// `/sys/bus/cxl/devices/mem0`.
#[must_use]
pub fn devname(path: &Path) -> &str {
    path.file_name().and_then(|n| n.to_str()).unwrap_or("")
}

/// Enumerate `<prefix><N>` entries under `base`.
///
/// Yields `(N, base/<entry>)` pairs in directory order.  Entries whose name
/// does not consist of `prefix` followed by a decimal integer are skipped.
/// A missing `base` yields nothing: an empty collection is how "no such
/// devices" presents to discovery.
#[must_use]
pub fn scan_devices(store: &dyn AttrStore, base: &Path, prefix: &str) -> Vec<(u32, PathBuf)> {
    let names = match store.list_dir(base) {
        Ok(names) => names,
        Err(e) => {
            debug!("no {prefix} devices under {}: {e}", base.display());
            return Vec::new();
        }
    };

    let mut found = Vec::new();
    for name in names {
        let Some(rest) = name.strip_prefix(prefix) else {
            continue;
        };
        let Ok(id) = rest.parse::<u32>() else {
            continue;
        };
        found.push((id, base.join(&name)));
    }
    found
}

#[cfg(test)]
mod test {
    use crate::mem::MemStore;
    use crate::{devname, scan_devices};
    use pretty_assertions::assert_eq;
    use std::path::Path;

    #[test]
    fn devname_is_basename() {
        assert_eq!(devname(Path::new("/sys/bus/cxl/devices/mem0")), "mem0");
        assert_eq!(devname(Path::new("mem3")), "mem3");
    }

    #[test]
    fn scan_matches_prefix_and_integer() {
        let mut store = MemStore::new();
        store.add_dir("/sys/bus/cxl/devices/mem0");
        store.add_dir("/sys/bus/cxl/devices/mem12");
        store.add_dir("/sys/bus/cxl/devices/memx");
        store.add_dir("/sys/bus/cxl/devices/root0");

        let base = Path::new("/sys/bus/cxl/devices");
        let found = scan_devices(&store, base, "mem");
        let ids: Vec<u32> = found.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![0, 12]);
        assert_eq!(found[0].1, base.join("mem0"));
    }

    #[test]
    fn scan_of_missing_base_is_empty() {
        let store = MemStore::new();
        assert!(scan_devices(&store, Path::new("/sys/none"), "mem").is_empty());
    }
}
