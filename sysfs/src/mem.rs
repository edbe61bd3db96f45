// SPDX-License-Identifier: Apache-2.0
// Copyright Cxlkit Authors

//! In-memory [`AttrStore`] used as a test fixture.
//!
//! `MemStore` holds a synthetic attribute tree and reproduces the kernel
//! behaviors the topology layer observes through the store:
//!
//! - writing a device name to `…/drivers/<drv>/bind` installs that device's
//!   `driver` symlink,
//! - writing to `<device>/driver/unbind` removes it,
//! - writing to a `flush` attribute is accepted and counted.
//!
//! Writes can be selectively denied with [`MemStore::deny_write`] to model a
//! device the kernel refuses to release.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};

use crate::{AttrStore, SysfsError};

#[derive(Debug, Default)]
pub struct MemStore {
    dirs: BTreeSet<PathBuf>,
    attrs: BTreeMap<PathBuf, String>,
    links: BTreeMap<PathBuf, PathBuf>,
    chardevs: BTreeMap<PathBuf, (u64, u64)>,
    denied: BTreeSet<PathBuf>,
    flushes: usize,
}

impl MemStore {
    #[must_use]
    pub fn new() -> Self {
        MemStore::default()
    }

    /// Register a directory, together with all of its ancestors.
    pub fn add_dir(&mut self, path: impl AsRef<Path>) {
        let mut cursor = Some(path.as_ref());
        while let Some(p) = cursor {
            if !p.as_os_str().is_empty() {
                self.dirs.insert(p.to_path_buf());
            }
            cursor = p.parent();
        }
    }

    /// Register an attribute file with its content.
    pub fn add_attr(&mut self, path: impl AsRef<Path>, value: impl Into<String>) {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            self.add_dir(parent);
        }
        self.attrs.insert(path, value.into());
    }

    /// Register a symlink resolving to `target`.
    pub fn add_link(&mut self, path: impl AsRef<Path>, target: impl AsRef<Path>) {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            self.add_dir(parent);
        }
        self.links.insert(path, target.as_ref().to_path_buf());
    }

    /// Register a character-device node.
    pub fn add_chardev(&mut self, path: impl AsRef<Path>, major: u64, minor: u64) {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            self.add_dir(parent);
        }
        self.chardevs.insert(path, (major, minor));
    }

    /// Make writes to `path` fail, leaving the store unchanged.
    pub fn deny_write(&mut self, path: impl AsRef<Path>) {
        self.denied.insert(path.as_ref().to_path_buf());
    }

    /// Number of accepted writes to a `flush` attribute.
    #[must_use]
    pub fn flush_count(&self) -> usize {
        self.flushes
    }

    fn known(&self, path: &Path) -> bool {
        self.dirs.contains(path)
            || self.attrs.contains_key(path)
            || self.links.contains_key(path)
            || self.chardevs.contains_key(path)
    }

    /// The registered directory whose basename is `name`, if any.
    fn dir_by_name(&self, name: &str) -> Option<PathBuf> {
        self.dirs
            .iter()
            .find(|d| d.file_name().is_some_and(|n| n == name))
            .cloned()
    }

    fn write_denied(path: &Path, value: &str) -> SysfsError {
        SysfsError::Write {
            path: path.to_path_buf(),
            value: value.to_string(),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        }
    }

    fn try_bind(&mut self, bind_path: &Path, devname: &str) -> Result<(), SysfsError> {
        let Some(driver_dir) = bind_path.parent() else {
            return Err(Self::write_denied(bind_path, devname));
        };
        let Some(device) = self.dir_by_name(devname) else {
            return Err(Self::write_denied(bind_path, devname));
        };
        let driver_link = device.join("driver");
        if self.links.contains_key(&driver_link) {
            return Err(Self::write_denied(bind_path, devname));
        }
        let target = driver_dir.to_path_buf();
        self.links.insert(driver_link, target);
        Ok(())
    }

    fn try_unbind(&mut self, unbind_path: &Path, devname: &str) -> Result<(), SysfsError> {
        let device = unbind_path
            .parent()
            .and_then(Path::parent)
            .map(Path::to_path_buf);
        let Some(device) = device else {
            return Err(Self::write_denied(unbind_path, devname));
        };
        match self.links.remove(&device.join("driver")) {
            Some(_) => Ok(()),
            None => Err(SysfsError::NotFound {
                path: unbind_path.to_path_buf(),
            }),
        }
    }
}

impl AttrStore for MemStore {
    fn read_attr(&self, path: &Path) -> Result<String, SysfsError> {
        match self.attrs.get(path) {
            Some(value) => Ok(value.trim_end_matches('\n').to_string()),
            None => Err(SysfsError::NotFound {
                path: path.to_path_buf(),
            }),
        }
    }

    fn write_attr(&mut self, path: &Path, value: &str) -> Result<(), SysfsError> {
        if self.denied.contains(path) {
            return Err(Self::write_denied(path, value));
        }

        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let in_drivers_dir = path
            .parent()
            .and_then(Path::parent)
            .and_then(Path::file_name)
            .is_some_and(|n| n == "drivers");

        match name {
            "bind" if in_drivers_dir => self.try_bind(path, value),
            "unbind" if path.parent().and_then(Path::file_name).is_some_and(|n| n == "driver") => {
                self.try_unbind(path, value)
            }
            "flush" => {
                self.flushes += 1;
                self.attrs
                    .insert(path.to_path_buf(), self.flushes.to_string());
                Ok(())
            }
            _ => {
                let Some(parent) = path.parent() else {
                    return Err(Self::write_denied(path, value));
                };
                if !self.dirs.contains(parent) {
                    return Err(SysfsError::NotFound {
                        path: path.to_path_buf(),
                    });
                }
                self.attrs.insert(path.to_path_buf(), value.to_string());
                Ok(())
            }
        }
    }

    fn resolve_link(&self, path: &Path) -> Option<PathBuf> {
        if let Some(target) = self.links.get(path) {
            return Some(target.clone());
        }
        self.known(path).then(|| path.to_path_buf())
    }

    fn is_link(&self, path: &Path) -> bool {
        self.links.contains_key(path)
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<String>, SysfsError> {
        if !self.dirs.contains(path) {
            return Err(SysfsError::NotFound {
                path: path.to_path_buf(),
            });
        }

        let mut names = BTreeSet::new();
        let children = self
            .dirs
            .iter()
            .chain(self.attrs.keys())
            .chain(self.links.keys())
            .chain(self.chardevs.keys());
        for child in children {
            if child.parent() == Some(path) {
                if let Some(name) = child.file_name().and_then(|n| n.to_str()) {
                    names.insert(name.to_string());
                }
            }
        }
        Ok(names.into_iter().collect())
    }

    fn char_device(&self, path: &Path) -> Option<(u64, u64)> {
        self.chardevs.get(path).copied()
    }
}

#[cfg(test)]
mod test {
    use super::MemStore;
    use crate::AttrStore;
    use std::path::Path;

    #[test]
    fn attrs_read_back_without_newline() {
        let mut store = MemStore::new();
        store.add_attr("/sys/bus/cxl/devices/mem0/serial", "0x1234\n");
        let serial = store
            .read_attr(Path::new("/sys/bus/cxl/devices/mem0/serial"))
            .expect("read");
        assert_eq!(serial, "0x1234");
    }

    #[test]
    fn list_dir_merges_entry_kinds() {
        let mut store = MemStore::new();
        store.add_dir("/sys/root0/port1");
        store.add_attr("/sys/root0/modalias", "acpi:ACPI0017");
        store.add_link("/sys/root0/uport", "/sys/devices/ACPI0017:00");
        let names = store.list_dir(Path::new("/sys/root0")).expect("list");
        assert_eq!(names, vec!["modalias", "port1", "uport"]);
    }

    #[test]
    fn flush_writes_are_counted() {
        let mut store = MemStore::new();
        store.add_dir("/sys/bus/cxl");
        store
            .write_attr(Path::new("/sys/bus/cxl/flush"), "1\n")
            .expect("flush");
        assert_eq!(store.flush_count(), 1);
    }

    #[test]
    fn denied_write_fails_and_preserves_state() {
        let mut store = MemStore::new();
        store.add_dir("/sys/bus/cxl/devices/mem0");
        store.add_dir("/sys/bus/cxl/drivers/cxl_mem");
        store.deny_write("/sys/bus/cxl/devices/mem0/driver/unbind");

        store
            .write_attr(Path::new("/sys/bus/cxl/drivers/cxl_mem/bind"), "mem0")
            .expect("bind");
        let err = store
            .write_attr(Path::new("/sys/bus/cxl/devices/mem0/driver/unbind"), "mem0")
            .expect_err("unbind denied");
        assert!(!err.is_not_found());
        assert!(store.is_link(Path::new("/sys/bus/cxl/devices/mem0/driver")));
    }
}
