// SPDX-License-Identifier: Apache-2.0
// Copyright Cxlkit Authors

//! [`AttrStore`] backed by the live `/sys` and `/dev` filesystems.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use nix::sys::stat::{SFlag, lstat, major, minor, stat};

use crate::{AttrStore, SysfsError};

/// The real attribute store.
///
/// Stateless; every call maps to the corresponding filesystem operation.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysStore;

impl SysStore {
    #[must_use]
    pub fn new() -> Self {
        SysStore
    }
}

impl AttrStore for SysStore {
    fn read_attr(&self, path: &Path) -> Result<String, SysfsError> {
        match fs::read_to_string(path) {
            Ok(mut text) => {
                if text.ends_with('\n') {
                    text.pop();
                }
                Ok(text)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(SysfsError::NotFound {
                path: path.to_path_buf(),
            }),
            Err(e) => Err(SysfsError::Read {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    fn write_attr(&mut self, path: &Path, value: &str) -> Result<(), SysfsError> {
        fs::write(path, value).map_err(|e| SysfsError::Write {
            path: path.to_path_buf(),
            value: value.to_string(),
            source: e,
        })
    }

    fn resolve_link(&self, path: &Path) -> Option<PathBuf> {
        fs::canonicalize(path).ok()
    }

    fn is_link(&self, path: &Path) -> bool {
        lstat(path)
            .map(|st| SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT == SFlag::S_IFLNK)
            .unwrap_or(false)
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<String>, SysfsError> {
        let entries = fs::read_dir(path).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                SysfsError::NotFound {
                    path: path.to_path_buf(),
                }
            } else {
                SysfsError::Read {
                    path: path.to_path_buf(),
                    source: e,
                }
            }
        })?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| SysfsError::Read {
                path: path.to_path_buf(),
                source: e,
            })?;
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        Ok(names)
    }

    fn char_device(&self, path: &Path) -> Option<(u64, u64)> {
        let st = stat(path).ok()?;
        if SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT != SFlag::S_IFCHR {
            return None;
        }
        Some((major(st.st_rdev), minor(st.st_rdev)))
    }
}
