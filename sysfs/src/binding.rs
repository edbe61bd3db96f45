// SPDX-License-Identifier: Apache-2.0
// Copyright Cxlkit Authors

//! Driver attach/detach through bus `bind`/`unbind` attributes.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{AttrStore, SysfsError, devname};

/// Maps a device `modalias` string to the name of the module that claims it.
///
/// Loading the module is the platform's job (udev, kmod, a static kernel);
/// this crate only carries the name so bind failures can be diagnosed.
pub trait ModuleResolver: std::fmt::Debug {
    fn resolve(&self, modalias: &str) -> Option<String>;
}

/// Resolver that maps nothing.  The right default on systems where the
/// drivers are built in or already loaded.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullResolver;

impl ModuleResolver for NullResolver {
    fn resolve(&self, _modalias: &str) -> Option<String> {
        None
    }
}

/// Bind `devname` to whichever driver on `bus` accepts it.
///
/// Walks `/sys/bus/<bus>/drivers/*/bind` offering the device name to each
/// driver in turn; the first accepting write wins.  `module` is the resolved
/// module name hint for the device, assumed loaded by the platform.
pub fn bind(
    store: &mut dyn AttrStore,
    devname: &str,
    module: Option<&str>,
    bus: &str,
) -> Result<(), SysfsError> {
    if let Some(module) = module {
        debug!("{devname}: expecting module {module} to be loaded");
    }

    let drivers = PathBuf::from(format!("/sys/bus/{bus}/drivers"));
    for name in store.list_dir(&drivers)? {
        if name.starts_with('.') {
            continue;
        }
        let bind_path = drivers.join(&name).join("bind");
        if store.write_attr(&bind_path, devname).is_ok() {
            debug!("{devname}: bound to {name}");
            return Ok(());
        }
    }

    debug!("{devname}: bind failed");
    Err(SysfsError::BindRejected {
        devname: devname.to_string(),
    })
}

/// Detach `devpath` from its current driver.
pub fn unbind(store: &mut dyn AttrStore, devpath: &Path) -> Result<(), SysfsError> {
    let name = devname(devpath).to_string();
    store.write_attr(&devpath.join("driver/unbind"), &name)
}

#[cfg(test)]
mod test {
    use crate::mem::MemStore;
    use crate::{AttrStore, bind, unbind};
    use std::path::Path;

    fn store_with_device() -> MemStore {
        let mut store = MemStore::new();
        store.add_dir("/sys/bus/cxl/drivers/cxl_mem");
        store.add_dir("/sys/bus/cxl/devices/mem0");
        store
    }

    #[test]
    fn bind_installs_driver_link() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let mut store = store_with_device();
        let dev = Path::new("/sys/bus/cxl/devices/mem0");
        assert!(!store.is_link(&dev.join("driver")));

        bind(&mut store, "mem0", None, "cxl").expect("bind");
        assert!(store.is_link(&dev.join("driver")));
    }

    #[test]
    fn unbind_removes_driver_link() {
        let mut store = store_with_device();
        let dev = Path::new("/sys/bus/cxl/devices/mem0");
        bind(&mut store, "mem0", None, "cxl").expect("bind");

        unbind(&mut store, dev).expect("unbind");
        assert!(!store.is_link(&dev.join("driver")));
    }

    #[test]
    fn bind_with_no_drivers_is_rejected() {
        let mut store = MemStore::new();
        store.add_dir("/sys/bus/cxl/devices/mem0");
        assert!(bind(&mut store, "mem0", None, "cxl").is_err());
    }
}
