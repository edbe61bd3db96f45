// SPDX-License-Identifier: Apache-2.0
// Copyright Cxlkit Authors

//! Driver enable/disable and subtree invalidation.
//!
//! A node is enabled when its `driver` attribute is a symlink.  Disabling
//! any non-root node unbinds its driver and then invalidates the owning
//! bus's entire child-port subtree: the kernel does not keep device
//! numbering stable across reconfiguration, so every cached identifier
//! below the bus must be rediscovered rather than trusted.

use std::path::Path;

use sysfs::{bind, unbind};
use tracing::{debug, error};

use crate::{CXL_BUS, CXL_FLUSH, Context, MemdevKey, PortKey, TopologyError};

impl Context {
    /// Whether `port` is currently bound to its driver.
    #[must_use]
    pub fn port_is_enabled(&self, port: PortKey) -> bool {
        self.ports
            .get(&port)
            .is_some_and(|p| self.store.is_link(&p.dev_path.join("driver")))
    }

    /// Whether `memdev` is currently bound to its driver.
    #[must_use]
    pub fn memdev_is_enabled(&self, memdev: MemdevKey) -> bool {
        self.memdevs
            .get(memdev.0 as usize)
            .is_some_and(|m| self.store.is_link(&m.dev_path.join("driver")))
    }

    /// Whether the nvdimm bridge of `memdev`'s pmem child is active.
    #[must_use]
    pub fn nvdimm_bridge_active(&self, memdev: MemdevKey) -> bool {
        self.memdevs
            .get(memdev.0 as usize)
            .and_then(|m| m.pmem.as_ref())
            .is_some_and(|pmem| self.store.is_link(&pmem.dev_path.join("driver")))
    }

    /// Bind `memdev` to its driver.  No-op when already enabled.
    pub fn memdev_enable(&mut self, memdev: MemdevKey) -> Result<(), TopologyError> {
        if self.memdev_is_enabled(memdev) {
            return Ok(());
        }
        let name = self
            .memdev(memdev)
            .ok_or(TopologyError::Stale)?
            .devname()
            .to_string();

        if let Err(e) = bind(self.store.as_mut(), &name, None, CXL_BUS) {
            debug!("{name}: bind request failed: {e}");
        }
        if !self.memdev_is_enabled(memdev) {
            error!("{name}: failed to enable");
            return Err(TopologyError::BindFailed { devname: name });
        }
        debug!("{name}: enabled");
        Ok(())
    }

    /// Unbind `memdev` and invalidate its bus subtree.  No-op when already
    /// disabled.
    pub fn memdev_disable_invalidate(&mut self, memdev: MemdevKey) -> Result<(), TopologyError> {
        if !self.memdev_is_enabled(memdev) {
            return Ok(());
        }
        let name = self
            .memdev(memdev)
            .ok_or(TopologyError::Stale)?
            .devname()
            .to_string();

        let Some(bus) = self.memdev_bus(memdev) else {
            error!("{name}: failed to invalidate");
            return Err(TopologyError::NoBus { devname: name });
        };

        let dev_path = self
            .memdev(memdev)
            .ok_or(TopologyError::Stale)?
            .dev_path
            .clone();
        if let Err(e) = unbind(self.store.as_mut(), &dev_path) {
            debug!("{name}: unbind request failed: {e}");
        }
        if self.memdev_is_enabled(memdev) {
            error!("{name}: failed to disable");
            return Err(TopologyError::DeviceBusy { devname: name });
        }

        self.bus_invalidate(bus);
        debug!("{name}: disabled");
        Ok(())
    }

    /// Bind `port` to its driver.  No-op when already enabled.
    pub fn port_enable(&mut self, port: PortKey) -> Result<(), TopologyError> {
        if self.port_is_enabled(port) {
            return Ok(());
        }
        let (name, module) = {
            let p = self.ports.get(&port).ok_or(TopologyError::Stale)?;
            (p.devname().to_string(), p.module.clone())
        };

        if let Err(e) = bind(self.store.as_mut(), &name, module.as_deref(), CXL_BUS) {
            debug!("{name}: bind request failed: {e}");
        }
        if !self.port_is_enabled(port) {
            error!("{name}: failed to enable");
            return Err(TopologyError::BindFailed { devname: name });
        }
        debug!("{name}: enabled");
        Ok(())
    }

    /// Unbind `port` and invalidate its bus subtree.  No-op when already
    /// disabled.  Root ports are not independently controllable and are
    /// rejected outright.
    pub fn port_disable_invalidate(&mut self, port: PortKey) -> Result<(), TopologyError> {
        let name = {
            let p = self.ports.get(&port).ok_or(TopologyError::Stale)?;
            if p.is_root() {
                let devname = p.devname().to_string();
                error!("{devname}: can not be disabled through this interface");
                return Err(TopologyError::RootPort { devname });
            }
            p.devname().to_string()
        };
        if !self.port_is_enabled(port) {
            return Ok(());
        }

        let Some(bus) = self.port_bus(port) else {
            error!("{name}: failed to invalidate");
            return Err(TopologyError::NoBus { devname: name });
        };

        let dev_path = self
            .ports
            .get(&port)
            .ok_or(TopologyError::Stale)?
            .dev_path
            .clone();
        if let Err(e) = unbind(self.store.as_mut(), &dev_path) {
            debug!("{name}: unbind request failed: {e}");
        }
        if self.port_is_enabled(port) {
            error!("{name}: failed to disable");
            return Err(TopologyError::DeviceBusy { devname: name });
        }

        debug!("{name}: disabled");
        self.bus_invalidate(bus);
        Ok(())
    }

    /// Something happened that makes the state of every port below `bus`
    /// indeterminate: drop them all and start over.
    fn bus_invalidate(&mut self, bus: PortKey) {
        for index in 0..self.memdevs.len() {
            let key = MemdevKey(u32::try_from(index).unwrap_or(u32::MAX));
            if self.memdev_bus(key) == Some(bus)
                && let Some(m) = self.memdevs.get_mut(index)
            {
                m.endpoint = None;
            }
        }

        let children = self
            .ports
            .get(&bus)
            .map(|p| p.children.clone())
            .unwrap_or_default();
        for child in children {
            self.free_subtree(child);
        }
        if let Some(p) = self.ports.get_mut(&bus) {
            p.children.clear();
            p.children_scanned = false;
        }

        if let Err(e) = self.store.write_attr(Path::new(CXL_FLUSH), "1\n") {
            debug!("flush failed: {e}");
        }
    }

    fn free_subtree(&mut self, key: PortKey) {
        let Some(port) = self.ports.remove(&key) else {
            return;
        };
        for child in port.children {
            self.free_subtree(child);
        }
        for endpoint in port.endpoints {
            self.free_subtree(endpoint);
        }
    }
}
