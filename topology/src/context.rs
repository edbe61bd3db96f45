// SPDX-License-Identifier: Apache-2.0
// Copyright Cxlkit Authors

//! The discovery context: arena owner and graph builder.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use sysfs::{AttrStore, ModuleResolver, NullResolver, SysStore, devname, scan_devices};
use tracing::debug;

use crate::node::{Decoder, Dport, Memdev, Pmem, Port, PortVariant, Target, TargetType};
use crate::{CXL_DEV_DIR, CXL_DEVICES, MemdevKey, PortKey, TopologyError};

/// Process-wide root of discovery.
///
/// Owns every discovered node; dropping the context releases the whole
/// graph.  All discovery is lazy and idempotent: each collection is
/// scanned on first access, and a second scan of the same namespace entry
/// returns the node already built for it.
pub struct Context {
    pub(crate) store: Box<dyn AttrStore>,
    pub(crate) resolver: Box<dyn ModuleResolver>,
    pub(crate) ports: BTreeMap<PortKey, Port>,
    pub(crate) memdevs: Vec<Memdev>,
    pub(crate) memdevs_scanned: bool,
    pub(crate) buses: Vec<PortKey>,
    pub(crate) buses_scanned: bool,
    next_port_key: u32,
    userdata: Option<Box<dyn Any + Send>>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("ports", &self.ports.len())
            .field("memdevs", &self.memdevs.len())
            .field("buses", &self.buses.len())
            .finish_non_exhaustive()
    }
}

impl Default for Context {
    fn default() -> Self {
        Context::new()
    }
}

impl Context {
    /// A context over the live `/sys` hierarchy.
    #[must_use]
    pub fn new() -> Context {
        Context::with_store(Box::new(SysStore::new()))
    }

    /// A context over an arbitrary attribute store.
    #[must_use]
    pub fn with_store(store: Box<dyn AttrStore>) -> Context {
        Context {
            store,
            resolver: Box::new(NullResolver),
            ports: BTreeMap::new(),
            memdevs: Vec::new(),
            memdevs_scanned: false,
            buses: Vec::new(),
            buses_scanned: false,
            next_port_key: 0,
            userdata: None,
        }
    }

    /// Replace the modalias-to-module resolver.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Box<dyn ModuleResolver>) -> Context {
        self.resolver = resolver;
        self
    }

    pub fn set_userdata(&mut self, data: Box<dyn Any + Send>) {
        self.userdata = Some(data);
    }

    #[must_use]
    pub fn userdata(&self) -> Option<&(dyn Any + Send)> {
        self.userdata.as_deref()
    }

    pub fn take_userdata(&mut self) -> Option<Box<dyn Any + Send>> {
        self.userdata.take()
    }

    /// The attribute store the context reads through.
    #[must_use]
    pub fn store(&self) -> &dyn AttrStore {
        self.store.as_ref()
    }

    /// Resolve a port handle.  `None` when the handle's subtree has been
    /// invalidated.
    #[must_use]
    pub fn port(&self, key: PortKey) -> Option<&Port> {
        self.ports.get(&key)
    }

    /// Resolve a memory-device handle.
    #[must_use]
    pub fn memdev(&self, key: MemdevKey) -> Option<&Memdev> {
        self.memdevs.get(key.0 as usize)
    }

    fn alloc_port_key(&mut self) -> PortKey {
        let key = PortKey(self.next_port_key);
        self.next_port_key += 1;
        key
    }

    fn required(&self, name: &str, path: &Path) -> Result<String, TopologyError> {
        match self.store.read_attr(path) {
            Ok(text) => Ok(text),
            Err(e) if e.is_not_found() => Err(TopologyError::MissingAttr {
                devname: name.to_string(),
                attr: path.display().to_string(),
            }),
            Err(e) => Err(TopologyError::Sysfs(e)),
        }
    }

    fn required_u64(&self, name: &str, base: &Path, attr: &str) -> Result<u64, TopologyError> {
        self.required(name, &base.join(attr)).map(|t| parse_u64(&t))
    }

    fn optional_u64(&self, base: &Path, attr: &str) -> Option<u64> {
        self.store.read_attr(&base.join(attr)).ok().map(|t| parse_u64(&t))
    }

    fn optional_bool(&self, base: &Path, attr: &str) -> Option<bool> {
        self.optional_u64(base, attr).map(|v| v != 0)
    }

    // ---- memory devices ----

    pub(crate) fn memdevs_scan(&mut self) {
        if self.memdevs_scanned {
            return;
        }
        self.memdevs_scanned = true;

        for (id, path) in scan_devices(self.store.as_ref(), Path::new(CXL_DEVICES), "mem") {
            if self.memdevs.iter().any(|m| m.id == id) {
                continue;
            }
            let key = MemdevKey(u32::try_from(self.memdevs.len()).unwrap_or(u32::MAX));
            match self.memdev_read(key, id, &path) {
                Ok(memdev) => self.memdevs.push(memdev),
                Err(e) => debug!("{}: not added: {e}", devname(&path)),
            }
        }
    }

    fn memdev_read(
        &mut self,
        key: MemdevKey,
        id: u32,
        path: &Path,
    ) -> Result<Memdev, TopologyError> {
        let name = devname(path).to_string();
        debug!("{name}: base: '{}'", path.display());

        let node = Path::new(CXL_DEV_DIR).join(&name);
        let (major, minor) =
            self.store
                .char_device(&node)
                .ok_or_else(|| TopologyError::MissingAttr {
                    devname: name.clone(),
                    attr: node.display().to_string(),
                })?;

        let pmem_size = self.required_u64(&name, path, "pmem/size")?;
        let ram_size = self.required_u64(&name, path, "ram/size")?;
        let payload_max = self.required_u64(&name, path, "payload_max")?;
        let lsa_size = self.required_u64(&name, path, "label_storage_size")?;
        let serial = self.optional_u64(path, "serial").unwrap_or(u64::MAX);
        let numa_node = self
            .store
            .read_attr(&path.join("numa_node"))
            .ok()
            .map_or(-1, |t| parse_i64(&t));
        let firmware_version = self.required(&name, &path.join("firmware_version"))?;

        let canonical =
            self.store
                .resolve_link(path)
                .ok_or_else(|| TopologyError::MissingAttr {
                    devname: name.clone(),
                    attr: path.display().to_string(),
                })?;
        let host_path = canonical
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| TopologyError::MissingAttr {
                devname: name.clone(),
                attr: canonical.display().to_string(),
            })?;

        let pmem = scan_devices(self.store.as_ref(), path, "pmem")
            .into_iter()
            .next()
            .map(|(pmem_id, pmem_path)| {
                debug!("{name}: pmem_base: '{}'", pmem_path.display());
                Pmem {
                    id: pmem_id,
                    dev_path: pmem_path,
                }
            });

        Ok(Memdev {
            key,
            id,
            major,
            minor,
            pmem_size,
            ram_size,
            payload_max: usize::try_from(payload_max).unwrap_or(usize::MAX),
            lsa_size,
            serial,
            numa_node,
            firmware_version,
            dev_path: path.to_path_buf(),
            host_path,
            endpoint: None,
            pmem,
        })
    }

    // ---- ports ----

    fn port_read(
        &mut self,
        id: u32,
        path: &Path,
        parent: Option<PortKey>,
        variant: PortVariant,
    ) -> Result<Port, TopologyError> {
        let name = devname(path).to_string();
        debug!("{name}: base: '{}'", path.display());

        let host_path =
            self.store
                .resolve_link(&path.join("uport"))
                .ok_or_else(|| TopologyError::MissingAttr {
                    devname: name,
                    attr: "uport".to_string(),
                })?;
        let module = self
            .store
            .read_attr(&path.join("modalias"))
            .ok()
            .and_then(|alias| self.resolver.resolve(&alias));

        Ok(Port {
            key: self.alloc_port_key(),
            id,
            variant,
            parent,
            dev_path: path.to_path_buf(),
            host_path,
            module,
            bus: None,
            children: Vec::new(),
            children_scanned: false,
            endpoints: Vec::new(),
            endpoints_scanned: false,
            dports: Vec::new(),
            dports_scanned: false,
            decoders: Vec::new(),
            decoders_scanned: false,
        })
    }

    pub(crate) fn buses_scan(&mut self) {
        if self.buses_scanned {
            return;
        }
        self.buses_scanned = true;

        for (id, path) in scan_devices(self.store.as_ref(), Path::new(CXL_DEVICES), "root") {
            let duplicate = self
                .buses
                .iter()
                .any(|key| self.ports.get(key).is_some_and(|p| p.id == id));
            if duplicate {
                continue;
            }
            match self.port_read(id, &path, None, PortVariant::Root) {
                Ok(port) => {
                    let key = port.key;
                    self.ports.insert(key, port);
                    self.buses.push(key);
                }
                Err(e) => debug!("{}: not added: {e}", devname(&path)),
            }
        }
    }

    pub(crate) fn ports_scan(&mut self, parent: PortKey) {
        let Some(port) = self.ports.get(&parent) else {
            return;
        };
        if port.children_scanned {
            return;
        }
        let base = port.dev_path.clone();
        if let Some(port) = self.ports.get_mut(&parent) {
            port.children_scanned = true;
        }

        for (id, path) in scan_devices(self.store.as_ref(), &base, "port") {
            if self.child_id_known(parent, id, |p| &p.children) {
                continue;
            }
            match self.port_read(id, &path, Some(parent), PortVariant::Switch) {
                Ok(port) => {
                    let key = port.key;
                    self.ports.insert(key, port);
                    if let Some(p) = self.ports.get_mut(&parent) {
                        p.children.push(key);
                    }
                }
                Err(e) => debug!("{}: not added: {e}", devname(&path)),
            }
        }
    }

    pub(crate) fn endpoints_scan(&mut self, parent: PortKey) {
        let Some(port) = self.ports.get(&parent) else {
            return;
        };
        if port.endpoints_scanned {
            return;
        }
        let base = port.dev_path.clone();
        if let Some(port) = self.ports.get_mut(&parent) {
            port.endpoints_scanned = true;
        }

        for (id, path) in scan_devices(self.store.as_ref(), &base, "endpoint") {
            if self.child_id_known(parent, id, |p| &p.endpoints) {
                continue;
            }
            let variant = PortVariant::Endpoint { memdev: None };
            match self.port_read(id, &path, Some(parent), variant) {
                Ok(port) => {
                    let key = port.key;
                    self.ports.insert(key, port);
                    if let Some(p) = self.ports.get_mut(&parent) {
                        p.endpoints.push(key);
                    }
                }
                Err(e) => debug!("{}: not added: {e}", devname(&path)),
            }
        }
    }

    fn child_id_known(
        &self,
        parent: PortKey,
        id: u32,
        collection: impl Fn(&Port) -> &Vec<PortKey>,
    ) -> bool {
        self.ports.get(&parent).is_some_and(|p| {
            collection(p)
                .iter()
                .any(|key| self.ports.get(key).is_some_and(|c| c.id == id))
        })
    }

    // ---- dports ----

    pub(crate) fn dports_scan(&mut self, parent: PortKey) {
        let Some(port) = self.ports.get(&parent) else {
            return;
        };
        if port.dports_scanned {
            return;
        }
        let base = port.dev_path.clone();
        if let Some(port) = self.ports.get_mut(&parent) {
            port.dports_scanned = true;
        }

        for (id, path) in scan_devices(self.store.as_ref(), &base, "dport") {
            let known = self
                .ports
                .get(&parent)
                .is_some_and(|p| p.dports.iter().any(|d| d.id == id));
            if known {
                continue;
            }
            let name = devname(&path).to_string();
            debug!("{name}: base: '{}'", path.display());
            let Some(dev_path) = self.store.resolve_link(&path) else {
                debug!("{name}: not added: dangling device link");
                continue;
            };
            let phys_path = self.store.resolve_link(&path.join("physical_node"));
            if let Some(p) = self.ports.get_mut(&parent) {
                p.dports.push(Dport {
                    id,
                    dev_path,
                    phys_path,
                });
            }
        }
    }

    // ---- decoders ----

    pub(crate) fn decoders_scan(&mut self, parent: PortKey) {
        let Some(port) = self.ports.get(&parent) else {
            return;
        };
        if port.decoders_scanned {
            return;
        }
        let base = port.dev_path.clone();
        let variant = port.variant;
        let prefix = format!("decoder{}.", port.id);
        if let Some(port) = self.ports.get_mut(&parent) {
            port.decoders_scanned = true;
        }

        for (id, path) in scan_devices(self.store.as_ref(), &base, &prefix) {
            let known = self
                .ports
                .get(&parent)
                .is_some_and(|p| p.decoders.iter().any(|d| d.id == id));
            if known {
                continue;
            }
            let decoder = self.decoder_read(id, &path, variant, &base);
            if let Some(p) = self.ports.get_mut(&parent) {
                p.decoders.push(decoder);
            }
        }
    }

    fn decoder_read(
        &self,
        id: u32,
        path: &Path,
        port_variant: PortVariant,
        port_path: &Path,
    ) -> Decoder {
        let name = devname(path).to_string();
        debug!("{name}: base: '{}'", path.display());

        let mut decoder = Decoder {
            id,
            dev_path: path.to_path_buf(),
            start: self.optional_u64(path, "start").unwrap_or(u64::MAX),
            size: self.optional_u64(path, "size").unwrap_or(u64::MAX),
            pmem_capable: false,
            volatile_capable: false,
            mem_capable: false,
            accelmem_capable: false,
            locked: false,
            target_type: TargetType::Unknown,
            targets: Vec::new(),
        };

        match port_variant {
            PortVariant::Switch | PortVariant::Endpoint { .. } => {
                decoder.pmem_capable = true;
                decoder.volatile_capable = true;
                decoder.mem_capable = true;
                decoder.accelmem_capable = true;
                if let Some(locked) = self.optional_bool(path, "locked") {
                    decoder.locked = locked;
                }
                match self.store.read_attr(&path.join("target_type")).ok().as_deref() {
                    Some("accelerator") => decoder.target_type = TargetType::Accelerator,
                    Some("expander") => decoder.target_type = TargetType::Expander,
                    _ => {}
                }
            }
            PortVariant::Root => {
                let flags: [(&str, &mut bool); 5] = [
                    ("cap_type2", &mut decoder.accelmem_capable),
                    ("cap_type3", &mut decoder.mem_capable),
                    ("cap_ram", &mut decoder.volatile_capable),
                    ("cap_pmem", &mut decoder.pmem_capable),
                    ("locked", &mut decoder.locked),
                ];
                for (attr, flag) in flags {
                    if let Some(value) = self.optional_bool(path, attr) {
                        *flag = value;
                    }
                }
            }
        }

        decoder.targets = self.targets_read(&name, path, port_path);
        decoder
    }

    fn targets_read(&self, name: &str, path: &Path, port_path: &Path) -> Vec<Target> {
        let list = self
            .store
            .read_attr(&path.join("target_list"))
            .unwrap_or_default();
        let list = list.trim();

        let mut targets = Vec::new();
        if list.is_empty() {
            return targets;
        }
        for (position, token) in list.split(',').enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let id = parse_u64(token.trim()) as u32;
            let link = port_path.join(format!("dport{id}"));
            let Some(dev_path) = self.store.resolve_link(&link) else {
                tracing::error!("{name}: failed to parse target{position}");
                break;
            };
            let phys_path = self.store.resolve_link(&link.join("physical_node"));
            debug!(
                "{name}: target{position} {} phys_path: {}",
                dev_path.display(),
                phys_path
                    .as_deref()
                    .map_or_else(|| "none".to_string(), |p| p.display().to_string())
            );
            targets.push(Target {
                id,
                position,
                dev_path,
                phys_path,
            });
        }
        targets
    }
}

/// Parse the numeric formats sysfs uses: decimal or 0x-prefixed hex.
/// Unparseable text reads as zero, matching `strtoull` semantics.
pub(crate) fn parse_u64(text: &str) -> u64 {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).unwrap_or(0)
    } else {
        text.parse().unwrap_or(0)
    }
}

pub(crate) fn parse_i64(text: &str) -> i64 {
    text.trim().parse().unwrap_or(0)
}

#[cfg(test)]
mod test {
    use crate::fixture::fabric;
    use crate::{Context, TargetType};
    use pretty_assertions::assert_eq;

    #[test]
    fn memdev_attributes_are_parsed() {
        let mut ctx = Context::with_store(Box::new(fabric()));
        let memdevs = ctx.memdevs();
        assert_eq!(memdevs.len(), 1);

        let memdev = ctx.memdev(memdevs[0]).expect("mem0");
        assert_eq!(memdev.id(), 0);
        assert_eq!(memdev.devname(), "mem0");
        assert_eq!((memdev.major(), memdev.minor()), (240, 0));
        assert_eq!(memdev.pmem_size(), 536_870_912);
        assert_eq!(memdev.ram_size(), 268_435_456);
        assert_eq!(memdev.payload_max(), 4096);
        assert_eq!(memdev.label_size(), 262_144);
        assert_eq!(memdev.serial(), 0xdead_beef);
        assert_eq!(memdev.numa_node(), 0);
        assert_eq!(memdev.firmware_version(), "fw-1.2.3");
        assert_eq!(memdev.host(), "0000:34:00.0");
    }

    #[test]
    fn absent_serial_and_numa_fall_back_to_sentinels() {
        let mut store = fabric();
        crate::fixture::add_memdev(&mut store, 1, &[]);
        let mut ctx = Context::with_store(Box::new(store));

        let memdevs = ctx.memdevs();
        let mem1 = memdevs
            .iter()
            .map(|&k| ctx.memdev(k).expect("memdev"))
            .find(|m| m.id() == 1)
            .expect("mem1");
        assert_eq!(mem1.serial(), u64::MAX);
        assert_eq!(mem1.numa_node(), -1);
    }

    #[test]
    fn broken_memdev_does_not_abort_siblings() {
        let mut store = fabric();
        // mem1 lacks firmware_version, a required attribute
        crate::fixture::add_memdev(&mut store, 1, &["firmware_version"]);
        let mut ctx = Context::with_store(Box::new(store));

        let ids: Vec<u32> = ctx
            .memdevs()
            .iter()
            .map(|&k| ctx.memdev(k).expect("memdev").id())
            .collect();
        assert_eq!(ids, vec![0]);
    }

    #[test]
    fn memdev_without_device_node_is_skipped() {
        let mut store = fabric();
        crate::fixture::add_memdev_without_node(&mut store, 2);
        let mut ctx = Context::with_store(Box::new(store));
        assert_eq!(ctx.memdevs().len(), 1);
    }

    #[test]
    fn pmem_child_is_discovered() {
        let mut ctx = Context::with_store(Box::new(fabric()));
        let memdevs = ctx.memdevs();
        let memdev = ctx.memdev(memdevs[0]).expect("mem0");
        let pmem = memdev.pmem().expect("pmem child");
        assert_eq!(pmem.id(), 0);
        assert_eq!(pmem.devname(), "pmem0");
    }

    #[test]
    fn discovery_is_idempotent() {
        let mut ctx = Context::with_store(Box::new(fabric()));
        let first = ctx.memdevs();
        let second = ctx.memdevs();
        assert_eq!(first, second);

        let buses = ctx.buses();
        assert_eq!(buses.len(), 1);
        let once = ctx.child_ports(buses[0]);
        let twice = ctx.child_ports(buses[0]);
        assert_eq!(once, twice);
        assert!(!once.is_empty());
    }

    #[test]
    fn root_decoder_reads_capability_attrs() {
        let mut ctx = Context::with_store(Box::new(fabric()));
        let buses = ctx.buses();
        let decoders = ctx.decoders(buses[0]);
        assert_eq!(decoders.len(), 1);

        let decoder = &decoders[0];
        assert_eq!(decoder.id(), 0);
        assert_eq!(decoder.devname(), "decoder0.0");
        assert!(decoder.is_pmem_capable());
        assert!(!decoder.is_volatile_capable());
        assert!(decoder.is_mem_capable());
        assert!(!decoder.is_accelmem_capable());
        assert!(decoder.is_locked());
        assert_eq!(decoder.resource(), 0x1000_0000);
        assert_eq!(decoder.size(), 0x4000_0000);
    }

    #[test]
    fn switch_decoder_defaults_all_capabilities() {
        // port1's decoder has no locked or capability attrs at all
        let mut ctx = Context::with_store(Box::new(fabric()));
        let buses = ctx.buses();
        let ports = ctx.child_ports(buses[0]);
        let decoders = ctx.decoders(ports[0]);
        assert_eq!(decoders.len(), 1);

        let decoder = &decoders[0];
        assert!(decoder.is_pmem_capable());
        assert!(decoder.is_volatile_capable());
        assert!(decoder.is_mem_capable());
        assert!(decoder.is_accelmem_capable());
        assert!(!decoder.is_locked());
        assert_eq!(decoder.target_type(), TargetType::Unknown);
    }

    #[test]
    fn endpoint_decoder_reads_target_type() {
        let mut ctx = Context::with_store(Box::new(fabric()));
        let buses = ctx.buses();
        let ports = ctx.child_ports(buses[0]);
        let endpoints = ctx.endpoints(ports[0]);
        let decoders = ctx.decoders(endpoints[0]);
        assert_eq!(decoders[0].target_type(), TargetType::Expander);
        assert!(decoders[0].is_locked());
    }

    #[test]
    fn broken_target_link_stops_parsing_but_keeps_committed_targets() {
        let mut store = fabric();
        // decoder1.0 routes to dports 0, 1 and 9; dport9 does not resolve
        store.add_attr("/sys/bus/cxl/devices/root0/port1/decoder1.0/target_list", "0,1,9");
        let mut ctx = Context::with_store(Box::new(store));

        let buses = ctx.buses();
        let ports = ctx.child_ports(buses[0]);
        let decoders = ctx.decoders(ports[0]);
        let decoder = &decoders[0];
        assert_eq!(decoder.nr_targets(), 2);
        let ids: Vec<u32> = decoder.targets().iter().map(super::Target::id).collect();
        assert_eq!(ids, vec![0, 1]);
        assert_eq!(decoder.targets()[1].position(), 1);
    }

    #[test]
    fn decoder_prefix_is_scoped_to_the_owning_port() {
        // decoder0.0 lives under root0; port1 must not claim it
        let mut ctx = Context::with_store(Box::new(fabric()));
        let buses = ctx.buses();
        let ports = ctx.child_ports(buses[0]);
        let ids: Vec<u32> = ctx.decoders(ports[0]).iter().map(super::Decoder::id).collect();
        assert_eq!(ids, vec![0]);
        assert_eq!(ctx.decoders(ports[0])[0].devname(), "decoder1.0");
    }

    #[test]
    fn dports_resolve_physical_nodes() {
        let mut ctx = Context::with_store(Box::new(fabric()));
        let buses = ctx.buses();
        let ports = ctx.child_ports(buses[0]);
        let dports = ctx.dports(ports[0]);
        assert_eq!(dports.len(), 2);
        assert_eq!(dports[0].id(), 0);
        assert_eq!(dports[0].physical_node(), Some("0000:34:00.0"));
        assert_eq!(ctx.nr_dports(ports[0]), 2);
    }

    #[test]
    fn parse_accepts_hex_and_decimal() {
        use super::parse_u64;
        assert_eq!(parse_u64("0x10"), 16);
        assert_eq!(parse_u64("16\n"), 16);
        assert_eq!(parse_u64("bogus"), 0);
    }
}
