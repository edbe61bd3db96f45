// SPDX-License-Identifier: Apache-2.0
// Copyright Cxlkit Authors

//! Read-only traversal over the graph.
//!
//! The only side effect any of these operations has is triggering the
//! at-most-once lazy population of a collection on first access.

use tracing::error;

use crate::node::{Decoder, Dport};
use crate::{Context, MemdevKey, PortKey, PortVariant};

/// Depth-first pre-order walk over the ports strictly below a root.
///
/// All descendants of a child are produced before its next sibling; the
/// walk never ascends past the root it was started from.  A fresh call to
/// [`Context::walk_ports`] restarts from the root.
#[derive(Debug)]
pub struct PortWalk<'a> {
    ctx: &'a mut Context,
    stack: Vec<PortKey>,
}

impl Iterator for PortWalk<'_> {
    type Item = PortKey;

    fn next(&mut self) -> Option<PortKey> {
        let key = self.stack.pop()?;
        let mut children = self.ctx.child_ports(key);
        children.reverse();
        self.stack.extend(children);
        Some(key)
    }
}

impl Context {
    /// The discovered buses (root ports), in discovery order.
    pub fn buses(&mut self) -> Vec<PortKey> {
        self.buses_scan();
        self.buses.clone()
    }

    /// The discovered memory devices, in discovery order.
    pub fn memdevs(&mut self) -> Vec<MemdevKey> {
        self.memdevs_scan();
        (0..self.memdevs.len())
            .map(|i| MemdevKey(u32::try_from(i).unwrap_or(u32::MAX)))
            .collect()
    }

    /// Child switch ports of `port`, in discovery order.
    pub fn child_ports(&mut self, port: PortKey) -> Vec<PortKey> {
        self.ports_scan(port);
        self.ports.get(&port).map_or_else(Vec::new, |p| p.children.clone())
    }

    /// Endpoints attached to `port`, in discovery order.
    pub fn endpoints(&mut self, port: PortKey) -> Vec<PortKey> {
        self.endpoints_scan(port);
        self.ports.get(&port).map_or_else(Vec::new, |p| p.endpoints.clone())
    }

    /// Downstream ports of `port`, in discovery order.
    pub fn dports(&mut self, port: PortKey) -> &[Dport] {
        self.dports_scan(port);
        self.ports.get(&port).map_or(&[], |p| p.dports.as_slice())
    }

    pub fn nr_dports(&mut self, port: PortKey) -> usize {
        self.dports(port).len()
    }

    /// Address decoders owned by `port`, in discovery order.
    pub fn decoders(&mut self, port: PortKey) -> &[Decoder] {
        self.decoders_scan(port);
        self.ports.get(&port).map_or(&[], |p| p.decoders.as_slice())
    }

    /// The decoder with sysfs id `id` under `port`.
    pub fn decoder(&mut self, port: PortKey, id: u32) -> Option<&Decoder> {
        self.decoders(port).iter().find(|d| d.id == id)
    }

    /// Walk the subtree below `root` in depth-first pre-order.
    pub fn walk_ports(&mut self, root: PortKey) -> PortWalk<'_> {
        let mut stack = self.child_ports(root);
        stack.reverse();
        PortWalk { ctx: self, stack }
    }

    /// The bus owning `port`, memoized on first resolution.  `None` while
    /// the port is disabled.
    pub fn port_bus(&mut self, port: PortKey) -> Option<PortKey> {
        if !self.port_is_enabled(port) {
            return None;
        }
        if let Some(bus) = self.ports.get(&port)?.bus {
            return Some(bus);
        }

        let mut cursor = port;
        while let Some(parent) = self.ports.get(&cursor)?.parent {
            cursor = parent;
        }
        let bus = cursor;
        if let Some(p) = self.ports.get_mut(&port) {
            p.bus = Some(bus);
        }
        Some(bus)
    }

    /// The provider name of a bus, with the platform spellings mapped to
    /// their conventional names.
    #[must_use]
    pub fn bus_provider(&self, bus: PortKey) -> Option<&str> {
        let port = self.ports.get(&bus)?;
        Some(match port.host() {
            "ACPI0017:00" => "ACPI.CXL",
            "cxl_acpi.0" => "cxl_test",
            other => other,
        })
    }

    /// The endpoint hosting `memdev`.
    ///
    /// Short-circuits on the cached back-reference, else scans every bus
    /// subtree for an endpoint whose host name matches the device.  A
    /// disabled device is hosted nowhere and resolves to `None`.  Both
    /// back-references are established together on success.
    pub fn memdev_endpoint(&mut self, memdev: MemdevKey) -> Option<PortKey> {
        self.memdevs_scan();
        let cached = self.memdevs.get(memdev.0 as usize)?.endpoint;
        if let Some(endpoint) = cached {
            if self.ports.contains_key(&endpoint) {
                return Some(endpoint);
            }
            // the cached endpoint did not survive an invalidation
            if let Some(m) = self.memdevs.get_mut(memdev.0 as usize) {
                m.endpoint = None;
            }
        }

        if !self.memdev_is_enabled(memdev) {
            return None;
        }
        let want = self.memdevs.get(memdev.0 as usize)?.devname().to_string();

        for bus in self.buses() {
            let ports: Vec<PortKey> = self.walk_ports(bus).collect();
            for port in ports {
                for endpoint in self.endpoints(port) {
                    let Some(ep) = self.ports.get(&endpoint) else {
                        continue;
                    };
                    if ep.host() != want {
                        continue;
                    }
                    self.pair_endpoint(memdev, endpoint);
                    return Some(endpoint);
                }
            }
        }
        None
    }

    /// The memory device hosted by `endpoint`; the inverse of
    /// [`memdev_endpoint`](Context::memdev_endpoint).
    pub fn endpoint_memdev(&mut self, endpoint: PortKey) -> Option<MemdevKey> {
        if let Some(memdev) = self.ports.get(&endpoint)?.endpoint_memdev() {
            return Some(memdev);
        }
        if !self.port_is_enabled(endpoint) {
            return None;
        }

        let host = self.ports.get(&endpoint)?.host().to_string();
        self.memdevs_scan();
        let index = self.memdevs.iter().position(|m| m.devname() == host)?;
        let memdev = MemdevKey(u32::try_from(index).unwrap_or(u32::MAX));
        self.pair_endpoint(memdev, endpoint);
        Some(memdev)
    }

    /// Establish both back-references, logging (but proceeding past) a
    /// conflicting earlier pairing.
    fn pair_endpoint(&mut self, memdev: MemdevKey, endpoint: PortKey) {
        let ep_name = self
            .ports
            .get(&endpoint)
            .map(|p| p.devname().to_string())
            .unwrap_or_default();

        let prior = self
            .ports
            .get(&endpoint)
            .and_then(|ep| ep.endpoint_memdev());
        if let Some(prior) = prior
            && prior != memdev
        {
            let prior_name = self
                .memdev(prior)
                .map_or("", crate::Memdev::devname)
                .to_string();
            let new_name = self
                .memdev(memdev)
                .map_or("", crate::Memdev::devname)
                .to_string();
            error!("{ep_name} assigned to {prior_name} not {new_name}");
        }

        let prior_ep = self.memdevs.get(memdev.0 as usize).and_then(|m| m.endpoint);
        if let Some(prior_ep) = prior_ep
            && prior_ep != endpoint
        {
            let name = self.memdev(memdev).map_or("", crate::Memdev::devname);
            error!("{name} assigned to a different endpoint");
        }

        if let Some(ep) = self.ports.get_mut(&endpoint) {
            ep.variant = PortVariant::Endpoint {
                memdev: Some(memdev),
            };
        }
        if let Some(m) = self.memdevs.get_mut(memdev.0 as usize) {
            m.endpoint = Some(endpoint);
        }
    }

    /// The bus `memdev` currently hangs off, via its endpoint.
    pub fn memdev_bus(&mut self, memdev: MemdevKey) -> Option<PortKey> {
        let endpoint = self.memdev_endpoint(memdev)?;
        self.port_bus(endpoint)
    }

    /// Whether `memdev`'s endpoint lies in the subtree at `port`
    /// (inclusive).
    pub fn port_hosts_memdev(&mut self, port: PortKey, memdev: MemdevKey) -> bool {
        let Some(endpoint) = self.memdev_endpoint(memdev) else {
            return false;
        };
        let mut cursor = Some(endpoint);
        while let Some(key) = cursor {
            if key == port {
                return true;
            }
            cursor = self.ports.get(&key).and_then(|p| p.parent);
        }
        false
    }

    /// The dport of `port` on the path to `memdev`.
    pub fn dport_by_memdev(&mut self, port: PortKey, memdev: MemdevKey) -> Option<&Dport> {
        self.dports_scan(port);
        let device = self.memdevs.get(memdev.0 as usize)?;
        self.ports
            .get(&port)?
            .dports
            .iter()
            .find(|d| d.maps_memdev(device))
    }
}

#[cfg(test)]
mod test {
    use crate::fixture::fabric;
    use crate::{Context, PortKey};
    use pretty_assertions::assert_eq;
    use sysfs::mem::MemStore;

    fn ids(ctx: &Context, keys: &[PortKey]) -> Vec<u32> {
        keys.iter()
            .map(|k| ctx.port(*k).expect("port").id())
            .collect()
    }

    /// root0 -> {port1 -> port2, port3} for order-sensitive walks.
    fn deep_fabric() -> MemStore {
        let mut store = fabric();
        let port1 = "/sys/bus/cxl/devices/root0/port1";
        store.add_dir(format!("{port1}/port2"));
        store.add_link(
            format!("{port1}/port2/uport"),
            "/sys/devices/platform/ACPI0017:00/pci0000:34/0000:34:02.0",
        );
        store.add_dir("/sys/bus/cxl/devices/root0/port3");
        store.add_link(
            "/sys/bus/cxl/devices/root0/port3/uport",
            "/sys/devices/platform/ACPI0017:00/pci0000:35",
        );
        store
    }

    #[test]
    fn walk_is_preorder_and_bounded() {
        let mut ctx = Context::with_store(Box::new(deep_fabric()));
        let buses = ctx.buses();
        let walked: Vec<PortKey> = ctx.walk_ports(buses[0]).collect();
        // port1's subtree (port2) is exhausted before sibling port3
        assert_eq!(ids(&ctx, &walked), vec![1, 2, 3]);
        assert!(!walked.contains(&buses[0]));
    }

    #[test]
    fn walk_of_inner_port_stays_in_its_subtree() {
        let mut ctx = Context::with_store(Box::new(deep_fabric()));
        let buses = ctx.buses();
        let ports = ctx.child_ports(buses[0]);
        let walked: Vec<PortKey> = ctx.walk_ports(ports[0]).collect();
        assert_eq!(ids(&ctx, &walked), vec![2]);
    }

    #[test]
    fn port_bus_walks_to_the_root_and_memoizes() {
        let mut ctx = Context::with_store(Box::new(fabric()));
        let buses = ctx.buses();
        let ports = ctx.child_ports(buses[0]);
        assert_eq!(ctx.port_bus(ports[0]), Some(buses[0]));
        assert_eq!(ctx.port(ports[0]).expect("port").bus, Some(buses[0]));
        assert_eq!(ctx.port_bus(ports[0]), Some(buses[0]));
    }

    #[test]
    fn bus_provider_maps_platform_names() {
        // root0's uport basename is the ACPI0017:00 platform device
        let mut ctx = Context::with_store(Box::new(fabric()));
        let buses = ctx.buses();
        assert_eq!(ctx.bus_provider(buses[0]), Some("ACPI.CXL"));
    }

    #[test]
    fn memdev_and_endpoint_pair_up() {
        let mut ctx = Context::with_store(Box::new(fabric()));
        let memdevs = ctx.memdevs();
        let endpoint = ctx.memdev_endpoint(memdevs[0]).expect("endpoint");
        assert_eq!(ctx.port(endpoint).expect("endpoint").id(), 2);

        // back-references were set together
        assert_eq!(
            ctx.port(endpoint).expect("endpoint").endpoint_memdev(),
            Some(memdevs[0])
        );
        assert_eq!(ctx.memdev(memdevs[0]).expect("mem0").endpoint(), Some(endpoint));

        // and the inverse resolution short-circuits to the same pair
        assert_eq!(ctx.endpoint_memdev(endpoint), Some(memdevs[0]));
    }

    #[test]
    fn endpoint_resolution_from_the_endpoint_side() {
        let mut ctx = Context::with_store(Box::new(fabric()));
        let buses = ctx.buses();
        let ports = ctx.child_ports(buses[0]);
        let endpoints = ctx.endpoints(ports[0]);
        let memdev = ctx.endpoint_memdev(endpoints[0]).expect("memdev");
        assert_eq!(ctx.memdev(memdev).expect("mem0").devname(), "mem0");
    }

    #[test]
    fn disabled_memdev_is_hosted_nowhere() {
        let mut ctx = Context::with_store(Box::new(fabric()));
        let memdevs = ctx.memdevs();
        ctx.memdev_disable_invalidate(memdevs[0]).expect("disable");
        assert_eq!(ctx.memdev_endpoint(memdevs[0]), None);
    }

    #[test]
    fn memdev_bus_resolves_through_the_endpoint() {
        let mut ctx = Context::with_store(Box::new(fabric()));
        let memdevs = ctx.memdevs();
        let buses = ctx.buses();
        assert_eq!(ctx.memdev_bus(memdevs[0]), Some(buses[0]));
    }

    #[test]
    fn port_hosts_memdev_along_the_ancestry() {
        let mut ctx = Context::with_store(Box::new(deep_fabric()));
        let memdevs = ctx.memdevs();
        let buses = ctx.buses();
        let ports = ctx.child_ports(buses[0]);

        assert!(ctx.port_hosts_memdev(ports[0], memdevs[0]));
        assert!(ctx.port_hosts_memdev(buses[0], memdevs[0]));
        // port3 is not on the path
        assert!(!ctx.port_hosts_memdev(ports[1], memdevs[0]));
    }

    #[test]
    fn dport_and_target_resolve_by_memdev() {
        let mut ctx = Context::with_store(Box::new(fabric()));
        let memdevs = ctx.memdevs();
        let buses = ctx.buses();
        let ports = ctx.child_ports(buses[0]);

        let dport = ctx.dport_by_memdev(ports[0], memdevs[0]).expect("dport");
        assert_eq!(dport.id(), 0);

        ctx.decoders_scan(ports[0]);
        let device = ctx.memdev(memdevs[0]).expect("mem0");
        let decoder = &ctx.port(ports[0]).expect("port").decoders[0];
        let target = decoder.target_by_memdev(device).expect("target");
        assert_eq!(target.id(), 0);
        assert_eq!(target.position(), 0);
        assert_eq!(decoder.target_by_position(1).expect("slot 1").id(), 1);
        assert!(decoder.target_by_position(7).is_none());
    }
}
