// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Assembly of a CXL memory fabric.
//!
//! Host bridges, switches, endpoints and fixed windows are declared by name
//! on a [FabricBuilder], then built once into a [Fabric] which owns typed
//! references to all of them.  The fabric observes decoder commits across
//! every component and keeps direct mappings in step with them.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use slog::Logger;
use tokio::runtime::Handle;

use super::chmu::tracker::TrackerError;
use super::chmu::{Chmu, DecoderGeometry, GeometrySource};
use super::hdm::{CommitChange, CommitObserver, Owner};
use super::passthrough::DirectPassthrough;
use super::topology::*;
use super::type3::{Type3Dev, Type3Params};
use super::window::FixedWindow;
use super::{InterleaveGranularity, MAX_SWITCH_DEPTH, WINDOW_ALIGN};
use crate::common::*;
use crate::intr::MsiNotifier;
use crate::mmio::{self, MmioBus};

/// Errors in the shape of a fabric.  All of them are fatal at init.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unsupported HDM decoder count {0}")]
    DecoderCount(usize),
    #[error("target count {0} exceeds the decoder target list")]
    TargetCount(usize),
    #[error("MSI vector {0} is out of range")]
    MsiVector(u16),
    #[error("hotness tracker unavailable")]
    Tracker(#[from] TrackerError),
    #[error("device {0}: bad memory size {1:#x}")]
    DeviceSize(String, u64),
    #[error("passthrough host bridge {0} must have exactly one port")]
    PassthroughPorts(String),
    #[error("window {index}: bad size {size:#x}")]
    WindowSize { index: usize, size: u64 },
    #[error("window {index}: {count} targets cannot be interleaved")]
    WindowTargets { index: usize, count: usize },
    #[error("window {index}: bad interleave granularity {granularity}")]
    WindowGranularity { index: usize, granularity: u64 },
    #[error("component name {0} is used more than once")]
    DuplicateName(String),
    #[error("no component named {0}")]
    UnknownComponent(String),
    #[error("{0} is not a host bridge")]
    NotHostBridge(String),
    #[error("{0} has no downstream ports")]
    NotAParent(String),
    #[error("{0} cannot sit below a downstream port")]
    NotAttachable(String),
    #[error("{name} declares port {port} more than once")]
    DuplicatePort { name: String, port: u8 },
    #[error("{parent} has no port {port}")]
    UnknownPort { parent: String, port: u8 },
    #[error("port {port} of {parent} is already in use")]
    PortInUse { parent: String, port: u8 },
    #[error("{0} is attached more than once")]
    AttachedTwice(String),
    #[error("switch {0} is nested more than {MAX_SWITCH_DEPTH} level(s) deep")]
    SwitchDepth(String),
    #[error("window {index} does not fit below {max:#x}")]
    Layout { index: usize, max: u64 },
    #[error("window {0} is already placed")]
    AlreadyPlaced(usize),
    #[error("window {0} has not been placed")]
    Unplaced(usize),
    #[error("window {index} could not be mapped")]
    Map {
        index: usize,
        #[source]
        source: mmio::Error,
    },
}

#[derive(Clone, Debug)]
pub struct HostBridgeSpec {
    pub passthrough: bool,
    pub decoder_count: usize,
    /// Numbers of the downstream (root) ports
    pub ports: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct SwitchSpec {
    pub decoder_count: usize,
    /// Numbers of the downstream ports
    pub ports: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct ChmuSpec {
    /// First MSI vector used by the CHMU instances
    pub msi_vector: u16,
    /// External hotness tracker, if any
    pub tracker: Option<SocketAddr>,
}

#[derive(Clone, Debug)]
pub struct Type3Spec {
    pub volatile_size: u64,
    pub persistent_size: u64,
    pub decoder_count: usize,
    pub chmu: Option<ChmuSpec>,
}

#[derive(Clone, Debug)]
pub struct WindowSpec {
    pub size: u64,
    /// Host bridge names, in interleave order
    pub targets: Vec<String>,
    /// Interleave granularity in bytes (256 if unset)
    pub interleave_granularity: Option<u64>,
}

#[derive(Clone, Debug)]
enum NodeSpec {
    HostBridge(HostBridgeSpec),
    Switch(SwitchSpec),
    Type3(Type3Spec),
}
impl NodeSpec {
    fn ports(&self) -> Option<&[u8]> {
        match self {
            NodeSpec::HostBridge(hb) => Some(&hb.ports),
            NodeSpec::Switch(sw) => Some(&sw.ports),
            NodeSpec::Type3(_) => None,
        }
    }
}

#[derive(Clone, Debug)]
struct Link {
    parent: String,
    port: u8,
    child: String,
}

/// Declares the components of a fabric.
///
/// Nothing is validated until [FabricBuilder::build].
#[derive(Clone, Default)]
pub struct FabricBuilder {
    nodes: Vec<(String, NodeSpec)>,
    links: Vec<Link>,
    windows: Vec<WindowSpec>,
}
impl FabricBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host_bridge(mut self, name: &str, spec: HostBridgeSpec) -> Self {
        self.nodes.push((name.to_string(), NodeSpec::HostBridge(spec)));
        self
    }

    pub fn switch(mut self, name: &str, spec: SwitchSpec) -> Self {
        self.nodes.push((name.to_string(), NodeSpec::Switch(spec)));
        self
    }

    pub fn type3(mut self, name: &str, spec: Type3Spec) -> Self {
        self.nodes.push((name.to_string(), NodeSpec::Type3(spec)));
        self
    }

    /// Place `child` below port `port` of `parent`.
    pub fn attach(mut self, parent: &str, port: u8, child: &str) -> Self {
        self.links.push(Link {
            parent: parent.to_string(),
            port,
            child: child.to_string(),
        });
        self
    }

    /// Add a fixed window.  Windows are indexed, and later placed, in the
    /// order they are added.
    pub fn window(mut self, spec: WindowSpec) -> Self {
        self.windows.push(spec);
        self
    }

    /// Validate the declarations and construct every component.
    pub fn build(
        self,
        msi: Arc<dyn MsiNotifier>,
        rt: Handle,
        log: Logger,
    ) -> Result<Arc<Fabric>, ConfigError> {
        let nodes = self.check_nodes()?;
        let parents = self.check_links(&nodes)?;
        let depths = Self::switch_depths(&nodes, &parents)?;

        let dev_log = |name: &str| log.new(slog::o!("dev" => name.to_string()));

        let mut endpoints = Vec::new();
        let mut built: BTreeMap<&str, Attached> = BTreeMap::new();
        for (name, spec) in &self.nodes {
            let NodeSpec::Type3(spec) = spec else {
                continue;
            };
            let id = ComponentId::new();
            let chmu = match spec.chmu.as_ref() {
                Some(c) => Some(Chmu::new(
                    id,
                    c.msi_vector,
                    c.tracker,
                    Arc::clone(&msi),
                    rt.clone(),
                    dev_log(&format!("{name}-chmu")),
                )?),
                None => None,
            };
            let params = Type3Params {
                volatile_size: spec.volatile_size,
                persistent_size: spec.persistent_size,
                decoder_count: spec.decoder_count,
            };
            let ep =
                Arc::new(Type3Dev::new(id, name, params, chmu, dev_log(name))?);
            endpoints.push(Arc::clone(&ep));
            built.insert(name.as_str(), Attached::Type3(ep));
        }

        // deepest switches first, so their children exist
        let mut switch_order: Vec<(&str, &SwitchSpec)> = self
            .nodes
            .iter()
            .filter_map(|(name, spec)| match spec {
                NodeSpec::Switch(sw) => Some((name.as_str(), sw)),
                _ => None,
            })
            .collect();
        switch_order.sort_by_key(|(name, _)| std::cmp::Reverse(depths[name]));
        let mut switches = Vec::new();
        for (name, spec) in switch_order {
            let ports = self.port_set(name, &built);
            let usp = Arc::new(UpstreamSwitchPort::new(
                name,
                spec.decoder_count,
                spec.ports.len(),
                ports,
                dev_log(name),
            )?);
            switches.push(Arc::clone(&usp));
            built.insert(name, Attached::Switch(usp));
        }

        let mut host_bridges: BTreeMap<&str, Arc<HostBridge>> =
            BTreeMap::new();
        let mut hb_order = Vec::new();
        for (name, spec) in &self.nodes {
            let NodeSpec::HostBridge(spec) = spec else {
                continue;
            };
            let ports = self.port_set(name, &built);
            let hb = Arc::new(HostBridge::new(
                name,
                spec.passthrough,
                spec.decoder_count,
                spec.ports.len(),
                ports,
                dev_log(name),
            )?);
            hb_order.push(Arc::clone(&hb));
            host_bridges.insert(name.as_str(), hb);
        }

        let mut windows = Vec::new();
        for (index, spec) in self.windows.iter().enumerate() {
            let targets = spec
                .targets
                .iter()
                .map(|t| {
                    if let Some(hb) = host_bridges.get(t.as_str()) {
                        Ok(Arc::clone(hb))
                    } else if nodes.contains_key(t.as_str()) {
                        Err(ConfigError::NotHostBridge(t.clone()))
                    } else {
                        Err(ConfigError::UnknownComponent(t.clone()))
                    }
                })
                .collect::<Result<Vec<_>, _>>()?;
            let granularity = match spec.interleave_granularity {
                Some(bytes) => InterleaveGranularity::from_bytes(bytes)
                    .ok_or(ConfigError::WindowGranularity {
                        index,
                        granularity: bytes,
                    })?,
                None => InterleaveGranularity::default(),
            };
            let log = log.new(slog::o!("dev" => format!("cfmw{index}")));
            windows.push(Arc::new(FixedWindow::new(
                index,
                spec.size,
                targets,
                granularity,
                log,
            )?));
        }

        let passthrough = DirectPassthrough::new(
            windows.clone(),
            log.new(slog::o!("dev" => "passthrough")),
        );
        let fabric = Arc::new(Fabric {
            host_bridges: hb_order,
            switches,
            endpoints,
            windows,
            passthrough,
            log,
        });

        let weak = Arc::downgrade(&fabric);
        let observer: Weak<dyn CommitObserver> = weak.clone();
        let geometry: Weak<dyn GeometrySource> = weak;
        for hb in fabric.host_bridges.iter() {
            hb.hdm.set_observer(observer.clone());
        }
        for usp in fabric.switches.iter() {
            usp.hdm.set_observer(observer.clone());
        }
        for ep in fabric.endpoints.iter() {
            ep.hdm().set_observer(observer.clone());
            if let Some(chmu) = ep.chmu() {
                chmu.set_geometry_source(geometry.clone());
            }
        }

        slog::info!(fabric.log, "fabric built";
            "host_bridges" => fabric.host_bridges.len(),
            "switches" => fabric.switches.len(),
            "endpoints" => fabric.endpoints.len(),
            "windows" => fabric.windows.len(),
        );
        Ok(fabric)
    }

    /// Check names and per-node port declarations.
    fn check_nodes(&self) -> Result<BTreeMap<&str, &NodeSpec>, ConfigError> {
        let mut nodes = BTreeMap::new();
        for (name, spec) in &self.nodes {
            if nodes.insert(name.as_str(), spec).is_some() {
                return Err(ConfigError::DuplicateName(name.clone()));
            }
            let Some(ports) = spec.ports() else {
                continue;
            };
            let mut seen = BTreeSet::new();
            for port in ports {
                if !seen.insert(*port) {
                    return Err(ConfigError::DuplicatePort {
                        name: name.clone(),
                        port: *port,
                    });
                }
            }
            let passthrough =
                matches!(spec, NodeSpec::HostBridge(hb) if hb.passthrough);
            if passthrough && ports.len() != 1 {
                return Err(ConfigError::PassthroughPorts(name.clone()));
            }
        }
        Ok(nodes)
    }

    /// Check every link, returning the parent of each attached child.
    fn check_links<'a>(
        &'a self,
        nodes: &BTreeMap<&str, &NodeSpec>,
    ) -> Result<BTreeMap<&'a str, &'a str>, ConfigError> {
        let mut parents = BTreeMap::new();
        let mut used = BTreeSet::new();
        for link in &self.links {
            let parent = nodes.get(link.parent.as_str()).ok_or_else(|| {
                ConfigError::UnknownComponent(link.parent.clone())
            })?;
            let ports = parent
                .ports()
                .ok_or_else(|| ConfigError::NotAParent(link.parent.clone()))?;
            if !ports.contains(&link.port) {
                return Err(ConfigError::UnknownPort {
                    parent: link.parent.clone(),
                    port: link.port,
                });
            }
            if !used.insert((link.parent.as_str(), link.port)) {
                return Err(ConfigError::PortInUse {
                    parent: link.parent.clone(),
                    port: link.port,
                });
            }
            match nodes.get(link.child.as_str()) {
                None => {
                    let name = link.child.clone();
                    return Err(ConfigError::UnknownComponent(name));
                }
                Some(NodeSpec::HostBridge(_)) => {
                    return Err(ConfigError::NotAttachable(link.child.clone()))
                }
                Some(_) => {}
            }
            if parents
                .insert(link.child.as_str(), link.parent.as_str())
                .is_some()
            {
                return Err(ConfigError::AttachedTwice(link.child.clone()));
            }
        }
        Ok(parents)
    }

    /// Number of switch levels down to and including each switch.
    fn switch_depths<'a>(
        nodes: &BTreeMap<&'a str, &NodeSpec>,
        parents: &BTreeMap<&str, &'a str>,
    ) -> Result<BTreeMap<&'a str, usize>, ConfigError> {
        let mut depths = BTreeMap::new();
        for (name, spec) in nodes {
            if !matches!(spec, NodeSpec::Switch(_)) {
                continue;
            }
            let mut depth = 1;
            let mut cur: &str = name;
            while let Some(parent) = parents.get(cur) {
                if matches!(nodes.get(parent), Some(NodeSpec::Switch(_))) {
                    depth += 1;
                }
                if depth > MAX_SWITCH_DEPTH {
                    return Err(ConfigError::SwitchDepth(name.to_string()));
                }
                cur = parent;
            }
            depths.insert(*name, depth);
        }
        Ok(depths)
    }

    fn port_set(
        &self,
        parent: &str,
        built: &BTreeMap<&str, Attached>,
    ) -> PortSet {
        let mut ports = PortSet::new();
        for link in self.links.iter().filter(|l| l.parent == parent) {
            if let Some(dev) = built.get(link.child.as_str()) {
                // links were checked, so the port is free
                let _ = ports.attach(link.port, dev.clone());
            }
        }
        ports
    }
}

/// A built fabric: every component, the windows in front of them, and the
/// direct mappings between the two.
pub struct Fabric {
    host_bridges: Vec<Arc<HostBridge>>,
    switches: Vec<Arc<UpstreamSwitchPort>>,
    endpoints: Vec<Arc<Type3Dev>>,
    windows: Vec<Arc<FixedWindow>>,
    passthrough: DirectPassthrough,
    log: Logger,
}

impl Fabric {
    pub fn host_bridges(&self) -> &[Arc<HostBridge>] {
        &self.host_bridges
    }
    pub fn switches(&self) -> &[Arc<UpstreamSwitchPort>] {
        &self.switches
    }
    pub fn endpoints(&self) -> &[Arc<Type3Dev>] {
        &self.endpoints
    }
    pub fn windows(&self) -> &[Arc<FixedWindow>] {
        &self.windows
    }
    pub fn passthrough(&self) -> &DirectPassthrough {
        &self.passthrough
    }

    pub fn endpoint(&self, id: ComponentId) -> Option<&Arc<Type3Dev>> {
        self.endpoints.iter().find(|ep| ep.id() == id)
    }
    pub fn endpoint_by_name(&self, name: &str) -> Option<&Arc<Type3Dev>> {
        self.endpoints.iter().find(|ep| ep.name() == name)
    }
    pub fn host_bridge(&self, name: &str) -> Option<&Arc<HostBridge>> {
        self.host_bridges.iter().find(|hb| hb.name == name)
    }
    pub fn switch(&self, name: &str) -> Option<&Arc<UpstreamSwitchPort>> {
        self.switches.iter().find(|usp| usp.name == name)
    }

    /// Assign window bases in declaration order, packed upward from `floor`
    /// (rounded up to the window alignment).  Every window must end at or
    /// below `max`.
    ///
    /// Decoders committed before placement are re-evaluated for direct
    /// mapping once every window has its base.
    pub fn layout_windows(
        &self,
        floor: u64,
        max: u64,
    ) -> Result<(), ConfigError> {
        let mut next = Some(floor);
        for w in self.windows.iter() {
            let index = w.index();
            let base = next
                .and_then(|n| round_up_p2(n, WINDOW_ALIGN))
                .ok_or(ConfigError::Layout { index, max })?;
            let end = base
                .checked_add(w.size())
                .filter(|end| *end <= max)
                .ok_or(ConfigError::Layout { index, max })?;
            w.set_base(base).map_err(|_| ConfigError::AlreadyPlaced(index))?;
            slog::info!(self.log, "window placed";
                "window" => index, "base" => base, "size" => w.size());
            next = Some(end);
        }
        self.passthrough.refresh(&self.endpoints);
        Ok(())
    }

    /// Register every placed window on `bus`.
    pub fn map_windows(&self, bus: &MmioBus) -> Result<(), ConfigError> {
        for w in self.windows.iter() {
            let index = w.index();
            let base = w.base().ok_or(ConfigError::Unplaced(index))?;
            let win = Arc::clone(w);
            bus.register(
                base as usize,
                w.size() as usize,
                Arc::new(move |_start: usize, rwo: RWOp| win.mmio_rw(rwo)),
            )
            .map_err(|source| ConfigError::Map { index, source })?;
        }
        Ok(())
    }

    /// Endpoint servicing host physical address `hpa`, if any
    pub fn resolve(&self, hpa: u64) -> Option<Arc<Type3Dev>> {
        let window = self.windows.iter().find(|w| w.contains(hpa))?;
        window.walk(hpa).map(|w| w.endpoint)
    }

    /// Position of `endpoint` within an interleave set of `ways` ways of
    /// `granularity` bytes starting at `base`: the granule, counted from the
    /// start of each stripe, which routes to it.
    pub fn interleave_position(
        &self,
        endpoint: ComponentId,
        base: u64,
        ways: u64,
        granularity: u64,
    ) -> Option<u64> {
        (0..ways).find(|k| {
            base.checked_add(k * granularity)
                .and_then(|hpa| self.resolve(hpa))
                .map_or(false, |ep| ep.id() == endpoint)
        })
    }
}

impl CommitObserver for Fabric {
    fn commit_changed(&self, owner: Owner, change: CommitChange) {
        match owner {
            Owner::Endpoint(id) => {
                if let Some(ep) = self.endpoint(id) {
                    self.passthrough.on_decoder_commit_change(
                        ep,
                        change.decoder,
                        change.committed,
                    );
                }
            }
            Owner::HostBridge(_) | Owner::Switch(_) => {
                self.passthrough.refresh(&self.endpoints);
            }
        }
    }
}

impl GeometrySource for Fabric {
    fn decoder_geometry(&self, endpoint: ComponentId) -> Vec<DecoderGeometry> {
        let Some(ep) = self.endpoint(endpoint) else {
            return Vec::new();
        };
        let hdm = ep.hdm();
        hdm.decoders()
            .iter()
            .enumerate()
            .map(|(idx, dec)| {
                let ways = dec.ways().map_or(1, |w| w.ways());
                let granularity = dec.granularity().unwrap_or_default().bytes();
                let way = dec
                    .committed()
                    .then(|| {
                        self.interleave_position(
                            endpoint,
                            dec.base(),
                            ways,
                            granularity,
                        )
                    })
                    .flatten();
                DecoderGeometry {
                    base: dec.base(),
                    size: dec.size(),
                    dpa_base: hdm.dpa_base(idx).unwrap_or(0),
                    ways,
                    way: way.unwrap_or(0),
                    granularity,
                }
            })
            .collect()
    }
}

impl Lifecycle for Fabric {
    fn type_name(&self) -> &'static str {
        "cxl-fabric"
    }
    fn pause(&self) {
        for ep in self.endpoints.iter() {
            ep.pause();
        }
    }
    fn resume(&self) {
        for ep in self.endpoints.iter() {
            ep.resume();
        }
    }
    fn reset(&self) {
        for ep in self.endpoints.iter() {
            self.passthrough.reset_endpoint(ep.id());
            ep.reset();
        }
        for usp in self.switches.iter() {
            usp.hdm.reset();
        }
        for hb in self.host_bridges.iter() {
            hb.hdm.reset();
        }
    }
    fn halt(&self) {
        for ep in self.endpoints.iter() {
            ep.halt();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hw::cxl::hdm::DecoderSetup;
    use crate::hw::cxl::test_util::{log, runtime};
    use crate::hw::cxl::InterleaveWays;
    use crate::intr::NoMsi;
    use proptest::prelude::*;

    const FLOOR: u64 = 0x10_0000_0000;

    fn hb_spec(ports: &[u8]) -> HostBridgeSpec {
        HostBridgeSpec {
            passthrough: false,
            decoder_count: 4,
            ports: ports.to_vec(),
        }
    }
    fn ep_spec(vsize: u64) -> Type3Spec {
        Type3Spec {
            volatile_size: vsize,
            persistent_size: 0,
            decoder_count: 2,
            chmu: None,
        }
    }
    fn win_spec(size: u64, targets: &[&str]) -> WindowSpec {
        WindowSpec {
            size,
            targets: targets.iter().map(|t| t.to_string()).collect(),
            interleave_granularity: None,
        }
    }

    fn build(b: FabricBuilder) -> Result<Arc<Fabric>, ConfigError> {
        let rt = runtime();
        b.build(Arc::new(NoMsi), rt.handle().clone(), log())
    }

    /// Two host bridges, each with one endpoint, behind one 2-way window
    fn two_way() -> Arc<Fabric> {
        let b = FabricBuilder::new()
            .host_bridge("hb0", hb_spec(&[0]))
            .host_bridge("hb1", hb_spec(&[0]))
            .type3("mem0", ep_spec(256 * MIB))
            .type3("mem1", ep_spec(256 * MIB))
            .attach("hb0", 0, "mem0")
            .attach("hb1", 0, "mem1")
            .window(win_spec(512 * MIB, &["hb0", "hb1"]));
        build(b).unwrap()
    }

    #[test]
    fn validation() {
        let base = || {
            FabricBuilder::new()
                .host_bridge("hb0", hb_spec(&[0, 1]))
                .switch("usp0", SwitchSpec { decoder_count: 1, ports: vec![0] })
                .type3("mem0", ep_spec(256 * MIB))
        };
        let err = |b| build(b).err().map(|e: ConfigError| e.to_string());

        assert!(build(base()).is_ok());
        assert!(matches!(
            build(base().type3("hb0", ep_spec(256 * MIB))),
            Err(ConfigError::DuplicateName(n)) if n == "hb0"
        ));
        assert!(matches!(
            build(base().host_bridge("hb1", hb_spec(&[2, 2]))),
            Err(ConfigError::DuplicatePort { port: 2, .. })
        ));
        let pt = HostBridgeSpec { passthrough: true, ..hb_spec(&[0, 1]) };
        assert!(matches!(
            build(base().host_bridge("hb1", pt)),
            Err(ConfigError::PassthroughPorts(_))
        ));
        assert!(matches!(
            build(base().attach("hb9", 0, "mem0")),
            Err(ConfigError::UnknownComponent(n)) if n == "hb9"
        ));
        assert!(matches!(
            build(base().attach("mem0", 0, "usp0")),
            Err(ConfigError::NotAParent(_))
        ));
        assert!(matches!(
            build(base().attach("hb0", 5, "mem0")),
            Err(ConfigError::UnknownPort { port: 5, .. })
        ));
        assert!(matches!(
            build(base().attach("hb0", 0, "mem0").attach("hb0", 0, "usp0")),
            Err(ConfigError::PortInUse { port: 0, .. })
        ));
        assert!(matches!(
            build(base().attach("hb0", 0, "mem0").attach("usp0", 0, "mem0")),
            Err(ConfigError::AttachedTwice(_))
        ));
        assert!(matches!(
            build(base().attach("usp0", 0, "hb0")),
            Err(ConfigError::NotAttachable(_))
        ));
        assert!(matches!(
            build(base().window(win_spec(GIB, &["mem0"]))),
            Err(ConfigError::NotHostBridge(_))
        ));
        assert!(matches!(
            build(base().window(win_spec(GIB, &["hb7"]))),
            Err(ConfigError::UnknownComponent(_))
        ));
        let odd = WindowSpec {
            interleave_granularity: Some(384),
            ..win_spec(GIB, &["hb0"])
        };
        assert!(matches!(
            build(base().window(odd)),
            Err(ConfigError::WindowGranularity { index: 0, granularity: 384 })
        ));
        assert!(err(base().window(win_spec(GIB + 1, &["hb0"])))
            .unwrap()
            .contains("bad size"));
    }

    #[test]
    fn switch_depth() {
        let sw = || SwitchSpec { decoder_count: 1, ports: vec![0] };
        let b = FabricBuilder::new()
            .host_bridge("hb0", hb_spec(&[0]))
            .switch("usp0", sw())
            .switch("usp1", sw())
            .type3("mem0", ep_spec(256 * MIB))
            .attach("hb0", 0, "usp0")
            .attach("usp0", 0, "usp1")
            .attach("usp1", 0, "mem0");
        assert!(matches!(
            build(b),
            Err(ConfigError::SwitchDepth(n)) if n == "usp1"
        ));

        // switches which loop back on each other never reach a host bridge
        let b = FabricBuilder::new()
            .switch("usp0", sw())
            .switch("usp1", sw())
            .attach("usp0", 0, "usp1")
            .attach("usp1", 0, "usp0");
        assert!(matches!(build(b), Err(ConfigError::SwitchDepth(_))));

        let b = FabricBuilder::new()
            .host_bridge("hb0", hb_spec(&[0]))
            .switch("usp0", sw())
            .type3("mem0", ep_spec(256 * MIB))
            .attach("hb0", 0, "usp0")
            .attach("usp0", 0, "mem0");
        let fabric = build(b).unwrap();
        assert_eq!(fabric.switches().len(), 1);
        assert!(fabric.switch("usp0").unwrap().ports.by_num(0).is_some());
    }

    #[test]
    fn layout() {
        let b = FabricBuilder::new()
            .host_bridge("hb0", hb_spec(&[0]))
            .window(win_spec(GIB, &["hb0"]))
            .window(win_spec(256 * MIB, &["hb0"]))
            .window(win_spec(512 * MIB, &["hb0"]));
        let fabric = build(b).unwrap();
        fabric.layout_windows(FLOOR + 1, FLOOR + 4 * GIB).unwrap();
        let bases: Vec<u64> =
            fabric.windows().iter().map(|w| w.base().unwrap()).collect();
        assert_eq!(
            bases,
            vec![FLOOR + 256 * MIB, FLOOR + 1280 * MIB, FLOOR + 1536 * MIB]
        );
        assert!(matches!(
            fabric.layout_windows(FLOOR, FLOOR + 4 * GIB),
            Err(ConfigError::AlreadyPlaced(0))
        ));

        let bus = MmioBus::new(usize::MAX);
        fabric.map_windows(&bus).unwrap();
        assert!(matches!(
            bus.handle_read((FLOOR + 256 * MIB) as usize, 8),
            Err(mmio::Error::Poison(_))
        ));
    }

    #[test]
    fn layout_exhausted() {
        let b = FabricBuilder::new()
            .host_bridge("hb0", hb_spec(&[0]))
            .window(win_spec(GIB, &["hb0"]))
            .window(win_spec(GIB, &["hb0"]));
        let fabric = build(b).unwrap();
        assert!(matches!(
            fabric.layout_windows(FLOOR, FLOOR + GIB + 256 * MIB),
            Err(ConfigError::Layout { index: 1, .. })
        ));
        assert!(matches!(
            fabric.map_windows(&MmioBus::new(usize::MAX)),
            Err(ConfigError::Unplaced(1))
        ));

        let b = FabricBuilder::new()
            .host_bridge("hb0", hb_spec(&[0]))
            .window(win_spec(GIB, &["hb0"]));
        let fabric = build(b).unwrap();
        assert!(matches!(
            fabric.layout_windows(u64::MAX - 10, u64::MAX),
            Err(ConfigError::Layout { index: 0, .. })
        ));
    }

    #[test]
    fn geometry_and_position() {
        let fabric = two_way();
        fabric.layout_windows(FLOOR, u64::MAX).unwrap();
        let setup = DecoderSetup::new(FLOOR, 512 * MIB)
            .interleave(InterleaveWays::Ways2, InterleaveGranularity::default());
        for (n, hb) in fabric.host_bridges().iter().enumerate() {
            let hb_setup = DecoderSetup::new(FLOOR, 512 * MIB).targets(&[0]);
            hb.hdm.commit_decoder(0, &hb_setup);
            fabric.endpoints()[n].hdm().commit_decoder(0, &setup);
        }

        let mem1 = fabric.endpoint_by_name("mem1").unwrap();
        assert_eq!(fabric.resolve(FLOOR + 256).unwrap().id(), mem1.id());
        assert!(fabric.resolve(FLOOR + GIB).is_none());
        assert_eq!(
            fabric.interleave_position(mem1.id(), FLOOR, 2, 256),
            Some(1)
        );

        let geo = fabric.decoder_geometry(mem1.id());
        assert_eq!(geo.len(), 2);
        assert_eq!(
            geo[0],
            DecoderGeometry {
                base: FLOOR,
                size: 512 * MIB,
                dpa_base: 0,
                ways: 2,
                way: 1,
                granularity: 256,
            }
        );
        assert_eq!(
            geo[1],
            DecoderGeometry {
                ways: 1,
                granularity: 256,
                dpa_base: 256 * MIB,
                ..Default::default()
            }
        );

        // interleaved paths are never mapped directly
        assert_eq!(fabric.passthrough().mapping_count(), 0);
    }

    #[test]
    fn commits_drive_direct_mappings() {
        let b = FabricBuilder::new()
            .host_bridge("hb0", hb_spec(&[0]))
            .type3("mem0", ep_spec(256 * MIB))
            .attach("hb0", 0, "mem0")
            .window(win_spec(GIB, &["hb0"]));
        let fabric = build(b).unwrap();
        fabric.layout_windows(FLOOR, u64::MAX).unwrap();
        let ep = Arc::clone(fabric.endpoint_by_name("mem0").unwrap());
        let hb = Arc::clone(fabric.host_bridge("hb0").unwrap());

        ep.hdm().commit_decoder(0, &DecoderSetup::new(FLOOR, 256 * MIB));
        assert_eq!(fabric.passthrough().mapping_count(), 0);
        hb.hdm.commit_decoder(0, &DecoderSetup::new(FLOOR, GIB).targets(&[0]));
        assert!(fabric.passthrough().mapping(ep.id(), 0).is_some());

        fabric.pause();
        fabric.reset();
        assert_eq!(fabric.passthrough().mapping_count(), 0);
        assert_eq!(fabric.windows()[0].alias_count(), 0);
        assert!(!hb.hdm.decoder(0).unwrap().committed());
    }

    #[test]
    fn commits_before_layout() {
        let b = FabricBuilder::new()
            .host_bridge("hb0", hb_spec(&[0]))
            .type3("mem0", ep_spec(256 * MIB))
            .attach("hb0", 0, "mem0")
            .window(win_spec(GIB, &["hb0"]));
        let fabric = build(b).unwrap();
        let ep = Arc::clone(fabric.endpoint_by_name("mem0").unwrap());
        let hb = Arc::clone(fabric.host_bridge("hb0").unwrap());

        // the firmware programmed the path before windows were placed
        ep.hdm().commit_decoder(0, &DecoderSetup::new(FLOOR, 256 * MIB));
        hb.hdm.commit_decoder(0, &DecoderSetup::new(FLOOR, GIB).targets(&[0]));
        assert_eq!(fabric.passthrough().mapping_count(), 0);

        fabric.layout_windows(FLOOR, u64::MAX).unwrap();
        let m = fabric.passthrough().mapping(ep.id(), 0).unwrap();
        assert_eq!((m.window, m.window_offset), (0, 0));
        assert_eq!(fabric.windows()[0].alias_count(), 1);

        let bus = MmioBus::new(u64::MAX as usize);
        fabric.map_windows(&bus).unwrap();
        let addr = (FLOOR + 0x80) as usize;
        bus.handle_write(addr, 4, 0xcafe).unwrap();
        assert_eq!(bus.handle_read(addr, 4), Ok(0xcafe));
    }

    proptest! {
        #[test]
        fn layout_properties(
            sizes in prop::collection::vec(1u64..=8, 1..8),
            floor in 0u64..(1 << 40),
        ) {
            let mut b =
                FabricBuilder::new().host_bridge("hb0", hb_spec(&[0]));
            for s in sizes.iter() {
                b = b.window(win_spec(s * WINDOW_ALIGN, &["hb0"]));
            }
            let placed = |b: FabricBuilder| {
                let fabric = build(b).unwrap();
                fabric.layout_windows(floor, u64::MAX).unwrap();
                fabric
                    .windows()
                    .iter()
                    .map(|w| (w.base().unwrap(), w.size()))
                    .collect::<Vec<_>>()
            };
            let first = placed(b.clone());
            prop_assert_eq!(&first, &placed(b));

            prop_assert!(first[0].0 >= floor);
            for (base, size) in first.iter() {
                prop_assert_eq!(base % WINDOW_ALIGN, 0);
                prop_assert_eq!(size % WINDOW_ALIGN, 0);
            }
            for pair in first.windows(2) {
                prop_assert!(pair[0].0 + pair[0].1 <= pair[1].0);
            }
        }
    }
}
