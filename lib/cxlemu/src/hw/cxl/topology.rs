// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host bridges, switches and the ports which join them to endpoints.

use std::sync::Arc;

use slog::Logger;

use super::bits::TARGET_LIST_LEN;
use super::hdm::{HdmDecoderBlock, Owner};
use super::type3::Type3Dev;
use super::{ConfigError, MAX_SWITCH_DEPTH};
use crate::util::id::define_id;

define_id! {
    /// Run-time identifier of a host bridge, switch or endpoint
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct ComponentId(u32);
}

/// What sits below a downstream port
#[derive(Clone)]
pub enum Attached {
    Type3(Arc<Type3Dev>),
    Switch(Arc<UpstreamSwitchPort>),
    /// A device with no CXL memory, which never services window accesses
    Other(String),
}

/// The downstream ports of a host bridge or switch, keyed by port number.
#[derive(Default)]
pub struct PortSet {
    ports: Vec<(u8, Attached)>,
}
impl PortSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `dev` below port `num`.  Returns it back if the port is taken.
    pub fn attach(&mut self, num: u8, dev: Attached) -> Result<(), Attached> {
        if self.by_num(num).is_some() {
            return Err(dev);
        }
        self.ports.push((num, dev));
        Ok(())
    }

    /// Device attached below the port with number `num`
    pub fn by_num(&self, num: u8) -> Option<&Attached> {
        self.ports.iter().find(|(n, _)| *n == num).map(|(_, dev)| dev)
    }

    /// Device below the first port, in attachment order
    pub fn first(&self) -> Option<&Attached> {
        self.ports.first().map(|(_, dev)| dev)
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
    pub fn iter(&self) -> impl Iterator<Item = (u8, &Attached)> {
        self.ports.iter().map(|(n, dev)| (*n, dev))
    }
}

/// A CXL host bridge.
///
/// A passthrough host bridge has a single root port and no decoders of its
/// own in the routing path.
pub struct HostBridge {
    pub id: ComponentId,
    pub name: String,
    pub passthrough: bool,
    pub hdm: HdmDecoderBlock,
    pub ports: PortSet,
}

/// The upstream port of a CXL switch, with its downstream ports.
pub struct UpstreamSwitchPort {
    pub id: ComponentId,
    pub name: String,
    pub hdm: HdmDecoderBlock,
    pub ports: PortSet,
}

/// Outcome of routing an address below a host bridge.
#[derive(Clone)]
pub struct Walk {
    pub endpoint: Arc<Type3Dev>,
    /// Some decoder on the way down interleaves
    pub interleaved: bool,
}

impl HostBridge {
    pub fn new(
        name: &str,
        passthrough: bool,
        decoder_count: usize,
        target_count: usize,
        ports: PortSet,
        log: Logger,
    ) -> Result<Self, ConfigError> {
        if passthrough && (target_count != 1 || ports.len() > 1) {
            return Err(ConfigError::PassthroughPorts(name.to_string()));
        }
        let id = ComponentId::new();
        let target_count = target_count.min(TARGET_LIST_LEN);
        let hdm = HdmDecoderBlock::new(
            Owner::HostBridge(id),
            decoder_count,
            target_count,
            log,
        )?;
        Ok(Self { id, name: name.to_string(), passthrough, hdm, ports })
    }

    /// Route `hpa` through this host bridge to the endpoint servicing it.
    pub fn walk(&self, hpa: u64) -> Option<Walk> {
        let (mut dev, mut interleaved) = if self.passthrough {
            (self.ports.first()?, false)
        } else {
            let target = self.hdm.find_target(hpa)?;
            (self.ports.by_num(target.port)?, target.interleaved)
        };

        let mut depth = 0;
        loop {
            match dev {
                Attached::Type3(ep) => {
                    return Some(Walk { endpoint: Arc::clone(ep), interleaved })
                }
                Attached::Switch(usp) if depth < MAX_SWITCH_DEPTH => {
                    let target = usp.hdm.find_target(hpa)?;
                    interleaved |= target.interleaved;
                    dev = usp.ports.by_num(target.port)?;
                    depth += 1;
                }
                Attached::Switch(_) | Attached::Other(_) => return None,
            }
        }
    }
}

impl UpstreamSwitchPort {
    pub fn new(
        name: &str,
        decoder_count: usize,
        target_count: usize,
        ports: PortSet,
        log: Logger,
    ) -> Result<Self, ConfigError> {
        let id = ComponentId::new();
        let target_count = target_count.min(TARGET_LIST_LEN);
        let hdm = HdmDecoderBlock::new(
            Owner::Switch(id),
            decoder_count,
            target_count,
            log,
        )?;
        Ok(Self { id, name: name.to_string(), hdm, ports })
    }
}
