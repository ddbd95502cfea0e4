// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! CXL Fixed Memory Windows.
//!
//! A window is a range of host physical address space interleaved across
//! one or more host bridges.  Accesses are routed on every transaction: the
//! window picks a host bridge, and the decoders below it pick the endpoint.
//! Non-interleaved paths may instead be served by an alias installed by the
//! passthrough manager, which maps endpoint memory straight into the window.

use std::sync::{Arc, Mutex, OnceLock};

use slog::Logger;

use super::topology::{HostBridge, Walk};
use super::type3::Type3Dev;
use super::{ConfigError, InterleaveGranularity, InterleaveWays, WINDOW_ALIGN};
use crate::common::*;
use crate::mem::Ram;
use crate::mmio::TxStatus;
use crate::util::aspace::{self, ASpace};

#[usdt::provider(provider = "cxlemu")]
mod probes {
    fn cfmw_route(window: u64, hpa: u64, target: u64, routed: u8) {}
}

/// Endpoint memory mapped directly into a window.
#[derive(Clone, Debug)]
pub struct Alias {
    pub backing: Arc<Ram>,
    /// Offset within `backing` of the first aliased byte
    pub offset: u64,
}

pub struct FixedWindow {
    index: usize,
    size: u64,
    targets: Vec<Arc<HostBridge>>,
    ways: InterleaveWays,
    granularity: InterleaveGranularity,
    base: OnceLock<u64>,
    aliases: Mutex<ASpace<Alias>>,
    log: Logger,
}

impl FixedWindow {
    pub fn new(
        index: usize,
        size: u64,
        targets: Vec<Arc<HostBridge>>,
        granularity: InterleaveGranularity,
        log: Logger,
    ) -> Result<Self, ConfigError> {
        if size == 0
            || size % WINDOW_ALIGN != 0
            || usize::try_from(size).is_err()
        {
            return Err(ConfigError::WindowSize { index, size });
        }
        let ways = InterleaveWays::from_count(targets.len()).ok_or(
            ConfigError::WindowTargets { index, count: targets.len() },
        )?;

        Ok(Self {
            index,
            size,
            targets,
            ways,
            granularity,
            base: OnceLock::new(),
            aliases: Mutex::new(ASpace::new(0, size as usize - 1)),
            log,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }
    pub fn size(&self) -> u64 {
        self.size
    }
    pub fn targets(&self) -> &[Arc<HostBridge>] {
        &self.targets
    }
    pub fn num_targets(&self) -> usize {
        self.targets.len()
    }
    pub fn ways(&self) -> InterleaveWays {
        self.ways
    }
    pub fn granularity(&self) -> InterleaveGranularity {
        self.granularity
    }

    /// Place the window.  Fails, returning the existing base, if it was
    /// already placed.
    pub fn set_base(&self, base: u64) -> Result<(), u64> {
        self.base.set(base).map_err(|_| self.base().unwrap_or(base))
    }
    pub fn base(&self) -> Option<u64> {
        self.base.get().copied()
    }

    /// Does the placed window cover `hpa`?
    pub fn contains(&self, hpa: u64) -> bool {
        self.base().map_or(false, |b| hpa >= b && hpa - b < self.size)
    }

    /// Index of the host bridge servicing `hpa`
    pub fn target_index(&self, hpa: u64) -> usize {
        let n = self.targets.len() as u64;
        ((hpa / self.granularity.bytes()) % n) as usize
    }

    /// Route `hpa` down to an endpoint.  The walk is interleaved if any
    /// level, this window included, interleaves.
    pub fn walk(&self, hpa: u64) -> Option<Walk> {
        let target = self.target_index(hpa);
        let mut walk = self.targets[target].walk(hpa);
        if let Some(w) = walk.as_mut() {
            w.interleaved |= self.targets.len() > 1;
        }
        probes::cfmw_route!(|| (
            self.index as u64,
            hpa,
            target as u64,
            walk.is_some() as u8
        ));
        walk
    }

    /// Endpoint servicing the byte at `offset` into the window
    pub fn route(&self, offset: u64) -> Option<Arc<Type3Dev>> {
        let hpa = self.base()?.checked_add(offset)?;
        self.walk(hpa).map(|w| w.endpoint)
    }

    /// Guest read of `size` bytes at `offset`.  Accesses which route nowhere
    /// complete with poison.
    pub fn read(&self, offset: u64, size: usize) -> (u64, TxStatus) {
        if !(1..=8).contains(&size) {
            slog::warn!(self.log, "guest error: bad window read size";
                "offset" => offset, "size" => size);
            return (0, TxStatus::Ok);
        }
        let mut buf = [0u8; 8];
        let data = &mut buf[..size];

        if let Some((alias, off)) = self.alias_for(offset, size) {
            if alias.backing.read(off, data) {
                return (le_to_u64(data), TxStatus::Ok);
            }
        }
        let status = match self.route(offset) {
            Some(ep) => ep.read(self.hpa(offset), data),
            None => {
                slog::debug!(self.log, "unrouted window read";
                    "window" => self.index, "offset" => offset);
                TxStatus::Poison
            }
        };
        match status {
            TxStatus::Ok => (le_to_u64(data), TxStatus::Ok),
            TxStatus::Poison => (0, TxStatus::Poison),
        }
    }

    /// Guest write of the low `size` bytes of `val` at `offset`.  Writes
    /// which route nowhere are dropped.
    pub fn write(&self, offset: u64, size: usize, val: u64) -> TxStatus {
        if !(1..=8).contains(&size) {
            slog::warn!(self.log, "guest error: bad window write size";
                "offset" => offset, "size" => size);
            return TxStatus::Ok;
        }
        let buf = val.to_le_bytes();
        let data = &buf[..size];

        if let Some((alias, off)) = self.alias_for(offset, size) {
            if alias.backing.write(off, data) {
                return TxStatus::Ok;
            }
        }
        match self.route(offset) {
            Some(ep) => ep.write(self.hpa(offset), data),
            None => {
                slog::debug!(self.log, "unrouted window write dropped";
                    "window" => self.index, "offset" => offset);
                TxStatus::Ok
            }
        }
    }

    /// Handler for the window's region on the host address bus.
    pub fn mmio_rw(&self, rwo: RWOp) -> TxStatus {
        let offset = rwo.offset() as u64;
        match rwo {
            RWOp::Read(ro) => {
                let len = ro.len();
                let (val, status) = self.read(offset, len);
                if len <= 8 {
                    ro.write_bytes(&val.to_le_bytes()[..len]);
                } else {
                    ro.fill(0);
                }
                status
            }
            RWOp::Write(wo) => {
                let len = wo.len().min(8);
                let mut buf = [0u8; 8];
                wo.read_bytes(&mut buf[..len]);
                self.write(offset, wo.len(), u64::from_le_bytes(buf))
            }
        }
    }

    /// Map `size` bytes of `backing`, from `backing_offset`, at `offset`
    /// into the window.
    pub fn map_alias(
        &self,
        offset: u64,
        size: u64,
        backing: Arc<Ram>,
        backing_offset: u64,
    ) -> Result<(), aspace::Error> {
        if !backing.contains(backing_offset, size) {
            return Err(aspace::Error::BadLength);
        }
        let offset = usize::try_from(offset)
            .map_err(|_| aspace::Error::OutOfRange)?;
        let size = usize::try_from(size).map_err(|_| aspace::Error::BadLength)?;
        let alias = Alias { backing, offset: backing_offset };
        self.aliases.lock().unwrap().register(offset, size, alias)
    }

    /// Remove the alias mapped at `offset`
    pub fn unmap_alias(&self, offset: u64) -> Option<Alias> {
        let offset = usize::try_from(offset).ok()?;
        self.aliases.lock().unwrap().unregister(offset).ok()
    }

    pub fn alias_count(&self) -> usize {
        self.aliases.lock().unwrap().len()
    }

    fn alias_for(&self, offset: u64, size: usize) -> Option<(Alias, u64)> {
        let offset = usize::try_from(offset).ok()?;
        let aliases = self.aliases.lock().unwrap();
        let (start, len, alias) = aliases.region_at(offset).ok()?;
        // an access hanging off the end of an alias goes through the router
        if offset - start + size > len {
            return None;
        }
        Some((alias.clone(), alias.offset + (offset - start) as u64))
    }

    fn hpa(&self, offset: u64) -> u64 {
        self.base().unwrap_or(0) + offset
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hw::cxl::hdm::DecoderSetup;
    use crate::hw::cxl::test_util::*;
    use crate::hw::cxl::topology::Attached;

    const BASE: u64 = 0x10_0000_0000;

    #[test]
    fn bad_windows() {
        let hb = passthrough_hb("hb0", Attached::Other("nic".into()));
        let gran = InterleaveGranularity::default();
        assert!(matches!(
            FixedWindow::new(0, 100 * MIB, vec![hb.clone()], gran, log()),
            Err(ConfigError::WindowSize { index: 0, .. })
        ));
        assert!(matches!(
            FixedWindow::new(1, 0, vec![hb.clone()], gran, log()),
            Err(ConfigError::WindowSize { index: 1, size: 0 })
        ));
        assert!(matches!(
            FixedWindow::new(2, GIB, vec![hb.clone(); 5], gran, log()),
            Err(ConfigError::WindowTargets { index: 2, count: 5 })
        ));
        assert!(matches!(
            FixedWindow::new(3, GIB, vec![], gran, log()),
            Err(ConfigError::WindowTargets { index: 3, count: 0 })
        ));

        let w = FixedWindow::new(4, GIB, vec![hb; 3], gran, log()).unwrap();
        assert_eq!(w.ways(), InterleaveWays::Ways3);
        assert_eq!(w.set_base(BASE), Ok(()));
        assert_eq!(w.set_base(0), Err(BASE));
    }

    #[test]
    fn unrouted_access_asymmetry() {
        let ep = endpoint("mem0", 256 * MIB);
        let hb = hb("hb0", vec![Attached::Type3(ep.clone())]);
        let gran = InterleaveGranularity::default();
        let w = FixedWindow::new(0, GIB, vec![hb.clone()], gran, log()).unwrap();

        // not yet placed
        assert_eq!(w.read(0x1000, 8), (0, TxStatus::Poison));

        w.set_base(BASE).unwrap();
        commit_ep(&ep, BASE, 256 * MIB);
        // host bridge decoder still uncommitted
        assert!(w.route(0x1000).is_none());
        assert_eq!(w.write(0x1000, 8, 0x4242), TxStatus::Ok);
        assert_eq!(w.read(0x1000, 8), (0, TxStatus::Poison));
        let mut raw = [0u8; 8];
        ep.vmem().unwrap().read(0x1000, &mut raw);
        assert_eq!(raw, [0; 8]);

        // routed to the endpoint, but past its decoder
        hb.hdm.commit_decoder(0, &DecoderSetup::new(BASE, GIB).targets(&[0]));
        assert!(w.route(512 * MIB).is_some());
        assert_eq!(w.read(512 * MIB, 4), (0, TxStatus::Poison));
        assert_eq!(w.write(512 * MIB, 4, 1), TxStatus::Ok);

        assert_eq!(w.write(0x1000, 2, 0x4242), TxStatus::Ok);
        assert_eq!(w.read(0x1000, 8), (0x4242, TxStatus::Ok));
        // unaligned and odd sized
        assert_eq!(w.read(0x1001, 3), (0x42, TxStatus::Ok));

        // bad sizes are ignored
        assert_eq!(w.read(0x1000, 16), (0, TxStatus::Ok));
        assert_eq!(w.write(0x1000, 0, 0), TxStatus::Ok);
    }

    #[test]
    fn two_way_host_bridge_selection() {
        let ep0 = endpoint("mem0", 256 * MIB);
        let ep1 = endpoint("mem1", 256 * MIB);
        let hb0 = passthrough_hb("hb0", Attached::Type3(ep0.clone()));
        let hb1 = passthrough_hb("hb1", Attached::Type3(ep1.clone()));
        let gran = InterleaveGranularity::default();
        let w = FixedWindow::new(0, GIB, vec![hb0, hb1], gran, log()).unwrap();
        w.set_base(BASE).unwrap();

        assert_eq!(w.target_index(BASE), 0);
        assert_eq!(w.target_index(BASE + 256), 1);
        assert_eq!(w.target_index(BASE + 512), 0);

        let setup = DecoderSetup::new(BASE, 512 * MIB)
            .interleave(InterleaveWays::Ways2, gran);
        ep0.hdm().commit_decoder(0, &setup);
        ep1.hdm().commit_decoder(0, &setup);

        assert_eq!(w.route(0).unwrap().id(), ep0.id());
        assert_eq!(w.route(256).unwrap().id(), ep1.id());
        assert_eq!(w.route(512).unwrap().id(), ep0.id());
        assert!(w.walk(BASE).unwrap().interleaved);

        // both endpoints see their halves at the same device addresses
        assert_eq!(w.write(0x10, 1, 0xaa), TxStatus::Ok);
        assert_eq!(w.write(0x110, 1, 0xbb), TxStatus::Ok);
        let mut raw = [0u8; 1];
        ep0.vmem().unwrap().read(0x10, &mut raw);
        assert_eq!(raw, [0xaa]);
        ep1.vmem().unwrap().read(0x10, &mut raw);
        assert_eq!(raw, [0xbb]);
    }

    #[test]
    fn alias_takes_precedence() {
        let ep = endpoint("mem0", 256 * MIB);
        let hb = passthrough_hb("hb0", Attached::Type3(ep.clone()));
        let gran = InterleaveGranularity::default();
        let w = FixedWindow::new(0, GIB, vec![hb], gran, log()).unwrap();
        w.set_base(BASE).unwrap();

        let vmem = Arc::clone(ep.vmem().unwrap());
        w.map_alias(0, 256 * MIB, vmem.clone(), 0).unwrap();
        assert_eq!(w.alias_count(), 1);
        assert!(w.map_alias(0x1000, 0x1000, vmem.clone(), 0).is_err());
        assert!(w.map_alias(256 * MIB, 512 * MIB, vmem.clone(), 0).is_err());

        // served without any decoder committed
        assert_eq!(w.write(0x2000, 4, 0xdead_beef), TxStatus::Ok);
        assert_eq!(w.read(0x2000, 4), (0xdead_beef, TxStatus::Ok));
        // a straddling access falls back to the (empty) route
        assert_eq!(w.read(256 * MIB - 4, 8), (0, TxStatus::Poison));

        assert!(w.unmap_alias(0).is_some());
        assert!(w.unmap_alias(0).is_none());
        assert_eq!(w.read(0x2000, 4), (0, TxStatus::Poison));
        let mut raw = [0u8; 4];
        vmem.read(0x2000, &mut raw);
        assert_eq!(u32::from_le_bytes(raw), 0xdead_beef);
    }
}
