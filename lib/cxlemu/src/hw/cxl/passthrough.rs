// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Direct mapping of endpoint memory into fixed windows.
//!
//! When an endpoint decoder commits with no interleave, and every hop from
//! the window down to the endpoint is also non-interleaved, the endpoint's
//! backing memory is mapped into the window as an alias.  Accesses hitting
//! an alias skip the per-access decoder walk.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use slog::Logger;

use super::topology::ComponentId;
use super::type3::Type3Dev;
use super::window::FixedWindow;
use super::InterleaveWays;
use crate::mem::Ram;

/// An installed alias for one endpoint decoder.
#[derive(Clone, Debug)]
pub struct DirectMapping {
    pub endpoint: ComponentId,
    pub decoder: usize,
    pub window: usize,
    /// Offset of the alias within its window
    pub window_offset: u64,
    pub size: u64,
    pub backing: Arc<Ram>,
    /// Offset within `backing` of the first aliased byte
    pub backing_offset: u64,
}
impl DirectMapping {
    fn same_target(&self, other: &DirectMapping) -> bool {
        self.window == other.window
            && self.window_offset == other.window_offset
            && self.size == other.size
            && Arc::ptr_eq(&self.backing, &other.backing)
            && self.backing_offset == other.backing_offset
    }
}

type Slot = (ComponentId, usize);

pub struct DirectPassthrough {
    windows: Vec<Arc<FixedWindow>>,
    slots: Mutex<BTreeMap<Slot, DirectMapping>>,
    log: Logger,
}

impl DirectPassthrough {
    pub fn new(windows: Vec<Arc<FixedWindow>>, log: Logger) -> Self {
        Self { windows, slots: Mutex::new(BTreeMap::new()), log }
    }

    /// Decoder `idx` of `ep` was committed or uncommitted.
    pub fn on_decoder_commit_change(
        &self,
        ep: &Arc<Type3Dev>,
        idx: usize,
        committed: bool,
    ) {
        let mut slots = self.slots.lock().unwrap();
        let slot = (ep.id(), idx);
        if !committed {
            if let Some(old) = slots.remove(&slot) {
                self.unmap(&old);
            }
            return;
        }
        if slots.contains_key(&slot) {
            slog::warn!(self.log, "decoder already directly mapped";
                "endpoint" => ep.name(), "decoder" => idx);
            return;
        }
        if let Some(mapping) = self.eligible(ep, idx) {
            if self.map(&mapping) {
                slots.insert(slot, mapping);
            }
        }
    }

    /// Re-evaluate every decoder slot of `endpoints`.  Needed whenever a host
    /// bridge or switch decoder changes, since the path to an endpoint can
    /// gain or lose interleave without the endpoint itself changing.
    pub fn refresh(&self, endpoints: &[Arc<Type3Dev>]) {
        let mut slots = self.slots.lock().unwrap();
        for ep in endpoints {
            for idx in 0..ep.hdm().decoder_count() {
                let slot = (ep.id(), idx);
                let cur = slots.get(&slot).cloned();
                match (cur, self.eligible(ep, idx)) {
                    (Some(cur), Some(want)) if cur.same_target(&want) => {}
                    (cur, want) => {
                        if let Some(old) = cur {
                            slots.remove(&slot);
                            self.unmap(&old);
                        }
                        if let Some(want) = want {
                            if self.map(&want) {
                                slots.insert(slot, want);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Drop every mapping belonging to endpoint `id`
    pub fn reset_endpoint(&self, id: ComponentId) {
        let mut slots = self.slots.lock().unwrap();
        let gone: Vec<Slot> =
            slots.keys().filter(|(ep, _)| *ep == id).copied().collect();
        for slot in gone {
            if let Some(old) = slots.remove(&slot) {
                self.unmap(&old);
            }
        }
    }

    pub fn mapping(
        &self,
        id: ComponentId,
        idx: usize,
    ) -> Option<DirectMapping> {
        self.slots.lock().unwrap().get(&(id, idx)).cloned()
    }
    pub fn mapping_count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    /// The alias decoder `idx` of `ep` should have, if any
    fn eligible(
        &self,
        ep: &Arc<Type3Dev>,
        idx: usize,
    ) -> Option<DirectMapping> {
        let dec = ep.hdm().decoder(idx)?;
        if !dec.committed()
            || dec.ways()? != InterleaveWays::Ways1
            || dec.size() == 0
        {
            return None;
        }
        let (base, size) = (dec.base(), dec.size());
        let last = base.checked_add(size - 1)?;
        let dpa = ep.hdm().dpa_base(idx)?;

        let window = self.windows.iter().find(|w| w.contains(base))?;
        if window.num_targets() != 1 || !window.contains(last) {
            return None;
        }
        for hpa in [base, last] {
            let walk = window.walk(hpa)?;
            if walk.interleaved || walk.endpoint.id() != ep.id() {
                return None;
            }
        }

        let (backing, backing_offset) = ep.backing_for(dpa, size)?;
        Some(DirectMapping {
            endpoint: ep.id(),
            decoder: idx,
            window: window.index(),
            window_offset: base - window.base()?,
            size,
            backing: Arc::clone(backing),
            backing_offset,
        })
    }

    fn window(&self, index: usize) -> Option<&Arc<FixedWindow>> {
        self.windows.iter().find(|w| w.index() == index)
    }

    fn map(&self, m: &DirectMapping) -> bool {
        let Some(window) = self.window(m.window) else {
            return false;
        };
        match window.map_alias(
            m.window_offset,
            m.size,
            Arc::clone(&m.backing),
            m.backing_offset,
        ) {
            Ok(()) => {
                slog::info!(self.log, "direct mapping installed";
                    "window" => m.window,
                    "offset" => m.window_offset,
                    "size" => m.size,
                    "backing" => m.backing.name(),
                    "decoder" => m.decoder,
                );
                true
            }
            Err(e) => {
                slog::warn!(self.log, "direct mapping conflicts";
                    "window" => m.window,
                    "offset" => m.window_offset,
                    "error" => %e,
                );
                false
            }
        }
    }

    fn unmap(&self, m: &DirectMapping) {
        if let Some(window) = self.window(m.window) {
            window.unmap_alias(m.window_offset);
        }
        slog::info!(self.log, "direct mapping removed";
            "window" => m.window, "offset" => m.window_offset);
    }
}
