// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! CXL Type-3 memory expander.

use std::sync::Arc;

use slog::Logger;

use super::chmu::Chmu;
use super::hdm::{HdmDecoderBlock, Owner};
use super::topology::ComponentId;
use super::{ConfigError, WINDOW_ALIGN};
use crate::common::*;
use crate::mem::Ram;
use crate::mmio::TxStatus;

/// Smallest interleave granule.  Accesses are split at this boundary so each
/// piece translates through a single contiguous device range.
const MIN_GRANULE: u64 = 256;

#[derive(Copy, Clone, Debug)]
pub struct Type3Params {
    pub volatile_size: u64,
    pub persistent_size: u64,
    pub decoder_count: usize,
}

pub struct Type3Dev {
    id: ComponentId,
    name: String,
    hdm: HdmDecoderBlock,
    vmem: Option<Arc<Ram>>,
    pmem: Option<Arc<Ram>>,
    chmu: Option<Arc<Chmu>>,
    log: Logger,
}

impl Type3Dev {
    pub fn new(
        id: ComponentId,
        name: &str,
        params: Type3Params,
        chmu: Option<Arc<Chmu>>,
        log: Logger,
    ) -> Result<Self, ConfigError> {
        let Type3Params { volatile_size, persistent_size, decoder_count } =
            params;
        for size in [volatile_size, persistent_size] {
            if size % WINDOW_ALIGN != 0 {
                return Err(ConfigError::DeviceSize(name.to_string(), size));
            }
        }
        if volatile_size == 0 && persistent_size == 0 {
            return Err(ConfigError::DeviceSize(name.to_string(), 0));
        }

        let hdm = HdmDecoderBlock::new(
            Owner::Endpoint(id),
            decoder_count,
            0,
            log.clone(),
        )?;
        let ram = |kind: &str, size: u64| {
            (size != 0)
                .then(|| Arc::new(Ram::new(format!("{name}-{kind}"), size)))
        };

        Ok(Self {
            id,
            name: name.to_string(),
            hdm,
            vmem: ram("vmem", volatile_size),
            pmem: ram("pmem", persistent_size),
            chmu,
            log,
        })
    }

    pub fn id(&self) -> ComponentId {
        self.id
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn hdm(&self) -> &HdmDecoderBlock {
        &self.hdm
    }
    pub fn chmu(&self) -> Option<&Arc<Chmu>> {
        self.chmu.as_ref()
    }
    pub fn vmem(&self) -> Option<&Arc<Ram>> {
        self.vmem.as_ref()
    }
    pub fn pmem(&self) -> Option<&Arc<Ram>> {
        self.pmem.as_ref()
    }
    pub fn volatile_size(&self) -> u64 {
        self.vmem.as_ref().map_or(0, |r| r.len())
    }

    /// The store holding device range `[dpa, dpa + len)`, and the offset of
    /// `dpa` within it.  Volatile capacity sits below persistent capacity.
    pub fn backing_for(&self, dpa: u64, len: u64) -> Option<(&Arc<Ram>, u64)> {
        let vsize = self.volatile_size();
        let (ram, off) = if dpa < vsize {
            (self.vmem.as_ref()?, dpa)
        } else {
            (self.pmem.as_ref()?, dpa - vsize)
        };
        ram.contains(off, len).then_some((ram, off))
    }

    /// Service a memory read routed to this device at `hpa`.
    pub fn read(&self, hpa: u64, data: &mut [u8]) -> TxStatus {
        let mut done = 0;
        while done < data.len() {
            let addr = hpa + done as u64;
            let len = Self::piece_len(addr, data.len() - done);
            let piece = &mut data[done..(done + len)];
            let hit = self
                .resolve(addr, len)
                .map_or(false, |(ram, off)| ram.read(off, piece));
            if !hit {
                slog::debug!(self.log, "read of undecoded address";
                    "hpa" => addr);
                return TxStatus::Poison;
            }
            done += len;
        }
        TxStatus::Ok
    }

    /// Service a memory write routed to this device at `hpa`.  Undecoded
    /// pieces are dropped.
    pub fn write(&self, hpa: u64, data: &[u8]) -> TxStatus {
        let mut done = 0;
        while done < data.len() {
            let addr = hpa + done as u64;
            let len = Self::piece_len(addr, data.len() - done);
            let piece = &data[done..(done + len)];
            let hit = self
                .resolve(addr, len)
                .map_or(false, |(ram, off)| ram.write(off, piece));
            if !hit {
                slog::debug!(self.log, "write to undecoded address dropped";
                    "hpa" => addr);
            }
            done += len;
        }
        TxStatus::Ok
    }

    fn piece_len(addr: u64, remaining: usize) -> usize {
        let to_boundary = MIN_GRANULE - addr % MIN_GRANULE;
        remaining.min(to_boundary as usize)
    }

    fn resolve(&self, hpa: u64, len: usize) -> Option<(&Arc<Ram>, u64)> {
        let dpa = self.hdm.translate(hpa)?;
        self.backing_for(dpa, len as u64)
    }
}

impl Lifecycle for Type3Dev {
    fn type_name(&self) -> &'static str {
        "cxl-type3"
    }
    fn pause(&self) {
        if let Some(chmu) = self.chmu.as_ref() {
            chmu.pause();
        }
    }
    fn resume(&self) {
        if let Some(chmu) = self.chmu.as_ref() {
            chmu.resume();
        }
    }
    fn reset(&self) {
        self.hdm.reset();
        if let Some(chmu) = self.chmu.as_ref() {
            chmu.reset();
        }
        if let Some(vmem) = self.vmem.as_ref() {
            vmem.clear();
        }
    }
    fn halt(&self) {
        if let Some(chmu) = self.chmu.as_ref() {
            chmu.halt();
        }
    }
}
