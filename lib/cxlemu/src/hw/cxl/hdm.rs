// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HDM decoder register file and the decoder walk.

use std::sync::{Mutex, OnceLock, Weak};

use super::bits::*;
use super::topology::ComponentId;
use super::{
    decoder_count_enc, ConfigError, InterleaveGranularity, InterleaveWays,
};
use crate::common::*;
use crate::util::regmap::RegMap;

use lazy_static::lazy_static;
use slog::Logger;

/// The component which owns a decoder block.  The kind decides whether the
/// register pair at +0x14/+0x18 is a target list or a DPA skip.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Owner {
    HostBridge(ComponentId),
    Switch(ComponentId),
    Endpoint(ComponentId),
}
impl Owner {
    pub fn id(&self) -> ComponentId {
        match self {
            Owner::HostBridge(id) | Owner::Switch(id) | Owner::Endpoint(id) => {
                *id
            }
        }
    }
    pub fn is_endpoint(&self) -> bool {
        matches!(self, Owner::Endpoint(_))
    }
}

/// A decoder changed between committed and uncommitted.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CommitChange {
    pub decoder: usize,
    pub committed: bool,
}

/// Receives decoder commit transitions from the blocks it is installed on.
pub trait CommitObserver: Send + Sync {
    fn commit_changed(&self, owner: Owner, change: CommitChange);
}

/// Result of a decoder walk: the downstream port which services an address.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Target {
    pub port: u8,
    pub interleaved: bool,
}

/// Raw register contents of one decoder.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct DecoderRegs {
    pub base_lo: u32,
    pub base_hi: u32,
    pub size_lo: u32,
    pub size_hi: u32,
    pub ctrl: DecoderCtrl,
    /// Target list bytes 0-3, or DPA skip low for endpoints
    pub target_lo: u32,
    /// Target list bytes 4-7, or DPA skip high for endpoints
    pub target_hi: u32,
}
impl DecoderRegs {
    pub fn base(&self) -> u64 {
        lo_hi_addr(self.base_lo, self.base_hi)
    }
    pub fn size(&self) -> u64 {
        lo_hi_addr(self.size_lo, self.size_hi)
    }
    pub fn dpa_skip(&self) -> u64 {
        lo_hi_addr(self.target_lo, self.target_hi)
    }
    pub fn committed(&self) -> bool {
        self.ctrl.committed()
    }
    pub fn ways(&self) -> Option<InterleaveWays> {
        InterleaveWays::from_enc(self.ctrl.iw())
    }
    pub fn granularity(&self) -> Option<InterleaveGranularity> {
        InterleaveGranularity::from_enc(self.ctrl.ig())
    }
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base() && addr - self.base() < self.size()
    }
    fn overlaps(&self, other: &DecoderRegs) -> bool {
        let (a, b) = (self.base(), other.base());
        self.size() != 0
            && other.size() != 0
            && a < b.saturating_add(other.size())
            && b < a.saturating_add(self.size())
    }
    /// Port number held in target list entry `idx`
    pub fn target(&self, idx: usize) -> Option<u8> {
        match idx {
            0..=3 => Some((self.target_lo >> (8 * idx)) as u8),
            4..=7 => Some((self.target_hi >> (8 * (idx - 4))) as u8),
            _ => None,
        }
    }
    /// Bytes of device memory consumed by this decoder
    pub fn dpa_span(&self) -> u64 {
        self.size() / self.ways().map_or(1, InterleaveWays::ways)
    }
}

/// Decoder programming, applied through the register interface.
#[derive(Clone, Debug)]
pub struct DecoderSetup {
    pub base: u64,
    pub size: u64,
    pub ways: InterleaveWays,
    pub granularity: InterleaveGranularity,
    /// Ports in interleave order (host bridges and switches)
    pub targets: Vec<u8>,
    /// DPA skip (endpoints)
    pub dpa_skip: u64,
}
impl DecoderSetup {
    pub fn new(base: u64, size: u64) -> Self {
        Self {
            base,
            size,
            ways: InterleaveWays::Ways1,
            granularity: InterleaveGranularity::default(),
            targets: Vec::new(),
            dpa_skip: 0,
        }
    }
    pub fn targets(mut self, targets: &[u8]) -> Self {
        self.targets = targets.to_vec();
        self
    }
    pub fn interleave(
        mut self,
        ways: InterleaveWays,
        granularity: InterleaveGranularity,
    ) -> Self {
        self.ways = ways;
        self.granularity = granularity;
        self
    }
    pub fn dpa_skip(mut self, skip: u64) -> Self {
        self.dpa_skip = skip;
        self
    }
    fn target_regs(&self) -> (u32, u32) {
        let mut bytes = [0u8; 8];
        for (slot, port) in bytes.iter_mut().zip(self.targets.iter()) {
            *slot = *port;
        }
        (
            u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        )
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum HdmReg {
    Cap,
    GlobalCtrl,
    BaseLo(u8),
    BaseHi(u8),
    SizeLo(u8),
    SizeHi(u8),
    Ctrl(u8),
    TargetLo(u8),
    TargetHi(u8),
    Reserved,
}

/// Most decoders a single capability structure can describe
const MAX_DECODERS: usize = 32;

lazy_static! {
    static ref HDM_REGS: RegMap<HdmReg> = {
        let header = [
            (HdmReg::Cap, 4),
            (HdmReg::GlobalCtrl, 4),
            (HdmReg::Reserved, 8),
        ];
        let decoders = (0..MAX_DECODERS as u8).flat_map(|n| {
            [
                (HdmReg::BaseLo(n), 4),
                (HdmReg::BaseHi(n), 4),
                (HdmReg::SizeLo(n), 4),
                (HdmReg::SizeHi(n), 4),
                (HdmReg::Ctrl(n), 4),
                (HdmReg::TargetLo(n), 4),
                (HdmReg::TargetHi(n), 4),
                (HdmReg::Reserved, 4),
            ]
        });
        RegMap::create_packed_iter(
            hdm_block_size(MAX_DECODERS),
            header.into_iter().chain(decoders),
            Some(HdmReg::Reserved),
        )
    };
}

#[derive(Default)]
struct HdmState {
    global: HdmGlobalCtrl,
    decoders: Vec<DecoderRegs>,
}

/// The HDM decoder capability structure of one CXL component.
pub struct HdmDecoderBlock {
    owner: Owner,
    cap: HdmCap,
    count: usize,
    target_count: usize,
    state: Mutex<HdmState>,
    observer: OnceLock<Weak<dyn CommitObserver>>,
    log: Logger,
}
impl HdmDecoderBlock {
    pub fn new(
        owner: Owner,
        count: usize,
        target_count: usize,
        log: Logger,
    ) -> Result<Self, ConfigError> {
        let count_enc =
            decoder_count_enc(count).ok_or(ConfigError::DecoderCount(count))?;
        if target_count > TARGET_LIST_LEN {
            return Err(ConfigError::TargetCount(target_count));
        }
        // A 16-way set cannot be described by an 8-entry target list, so
        // only endpoints (which hold no list) take part in one.
        let cap = HdmCap(0)
            .with_decoder_count(count_enc)
            .with_target_count(target_count as u8)
            .with_interleave_a11_8(true)
            .with_interleave_a14_12(true)
            .with_ways_3_6_12(true)
            .with_ways_16(owner.is_endpoint());

        Ok(Self {
            owner,
            cap,
            count,
            target_count,
            state: Mutex::new(HdmState {
                global: HdmGlobalCtrl::default(),
                decoders: vec![DecoderRegs::default(); count],
            }),
            observer: OnceLock::new(),
            log,
        })
    }

    /// Install the receiver of commit transitions.  Only the first call has
    /// any effect.
    pub fn set_observer(&self, observer: Weak<dyn CommitObserver>) {
        let _ = self.observer.set(observer);
    }

    pub fn owner(&self) -> Owner {
        self.owner
    }
    pub fn decoder_count(&self) -> usize {
        self.count
    }
    /// Size in bytes of the register block
    pub fn size(&self) -> usize {
        hdm_block_size(self.count)
    }

    /// Whether a decoder of this block can route an interleave set of
    /// `ways`: every position needs its own target list entry.
    fn routable(&self, ways: InterleaveWays) -> bool {
        self.owner.is_endpoint() || ways.ways() <= self.target_count as u64
    }

    pub fn decoder(&self, idx: usize) -> Option<DecoderRegs> {
        self.state.lock().unwrap().decoders.get(idx).copied()
    }
    pub fn decoders(&self) -> Vec<DecoderRegs> {
        self.state.lock().unwrap().decoders.clone()
    }

    /// Walk the decoders for `addr`.
    ///
    /// The first decoder whose range covers `addr` decides the outcome: if it
    /// is not committed the walk fails, even when a later decoder would
    /// match.
    pub fn find_target(&self, addr: u64) -> Option<Target> {
        let state = self.state.lock().unwrap();
        let (idx, dec) =
            state.decoders.iter().enumerate().find(|(_, d)| d.contains(addr))?;
        if !dec.committed() {
            slog::debug!(self.log, "decoder hit but not committed";
                "addr" => addr, "decoder" => idx);
            return None;
        }

        let ways = dec.ways()?;
        let gran = dec.granularity()?;
        let target_idx = (addr / gran.bytes()) % ways.ways();
        let port = dec.target(target_idx as usize)?;
        Some(Target { port, interleaved: ways != InterleaveWays::Ways1 })
    }

    /// Device address at which decoder `idx` begins: the sum of skip and
    /// consumed capacity of every earlier decoder, plus its own skip.
    pub fn dpa_base(&self, idx: usize) -> Option<u64> {
        let state = self.state.lock().unwrap();
        let dec = state.decoders.get(idx)?;
        let mut dpa: u64 = 0;
        for prior in &state.decoders[..idx] {
            dpa = dpa.checked_add(prior.dpa_skip())?;
            dpa = dpa.checked_add(prior.dpa_span())?;
        }
        dpa.checked_add(dec.dpa_skip())
    }

    /// Translate a host physical address to a device physical address
    /// through the (endpoint) decoders.
    pub fn translate(&self, hpa: u64) -> Option<u64> {
        let state = self.state.lock().unwrap();
        let mut dpa_base: u64 = 0;
        for dec in &state.decoders {
            dpa_base = dpa_base.checked_add(dec.dpa_skip())?;
            if !dec.contains(hpa) {
                dpa_base = dpa_base.checked_add(dec.dpa_span())?;
                continue;
            }
            if !dec.committed() {
                return None;
            }

            let ways = dec.ways()?.ways();
            let shift = 8 + dec.ctrl.ig() as u32;
            let off = hpa - dec.base();
            let low = off & ((1 << shift) - 1);
            let high = (off >> shift) / ways;
            return dpa_base.checked_add(low | (high << shift));
        }
        None
    }

    /// Service a register access.  Offsets are relative to the start of the
    /// capability structure.
    pub fn reg_rw(&self, mut rwo: RWOp) {
        let mut change = None;
        {
            let mut state = self.state.lock().unwrap();
            HDM_REGS.process(&mut rwo, |id, rwo| match rwo {
                RWOp::Read(ro) => self.reg_read(&state, id, ro),
                RWOp::Write(wo) => {
                    if let Some(c) = self.reg_write(&mut state, id, wo) {
                        change = Some(c);
                    }
                }
            });
        }
        if let Some(change) = change {
            self.notify(change);
        }
    }

    pub fn read32(&self, offset: usize) -> u32 {
        let mut buf = [0u8; 4];
        self.reg_rw(RWOp::Read(&mut ReadOp::from_buf(offset, &mut buf)));
        u32::from_le_bytes(buf)
    }
    pub fn write32(&self, offset: usize, val: u32) {
        let buf = val.to_le_bytes();
        self.reg_rw(RWOp::Write(&mut WriteOp::from_buf(offset, &buf)));
    }

    /// Program decoder `idx` from `setup` and request a commit, the way a
    /// guest driver would.
    pub fn commit_decoder(&self, idx: usize, setup: &DecoderSetup) {
        let (tl_lo, tl_hi) = if self.owner.is_endpoint() {
            (setup.dpa_skip as u32, (setup.dpa_skip >> 32) as u32)
        } else {
            setup.target_regs()
        };
        let (base, size) = (setup.base, setup.size);
        self.write32(decoder_reg(idx, DECODER_BASE_LO), base as u32);
        self.write32(decoder_reg(idx, DECODER_BASE_HI), (base >> 32) as u32);
        self.write32(decoder_reg(idx, DECODER_SIZE_LO), size as u32);
        self.write32(decoder_reg(idx, DECODER_SIZE_HI), (size >> 32) as u32);
        self.write32(decoder_reg(idx, DECODER_TARGET_LO), tl_lo);
        self.write32(decoder_reg(idx, DECODER_TARGET_HI), tl_hi);
        let ctrl = DecoderCtrl(0)
            .with_ig(setup.granularity.enc())
            .with_iw(setup.ways.enc())
            .with_commit(true);
        self.write32(decoder_reg(idx, DECODER_CTRL), ctrl.0);
    }

    /// Clear the commit request of decoder `idx`
    pub fn uncommit_decoder(&self, idx: usize) {
        let off = decoder_reg(idx, DECODER_CTRL);
        let ctrl = DecoderCtrl(self.read32(off)).with_commit(false);
        self.write32(off, ctrl.0);
    }

    /// Return every decoder to its power-on state.
    pub fn reset(&self) {
        let changes: Vec<CommitChange> = {
            let mut state = self.state.lock().unwrap();
            let was: Vec<bool> =
                state.decoders.iter().map(DecoderRegs::committed).collect();
            state.global = HdmGlobalCtrl::default();
            state.decoders.fill(DecoderRegs::default());
            was.into_iter()
                .enumerate()
                .filter(|(_, committed)| *committed)
                .map(|(decoder, _)| CommitChange { decoder, committed: false })
                .collect()
        };
        for change in changes {
            self.notify(change);
        }
    }

    fn notify(&self, change: CommitChange) {
        slog::info!(self.log, "decoder commit change";
            "decoder" => change.decoder,
            "committed" => change.committed,
        );
        if let Some(obs) = self.observer.get().and_then(Weak::upgrade) {
            obs.commit_changed(self.owner, change);
        }
    }

    fn reg_read(&self, state: &HdmState, id: &HdmReg, ro: &mut ReadOp) {
        let dec = |n: &u8| state.decoders.get(*n as usize);
        let val = match id {
            HdmReg::Cap => self.cap.0,
            HdmReg::GlobalCtrl => state.global.0,
            HdmReg::BaseLo(n) => dec(n).map_or(0, |d| d.base_lo),
            HdmReg::BaseHi(n) => dec(n).map_or(0, |d| d.base_hi),
            HdmReg::SizeLo(n) => dec(n).map_or(0, |d| d.size_lo),
            HdmReg::SizeHi(n) => dec(n).map_or(0, |d| d.size_hi),
            HdmReg::Ctrl(n) => dec(n).map_or(0, |d| d.ctrl.0),
            HdmReg::TargetLo(n) => dec(n).map_or(0, |d| d.target_lo),
            HdmReg::TargetHi(n) => dec(n).map_or(0, |d| d.target_hi),
            HdmReg::Reserved => {
                ro.fill(0);
                return;
            }
        };
        ro.write_u32(val);
    }

    fn reg_write(
        &self,
        state: &mut HdmState,
        id: &HdmReg,
        wo: &mut WriteOp,
    ) -> Option<CommitChange> {
        let val = match id {
            HdmReg::Cap | HdmReg::Reserved => return None,
            HdmReg::GlobalCtrl => {
                state.global = HdmGlobalCtrl(wo.read_u32() & 0x3);
                return None;
            }
            _ => wo.read_u32(),
        };

        let n = match id {
            HdmReg::BaseLo(n)
            | HdmReg::BaseHi(n)
            | HdmReg::SizeLo(n)
            | HdmReg::SizeHi(n)
            | HdmReg::Ctrl(n)
            | HdmReg::TargetLo(n)
            | HdmReg::TargetHi(n) => *n as usize,
            _ => return None,
        };
        if n >= state.decoders.len() {
            slog::warn!(self.log, "write to unimplemented decoder";
                "decoder" => n, "register" => ?id);
            return None;
        }
        if let HdmReg::Ctrl(_) = id {
            return self.ctrl_write(state, n, DecoderCtrl(val));
        }

        let dec = &mut state.decoders[n];
        if dec.committed() {
            slog::warn!(self.log, "write to committed decoder ignored";
                "decoder" => n, "register" => ?id, "value" => val);
            return None;
        }
        match id {
            HdmReg::BaseLo(_) => dec.base_lo = val & DECODER_LO_MASK,
            HdmReg::BaseHi(_) => dec.base_hi = val,
            HdmReg::SizeLo(_) => dec.size_lo = val & DECODER_LO_MASK,
            HdmReg::SizeHi(_) => dec.size_hi = val,
            HdmReg::TargetLo(_) if self.owner.is_endpoint() => {
                dec.target_lo = val & DECODER_LO_MASK
            }
            HdmReg::TargetLo(_) => dec.target_lo = val,
            HdmReg::TargetHi(_) => dec.target_hi = val,
            _ => {}
        }
        None
    }

    fn ctrl_write(
        &self,
        state: &mut HdmState,
        n: usize,
        req: DecoderCtrl,
    ) -> Option<CommitChange> {
        let old = state.decoders[n].ctrl;
        if old.committed() && old.lock_on_commit() {
            slog::warn!(self.log, "decoder locked on commit"; "decoder" => n);
            return None;
        }
        if old.committed() && req.commit() {
            // Fields of an active decoder may not change under it
            return None;
        }

        let mut ctrl = DecoderCtrl(req.0 & DECODER_CTRL_WMASK);
        if ctrl.commit() {
            let dec = &state.decoders[n];
            let valid = InterleaveWays::from_enc(ctrl.iw())
                .is_some_and(|ways| self.routable(ways))
                && InterleaveGranularity::from_enc(ctrl.ig()).is_some();
            if valid {
                ctrl.set_committed(true);
                ctrl.set_err(false);
                for (other, d) in state.decoders.iter().enumerate() {
                    if other != n && d.committed() && d.overlaps(dec) {
                        slog::warn!(self.log,
                            "committed decoders overlap, lowest index wins";
                            "decoder" => n,
                            "other" => other,
                        );
                    }
                }
            } else {
                slog::warn!(self.log, "decoder commit with bad interleave";
                    "decoder" => n, "iw" => ctrl.iw(), "ig" => ctrl.ig());
                ctrl.set_committed(false);
                ctrl.set_err(true);
            }
        } else {
            ctrl.set_committed(false);
            ctrl.set_err(false);
        }
        state.decoders[n].ctrl = ctrl;

        (old.committed() != ctrl.committed())
            .then_some(CommitChange { decoder: n, committed: ctrl.committed() })
    }
}
