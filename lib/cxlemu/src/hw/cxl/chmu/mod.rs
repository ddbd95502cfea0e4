// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! CXL Hotness Monitoring Unit.
//!
//! Each instance keeps a ring ("hotlist") of hot units which the guest
//! consumes by advancing HEAD.  Entries are produced either by an external
//! tracker reached over a socket, or locally through [Chmu::push_hot_unit].
//! An epoch timer runs while an instance is enabled; at the end of every
//! epoch the fill and overflow conditions are evaluated and, when newly
//! latched, an MSI is raised on the instance's vector.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use lazy_static::lazy_static;
use slog::Logger;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::topology::ComponentId;
use super::ConfigError;
use crate::common::*;
use crate::intr::MsiNotifier;
use crate::util::regmap::{Flags, RegMap};

pub mod bits;
pub mod tracker;

use bits::*;
use tracker::{RemoteTracker, TrackerCmd};

#[usdt::provider(provider = "cxlemu")]
mod probes {
    fn chmu_epoch(instance: u64, head: u16, tail: u16, irq: u8) {}
    fn chmu_rpc_fail(instance: u64, cmd: u64) {}
}

/// Interleave geometry of one endpoint decoder, as pushed to a tracker.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct DecoderGeometry {
    pub base: u64,
    pub size: u64,
    pub dpa_base: u64,
    /// Number of interleave ways (not the encoding)
    pub ways: u64,
    /// Position of the endpoint within the interleave set
    pub way: u64,
    /// Interleave granularity in bytes
    pub granularity: u64,
}

/// Source of the decoder geometry for the endpoint owning a CHMU.
pub trait GeometrySource: Send + Sync {
    fn decoder_geometry(&self, endpoint: ComponentId) -> Vec<DecoderGeometry>;
}

/// Everything an instance needs from outside the CHMU block.
pub struct ChmuCtx {
    pub msi: Arc<dyn MsiNotifier>,
    pub geometry: OnceLock<Weak<dyn GeometrySource>>,
}
impl ChmuCtx {
    pub fn new(msi: Arc<dyn MsiNotifier>) -> Self {
        Self { msi, geometry: OnceLock::new() }
    }
    fn geometry(&self, endpoint: ComponentId) -> Vec<DecoderGeometry> {
        self.geometry
            .get()
            .and_then(Weak::upgrade)
            .map(|src| src.decoder_geometry(endpoint))
            .unwrap_or_default()
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum CommonReg {
    Cap0,
    Cap1,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum InstReg {
    Cap0,
    Cap1,
    Cap2,
    Cap3,
    Conf0,
    Conf1,
    Conf2,
    Status,
    Head,
    Tail,
    RangeBitmap(u8),
    Hotlist(u16),
    Reserved,
}

lazy_static! {
    static ref COMMON_REGS: RegMap<CommonReg> = {
        let layout = [(CommonReg::Cap0, 8), (CommonReg::Cap1, 8)];
        RegMap::create_packed(INSTANCE_BASE, &layout, None)
    };
    static ref INST_REGS: RegMap<InstReg> = {
        let head = [
            (InstReg::Cap0, 8),
            (InstReg::Cap1, 8),
            (InstReg::Cap2, 8),
            (InstReg::Cap3, 8),
            (InstReg::Reserved, CONF0 - (CAP3 + 8)),
            (InstReg::Conf0, 8),
            (InstReg::Conf1, 8),
            (InstReg::Conf2, 8),
            (InstReg::Reserved, STATUS - (CONF2 + 8)),
            (InstReg::Status, 8),
            (InstReg::Head, 2),
            (InstReg::Tail, 2),
            (InstReg::Reserved, RANGE_CONFIG_BITMAP - (TAIL + 2)),
        ];
        let bitmap =
            (0..BITMAP_ENTRIES as u8).map(|n| (InstReg::RangeBitmap(n), 8));
        let hotlist =
            (0..HOTLIST_ENTRIES as u16).map(|n| (InstReg::Hotlist(n), 8));
        let mut map = RegMap::create_packed_iter(
            INSTANCE_LEN,
            head.into_iter().chain(bitmap).chain(hotlist),
            Some(InstReg::Reserved),
        );
        // Partial writes must not echo latched interrupt bits back as 1s
        map.set_flags(InstReg::Status, Flags::NO_READ_MOD_WRITE);
        map
    };
}

/// CAP0.MSI_N is four bits wide
const MSI_N_LIMIT: usize = 16;
const DEFAULT_UNIT_SIZE: u32 = 12;
const SUPPORTED_UNIT_SIZES: [u32; 2] = [12, 13];

struct InstanceState {
    what: u8,
    randomize_ds: bool,
    int_on_overflow: bool,
    int_on_fill_thresh: bool,
    enabled: bool,
    hotness_thresh: u32,

    unit_size: u32,
    ds_factor: u8,
    reporting_mode: u8,
    epoch_scale: u8,
    epoch_val: u16,
    epoch_ms: u64,

    fill_thresh: u16,
    overflow_set: bool,
    fill_thresh_set: bool,

    head: u16,
    tail: u16,
    hotlist: Vec<u64>,
    range_bitmap: [u64; BITMAP_ENTRIES],

    epochs: u64,
    timer: Option<JoinHandle<()>>,
    /// Bumped whenever the timer is (re)armed or disarmed, so a tick from a
    /// superseded timer task is recognized and dropped.
    timer_gen: u64,
}
impl Default for InstanceState {
    fn default() -> Self {
        let (scale, val) = MIN_EPOCH;
        Self {
            what: 0,
            randomize_ds: false,
            int_on_overflow: false,
            int_on_fill_thresh: false,
            enabled: false,
            hotness_thresh: 0,
            unit_size: DEFAULT_UNIT_SIZE,
            ds_factor: 0,
            reporting_mode: 0,
            epoch_scale: scale as u8,
            epoch_val: val,
            epoch_ms: scale.to_ms(val),
            fill_thresh: 0,
            overflow_set: false,
            fill_thresh_set: false,
            head: 0,
            tail: 0,
            hotlist: vec![0; HOTLIST_ENTRIES],
            range_bitmap: [0; BITMAP_ENTRIES],
            epochs: 0,
            timer: None,
            timer_gen: 0,
        }
    }
}
impl InstanceState {
    fn clear_ring(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.hotlist.fill(0);
    }
    fn occupancy(&self) -> usize {
        let (head, tail) = (self.head as usize, self.tail as usize);
        (tail + HOTLIST_ENTRIES - head) % HOTLIST_ENTRIES
    }
    fn is_full(&self) -> bool {
        (self.tail as usize + 1) % HOTLIST_ENTRIES == self.head as usize
    }
    fn disable(&mut self) {
        self.enabled = false;
        self.disarm();
    }
    fn disarm(&mut self) {
        self.timer_gen += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// One CHMU register block, with [INSTANCES_PER_BLOCK] instances.
pub struct Chmu {
    me: Weak<Chmu>,
    endpoint: ComponentId,
    msi_base: u16,
    instances: Vec<Mutex<InstanceState>>,
    tracker: Option<Mutex<RemoteTracker>>,
    ctx: ChmuCtx,
    rt: Handle,
    log: Logger,
}

impl Chmu {
    /// Create the CHMU block of `endpoint`.  Instance `n` interrupts on
    /// vector `msi_base + n`.
    ///
    /// With a `tracker` address the tracker is connected and told the
    /// hotlist and unit sizes before this returns.
    pub fn new(
        endpoint: ComponentId,
        msi_base: u16,
        tracker: Option<SocketAddr>,
        msi: Arc<dyn MsiNotifier>,
        rt: Handle,
        log: Logger,
    ) -> Result<Arc<Self>, ConfigError> {
        if msi_base as usize + INSTANCES_PER_BLOCK > MSI_N_LIMIT {
            return Err(ConfigError::MsiVector(msi_base));
        }

        let mut remote = match tracker {
            Some(addr) => Some(RemoteTracker::connect(addr)?),
            None => None,
        };
        if let Some(conn) = remote.as_mut() {
            for n in 0..INSTANCES_PER_BLOCK {
                conn.request(
                    n,
                    TrackerCmd::SetHotlistSize,
                    HOTLIST_ENTRIES as u64,
                    0,
                )?;
                conn.request(
                    n,
                    TrackerCmd::SetGranualSize,
                    1 << DEFAULT_UNIT_SIZE,
                    0,
                )?;
            }
            slog::info!(log, "connected to hotness tracker";
                "addr" => %conn.addr());
        }

        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            endpoint,
            msi_base,
            instances: (0..INSTANCES_PER_BLOCK)
                .map(|_| Mutex::new(InstanceState::default()))
                .collect(),
            tracker: remote.map(Mutex::new),
            ctx: ChmuCtx::new(msi),
            rt,
            log,
        }))
    }

    /// Install the source of decoder geometry pushed to the tracker when an
    /// instance is enabled.
    pub fn set_geometry_source(&self, src: Weak<dyn GeometrySource>) {
        let _ = self.ctx.geometry.set(src);
    }

    pub fn endpoint(&self) -> ComponentId {
        self.endpoint
    }
    pub fn is_remote(&self) -> bool {
        self.tracker.is_some()
    }
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }
    /// Size in bytes of the register block
    pub fn size(&self) -> usize {
        chmu_block_size(self.instances.len())
    }

    pub fn is_enabled(&self, idx: usize) -> bool {
        self.instances.get(idx).map_or(false, |i| i.lock().unwrap().enabled)
    }
    /// Number of epochs which have ended on instance `idx`
    pub fn epochs(&self, idx: usize) -> u64 {
        self.instances.get(idx).map_or(0, |i| i.lock().unwrap().epochs)
    }
    /// Local (head, tail) mirror of instance `idx`
    pub fn ring(&self, idx: usize) -> Option<(u16, u16)> {
        let st = self.instances.get(idx)?.lock().unwrap();
        Some((st.head, st.tail))
    }

    /// Append `entry` to the hotlist of instance `idx`.  Returns false, and
    /// drops the entry, when the ring is full.
    pub fn push_hot_unit(&self, idx: usize, entry: u64) -> bool {
        let Some(inst) = self.instances.get(idx) else {
            return false;
        };
        let mut st = inst.lock().unwrap();
        if st.is_full() {
            return false;
        }
        let tail = st.tail as usize;
        st.hotlist[tail] = entry;
        st.tail = ((tail + 1) % HOTLIST_ENTRIES) as u16;
        true
    }

    /// End the current epoch of instance `idx` now, as its timer would.
    /// Returns whether the instance is still enabled afterwards.
    pub fn epoch_tick(&self, idx: usize) -> bool {
        let Some(inst) = self.instances.get(idx) else {
            return false;
        };
        let mut st = inst.lock().unwrap();
        st.enabled && self.end_epoch(idx, &mut st)
    }

    /// Service a register access.  Offsets are relative to the block start.
    pub fn reg_rw(&self, mut rwo: RWOp) {
        let (off, len) = (rwo.offset(), rwo.len());
        if !matches!(len, 1 | 2 | 4 | 8) || off % len != 0 {
            slog::warn!(self.log, "guest error: bad CHMU access";
                "offset" => off, "len" => len, "write" => rwo.is_write());
            if let RWOp::Read(ro) = rwo {
                ro.fill(0);
            }
            return;
        }

        if off < INSTANCE_BASE {
            COMMON_REGS.process(&mut rwo, |id, rwo| match rwo {
                RWOp::Read(ro) => self.common_read(id, ro),
                RWOp::Write(_) => {}
            });
            return;
        }

        let idx = (off - INSTANCE_BASE) / INSTANCE_LEN;
        let Some(inst) = self.instances.get(idx) else {
            slog::warn!(self.log, "guest error: access beyond last instance";
                "offset" => off);
            if let RWOp::Read(ro) = rwo {
                ro.fill(0);
            }
            return;
        };
        let inner = off - INSTANCE_BASE - idx * INSTANCE_LEN;

        let mut st = inst.lock().unwrap();
        match rwo {
            RWOp::Read(ro) => {
                let mut child = ReadOp::new_child(inner, ro, ..);
                INST_REGS.process(&mut RWOp::Read(&mut child), |id, rwo| {
                    self.inst_rw(idx, &mut st, id, rwo)
                });
            }
            RWOp::Write(wo) => {
                let mut child = WriteOp::new_child(inner, wo, ..);
                INST_REGS.process(&mut RWOp::Write(&mut child), |id, rwo| {
                    self.inst_rw(idx, &mut st, id, rwo)
                });
            }
        }
    }

    pub fn read64(&self, offset: usize) -> u64 {
        let mut buf = [0u8; 8];
        self.reg_rw(RWOp::Read(&mut ReadOp::from_buf(offset, &mut buf)));
        u64::from_le_bytes(buf)
    }
    pub fn write64(&self, offset: usize, val: u64) {
        let buf = val.to_le_bytes();
        self.reg_rw(RWOp::Write(&mut WriteOp::from_buf(offset, &buf)));
    }

    fn common_read(&self, id: &CommonReg, ro: &mut ReadOp) {
        let val = match id {
            CommonReg::Cap0 => {
                CommonCap0(0)
                    .with_version(CHMU_VERSION)
                    .with_num_instances(self.instances.len() as u8)
                    .0
            }
            CommonReg::Cap1 => {
                CommonCap1(0).with_instance_length(INSTANCE_LEN as u16).0
            }
        };
        ro.write_u64(val);
    }

    fn cap0(&self, idx: usize) -> Cap0 {
        let (max_scale, max_val) = MAX_EPOCH;
        let (min_scale, min_val) = MIN_EPOCH;
        Cap0(0)
            .with_msi_n(self.vector(idx) as u8)
            .with_overflow_int(true)
            .with_level_int(true)
            .with_epoch_type(EPOCH_TYPE_GLOBAL)
            .with_tracked_nontee_r(true)
            .with_tracked_nontee_w(true)
            .with_tracked_nontee_rw(true)
            .with_max_epoch_scale(max_scale as u8)
            .with_max_epoch_val(max_val)
            .with_min_epoch_scale(min_scale as u8)
            .with_min_epoch_val(min_val)
            .with_hotlist_size(HOTLIST_ENTRIES as u16)
    }

    fn cap1() -> Cap1 {
        let unit_sizes = SUPPORTED_UNIT_SIZES
            .iter()
            .fold(0u32, |acc, log2| acc | 1 << (log2 - 8));
        Cap1(0)
            .with_unit_sizes(unit_sizes)
            // down-sampling by 2^0 only
            .with_ds_factors(1 << 1)
            .with_epoch_based(true)
            .with_always_on(false)
            .with_randomized_ds(true)
            .with_overlapping_ranges(true)
            .with_insert_after_clear(false)
    }

    fn vector(&self, idx: usize) -> u16 {
        self.msi_base + idx as u16
    }

    fn inst_rw(
        &self,
        idx: usize,
        st: &mut InstanceState,
        id: &InstReg,
        rwo: RWOp,
    ) {
        match rwo {
            RWOp::Read(ro) => self.inst_read(idx, st, id, ro),
            RWOp::Write(wo) => self.inst_write(idx, st, id, wo),
        }
    }

    fn inst_read(
        &self,
        idx: usize,
        st: &mut InstanceState,
        id: &InstReg,
        ro: &mut ReadOp,
    ) {
        match id {
            InstReg::Cap0 => ro.write_u64(self.cap0(idx).0),
            InstReg::Cap1 => ro.write_u64(Self::cap1().0),
            InstReg::Cap2 => ro.write_u64(RANGE_CONFIG_BITMAP as u64),
            InstReg::Cap3 => ro.write_u64(HOTLIST as u64),
            InstReg::Conf0 => ro.write_u64(
                Conf0(0)
                    .with_what(st.what)
                    .with_randomize_ds(st.randomize_ds)
                    .with_int_on_overflow(st.int_on_overflow)
                    .with_int_on_fill_thresh(st.int_on_fill_thresh)
                    .with_enable(st.enabled)
                    .with_hotness_threshold(st.hotness_thresh)
                    .0,
            ),
            InstReg::Conf1 => ro.write_u64(
                Conf1(0)
                    .with_unit_size(st.unit_size)
                    .with_ds_factor(st.ds_factor)
                    .with_reporting_mode(st.reporting_mode)
                    .with_epoch_scale(st.epoch_scale)
                    .with_epoch_val(st.epoch_val)
                    .0,
            ),
            InstReg::Conf2 => ro
                .write_u64(Conf2(0).with_fill_thresh(st.fill_thresh).0),
            InstReg::Status => ro.write_u64(
                Status(0)
                    .with_enabled(st.enabled)
                    .with_counter_width(COUNTER_WIDTH)
                    .with_overflow_int(st.overflow_set)
                    .with_level_int(st.fill_thresh_set)
                    .0,
            ),
            InstReg::Head => {
                let val = if self.is_remote() {
                    self.rpc(idx, st, TrackerCmd::QueryHead, 0, 0)
                        .map_or(0, |v| v as u16)
                } else {
                    st.head
                };
                ro.write_u16(val);
            }
            InstReg::Tail => {
                let val = if self.is_remote() {
                    self.rpc(idx, st, TrackerCmd::QueryTail, 0, 0)
                        .map_or(0, |v| v as u16)
                } else {
                    st.tail
                };
                ro.write_u16(val);
            }
            InstReg::RangeBitmap(n) => {
                ro.write_u64(st.range_bitmap[*n as usize]);
            }
            InstReg::Hotlist(n) => {
                let val = if self.is_remote() {
                    let entry = *n as u64;
                    self.rpc(idx, st, TrackerCmd::QueryHotlistEntry, entry, 0)
                        .unwrap_or(0)
                } else {
                    st.hotlist[*n as usize]
                };
                ro.write_u64(val);
            }
            InstReg::Reserved => ro.fill(0),
        }
    }

    fn inst_write(
        &self,
        idx: usize,
        st: &mut InstanceState,
        id: &InstReg,
        wo: &mut WriteOp,
    ) {
        match id {
            InstReg::Cap0
            | InstReg::Cap1
            | InstReg::Cap2
            | InstReg::Cap3
            | InstReg::Hotlist(_)
            | InstReg::Reserved => {}
            InstReg::Conf0 => self.conf0_write(idx, st, Conf0(wo.read_u64())),
            InstReg::Conf1 => self.conf1_write(idx, st, Conf1(wo.read_u64())),
            InstReg::Conf2 => {
                st.fill_thresh = Conf2(wo.read_u64()).fill_thresh();
            }
            InstReg::Status => {
                let val = Status(wo.read_u64());
                if val.overflow_int() {
                    st.overflow_set = false;
                }
                if val.level_int() {
                    st.fill_thresh_set = false;
                }
            }
            InstReg::Head => {
                let val = wo.read_u16();
                st.head = val % HOTLIST_ENTRIES as u16;
                if self.is_remote() {
                    let cmd = TrackerCmd::SetHead;
                    let _ = self.rpc(idx, st, cmd, val as u64, 0);
                }
            }
            InstReg::Tail => {
                st.tail = wo.read_u16() % HOTLIST_ENTRIES as u16;
            }
            InstReg::RangeBitmap(n) => {
                st.range_bitmap[*n as usize] = wo.read_u64();
            }
        }
    }

    fn conf0_write(&self, idx: usize, st: &mut InstanceState, val: Conf0) {
        let thresh_changed = st.hotness_thresh != val.hotness_threshold();
        st.what = val.what();
        st.randomize_ds = val.randomize_ds();
        st.int_on_overflow = val.int_on_overflow();
        st.int_on_fill_thresh = val.int_on_fill_thresh();
        st.hotness_thresh = val.hotness_threshold();
        if val.reset() {
            st.clear_ring();
        }

        match (st.enabled, val.enable()) {
            (false, true) => self.enable(idx, st),
            (true, false) => {
                slog::info!(self.log, "CHMU instance disabled";
                    "instance" => idx);
                st.disable();
                if self.is_remote() {
                    let _ = self.rpc(idx, st, TrackerCmd::SetEnabled, 0, 0);
                }
            }
            (true, true) if thresh_changed && self.is_remote() => {
                let thresh = st.hotness_thresh as u64;
                let _ = self.rpc(idx, st, TrackerCmd::SetThreshold, thresh, 0);
            }
            _ => {}
        }
    }

    fn conf1_write(&self, idx: usize, st: &mut InstanceState, val: Conf1) {
        if SUPPORTED_UNIT_SIZES.contains(&val.unit_size()) {
            st.unit_size = val.unit_size();
        } else {
            slog::warn!(self.log, "guest error: unsupported CHMU unit size";
                "instance" => idx, "unit_size" => val.unit_size());
        }
        st.ds_factor = val.ds_factor();
        st.reporting_mode = val.reporting_mode();

        let Some(scale) = EpochScale::from_repr(val.epoch_scale()) else {
            slog::warn!(self.log, "guest error: unknown epoch scale ignored";
                "instance" => idx, "scale" => val.epoch_scale());
            return;
        };
        st.epoch_scale = val.epoch_scale();
        st.epoch_val = val.epoch_val();

        let (min, max) = (
            MIN_EPOCH.0.to_ms(MIN_EPOCH.1),
            MAX_EPOCH.0.to_ms(MAX_EPOCH.1),
        );
        let ms = scale.to_ms(val.epoch_val());
        if !(min..=max).contains(&ms) {
            slog::warn!(self.log, "guest error: epoch length out of range";
                "instance" => idx, "ms" => ms);
        }
        st.epoch_ms = ms.clamp(min, max);
    }

    fn enable(&self, idx: usize, st: &mut InstanceState) {
        st.enabled = true;
        if self.is_remote() && self.push_config(idx, st).is_none() {
            // the failed request already disabled the instance
            return;
        }
        slog::info!(self.log, "CHMU instance enabled";
            "instance" => idx, "epoch_ms" => st.epoch_ms);
        self.arm(idx, st);
    }

    /// Tell the tracker everything it needs to start an epoch.
    fn push_config(&self, idx: usize, st: &mut InstanceState) -> Option<()> {
        for (n, geo) in self.ctx.geometry(self.endpoint).iter().enumerate() {
            let n = n as u64;
            self.rpc(idx, st, TrackerCmd::SetHpaBase, geo.base, n)?;
            self.rpc(idx, st, TrackerCmd::SetHpaSize, geo.size, n)?;
            self.rpc(idx, st, TrackerCmd::SetDpaBase, geo.dpa_base, n)?;
            self.rpc(idx, st, TrackerCmd::SetInterleaveWays, geo.ways, n)?;
            self.rpc(idx, st, TrackerCmd::SetInterleaveWay, geo.way, n)?;
            let gran = geo.granularity;
            self.rpc(idx, st, TrackerCmd::SetInterleaveGran, gran, n)?;
        }
        let unit = 1u64 << st.unit_size;
        self.rpc(idx, st, TrackerCmd::SetGranualSize, unit, 0)?;
        let thresh = st.hotness_thresh as u64;
        self.rpc(idx, st, TrackerCmd::SetThreshold, thresh, 0)?;
        self.rpc(idx, st, TrackerCmd::SetEnabled, 1, 0)?;
        Some(())
    }

    /// Issue a tracker request on behalf of instance `idx`.  A failure is
    /// logged and takes the instance out of service.
    fn rpc(
        &self,
        idx: usize,
        st: &mut InstanceState,
        cmd: TrackerCmd,
        param: u64,
        param2: u64,
    ) -> Option<u64> {
        let tracker = self.tracker.as_ref()?;
        let res = tracker.lock().unwrap().request(idx, cmd, param, param2);
        match res {
            Ok(val) => Some(val),
            Err(e) => {
                probes::chmu_rpc_fail!(|| (idx as u64, cmd as u64));
                slog::error!(self.log, "tracker request failed, disabling";
                    "instance" => idx,
                    "error" => %e,
                );
                st.disable();
                None
            }
        }
    }

    /// Close out an epoch on an enabled instance.  Returns false if the
    /// instance was disabled along the way.
    fn end_epoch(&self, idx: usize, st: &mut InstanceState) -> bool {
        if self.is_remote() {
            let res = self
                .rpc(idx, st, TrackerCmd::SignalEpochEnd, 0, 0)
                .and_then(|_| self.rpc(idx, st, TrackerCmd::QueryTail, 0, 0));
            match res {
                Some(tail) => {
                    st.tail = (tail % HOTLIST_ENTRIES as u64) as u16;
                }
                None => return false,
            }
        }

        let mut irq = false;
        if st.int_on_fill_thresh
            && !st.fill_thresh_set
            && st.occupancy() > st.fill_thresh as usize
        {
            st.fill_thresh_set = true;
            irq = true;
        }
        if st.int_on_overflow && !st.overflow_set && st.is_full() {
            st.overflow_set = true;
            irq = true;
        }
        st.epochs += 1;
        probes::chmu_epoch!(|| (idx as u64, st.head, st.tail, irq as u8));

        if irq {
            slog::debug!(self.log, "CHMU interrupt";
                "instance" => idx,
                "overflow" => st.overflow_set,
                "level" => st.fill_thresh_set,
            );
            self.ctx.msi.notify(self.vector(idx));
        }
        true
    }

    /// Timer callback.  Returns the delay until the next epoch end, or None
    /// if this timer should stop.
    fn fire(&self, idx: usize, gen: u64) -> Option<u64> {
        let mut st = self.instances.get(idx)?.lock().unwrap();
        if !st.enabled || st.timer_gen != gen {
            return None;
        }
        self.end_epoch(idx, &mut st).then_some(st.epoch_ms)
    }

    fn arm(&self, idx: usize, st: &mut InstanceState) {
        st.disarm();
        let gen = st.timer_gen;
        let me = self.me.clone();
        let remote = self.is_remote();
        let mut period = st.epoch_ms;

        st.timer = Some(self.rt.spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(period)).await;
                let Some(chmu) = me.upgrade() else {
                    return;
                };
                let next = if remote {
                    // the tracker socket blocks, keep it off the runtime
                    tokio::task::spawn_blocking(move || chmu.fire(idx, gen))
                        .await
                        .ok()
                        .flatten()
                } else {
                    chmu.fire(idx, gen)
                };
                match next {
                    Some(ms) => period = ms,
                    None => return,
                }
            }
        }));
    }

    fn resume_timers(&self) {
        for (idx, inst) in self.instances.iter().enumerate() {
            let mut st = inst.lock().unwrap();
            if st.enabled {
                self.arm(idx, &mut st);
            }
        }
    }
}

impl Lifecycle for Chmu {
    fn type_name(&self) -> &'static str {
        "cxl-chmu"
    }
    fn pause(&self) {
        for inst in self.instances.iter() {
            inst.lock().unwrap().disarm();
        }
    }
    fn resume(&self) {
        self.resume_timers();
    }
    fn reset(&self) {
        for (idx, inst) in self.instances.iter().enumerate() {
            let mut st = inst.lock().unwrap();
            let was_enabled = st.enabled;
            st.disarm();
            let gen = st.timer_gen;
            *st = InstanceState { timer_gen: gen, ..Default::default() };
            if was_enabled && self.is_remote() {
                let _ = self.rpc(idx, &mut st, TrackerCmd::SetEnabled, 0, 0);
            }
        }
    }
    fn halt(&self) {
        for inst in self.instances.iter() {
            inst.lock().unwrap().disable();
        }
    }
}

impl Drop for Chmu {
    fn drop(&mut self) {
        for inst in self.instances.iter() {
            if let Ok(mut st) = inst.lock() {
                st.disarm();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::tracker::{Request, REQUEST_LEN};
    use super::*;
    use crate::intr::MsiRecorder;

    use proptest::prelude::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn test_log() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn test_rt() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap()
    }

    fn local_chmu(rt: Handle) -> (Arc<Chmu>, Arc<MsiRecorder>) {
        let msi = Arc::new(MsiRecorder::new(test_log()));
        let chmu =
            Chmu::new(ComponentId::new(), 2, None, msi.clone(), rt, test_log())
                .unwrap();
        (chmu, msi)
    }

    const I0: usize = INSTANCE_BASE;

    fn read16(chmu: &Chmu, offset: usize) -> u16 {
        let mut buf = [0u8; 2];
        chmu.reg_rw(RWOp::Read(&mut ReadOp::from_buf(offset, &mut buf)));
        u16::from_le_bytes(buf)
    }
    fn write16(chmu: &Chmu, offset: usize, val: u16) {
        let buf = val.to_le_bytes();
        chmu.reg_rw(RWOp::Write(&mut WriteOp::from_buf(offset, &buf)));
    }

    #[test]
    fn capabilities() {
        let rt = test_rt();
        let (chmu, _) = local_chmu(rt.handle().clone());

        let common = CommonCap0(chmu.read64(COMMON_CAP0));
        assert_eq!(common.version(), 1);
        assert_eq!(common.num_instances() as usize, chmu.instance_count());
        assert_eq!(
            CommonCap1(chmu.read64(COMMON_CAP1)).instance_length(),
            0x2170
        );

        let cap0 = Cap0(chmu.read64(I0 + CAP0));
        assert_eq!(cap0.msi_n(), 2);
        assert_eq!(cap0.hotlist_size(), 1024);
        assert_eq!(cap0.min_epoch_scale(), EpochScale::Ms100 as u8);
        assert_eq!(cap0.max_epoch_val(), 100);
        assert!(!cap0.tracked_all_rw());

        let cap1 = Cap1(chmu.read64(I0 + CAP1));
        assert_eq!(cap1.unit_sizes(), 0x30);
        assert_eq!(cap1.ds_factors(), 0x2);
        assert_eq!(chmu.read64(I0 + CAP2), 0x70);
        assert_eq!(chmu.read64(I0 + CAP3), 0x170);

        let status = Status(chmu.read64(I0 + STATUS));
        assert_eq!(status.counter_width(), 16);
        assert!(!status.enabled());
    }

    #[test]
    fn reset_defaults() {
        let rt = test_rt();
        let (chmu, _) = local_chmu(rt.handle().clone());
        let conf1 = Conf1(chmu.read64(I0 + CONF1));
        assert_eq!(conf1.unit_size(), 12);
        assert_eq!(conf1.epoch_scale(), 4);
        assert_eq!(conf1.epoch_val(), 1);
    }

    #[test]
    fn bad_msi_vector() {
        let rt = test_rt();
        let msi = Arc::new(MsiRecorder::new(test_log()));
        let res = Chmu::new(
            ComponentId::new(),
            16,
            None,
            msi,
            rt.handle().clone(),
            test_log(),
        );
        assert!(matches!(res, Err(ConfigError::MsiVector(16))));
    }

    #[test]
    fn bad_access_is_benign() {
        let rt = test_rt();
        let (chmu, _) = local_chmu(rt.handle().clone());
        chmu.write64(I0 + CONF2, 0x7);

        // unaligned
        let mut buf = [0xffu8; 4];
        chmu.reg_rw(RWOp::Read(&mut ReadOp::from_buf(I0 + CONF2 + 2, &mut buf)));
        assert_eq!(buf, [0; 4]);
        // odd size
        let mut buf = [0xffu8; 3];
        chmu.reg_rw(RWOp::Read(&mut ReadOp::from_buf(I0 + CONF2, &mut buf)));
        assert_eq!(buf, [0; 3]);
        let buf = [0xffu8; 3];
        chmu.reg_rw(RWOp::Write(&mut WriteOp::from_buf(I0 + CONF2, &buf)));
        assert_eq!(chmu.read64(I0 + CONF2), 0x7);
        // past the last instance
        assert_eq!(chmu.read64(chmu.size()), 0);
    }

    #[test]
    fn head_tail_halfwords() {
        let rt = test_rt();
        let (chmu, _) = local_chmu(rt.handle().clone());

        write16(&chmu, I0 + HEAD, 5);
        write16(&chmu, I0 + TAIL, 1030);
        assert_eq!(chmu.ring(0), Some((5, 6)));
        assert_eq!(read16(&chmu, I0 + TAIL), 6);

        // a 4-byte read covers both
        let mut buf = [0u8; 4];
        chmu.reg_rw(RWOp::Read(&mut ReadOp::from_buf(I0 + HEAD, &mut buf)));
        assert_eq!(u32::from_le_bytes(buf), 0x0006_0005);
    }

    #[test]
    fn range_bitmap_is_stored() {
        let rt = test_rt();
        let (chmu, _) = local_chmu(rt.handle().clone());
        chmu.write64(I0 + RANGE_CONFIG_BITMAP + 8 * 31, 0xdead_beef);
        assert_eq!(
            chmu.read64(I0 + RANGE_CONFIG_BITMAP + 8 * 31),
            0xdead_beef
        );
        assert_eq!(chmu.read64(I0 + RANGE_CONFIG_BITMAP), 0);
    }

    #[test]
    fn epoch_length() {
        let rt = test_rt();
        let (chmu, _) = local_chmu(rt.handle().clone());
        let conf1 = |scale, val| {
            Conf1(0)
                .with_unit_size(13)
                .with_epoch_scale(scale)
                .with_epoch_val(val)
                .0
        };

        chmu.write64(I0 + CONF1, conf1(3, 50));
        let st = chmu.instances[0].lock().unwrap().epoch_ms;
        assert_eq!(st, 500);

        // below the advertised minimum
        chmu.write64(I0 + CONF1, conf1(1, 20));
        assert_eq!(chmu.instances[0].lock().unwrap().epoch_ms, 100);

        // unknown scale leaves the length alone
        chmu.write64(I0 + CONF1, conf1(7, 20));
        let read = Conf1(chmu.read64(I0 + CONF1));
        assert_eq!((read.epoch_scale(), read.epoch_val()), (1, 20));
        assert_eq!(read.unit_size(), 13);

        // unsupported unit size
        chmu.write64(I0 + CONF1, Conf1(0).with_unit_size(20).0);
        assert_eq!(Conf1(chmu.read64(I0 + CONF1)).unit_size(), 13);
    }

    #[test]
    fn control_reset() {
        let rt = test_rt();
        let (chmu, _) = local_chmu(rt.handle().clone());
        for n in 0..10 {
            assert!(chmu.push_hot_unit(0, 0x1000 * n));
        }
        assert_eq!(chmu.read64(I0 + HOTLIST + 8 * 3), 0x3000);

        chmu.write64(I0 + CONF0, Conf0(0).with_reset(true).0);
        assert_eq!(chmu.ring(0), Some((0, 0)));
        assert_eq!(chmu.read64(I0 + HOTLIST + 8 * 3), 0);
        assert!(!chmu.is_enabled(0));

        // reset and enable in one write
        chmu.push_hot_unit(0, 1);
        chmu.write64(I0 + CONF0, Conf0(0).with_reset(true).with_enable(true).0);
        assert_eq!(chmu.ring(0), Some((0, 0)));
        assert!(chmu.is_enabled(0));
        assert!(!Conf0(chmu.read64(I0 + CONF0)).reset());
    }

    #[test]
    fn status_write_one_to_clear() {
        let rt = test_rt();
        let (chmu, msi) = local_chmu(rt.handle().clone());
        let conf0 = Conf0(0).with_int_on_overflow(true).with_int_on_fill_thresh(true);
        chmu.write64(I0 + CONF0, conf0.0);
        chmu.write64(I0 + CONF2, 3);

        for n in 0..(HOTLIST_ENTRIES as u64 - 1) {
            assert!(chmu.push_hot_unit(0, n));
        }
        assert!(!chmu.push_hot_unit(0, 0));

        // ticks only run while enabled
        assert!(!chmu.epoch_tick(0));
        chmu.instances[0].lock().unwrap().enabled = true;
        assert!(chmu.epoch_tick(0));
        assert_eq!(msi.sent(), vec![2]);

        // both latched, a second epoch does not re-raise
        assert!(chmu.epoch_tick(0));
        assert_eq!(msi.count(), 1);

        // writing 0 changes nothing, even disabled
        chmu.instances[0].lock().unwrap().enabled = false;
        chmu.write64(I0 + STATUS, 0);
        let status = Status(chmu.read64(I0 + STATUS));
        assert!(status.overflow_int() && status.level_int());

        chmu.write64(I0 + STATUS, Status(0).with_level_int(true).0);
        let status = Status(chmu.read64(I0 + STATUS));
        assert!(status.overflow_int() && !status.level_int());

        // partial write to the high half clears overflow alone
        let buf = [0x01u8];
        chmu.reg_rw(RWOp::Write(&mut WriteOp::from_buf(I0 + STATUS + 5, &buf)));
        let status = Status(chmu.read64(I0 + STATUS));
        assert!(!status.overflow_int() && !status.level_int());
    }

    #[test]
    fn fill_threshold_wraps() {
        let rt = test_rt();
        let (chmu, msi) = local_chmu(rt.handle().clone());
        chmu.write64(I0 + CONF0, Conf0(0).with_int_on_fill_thresh(true).0);
        chmu.write64(I0 + CONF2, 4);
        chmu.instances[0].lock().unwrap().enabled = true;

        // occupancy 4 across the wrap point, not above threshold
        write16(&chmu, I0 + HEAD, 1022);
        write16(&chmu, I0 + TAIL, 1022);
        for n in 0..4 {
            chmu.push_hot_unit(0, n);
        }
        assert_eq!(chmu.ring(0), Some((1022, 2)));
        chmu.epoch_tick(0);
        assert_eq!(msi.count(), 0);

        chmu.push_hot_unit(0, 4);
        chmu.epoch_tick(0);
        assert_eq!(msi.sent(), vec![2]);
        assert!(Status(chmu.read64(I0 + STATUS)).level_int());
    }

    #[tokio::test(start_paused = true)]
    async fn epoch_timer() {
        let (chmu, _) = local_chmu(Handle::current());
        chmu.write64(I0 + CONF0, Conf0(0).with_enable(true).0);
        assert!(Status(chmu.read64(I0 + STATUS)).enabled());

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(chmu.epochs(0), 3);

        chmu.write64(I0 + CONF0, 0);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(chmu.epochs(0), 3);

        // re-enable with a longer epoch
        let conf1 = Conf1(0).with_unit_size(12).with_epoch_scale(5).with_epoch_val(2);
        chmu.write64(I0 + CONF1, conf1.0);
        chmu.write64(I0 + CONF0, Conf0(0).with_enable(true).0);
        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert_eq!(chmu.epochs(0), 5);

        chmu.pause();
        tokio::time::sleep(Duration::from_millis(5000)).await;
        assert_eq!(chmu.epochs(0), 5);
        chmu.resume();
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(chmu.epochs(0), 6);

        chmu.reset();
        assert!(!chmu.is_enabled(0));
        tokio::time::sleep(Duration::from_millis(5000)).await;
        assert_eq!(chmu.epochs(0), 0);
    }

    /// Answer tracker requests, logging each, until `fail_on` is seen.
    fn mock_tracker(
        fail_on: Option<TrackerCmd>,
        tail: u64,
    ) -> (SocketAddr, std::thread::JoinHandle<Vec<Request>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut seen = Vec::new();
            let mut buf = [0u8; REQUEST_LEN];
            while conn.read_exact(&mut buf).is_ok() {
                let req = Request::decode(&buf).unwrap();
                seen.push(req);
                if Some(req.cmd) == fail_on {
                    break;
                }
                let reply = match req.cmd {
                    TrackerCmd::QueryTail => tail,
                    TrackerCmd::QueryHead => 7,
                    TrackerCmd::QueryHotlistEntry => 0x1000 + req.param,
                    _ => 0,
                };
                if conn.write_all(&reply.to_le_bytes()).is_err() {
                    break;
                }
            }
            seen
        });
        (addr, handle)
    }

    struct FixedGeometry(Vec<DecoderGeometry>);
    impl GeometrySource for FixedGeometry {
        fn decoder_geometry(&self, _: ComponentId) -> Vec<DecoderGeometry> {
            self.0.clone()
        }
    }

    #[test]
    fn remote_tracker() {
        let rt = test_rt();
        let (addr, server) = mock_tracker(None, 1029);
        let msi = Arc::new(MsiRecorder::new(test_log()));
        let chmu = Chmu::new(
            ComponentId::new(),
            0,
            Some(addr),
            msi,
            rt.handle().clone(),
            test_log(),
        )
        .unwrap();
        let geo: Arc<dyn GeometrySource> =
            Arc::new(FixedGeometry(vec![DecoderGeometry {
                base: 0x10_0000_0000,
                size: 0x4000_0000,
                dpa_base: 0,
                ways: 2,
                way: 1,
                granularity: 256,
            }]));
        chmu.set_geometry_source(Arc::downgrade(&geo));

        chmu.write64(I0 + CONF0, Conf0(0).with_enable(true).with_hotness_threshold(9).0);
        assert_eq!(read16(&chmu, I0 + HEAD), 7);
        assert_eq!(chmu.read64(I0 + HOTLIST + 8 * 2), 0x1002);
        assert!(chmu.epoch_tick(0));
        assert_eq!(chmu.ring(0), Some((0, 5)));
        chmu.write64(I0 + CONF0, 0);
        drop(chmu);

        let cmds: Vec<(TrackerCmd, u64, u64)> = server
            .join()
            .unwrap()
            .into_iter()
            .map(|r| (r.cmd, r.param, r.param2))
            .collect();
        use TrackerCmd::*;
        assert_eq!(
            cmds,
            vec![
                (SetHotlistSize, 1024, 0),
                (SetGranualSize, 4096, 0),
                (SetHpaBase, 0x10_0000_0000, 0),
                (SetHpaSize, 0x4000_0000, 0),
                (SetDpaBase, 0, 0),
                (SetInterleaveWays, 2, 0),
                (SetInterleaveWay, 1, 0),
                (SetInterleaveGran, 256, 0),
                (SetGranualSize, 4096, 0),
                (SetThreshold, 9, 0),
                (SetEnabled, 1, 0),
                (QueryHead, 0, 0),
                (QueryHotlistEntry, 2, 0),
                (SignalEpochEnd, 0, 0),
                (QueryTail, 0, 0),
                (SetEnabled, 0, 0),
            ]
        );
    }

    #[test]
    fn rpc_failure_disables() {
        let rt = test_rt();
        let (addr, server) = mock_tracker(Some(TrackerCmd::SignalEpochEnd), 0);
        let msi = Arc::new(MsiRecorder::new(test_log()));
        let chmu = Chmu::new(
            ComponentId::new(),
            0,
            Some(addr),
            msi,
            rt.handle().clone(),
            test_log(),
        )
        .unwrap();

        chmu.write64(I0 + CONF0, Conf0(0).with_enable(true).0);
        assert!(chmu.is_enabled(0));
        assert!(!chmu.epoch_tick(0));
        assert!(!chmu.is_enabled(0));
        assert_eq!(chmu.epochs(0), 0);
        server.join().unwrap();

        // with the tracker gone, reads fall back to zero
        assert_eq!(chmu.read64(I0 + HOTLIST), 0);
    }

    #[test]
    fn tracker_handshake_failure() {
        let rt = test_rt();
        let (addr, server) = mock_tracker(Some(TrackerCmd::SetHotlistSize), 0);
        let msi = Arc::new(MsiRecorder::new(test_log()));
        let res = Chmu::new(
            ComponentId::new(),
            0,
            Some(addr),
            msi,
            rt.handle().clone(),
            test_log(),
        );
        assert!(matches!(res, Err(ConfigError::Tracker(_))));
        server.join().unwrap();
    }

    #[derive(Debug, Clone)]
    enum RingOp {
        Push(u64),
        Consume(u16),
        Reset,
        SetHead(u16),
        /// Tail reported by a tracker at the end of an epoch
        TrackerTail(u16),
        Epoch,
        ClearStatus { overflow: bool, level: bool },
    }

    fn ring_op() -> impl Strategy<Value = RingOp> {
        prop_oneof![
            8 => any::<u64>().prop_map(RingOp::Push),
            3 => (0u16..64).prop_map(RingOp::Consume),
            1 => Just(RingOp::Reset),
            1 => any::<u16>().prop_map(RingOp::SetHead),
            1 => any::<u16>().prop_map(RingOp::TrackerTail),
            3 => Just(RingOp::Epoch),
            1 => (any::<bool>(), any::<bool>()).prop_map(|(overflow, level)| {
                RingOp::ClearStatus { overflow, level }
            }),
        ]
    }

    proptest! {
        #[test]
        fn ring_invariants(
            fill_thresh in 0u16..1024,
            ops in prop::collection::vec(ring_op(), 1..2000),
        ) {
            let rt = test_rt();
            let (chmu, msi) = local_chmu(rt.handle().clone());
            let conf0 = Conf0(0)
                .with_enable(true)
                .with_int_on_overflow(true)
                .with_int_on_fill_thresh(true);
            chmu.write64(I0 + CONF0, conf0.0);
            chmu.write64(I0 + CONF2, fill_thresh as u64);

            // expected latched status and interrupts sent
            let (mut overflow, mut level, mut sent) = (false, false, 0);
            for op in ops {
                match op {
                    RingOp::Push(v) => {
                        let full = {
                            let st = chmu.instances[0].lock().unwrap();
                            st.is_full()
                        };
                        prop_assert_eq!(chmu.push_hot_unit(0, v), !full);
                    }
                    RingOp::Consume(n) => {
                        let (head, tail) = chmu.ring(0).unwrap();
                        let avail = (tail + 1024 - head) % 1024;
                        let head = (head + n.min(avail)) % 1024;
                        write16(&chmu, I0 + HEAD, head);
                    }
                    RingOp::Reset => {
                        chmu.write64(I0 + CONF0, conf0.with_reset(true).0);
                        prop_assert_eq!(chmu.ring(0), Some((0, 0)));
                    }
                    RingOp::SetHead(h) => {
                        write16(&chmu, I0 + HEAD, h);
                    }
                    RingOp::TrackerTail(t) => {
                        write16(&chmu, I0 + TAIL, t);
                        prop_assert_eq!(chmu.ring(0).unwrap().1, t % 1024);
                    }
                    RingOp::Epoch => {
                        let (head, tail) = chmu.ring(0).unwrap();
                        let occupancy = (tail + 1024 - head) % 1024;
                        let mut raised = false;
                        if !level && occupancy > fill_thresh {
                            level = true;
                            raised = true;
                        }
                        if !overflow && occupancy == 1023 {
                            overflow = true;
                            raised = true;
                        }
                        sent += raised as usize;
                        prop_assert!(chmu.epoch_tick(0));
                    }
                    RingOp::ClearStatus { overflow: o, level: l } => {
                        let val = Status(0).with_overflow_int(o)
                            .with_level_int(l);
                        chmu.write64(I0 + STATUS, val.0);
                        overflow &= !o;
                        level &= !l;
                    }
                }
                let (head, tail) = chmu.ring(0).unwrap();
                prop_assert!((head as usize) < HOTLIST_ENTRIES);
                prop_assert!((tail as usize) < HOTLIST_ENTRIES);
                let occupancy = (tail as usize + HOTLIST_ENTRIES
                    - head as usize)
                    % HOTLIST_ENTRIES;
                prop_assert!(occupancy < HOTLIST_ENTRIES);

                let status = Status(chmu.read64(I0 + STATUS));
                prop_assert!(status.enabled());
                prop_assert_eq!(status.overflow_int(), overflow);
                prop_assert_eq!(status.level_int(), level);
                prop_assert_eq!(msi.count(), sent);
            }
        }
    }
}
