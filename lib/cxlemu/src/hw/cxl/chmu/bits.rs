// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#![allow(dead_code)]

use bitstruct::bitstruct;
use strum::FromRepr;

pub const CHMU_VERSION: u8 = 1;
pub const INSTANCES_PER_BLOCK: usize = 1;
pub const HOTLIST_ENTRIES: usize = 1024;
pub const BITMAP_ENTRIES: usize = 32;
/// Width of the per-unit access counters
pub const COUNTER_WIDTH: u8 = 16;

pub const COMMON_CAP0: usize = 0x00;
pub const COMMON_CAP1: usize = 0x08;
/// Offset of instance 0 from the start of the block
pub const INSTANCE_BASE: usize = 0x10;

// Offsets within an instance
pub const CAP0: usize = 0x00;
pub const CAP1: usize = 0x08;
pub const CAP2: usize = 0x10;
pub const CAP3: usize = 0x18;
pub const CONF0: usize = 0x40;
pub const CONF1: usize = 0x48;
pub const CONF2: usize = 0x50;
pub const STATUS: usize = 0x60;
pub const HEAD: usize = 0x68;
pub const TAIL: usize = 0x6a;
pub const RANGE_CONFIG_BITMAP: usize = 0x70;
pub const HOTLIST: usize = RANGE_CONFIG_BITMAP + 8 * BITMAP_ENTRIES;

/// Distance between consecutive instances
pub const INSTANCE_LEN: usize = HOTLIST + 8 * HOTLIST_ENTRIES;

/// Size of a block holding `count` instances
pub const fn chmu_block_size(count: usize) -> usize {
    INSTANCE_BASE + count * INSTANCE_LEN
}

/// Epoch type advertised in CAP0: one epoch shared by all counters
pub const EPOCH_TYPE_GLOBAL: u8 = 0;

/// Encoded unit of an epoch length
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromRepr)]
#[repr(u8)]
pub enum EpochScale {
    Us100 = 1,
    Ms1 = 2,
    Ms10 = 3,
    Ms100 = 4,
    S1 = 5,
}
impl EpochScale {
    /// Length in milliseconds of `val` units of this scale
    pub fn to_ms(self, val: u16) -> u64 {
        let val = val as u64;
        match self {
            EpochScale::Us100 => val / 10,
            EpochScale::Ms1 => val,
            EpochScale::Ms10 => val * 10,
            EpochScale::Ms100 => val * 100,
            EpochScale::S1 => val * 1000,
        }
    }
}

/// Shortest epoch advertised (1 x 100ms)
pub const MIN_EPOCH: (EpochScale, u16) = (EpochScale::Ms100, 1);
/// Longest epoch advertised (100 x 1s)
pub const MAX_EPOCH: (EpochScale, u16) = (EpochScale::S1, 100);

bitstruct! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct CommonCap0(pub u64) {
        pub version: u8 = 0..4;
        pub num_instances: u8 = 8..16;
    }
}

bitstruct! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct CommonCap1(pub u64) {
        pub instance_length: u16 = 0..16;
    }
}

bitstruct! {
    /// CHMU Capability 0
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Cap0(pub u64) {
        /// Interrupt message number
        pub msi_n: u8 = 0..4;
        pub overflow_int: bool = 4;
        pub level_int: bool = 5;
        pub epoch_type: u8 = 6..8;
        pub tracked_nontee_r: bool = 8;
        pub tracked_nontee_w: bool = 9;
        pub tracked_nontee_rw: bool = 10;
        pub tracked_all_r: bool = 11;
        pub tracked_all_w: bool = 12;
        pub tracked_all_rw: bool = 13;
        pub max_epoch_scale: u8 = 16..20;
        pub max_epoch_val: u16 = 20..32;
        pub min_epoch_scale: u8 = 32..36;
        pub min_epoch_val: u16 = 36..48;
        pub hotlist_size: u16 = 48..64;
    }
}

bitstruct! {
    /// CHMU Capability 1
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Cap1(pub u64) {
        /// Bit N set: units of 256 * 2^N bytes are supported
        pub unit_sizes: u32 = 0..32;
        /// Bit N set: down-sampling by 2^(N - 1) is supported
        pub ds_factors: u16 = 32..48;
        pub epoch_based: bool = 48;
        pub always_on: bool = 49;
        pub randomized_ds: bool = 50;
        pub overlapping_ranges: bool = 51;
        pub insert_after_clear: bool = 52;
    }
}

bitstruct! {
    /// CHMU Configuration 0
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Conf0(pub u64) {
        /// Which M2S requests are tracked
        pub what: u8 = 0..8;
        pub randomize_ds: bool = 8;
        pub int_on_overflow: bool = 9;
        pub int_on_fill_thresh: bool = 10;
        pub enable: bool = 16;
        pub reset: bool = 17;
        pub hotness_threshold: u32 = 32..64;
    }
}

bitstruct! {
    /// CHMU Configuration 1
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Conf1(pub u64) {
        /// log2 of the unit size in bytes
        pub unit_size: u32 = 0..32;
        pub ds_factor: u8 = 32..36;
        pub reporting_mode: u8 = 36..38;
        pub epoch_scale: u8 = 40..44;
        pub epoch_val: u16 = 48..64;
    }
}

bitstruct! {
    /// CHMU Configuration 2
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Conf2(pub u64) {
        /// Hotlist occupancy above which LEVEL_INT is raised
        pub fill_thresh: u16 = 0..16;
    }
}

bitstruct! {
    /// CHMU Status
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Status(pub u64) {
        pub enabled: bool = 0;
        pub op_in_prog: u16 = 16..32;
        pub counter_width: u8 = 32..40;
        /// Write 1 to clear
        pub overflow_int: bool = 40;
        /// Write 1 to clear
        pub level_int: bool = 41;
    }
}
