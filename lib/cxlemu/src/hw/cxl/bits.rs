// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Register layout of the HDM Decoder Capability Structure.
//!
//! See CXL 3.1 Section 8.2.4.20

use bitstruct::bitstruct;

/// Offset of the HDM Decoder Capability register
pub const HDM_CAP: usize = 0x00;
/// Offset of the HDM Decoder Global Control register
pub const HDM_GLOBAL_CTRL: usize = 0x04;
/// Offset of the first decoder register set
pub const HDM_DECODER_BASE: usize = 0x10;
/// Distance between consecutive decoder register sets
pub const HDM_DECODER_STRIDE: usize = 0x20;

pub const DECODER_BASE_LO: usize = 0x00;
pub const DECODER_BASE_HI: usize = 0x04;
pub const DECODER_SIZE_LO: usize = 0x08;
pub const DECODER_SIZE_HI: usize = 0x0c;
pub const DECODER_CTRL: usize = 0x10;
/// Target list for host bridges and switches, DPA skip for endpoints
pub const DECODER_TARGET_LO: usize = 0x14;
pub const DECODER_TARGET_HI: usize = 0x18;
/// Entries in the target list of a host bridge or switch decoder
pub const TARGET_LIST_LEN: usize = 8;

/// Only bits 31:28 of the low base, size and skip registers are implemented.
pub const DECODER_LO_MASK: u32 = 0xf000_0000;

/// Offset of register `reg` within decoder `n`
pub const fn decoder_reg(n: usize, reg: usize) -> usize {
    HDM_DECODER_BASE + n * HDM_DECODER_STRIDE + reg
}

/// Size of a capability structure holding `count` decoders
pub const fn hdm_block_size(count: usize) -> usize {
    HDM_DECODER_BASE + count * HDM_DECODER_STRIDE
}

/// Reassemble a 64-bit base/size/skip from its register halves
pub fn lo_hi_addr(lo: u32, hi: u32) -> u64 {
    ((hi as u64) << 32) | (lo & DECODER_LO_MASK) as u64
}

bitstruct! {
    /// HDM Decoder Capability register
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct HdmCap(pub u32) {
        /// Encoded number of decoders, see [super::decoder_count_dec]
        pub decoder_count: u8 = 0..4;
        /// Number of target ports per decoder (host bridges and switches)
        pub target_count: u8 = 4..8;
        /// Address bits 11:8 may select the interleave way
        pub interleave_a11_8: bool = 8;
        /// Address bits 14:12 may select the interleave way
        pub interleave_a14_12: bool = 9;
        pub poison_on_err: bool = 10;
        pub ways_3_6_12: bool = 11;
        pub ways_16: bool = 12;
    }
}

bitstruct! {
    /// HDM Decoder Global Control register
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct HdmGlobalCtrl(pub u32) {
        pub poison_on_err_en: bool = 0;
        pub enable: bool = 1;
    }
}

bitstruct! {
    /// HDM Decoder n Control register
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DecoderCtrl(pub u32) {
        /// Interleave granularity, `256 << ig` bytes
        pub ig: u8 = 0..4;
        /// Interleave ways, see [super::InterleaveWays]
        pub iw: u8 = 4..8;
        pub lock_on_commit: bool = 8;
        /// Written by software to request a commit
        pub commit: bool = 9;
        /// Set by hardware once the decoder is active
        pub committed: bool = 10;
        /// Set by hardware when a commit request failed
        pub err: bool = 11;
        /// 0 for device-coherent, 1 for host-only coherent memory
        pub target_type: bool = 12;
    }
}

/// Write mask for the software-owned bits of [DecoderCtrl]
pub const DECODER_CTRL_WMASK: u32 = 0x13ff;
