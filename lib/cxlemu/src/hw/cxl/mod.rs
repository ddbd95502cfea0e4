// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! CXL memory topology: HDM decoders, fixed memory windows and the devices
//! reachable through them.

use strum::FromRepr;

use crate::common::MIB;

pub mod bits;
pub mod chmu;
pub mod fabric;
pub mod hdm;
pub mod passthrough;
pub mod topology;
pub mod type3;
pub mod window;

#[cfg(test)]
pub(crate) mod test_util;

pub use fabric::{ConfigError, Fabric, FabricBuilder};
pub use topology::ComponentId;

/// Fixed memory windows are sized and placed in multiples of this.
pub const WINDOW_ALIGN: u64 = 256 * MIB;

/// Number of switch levels which may sit between a root port and an endpoint.
pub const MAX_SWITCH_DEPTH: usize = 1;

/// Encoded interleave ways, as found in the IW field of an HDM decoder.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromRepr)]
#[repr(u8)]
pub enum InterleaveWays {
    Ways1 = 0,
    Ways2 = 1,
    Ways4 = 2,
    Ways8 = 3,
    Ways16 = 4,
    Ways3 = 8,
    Ways6 = 9,
    Ways12 = 10,
}
impl InterleaveWays {
    pub fn from_enc(enc: u8) -> Option<Self> {
        Self::from_repr(enc)
    }
    pub fn enc(self) -> u8 {
        self as u8
    }
    pub fn ways(self) -> u64 {
        let enc = self as u8;
        if enc < 8 {
            1 << enc
        } else {
            3 << (enc - 8)
        }
    }
    pub fn from_count(count: usize) -> Option<Self> {
        Some(match count {
            1 => Self::Ways1,
            2 => Self::Ways2,
            4 => Self::Ways4,
            8 => Self::Ways8,
            16 => Self::Ways16,
            3 => Self::Ways3,
            6 => Self::Ways6,
            12 => Self::Ways12,
            _ => return None,
        })
    }
}

/// Encoded interleave granularity: `256 << enc` bytes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct InterleaveGranularity(u8);
impl InterleaveGranularity {
    pub const MAX_ENC: u8 = 6;

    pub fn from_enc(enc: u8) -> Option<Self> {
        (enc <= Self::MAX_ENC).then_some(Self(enc))
    }
    pub fn from_bytes(bytes: u64) -> Option<Self> {
        if !bytes.is_power_of_two() || bytes < 256 {
            return None;
        }
        let enc = bytes.trailing_zeros() - 8;
        Self::from_enc(u8::try_from(enc).ok()?)
    }
    pub fn enc(self) -> u8 {
        self.0
    }
    pub fn bytes(self) -> u64 {
        256 << self.0
    }
}
impl Default for InterleaveGranularity {
    fn default() -> Self {
        Self(0)
    }
}

const DECODER_COUNTS: [usize; 13] =
    [1, 2, 4, 6, 8, 10, 12, 14, 16, 20, 24, 28, 32];

/// Decode the DECODER_COUNT field of the HDM decoder capability
pub fn decoder_count_dec(enc: u8) -> Option<usize> {
    DECODER_COUNTS.get(enc as usize).copied()
}

/// Encode a decoder count for the HDM decoder capability
pub fn decoder_count_enc(count: usize) -> Option<u8> {
    DECODER_COUNTS.iter().position(|c| *c == count).map(|p| p as u8)
}
