// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

pub mod spec;

/// Lowest address considered for window placement, unless configured
pub const DEFAULT_FLOOR: u64 = 0x10_0000_0000;
/// Upper bound (exclusive) of window placement, unless configured
pub const DEFAULT_MAX: u64 = 1 << 52;

/// Configuration of an emulated CXL fabric.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub layout: Layout,

    #[serde(default, rename = "host_bridge")]
    pub host_bridges: BTreeMap<String, HostBridge>,

    #[serde(default, rename = "switch")]
    pub switches: BTreeMap<String, Switch>,

    #[serde(default, rename = "type3")]
    pub type3_devs: BTreeMap<String, Type3>,

    /// Fixed memory windows, placed in the order listed
    #[serde(default, rename = "fixed_window")]
    pub fixed_windows: Vec<FixedWindow>,
}

/// Where fixed windows may be placed in host physical address space.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Layout {
    #[serde(default = "default_floor")]
    pub floor: u64,
    #[serde(default = "default_max")]
    pub max: u64,
}
impl Default for Layout {
    fn default() -> Self {
        Self { floor: DEFAULT_FLOOR, max: DEFAULT_MAX }
    }
}

fn default_floor() -> u64 {
    DEFAULT_FLOOR
}
fn default_max() -> u64 {
    DEFAULT_MAX
}
fn default_decoders() -> usize {
    1
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct HostBridge {
    /// Route everything to the single root port, ignoring decoders
    #[serde(default)]
    pub passthrough: bool,

    #[serde(default = "default_decoders")]
    pub decoders: usize,

    pub ports: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Switch {
    #[serde(default = "default_decoders")]
    pub decoders: usize,

    pub ports: Vec<u8>,

    /// Upstream connection, as "<parent>:<port>"
    pub attach: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Type3 {
    #[serde(default)]
    pub volatile_size: u64,

    #[serde(default)]
    pub persistent_size: u64,

    #[serde(default = "default_decoders")]
    pub decoders: usize,

    /// Upstream connection, as "<parent>:<port>"
    pub attach: String,

    pub chmu: Option<Chmu>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Chmu {
    pub msi_vector: u16,

    /// Address of an external hotness tracker
    pub tracker: Option<SocketAddr>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct FixedWindow {
    pub size: u64,

    /// Host bridges, in interleave order
    pub targets: Vec<String>,

    /// Interleave granularity in bytes
    pub interleave_granularity: Option<u64>,
}

/// Errors which may be returned when parsing the fabric configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let cfg = toml::from_str::<Config>(&contents)?;
    Ok(cfg)
}
