// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#![allow(clippy::style)]

pub extern crate usdt;
#[macro_use]
extern crate bitflags;

pub mod common;
pub mod hw;
pub mod intr;
pub mod lifecycle;
pub mod mem;
pub mod mmio;
pub mod util;

pub use hw::cxl::fabric::{Fabric, FabricBuilder};

pub fn version() -> &'static str {
    lazy_static::lazy_static! {
        static ref VERSION: String = {
            match option_env!("VERGEN_GIT_SHA") {
                Some(sha) => format!("v{} ({sha})", env!("CARGO_PKG_VERSION")),
                None => format!(
                    "v{} <unknown git commit>",
                    env!("CARGO_PKG_VERSION")
                ),
            }
        };
    };
    &VERSION
}
