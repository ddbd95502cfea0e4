// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Small topologies for unit tests.

use std::sync::Arc;

use slog::Logger;

use super::hdm::DecoderSetup;
use super::topology::*;
use super::type3::{Type3Dev, Type3Params};

pub fn log() -> Logger {
    Logger::root(slog::Discard, slog::o!())
}

/// An endpoint with `vsize` bytes of volatile memory and 2 decoders
pub fn endpoint(name: &str, vsize: u64) -> Arc<Type3Dev> {
    let params =
        Type3Params { volatile_size: vsize, persistent_size: 0, decoder_count: 2 };
    Arc::new(Type3Dev::new(ComponentId::new(), name, params, None, log()).unwrap())
}

/// A passthrough host bridge with `dev` below its only port
pub fn passthrough_hb(name: &str, dev: Attached) -> Arc<HostBridge> {
    let mut ports = PortSet::new();
    let _ = ports.attach(0, dev);
    Arc::new(HostBridge::new(name, true, 1, 1, ports, log()).unwrap())
}

/// A decoding host bridge with `devs` below ports 0, 1, ...
pub fn hb(name: &str, devs: Vec<Attached>) -> Arc<HostBridge> {
    let mut ports = PortSet::new();
    for (n, dev) in devs.into_iter().enumerate() {
        let _ = ports.attach(n as u8, dev);
    }
    let count = ports.len();
    Arc::new(HostBridge::new(name, false, 4, count, ports, log()).unwrap())
}

/// A switch with `devs` below ports 0, 1, ...
pub fn switch(name: &str, devs: Vec<Attached>) -> Arc<UpstreamSwitchPort> {
    let mut ports = PortSet::new();
    for (n, dev) in devs.into_iter().enumerate() {
        let _ = ports.attach(n as u8, dev);
    }
    let count = ports.len();
    Arc::new(UpstreamSwitchPort::new(name, 4, count, ports, log()).unwrap())
}

/// Commit decoder 0 of `ep` over `[base, base + size)` without interleave
pub fn commit_ep(ep: &Type3Dev, base: u64, size: u64) {
    ep.hdm().commit_decoder(0, &DecoderSetup::new(base, size));
}

/// Single-threaded runtime with timers, for components which need a handle
pub fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap()
}
