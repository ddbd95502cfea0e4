// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Conversion of a [`super::Config`] into a fabric builder.

use cxlemu::hw::cxl::fabric::{
    ChmuSpec, FabricBuilder, HostBridgeSpec, SwitchSpec, Type3Spec, WindowSpec,
};
use thiserror::Error;

use crate::Config;

#[derive(Debug, Error)]
pub enum TomlToFabricError {
    #[error("bad attach point {value:?} for {name:?}, expected \"<parent>:<port>\"")]
    BadAttach { name: String, value: String },
}

/// Split an attach point of the form "<parent>:<port>"
fn attach_point<'a>(
    name: &str,
    value: &'a str,
) -> Result<(&'a str, u8), TomlToFabricError> {
    let bad = || TomlToFabricError::BadAttach {
        name: name.to_string(),
        value: value.to_string(),
    };
    let (parent, port) = value.rsplit_once(':').ok_or_else(bad)?;
    let port = port.parse::<u8>().map_err(|_| bad())?;
    if parent.is_empty() {
        return Err(bad());
    }
    Ok((parent, port))
}

/// Declare every component of `config` on a [FabricBuilder].  Structural
/// checks are left to [FabricBuilder::build].
pub fn to_builder(config: &Config) -> Result<FabricBuilder, TomlToFabricError> {
    let mut builder = FabricBuilder::new();

    for (name, hb) in config.host_bridges.iter() {
        builder = builder.host_bridge(
            name,
            HostBridgeSpec {
                passthrough: hb.passthrough,
                decoder_count: hb.decoders,
                ports: hb.ports.clone(),
            },
        );
    }
    for (name, sw) in config.switches.iter() {
        let (parent, port) = attach_point(name, &sw.attach)?;
        builder = builder
            .switch(
                name,
                SwitchSpec { decoder_count: sw.decoders, ports: sw.ports.clone() },
            )
            .attach(parent, port, name);
    }
    for (name, dev) in config.type3_devs.iter() {
        let (parent, port) = attach_point(name, &dev.attach)?;
        let chmu = dev.chmu.as_ref().map(|c| ChmuSpec {
            msi_vector: c.msi_vector,
            tracker: c.tracker,
        });
        builder = builder
            .type3(
                name,
                Type3Spec {
                    volatile_size: dev.volatile_size,
                    persistent_size: dev.persistent_size,
                    decoder_count: dev.decoders,
                    chmu,
                },
            )
            .attach(parent, port, name);
    }
    for win in config.fixed_windows.iter() {
        builder = builder.window(WindowSpec {
            size: win.size,
            targets: win.targets.clone(),
            interleave_granularity: win.interleave_granularity,
        });
    }

    Ok(builder)
}
