// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use cxlemu::common::Lifecycle;
use cxlemu::intr::MsiRecorder;
use cxlemu::mmio::MmioBus;
use cxlemu::usdt::register_probes;
use cxlemu::Fabric;
use slog::{o, Drain};

fn parse_addr(s: &str) -> Result<u64, String> {
    let digits = s.replace('_', "");
    let res = match digits.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => digits.parse::<u64>(),
    };
    res.map_err(|e| format!("bad address {s:?}: {e}"))
}

#[derive(clap::Parser)]
/// Build an emulated CXL memory fabric and report how addresses route.
struct Args {
    /// Fabric configuration file
    #[clap(value_name = "CONFIG", action)]
    config: PathBuf,

    /// Host physical address to resolve (may be repeated)
    #[clap(long, value_parser = parse_addr)]
    resolve: Vec<u64>,

    /// Override the lowest address for window placement
    #[clap(long, value_parser = parse_addr)]
    floor: Option<u64>,

    /// Override the upper bound of window placement
    #[clap(long, value_parser = parse_addr)]
    max: Option<u64>,
}

fn build_log() -> (slog::Logger, slog_async::AsyncGuard) {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let (drain, guard) = slog_async::Async::new(drain).build_with_guard();
    (slog::Logger::root(drain.fuse(), o!()), guard)
}

fn report(fabric: &Fabric, resolve: &[u64], log: &slog::Logger) {
    for w in fabric.windows() {
        let targets: Vec<&str> =
            w.targets().iter().map(|hb| hb.name.as_str()).collect();
        slog::info!(log, "fixed window";
            "index" => w.index(),
            "base" => format!("{:#x}", w.base().unwrap_or(0)),
            "size" => format!("{:#x}", w.size()),
            "ways" => ?w.ways(),
            "granularity" => w.granularity().bytes(),
            "targets" => ?targets,
        );
    }
    for ep in fabric.endpoints() {
        slog::info!(log, "type3 device";
            "name" => ep.name(),
            "decoders" => ep.hdm().decoder_count(),
            "volatile" => format!("{:#x}", ep.volatile_size()),
            "chmu" => ep.chmu().is_some(),
        );
    }
    for hpa in resolve {
        match fabric.resolve(*hpa) {
            Some(ep) => {
                let dpa = ep.hdm().translate(*hpa);
                slog::info!(log, "resolved";
                    "hpa" => format!("{hpa:#x}"),
                    "endpoint" => ep.name(),
                    "dpa" => ?dpa,
                );
            }
            None => {
                slog::warn!(log, "unrouted"; "hpa" => format!("{hpa:#x}"));
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    let Args { config, resolve, floor, max } = Args::parse();

    // Ensure proper setup of USDT probes
    register_probes().context("Failed to setup USDT probes")?;

    let (log, _log_async_guard) = build_log();
    slog::info!(log, "cxlemu-standalone"; "version" => cxlemu::version());

    let rt =
        tokio::runtime::Builder::new_multi_thread().enable_all().build()?;

    let cfg = cxlemu_config_toml::parse(&config)
        .with_context(|| format!("Cannot parse {}", config.display()))?;
    let builder = cxlemu_config_toml::spec::to_builder(&cfg)?;
    let msi = Arc::new(MsiRecorder::new(log.new(o!("component" => "msi"))));
    let fabric = builder
        .build(msi, rt.handle().clone(), log.clone())
        .context("Failed to build fabric")?;

    let floor = floor.unwrap_or(cfg.layout.floor);
    let max = max.unwrap_or(cfg.layout.max);
    fabric.layout_windows(floor, max).context("Failed to place windows")?;

    let bus = MmioBus::new(usize::try_from(max.saturating_sub(1).max(1))?);
    fabric.map_windows(&bus).context("Failed to map windows")?;
    fabric.start()?;

    report(&fabric, &resolve, &log);

    fabric.pause();
    fabric.halt();
    Ok(())
}
