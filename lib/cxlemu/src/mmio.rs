// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host physical address bus onto which memory windows and register blocks
//! are mapped.

use std::sync::{Arc, Mutex};

use crate::common::*;
use crate::util::aspace::{self, ASpace};

#[usdt::provider(provider = "cxlemu")]
mod probes {
    fn mmio_read(addr: u64, bytes: u8, value: u64, status: u8) {}
    fn mmio_write(addr: u64, bytes: u8, value: u64, status: u8) {}
}

/// Completion status of a memory transaction.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TxStatus {
    Ok,
    /// The access could not be serviced.  Reads complete with poisoned data.
    Poison,
}
impl TxStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, TxStatus::Ok)
    }
}

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("access size {0} not supported")]
    BadLength(u8),
    #[error("no region mapped at {0:#x}")]
    Unmapped(usize),
    #[error("transaction at {0:#x} completed with poison")]
    Poison(usize),
    #[error("mapping failed: {0}")]
    Map(#[from] aspace::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Handler for a mapped region.  Invoked with the region start and an
/// operation whose offset is relative to that start.
pub type MmioFn = dyn Fn(usize, RWOp) -> TxStatus + Send + Sync + 'static;

pub struct MmioBus {
    map: Mutex<ASpace<Arc<MmioFn>>>,
}
impl MmioBus {
    pub fn new(max: usize) -> Self {
        assert!(max != 0);
        Self { map: Mutex::new(ASpace::new(0, max)) }
    }

    pub fn register(
        &self,
        start: usize,
        len: usize,
        func: Arc<MmioFn>,
    ) -> Result<()> {
        Ok(self.map.lock().unwrap().register(start, len, func)?)
    }
    pub fn unregister(&self, addr: usize) -> Result<()> {
        self.map.lock().unwrap().unregister(addr)?;
        Ok(())
    }

    /// Perform a guest write of `bytes` (1 to 8) bytes of `val` at `addr`.
    pub fn handle_write(&self, addr: usize, bytes: u8, val: u64) -> Result<()> {
        let len = Self::check_len(bytes)?;
        let buf = val.to_le_bytes();
        let res = self.do_mmio(addr, |start, func| {
            let mut wo = WriteOp::from_buf(addr - start, &buf[..len]);
            func(start, RWOp::Write(&mut wo))
        });

        probes::mmio_write!(|| (addr as u64, bytes, val, status_code(&res)));
        res
    }

    /// Perform a guest read of `bytes` (1 to 8) bytes at `addr`.
    pub fn handle_read(&self, addr: usize, bytes: u8) -> Result<u64> {
        let len = Self::check_len(bytes)?;
        let mut buf = [0u8; 8];
        let res = self.do_mmio(addr, |start, func| {
            let mut ro = ReadOp::from_buf(addr - start, &mut buf[..len]);
            func(start, RWOp::Read(&mut ro))
        });

        let val = u64::from_le_bytes(buf);
        probes::mmio_read!(|| (addr as u64, bytes, val, status_code(&res)));
        res.map(|_| val)
    }

    fn check_len(bytes: u8) -> Result<usize> {
        match bytes {
            1..=8 => Ok(bytes as usize),
            _ => Err(Error::BadLength(bytes)),
        }
    }

    fn do_mmio<F>(&self, addr: usize, f: F) -> Result<()>
    where
        F: FnOnce(usize, &Arc<MmioFn>) -> TxStatus,
    {
        let map = self.map.lock().unwrap();
        let (start, _len, func) =
            map.region_at(addr).map_err(|_| Error::Unmapped(addr))?;
        let func = Arc::clone(func);
        // unlock map before entering handler
        drop(map);
        match f(start, &func) {
            TxStatus::Ok => Ok(()),
            TxStatus::Poison => Err(Error::Poison(addr)),
        }
    }
}

fn status_code(res: &Result<()>) -> u8 {
    match res {
        Ok(()) => 0,
        Err(Error::Poison(_)) => 1,
        Err(_) => 2,
    }
}
