// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client for an external hotness tracker.
//!
//! Each request is a frame of four little-endian u64 values
//! `{instance, command, param, param2}`, answered by a single little-endian
//! u64.  Commands without a meaningful result still return one.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use byteorder::{ByteOrder, LE};
use strum::FromRepr;

pub const REQUEST_LEN: usize = 32;
pub const REPLY_LEN: usize = 8;

#[derive(Copy, Clone, Debug, Eq, PartialEq, FromRepr)]
#[repr(u64)]
pub enum TrackerCmd {
    QueryTail = 0,
    QueryHead = 1,
    SetThreshold = 2,
    SetHead = 3,
    SetHotlistSize = 4,
    QueryHotlistEntry = 5,
    SignalEpochEnd = 6,
    SetEnabled = 7,
    SetGranualSize = 8,
    SetHpaBase = 9,
    SetHpaSize = 10,
    SetDpaBase = 11,
    SetInterleaveWays = 12,
    SetInterleaveWay = 13,
    SetInterleaveGran = 14,
}

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("failed to connect to tracker at {addr}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("tracker request {cmd:?} for instance {instance} failed")]
    Request {
        cmd: TrackerCmd,
        instance: u64,
        #[source]
        source: io::Error,
    },
}

/// One decoded request frame
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Request {
    pub instance: u64,
    pub cmd: TrackerCmd,
    pub param: u64,
    pub param2: u64,
}
impl Request {
    pub fn encode(&self) -> [u8; REQUEST_LEN] {
        let mut buf = [0u8; REQUEST_LEN];
        LE::write_u64(&mut buf[0..8], self.instance);
        LE::write_u64(&mut buf[8..16], self.cmd as u64);
        LE::write_u64(&mut buf[16..24], self.param);
        LE::write_u64(&mut buf[24..32], self.param2);
        buf
    }

    /// Decode a frame, failing on an unknown command
    pub fn decode(buf: &[u8; REQUEST_LEN]) -> Option<Self> {
        Some(Self {
            instance: LE::read_u64(&buf[0..8]),
            cmd: TrackerCmd::from_repr(LE::read_u64(&buf[8..16]))?,
            param: LE::read_u64(&buf[16..24]),
            param2: LE::read_u64(&buf[24..32]),
        })
    }
}

/// Blocking connection to a tracker.  Every request waits for its reply,
/// bounded by [RemoteTracker::IO_TIMEOUT].
pub struct RemoteTracker {
    addr: SocketAddr,
    stream: TcpStream,
}
impl RemoteTracker {
    pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn connect(addr: SocketAddr) -> Result<Self, TrackerError> {
        let setup = || -> io::Result<TcpStream> {
            let stream = TcpStream::connect_timeout(&addr, Self::IO_TIMEOUT)?;
            stream.set_read_timeout(Some(Self::IO_TIMEOUT))?;
            stream.set_write_timeout(Some(Self::IO_TIMEOUT))?;
            stream.set_nodelay(true)?;
            Ok(stream)
        };
        let stream =
            setup().map_err(|source| TrackerError::Connect { addr, source })?;
        Ok(Self { addr, stream })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn request(
        &mut self,
        instance: usize,
        cmd: TrackerCmd,
        param: u64,
        param2: u64,
    ) -> Result<u64, TrackerError> {
        let instance = instance as u64;
        let req = Request { instance, cmd, param, param2 };
        let mut reply = [0u8; REPLY_LEN];
        self.stream
            .write_all(&req.encode())
            .and_then(|_| self.stream.read_exact(&mut reply))
            .map_err(|source| TrackerError::Request { cmd, instance, source })?;
        Ok(LE::read_u64(&reply))
    }
}
