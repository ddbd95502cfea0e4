// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::ops::RangeBounds;
use std::slice::SliceIndex;

/// A register or memory read in flight.
///
/// Whatever services the read deposits little-endian data into the
/// operation's buffer, front to back.
pub struct ReadOp<'a> {
    buf: &'a mut [u8],
    offset: usize,
    write_offset: usize,
}

impl<'a> ReadOp<'a> {
    /// Read `buf.len()` bytes starting at `op_offset` of the target.
    pub fn from_buf(op_offset: usize, buf: &'a mut [u8]) -> Self {
        Self { buf, offset: op_offset, write_offset: 0 }
    }

    /// Constructs a child read operation covering `range` of the parent.
    pub fn new_child<'b, R>(
        op_offset: usize,
        parent: &'a mut ReadOp,
        range: R,
    ) -> ReadOp<'b>
    where
        'a: 'b,
        R: RangeBounds<usize> + SliceIndex<[u8], Output = [u8]>,
    {
        ReadOp {
            buf: &mut parent.buf[range],
            offset: op_offset,
            write_offset: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
    pub fn avail(&self) -> usize {
        self.len() - self.write_offset
    }
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn write_u16(&mut self, val: u16) {
        self.write_bytes(&val.to_le_bytes()[..]);
    }
    pub fn write_u32(&mut self, val: u32) {
        self.write_bytes(&val.to_le_bytes()[..]);
    }
    pub fn write_u64(&mut self, val: u64) {
        self.write_bytes(&val.to_le_bytes()[..]);
    }
    pub fn write_bytes(&mut self, data: &[u8]) {
        let wr_off = self.write_offset;
        assert!(data.len() <= self.avail());
        self.buf[wr_off..(wr_off + data.len())].copy_from_slice(data);
        self.write_offset += data.len();
    }
    pub fn fill(&mut self, val: u8) {
        self.buf[self.write_offset..].fill(val);
        self.write_offset = self.len();
    }
}

/// A register or memory write in flight, consumed front to back.
pub struct WriteOp<'a> {
    buf: &'a [u8],
    offset: usize,
    read_offset: usize,
}

impl<'a> WriteOp<'a> {
    /// Store `buf` at `op_offset` of the target.
    pub fn from_buf(op_offset: usize, buf: &'a [u8]) -> Self {
        Self { buf, offset: op_offset, read_offset: 0 }
    }

    /// Constructs a child write operation covering `range` of the parent.
    pub fn new_child<'b, R>(
        op_offset: usize,
        parent: &'a mut WriteOp,
        range: R,
    ) -> WriteOp<'b>
    where
        'a: 'b,
        R: RangeBounds<usize> + SliceIndex<[u8], Output = [u8]>,
    {
        WriteOp { buf: &parent.buf[range], offset: op_offset, read_offset: 0 }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
    pub fn avail(&self) -> usize {
        self.len() - self.read_offset
    }
    pub fn offset(&self) -> usize {
        self.offset
    }

    fn read_val<const COUNT: usize>(&mut self) -> [u8; COUNT] {
        let mut buf = [0u8; COUNT];
        self.read_bytes(&mut buf);
        buf
    }
    pub fn read_u16(&mut self) -> u16 {
        u16::from_le_bytes(self.read_val())
    }
    pub fn read_u32(&mut self) -> u32 {
        u32::from_le_bytes(self.read_val())
    }
    pub fn read_u64(&mut self) -> u64 {
        u64::from_le_bytes(self.read_val())
    }
    pub fn read_bytes(&mut self, data: &mut [u8]) {
        let rd_off = self.read_offset;
        assert!(data.len() <= self.avail());
        data.copy_from_slice(&self.buf[rd_off..(rd_off + data.len())]);
        self.read_offset += data.len();
    }
}

pub enum RWOp<'a, 'b> {
    Read(&'a mut ReadOp<'b>),
    Write(&'a mut WriteOp<'b>),
}
impl RWOp<'_, '_> {
    pub fn offset(&self) -> usize {
        match self {
            RWOp::Read(ro) => ro.offset,
            RWOp::Write(wo) => wo.offset,
        }
    }
    pub fn len(&self) -> usize {
        match self {
            RWOp::Read(ro) => ro.len(),
            RWOp::Write(wo) => wo.len(),
        }
    }
    pub fn is_read(&self) -> bool {
        matches!(self, RWOp::Read(_))
    }
    pub fn is_write(&self) -> bool {
        matches!(self, RWOp::Write(_))
    }
}

pub use crate::lifecycle::Lifecycle;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

/// Round `val` up to the next multiple of `to`, which must be a power of two.
///
/// Returns `None` on overflow.
pub fn round_up_p2(val: u64, to: u64) -> Option<u64> {
    assert!(to.is_power_of_two());

    Some(val.checked_add(to - 1)? & !(to - 1))
}

/// Gather up to 8 little-endian bytes into a u64
pub fn le_to_u64(data: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf[..data.len()].copy_from_slice(data);
    u64::from_le_bytes(buf)
}
