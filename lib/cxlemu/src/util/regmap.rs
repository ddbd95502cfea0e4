// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::ops::Bound::Included;

use super::aspace::ASpace;
use crate::common::*;

#[derive(Debug)]
struct RegDef<ID> {
    id: ID,
    flags: Flags,
}

/// Represents a mapping of registers within a register block.
///
/// Accesses which cover only part of a register, or straddle several, are
/// split and widened so that the per-register handler sees whole-register
/// operations unless the register opts out via [Flags].
#[derive(Debug)]
pub struct RegMap<ID> {
    len: usize,
    space: ASpace<RegDef<ID>>,
}

bitflags! {
    #[derive(Default, Debug, Clone, Copy)]
    pub struct Flags: u8 {
        const DEFAULT = 0;
        /// Partial reads are passed through instead of widened
        const NO_READ_EXTEND = 0b00000001;
        /// Partial writes are passed through instead of widened
        const NO_WRITE_EXTEND = 0b00000010;
        /// Widened writes start from zero instead of the current value
        const NO_READ_MOD_WRITE = 0b00000100;
        const PASSTHRU = Self::NO_READ_EXTEND.bits() |
            Self::NO_WRITE_EXTEND.bits();
    }
}

impl<ID> RegMap<ID> {
    pub fn new(len: usize) -> Self {
        assert!(len > 1);
        Self { len, space: ASpace::new(0, len - 1) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// # Panics
    ///
    /// Panics if the register overlaps an existing definition.  Layouts are
    /// static, so this is a programming error.
    pub fn define_with_flags(
        &mut self,
        start: usize,
        len: usize,
        id: ID,
        flags: Flags,
    ) {
        self.space.register(start, len, RegDef { id, flags }).unwrap();
    }

    /// Dispatch `op` to `f`, once per register it touches.
    ///
    /// Operations which are empty or extend beyond the map are dropped: reads
    /// leave the buffer untouched and writes have no effect.
    pub fn process<F>(&self, op: &mut RWOp<'_, '_>, mut f: F)
    where
        F: FnMut(&ID, RWOp),
    {
        let (start, len) = (op.offset(), op.len());
        if len == 0 || start.checked_add(len).map_or(true, |e| e > self.len) {
            return;
        }
        let last = start + len - 1;

        for (reg_start, reg_len, reg) in
            self.space.covered_by((Included(start), Included(last)))
        {
            let lo = start.max(reg_start);
            let hi = last.min(reg_start + reg_len - 1);
            let buf_range = (lo - start)..(hi - start + 1);
            let reg_off = lo - reg_start;
            let whole = reg_off == 0 && hi - lo + 1 == reg_len;

            match op {
                RWOp::Read(ro) => {
                    let mut child = ReadOp::new_child(reg_off, ro, buf_range);
                    Self::reg_read(reg, reg_len, whole, &mut child, &mut f);
                }
                RWOp::Write(wo) => {
                    let mut child = WriteOp::new_child(reg_off, wo, buf_range);
                    Self::reg_write(reg, reg_len, whole, &mut child, &mut f);
                }
            }
        }
    }

    fn reg_read<F>(
        reg: &RegDef<ID>,
        reg_len: usize,
        whole: bool,
        child: &mut ReadOp,
        f: &mut F,
    ) where
        F: FnMut(&ID, RWOp),
    {
        if whole || reg.flags.contains(Flags::NO_READ_EXTEND) {
            f(&reg.id, RWOp::Read(child));
            return;
        }

        let mut scratch = vec![0; reg_len];
        f(&reg.id, RWOp::Read(&mut ReadOp::from_buf(0, &mut scratch)));
        let off = child.offset();
        let len = child.len();
        child.write_bytes(&scratch[off..(off + len)]);
    }

    fn reg_write<F>(
        reg: &RegDef<ID>,
        reg_len: usize,
        whole: bool,
        child: &mut WriteOp,
        f: &mut F,
    ) where
        F: FnMut(&ID, RWOp),
    {
        if whole || reg.flags.contains(Flags::NO_WRITE_EXTEND) {
            f(&reg.id, RWOp::Write(child));
            return;
        }

        let mut scratch = vec![0; reg_len];
        if !reg.flags.contains(Flags::NO_READ_MOD_WRITE) {
            f(&reg.id, RWOp::Read(&mut ReadOp::from_buf(0, &mut scratch)));
        }
        let off = child.offset();
        let len = child.len();
        child.read_bytes(&mut scratch[off..(off + len)]);
        f(&reg.id, RWOp::Write(&mut WriteOp::from_buf(0, &scratch)));
    }
}

impl<ID: Copy + Eq> RegMap<ID> {
    /// Build a map from registers laid end to end, starting at offset 0.
    ///
    /// Registers matching `resv_reg` are defined as [Flags::PASSTHRU].
    pub fn create_packed(
        size: usize,
        regdef: &[(ID, usize)],
        resv_reg: Option<ID>,
    ) -> Self {
        RegMap::create_packed_iter(size, regdef.iter().copied(), resv_reg)
    }

    pub fn create_packed_iter(
        size: usize,
        regdef: impl IntoIterator<Item = (ID, usize)>,
        resv_reg: Option<ID>,
    ) -> Self {
        let mut map = RegMap::new(size);
        let mut off = 0;
        for (id, reg_size) in regdef {
            if reg_size == 0 {
                continue;
            }
            let flags = match resv_reg {
                Some(resv) if resv == id => Flags::PASSTHRU,
                _ => Flags::DEFAULT,
            };
            map.define_with_flags(off, reg_size, id, flags);
            off += reg_size;
        }
        assert_eq!(size, off);

        map
    }

    /// Override the flags of every definition of `id`
    pub fn set_flags(&mut self, id: ID, flags: Flags) {
        let starts: Vec<(usize, usize)> = self
            .space
            .iter()
            .filter(|(_, _, def)| def.id == id)
            .map(|(start, len, _)| (start, len))
            .collect();
        for (start, len) in starts {
            let _ = self.space.unregister(start);
            self.define_with_flags(start, len, id, flags);
        }
    }
}
