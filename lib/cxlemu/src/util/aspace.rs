// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Utilities to construct and manipulate an address space.

use std::collections::{btree_map, BTreeMap};
use std::ops::Bound::{Excluded, Included, Unbounded};
use std::ops::RangeBounds;

/// Generic container storing items in a region representing an address space.
///
/// Stores ranges by (start, length), associating an item with each one.
/// Registered ranges never overlap.
#[derive(Debug)]
pub struct ASpace<T> {
    start: usize,
    end: usize,
    map: BTreeMap<usize, (usize, T)>,
}

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("region is outside of the address space")]
    OutOfRange,
    #[error("region length is zero or overflows")]
    BadLength,
    #[error("region conflicts with an existing registration")]
    Conflict,
    #[error("no region registered at address")]
    NotFound,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Represents (start, length, &item) for a region in the space
pub type SpaceItem<'a, T> = (usize, usize, &'a T);

impl<T> ASpace<T> {
    /// Create an instance with inclusive range [`start`, `end`]
    ///
    /// # Panics
    ///
    /// - Panics if start >= end.
    pub fn new(start: usize, end: usize) -> ASpace<T> {
        assert!(start < end);
        Self { start, end, map: BTreeMap::new() }
    }

    /// Register a region of `len` bytes beginning at `start`.
    ///
    /// Fails if the region extends outside the space or overlaps any
    /// existing registration.
    pub fn register(
        &mut self,
        start: usize,
        len: usize,
        item: T,
    ) -> Result<()> {
        let end = safe_end(start, len).ok_or(Error::BadLength)?;
        if start < self.start || end > self.end {
            return Err(Error::OutOfRange);
        }
        if self.covered_by((Included(start), Included(end))).next().is_some() {
            return Err(Error::Conflict);
        }

        let old = self.map.insert(start, (len, item));
        debug_assert!(old.is_none());
        Ok(())
    }

    /// Unregister the region which begins at `start`
    pub fn unregister(&mut self, start: usize) -> Result<T> {
        self.map.remove(&start).map(|(_len, item)| item).ok_or(Error::NotFound)
    }

    /// Search for the region which contains `point`
    pub fn region_at(&self, point: usize) -> Result<SpaceItem<'_, T>> {
        if point < self.start || point > self.end {
            return Err(Error::OutOfRange);
        }
        match self.map.range((Unbounded, Included(&point))).next_back() {
            Some((start, (len, item)))
                if safe_end(*start, *len).map_or(false, |e| e >= point) =>
            {
                Ok((*start, *len, item))
            }
            _ => Err(Error::NotFound),
        }
    }

    /// Iterate over all regions, sorted by starting point
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { inner: self.map.range(..) }
    }

    /// Iterate over regions which are partially or totally covered by `range`
    pub fn covered_by<R>(&self, range: R) -> Iter<'_, T>
    where
        R: RangeBounds<usize>,
    {
        // A region starting before the search range may still extend into it,
        // so pull the front bound back to the start of any such region.
        let front = match range.start_bound() {
            Unbounded => Unbounded,
            Included(pos) => match self.region_at(*pos) {
                Ok((start, _, _)) => Included(start),
                Err(_) => Included(*pos),
            },
            Excluded(pos) => match pos.checked_add(1) {
                Some(next) => match self.region_at(next) {
                    Ok((start, _, _)) => Included(start),
                    Err(_) => Included(next),
                },
                None => Excluded(*pos),
            },
        };
        let back = match range.end_bound() {
            Unbounded => Unbounded,
            Excluded(a) => Excluded(*a),
            Included(a) => Included(*a),
        };
        Iter { inner: self.map.range((front, back)) }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}

/// Inclusive end of a region, `None` if empty or overflowing
fn safe_end(start: usize, len: usize) -> Option<usize> {
    if len == 0 {
        None
    } else {
        start.checked_add(len - 1)
    }
}

/// Iterator over regions of an [ASpace]
pub struct Iter<'a, T> {
    inner: btree_map::Range<'a, usize, (usize, T)>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = SpaceItem<'a, T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(start, (len, item))| (*start, *len, item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic]
    fn create_zero_size() {
        let _s: ASpace<u32> = ASpace::new(0, 0);
    }

    #[test]
    fn register_invalid() {
        let mut s: ASpace<u32> = ASpace::new(0, 0x1000);

        assert_eq!(s.register(0x100, 0, 0), Err(Error::BadLength));
        assert_eq!(s.register(usize::MAX - 1, 0x10, 0), Err(Error::BadLength));
        assert_eq!(s.register(0xff0, 0x100, 0), Err(Error::OutOfRange));
    }

    #[test]
    fn register_overlaps() {
        let mut s: ASpace<u32> = ASpace::new(0, 0xffff);
        assert!(s.register(0, 0x1000, 0).is_ok());
        assert!(s.register(0x2000, 0x1000, 1).is_ok());

        assert_eq!(s.register(0, 0x1000, 2), Err(Error::Conflict));
        assert_eq!(s.register(0xfff, 0x2, 2), Err(Error::Conflict));
        assert_eq!(s.register(0x1ff0, 0x11, 2), Err(Error::Conflict));
        assert_eq!(s.register(0x2fff, 0x10, 2), Err(Error::Conflict));
        assert_eq!(s.register(0x1ff0, 0x1100, 2), Err(Error::Conflict));

        // abutting on both sides is fine
        assert!(s.register(0x1000, 0x1000, 3).is_ok());
    }

    #[test]
    fn region_lookup() {
        let end = 0xffff;
        let mut s: ASpace<u32> = ASpace::new(0, end);
        assert!(s.register(0x100, 0x100, 0).is_ok());
        assert!(s.register(0xf000, 0x1000, 1).is_ok());

        assert_eq!(s.region_at(0x100), Ok((0x100, 0x100, &0)));
        assert_eq!(s.region_at(0x1ff), Ok((0x100, 0x100, &0)));
        assert_eq!(s.region_at(end), Ok((0xf000, 0x1000, &1)));
        assert_eq!(s.region_at(0x200), Err(Error::NotFound));
        assert_eq!(s.region_at(0xff), Err(Error::NotFound));
        assert_eq!(s.region_at(end + 1), Err(Error::OutOfRange));

        assert_eq!(s.unregister(0x100), Ok(0));
        assert_eq!(s.unregister(0x100), Err(Error::NotFound));
        assert_eq!(s.region_at(0x180), Err(Error::NotFound));
    }

    #[test]
    fn covered_by_partial() {
        let mut s: ASpace<char> = ASpace::new(0, 0xff);
        assert!(s.register(0x00, 0x10, 'a').is_ok());
        assert!(s.register(0x10, 0x10, 'b').is_ok());
        assert!(s.register(0x40, 0x10, 'c').is_ok());

        let hits: Vec<char> =
            s.covered_by(0x08..=0x11).map(|(_, _, c)| *c).collect();
        assert_eq!(hits, vec!['a', 'b']);

        let hits: Vec<char> =
            s.covered_by(0x20..0x40).map(|(_, _, c)| *c).collect();
        assert!(hits.is_empty());

        let all: Vec<usize> = s.iter().map(|(start, _, _)| start).collect();
        assert_eq!(all, vec![0x00, 0x10, 0x40]);
    }
}
