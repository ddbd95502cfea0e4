// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Byte-addressable backing memory for emulated devices.

use std::sync::Mutex;

/// A contiguous RAM backing store, addressed from zero.
pub struct Ram {
    name: String,
    bytes: Mutex<Vec<u8>>,
    len: u64,
}
impl Ram {
    pub fn new(name: impl Into<String>, len: u64) -> Self {
        Self {
            name: name.into(),
            bytes: Mutex::new(vec![0; len as usize]),
            len,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn len(&self) -> u64 {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Does `[off, off + len)` fall entirely within the store?
    pub fn contains(&self, off: u64, len: u64) -> bool {
        off.checked_add(len).map_or(false, |end| end <= self.len)
    }

    /// Fill `data` from offset `off`.  Returns false, leaving `data`
    /// untouched, if the range is out of bounds.
    pub fn read(&self, off: u64, data: &mut [u8]) -> bool {
        if !self.contains(off, data.len() as u64) {
            return false;
        }
        let off = off as usize;
        let bytes = self.bytes.lock().unwrap();
        data.copy_from_slice(&bytes[off..(off + data.len())]);
        true
    }

    /// Store `data` at offset `off`.  Returns false if the range is out of
    /// bounds.
    pub fn write(&self, off: u64, data: &[u8]) -> bool {
        if !self.contains(off, data.len() as u64) {
            return false;
        }
        let off = off as usize;
        let mut bytes = self.bytes.lock().unwrap();
        bytes[off..(off + data.len())].copy_from_slice(data);
        true
    }

    /// Zero the entire store
    pub fn clear(&self) {
        self.bytes.lock().unwrap().fill(0);
    }
}
impl std::fmt::Debug for Ram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ram")
            .field("name", &self.name)
            .field("len", &self.len)
            .finish()
    }
}
