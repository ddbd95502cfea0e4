// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Mutex;

use slog::Logger;

/// Delivery of message-signalled interrupts on behalf of a device.
///
/// Implementations pick MSI-X when the function has it enabled and fall back
/// to plain MSI otherwise.
pub trait MsiNotifier: Send + Sync + 'static {
    fn notify(&self, vector: u16);
}

/// Discards all notifications
pub struct NoMsi;
impl MsiNotifier for NoMsi {
    fn notify(&self, _vector: u16) {}
}

/// Logs and records every notification, in order of delivery.
pub struct MsiRecorder {
    log: Logger,
    sent: Mutex<Vec<u16>>,
}
impl MsiRecorder {
    pub fn new(log: Logger) -> Self {
        Self { log, sent: Mutex::new(Vec::new()) }
    }
    pub fn sent(&self) -> Vec<u16> {
        self.sent.lock().unwrap().clone()
    }
    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}
impl MsiNotifier for MsiRecorder {
    fn notify(&self, vector: u16) {
        slog::info!(self.log, "msi notify"; "vector" => vector);
        self.sent.lock().unwrap().push(vector);
    }
}
