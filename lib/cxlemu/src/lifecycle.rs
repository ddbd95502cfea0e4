// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/// General trait for emulated CXL components.
///
/// The owner of a [Fabric](crate::Fabric) drives every component through
/// these phases as the machine which contains it starts, pauses and resets.
pub trait Lifecycle: Send + Sync + 'static {
    /// Unique name for components of a given type
    fn type_name(&self) -> &'static str;

    /// Called once, before the guest first runs.  Components which need
    /// outside resources (a hotness tracker socket, for example) should have
    /// them in hand by the time this returns.
    fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Stop producing new work (epoch timers, interrupts) until resumed.
    fn pause(&self) {}

    /// Resume servicing the guest after a pause.
    fn resume(&self) {}

    /// Return to the state the component would have on a cold start.
    ///
    /// N.B. Only called on paused components.
    fn reset(&self) {}

    /// The component is about to be discarded.
    fn halt(&self) {}
}
