// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Define a newtype for a run-time identifier of some fabric component.
//
// Identifiers are handed out from a per-type counter and are only meaningful
// within one process: they key lookup tables (passthrough slots, for example)
// and show up in log output and probes.  They are not stable across runs and
// must not be persisted.
//
// The macro takes syntax matching the newtype definition so that grepping for
// `struct EndpointId` finds the invocation.
macro_rules! define_id {
    {
        $(#[$meta_items:meta])*
        pub struct $id_name:ident($visibility:vis u32);
    } => {
        ::paste::paste! {
            $(#[$meta_items])*
            pub struct $id_name($visibility u32);

            impl $id_name {
                pub fn new() -> Self {
                    static [<_NEXT_ $id_name:upper>]: ::std::sync::atomic::AtomicU32 =
                        ::std::sync::atomic::AtomicU32::new(0);

                    let id = [<_NEXT_ $id_name:upper>].fetch_add(
                        1,
                        ::std::sync::atomic::Ordering::Relaxed
                    );
                    $id_name(id)
                }
            }

            impl ::std::fmt::Display for $id_name {
                fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                    write!(f, "{}", self.0)
                }
            }
        }
    }
}
pub(crate) use define_id;
