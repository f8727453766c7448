// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::migrate::Migrator;

/// Lifecycle events delivered to the SDEI components of a VM.
///
/// The embedding VMM drives [`Sdei`](crate::Sdei), each
/// [`SdeiVcpu`](crate::SdeiVcpu), and each asynchronous page fault vCPU
/// through these as the VM is reset or migrated.
pub trait Lifecycle: Send + Sync + 'static {
    /// Unique name for components of a given type
    fn type_name(&self) -> &'static str;

    /// Returns the component to the state it would have on a cold start.
    ///
    /// N.B. Called only while all vCPUs are stopped.
    fn reset(&self) {}

    /// Return the Migrator used to export/import this component's state.
    fn migrate(&'_ self) -> Migrator<'_>;
}
