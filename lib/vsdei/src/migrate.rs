// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Export and import of SDEI state for save/restore and live migration.
//!
//! Each migratable component ([`Sdei`](crate::Sdei), every
//! [`SdeiVcpu`](crate::SdeiVcpu), and the asynchronous page fault state of
//! each vCPU) produces one versioned payload. The VM-scoped payload must be
//! imported before any vCPU payload, since in-flight events on a vCPU refer
//! to registrations held by the VM.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors encountered while exporting or importing component state.
#[derive(Debug, Error)]
pub enum MigrateStateError {
    /// The payload could not be deserialized.
    #[error("could not deserialize state: {0}")]
    DeserializationFailed(String),

    /// The payload was well-formed but could not be applied.
    #[error("failed to apply deserialized state: {0}")]
    ImportFailed(String),

    /// The kind and/or version of payload was not expected
    #[error("kind/version of payload not expected: {0} v{1}")]
    UnexpectedPayload(String, u32),
}

impl From<erased_serde::Error> for MigrateStateError {
    fn from(err: erased_serde::Error) -> Self {
        MigrateStateError::DeserializationFailed(err.to_string())
    }
}

/// Migration support offered by a component.
pub enum Migrator<'a> {
    /// State consists of a single typed payload.
    Single(&'a dyn MigrateSingle),
}

/// A component whose state is carried in a single typed payload.
pub trait MigrateSingle: Send + Sync + 'static {
    fn export(&self) -> Result<PayloadOutput, MigrateStateError>;
    fn import(&self, offer: PayloadOffer) -> Result<(), MigrateStateError>;
}

/// State payload (of a given kind/version) offered to a component's import
/// logic.
pub struct PayloadOffer<'a> {
    pub kind: &'a str,
    pub version: u32,
    pub payload: Box<dyn erased_serde::Deserializer<'a> + 'a>,
}

impl<'a> PayloadOffer<'a> {
    /// Parses the payload, provided the offer's kind and version match those
    /// of the requested [`Schema`].
    pub fn parse<T: Schema<'a>>(&mut self) -> Result<T, MigrateStateError> {
        let id = T::id();
        if id.0 != self.kind || id.1 != self.version {
            return Err(MigrateStateError::UnexpectedPayload(
                self.kind.into(),
                self.version,
            ));
        }
        let res = erased_serde::deserialize(&mut self.payload)?;
        Ok(res)
    }
}

/// State payload (of a given kind/version) produced by a component's export
/// logic.
///
/// Best built through the [`From`] implementation for [`Schema`] types, which
/// keeps the kind/version consistent with the serialized data.
pub struct PayloadOutput {
    pub kind: &'static str,
    pub version: u32,
    pub payload: Box<dyn erased_serde::Serialize>,
}

/// Kind (`&str`) and version (u32) identifying a payload schema.
pub type SchemaId = (&'static str, u32);

/// Names the kind and version of a migration payload type.
pub trait Schema<'de>: Serialize + Deserialize<'de> + Sized + 'static {
    fn id() -> SchemaId;
}

impl<'a, T: Schema<'a>> From<T> for PayloadOutput {
    fn from(value: T) -> Self {
        let id = T::id();
        PayloadOutput { kind: id.0, version: id.1, payload: Box::new(value) }
    }
}
