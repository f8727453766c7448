// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeSet;
use std::path::Path;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

pub use vsdei_types::{EventDesc, EventKind, EventPriority, SdeiConfig};

/// Top-level configuration file contents.
///
/// The SDEI settings live under an `[sdei]` table so that the file can be
/// shared with other per-VM configuration.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub sdei: SdeiConfig,
}

/// Errors which may be returned when parsing the SDEI configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Event number {0:#x} is not in the virtual namespace")]
    InvalidEventNumber(u32),

    #[error("Event number {0:#x} is defined more than once")]
    DuplicateEvent(u32),

    #[error("max_registrations must be nonzero")]
    NoRegistrations,

    #[error("max_vcpus must be nonzero")]
    NoVcpus,
}

/// Checks an [SdeiConfig] for consistency before it is handed to the library.
pub fn validate(cfg: &SdeiConfig) -> Result<(), ParseError> {
    if cfg.max_registrations == 0 {
        return Err(ParseError::NoRegistrations);
    }
    if cfg.max_vcpus == 0 {
        return Err(ParseError::NoVcpus);
    }

    let mut seen = BTreeSet::new();
    for ev in cfg.events.iter() {
        if !vsdei_types::is_virtual_event(ev.number as u64) {
            return Err(ParseError::InvalidEventNumber(ev.number));
        }
        if !seen.insert(ev.number) {
            return Err(ParseError::DuplicateEvent(ev.number));
        }
    }
    Ok(())
}

/// Parses and validates configuration from a string of TOML.
pub fn from_str(contents: &str) -> Result<Config, ParseError> {
    let cfg = toml::from_str::<Config>(contents)?;
    validate(&cfg.sdei)?;
    Ok(cfg)
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    from_str(&contents)
}
