// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use strum::FromRepr;

/// Status codes returned to the guest by SDEI calls.
///
/// These are ordinary outcomes of guest requests, reported through the
/// hypercall return registers, and never host-side errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromRepr)]
#[repr(i64)]
pub enum SdeiStatus {
    Success = 0,
    NotSupported = -1,
    InvalidParameters = -2,
    Denied = -3,
    Pending = -5,
    OutOfResource = -10,
}

impl SdeiStatus {
    /// Encodes this status as the (sign-extended) 64-bit register value.
    pub const fn to_ret(self) -> u64 {
        self as i64 as u64
    }

    /// Decodes a register value, if it holds one of the defined codes.
    pub fn from_ret(val: u64) -> Option<Self> {
        Self::from_repr(val as i64)
    }
}

impl From<SdeiStatus> for u64 {
    fn from(value: SdeiStatus) -> Self {
        value.to_ret()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn register_encoding() {
        assert_eq!(SdeiStatus::Success.to_ret(), 0);
        assert_eq!(SdeiStatus::NotSupported.to_ret(), u64::MAX);
        assert_eq!(SdeiStatus::Denied.to_ret(), (-3i64) as u64);
        assert_eq!(
            SdeiStatus::from_ret((-10i64) as u64),
            Some(SdeiStatus::OutOfResource)
        );
        assert_eq!(SdeiStatus::from_ret((-4i64) as u64), None);
    }
}
