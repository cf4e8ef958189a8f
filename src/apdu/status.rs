// Copyright (C) 2022 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

//! ISO 7816-4 status words

use iso7816::Status;
use serde::{Deserialize, Serialize};

/// A two byte status word (SW1 SW2) concluding every response.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusWord(u16);

impl StatusWord {
    /// `9000`, normal processing
    pub const SUCCESS: Self = Self(0x9000);

    /// `6300`, verification failed without retry counter
    pub const VERIFICATION_FAILED: Self = Self(0x6300);
    /// `6400`, execution error, state of non-volatile memory unchanged
    pub const EXECUTION_ERROR: Self = Self(0x6400);
    /// `6700`, wrong length
    pub const WRONG_LENGTH: Self = Self(0x6700);
    /// `6881`, logical channel not supported
    pub const LOGICAL_CHANNEL_NOT_SUPPORTED: Self = Self(0x6881);
    /// `6882`, secure messaging not supported
    pub const SECURE_MESSAGING_NOT_SUPPORTED: Self = Self(0x6882);
    /// `6884`, command chaining not supported
    pub const COMMAND_CHAINING_NOT_SUPPORTED: Self = Self(0x6884);
    /// `6982`, security status not satisfied
    pub const SECURITY_STATUS_NOT_SATISFIED: Self = Self(0x6982);
    /// `6983`, authentication method blocked
    pub const AUTHENTICATION_METHOD_BLOCKED: Self = Self(0x6983);
    /// `6985`, conditions of use not satisfied
    pub const CONDITIONS_OF_USE_NOT_SATISFIED: Self = Self(0x6985);
    /// `6A80`, incorrect parameters in the command data field
    pub const WRONG_DATA: Self = Self(0x6A80);
    /// `6A81`, function not supported
    pub const FUNCTION_NOT_SUPPORTED: Self = Self(0x6A81);
    /// Nc inconsistent with the TLV structure
    pub const MALFORMED_DATA: Self = Self(0x6A85);
    /// `6A86`, incorrect parameters P1-P2
    pub const INCORRECT_P1_P2: Self = Self(0x6A86);
    /// `6A88`, referenced data or reference data not found
    pub const REFERENCED_DATA_NOT_FOUND: Self = Self(0x6A88);
    /// `6D00`, instruction code not supported or invalid
    pub const INSTRUCTION_NOT_SUPPORTED: Self = Self(0x6D00);
    /// `6E00`, class not supported
    pub const CLASS_NOT_SUPPORTED: Self = Self(0x6E00);
    /// `6F00`, no precise diagnosis
    pub const UNKNOWN_ERROR: Self = Self(0x6F00);

    /// Wraps a raw status word
    pub const fn new(sw: u16) -> Self {
        Self(sw)
    }

    /// Status word from SW1 and SW2
    pub const fn from_bytes(sw1: u8, sw2: u8) -> Self {
        Self(u16::from_be_bytes([sw1, sw2]))
    }

    /// `63CX`, the warning carrying a retry counter in its low nibble.
    ///
    /// Counters above 15 do not fit and are reported as `63CF`.
    pub const fn retry_counter(remaining: u8) -> Self {
        let remaining = if remaining > 0x0F { 0x0F } else { remaining };
        Self(0x63C0 | remaining as u16)
    }

    /// `61XX`, more response data available
    pub const fn more_available(remaining: u8) -> Self {
        Self(0x6100 | remaining as u16)
    }

    /// The raw status word
    pub const fn value(self) -> u16 {
        self.0
    }

    /// SW1 SW2 as sent to the terminal
    pub const fn to_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    /// The first status byte
    pub const fn sw1(self) -> u8 {
        self.to_bytes()[0]
    }

    /// The second status byte
    pub const fn sw2(self) -> u8 {
        self.to_bytes()[1]
    }

    /// Whether this is `9000`
    pub const fn is_success(self) -> bool {
        self.0 == Self::SUCCESS.0
    }

    /// Statuses that do not conclude processing of a command.
    ///
    /// `61XX` is reserved for intermediate responses handed between protocols.
    pub const fn is_intermediate(self) -> bool {
        self.sw1() == 0x61
    }

    /// `62XX` and `63XX`
    pub const fn is_warning(self) -> bool {
        matches!(self.sw1(), 0x62 | 0x63)
    }

    /// `64XX` to `6FXX`
    pub const fn is_error(self) -> bool {
        matches!(self.sw1(), 0x64..=0x6F)
    }

    /// Whether this is any of the `63CX` retry counter warnings
    pub const fn is_63cx_counter(self) -> bool {
        self.0 & 0xFFF0 == 0x63C0
    }

    /// The counter value of a `63CX` status word
    pub const fn counter(self) -> Option<u8> {
        if self.is_63cx_counter() {
            Some((self.0 & 0x000F) as u8)
        } else {
            None
        }
    }
}

impl From<u16> for StatusWord {
    fn from(sw: u16) -> Self {
        Self(sw)
    }
}

impl From<StatusWord> for u16 {
    fn from(sw: StatusWord) -> Self {
        sw.0
    }
}

impl From<Status> for StatusWord {
    fn from(status: Status) -> Self {
        Self(status.into())
    }
}

impl core::fmt::Debug for StatusWord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "SW({:04X})", self.0)
    }
}

impl core::fmt::Display for StatusWord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}
