// Copyright (C) 2022 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

//! Errors of the APDU layer and of protocol transitions

use std::borrow::Cow;

use iso7816::Status;

use crate::apdu::status::StatusWord;

/// Errors of the command and data field codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The command bytes do not form a valid short or extended APDU
    MalformedApdu,
    /// The data is not a valid sequence of BER-TLV data objects
    MalformedTlv,
    /// A tag longer than supported was found
    TagTooLong,
    /// A tag value that cannot be encoded as BER tag
    InvalidTag,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let to_write = match self {
            Error::MalformedApdu => "Command APDU is malformed",
            Error::MalformedTlv => "Data is not valid BER-TLV",
            Error::TagTooLong => "Tag exceeds the supported length",
            Error::InvalidTag => "Invalid BER-TLV tag",
        };
        f.write_str(to_write)
    }
}

impl std::error::Error for Error {}

/// A fault raised by protocol action code.
///
/// The protocol engine catches it at the loop boundary and turns it into the status word of the
/// response; it never leaves [`ProtocolEngine::process`][crate::engine::ProtocolEngine::process].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingError {
    status: StatusWord,
    reason: Cow<'static, str>,
}

impl ProcessingError {
    /// Creates a fault answered with `status`.
    pub fn new(status: impl Into<StatusWord>, reason: impl Into<Cow<'static, str>>) -> Self {
        Self {
            status: status.into(),
            reason: reason.into(),
        }
    }

    /// The status word the command is answered with.
    pub fn status(&self) -> StatusWord {
        self.status
    }

    /// Human readable description of the fault.
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl From<Status> for ProcessingError {
    fn from(status: Status) -> Self {
        Self {
            status: status.into(),
            reason: Cow::Borrowed(""),
        }
    }
}

impl From<StatusWord> for ProcessingError {
    fn from(status: StatusWord) -> Self {
        Self {
            status,
            reason: Cow::Borrowed(""),
        }
    }
}

impl core::fmt::Display for ProcessingError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.reason.is_empty() {
            write!(f, "processing failed with {}", self.status)
        } else {
            write!(f, "{} ({})", self.reason, self.status)
        }
    }
}

impl std::error::Error for ProcessingError {}
