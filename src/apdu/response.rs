// Copyright (C) 2022 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

//! Response APDUs

use crate::apdu::status::StatusWord;
use crate::tlv::{self, Tlv};

/// A response: optional TLV encoded data followed by the status word.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseApdu {
    data: Option<Vec<Tlv>>,
    status: StatusWord,
}

impl ResponseApdu {
    /// A response without data
    pub fn new(status: impl Into<StatusWord>) -> Self {
        Self {
            data: None,
            status: status.into(),
        }
    }

    /// A response with data objects
    pub fn with_data(data: Vec<Tlv>, status: impl Into<StatusWord>) -> Self {
        Self {
            data: Some(data),
            status: status.into(),
        }
    }

    /// The concluding status word
    pub fn status_word(&self) -> StatusWord {
        self.status
    }

    /// The data objects, `None` for responses without data
    pub fn data(&self) -> Option<&[Tlv]> {
        self.data.as_deref()
    }

    /// Response data followed by SW1 SW2
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut res = self.data.as_deref().map(tlv::encode_all).unwrap_or_default();
        res.extend_from_slice(&self.status.to_bytes());
        res
    }
}
