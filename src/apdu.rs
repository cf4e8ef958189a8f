// Copyright (C) 2022 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

//! Command and response APDUs

pub mod response;
pub mod status;

use std::iter;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::error::Error;

pub use response::ResponseApdu;
pub use status::StatusWord;

/// Largest data field of a command, with an extended length field
pub const MAX_LC: usize = 0xFFFF;
/// Largest Ne of a command, encoded as `0000` in an extended Le field
pub const MAX_LE: usize = 0x10000;

/// Transport format, as indicated by the class byte
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApduFormat {
    /// CLA `00`–`7F`, ISO 7816-4 § 5.4.1
    Interindustry,
    /// CLA `80`–`BF`, proprietary class with the interindustry bit layout
    IsoCompatibleProprietary,
    /// CLA `C0`–`FE`, no interindustry semantics
    Proprietary,
}

/// Secure messaging indication of the class byte
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecureMessaging {
    /// No secure messaging
    None,
    /// Proprietary secure messaging format
    Proprietary,
    /// Command header not processed
    Standard,
    /// Command header authenticated
    Authenticated,
}

/// ISO 7816-3 command case, i.e. which of Lc and Le are present
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsoCase {
    /// No data, no Le
    Case1,
    /// Le only
    Case2,
    /// Data only
    Case3,
    /// Data and Le
    Case4,
}

impl IsoCase {
    fn new(has_data: bool, has_le: bool) -> Self {
        match (has_data, has_le) {
            (false, false) => Self::Case1,
            (false, true) => Self::Case2,
            (true, false) => Self::Case3,
            (true, true) => Self::Case4,
        }
    }
}

/// A parsed command APDU.
///
/// Commands derived from another command (e.g. the plain command unwrapped from a secure
/// messaging command) keep a handle to it, see [`predecessors`](Self::predecessors).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandApdu {
    header: [u8; 4],
    data: Vec<u8>,
    le: Option<usize>,
    extended: bool,
    predecessor: Option<Rc<CommandApdu>>,
}

impl CommandApdu {
    /// Builds a command, choosing the extended length encoding when needed.
    ///
    /// Fails with [`Error::MalformedApdu`] when the data or Ne exceed what an extended length
    /// field can encode (65535 data bytes, Ne of 65536).
    pub fn new(
        header: [u8; 4],
        data: impl Into<Vec<u8>>,
        le: Option<usize>,
    ) -> Result<Self, Error> {
        let data = data.into();
        if data.len() > MAX_LC || le.map_or(false, |le| le == 0 || le > MAX_LE) {
            warn!("Command does not fit an APDU: {} data bytes, Ne {le:?}", data.len());
            return Err(Error::MalformedApdu);
        }
        let extended = data.len() > 0xFF || le.map_or(false, |le| le > 0x100);
        Ok(Self {
            header,
            data,
            le,
            extended,
            predecessor: None,
        })
    }

    /// Records `predecessor` as the command this command was derived from.
    pub fn with_predecessor(mut self, predecessor: Rc<CommandApdu>) -> Self {
        self.predecessor = Some(predecessor);
        self
    }

    /// The class byte
    pub fn cla(&self) -> u8 {
        self.header[0]
    }

    /// The instruction byte
    pub fn ins(&self) -> u8 {
        self.header[1]
    }

    /// The first parameter byte
    pub fn p1(&self) -> u8 {
        self.header[2]
    }

    /// The second parameter byte
    pub fn p2(&self) -> u8 {
        self.header[3]
    }

    /// The command data field, empty if absent
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Ne, the maximum number of response bytes expected
    pub fn le(&self) -> Option<usize> {
        self.le
    }

    /// The ISO case, derived from the presence of data and Le
    pub fn case(&self) -> IsoCase {
        IsoCase::new(!self.data.is_empty(), self.le.is_some())
    }

    /// Whether Lc/Le use the extended length encoding
    pub fn is_extended(&self) -> bool {
        self.extended
    }

    /// The transport format indicated by the class byte
    pub fn format(&self) -> ApduFormat {
        match self.cla() {
            0x00..=0x7F => ApduFormat::Interindustry,
            0x80..=0xBF => ApduFormat::IsoCompatibleProprietary,
            _ => ApduFormat::Proprietary,
        }
    }

    fn has_interindustry_layout(&self) -> bool {
        self.format() != ApduFormat::Proprietary
    }

    /// Further interindustry class, ISO 7816-4 table 3
    fn is_further_class(&self) -> bool {
        self.cla() & 0x40 != 0
    }

    /// The command chaining bit, if the class byte has one
    pub fn chaining(&self) -> Option<bool> {
        self.has_interindustry_layout()
            .then(|| self.cla() & 0x10 != 0)
    }

    /// The logical channel number, if the class byte encodes one
    pub fn channel(&self) -> Option<u8> {
        if !self.has_interindustry_layout() {
            return None;
        }
        if self.is_further_class() {
            Some(4 + (self.cla() & 0x0F))
        } else {
            Some(self.cla() & 0x03)
        }
    }

    /// The secure messaging indication, if the class byte encodes one
    pub fn secure_messaging(&self) -> Option<SecureMessaging> {
        if !self.has_interindustry_layout() {
            return None;
        }
        let sm = if self.is_further_class() {
            if self.cla() & 0x20 != 0 {
                SecureMessaging::Standard
            } else {
                SecureMessaging::None
            }
        } else {
            match (self.cla() >> 2) & 0x03 {
                0 => SecureMessaging::None,
                1 => SecureMessaging::Proprietary,
                2 => SecureMessaging::Standard,
                _ => SecureMessaging::Authenticated,
            }
        };
        Some(sm)
    }

    /// The command this command was derived from
    pub fn predecessor(&self) -> Option<&Rc<CommandApdu>> {
        self.predecessor.as_ref()
    }

    /// All commands this command was derived from, nearest first
    pub fn predecessors(&self) -> impl Iterator<Item = &CommandApdu> {
        iter::successors(self.predecessor.as_deref(), |c| c.predecessor.as_deref())
    }

    /// This command followed by its predecessors
    pub fn chain(&self) -> impl Iterator<Item = &CommandApdu> {
        iter::once(self).chain(self.predecessors())
    }

    /// Whether `ancestor` (by identity, not by value) is one of the predecessors
    pub fn descends_from(&self, ancestor: &Rc<CommandApdu>) -> bool {
        self.predecessors()
            .any(|c| core::ptr::eq(c, Rc::as_ptr(ancestor)))
    }

    /// Encodes the command, with the length encoding it was parsed or built with
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut res = Vec::from(self.header);
        let lc = self.data.len();
        if lc > 0 {
            if self.extended {
                res.push(0);
                res.extend_from_slice(&(lc as u16).to_be_bytes());
            } else {
                res.push(lc as u8);
            }
            res.extend_from_slice(&self.data);
        }
        if let Some(le) = self.le {
            if self.extended {
                if lc == 0 {
                    res.push(0);
                }
                // 65536 is encoded as 0000
                res.extend_from_slice(&(le as u16).to_be_bytes());
            } else {
                // 256 is encoded as 00
                res.push(le as u8);
            }
        }
        res
    }
}

impl TryFrom<&[u8]> for CommandApdu {
    type Error = Error;

    fn try_from(apdu: &[u8]) -> Result<Self, Error> {
        if apdu.len() < 4 || apdu[0] == 0xFF {
            return Err(Error::MalformedApdu);
        }
        let (header, body) = apdu.split_at(4);
        let header = [header[0], header[1], header[2], header[3]];

        let short_le = |b: u8| if b == 0 { 0x100 } else { b as usize };
        let extended_le = |b: &[u8]| match u16::from_be_bytes([b[0], b[1]]) {
            0 => 0x10000,
            le => le as usize,
        };

        let (data, le, extended) = match body {
            [] => (&body[..0], None, false),
            [le] => (&body[..0], Some(short_le(*le)), false),
            [0, rest @ ..] => {
                if rest.len() < 2 {
                    return Err(Error::MalformedApdu);
                }
                if rest.len() == 2 {
                    (&body[..0], Some(extended_le(rest)), true)
                } else {
                    let lc = u16::from_be_bytes([rest[0], rest[1]]) as usize;
                    let rest = &rest[2..];
                    if lc == 0 {
                        return Err(Error::MalformedApdu);
                    } else if rest.len() == lc {
                        (rest, None, true)
                    } else if rest.len() == lc + 2 {
                        (&rest[..lc], Some(extended_le(&rest[lc..])), true)
                    } else {
                        return Err(Error::MalformedApdu);
                    }
                }
            }
            [lc, rest @ ..] => {
                let lc = *lc as usize;
                if rest.len() == lc {
                    (rest, None, false)
                } else if rest.len() == lc + 1 {
                    (&rest[..lc], Some(short_le(rest[lc])), false)
                } else {
                    return Err(Error::MalformedApdu);
                }
            }
        };

        Ok(Self {
            header,
            data: data.into(),
            le,
            extended,
            predecessor: None,
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use hex_literal::hex;
    use test_log::test;

    fn parse(bytes: &[u8]) -> CommandApdu {
        CommandApdu::try_from(bytes).unwrap()
    }

    #[test]
    fn cases() {
        let c = parse(&hex!("00 84 0000"));
        assert_eq!(c.case(), IsoCase::Case1);
        assert_eq!(c.le(), None);

        let c = parse(&hex!("00 84 0000 00"));
        assert_eq!(c.case(), IsoCase::Case2);
        assert_eq!(c.le(), Some(256));
        assert!(!c.is_extended());

        let c = parse(&hex!("00 22 C1A4 03 830102"));
        assert_eq!(c.case(), IsoCase::Case3);
        assert_eq!(c.data(), hex!("830102"));

        let c = parse(&hex!("10 86 0000 02 7C00 00"));
        assert_eq!(c.case(), IsoCase::Case4);
        assert_eq!(c.data(), hex!("7C00"));
        assert_eq!(c.le(), Some(256));
    }

    #[test]
    fn extended() {
        let c = parse(&hex!("00 B0 0000 00 0000"));
        assert_eq!(c.case(), IsoCase::Case2);
        assert_eq!(c.le(), Some(65536));
        assert!(c.is_extended());

        let c = parse(&hex!("00 2A 9E9A 00 0003 010203"));
        assert_eq!(c.case(), IsoCase::Case3);
        assert!(c.is_extended());

        let c = parse(&hex!("00 2A 9E9A 00 0002 0102 0100"));
        assert_eq!(c.case(), IsoCase::Case4);
        assert_eq!(c.le(), Some(256));
        assert!(c.is_extended());
    }

    #[test]
    fn malformed() {
        for bytes in [
            &hex!("00 84 00")[..],
            &hex!("00 22 C1A4 05 0102")[..],
            &hex!("00 22 C1A4 00 01")[..],
            &hex!("00 22 C1A4 00 0000 01")[..],
            &hex!("00 22 C1A4 00 0003 0102")[..],
            &hex!("FF 22 C1A4")[..],
        ] {
            assert_eq!(CommandApdu::try_from(bytes), Err(Error::MalformedApdu));
        }
    }

    #[test]
    fn serialize() {
        for bytes in [
            &hex!("00 84 0000")[..],
            &hex!("00 84 0000 08")[..],
            &hex!("00 22 C1A4 03 830102")[..],
            &hex!("10 86 0000 02 7C00 00")[..],
            &hex!("00 B0 0000 00 0000")[..],
            &hex!("00 2A 9E9A 00 0002 0102 0100")[..],
        ] {
            assert_eq!(parse(bytes).to_bytes(), bytes);
        }
        let built = CommandApdu::new(hex!("00 2A 9E9A"), vec![0; 300], Some(256)).unwrap();
        assert!(built.is_extended());
        assert_eq!(&built.to_bytes()[..7], hex!("00 2A 9E9A 00 012C"));
    }

    #[test]
    fn length_limits() {
        let largest = CommandApdu::new(hex!("00 D6 0000"), vec![0; MAX_LC], Some(MAX_LE)).unwrap();
        let bytes = largest.to_bytes();
        assert_eq!(&bytes[..7], hex!("00 D6 0000 00 FFFF"));
        assert_eq!(&bytes[bytes.len() - 2..], hex!("0000"));
        assert_eq!(CommandApdu::try_from(bytes.as_slice()), Ok(largest));

        assert_eq!(
            CommandApdu::new(hex!("00 D6 0000"), vec![0; MAX_LC + 1], None),
            Err(Error::MalformedApdu)
        );
        assert_eq!(
            CommandApdu::new(hex!("00 B0 0000"), Vec::new(), Some(MAX_LE + 1)),
            Err(Error::MalformedApdu)
        );
        assert_eq!(
            CommandApdu::new(hex!("00 B0 0000"), Vec::new(), Some(0)),
            Err(Error::MalformedApdu)
        );
    }

    #[test]
    fn class_byte() {
        let c = parse(&hex!("0C 22 C1A4"));
        assert_eq!(c.format(), ApduFormat::Interindustry);
        assert_eq!(c.secure_messaging(), Some(SecureMessaging::Authenticated));
        assert_eq!(c.chaining(), Some(false));
        assert_eq!(c.channel(), Some(0));

        let c = parse(&hex!("13 86 0000"));
        assert_eq!(c.chaining(), Some(true));
        assert_eq!(c.channel(), Some(3));
        assert_eq!(c.secure_messaging(), Some(SecureMessaging::None));

        let c = parse(&hex!("6A 86 0000"));
        assert_eq!(c.channel(), Some(14));
        assert_eq!(c.secure_messaging(), Some(SecureMessaging::Standard));
        assert_eq!(c.chaining(), Some(false));

        let c = parse(&hex!("84 86 0000"));
        assert_eq!(c.format(), ApduFormat::IsoCompatibleProprietary);
        assert_eq!(c.secure_messaging(), Some(SecureMessaging::Proprietary));

        let c = parse(&hex!("D0 86 0000"));
        assert_eq!(c.format(), ApduFormat::Proprietary);
        assert_eq!(c.chaining(), None);
        assert_eq!(c.channel(), None);
        assert_eq!(c.secure_messaging(), None);
    }

    #[test]
    fn predecessors() {
        let wrapped = Rc::new(parse(&hex!("0C 22 C1A4 03 870101")));
        let plain = Rc::new(parse(&hex!("00 22 C1A4 03 830102")).with_predecessor(wrapped.clone()));
        let copy = Rc::new(parse(&hex!("0C 22 C1A4 03 870101")));
        assert!(plain.descends_from(&wrapped));
        assert!(!plain.descends_from(&copy));
        assert!(!plain.descends_from(&plain));
        assert_eq!(plain.chain().count(), 2);
        assert_eq!(plain.predecessors().next(), Some(&*wrapped));
    }
}
