// Copyright (C) 2022 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

//! Utilities for dealing with BER-TLV (Tag-Length-Value) encoded data

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Longest tag accepted by the parser.
pub const MAX_TAG_LENGTH: usize = 4;

/// Deepest nesting of constructed data objects accepted by the parser.
///
/// Data objects nested deeper are rejected as malformed.
pub const MAX_NESTING: usize = 16;

/// A BER-TLV tag, kept in its encoded form.
///
/// Equality is structural: two tags are equal when their encodings are.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Tag(heapless::Vec<u8, MAX_TAG_LENGTH>);

impl Tag {
    /// Validates and wraps an encoded tag.
    pub fn from_slice(encoded: &[u8]) -> Result<Self, Error> {
        match take_tag(encoded) {
            Some((tag, [])) => Ok(tag),
            Some(_) | None => Err(Error::InvalidTag),
        }
    }

    /// The encoded tag
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Bit 6 of the first byte
    pub fn is_constructed(&self) -> bool {
        self.0.first().map_or(false, |b| b & 0x20 != 0)
    }
}

impl TryFrom<u32> for Tag {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Error> {
        let bytes = value.to_be_bytes();
        let start = bytes.iter().position(|b| *b != 0).ok_or(Error::InvalidTag)?;
        Self::from_slice(&bytes[start..])
    }
}

impl From<Tag> for u32 {
    fn from(tag: Tag) -> u32 {
        tag.0.iter().fold(0, |acc, b| (acc << 8) | u32::from(*b))
    }
}

impl core::fmt::Debug for Tag {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Tag(")?;
        for b in self.0.iter() {
            write!(f, "{b:02X}")?;
        }
        write!(f, ")")
    }
}

impl core::fmt::Display for Tag {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for b in self.0.iter() {
            write!(f, "{b:02X}")?;
        }
        Ok(())
    }
}

/// Content of a data object
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    /// Content of a primitive object
    Primitive(Vec<u8>),
    /// Nested data objects
    Constructed(Vec<Tlv>),
}

/// A decoded data object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tlv {
    tag: Tag,
    value: Value,
}

impl Tlv {
    /// A primitive data object
    pub fn primitive(tag: Tag, value: impl Into<Vec<u8>>) -> Self {
        Self {
            tag,
            value: Value::Primitive(value.into()),
        }
    }

    /// A constructed data object
    pub fn constructed(tag: Tag, children: Vec<Tlv>) -> Self {
        Self {
            tag,
            value: Value::Constructed(children),
        }
    }

    /// The tag
    pub fn tag(&self) -> &Tag {
        &self.tag
    }

    /// The content
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// The nested data objects, empty for primitive objects
    pub fn children(&self) -> &[Tlv] {
        match &self.value {
            Value::Constructed(children) => children,
            Value::Primitive(_) => &[],
        }
    }

    /// The content bytes of a primitive object
    pub fn bytes(&self) -> Option<&[u8]> {
        match &self.value {
            Value::Primitive(bytes) => Some(bytes),
            Value::Constructed(_) => None,
        }
    }

    /// First direct child with the given tag
    pub fn find(&self, tag: &Tag) -> Option<&Tlv> {
        self.children().iter().find(|c| c.tag == *tag)
    }

    /// Appends the encoding to `buf`
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.tag.as_bytes());
        match &self.value {
            Value::Primitive(bytes) => {
                append_len(buf, bytes.len());
                buf.extend_from_slice(bytes);
            }
            Value::Constructed(children) => {
                let offset = buf.len();
                for child in children {
                    child.encode_into(buf);
                }
                prepend_len(buf, offset);
            }
        }
    }

    /// Encodes the data object
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }
}

/// Parses all data objects of `data`, descending into constructed tags.
///
/// Fails with [`Error::MalformedTlv`] when constructed objects are nested deeper than
/// [`MAX_NESTING`] levels.
pub fn parse_all(data: &[u8]) -> Result<Vec<Tlv>, Error> {
    parse_level(data, 0)
}

fn parse_level(mut data: &[u8], depth: usize) -> Result<Vec<Tlv>, Error> {
    let mut objects = Vec::new();
    while !data.is_empty() {
        let (tag, value, remainder) = take_do(data).ok_or(Error::MalformedTlv)?;
        let value = if tag.is_constructed() {
            if depth + 1 >= MAX_NESTING {
                warn!("Data objects nested deeper than {MAX_NESTING} levels");
                return Err(Error::MalformedTlv);
            }
            Value::Constructed(parse_level(value, depth + 1)?)
        } else {
            Value::Primitive(value.into())
        };
        objects.push(Tlv { tag, value });
        data = remainder;
    }
    Ok(objects)
}

/// Encodes a sequence of data objects.
pub fn encode_all(objects: &[Tlv]) -> Vec<u8> {
    let mut buf = Vec::new();
    for object in objects {
        object.encode_into(&mut buf);
    }
    buf
}

/// Follows `tag_path` through nested objects, taking the first match on each level.
pub fn get_do<'o>(tag_path: &[Tag], objects: &'o [Tlv]) -> Option<&'o Tlv> {
    let (first, rest) = tag_path.split_first()?;
    let mut current = objects.iter().find(|o| o.tag == *first)?;
    for tag in rest {
        current = current.find(tag)?;
    }
    Some(current)
}

/// Returns (tag, data, remainder)
fn take_do(data: &[u8]) -> Option<(Tag, &[u8], &[u8])> {
    let (tag, remainder) = take_tag(data)?;
    let (len, remainder) = take_len(remainder)?;
    if remainder.len() < len {
        warn!("Tried to parse TLV with data length shorter that the length data");
        None
    } else {
        let (value, remainder) = remainder.split_at(len);
        Some((tag, value, remainder))
    }
}

// See ISO 7816-4 § 5.2.2.1 / X.690 § 8.1.2
fn take_tag(data: &[u8]) -> Option<(Tag, &[u8])> {
    let b1 = *data.first()?;
    if b1 == 0x00 || b1 == 0xFF {
        // Padding bytes, not a valid tag
        return None;
    }
    let mut len = 1;
    if (b1 & 0x1f) == 0x1f {
        loop {
            let b = *data.get(len)?;
            len += 1;
            if b & 0x80 == 0 {
                break;
            }
            if len == MAX_TAG_LENGTH {
                warn!("Got a tag larger than {MAX_TAG_LENGTH} bytes: {data:x?}");
                return None;
            }
        }
    }
    let tag = heapless::Vec::from_slice(&data[..len]).ok()?;
    Some((Tag(tag), &data[len..]))
}

/// Decodes a BER length field, returning the length and the remainder
pub fn take_len(data: &[u8]) -> Option<(usize, &[u8])> {
    let l1 = *data.first()?;
    match l1 {
        0x00..=0x7F => Some((l1 as usize, &data[1..])),
        0x81 => Some((*data.get(1)? as usize, data.get(2..)?)),
        0x82 => {
            let len = u16::from_be_bytes([*data.get(1)?, *data.get(2)?]);
            Some((len as usize, data.get(3..)?))
        }
        0x83 => {
            let len = u32::from_be_bytes([0, *data.get(1)?, *data.get(2)?, *data.get(3)?]);
            Some((len as usize, data.get(4..)?))
        }
        _ => {
            warn!("Got an unexpected length tag: {l1:x}");
            None
        }
    }
}

fn serialize_len(len: usize) -> heapless::Vec<u8, 4> {
    let mut buf = heapless::Vec::new();
    if let Ok(len) = u8::try_from(len) {
        if len <= 0x7f {
            buf.extend_from_slice(&[len]).ok();
        } else {
            buf.extend_from_slice(&[0x81, len]).ok();
        }
    } else if let Ok(len) = u16::try_from(len) {
        let arr = len.to_be_bytes();
        buf.extend_from_slice(&[0x82, arr[0], arr[1]]).ok();
    } else {
        let arr = (len as u32).to_be_bytes();
        buf.extend_from_slice(&[0x83, arr[1], arr[2], arr[3]]).ok();
    }
    buf
}

fn append_len(buf: &mut Vec<u8>, len: usize) {
    buf.extend_from_slice(&serialize_len(len));
}

/// Inserts the length of `buf[offset..]` at `offset`.
fn prepend_len(buf: &mut Vec<u8>, offset: usize) {
    let encoded = serialize_len(buf.len() - offset);
    buf.extend_from_slice(&encoded);
    buf[offset..].rotate_right(encoded.len());
}

/// Shorthand for tags known to be valid, used for the crate's constants.
///
/// Invalid input is a programming error.
pub(crate) fn tag(value: u32) -> Tag {
    match Tag::try_from(value) {
        Ok(tag) => tag,
        Err(_) => panic!("invalid tag constant {value:X}"),
    }
}
