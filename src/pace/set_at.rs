// Copyright (C) 2022 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

use super::info::{PaceOptions, PaceProtocol, ID_ROLES};
use crate::accessor::{PasswordRef, TerminalType};
use crate::apdu::StatusWord;
use crate::error::ProcessingError;
use crate::tlv::{get_do, tag, Tlv};

/// Certificate holder authorization template sent by the terminal
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chat {
    /// The terminal type of the role OID
    pub terminal: TerminalType,
    /// The complete template, tag included
    pub encoded: Vec<u8>,
}

/// Parameters of MSE:Set AT for PACE, TR-03110 part 3 § B.14.1
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetAt {
    /// The encoded protocol object identifier
    pub oid: Vec<u8>,
    /// The decoded protocol
    pub protocol: PaceProtocol,
    /// The selected password
    pub password: PasswordRef,
    /// The certificate holder authorization template, if present
    pub chat: Option<Chat>,
}

impl SetAt {
    /// Decodes the data objects of MSE:Set AT
    pub fn parse(objects: &[Tlv], options: &PaceOptions) -> Result<Self, ProcessingError> {
        let oid = primitive(objects, 0x80)
            .ok_or_else(|| ProcessingError::new(StatusWord::WRONG_DATA, "missing protocol"))?;
        let protocol = PaceProtocol::from_oid(oid).ok_or_else(|| {
            ProcessingError::new(StatusWord::WRONG_DATA, format!("unsupported protocol {oid:02x?}"))
        })?;
        if !options.allowed_mappings.contains(protocol.mapping) {
            return Err(ProcessingError::new(
                StatusWord::WRONG_DATA,
                format!("{:?} not allowed", protocol.mapping),
            ));
        }

        let password = match primitive(objects, 0x83) {
            Some([reference]) => PasswordRef::try_from(*reference)?,
            _ => {
                return Err(ProcessingError::new(
                    StatusWord::WRONG_DATA,
                    "invalid password reference",
                ))
            }
        };

        match primitive(objects, 0x84) {
            None => {}
            Some([id]) if *id == options.domain_parameters => {}
            Some(id) => {
                return Err(ProcessingError::new(
                    StatusWord::REFERENCED_DATA_NOT_FOUND,
                    format!("unknown domain parameters {id:02x?}"),
                ))
            }
        }

        let chat = get_do(&[tag(0x7F4C)], objects).map(parse_chat).transpose()?;

        Ok(Self {
            oid: oid.into(),
            protocol,
            password,
            chat,
        })
    }
}

fn primitive(objects: &[Tlv], id: u32) -> Option<&[u8]> {
    get_do(&[tag(id)], objects).and_then(Tlv::bytes)
}

fn parse_chat(chat: &Tlv) -> Result<Chat, ProcessingError> {
    let role = chat.find(&tag(0x06)).and_then(Tlv::bytes);
    let terminal = match role.and_then(|oid| oid.strip_prefix(ID_ROLES.as_slice())) {
        Some([terminal]) => TerminalType::try_from(*terminal).ok(),
        _ => None,
    };
    let terminal = terminal.ok_or_else(|| {
        ProcessingError::new(StatusWord::WRONG_DATA, format!("unknown terminal role {role:02x?}"))
    })?;
    Ok(Chat {
        terminal,
        encoded: chat.to_bytes(),
    })
}
