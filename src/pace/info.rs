// Copyright (C) 2022 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

use bitflags::bitflags;
use hex_literal::hex;

use crate::tlv::{tag, Tlv};

/// id-PACE, TR-03110 part 3 § A.1.1.1
pub const ID_PACE: [u8; 8] = hex!("04 00 7F 00 07 02 02 04");
/// id-roles, TR-03110 part 3 § C.4
pub const ID_ROLES: [u8; 8] = hex!("04 00 7F 00 07 03 01 02");
/// Version advertised in PACEInfo
pub const PACE_VERSION: u8 = 2;
/// brainpoolP256r1
pub const DEFAULT_DOMAIN_PARAMETERS: u8 = 13;

bitflags! {
    /// The PACE mappings a card accepts.
    ///
    /// Used in [`PaceOptions`](PaceOptions::allowed_mappings)
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Mappings: u8 {
        /// Generic mapping, finite field Diffie-Hellman
        const DH_GM = 1;
        /// Generic mapping, elliptic curve Diffie-Hellman
        const ECDH_GM = 1 << 1;
        /// Integrated mapping, finite field Diffie-Hellman
        const DH_IM = 1 << 2;
        /// Integrated mapping, elliptic curve Diffie-Hellman
        const ECDH_IM = 1 << 3;
        /// Chip authentication mapping
        const ECDH_CAM = 1 << 4;
    }
}

const OID_COMPONENTS: [(Mappings, u8); 5] = [
    (Mappings::DH_GM, 1),
    (Mappings::ECDH_GM, 2),
    (Mappings::DH_IM, 3),
    (Mappings::ECDH_IM, 4),
    (Mappings::ECDH_CAM, 6),
];

impl Mappings {
    /// The object identifier component of a single mapping
    pub fn oid_component(self) -> Option<u8> {
        OID_COMPONENTS
            .iter()
            .find(|(mapping, _)| *mapping == self)
            .map(|(_, component)| *component)
    }

    /// The mapping identified by a component of a PACE protocol OID
    pub fn from_oid_component(component: u8) -> Option<Self> {
        OID_COMPONENTS
            .iter()
            .find(|(_, c)| *c == component)
            .map(|(mapping, _)| *mapping)
    }
}

/// Symmetric cipher and key length of the secure messaging channel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cipher {
    /// 3DES CBC / CBC-MAC
    TripleDes = 1,
    /// AES-128 CBC / CMAC
    Aes128 = 2,
    /// AES-192 CBC / CMAC
    Aes192 = 3,
    /// AES-256 CBC / CMAC
    Aes256 = 4,
}

impl Cipher {
    fn from_oid_component(component: u8) -> Option<Self> {
        match component {
            1 => Some(Self::TripleDes),
            2 => Some(Self::Aes128),
            3 => Some(Self::Aes192),
            4 => Some(Self::Aes256),
            _ => None,
        }
    }
}

/// A PACE protocol, e.g. `id-PACE-ECDH-GM-AES-CBC-CMAC-128`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PaceProtocol {
    /// The nonce mapping
    pub mapping: Mappings,
    /// The cipher for secure messaging
    pub cipher: Cipher,
}

impl PaceProtocol {
    /// Decodes a PACE protocol object identifier
    pub fn from_oid(oid: &[u8]) -> Option<Self> {
        match oid.strip_prefix(ID_PACE.as_slice())? {
            [mapping, cipher] => Some(Self {
                mapping: Mappings::from_oid_component(*mapping)?,
                cipher: Cipher::from_oid_component(*cipher)?,
            }),
            _ => None,
        }
    }

    /// `None` if `mapping` is not a single mapping
    pub fn oid(&self) -> Option<Vec<u8>> {
        let mut oid = Vec::from(ID_PACE);
        oid.push(self.mapping.oid_component()?);
        oid.push(self.cipher as u8);
        Some(oid)
    }
}

/// Options for the PACE protocol.
#[derive(Clone, Copy, Debug)]
#[non_exhaustive]
pub struct PaceOptions {
    /// Bitflags of mappings terminals may select
    pub allowed_mappings: Mappings,
    /// Standardized domain parameter id used for all mappings
    pub domain_parameters: u8,
}

impl Default for PaceOptions {
    fn default() -> Self {
        Self {
            allowed_mappings: Mappings::all(),
            domain_parameters: DEFAULT_DOMAIN_PARAMETERS,
        }
    }
}

impl PaceOptions {
    /// One PACEInfo per allowed mapping, using AES-128
    pub fn pace_infos(&self) -> Vec<Tlv> {
        self.allowed_mappings
            .iter()
            .map(|mapping| PaceProtocol {
                mapping,
                cipher: Cipher::Aes128,
            })
            .filter_map(|protocol| protocol.oid())
            .map(|oid| {
                Tlv::constructed(
                    tag(0x30),
                    vec![
                        Tlv::primitive(tag(0x06), oid),
                        Tlv::primitive(tag(0x02), [PACE_VERSION]),
                        Tlv::primitive(tag(0x02), [self.domain_parameters]),
                    ],
                )
            })
            .collect()
    }
}
