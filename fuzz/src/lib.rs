// Copyright (C) 2022 Nitrokey GmbH
// SPDX-License-Identifier: CC0-1.0

use std::rc::Rc;

use arbitrary::Arbitrary;
use cardengine::accessor::{MemoryCardState, PasswordRef, PasswordState};
use cardengine::context::SessionKeys;
use cardengine::error::ProcessingError;
use cardengine::pace::{Authentication, Mappings, Pace, PaceMechanism, PaceOptions, PaceProtocol};
use cardengine::{Card, Options};

pub const CAN: &[u8] = b"500540";
pub const PIN: &[u8] = b"123456";

#[derive(Arbitrary, Debug)]
pub struct Input {
    pub commands: Vec<Vec<u8>>,
    pub pin_counter: u8,
    pub allowed_mappings: u8,
}

/// Mechanism accepting the password itself as authentication token
#[derive(Debug, Default)]
pub struct PlainMechanism {
    password: Vec<u8>,
}

impl PaceMechanism for PlainMechanism {
    fn encrypted_nonce(
        &mut self,
        _protocol: PaceProtocol,
        _domain_parameters: u8,
        password: &[u8],
    ) -> Result<Vec<u8>, ProcessingError> {
        self.password = password.to_vec();
        Ok(vec![0x01; 16])
    }

    fn map_nonce(&mut self, mapping_data: &[u8]) -> Result<Vec<u8>, ProcessingError> {
        Ok(mapping_data.to_vec())
    }

    fn key_agreement(&mut self, ephemeral_key: &[u8]) -> Result<Vec<u8>, ProcessingError> {
        Ok(ephemeral_key.to_vec())
    }

    fn mutual_authenticate(
        &mut self,
        token: &[u8],
    ) -> Result<Option<Authentication>, ProcessingError> {
        Ok((token == self.password).then(|| Authentication {
            token: vec![0x02; 8],
            keys: SessionKeys {
                enc: vec![0x03; 16],
                mac: vec![0x04; 16],
            },
        }))
    }

    fn reset(&mut self) {
        self.password.clear();
    }
}

impl Input {
    pub fn card(&self) -> Card {
        let state = MemoryCardState::new()
            .with_password(PasswordRef::Can, PasswordState::new(CAN, None))
            .with_password(
                PasswordRef::Pin,
                PasswordState::new(PIN, Some(self.pin_counter % 4)),
            );
        let mut options = PaceOptions::default();
        options.allowed_mappings = Mappings::from_bits_truncate(self.allowed_mappings);
        Card::new(Rc::new(state), Options::default())
            .with_protocol(Pace::new(PlainMechanism::default(), options))
    }
}
