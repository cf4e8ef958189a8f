// Copyright (C) 2022 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only
#![allow(unused)]

use std::rc::Rc;

use cardengine::accessor::{CardStateAccessor, MemoryCardState, PasswordRef, PasswordState};
use cardengine::context::{ProcessingContext, SessionKeys};
use cardengine::engine::{Protocol, ProtocolEngine};
use cardengine::error::ProcessingError;
use cardengine::pace::{Authentication, Pace, PaceMechanism, PaceOptions, PaceProtocol, PaceState};
use cardengine::{Card, CommandApdu, Options};
use hex_literal::hex;

pub const NONCE: [u8; 8] = hex!("0102030405060708");
pub const MAPPING_DATA: [u8; 4] = hex!("04AABBCC");
pub const EPHEMERAL_KEY: [u8; 4] = hex!("04DDEEFF");
pub const CARD_TOKEN: [u8; 8] = hex!("C0C1C2C3C4C5C6C7");

pub const CAN: &[u8] = b"500540";
pub const PIN: &[u8] = b"123456";

/// Stand-in for the PACE cryptography.
///
/// The terminal authenticates by sending the password itself as its token.
#[derive(Debug, Default)]
pub struct FakeMechanism {
    password: Option<Vec<u8>>,
    pub protocol: Option<PaceProtocol>,
}

impl PaceMechanism for FakeMechanism {
    fn encrypted_nonce(
        &mut self,
        protocol: PaceProtocol,
        _domain_parameters: u8,
        password: &[u8],
    ) -> Result<Vec<u8>, ProcessingError> {
        self.password = Some(password.to_vec());
        self.protocol = Some(protocol);
        Ok(NONCE.to_vec())
    }

    fn map_nonce(&mut self, _mapping_data: &[u8]) -> Result<Vec<u8>, ProcessingError> {
        Ok(MAPPING_DATA.to_vec())
    }

    fn key_agreement(&mut self, _ephemeral_key: &[u8]) -> Result<Vec<u8>, ProcessingError> {
        Ok(EPHEMERAL_KEY.to_vec())
    }

    fn mutual_authenticate(
        &mut self,
        token: &[u8],
    ) -> Result<Option<Authentication>, ProcessingError> {
        if self.password.as_deref() != Some(token) {
            return Ok(None);
        }
        Ok(Some(Authentication {
            token: CARD_TOKEN.to_vec(),
            keys: keys(),
        }))
    }

    fn reset(&mut self) {
        self.password = None;
        self.protocol = None;
    }
}

pub fn keys() -> SessionKeys {
    SessionKeys {
        enc: vec![0xE1; 16],
        mac: vec![0xA1; 16],
    }
}

/// Card state with a CAN without retry counter and a PIN with `pin_counter` attempts left
pub fn card_state(pin_counter: u8) -> MemoryCardState {
    MemoryCardState::new()
        .with_password(PasswordRef::Can, PasswordState::new(CAN, None))
        .with_password(
            PasswordRef::Pin,
            PasswordState {
                secret: PIN.to_vec(),
                retry_counter: Some(pin_counter),
                initial_retry_counter: Some(3),
            },
        )
}

/// A PACE engine driven command by command, keeping the contexts for inspection
#[derive(Debug)]
pub struct Session {
    pub engine: ProtocolEngine<Pace<FakeMechanism>>,
    pub state: Rc<MemoryCardState>,
}

impl Session {
    pub fn new(state: MemoryCardState) -> Self {
        Self::with_options(state, PaceOptions::default())
    }

    pub fn with_options(state: MemoryCardState, options: PaceOptions) -> Self {
        let state = Rc::new(state);
        let mut engine = ProtocolEngine::new(Pace::new(FakeMechanism::default(), options));
        let accessor: Rc<dyn CardStateAccessor> = state.clone();
        engine.protocol_mut().set_card_state_accessor(accessor);
        Self { engine, state }
    }

    pub fn exchange(&mut self, apdu: &[u8]) -> ProcessingContext {
        let command = CommandApdu::try_from(apdu).expect("invalid test command");
        let mut context = ProcessingContext::new(Rc::new(command));
        self.engine.process(&mut context);
        context
    }

    /// The encoded response, `None` if the protocol did not answer
    pub fn respond(&mut self, apdu: &[u8]) -> Option<Vec<u8>> {
        self.exchange(apdu)
            .into_response()
            .map(|response| response.to_bytes())
    }

    pub fn pace_state(&self) -> PaceState {
        *self.engine.state()
    }

    pub fn retry_counter(&self, password: PasswordRef) -> Option<u8> {
        self.state
            .password(password)
            .and_then(|state| state.retry_counter)
    }
}

pub fn card(state: MemoryCardState, options: PaceOptions) -> Card {
    Card::new(Rc::new(state), Options::default())
        .with_protocol(Pace::new(FakeMechanism::default(), options))
}

/// MSE:Set AT for id-PACE-ECDH-GM-AES-CBC-CMAC-192 with the given password reference
pub fn set_at(password: PasswordRef) -> Vec<u8> {
    let mut apdu = hex!("00 22 C1 A4 0F 80 0A 04007F00070202040203 83 01").to_vec();
    apdu.push(password as u8);
    apdu
}

pub const GA_ENCRYPTED_NONCE: [u8; 8] = hex!("10 86 0000 02 7C00 00");
pub const GA_MAP_NONCE: [u8; 12] = hex!("10 86 0000 06 7C04 8102 AABB 00");
pub const GA_KEY_AGREEMENT: [u8; 12] = hex!("10 86 0000 06 7C04 8302 CCDD 00");

/// Final General Authenticate carrying `token`
pub fn ga_mutual_authenticate(token: &[u8]) -> Vec<u8> {
    let mut apdu = hex!("00 86 0000").to_vec();
    apdu.push(token.len() as u8 + 4);
    apdu.extend_from_slice(&[0x7C, token.len() as u8 + 2, 0x85, token.len() as u8]);
    apdu.extend_from_slice(token);
    apdu.push(0x00);
    apdu
}

/// Runs the three steps before the mutual authentication, checking the card's answers
pub fn run_until_key_agreement(session: &mut Session) {
    assert_eq!(
        session.respond(&GA_ENCRYPTED_NONCE),
        Some(hex!("7C0A 8008 0102030405060708 9000").to_vec())
    );
    assert_eq!(
        session.respond(&GA_MAP_NONCE),
        Some(hex!("7C06 8204 04AABBCC 9000").to_vec())
    );
    assert_eq!(
        session.respond(&GA_KEY_AGREEMENT),
        Some(hex!("7C06 8404 04DDEEFF 9000").to_vec())
    );
}
