// Copyright (C) 2022 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

use core::fmt::Debug;

use super::info::PaceProtocol;
use crate::context::SessionKeys;
use crate::error::ProcessingError;

/// Outcome of a successful mutual authentication
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Authentication {
    /// Authentication token of the card, returned to the terminal
    pub token: Vec<u8>,
    /// Keys for the secure messaging session
    pub keys: SessionKeys,
}

/// The cryptography of a PACE run.
///
/// The protocol only sequences the steps and handles passwords; deriving keys, mapping nonces and
/// computing tokens is left to the mechanism.  Every step may fail with a status word.
pub trait PaceMechanism: Debug {
    /// Generates a nonce and encrypts it with a key derived from `password`.
    fn encrypted_nonce(
        &mut self,
        protocol: PaceProtocol,
        domain_parameters: u8,
        password: &[u8],
    ) -> Result<Vec<u8>, ProcessingError>;

    /// Maps the nonce using the terminal's mapping data and returns the card's mapping data.
    fn map_nonce(&mut self, mapping_data: &[u8]) -> Result<Vec<u8>, ProcessingError>;

    /// Performs the key agreement and returns the card's ephemeral public key.
    fn key_agreement(&mut self, ephemeral_key: &[u8]) -> Result<Vec<u8>, ProcessingError>;

    /// Verifies the terminal's authentication token.
    ///
    /// Returns `None` if the token is wrong, i.e. the terminal used another password.
    fn mutual_authenticate(
        &mut self,
        token: &[u8],
    ) -> Result<Option<Authentication>, ProcessingError>;

    /// Drops all ephemeral data
    fn reset(&mut self) {}
}
