// Copyright (C) 2022 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

//! Access to the persistent card state used by protocols.
//!
//! Protocols do not own passwords or trust points.  The [`Card`](crate::Card) hands every protocol
//! a [`CardStateAccessor`] when it is registered; [`MemoryCardState`] is an in-memory
//! implementation for simulations and tests.

use core::cell::RefCell;
use core::fmt::Debug;
use std::collections::BTreeMap;

use iso7816::Status;
use serde::{Deserialize, Serialize};

use crate::error::ProcessingError;

macro_rules! enum_u8 {
    (
        $(#[$outer:meta])*
        $vis:vis enum $name:ident {
            $($(#[$attr:meta])* $var:ident = $num:literal),+
            $(,)*
        }
    ) => {
        $(#[$outer])*
        #[repr(u8)]
        $vis enum $name {
            $(
                $(#[$attr])*
                $var = $num,
            )*
        }

        impl TryFrom<u8> for $name {
            type Error = Status;
            fn try_from(val: u8) -> ::core::result::Result<Self, Status> {
                match val {
                    $(
                        $num => Ok($name::$var),
                    )*
                    _ => Err(Status::KeyReferenceNotFound)
                }
            }
        }
    }
}

enum_u8! {
    /// Password references as used in MSE:Set AT, TR-03110 part 3 § D.3
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
    pub enum PasswordRef {
        /// Machine readable zone
        Mrz = 1,
        /// Card access number
        Can = 2,
        /// Personal identification number
        Pin = 3,
        /// PIN unblock key
        Puk = 4,
    }
}

enum_u8! {
    /// Terminal types, identified by the last byte of the role OID of a CHAT
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
    pub enum TerminalType {
        /// Official domestic or foreign document verifier
        InspectionSystem = 1,
        /// Public sector or other authentication terminal
        AuthenticationTerminal = 2,
        /// Signature terminal creating qualified signatures
        SignatureTerminal = 3,
    }
}

/// A password as stored on the card
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordState {
    /// The password value
    pub secret: Vec<u8>,
    /// Remaining attempts, `None` for passwords that cannot be blocked
    pub retry_counter: Option<u8>,
    /// Counter restored after a successful authentication
    pub initial_retry_counter: Option<u8>,
}

impl PasswordState {
    /// A password whose initial counter is `retry_counter`
    pub fn new(secret: impl Into<Vec<u8>>, retry_counter: Option<u8>) -> Self {
        Self {
            secret: secret.into(),
            retry_counter,
            initial_retry_counter: retry_counter,
        }
    }

    /// A blocked password cannot be used anymore
    pub fn is_blocked(&self) -> bool {
        self.retry_counter == Some(0)
    }

    /// A suspended password needs a preceding authentication with another password
    pub fn is_suspended(&self) -> bool {
        self.retry_counter == Some(1)
    }
}

impl Debug for PasswordState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PasswordState")
            .field("secret", &format_args!("[{} bytes]", self.secret.len()))
            .field("retry_counter", &self.retry_counter)
            .field("initial_retry_counter", &self.initial_retry_counter)
            .finish()
    }
}

/// Trust anchor for terminal certificates
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustPoint {
    /// Name of the root certificate terminal certificates are checked against
    pub certificate_holder_reference: Vec<u8>,
}

/// Read and write access to the card state a protocol depends on.
pub trait CardStateAccessor: Debug {
    /// The state of `password`, `None` if it is not set on the card
    fn password(&self, password: PasswordRef) -> Option<PasswordState>;

    /// Stores the remaining attempts of `password`
    fn set_retry_counter(&self, password: PasswordRef, counter: u8) -> Result<(), ProcessingError>;

    /// The trust point for terminals of type `terminal`
    fn trust_point(&self, terminal: TerminalType) -> Option<TrustPoint>;
}

/// Card state kept in memory for the lifetime of the value
#[derive(Debug, Default)]
pub struct MemoryCardState {
    passwords: RefCell<BTreeMap<PasswordRef, PasswordState>>,
    trust_points: BTreeMap<TerminalType, TrustPoint>,
}

impl MemoryCardState {
    /// A card without passwords or trust points
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `password`
    pub fn with_password(self, password: PasswordRef, state: PasswordState) -> Self {
        self.passwords.borrow_mut().insert(password, state);
        self
    }

    /// Adds the trust point for `terminal`
    pub fn with_trust_point(mut self, terminal: TerminalType, trust_point: TrustPoint) -> Self {
        self.trust_points.insert(terminal, trust_point);
        self
    }
}

impl CardStateAccessor for MemoryCardState {
    fn password(&self, password: PasswordRef) -> Option<PasswordState> {
        self.passwords.borrow().get(&password).cloned()
    }

    fn set_retry_counter(&self, password: PasswordRef, counter: u8) -> Result<(), ProcessingError> {
        let mut passwords = self.passwords.borrow_mut();
        let state = passwords.get_mut(&password).ok_or_else(|| {
            ProcessingError::new(Status::KeyReferenceNotFound, "unknown password")
        })?;
        if state.retry_counter.is_none() {
            warn!("Password {password:?} has no retry counter");
            return Ok(());
        }
        debug!("Setting retry counter of {password:?} to {counter}");
        state.retry_counter = Some(counter);
        Ok(())
    }

    fn trust_point(&self, terminal: TerminalType) -> Option<TrustPoint> {
        self.trust_points.get(&terminal).cloned()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use crate::apdu::StatusWord;
    use test_log::test;

    #[test]
    fn references() {
        assert_eq!(PasswordRef::try_from(3).ok(), Some(PasswordRef::Pin));
        assert_eq!(
            PasswordRef::try_from(5).map_err(StatusWord::from),
            Err(StatusWord::REFERENCED_DATA_NOT_FOUND)
        );
        assert_eq!(
            TerminalType::try_from(2).ok(),
            Some(TerminalType::AuthenticationTerminal)
        );
        assert_eq!(PasswordRef::Can as u8, 2);
    }

    #[test]
    fn retry_counters() {
        let state = MemoryCardState::new()
            .with_password(PasswordRef::Pin, PasswordState::new(*b"123456", Some(3)))
            .with_password(PasswordRef::Can, PasswordState::new(*b"500540", None));

        state.set_retry_counter(PasswordRef::Pin, 1).unwrap();
        let pin = state.password(PasswordRef::Pin).unwrap();
        assert!(pin.is_suspended());
        assert_eq!(pin.initial_retry_counter, Some(3));

        state.set_retry_counter(PasswordRef::Can, 0).unwrap();
        assert!(!state.password(PasswordRef::Can).unwrap().is_blocked());

        assert_eq!(
            state.set_retry_counter(PasswordRef::Puk, 0).unwrap_err().status(),
            StatusWord::REFERENCED_DATA_NOT_FOUND
        );
        assert!(state.password(PasswordRef::Mrz).is_none());
        assert!(format!("{pin:?}").contains("[6 bytes]"));
    }
}
