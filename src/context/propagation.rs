// Copyright (C) 2022 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

//! Typed side effects announced by protocols to the rest of the card

use crate::accessor::PasswordRef;

/// Key under which propagations are collected in a
/// [`ProcessingContext`](crate::context::ProcessingContext)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PropagationKind {
    /// Changes of the security status, see [`SecurityEvent`]
    SecurityEvent,
    /// Security mechanisms that have been run, see [`SecurityMechanism`]
    SecurityMechanism,
    /// Session keys for secure messaging
    SecureMessaging,
}

/// A side effect announced by a protocol
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Propagation {
    /// A change of the security status
    SecurityEvent(SecurityEvent),
    /// A security mechanism that has been run
    SecurityMechanism(SecurityMechanism),
    /// Keys to use for secure messaging from now on
    SecureMessaging(SessionKeys),
}

impl Propagation {
    /// The kind matching the payload
    pub fn kind(&self) -> PropagationKind {
        match self {
            Self::SecurityEvent(_) => PropagationKind::SecurityEvent,
            Self::SecurityMechanism(_) => PropagationKind::SecurityMechanism,
            Self::SecureMessaging(_) => PropagationKind::SecureMessaging,
        }
    }
}

/// Changes of the security status of the card
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SecurityEvent {
    /// Secure messaging is active for the following commands
    SecureMessagingEstablished,
    /// A password was presented and rejected
    AuthenticationFailed(PasswordRef),
}

/// A security mechanism that has been run successfully
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SecurityMechanism {
    /// Password Authenticated Connection Establishment
    Pace {
        /// The password the terminal authenticated with
        password: PasswordRef,
        /// Object identifier of the PACE protocol that was run
        protocol: Vec<u8>,
        /// Encoded certificate holder authorization template, if the terminal sent one
        chat: Option<Vec<u8>>,
    },
}

/// Session keys for secure messaging
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKeys {
    /// Encryption key
    pub enc: Vec<u8>,
    /// MAC key
    pub mac: Vec<u8>,
}

impl core::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SessionKeys")
            .field("enc", &format_args!("[{} bytes]", self.enc.len()))
            .field("mac", &format_args!("[{} bytes]", self.mac.len()))
            .finish()
    }
}
