// Copyright (C) 2022 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

//! This crate implements declarative command matching and protocol state machines for ISO 7816-4
//! smart card emulation, with a PACE implementation as defined in BSI TR-03110.
//!
//! # Command matching
//!
//! Protocols describe the commands they expect as
//! [`CommandShapeSpec`][`matcher::CommandShapeSpec`]s: each structural field of a command (class
//! byte semantics, instruction, parameters, case) is paired with a
//! [`Requirement`][`matcher::Requirement`], and the expected BER-TLV layout of the data field is
//! given as a [`TagRequirementTree`][`matcher::TagRequirementTree`].  Matching a command yields a
//! [`MatchVerdict`][`matcher::MatchVerdict`] with the status word to answer a mismatch with.
//!
//! # Protocols
//!
//! A [`Protocol`][`engine::Protocol`] is a two level state machine.  It is driven by a
//! [`ProtocolEngine`][`engine::ProtocolEngine`] that runs its transitions for every command until
//! the protocol returns a result.  Transitions read the command and record their effects in a
//! [`ProcessingContext`][`context::ProcessingContext`].
//!
//! # Command handling
//!
//! The [`Card`] struct is the main entry point for this crate.  It depends on a
//! [`CardStateAccessor`][`accessor::CardStateAccessor`] implementation that provides the persistent
//! card state (passwords, trust points) and offers every command to its protocols in order.  The
//! card can be configured using [`Options`].  Its [`Card::handle`] method expects a full APDU
//! command and constructs a response for it.

#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    non_ascii_idents,
    trivial_casts,
    unused,
    unused_qualifications,
    clippy::expect_used,
    clippy::unwrap_used
)]
#![deny(unsafe_code)]

#[macro_use]
extern crate log;

pub mod accessor;
pub mod apdu;
mod card;
pub mod context;
pub mod engine;
pub mod error;
pub mod matcher;
pub mod pace;
pub mod tlv;

pub use accessor::{CardStateAccessor, MemoryCardState};
pub use apdu::{CommandApdu, ResponseApdu, StatusWord};
pub use card::{Card, Options};
pub use error::{Error, ProcessingError};
