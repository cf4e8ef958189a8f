// Copyright (C) 2022 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

use core::fmt::Debug;
use std::rc::Rc;

use crate::accessor::CardStateAccessor;
use crate::apdu::{CommandApdu, ResponseApdu, StatusWord};
use crate::context::ProcessingContext;
use crate::engine::{
    Protocol, ProtocolEngine, ProtocolHandler, SecInfoPublicity, DEFAULT_MAX_TRANSITIONS,
};
use crate::tlv::{tag, Tlv};

/// Initiator of the context changes made by the card itself
const CARD: &str = "card";

/// Card emulation dispatching commands to protocols.
///
/// This is the main entry point for this crate.  Protocols are offered every command in the order
/// they were added, until one of them produces a final response.
#[derive(Debug)]
pub struct Card {
    accessor: Rc<dyn CardStateAccessor>,
    protocols: Vec<Box<dyn ProtocolHandler>>,
    options: Options,
}

impl Card {
    /// Creates a card without protocols, backed by the given card state.
    pub fn new(accessor: Rc<dyn CardStateAccessor>, options: Options) -> Self {
        Self {
            accessor,
            protocols: Vec::new(),
            options,
        }
    }

    /// Adds a protocol, driven by a [`ProtocolEngine`] configured from the card options.
    pub fn with_protocol<P>(self, protocol: P) -> Self
    where
        P: Protocol + Debug + 'static,
    {
        let engine =
            ProtocolEngine::new(protocol).with_max_transitions(self.options.max_transitions);
        self.with_handler(Box::new(engine))
    }

    /// Adds a protocol handler that is not a [`ProtocolEngine`]
    pub fn with_handler(mut self, mut handler: Box<dyn ProtocolHandler>) -> Self {
        debug!("Adding protocol {}", handler.name());
        handler.set_card_state_accessor(self.accessor.clone());
        self.protocols.push(handler);
        self
    }

    /// The options the card was created with
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Handles a raw command and returns the response.
    ///
    /// Commands that cannot be parsed are answered with `6700`.
    pub fn handle(&mut self, apdu: &[u8]) -> ResponseApdu {
        trace!("Received APDU {apdu:02x?}");
        let command = match CommandApdu::try_from(apdu) {
            Ok(command) => command,
            Err(err) => {
                warn!("Failed to parse command: {apdu:02x?} {err}");
                return ResponseApdu::new(StatusWord::WRONG_LENGTH);
            }
        };
        let response = self
            .process(Rc::new(command))
            .into_response()
            .unwrap_or_else(|| ResponseApdu::new(self.options.unhandled_status));
        trace!("Sending response {:02x?}", response.to_bytes());
        response
    }

    /// Processes a parsed command, returning the finished context.
    pub fn process(&mut self, command: Rc<CommandApdu>) -> ProcessingContext {
        let mut context = ProcessingContext::new(command);
        for protocol in self.protocols.iter_mut() {
            if context.is_processing_finished() {
                break;
            }
            let answered = context.response().is_some();
            protocol.process(&mut context);
            if !answered && context.response().is_some() {
                info!("Command handled by {}", protocol.name());
            }
        }

        if context.response().is_none() {
            info!("No protocol handled {:02x?}", context.command().to_bytes());
            context.update_response(
                CARD,
                "unhandled command",
                ResponseApdu::new(self.options.unhandled_status),
            );
        }

        if self.options.trace_history {
            for record in context.history() {
                trace!("{}: {} {:?}", record.initiator, record.message, record.delta);
            }
        }
        context
    }

    /// Resets all protocols to their initial state, ending the session.
    pub fn reset(&mut self) {
        for protocol in self.protocols.iter_mut() {
            protocol.reset();
        }
    }

    /// Forgets the sub-states protocols resume across sessions.
    pub fn reset_history(&mut self) {
        for protocol in self.protocols.iter_mut() {
            protocol.reset_history();
        }
    }

    /// The security infos of all protocols as a `SET OF SecurityInfo`
    pub fn sec_infos(&self, publicity: SecInfoPublicity) -> Tlv {
        let infos = self
            .protocols
            .iter()
            .flat_map(|p| p.sec_infos(publicity))
            .collect();
        Tlv::constructed(tag(0x31), infos)
    }
}

/// Options for the card.
#[derive(Clone, Copy, Debug)]
#[non_exhaustive]
pub struct Options {
    /// Maximum number of transitions a protocol may run for one command
    pub max_transitions: usize,
    /// Status word used when no protocol answered a command
    pub unhandled_status: StatusWord,
    /// Log the full context history of each command at trace level
    pub trace_history: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_transitions: DEFAULT_MAX_TRANSITIONS,
            unhandled_status: StatusWord::INSTRUCTION_NOT_SUPPORTED,
            trace_history: false,
        }
    }
}
