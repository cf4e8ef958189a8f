// Copyright (C) 2022 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

//! Per-command processing state
//!
//! A [`ProcessingContext`] is created by the [`Card`](crate::Card) for every incoming command and
//! is only changed by applying [`ProcessingDelta`]s, each of which is recorded in the history.

pub mod propagation;

use std::collections::BTreeMap;
use std::rc::Rc;

use crate::apdu::{CommandApdu, ResponseApdu};

pub use propagation::{
    Propagation, PropagationKind, SecurityEvent, SecurityMechanism, SessionKeys,
};

/// One unit of change to a [`ProcessingContext`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessingDelta {
    command: Option<Rc<CommandApdu>>,
    response: Option<ResponseApdu>,
    propagations: Vec<(PropagationKind, Propagation)>,
}

impl ProcessingDelta {
    /// An empty delta
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the command; `command` must be derived from the current one.
    pub fn command(mut self, command: Rc<CommandApdu>) -> Self {
        self.command = Some(command);
        self
    }

    /// Replaces the response
    pub fn response(mut self, response: ResponseApdu) -> Self {
        self.response = Some(response);
        self
    }

    /// Adds a propagation under its own kind
    pub fn propagate(self, propagation: Propagation) -> Self {
        let kind = propagation.kind();
        self.propagate_as(kind, propagation)
    }

    /// Adds a propagation under an explicitly declared kind.
    ///
    /// A propagation whose payload does not match `kind` is dropped when the delta is applied.
    pub fn propagate_as(mut self, kind: PropagationKind, propagation: Propagation) -> Self {
        self.propagations.push((kind, propagation));
        self
    }

    /// Whether applying the delta changes nothing
    pub fn is_empty(&self) -> bool {
        self.command.is_none() && self.response.is_none() && self.propagations.is_empty()
    }

    /// The command this delta replaces the current one with
    pub fn new_command(&self) -> Option<&Rc<CommandApdu>> {
        self.command.as_ref()
    }

    /// The response this delta sets
    pub fn new_response(&self) -> Option<&ResponseApdu> {
        self.response.as_ref()
    }

    /// Propagations with the kind they are declared as
    pub fn propagations(&self) -> &[(PropagationKind, Propagation)] {
        &self.propagations
    }
}

/// A delta as it was applied, with who applied it and why
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryRecord {
    /// Who applied the delta, e.g. a protocol name
    pub initiator: String,
    /// Why the delta was applied
    pub message: String,
    /// The delta as it was applied
    pub delta: ProcessingDelta,
}

/// State of one command while it is processed by the card
#[derive(Debug)]
pub struct ProcessingContext {
    command: Rc<CommandApdu>,
    response: Option<ResponseApdu>,
    propagations: BTreeMap<PropagationKind, Vec<Propagation>>,
    history: Vec<HistoryRecord>,
}

impl ProcessingContext {
    /// A context for `command`, without response
    pub fn new(command: Rc<CommandApdu>) -> Self {
        Self {
            command,
            response: None,
            propagations: BTreeMap::new(),
            history: Vec::new(),
        }
    }

    /// Applies `deltas` in order, skipping empty ones.
    ///
    /// # Panics
    ///
    /// Panics if a delta replaces the command by one that was not derived from the current
    /// command.
    pub fn apply(
        &mut self,
        initiator: &str,
        message: &str,
        deltas: impl IntoIterator<Item = ProcessingDelta>,
    ) {
        for delta in deltas {
            if delta.is_empty() {
                continue;
            }
            self.history.push(HistoryRecord {
                initiator: initiator.into(),
                message: message.into(),
                delta: delta.clone(),
            });

            let ProcessingDelta {
                command,
                response,
                propagations,
            } = delta;
            if let Some(command) = command {
                if !command.descends_from(&self.command) {
                    panic!(
                        "{initiator} replaced {:02x?} with the unrelated command {:02x?}",
                        self.command.to_bytes(),
                        command.to_bytes()
                    );
                }
                self.command = command;
            }
            if let Some(response) = response {
                self.response = Some(response);
            }
            for (kind, propagation) in propagations {
                if propagation.kind() != kind {
                    warn!("{initiator}: dropping {propagation:?} declared as {kind:?}");
                    continue;
                }
                self.propagations.entry(kind).or_default().push(propagation);
            }
        }
    }

    /// Applies a delta replacing the response
    pub fn update_response(&mut self, initiator: &str, message: &str, response: ResponseApdu) {
        self.apply(initiator, message, [ProcessingDelta::new().response(response)]);
    }

    /// Applies a delta adding `propagation`
    pub fn add_propagation(&mut self, initiator: &str, message: &str, propagation: Propagation) {
        self.apply(initiator, message, [ProcessingDelta::new().propagate(propagation)]);
    }

    /// The current command
    pub fn command(&self) -> &Rc<CommandApdu> {
        &self.command
    }

    /// The current response, `None` until one is set
    pub fn response(&self) -> Option<&ResponseApdu> {
        self.response.as_ref()
    }

    /// Propagations collected under `kind`
    pub fn propagations(&self, kind: PropagationKind) -> &[Propagation] {
        self.propagations
            .get(&kind)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// All applied deltas, oldest first
    pub fn history(&self) -> &[HistoryRecord] {
        &self.history
    }

    /// Whether a final response is available, i.e. one whose status is not of the `61XX` class
    pub fn is_processing_finished(&self) -> bool {
        self.response
            .as_ref()
            .map_or(false, |r| !r.status_word().is_intermediate())
    }

    /// The final response
    pub fn into_response(self) -> Option<ResponseApdu> {
        self.response
    }
}
