// Copyright (C) 2022 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

//! Protocol state machines
//!
//! A [`Protocol`] only describes its transitions.  The [`ProtocolEngine`] owns the current state
//! and the registered command specifications and drives the transitions for every command until
//! the protocol hands back control with [`Step::return_result`].
//!
//! States are two level: the variants of [`Protocol::State`] are the top level modes, and
//! composite modes carry their sub-state as variant data.  When the mode changes, the engine runs
//! the entry action [`Protocol::enter`] of the new mode.  A composite mode entered through a
//! transition starts in the sub-state the transition chose, normally its default.  Modes for which
//! [`Protocol::keeps_history`] holds instead resume the sub-state they were left in, until
//! [`ProtocolEngine::reset_history`] is called.

use core::fmt::Debug;
use core::mem::{discriminant, Discriminant};
use std::collections::HashMap;
use std::rc::Rc;

use crate::accessor::CardStateAccessor;
use crate::apdu::{CommandApdu, ResponseApdu, StatusWord};
use crate::context::{Propagation, ProcessingContext};
use crate::error::ProcessingError;
use crate::matcher::{CommandShapeSpec, MatchVerdict};
use crate::tlv::Tlv;

/// Upper bound of transitions run for a single command
pub const DEFAULT_MAX_TRANSITIONS: usize = 32;

/// Which security infos a protocol is asked to advertise
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SecInfoPublicity {
    /// EF.CardAccess, readable without authentication
    Anytime,
    /// EF.CardSecurity, readable after authentication
    Authenticated,
    /// EF.ChipSecurity, readable by privileged terminals only
    Privileged,
}

/// A protocol implemented as a two level state machine.
///
/// `State` is the top level mode; composite modes carry their sub-state as variant data.
pub trait Protocol {
    /// Top level modes of the protocol
    type State: Clone + Debug + Default + PartialEq;

    /// Name used for logging and as initiator of context changes
    fn name(&self) -> &'static str;

    /// Command shapes the protocol refers to through [`Step::is_apdu`]
    fn specifications(&self) -> Vec<CommandShapeSpec>;

    /// Runs the transition of `state` whose guard holds.
    ///
    /// Returns the next state, or `None` if no guard matched the current event.  Errors are
    /// answered with their status word and handled like an unmatched event.
    fn transition(
        &mut self,
        state: &Self::State,
        step: &mut Step<'_>,
    ) -> Result<Option<Self::State>, ProcessingError>;

    /// State entered after a warning or an error
    fn error_state(&self) -> Self::State {
        Self::State::default()
    }

    /// Entry action of the top level mode of `state`.
    ///
    /// Runs whenever the engine changes the mode, after the sub-state to enter was chosen.
    /// Returns the state actually entered.
    fn enter(&mut self, state: Self::State, _step: &mut Step<'_>) -> Self::State {
        state
    }

    /// Whether the mode of `state` resumes its last sub-state when it is entered again
    fn keeps_history(&self, _state: &Self::State) -> bool {
        false
    }

    /// Drops all session data kept outside of the state
    fn reset(&mut self) {}

    /// Hands the protocol the persistent card state
    fn set_card_state_accessor(&mut self, _accessor: Rc<dyn CardStateAccessor>) {}

    /// Security infos advertised by the protocol, as ASN.1 `SecurityInfo` objects
    fn sec_infos(&self, _publicity: SecInfoPublicity) -> Vec<Tlv> {
        Vec::new()
    }
}

/// Command specifications by id
#[derive(Clone, Debug, Default)]
pub struct SpecRegistry {
    specs: HashMap<String, CommandShapeSpec>,
}

impl SpecRegistry {
    /// Registers `spec`, returning the specification it replaces
    pub fn register(&mut self, spec: CommandShapeSpec) -> Option<CommandShapeSpec> {
        let replaced = self.specs.insert(spec.id().into(), spec);
        if let Some(replaced) = &replaced {
            warn!("Replacing APDU specification {}", replaced.id());
        }
        replaced
    }

    /// The specification registered as `id`
    pub fn get(&self, id: &str) -> Option<&CommandShapeSpec> {
        self.specs.get(id)
    }

    /// Number of registered specifications
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// Whether no specification is registered
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

/// The view of the current command a transition works with
#[derive(Debug)]
pub struct Step<'a> {
    protocol: &'static str,
    context: &'a mut ProcessingContext,
    registry: &'a SpecRegistry,
    stop: bool,
}

impl<'a> Step<'a> {
    fn new(
        protocol: &'static str,
        context: &'a mut ProcessingContext,
        registry: &'a SpecRegistry,
    ) -> Self {
        Self {
            protocol,
            context,
            registry,
            stop: false,
        }
    }

    /// Verdict of the registered specification `id` for the current command
    pub fn verdict(&self, id: &str) -> Option<MatchVerdict> {
        let Some(spec) = self.registry.get(id) else {
            error!("{}: no APDU specification {id}", self.protocol);
            return None;
        };
        let verdict = spec.matches(self.context.command());
        if !verdict.is_match() {
            debug!("{}: {id} does not match: {verdict}", self.protocol);
        }
        Some(verdict)
    }

    /// Whether the current command matches the registered specification `id`.
    ///
    /// Unknown ids never match.
    pub fn is_apdu(&self, id: &str) -> bool {
        self.verdict(id).map_or(false, |v| v.is_match())
    }

    fn status(&self) -> Option<StatusWord> {
        self.context.response().map(ResponseApdu::status_word)
    }

    /// Whether the current response ends with `status`
    pub fn is_status_word(&self, status: impl Into<StatusWord>) -> bool {
        self.status() == Some(status.into())
    }

    /// Whether the current response is a `63CX` retry counter warning
    pub fn is_status_word_63cx_counter(&self) -> bool {
        self.status().map_or(false, StatusWord::is_63cx_counter)
    }

    /// Whether the current response is a warning or an error
    pub fn warning_or_error_occurred(&self) -> bool {
        self.status()
            .map_or(false, |sw| sw.is_warning() || sw.is_error())
    }

    /// Whether a response has been set for the current command
    pub fn apdu_has_been_processed(&self) -> bool {
        self.context.response().is_some()
    }

    /// Ends the loop for the current command once the transition returns
    pub fn return_result(&mut self) {
        self.stop = true;
    }

    /// Logs the entry into `state`
    pub fn logs(&self, state: &str) {
        debug!("{}: entering {state}", self.protocol);
    }

    /// The current command
    pub fn command(&self) -> &Rc<CommandApdu> {
        self.context.command()
    }

    /// The context of the current command
    pub fn context(&self) -> &ProcessingContext {
        self.context
    }

    /// Mutable access to the context of the current command
    pub fn context_mut(&mut self) -> &mut ProcessingContext {
        self.context
    }

    /// Sets the response to the current command
    pub fn respond(&mut self, message: &str, response: ResponseApdu) {
        self.context.update_response(self.protocol, message, response);
    }

    /// Responds with a bare status word
    pub fn respond_status(&mut self, message: &str, status: impl Into<StatusWord>) {
        self.respond(message, ResponseApdu::new(status));
    }

    /// Announces `propagation` in the context of the current command
    pub fn propagate(&mut self, message: &str, propagation: Propagation) {
        self.context
            .add_propagation(self.protocol, message, propagation);
    }
}

/// Last sub-states of the modes with history, by mode
type History<S> = HashMap<Discriminant<S>, S>;

/// Drives a [`Protocol`] over the commands of a session
#[derive(Debug)]
pub struct ProtocolEngine<P: Protocol> {
    protocol: P,
    state: P::State,
    history: History<P::State>,
    registry: SpecRegistry,
    max_transitions: usize,
}

impl<P: Protocol> ProtocolEngine<P> {
    /// An engine in the default state, with the specifications of `protocol` registered
    pub fn new(protocol: P) -> Self {
        let mut registry = SpecRegistry::default();
        for spec in protocol.specifications() {
            registry.register(spec);
        }
        Self {
            protocol,
            state: P::State::default(),
            history: HashMap::new(),
            registry,
            max_transitions: DEFAULT_MAX_TRANSITIONS,
        }
    }

    /// Sets the number of transitions after which a command is answered with `6F00`
    pub fn with_max_transitions(mut self, max_transitions: usize) -> Self {
        self.max_transitions = max_transitions;
        self
    }

    /// Registers an additional specification, replacing one with the same id
    pub fn register_apdu_specification(&mut self, spec: CommandShapeSpec) {
        self.registry.register(spec);
    }

    /// The registered specifications
    pub fn registry(&self) -> &SpecRegistry {
        &self.registry
    }

    /// The current state
    pub fn state(&self) -> &P::State {
        &self.state
    }

    /// The driven protocol
    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    /// Mutable access to the driven protocol
    pub fn protocol_mut(&mut self) -> &mut P {
        &mut self.protocol
    }

    /// Back to the default state, e.g. on a session reset.
    ///
    /// The sub-state of a mode with history is kept for the next session.  The default state is
    /// entered without running its entry action.
    pub fn reset(&mut self) {
        debug!("{}: reset", self.protocol.name());
        let state = core::mem::take(&mut self.state);
        remember(&self.protocol, &mut self.history, state);
        self.protocol.reset();
    }

    /// Forgets the stored sub-states, so that composite modes start over in the sub-state
    /// chosen by the transition entering them
    pub fn reset_history(&mut self) {
        debug!("{}: reset history", self.protocol.name());
        self.history.clear();
    }

    /// Runs transitions for the current command of `context` until the protocol returns.
    pub fn process(&mut self, context: &mut ProcessingContext) {
        let name = self.protocol.name();
        let mut step = Step::new(name, context, &self.registry);

        for _ in 0..self.max_transitions {
            let current = self.state.clone();
            match self.protocol.transition(&current, &mut step) {
                Ok(Some(next)) => {
                    change_state(
                        &mut self.protocol,
                        &mut self.state,
                        &mut self.history,
                        next,
                        &mut step,
                    );
                }
                Ok(None) => error_transition(
                    &mut self.protocol,
                    &mut self.state,
                    &mut self.history,
                    &mut step,
                ),
                Err(err) => {
                    warn!("{name}: {err}");
                    step.respond_status(err.reason(), err.status());
                    error_transition(
                        &mut self.protocol,
                        &mut self.state,
                        &mut self.history,
                        &mut step,
                    );
                }
            }
            if step.stop {
                return;
            }
        }

        error!(
            "{name}: no result after {} transitions in {:?}",
            self.max_transitions, self.state
        );
        step.respond_status("transition limit reached", StatusWord::UNKNOWN_ERROR);
        let next = self.protocol.error_state();
        change_state(
            &mut self.protocol,
            &mut self.state,
            &mut self.history,
            next,
            &mut step,
        );
    }
}

/// Stores `state` if its mode keeps history
fn remember<P: Protocol>(protocol: &P, history: &mut History<P::State>, state: P::State) {
    if protocol.keeps_history(&state) {
        history.insert(discriminant(&state), state);
    }
}

/// Moves to `next`, running the entry action if the mode changes
fn change_state<P: Protocol>(
    protocol: &mut P,
    state: &mut P::State,
    history: &mut History<P::State>,
    next: P::State,
    step: &mut Step<'_>,
) {
    if discriminant(&next) == discriminant(state) {
        if next != *state {
            step.logs(&format!("{next:?}"));
        }
        *state = next;
        return;
    }

    let left = core::mem::replace(state, next.clone());
    remember(protocol, history, left);
    let next = match history.get(&discriminant(&next)) {
        Some(stored) if protocol.keeps_history(&next) => {
            debug!("{}: resuming {stored:?}", protocol.name());
            stored.clone()
        }
        _ => next,
    };
    let next = protocol.enter(next, step);
    step.logs(&format!("{next:?}"));
    *state = next;
}

fn error_transition<P: Protocol>(
    protocol: &mut P,
    state: &mut P::State,
    history: &mut History<P::State>,
    step: &mut Step<'_>,
) {
    if step.warning_or_error_occurred() {
        let next = protocol.error_state();
        change_state(protocol, state, history, next, step);
    } else {
        debug!("{}: unrecognized event in {state:?}", protocol.name());
    }
    step.return_result();
}

/// Object safe interface of a [`ProtocolEngine`] used by the [`Card`](crate::Card)
pub trait ProtocolHandler: Debug {
    /// Name of the driven protocol
    fn name(&self) -> &'static str;

    /// Processes the current command of `context`
    fn process(&mut self, context: &mut ProcessingContext);

    /// Session reset, see [`ProtocolEngine::reset`]
    fn reset(&mut self);

    /// See [`ProtocolEngine::reset_history`]
    fn reset_history(&mut self);

    /// See [`Protocol::set_card_state_accessor`]
    fn set_card_state_accessor(&mut self, accessor: Rc<dyn CardStateAccessor>);

    /// See [`Protocol::sec_infos`]
    fn sec_infos(&self, publicity: SecInfoPublicity) -> Vec<Tlv>;
}

impl<P: Protocol + Debug> ProtocolHandler for ProtocolEngine<P> {
    fn name(&self) -> &'static str {
        self.protocol.name()
    }

    fn process(&mut self, context: &mut ProcessingContext) {
        ProtocolEngine::process(self, context)
    }

    fn reset(&mut self) {
        ProtocolEngine::reset(self)
    }

    fn reset_history(&mut self) {
        ProtocolEngine::reset_history(self)
    }

    fn set_card_state_accessor(&mut self, accessor: Rc<dyn CardStateAccessor>) {
        self.protocol.set_card_state_accessor(accessor)
    }

    fn sec_infos(&self, publicity: SecInfoPublicity) -> Vec<Tlv> {
        self.protocol.sec_infos(publicity)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use crate::apdu::IsoCase;
    use hex_literal::hex;
    use test_log::test;

    /// GET CHALLENGE after a SELECT, with a counter of issued challenges
    #[derive(Debug, Default)]
    struct Challenge {
        issued: u8,
    }

    #[derive(Clone, Debug, Default, PartialEq)]
    enum ChallengeState {
        #[default]
        Idle,
        Selected(Selected),
        Spinning,
    }

    #[derive(Clone, Debug, Default, PartialEq)]
    enum Selected {
        #[default]
        Ready,
        Issued,
    }

    impl Protocol for Challenge {
        type State = ChallengeState;

        fn name(&self) -> &'static str {
            "challenge"
        }

        fn specifications(&self) -> Vec<CommandShapeSpec> {
            vec![
                CommandShapeSpec::new("Select")
                    .with_ins(0xA4)
                    .with_case(IsoCase::Case3),
                CommandShapeSpec::new("Get Challenge")
                    .with_ins(0x84)
                    .with_case(IsoCase::Case2),
                CommandShapeSpec::new("Spin").with_ins(0xEE),
                CommandShapeSpec::new("Fail").with_ins(0xFA),
            ]
        }

        fn transition(
            &mut self,
            state: &ChallengeState,
            step: &mut Step<'_>,
        ) -> Result<Option<ChallengeState>, ProcessingError> {
            if step.is_apdu("Spin") {
                return Ok(Some(ChallengeState::Spinning));
            }
            match state {
                ChallengeState::Idle | ChallengeState::Spinning if step.is_apdu("Select") => {
                    step.respond_status("selected", StatusWord::SUCCESS);
                    step.return_result();
                    Ok(Some(ChallengeState::Selected(Selected::default())))
                }
                ChallengeState::Selected(_) if step.is_apdu("Fail") => {
                    Err(ProcessingError::new(StatusWord::WRONG_DATA, "failing on request"))
                }
                ChallengeState::Selected(_) if step.is_apdu("Get Challenge") => {
                    self.issued += 1;
                    step.respond(
                        "challenge",
                        ResponseApdu::with_data(
                            vec![Tlv::primitive(crate::tlv::tag(0x81), [self.issued; 8])],
                            StatusWord::SUCCESS,
                        ),
                    );
                    step.return_result();
                    Ok(Some(ChallengeState::Selected(Selected::Issued)))
                }
                _ => Ok(None),
            }
        }
    }

    /// A form of several pages that can be closed and reopened
    #[derive(Debug, Default)]
    struct Form {
        opened: u8,
    }

    #[derive(Clone, Debug, Default, PartialEq)]
    enum FormState {
        #[default]
        Closed,
        Open(Page),
    }

    #[derive(Clone, Copy, Debug, Default, PartialEq)]
    enum Page {
        #[default]
        First = 1,
        Second = 2,
        Third = 3,
    }

    impl Page {
        fn next(self) -> Self {
            match self {
                Page::First => Page::Second,
                Page::Second | Page::Third => Page::Third,
            }
        }
    }

    impl Protocol for Form {
        type State = FormState;

        fn name(&self) -> &'static str {
            "form"
        }

        fn specifications(&self) -> Vec<CommandShapeSpec> {
            vec![
                CommandShapeSpec::new("Open").with_ins(0x70),
                CommandShapeSpec::new("Next").with_ins(0x72),
                CommandShapeSpec::new("Close").with_ins(0x74),
            ]
        }

        fn transition(
            &mut self,
            state: &FormState,
            step: &mut Step<'_>,
        ) -> Result<Option<FormState>, ProcessingError> {
            let next = match state {
                FormState::Closed if step.is_apdu("Open") => FormState::Open(Page::default()),
                FormState::Open(page) if step.is_apdu("Next") => {
                    step.respond_status("next page", StatusWord::SUCCESS);
                    FormState::Open(page.next())
                }
                FormState::Open(_) if step.is_apdu("Close") => {
                    step.respond_status("closed", StatusWord::SUCCESS);
                    FormState::Closed
                }
                _ => return Ok(None),
            };
            step.return_result();
            Ok(Some(next))
        }

        fn enter(&mut self, state: FormState, step: &mut Step<'_>) -> FormState {
            if let FormState::Open(page) = state {
                self.opened += 1;
                step.respond(
                    "opened",
                    ResponseApdu::with_data(
                        vec![Tlv::primitive(crate::tlv::tag(0x80), [page as u8])],
                        StatusWord::SUCCESS,
                    ),
                );
            }
            state
        }

        fn keeps_history(&self, state: &FormState) -> bool {
            matches!(state, FormState::Open(_))
        }
    }

    fn open(engine: &mut ProtocolEngine<Form>) -> Vec<u8> {
        let context = process(engine, &hex!("00 70 0000"));
        context.response().map(ResponseApdu::to_bytes).unwrap()
    }

    #[test]
    fn entry_actions() {
        let mut engine = ProtocolEngine::new(Form::default());
        // Entering the form cascades into its first page
        assert_eq!(open(&mut engine), hex!("80 01 01 9000"));
        assert_eq!(engine.state(), &FormState::Open(Page::First));
        assert_eq!(engine.protocol().opened, 1);

        // Moving between pages does not enter the form again
        process(&mut engine, &hex!("00 72 0000"));
        assert_eq!(engine.state(), &FormState::Open(Page::Second));
        assert_eq!(engine.protocol().opened, 1);

        process(&mut engine, &hex!("00 74 0000"));
        assert_eq!(engine.state(), &FormState::Closed);
        assert_eq!(engine.protocol().opened, 1);
    }

    #[test]
    fn history() {
        let mut engine = ProtocolEngine::new(Form::default());
        open(&mut engine);
        process(&mut engine, &hex!("00 72 0000"));
        process(&mut engine, &hex!("00 74 0000"));

        // Reopening resumes the page the form was left on
        assert_eq!(open(&mut engine), hex!("80 01 02 9000"));
        assert_eq!(engine.state(), &FormState::Open(Page::Second));
        assert_eq!(engine.protocol().opened, 2);

        // History survives the end of the session
        process(&mut engine, &hex!("00 72 0000"));
        engine.reset();
        assert_eq!(engine.state(), &FormState::Closed);
        assert_eq!(open(&mut engine), hex!("80 01 03 9000"));
        assert_eq!(engine.state(), &FormState::Open(Page::Third));

        // Without history the form starts over
        process(&mut engine, &hex!("00 74 0000"));
        engine.reset_history();
        assert_eq!(open(&mut engine), hex!("80 01 01 9000"));
        assert_eq!(engine.state(), &FormState::Open(Page::First));
    }

    fn process<P: Protocol>(engine: &mut ProtocolEngine<P>, apdu: &[u8]) -> ProcessingContext {
        let command = CommandApdu::try_from(apdu).map(Rc::new);
        let mut context = match command {
            Ok(command) => ProcessingContext::new(command),
            Err(err) => panic!("{err}"),
        };
        engine.process(&mut context);
        context
    }

    fn status(context: &ProcessingContext) -> Option<StatusWord> {
        context.response().map(ResponseApdu::status_word)
    }

    #[test]
    fn transitions() {
        let mut engine = ProtocolEngine::new(Challenge::default());
        assert_eq!(engine.registry().len(), 4);

        let ctx = process(&mut engine, &hex!("00 A4 0400 02 3F00"));
        assert_eq!(status(&ctx), Some(StatusWord::SUCCESS));
        assert_eq!(engine.state(), &ChallengeState::Selected(Selected::Ready));

        let ctx = process(&mut engine, &hex!("00 84 0000 08"));
        assert_eq!(status(&ctx), Some(StatusWord::SUCCESS));
        assert_eq!(engine.state(), &ChallengeState::Selected(Selected::Issued));
        assert_eq!(engine.protocol().issued, 1);
    }

    #[test]
    fn unrecognized_event() {
        let mut engine = ProtocolEngine::new(Challenge::default());
        // No response and no state change
        let ctx = process(&mut engine, &hex!("00 84 0000 08"));
        assert_eq!(status(&ctx), None);
        assert_eq!(engine.state(), &ChallengeState::Idle);

        process(&mut engine, &hex!("00 A4 0400 02 3F00"));
        let ctx = process(&mut engine, &hex!("00 B0 0000 08"));
        assert_eq!(status(&ctx), None);
        assert_eq!(engine.state(), &ChallengeState::Selected(Selected::Ready));
    }

    #[test]
    fn processing_error() {
        let mut engine = ProtocolEngine::new(Challenge::default());
        process(&mut engine, &hex!("00 A4 0400 02 3F00"));
        let ctx = process(&mut engine, &hex!("00 FA 0000"));
        assert_eq!(status(&ctx), Some(StatusWord::WRONG_DATA));
        assert_eq!(engine.state(), &ChallengeState::Idle);
        assert_eq!(ctx.history().len(), 1);
        assert_eq!(ctx.history()[0].message, "failing on request");
    }

    #[test]
    fn transition_limit() {
        let mut engine = ProtocolEngine::new(Challenge::default()).with_max_transitions(4);
        let ctx = process(&mut engine, &hex!("00 EE 0000"));
        assert_eq!(status(&ctx), Some(StatusWord::UNKNOWN_ERROR));
        assert_eq!(engine.state(), &ChallengeState::Idle);
    }

    #[test]
    fn guards() {
        let mut engine = ProtocolEngine::new(Challenge::default());
        let command = Rc::new(CommandApdu::new(hex!("00 A4 0400"), hex!("3F00"), None).unwrap());
        let mut context = ProcessingContext::new(command);
        let mut step = Step::new("challenge", &mut context, &engine.registry);
        assert!(step.is_apdu("Select"));
        assert!(step.is_apdu("Select"));
        assert!(!step.is_apdu("Get Challenge"));
        assert!(!step.is_apdu("Unknown"));
        assert!(step.verdict("Unknown").is_none());
        assert!(!step.apdu_has_been_processed());
        assert!(!step.warning_or_error_occurred());

        step.respond_status("counter", StatusWord::retry_counter(2));
        assert!(step.apdu_has_been_processed());
        assert!(step.is_status_word(0x63C2));
        assert!(step.is_status_word_63cx_counter());
        assert!(step.warning_or_error_occurred());

        engine.register_apdu_specification(CommandShapeSpec::new("Select").with_ins(0xA5));
        assert_eq!(engine.registry().len(), 4);
    }
}
