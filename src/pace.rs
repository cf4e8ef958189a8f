// Copyright (C) 2022 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

//! Password Authenticated Connection Establishment, TR-03110 part 2 § 3.2
//!
//! The terminal selects a protocol and a password with MSE:Set AT and then runs four chained
//! General Authenticate commands.  After the mutual authentication, the session keys are
//! announced as [`Propagation`]s of the command's context.

mod info;
mod mechanism;
mod set_at;

use std::rc::Rc;

pub use info::{
    Cipher, Mappings, PaceOptions, PaceProtocol, DEFAULT_DOMAIN_PARAMETERS, ID_PACE, ID_ROLES,
};
pub use mechanism::{Authentication, PaceMechanism};
pub use set_at::{Chat, SetAt};

use crate::accessor::{CardStateAccessor, PasswordRef, PasswordState};
use crate::apdu::{IsoCase, ResponseApdu, StatusWord};
use crate::context::{Propagation, SecurityEvent, SecurityMechanism, SessionKeys};
use crate::engine::{Protocol, SecInfoPublicity, Step};
use crate::error::ProcessingError;
use crate::matcher::{
    CommandShapeSpec, Constraint, Requirement, TagOrder, TagTemplate, TagTreeTemplate,
};
use crate::tlv::{self, tag, Tlv};

/// Any MSE:Set AT for mutual authentication
pub const MSE_SET_AT: &str = "MSE:Set AT";
/// MSE:Set AT with the data objects used by PACE
pub const SET_AT: &str = "Set AT";
/// First General Authenticate, requesting the encrypted nonce
pub const GA_ENCRYPTED_NONCE: &str = "General Authenticate Encrypted Nonce";
/// Second General Authenticate, carrying the mapping data
pub const GA_MAP_NONCE: &str = "General Authenticate Map Nonce";
/// Third General Authenticate, carrying the ephemeral public key
pub const GA_KEY_AGREEMENT: &str = "General Authenticate Key Agreement";
/// Last General Authenticate, carrying the authentication token
pub const GA_MUTUAL_AUTHENTICATE: &str = "General Authenticate Mutual Authentication";
/// Any General Authenticate
pub const GENERAL_AUTHENTICATE: &str = "General Authenticate";

const DYNAMIC_AUTHENTICATION_DATA: u32 = 0x7C;

/// Top level modes of PACE
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PaceState {
    /// No authentication is running
    #[default]
    Idle,
    /// An authentication is running
    Authenticating(PaceStep),
    /// Keys have been agreed and are announced before returning to `Idle`
    Established,
}

/// Progress of an authentication, named after the last completed step
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PaceStep {
    /// MSE:Set AT has been accepted
    #[default]
    SetAtProcessed,
    /// The encrypted nonce has been sent
    NonceSent,
    /// The nonce has been mapped
    NonceMapped,
    /// The ephemeral keys have been exchanged
    KeyAgreed,
}

/// A completed authentication awaiting announcement
#[derive(Debug)]
struct Established {
    request: SetAt,
    keys: SessionKeys,
}

/// The PACE protocol, with the cryptography provided by `M`
#[derive(Debug)]
pub struct Pace<M> {
    mechanism: M,
    options: PaceOptions,
    accessor: Option<Rc<dyn CardStateAccessor>>,
    request: Option<SetAt>,
    established: Option<Established>,
    /// Whether a PACE run with the CAN succeeded in this session, resuming a suspended PIN
    can_authenticated: bool,
}

impl<M: PaceMechanism> Pace<M> {
    /// PACE with the given mechanism and options
    pub fn new(mechanism: M, options: PaceOptions) -> Self {
        Self {
            mechanism,
            options,
            accessor: None,
            request: None,
            established: None,
            can_authenticated: false,
        }
    }

    /// The mechanism running the cryptography
    pub fn mechanism(&self) -> &M {
        &self.mechanism
    }

    fn accessor(&self) -> Result<&Rc<dyn CardStateAccessor>, ProcessingError> {
        self.accessor
            .as_ref()
            .ok_or_else(|| ProcessingError::new(StatusWord::UNKNOWN_ERROR, "no card state"))
    }

    fn password(&self, password: PasswordRef) -> Result<PasswordState, ProcessingError> {
        self.accessor()?.password(password).ok_or_else(|| {
            ProcessingError::new(
                StatusWord::REFERENCED_DATA_NOT_FOUND,
                format!("{password:?} not set"),
            )
        })
    }

    fn is_suspended(&self, password: PasswordRef, state: &PasswordState) -> bool {
        password == PasswordRef::Pin && state.is_suspended() && !self.can_authenticated
    }

    fn set_at(&mut self, step: &mut Step<'_>) -> Result<PaceState, ProcessingError> {
        self.request = None;
        self.established = None;
        self.mechanism.reset();

        let verdict = step.verdict(SET_AT).ok_or_else(|| {
            ProcessingError::new(StatusWord::UNKNOWN_ERROR, "Set AT not registered")
        })?;
        if !verdict.is_match() {
            return Err(ProcessingError::new(
                verdict.status(),
                verdict.diagnostic().to_owned(),
            ));
        }

        let objects = tlv::parse_all(step.command().data())
            .map_err(|_| ProcessingError::new(StatusWord::MALFORMED_DATA, "invalid Set AT data"))?;
        let request = SetAt::parse(&objects, &self.options)?;
        let password = self.password(request.password)?;
        if let Some(chat) = &request.chat {
            if self.accessor()?.trust_point(chat.terminal).is_none() {
                return Err(ProcessingError::new(
                    StatusWord::REFERENCED_DATA_NOT_FOUND,
                    format!("no trust point for {:?}", chat.terminal),
                ));
            }
        }

        let status = if password.is_blocked() {
            StatusWord::retry_counter(0)
        } else if self.is_suspended(request.password, &password) {
            StatusWord::retry_counter(1)
        } else {
            StatusWord::SUCCESS
        };
        info!("PACE with {:?} using {:?}", request.password, request.protocol);
        step.respond_status("Set AT", status);
        step.return_result();
        self.request = Some(request);
        Ok(PaceState::Authenticating(PaceStep::default()))
    }

    fn authenticate(
        &mut self,
        current: PaceStep,
        step: &mut Step<'_>,
    ) -> Result<Option<PaceState>, ProcessingError> {
        let next = match current {
            PaceStep::SetAtProcessed if step.is_apdu(GA_ENCRYPTED_NONCE) => {
                let request = self.request.as_ref().ok_or_else(out_of_sequence)?;
                let (password, protocol) = (request.password, request.protocol);
                let secret = self.password(password)?.secret;
                let nonce = self.mechanism.encrypted_nonce(
                    protocol,
                    self.options.domain_parameters,
                    &secret,
                )?;
                respond_authentication_data(step, "encrypted nonce", 0x80, nonce);
                PaceStep::NonceSent
            }
            PaceStep::NonceSent if step.is_apdu(GA_MAP_NONCE) => {
                let mapping_data = authentication_data(step, 0x81)?;
                let mapping_data = self.mechanism.map_nonce(&mapping_data)?;
                respond_authentication_data(step, "mapping data", 0x82, mapping_data);
                PaceStep::NonceMapped
            }
            PaceStep::NonceMapped if step.is_apdu(GA_KEY_AGREEMENT) => {
                let ephemeral_key = authentication_data(step, 0x83)?;
                let ephemeral_key = self.mechanism.key_agreement(&ephemeral_key)?;
                respond_authentication_data(step, "ephemeral public key", 0x84, ephemeral_key);
                PaceStep::KeyAgreed
            }
            PaceStep::KeyAgreed if step.is_apdu(GA_MUTUAL_AUTHENTICATE) => {
                return self.mutual_authenticate(step).map(Some);
            }
            _ if step.is_apdu(GENERAL_AUTHENTICATE) => return Err(out_of_sequence()),
            _ => return Ok(None),
        };
        step.return_result();
        Ok(Some(PaceState::Authenticating(next)))
    }

    fn mutual_authenticate(&mut self, step: &mut Step<'_>) -> Result<PaceState, ProcessingError> {
        let token = authentication_data(step, 0x85)?;
        let request = self.request.take().ok_or_else(out_of_sequence)?;
        let password = self.password(request.password)?;
        if password.is_blocked() {
            return Err(ProcessingError::new(
                StatusWord::AUTHENTICATION_METHOD_BLOCKED,
                format!("{:?} blocked", request.password),
            ));
        }
        if self.is_suspended(request.password, &password) {
            return Err(ProcessingError::new(
                StatusWord::CONDITIONS_OF_USE_NOT_SATISFIED,
                "PIN suspended, CAN required",
            ));
        }

        let Some(authentication) = self.mechanism.mutual_authenticate(&token)? else {
            let status = match password.retry_counter {
                Some(counter) => {
                    let remaining = counter.saturating_sub(1);
                    self.accessor()?
                        .set_retry_counter(request.password, remaining)?;
                    StatusWord::retry_counter(remaining)
                }
                None => StatusWord::VERIFICATION_FAILED,
            };
            warn!("PACE with {:?} failed", request.password);
            step.propagate(
                "authentication failed",
                Propagation::SecurityEvent(SecurityEvent::AuthenticationFailed(request.password)),
            );
            step.respond_status("authentication token rejected", status);
            step.return_result();
            return Ok(self.error_state());
        };

        if let (Some(counter), Some(initial)) =
            (password.retry_counter, password.initial_retry_counter)
        {
            if counter != initial {
                self.accessor()?
                    .set_retry_counter(request.password, initial)?;
            }
        }
        if request.password == PasswordRef::Can {
            self.can_authenticated = true;
        }
        respond_authentication_data(step, "authentication token", 0x86, authentication.token);
        self.established = Some(Established {
            request,
            keys: authentication.keys,
        });
        Ok(PaceState::Established)
    }

    fn established(&mut self, step: &mut Step<'_>) -> Result<PaceState, ProcessingError> {
        let Established { request, keys } = self.established.take().ok_or_else(|| {
            ProcessingError::new(StatusWord::UNKNOWN_ERROR, "no established session")
        })?;
        step.propagate(
            "PACE established",
            Propagation::SecurityMechanism(SecurityMechanism::Pace {
                password: request.password,
                protocol: request.oid,
                chat: request.chat.map(|chat| chat.encoded),
            }),
        );
        step.propagate("session keys", Propagation::SecureMessaging(keys));
        step.propagate(
            "secure messaging",
            Propagation::SecurityEvent(SecurityEvent::SecureMessagingEstablished),
        );
        step.return_result();
        Ok(PaceState::Idle)
    }
}

fn out_of_sequence() -> ProcessingError {
    ProcessingError::new(
        StatusWord::CONDITIONS_OF_USE_NOT_SATISFIED,
        "General Authenticate out of sequence",
    )
}

/// The data object `inner` of the dynamic authentication data
fn authentication_data(step: &Step<'_>, inner: u32) -> Result<Vec<u8>, ProcessingError> {
    let objects = tlv::parse_all(step.command().data()).map_err(|_| {
        ProcessingError::new(StatusWord::MALFORMED_DATA, "invalid authentication data")
    })?;
    tlv::get_do(&[tag(DYNAMIC_AUTHENTICATION_DATA), tag(inner)], &objects)
        .and_then(Tlv::bytes)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| {
            ProcessingError::new(
                StatusWord::WRONG_DATA,
                format!("missing authentication data {inner:02X}"),
            )
        })
}

fn respond_authentication_data(step: &mut Step<'_>, message: &str, inner: u32, data: Vec<u8>) {
    let data = Tlv::constructed(
        tag(DYNAMIC_AUTHENTICATION_DATA),
        vec![Tlv::primitive(tag(inner), data)],
    );
    step.respond(message, ResponseApdu::with_data(vec![data], StatusWord::SUCCESS));
}

fn general_authenticate(
    id: &str,
    chaining: Constraint<bool>,
    data: TagTemplate,
) -> CommandShapeSpec {
    CommandShapeSpec::new(id)
        .with_ins(0x86)
        .with_p1(0x00)
        .with_p2(0x00)
        .with_case(IsoCase::Case4)
        .with_chaining(chaining)
        .with_tags(TagTreeTemplate {
            children: vec![data],
            ..Default::default()
        })
}

fn dynamic_authentication_data(children: Vec<TagTemplate>) -> TagTemplate {
    TagTemplate::new(tag(DYNAMIC_AUTHENTICATION_DATA), Requirement::Required)
        .with_children(children)
}

impl<M: PaceMechanism> Protocol for Pace<M> {
    type State = PaceState;

    fn name(&self) -> &'static str {
        "PACE"
    }

    fn specifications(&self) -> Vec<CommandShapeSpec> {
        let mse_set_at = CommandShapeSpec::new(MSE_SET_AT)
            .with_ins(0x22)
            .with_p1(0xC1)
            .with_p2(0xA4);
        let set_at = CommandShapeSpec::new(SET_AT)
            .with_ins(0x22)
            .with_p1(0xC1)
            .with_p2(0xA4)
            .with_case(IsoCase::Case3)
            .with_chaining(false)
            .with_tags(TagTreeTemplate {
                order: TagOrder::Arbitrary,
                allow_unspecified: false,
                children: vec![
                    TagTemplate::new(tag(0x80), Requirement::Required),
                    TagTemplate::new(tag(0x83), Requirement::Required),
                    TagTemplate::new(tag(0x84), Requirement::Optional),
                    TagTemplate::new(tag(0x67), Requirement::Optional),
                    TagTemplate::new(tag(0x7F4C), Requirement::Optional).with_children(vec![
                        TagTemplate::new(tag(0x06), Requirement::Required),
                        TagTemplate::new(tag(0x53), Requirement::Optional),
                    ]),
                ],
            });

        let step_data = |inner: u32| {
            dynamic_authentication_data(vec![TagTemplate::new(tag(inner), Requirement::Required)])
        };
        // The first step carries an empty template
        let no_data = dynamic_authentication_data(
            [0x81, 0x83, 0x85]
                .into_iter()
                .map(|inner| TagTemplate::new(tag(inner), Requirement::Forbidden))
                .collect(),
        );

        vec![
            mse_set_at,
            set_at,
            general_authenticate(GA_ENCRYPTED_NONCE, true.into(), no_data),
            general_authenticate(GA_MAP_NONCE, true.into(), step_data(0x81)),
            general_authenticate(GA_KEY_AGREEMENT, true.into(), step_data(0x83)),
            general_authenticate(
                GA_MUTUAL_AUTHENTICATE,
                Constraint::Forbidden(true),
                step_data(0x85),
            ),
            CommandShapeSpec::new(GENERAL_AUTHENTICATE).with_ins(0x86),
        ]
    }

    fn transition(
        &mut self,
        state: &PaceState,
        step: &mut Step<'_>,
    ) -> Result<Option<PaceState>, ProcessingError> {
        match state {
            PaceState::Established => self.established(step).map(Some),
            _ if step.is_apdu(MSE_SET_AT) => self.set_at(step).map(Some),
            PaceState::Authenticating(current) => self.authenticate(*current, step),
            PaceState::Idle if step.is_apdu(GENERAL_AUTHENTICATE) => Err(out_of_sequence()),
            PaceState::Idle => Ok(None),
        }
    }

    fn reset(&mut self) {
        self.request = None;
        self.established = None;
        self.can_authenticated = false;
        self.mechanism.reset();
    }

    fn set_card_state_accessor(&mut self, accessor: Rc<dyn CardStateAccessor>) {
        self.accessor = Some(accessor);
    }

    fn sec_infos(&self, _publicity: SecInfoPublicity) -> Vec<Tlv> {
        self.options.pace_infos()
    }
}
