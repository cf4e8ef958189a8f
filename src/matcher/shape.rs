// Copyright (C) 2022 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

use serde::{Deserialize, Serialize};

use super::requirement::{Constraint, Requirement};
use super::tags::TagRequirementTree;
use super::verdict::MatchVerdict;
use crate::apdu::{ApduFormat, CommandApdu, IsoCase, SecureMessaging};
use crate::apdu::status::StatusWord;
use crate::tlv;

/// Structural description of an expected command, identified by a name.
///
/// Checks run in a fixed order and the first failing one determines the verdict:
///
/// | check            | status on failure |
/// |------------------|-------------------|
/// | format           | `6E00`            |
/// | chaining         | `6884`            |
/// | secure messaging | `6882`            |
/// | channel          | `6881`            |
/// | INS              | `6D00`            |
/// | P1, P2           | `6A86`            |
/// | case             | `6700`            |
/// | extended length  | `6700`            |
/// | data field       | `6A80` / `6A85`   |
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandShapeSpec {
    id: String,
    #[serde(default)]
    format: Constraint<ApduFormat>,
    #[serde(default)]
    chaining: Constraint<bool>,
    #[serde(default)]
    secure_messaging: Constraint<SecureMessaging>,
    #[serde(default)]
    channel: Constraint<u8>,
    #[serde(default)]
    ins: Constraint<u8>,
    #[serde(default)]
    p1: Constraint<u8>,
    #[serde(default)]
    p2: Constraint<u8>,
    #[serde(default)]
    case: Constraint<IsoCase>,
    #[serde(default)]
    extended_length: Constraint<bool>,
    #[serde(default)]
    tags: Option<TagRequirementTree>,
}

impl CommandShapeSpec {
    /// A specification accepting every command
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            format: Constraint::Optional,
            chaining: Constraint::Optional,
            secure_messaging: Constraint::Optional,
            channel: Constraint::Optional,
            ins: Constraint::Optional,
            p1: Constraint::Optional,
            p2: Constraint::Optional,
            case: Constraint::Optional,
            extended_length: Constraint::Optional,
            tags: None,
        }
    }

    /// Constrains the transport format
    pub fn with_format(mut self, format: impl Into<Constraint<ApduFormat>>) -> Self {
        self.format = format.into();
        self
    }

    /// Constrains the command chaining bit
    pub fn with_chaining(mut self, chaining: impl Into<Constraint<bool>>) -> Self {
        self.chaining = chaining.into();
        self
    }

    /// Constrains secure messaging, satisfied by predecessors as well
    pub fn with_secure_messaging(mut self, sm: impl Into<Constraint<SecureMessaging>>) -> Self {
        self.secure_messaging = sm.into();
        self
    }

    /// Constrains the logical channel
    pub fn with_channel(mut self, channel: impl Into<Constraint<u8>>) -> Self {
        self.channel = channel.into();
        self
    }

    /// Constrains the instruction byte
    pub fn with_ins(mut self, ins: impl Into<Constraint<u8>>) -> Self {
        self.ins = ins.into();
        self
    }

    /// Constrains P1
    pub fn with_p1(mut self, p1: impl Into<Constraint<u8>>) -> Self {
        self.p1 = p1.into();
        self
    }

    /// Constrains P2
    pub fn with_p2(mut self, p2: impl Into<Constraint<u8>>) -> Self {
        self.p2 = p2.into();
        self
    }

    /// Constrains the ISO case
    pub fn with_case(mut self, case: impl Into<Constraint<IsoCase>>) -> Self {
        self.case = case.into();
        self
    }

    /// Constrains the use of extended length fields
    pub fn with_extended_length(mut self, extended: impl Into<Constraint<bool>>) -> Self {
        self.extended_length = extended.into();
        self
    }

    /// Expected layout of the data field
    pub fn with_tags(mut self, tags: impl Into<TagRequirementTree>) -> Self {
        self.tags = Some(tags.into());
        self
    }

    /// Identifier the specification is registered with
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The format constraint
    pub fn format(&self) -> &Constraint<ApduFormat> {
        &self.format
    }

    /// The chaining constraint
    pub fn chaining(&self) -> &Constraint<bool> {
        &self.chaining
    }

    /// The secure messaging constraint
    pub fn secure_messaging(&self) -> &Constraint<SecureMessaging> {
        &self.secure_messaging
    }

    /// The logical channel constraint
    pub fn channel(&self) -> &Constraint<u8> {
        &self.channel
    }

    /// The INS constraint
    pub fn ins(&self) -> &Constraint<u8> {
        &self.ins
    }

    /// The P1 constraint
    pub fn p1(&self) -> &Constraint<u8> {
        &self.p1
    }

    /// The P2 constraint
    pub fn p2(&self) -> &Constraint<u8> {
        &self.p2
    }

    /// The case constraint
    pub fn case(&self) -> &Constraint<IsoCase> {
        &self.case
    }

    /// The extended length constraint
    pub fn extended_length(&self) -> &Constraint<bool> {
        &self.extended_length
    }

    /// The expected layout of the data field
    pub fn tags(&self) -> Option<&TagRequirementTree> {
        self.tags.as_ref()
    }

    /// Checks `command` against the specification.
    pub fn matches(&self, command: &CommandApdu) -> MatchVerdict {
        if !self.format.admits(&command.format()) {
            return MatchVerdict::failure(
                StatusWord::CLASS_NOT_SUPPORTED,
                self.format.mismatch("format", &command.format()),
            );
        }

        if let Err(verdict) = class_field(
            &self.chaining,
            command.chaining(),
            "chaining",
            StatusWord::COMMAND_CHAINING_NOT_SUPPORTED,
        ) {
            return verdict;
        }

        if let Err(verdict) = self.match_secure_messaging(command) {
            return verdict;
        }

        if let Err(verdict) = class_field(
            &self.channel,
            command.channel(),
            "logical channel",
            StatusWord::LOGICAL_CHANNEL_NOT_SUPPORTED,
        ) {
            return verdict;
        }

        if !self.ins.admits(&command.ins()) {
            return MatchVerdict::failure(
                StatusWord::INSTRUCTION_NOT_SUPPORTED,
                self.ins.mismatch("INS", &command.ins()),
            );
        }
        if !self.p1.admits(&command.p1()) {
            return MatchVerdict::failure(
                StatusWord::INCORRECT_P1_P2,
                self.p1.mismatch("P1", &command.p1()),
            );
        }
        if !self.p2.admits(&command.p2()) {
            return MatchVerdict::failure(
                StatusWord::INCORRECT_P1_P2,
                self.p2.mismatch("P2", &command.p2()),
            );
        }

        if !self.case.admits(&command.case()) {
            return MatchVerdict::failure(
                StatusWord::WRONG_LENGTH,
                self.case.mismatch("case", &command.case()),
            );
        }

        if !self.extended_length.is_optional() {
            if command.case() == IsoCase::Case1 {
                return MatchVerdict::failure(
                    StatusWord::WRONG_LENGTH,
                    "length encoding not applicable to case 1 commands",
                );
            }
            if !self.extended_length.admits(&command.is_extended()) {
                return MatchVerdict::failure(
                    StatusWord::WRONG_LENGTH,
                    self.extended_length
                        .mismatch("extended length", &command.is_extended()),
                );
            }
        }

        match &self.tags {
            Some(tree) if !tree.is_empty() => match tlv::parse_all(command.data()) {
                Ok(objects) => tree.matches(&objects).into(),
                Err(_) => MatchVerdict::failure(
                    StatusWord::MALFORMED_DATA,
                    "data field is not BER-TLV encoded",
                ),
            },
            _ => MatchVerdict::success(),
        }
    }

    /// Secure messaging is satisfied by the command or any command it was derived from.
    fn match_secure_messaging(&self, command: &CommandApdu) -> Result<(), MatchVerdict> {
        let Some(expected) = self.secure_messaging.value() else {
            return Ok(());
        };
        let used = command
            .chain()
            .any(|c| c.secure_messaging() == Some(*expected));
        if self.secure_messaging.requirement().is_satisfied(used) {
            return Ok(());
        }
        let diagnostic = match self.secure_messaging.requirement() {
            Requirement::Forbidden => format!("secure messaging {expected:?} used"),
            _ => format!("secure messaging {expected:?} expected"),
        };
        Err(MatchVerdict::failure(
            StatusWord::SECURE_MESSAGING_NOT_SUPPORTED,
            diagnostic,
        ))
    }
}

/// Checks a field decoded from the class byte, which is absent for proprietary classes.
fn class_field<T: PartialEq + core::fmt::Debug>(
    constraint: &Constraint<T>,
    actual: Option<T>,
    field: &str,
    status: StatusWord,
) -> Result<(), MatchVerdict> {
    if constraint.is_optional() {
        return Ok(());
    }
    match actual {
        None => Err(MatchVerdict::failure(
            status,
            format!("class byte does not encode {field}"),
        )),
        Some(actual) if !constraint.admits(&actual) => Err(MatchVerdict::failure(
            status,
            constraint.mismatch(field, &actual),
        )),
        Some(_) => Ok(()),
    }
}
