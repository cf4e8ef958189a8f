// Copyright (C) 2022 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

use std::borrow::Cow;
use std::marker::PhantomData;

use crate::apdu::status::StatusWord;

/// Verdicts of [`CommandShapeSpec::matches`][crate::matcher::CommandShapeSpec::matches]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Structural {}

/// Verdicts of [`TagRequirementTree::matches`][crate::matcher::TagRequirementTree::matches]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TagTree {}

/// Outcome of a match: the status word proposed for the command and a diagnostic.
///
/// A verdict is a match when the proposed status is `9000`.  The origin parameter only tells
/// verdicts of the structural checks and of the tag tree apart; both behave identically.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchVerdict<O = Structural> {
    status: StatusWord,
    diagnostic: Cow<'static, str>,
    origin: PhantomData<O>,
}

/// Verdict of a [`TagRequirementTree`](super::TagRequirementTree)
pub type TagMatchVerdict = MatchVerdict<TagTree>;

impl<O> MatchVerdict<O> {
    /// A match, with status `9000`
    pub fn success() -> Self {
        Self {
            status: StatusWord::SUCCESS,
            diagnostic: Cow::Borrowed("match"),
            origin: PhantomData,
        }
    }

    /// A mismatch to be answered with `status`
    pub fn failure(status: StatusWord, diagnostic: impl Into<Cow<'static, str>>) -> Self {
        Self {
            status,
            diagnostic: diagnostic.into(),
            origin: PhantomData,
        }
    }

    /// Whether the command matched
    pub fn is_match(&self) -> bool {
        self.status.is_success()
    }

    /// The status word proposed for the command
    pub fn status(&self) -> StatusWord {
        self.status
    }

    /// Why the command did not match, empty on a match
    pub fn diagnostic(&self) -> &str {
        &self.diagnostic
    }
}

impl From<TagMatchVerdict> for MatchVerdict<Structural> {
    fn from(verdict: TagMatchVerdict) -> Self {
        Self {
            status: verdict.status,
            diagnostic: verdict.diagnostic,
            origin: PhantomData,
        }
    }
}

impl<O> core::fmt::Display for MatchVerdict<O> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} ({})", self.diagnostic, self.status)
    }
}
