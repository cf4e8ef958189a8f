// Copyright (C) 2022 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

use core::fmt::Debug;

use serde::{Deserialize, Serialize};

/// How a matchable field or tag is constrained
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Requirement {
    /// The expected value must not be present
    Forbidden,
    /// Any value is accepted
    Optional,
    /// The expected value must be present
    #[default]
    Required,
}

impl Requirement {
    /// Whether a field whose value `equals` the expected one satisfies this requirement
    pub fn is_satisfied(self, equals: bool) -> bool {
        match self {
            Self::Forbidden => !equals,
            Self::Optional => true,
            Self::Required => equals,
        }
    }
}

/// A structural field paired with its [`Requirement`].
///
/// An optional field carries no value, so there is nothing to read for unconstrained fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Constraint<T> {
    /// Any value is accepted
    Optional,
    /// The field must have this value
    Required(T),
    /// The field must not have this value
    Forbidden(T),
}

impl<T> Default for Constraint<T> {
    fn default() -> Self {
        Self::Optional
    }
}

impl<T> From<T> for Constraint<T> {
    fn from(value: T) -> Self {
        Self::Required(value)
    }
}

impl<T> Constraint<T> {
    /// The requirement without the value
    pub fn requirement(&self) -> Requirement {
        match self {
            Self::Optional => Requirement::Optional,
            Self::Required(_) => Requirement::Required,
            Self::Forbidden(_) => Requirement::Forbidden,
        }
    }

    /// The constrained value, `None` for optional fields
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Optional => None,
            Self::Required(value) | Self::Forbidden(value) => Some(value),
        }
    }

    /// Whether any value is accepted
    pub fn is_optional(&self) -> bool {
        matches!(self, Self::Optional)
    }
}

impl<T: PartialEq + Debug> Constraint<T> {
    /// Whether `actual` satisfies the constraint
    pub fn admits(&self, actual: &T) -> bool {
        self.requirement()
            .is_satisfied(self.value().map_or(false, |expected| expected == actual))
    }

    /// Diagnostic for a value not admitted by the constraint
    pub(crate) fn mismatch(&self, field: &str, actual: &T) -> String {
        match self {
            Self::Required(expected) => {
                format!("{field} {expected:x?} expected, got {actual:x?}")
            }
            Self::Forbidden(forbidden) => format!("{field} must not be {forbidden:x?}"),
            Self::Optional => format!("{field} {actual:x?} accepted"),
        }
    }
}
