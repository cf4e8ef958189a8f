// Copyright (C) 2022 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

//! Declarative command matching
//!
//! A [`CommandShapeSpec`] describes the structural envelope of a command (class byte semantics,
//! instruction, parameters, case) and, optionally, the expected layout of its BER-TLV data field
//! as a [`TagRequirementTree`].  Matching never fails with an error: every outcome is a
//! [`MatchVerdict`] carrying the status word that would be proposed to the terminal.

mod requirement;
mod shape;
mod tags;
mod verdict;

pub use requirement::{Constraint, Requirement};
pub use shape::CommandShapeSpec;
pub use tags::{
    NodeId, TagNode, TagOccurrence, TagOrder, TagRequirementTree, TagTemplate, TagTreeTemplate,
};
pub use verdict::{MatchVerdict, Structural, TagMatchVerdict, TagTree};
