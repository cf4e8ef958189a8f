// Copyright (C) 2022 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::requirement::Requirement;
use super::verdict::TagMatchVerdict;
use crate::apdu::status::StatusWord;
use crate::tlv::{Tag, Tlv};

/// Handle of a node in a [`TagRequirementTree`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

/// Whether the children of a node must appear in declaration order
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TagOrder {
    /// Specified tags appear in the order of the specification
    #[default]
    Strict,
    /// Specified tags appear in any order
    Arbitrary,
}

/// The `skip`-th occurrence of `tag` among its siblings (0 being the first).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TagOccurrence {
    /// The tag
    pub tag: Tag,
    /// Number of earlier occurrences of `tag` among the siblings
    pub skip: usize,
}

/// A node of a [`TagRequirementTree`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TagNode {
    occurrence: Option<TagOccurrence>,
    requirement: Requirement,
    order: TagOrder,
    allow_unspecified: bool,
    children: Vec<NodeId>,
    parent: Option<NodeId>,
}

impl TagNode {
    fn new(
        occurrence: Option<TagOccurrence>,
        requirement: Requirement,
        parent: Option<NodeId>,
    ) -> Self {
        Self {
            occurrence,
            requirement,
            order: TagOrder::default(),
            allow_unspecified: false,
            children: Vec::new(),
            parent,
        }
    }

    /// `None` for the root
    pub fn occurrence(&self) -> Option<&TagOccurrence> {
        self.occurrence.as_ref()
    }

    /// Whether the tag must, may or must not appear
    pub fn requirement(&self) -> Requirement {
        self.requirement
    }

    /// Order of the children
    pub fn order(&self) -> TagOrder {
        self.order
    }

    /// Whether tags without a matching child are skipped instead of rejected
    pub fn allows_unspecified(&self) -> bool {
        self.allow_unspecified
    }

    /// The nested tags
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// The enclosing node, `None` for the root
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    fn matches(&self, tag: &Tag, skip: usize) -> bool {
        self.occurrence
            .as_ref()
            .map_or(false, |o| o.tag == *tag && o.skip == skip)
    }
}

/// Expected layout of a BER-TLV data field.
///
/// Nodes live in an arena owned by the tree and refer to each other through [`NodeId`]s.  The
/// root node carries no tag; its children describe the top level data objects.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "TagTreeTemplate", into = "TagTreeTemplate")]
pub struct TagRequirementTree {
    nodes: Vec<TagNode>,
}

impl Default for TagRequirementTree {
    fn default() -> Self {
        Self::new()
    }
}

impl TagRequirementTree {
    /// A tree with only a root, with strict ordering and no unspecified tags allowed
    pub fn new() -> Self {
        Self {
            nodes: vec![TagNode::new(None, Requirement::Required, None)],
        }
    }

    /// The root node, standing for the data field itself
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// Panics if `id` was not handed out by this tree.
    pub fn node(&self, id: NodeId) -> &TagNode {
        &self.nodes[id.0]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut TagNode {
        &mut self.nodes[id.0]
    }

    /// Appends a child to `parent`.
    ///
    /// The occurrence index is derived from the siblings already carrying `tag`, so adding the
    /// same tag twice describes two consecutive occurrences.
    pub fn add_child(&mut self, parent: NodeId, tag: Tag, requirement: Requirement) -> NodeId {
        let skip = self
            .node(parent)
            .children
            .iter()
            .filter(|c| self.node(**c).occurrence.as_ref().map(|o| &o.tag) == Some(&tag))
            .count();
        let id = NodeId(self.nodes.len());
        self.nodes.push(TagNode::new(
            Some(TagOccurrence { tag, skip }),
            requirement,
            Some(parent),
        ));
        self.node_mut(parent).children.push(id);
        id
    }

    /// Sets the order of the children of `node`
    pub fn set_order(&mut self, node: NodeId, order: TagOrder) -> &mut Self {
        self.node_mut(node).order = order;
        self
    }

    /// Sets whether `node` accepts children that are not specified
    pub fn set_allow_unspecified(&mut self, node: NodeId, allow: bool) -> &mut Self {
        self.node_mut(node).allow_unspecified = allow;
        self
    }

    /// The enclosing node of `node`
    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.node(node).parent
    }

    /// The nested tags of `node`
    pub fn children(&self, node: NodeId) -> &[NodeId] {
        &self.node(node).children
    }

    /// Whether the tree places no expectation on the data field
    pub fn is_empty(&self) -> bool {
        self.node(self.root()).children.is_empty()
    }

    /// Matches the top level data objects of a data field against the tree.
    pub fn matches(&self, objects: &[Tlv]) -> TagMatchVerdict {
        self.match_node(self.root(), objects)
    }

    fn match_node(&self, id: NodeId, objects: &[Tlv]) -> TagMatchVerdict {
        let node = self.node(id);
        let mut occurrences: HashMap<&Tag, usize> = HashMap::new();
        let mut highest_index = 0;
        let mut required_seen = 0;

        for object in objects {
            let tag = object.tag();
            let seen = occurrences.entry(tag).or_insert(0);
            let skip = *seen;
            *seen += 1;

            let resolved = node
                .children
                .iter()
                .enumerate()
                .find(|(_, child)| self.node(**child).matches(tag, skip));
            let Some((index, child_id)) = resolved else {
                if node.allow_unspecified {
                    continue;
                }
                return TagMatchVerdict::failure(
                    StatusWord::WRONG_DATA,
                    format!("unexpected tag {tag}"),
                );
            };

            let child = self.node(*child_id);
            match child.requirement {
                Requirement::Forbidden => {
                    return TagMatchVerdict::failure(
                        StatusWord::WRONG_DATA,
                        format!("tag {tag} not allowed"),
                    )
                }
                Requirement::Required => required_seen += 1,
                Requirement::Optional => {}
            }

            if node.order == TagOrder::Strict {
                if index < highest_index {
                    return TagMatchVerdict::failure(
                        StatusWord::WRONG_DATA,
                        format!("tag {tag} out of order"),
                    );
                }
                highest_index = index;
            }

            if !object.children().is_empty() && !child.children.is_empty() {
                let verdict = self.match_node(*child_id, object.children());
                if !verdict.is_match() {
                    return verdict;
                }
            }
        }

        let required = node
            .children
            .iter()
            .filter(|c| self.node(**c).requirement == Requirement::Required)
            .count();
        let missing = required.saturating_sub(required_seen);
        if missing > 0 {
            let plural = if missing == 1 { "" } else { "s" };
            return TagMatchVerdict::failure(
                StatusWord::WRONG_DATA,
                format!("missing {missing} more mandatory tag{plural}"),
            );
        }
        TagMatchVerdict::success()
    }

    fn add_template(&mut self, parent: NodeId, template: TagTemplate) {
        let id = self.add_child(parent, template.tag, template.requirement);
        self.set_order(id, template.order)
            .set_allow_unspecified(id, template.allow_unspecified);
        for child in template.children {
            self.add_template(id, child);
        }
    }

    fn template(&self, id: NodeId) -> Vec<TagTemplate> {
        self.children(id)
            .iter()
            .filter_map(|child| {
                let node = self.node(*child);
                let occurrence = node.occurrence.as_ref()?;
                Some(TagTemplate {
                    tag: occurrence.tag.clone(),
                    requirement: node.requirement,
                    order: node.order,
                    allow_unspecified: node.allow_unspecified,
                    children: self.template(*child),
                })
            })
            .collect()
    }
}

/// Nested description of one expected tag, used to build and (de)serialize trees
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TagTemplate {
    /// The specified tag
    pub tag: Tag,
    /// Whether the tag must, may or must not appear
    #[serde(default)]
    pub requirement: Requirement,
    /// Order of the children
    #[serde(default)]
    pub order: TagOrder,
    /// Whether children that are not specified are accepted
    #[serde(default)]
    pub allow_unspecified: bool,
    /// The nested tags
    #[serde(default)]
    pub children: Vec<TagTemplate>,
}

impl TagTemplate {
    /// A tag without children, expecting them in strict order
    pub fn new(tag: Tag, requirement: Requirement) -> Self {
        Self {
            tag,
            requirement,
            order: TagOrder::default(),
            allow_unspecified: false,
            children: Vec::new(),
        }
    }

    /// Sets the nested tags
    pub fn with_children(mut self, children: Vec<TagTemplate>) -> Self {
        self.children = children;
        self
    }

    /// Sets the order of the nested tags
    pub fn with_order(mut self, order: TagOrder) -> Self {
        self.order = order;
        self
    }

    /// Accepts nested tags that are not specified
    pub fn allowing_unspecified(mut self) -> Self {
        self.allow_unspecified = true;
        self
    }
}

/// Settings of the root node and the top level tags
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TagTreeTemplate {
    /// Order of the top level tags
    #[serde(default)]
    pub order: TagOrder,
    /// Whether top level tags that are not specified are accepted
    #[serde(default)]
    pub allow_unspecified: bool,
    /// The top level tags
    #[serde(default)]
    pub children: Vec<TagTemplate>,
}

impl From<TagTreeTemplate> for TagRequirementTree {
    fn from(template: TagTreeTemplate) -> Self {
        let mut tree = Self::new();
        let root = tree.root();
        tree.set_order(root, template.order)
            .set_allow_unspecified(root, template.allow_unspecified);
        for child in template.children {
            tree.add_template(root, child);
        }
        tree
    }
}

impl From<TagRequirementTree> for TagTreeTemplate {
    fn from(tree: TagRequirementTree) -> Self {
        let root = tree.node(tree.root());
        Self {
            order: root.order,
            allow_unspecified: root.allow_unspecified,
            children: tree.template(tree.root()),
        }
    }
}
