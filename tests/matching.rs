// Copyright (C) 2022 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

use std::rc::Rc;

use cardengine::apdu::{ApduFormat, IsoCase, SecureMessaging};
use cardengine::matcher::{
    CommandShapeSpec, Constraint, Requirement, TagOrder, TagRequirementTree, TagTemplate,
    TagTreeTemplate,
};
use cardengine::tlv::{parse_all, Tag};
use cardengine::{CommandApdu, StatusWord};
use hex_literal::hex;
use test_log::test;

fn tag(value: u32) -> Tag {
    Tag::try_from(value).unwrap()
}

fn tree(order: TagOrder, children: &[(u32, Requirement)]) -> TagRequirementTree {
    TagTreeTemplate {
        order,
        allow_unspecified: false,
        children: children
            .iter()
            .map(|(t, requirement)| TagTemplate::new(tag(*t), *requirement))
            .collect(),
    }
    .into()
}

fn encode(tags: &[u32]) -> Vec<u8> {
    tags.iter()
        .flat_map(|t| {
            let mut object = tag(*t).as_bytes().to_vec();
            object.extend_from_slice(&[0x01, 0x00]);
            object
        })
        .collect()
}

fn check(tree: &TagRequirementTree, tags: &[u32]) -> Result<(), String> {
    let verdict = tree.matches(&parse_all(&encode(tags)).unwrap());
    if verdict.is_match() {
        Ok(())
    } else {
        assert_eq!(verdict.status(), StatusWord::WRONG_DATA);
        Err(verdict.diagnostic().to_owned())
    }
}

#[test]
fn requirement_tri_state() {
    for (requirement, present, expected) in [
        (Requirement::Required, true, true),
        (Requirement::Required, false, false),
        (Requirement::Optional, true, true),
        (Requirement::Optional, false, true),
        (Requirement::Forbidden, true, false),
        (Requirement::Forbidden, false, true),
    ] {
        assert_eq!(
            requirement.is_satisfied(present),
            expected,
            "{requirement:?} {present}"
        );
        let tree = tree(
            TagOrder::Strict,
            &[(0x80, Requirement::Optional), (0x81, requirement)],
        );
        let tags: &[u32] = if present { &[0x80, 0x81] } else { &[0x80] };
        assert_eq!(check(&tree, tags).is_ok(), expected, "{requirement:?} {present}");
    }
}

#[test]
fn order_sensitivity() {
    let children = [
        (0x80, Requirement::Required),
        (0x81, Requirement::Optional),
        (0x82, Requirement::Required),
    ];
    let strict = tree(TagOrder::Strict, &children);
    let arbitrary = tree(TagOrder::Arbitrary, &children);

    let orders: [&[u32]; 6] = [
        &[0x80, 0x81, 0x82],
        &[0x80, 0x82, 0x81],
        &[0x81, 0x80, 0x82],
        &[0x81, 0x82, 0x80],
        &[0x82, 0x80, 0x81],
        &[0x82, 0x81, 0x80],
    ];
    for tags in orders {
        assert_eq!(check(&arbitrary, tags), Ok(()), "{tags:x?}");
    }
    assert_eq!(check(&strict, orders[0]), Ok(()));
    assert_eq!(check(&strict, orders[1]), Err("tag 81 out of order".into()));
    assert_eq!(check(&strict, orders[2]), Err("tag 80 out of order".into()));
    assert_eq!(check(&strict, orders[5]), Err("tag 81 out of order".into()));
    // Skipping an optional tag keeps the order intact
    assert_eq!(check(&strict, &[0x80, 0x82]), Ok(()));
}

#[test]
fn missing_mandatory() {
    let tree = tree(
        TagOrder::Strict,
        &[
            (0x80, Requirement::Required),
            (0x81, Requirement::Required),
            (0x82, Requirement::Required),
        ],
    );
    assert_eq!(check(&tree, &[0x80, 0x81, 0x82]), Ok(()));
    assert_eq!(
        check(&tree, &[0x80, 0x82]),
        Err("missing 1 more mandatory tag".into())
    );
    assert_eq!(
        check(&tree, &[0x81]),
        Err("missing 2 more mandatory tags".into())
    );
    assert_eq!(
        check(&tree, &[]),
        Err("missing 3 more mandatory tags".into())
    );
}

#[test]
fn unspecified_tags() {
    let mut strict = tree(TagOrder::Strict, &[(0x80, Requirement::Required)]);
    assert_eq!(check(&strict, &[0x80, 0x90]), Err("unexpected tag 90".into()));

    let root = strict.root();
    strict.set_allow_unspecified(root, true);
    assert_eq!(check(&strict, &[0x90, 0x80, 0x91]), Ok(()));
}

#[test]
fn nested_flags_are_independent() {
    let template = TagTreeTemplate {
        order: TagOrder::Arbitrary,
        allow_unspecified: true,
        children: vec![TagTemplate::new(tag(0x7C), Requirement::Required).with_children(vec![
            TagTemplate::new(tag(0x80), Requirement::Required),
            TagTemplate::new(tag(0x81), Requirement::Required),
        ])],
    };
    let tree = TagRequirementTree::from(template);

    // The root tolerates unknown tags, the template does not
    let data = hex!("90 00 7C 06 8001 00 8101 00");
    assert!(tree.matches(&parse_all(&data).unwrap()).is_match());
    let data = hex!("7C 09 8001 00 9001 00 8101 00");
    assert_eq!(
        tree.matches(&parse_all(&data).unwrap()).diagnostic(),
        "unexpected tag 90"
    );
    // Nor is the order of the root
    let data = hex!("7C 06 8101 00 8001 00");
    assert_eq!(
        tree.matches(&parse_all(&data).unwrap()).diagnostic(),
        "tag 80 out of order"
    );
}

#[test]
fn matching_is_idempotent() {
    let spec = CommandShapeSpec::new("Read Binary")
        .with_ins(0xB0)
        .with_case(IsoCase::Case2)
        .with_chaining(Constraint::Forbidden(true));
    for apdu in [
        &hex!("00 B0 0000 00")[..],
        &hex!("10 B0 0000 00")[..],
        &hex!("00 B0 0000")[..],
        &hex!("00 B1 0000 00")[..],
    ] {
        let command = CommandApdu::try_from(apdu).unwrap();
        let first = spec.matches(&command);
        let second = spec.matches(&command);
        assert_eq!(first.is_match(), second.is_match());
        assert_eq!(first.status(), second.status());
        assert_eq!(first.diagnostic(), second.diagnostic());
    }
}

#[test]
fn structural_statuses() {
    let spec = CommandShapeSpec::new("Verify")
        .with_ins(0x20)
        .with_p1(0x00)
        .with_p2(0x81)
        .with_case(IsoCase::Case3)
        .with_chaining(false)
        .with_channel(0);
    for (apdu, status) in [
        (&hex!("00 20 0081 06 313233343536")[..], StatusWord::SUCCESS),
        (&hex!("10 20 0081 06 313233343536")[..], StatusWord::COMMAND_CHAINING_NOT_SUPPORTED),
        (&hex!("01 20 0081 06 313233343536")[..], StatusWord::LOGICAL_CHANNEL_NOT_SUPPORTED),
        (&hex!("00 22 0081 06 313233343536")[..], StatusWord::INSTRUCTION_NOT_SUPPORTED),
        (&hex!("00 20 0181 06 313233343536")[..], StatusWord::INCORRECT_P1_P2),
        (&hex!("00 20 0082 06 313233343536")[..], StatusWord::INCORRECT_P1_P2),
        (&hex!("00 20 0081")[..], StatusWord::WRONG_LENGTH),
        (&hex!("00 20 0081 06 313233343536 00")[..], StatusWord::WRONG_LENGTH),
    ] {
        let command = CommandApdu::try_from(apdu).unwrap();
        assert_eq!(spec.matches(&command).status(), status, "{}", hex::encode(apdu));
    }
}

#[test]
fn checks_run_in_order() {
    let spec = CommandShapeSpec::new("Update Binary")
        .with_format(ApduFormat::Interindustry)
        .with_chaining(false)
        .with_secure_messaging(Constraint::Forbidden(SecureMessaging::Authenticated))
        .with_channel(0)
        .with_ins(0xD6)
        .with_p1(0x00)
        .with_p2(0x00)
        .with_case(IsoCase::Case3)
        .with_extended_length(false)
        .with_tags(tree(TagOrder::Strict, &[(0x53, Requirement::Required)]));

    // Every command fixes the first mismatch of the previous one
    for (apdu, status) in [
        (&hex!("9D D7 0101 00 0003 540100 0100")[..], StatusWord::CLASS_NOT_SUPPORTED),
        (&hex!("1D D7 0101 00 0003 540100 0100")[..], StatusWord::COMMAND_CHAINING_NOT_SUPPORTED),
        (&hex!("0D D7 0101 00 0003 540100 0100")[..], StatusWord::SECURE_MESSAGING_NOT_SUPPORTED),
        (&hex!("01 D7 0101 00 0003 540100 0100")[..], StatusWord::LOGICAL_CHANNEL_NOT_SUPPORTED),
        (&hex!("00 D7 0101 00 0003 540100 0100")[..], StatusWord::INSTRUCTION_NOT_SUPPORTED),
        (&hex!("00 D6 0101 00 0003 540100 0100")[..], StatusWord::INCORRECT_P1_P2),
        (&hex!("00 D6 0001 00 0003 540100 0100")[..], StatusWord::INCORRECT_P1_P2),
        (&hex!("00 D6 0000 00 0003 540100 0100")[..], StatusWord::WRONG_LENGTH),
        (&hex!("00 D6 0000 00 0003 540100")[..], StatusWord::WRONG_LENGTH),
        (&hex!("00 D6 0000 03 540100")[..], StatusWord::WRONG_DATA),
        (&hex!("00 D6 0000 03 530500")[..], StatusWord::MALFORMED_DATA),
        (&hex!("00 D6 0000 03 530100")[..], StatusWord::SUCCESS),
    ] {
        let command = CommandApdu::try_from(apdu).unwrap();
        assert_eq!(spec.matches(&command).status(), status, "{}", hex::encode(apdu));
    }
}

#[test]
fn secure_messaging_of_predecessor() {
    let spec = CommandShapeSpec::new("Protected")
        .with_ins(0xB0)
        .with_secure_messaging(SecureMessaging::Authenticated);
    let protected = CommandApdu::new(hex!("0C B0 0000"), Vec::new(), Some(0x100)).unwrap();
    let unprotected = CommandApdu::new(hex!("00 B0 0000"), Vec::new(), Some(0x100)).unwrap();
    assert_eq!(
        spec.matches(&unprotected).status(),
        StatusWord::SECURE_MESSAGING_NOT_SUPPORTED
    );
    let derived = unprotected.with_predecessor(Rc::new(protected));
    assert!(spec.matches(&derived).is_match());
}
