// Copyright (C) 2022 Nitrokey GmbH
// SPDX-License-Identifier: CC0-1.0

use arbitrary::Arbitrary;
use hex_literal::hex;

use std::fs::File;
use std::io::Write;

use cardengine_fuzz::{Input, CAN, PIN};

#[derive(Arbitrary, Debug, Clone, Copy)]
enum Password {
    Can,
    Pin,
}

/// Commands of a PACE run, to help the fuzzer find the valid sequences
#[derive(Arbitrary, Debug, Clone)]
enum Command {
    SetAt(Password),
    SetAtWithChat(Password),
    EncryptedNonce,
    MapNonce(Vec<u8>),
    KeyAgreement(Vec<u8>),
    MutualAuthenticate(Password),
    WrongToken,
    Select,
}

fn general_authenticate(cla: u8, inner: u8, mut data: Vec<u8>) -> Vec<u8> {
    data.truncate(120);
    let mut res = vec![cla, 0x86, 0x00, 0x00, data.len() as u8 + 4, 0x7C, data.len() as u8 + 2];
    res.extend_from_slice(&[inner, data.len() as u8]);
    res.extend_from_slice(&data);
    res.push(0);
    res
}

impl Password {
    fn reference(self) -> u8 {
        match self {
            Self::Can => 0x02,
            Self::Pin => 0x03,
        }
    }

    fn value(self) -> &'static [u8] {
        match self {
            Self::Can => CAN,
            Self::Pin => PIN,
        }
    }
}

impl Command {
    fn as_bytes(&self) -> Vec<u8> {
        match self.clone() {
            Self::SetAt(password) => {
                let mut res =
                    Vec::from(hex!("0022C1A4 0F 800A04007F00070202040202 8301").as_slice());
                res.push(password.reference());
                res
            }
            Self::SetAtWithChat(password) => {
                let mut res =
                    Vec::from(hex!("0022C1A4 20 800A04007F00070202040202 8301").as_slice());
                res.push(password.reference());
                res.extend_from_slice(&hex!("7F4C0E 060904007F0007030102 02 530110"));
                res
            }
            Self::EncryptedNonce => Vec::from(hex!("10860000 02 7C00 00").as_slice()),
            Self::MapNonce(data) => general_authenticate(0x10, 0x81, data),
            Self::KeyAgreement(data) => general_authenticate(0x10, 0x83, data),
            Self::MutualAuthenticate(password) => {
                general_authenticate(0x00, 0x85, password.value().to_vec())
            }
            Self::WrongToken => general_authenticate(0x00, 0x85, b"000000".to_vec()),
            Self::Select => Vec::from(hex!("00A4040C 02 3F00").as_slice()),
        }
    }
}

fn as_corpus(commands: &[Command], pin_counter: u8) -> Vec<u8> {
    let mut res = Vec::new();
    for cmd in commands {
        res.push(1);
        for b in cmd.as_bytes() {
            res.push(1);
            res.push(b);
        }
        res.push(0);
    }
    res.push(0);

    res.push(pin_counter);
    // All mappings
    res.push(0xFF);

    let mut unstructured = arbitrary::Unstructured::new(&res);
    let parsed = Input::arbitrary(&mut unstructured).unwrap();
    assert_eq!(commands.len(), parsed.commands.len());
    for (idx, cmd) in commands.iter().enumerate() {
        assert_eq!(cmd.as_bytes(), parsed.commands[idx])
    }
    res
}

fn write_corpus(commands: &[Command], pin_counter: u8, file: &str) {
    let mut f = File::create(format!("corpus/{file}")).unwrap();
    f.write_all(&as_corpus(commands, pin_counter)).unwrap();
    f.flush().unwrap();
    println!("Wrote {file}");
}

fn pace(password: Password) -> Vec<Command> {
    vec![
        Command::SetAt(password),
        Command::EncryptedNonce,
        Command::MapNonce(vec![0x04; 65]),
        Command::KeyAgreement(vec![0x04; 65]),
        Command::MutualAuthenticate(password),
    ]
}

fn main() {
    write_corpus(&pace(Password::Can), 3, "pace-can");
    write_corpus(&pace(Password::Pin), 3, "pace-pin");
    write_corpus(
        &[pace(Password::Can), pace(Password::Pin)].concat(),
        1,
        "pace-resume-pin",
    );
    write_corpus(
        &[
            Command::SetAt(Password::Pin),
            Command::EncryptedNonce,
            Command::MapNonce(vec![0x04; 65]),
            Command::KeyAgreement(vec![0x04; 65]),
            Command::WrongToken,
        ],
        3,
        "pace-wrong-pin",
    );
    write_corpus(
        &[
            Command::SetAtWithChat(Password::Can),
            Command::Select,
            Command::EncryptedNonce,
        ],
        3,
        "pace-chat",
    );
}
