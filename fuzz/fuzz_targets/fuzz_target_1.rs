// Copyright (C) 2022 Nitrokey GmbH
// SPDX-License-Identifier: CC0-1.0

#![no_main]
use cardengine_fuzz::Input;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|input: Input| {
    #[cfg(feature = "log")]
    env_logger::builder().is_test(true).try_init().ok();

    let mut card = input.card();
    for data in &input.commands {
        card.handle(data);
    }
});
