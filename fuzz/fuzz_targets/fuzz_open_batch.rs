// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fuzz target for batch container parsing.
//!
//! This tests that `BatchCodec::open_batch` never panics on arbitrary input,
//! including inputs that carry the salted magic and hostile KDF parameters.

#![no_main]

use changelog_replication::codec::{BatchCodec, ContainerFormat, KdfParams};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let codec = BatchCodec::new(ContainerFormat::Salted, KdfParams::for_testing());
    let _ = codec.open_batch(data, "fuzzing");
});
