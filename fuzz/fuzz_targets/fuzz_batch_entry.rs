// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fuzz target for decrypted batch entries.
//!
//! Peers send loosely typed JSON. Parsing an entry and normalizing its data
//! must reject bad input without panicking.

#![no_main]

use changelog_replication::{BatchEntry, CodecRegistry};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };
    if let Ok(entry) = BatchEntry::from_value(value) {
        let registry = CodecRegistry::default();
        let _ = registry.normalize(&entry.table_name, entry.data);
    }
});
