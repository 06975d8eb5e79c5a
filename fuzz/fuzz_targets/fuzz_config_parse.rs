// Copyright (c) 2026 Dispersy
// Licensed under the Apache-2.0 License.

#![no_main]
#![forbid(unsafe_code)]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Best-effort: ensure config parsing does not panic.
    if let Ok(s) = std::str::from_utf8(data) {
        let _ = dispersy::config::NodeConfig::parse(s);
    }
});
