// Copyright (c) 2026 Dispersy
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![no_main]
#![forbid(unsafe_code)]

use dispersy::core::message::{PacketBody, WirePacket};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Wire parsing must never panic on arbitrary bytes; signature and policy
    // checks are covered by the integration suite.
    if let Ok(wire) = WirePacket::decode(data) {
        let _ = PacketBody::decode(&wire.body);
    }
});
