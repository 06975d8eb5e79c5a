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

use arbitrary::Arbitrary;
use dispersy::core::bloom::BloomFilter;
use libfuzzer_sys::fuzz_target;

#[derive(Clone, Debug, Arbitrary)]
struct Input {
    size_bytes: u8,
    functions: u8,
    items: Vec<Vec<u8>>,
}

fuzz_target!(|inp: Input| {
    let mut filter = BloomFilter::new(inp.size_bytes as usize, inp.functions);
    for item in &inp.items {
        filter.add(item);
    }
    // No false negatives, ever.
    for item in &inp.items {
        assert!(filter.contains(item));
    }
});
