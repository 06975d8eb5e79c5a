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

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Line-oriented peer address cache.
//!
//! Best-effort bootstrap hint only; a missing or stale file never affects
//! correctness.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;

/// File name inside the working directory.
pub const PEERCACHE_FILENAME: &str = "peercache.txt";

/// Read cached peer addresses; unparseable lines are skipped.
pub fn load(dir: &Path) -> Vec<SocketAddr> {
    let Ok(raw) = fs::read_to_string(dir.join(PEERCACHE_FILENAME)) else {
        return Vec::new();
    };
    raw.lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect()
}

/// Write peer addresses, one per line (best-effort).
pub fn store(dir: &Path, peers: &[SocketAddr]) {
    let mut out = String::new();
    for peer in peers {
        out.push_str(&peer.to_string());
        out.push('\n');
    }
    let _ = fs::write(dir.join(PEERCACHE_FILENAME), out);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_and_skips_garbage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let peers: Vec<SocketAddr> = vec![
            "1.2.3.4:6421".parse().expect("addr"),
            "5.6.7.8:6422".parse().expect("addr"),
        ];
        store(dir.path(), &peers);

        let mut raw = fs::read_to_string(dir.path().join(PEERCACHE_FILENAME)).expect("read");
        raw.push_str("not an address\n");
        fs::write(dir.path().join(PEERCACHE_FILENAME), raw).expect("write");

        assert_eq!(load(dir.path()), peers);
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(load(dir.path()).is_empty());
    }
}
