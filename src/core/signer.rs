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

//! Pending state of the double-member signing handshake (initiator side).
//!
//! A request expires silently after its timeout; retries are the caller's
//! responsibility.

use std::collections::HashMap;
use tokio::time::Instant;

/// One outstanding signature request.
#[derive(Clone, Debug)]
pub struct PendingSignature {
    /// Expiry.
    pub deadline: Instant,
    /// Canonical body bytes of the submessage sent for countersigning.
    /// Responses must echo these exactly.
    pub body: Vec<u8>,
}

/// Outstanding signature requests keyed by their 32-bit identifier.
#[derive(Default)]
pub struct SignatureCoordinator {
    pending: HashMap<u32, PendingSignature>,
}

impl SignatureCoordinator {
    /// Create an empty coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a request. Returns false when the identifier is already in use.
    pub fn register(&mut self, identifier: u32, pending: PendingSignature) -> bool {
        if self.pending.contains_key(&identifier) {
            return false;
        }
        self.pending.insert(identifier, pending);
        true
    }

    /// Claim the pending entry a response answers, if still alive.
    pub fn take(&mut self, identifier: u32) -> Option<PendingSignature> {
        self.pending.remove(&identifier)
    }

    /// Drop expired requests; returns how many timed out.
    pub fn expire(&mut self, now: Instant) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, p| p.deadline > now);
        before - self.pending.len()
    }

    /// Outstanding request count.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn expires_silently() {
        let mut c = SignatureCoordinator::new();
        let deadline = Instant::now() + Duration::from_secs(10);
        assert!(c.register(1, PendingSignature { deadline, body: vec![1] }));
        assert!(!c.register(1, PendingSignature { deadline, body: vec![2] }));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(c.expire(Instant::now()), 1);
        assert!(c.take(1).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn take_claims_once() {
        let mut c = SignatureCoordinator::new();
        let deadline = Instant::now() + Duration::from_secs(10);
        c.register(7, PendingSignature { deadline, body: vec![9] });
        assert!(c.take(7).is_some());
        assert!(c.take(7).is_none());
    }
}
