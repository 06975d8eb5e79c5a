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

//! Member directory: maps 20-byte mids to public keys and database ids.
//!
//! Shared across communities; read-mostly cached. A mid may resolve to more
//! than one key (SHA-1 collisions are tolerated); the decoder disambiguates
//! by signature verification.

use crate::core::identity::mid_of;
use crate::core::message::MemberRef;
use crate::core::types::{MemberId, PublicKey};
use crate::store::db::{Database, StoreError};
use crate::store::messages;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Shared member directory.
pub struct MemberDirectory {
    db: Arc<Database>,
    cache: RwLock<HashMap<MemberId, Vec<MemberRef>>>,
}

impl MemberDirectory {
    /// Create a directory over the given store.
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Register a public key, returning its member record.
    pub fn learn(&self, public_key: &PublicKey) -> Result<MemberRef, StoreError> {
        let mid = mid_of(public_key);
        if let Ok(cache) = self.cache.read() {
            if let Some(members) = cache.get(&mid) {
                if let Some(m) = members.iter().find(|m| &m.public_key == public_key) {
                    return Ok(m.clone());
                }
            }
        }

        let database_id = self.db.with_conn(|c| {
            messages::member_get_or_insert(c, mid.as_bytes(), &public_key.0)
        })?;
        let member = MemberRef {
            database_id,
            mid,
            public_key: public_key.clone(),
        };
        self.invalidate(mid);
        Ok(member)
    }

    /// Every member known for a mid, insertion order. Empty when unknown.
    pub fn resolve(&self, mid: MemberId) -> Result<Vec<MemberRef>, StoreError> {
        if let Ok(cache) = self.cache.read() {
            if let Some(members) = cache.get(&mid) {
                return Ok(members.clone());
            }
        }

        let rows = self
            .db
            .with_conn(|c| messages::member_all_by_mid(c, mid.as_bytes()))?;
        let members: Vec<MemberRef> = rows
            .into_iter()
            .map(|(database_id, key)| MemberRef {
                database_id,
                mid,
                public_key: PublicKey(key),
            })
            .collect();
        if !members.is_empty() {
            if let Ok(mut cache) = self.cache.write() {
                cache.insert(mid, members.clone());
            }
        }
        Ok(members)
    }

    /// Drop the cached entry for a mid (key rotation, new binding).
    pub fn invalidate(&self, mid: MemberId) {
        if let Ok(mut cache) = self.cache.write() {
            cache.remove(&mid);
        }
    }
}
