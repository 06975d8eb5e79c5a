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

//! Local member identity: Ed25519 signing keys and mid derivation.
//!
//! Key files are written atomically with private permissions; in-memory
//! PKCS#8 buffers are zeroized after parsing.

use crate::core::types::{MemberId, PublicKey, Signature};
use ring::{
    digest::{digest, SHA1_FOR_LEGACY_USE_ONLY},
    rand::SystemRandom,
    signature::{Ed25519KeyPair, KeyPair, UnparsedPublicKey, ED25519},
};
use std::fs;
use std::io::Write;
use std::path::Path;
use thiserror::Error;
use zeroize::Zeroize;

/// Identity errors.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("io")]
    Io,
    #[error("invalid key encoding")]
    InvalidKey,
    #[error("crypto")]
    Crypto,
}

/// Derive the 20-byte mid of a public key.
pub fn mid_of(key: &PublicKey) -> MemberId {
    // SHA-1 is the protocol-mandated identifier digest, not a security
    // boundary: collisions are tolerated and resolved by signature checks.
    let d = digest(&SHA1_FOR_LEGACY_USE_ONLY, &key.0);
    let mut out = [0u8; 20];
    out.copy_from_slice(d.as_ref());
    MemberId::from_bytes(out)
}

/// Verify an Ed25519 signature for raw public key bytes.
pub fn verify(key: &PublicKey, msg: &[u8], sig: &Signature) -> bool {
    if sig.0.len() != 64 {
        return false;
    }
    let Some(pk_bytes) = key.as_ed25519_bytes() else {
        return false;
    };
    let pk = UnparsedPublicKey::new(&ED25519, pk_bytes);
    pk.verify(msg, &sig.0).is_ok()
}

fn set_private_perms_best_effort(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
    }
}

/// Atomic write to disk (best-effort fsync, then rename).
fn atomic_write_private(path: &Path, bytes: &[u8]) -> Result<(), IdentityError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|_| IdentityError::Io)?;
    }

    let mut tmp = path.to_path_buf();
    tmp.set_extension("tmp");

    {
        let mut f = fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp)
            .map_err(|_| IdentityError::Io)?;
        f.write_all(bytes).map_err(|_| IdentityError::Io)?;
        let _ = f.sync_all();
    }

    set_private_perms_best_effort(&tmp);
    fs::rename(&tmp, path).map_err(|_| IdentityError::Io)?;
    set_private_perms_best_effort(path);
    Ok(())
}

/// A member keypair this process controls.
pub struct LocalIdentity {
    keypair: Ed25519KeyPair,
    public_key: PublicKey,
    mid: MemberId,
}

impl LocalIdentity {
    fn from_pkcs8(pkcs8: &[u8]) -> Result<Self, IdentityError> {
        let keypair = Ed25519KeyPair::from_pkcs8(pkcs8).map_err(|_| IdentityError::InvalidKey)?;
        let public_key = PublicKey(keypair.public_key().as_ref().to_vec());
        let mid = mid_of(&public_key);
        Ok(Self {
            keypair,
            public_key,
            mid,
        })
    }

    /// Generate a fresh in-memory identity.
    pub fn generate() -> Result<Self, IdentityError> {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).map_err(|_| IdentityError::Crypto)?;
        Self::from_pkcs8(pkcs8.as_ref())
    }

    /// Load an Ed25519 PKCS#8 key file, creating one when absent.
    pub fn load_or_create(path: &Path) -> Result<Self, IdentityError> {
        if path.exists() {
            let mut bytes = fs::read(path).map_err(|_| IdentityError::Io)?;
            let out = Self::from_pkcs8(&bytes);
            bytes.zeroize();
            return out;
        }

        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).map_err(|_| IdentityError::Crypto)?;
        let mut buf = pkcs8.as_ref().to_vec();
        atomic_write_private(path, &buf)?;
        buf.zeroize();
        Self::from_pkcs8(pkcs8.as_ref())
    }

    /// Public key.
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Member id (SHA-1 of the public key).
    pub fn mid(&self) -> MemberId {
        self.mid
    }

    /// Sign message bytes.
    pub fn sign(&self, msg: &[u8]) -> Signature {
        Signature(self.keypair.sign(msg).as_ref().to_vec())
    }
}

impl std::fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("mid", &self.mid)
            .finish()
    }
}
