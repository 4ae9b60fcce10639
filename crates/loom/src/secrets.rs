// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2024 Jonathan Lee
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License version 3
// as published by the Free Software Foundation.
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU Affero General Public License for more details.
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see https://www.gnu.org/licenses/.

//! Environment variable secrets: salted digests at rest, plaintext only
//! inside a run, masking at the read boundary.

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSecret {
    pub salt: String,
    pub digest: String,
}

pub fn hash_secret(value: &str) -> StoredSecret {
    let salt: [u8; 16] = rand::thread_rng().gen();
    let salt = hex::encode(salt);
    let digest = digest_with_salt(value, &salt);
    StoredSecret { salt, digest }
}

pub fn verify_secret(value: &str, stored: &StoredSecret) -> bool {
    digest_with_salt(value, &stored.salt) == stored.digest
}

fn digest_with_salt(value: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}

/// Boundary masking for GET responses: keep the last four characters.
pub fn mask_secret(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 4 {
        return "•".repeat(chars.len());
    }
    let visible: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{}", "•".repeat(chars.len() - 4), visible)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_uses_a_fresh_salt_per_variable() {
        let a = hash_secret("value");
        let b = hash_secret("value");
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.digest, b.digest);
        assert!(verify_secret("value", &a));
        assert!(verify_secret("value", &b));
        assert!(!verify_secret("other", &a));
    }

    #[test]
    fn masking_keeps_the_tail() {
        assert_eq!(mask_secret("sk-abcdef"), "•••••cdef");
        assert_eq!(mask_secret("abc"), "•••");
    }
}
