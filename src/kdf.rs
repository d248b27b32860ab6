// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed
// licenses.

//! Hash, HKDF, and HMAC primitives. All of these are pure functions over
//! SHA-256; none hold state between calls.

use crate::Result;
use hkdf::hmac::{Hmac, Mac};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// SHA-256 over the concatenation of `parts`.
pub(crate) fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// HKDF-SHA-256 extract-and-expand per RFC 5869.
pub(crate) fn hkdf(
    salt: &[u8],
    ikm: &[u8],
    info: &[u8],
    length: usize,
) -> Result<Zeroizing<Vec<u8>>> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = Zeroizing::new(vec![0u8; length]);
    hk.expand(info, &mut okm)
        .map_err(|_| crate::SpekeError::InvalidParameter("requested key material too long"))?;
    Ok(okm)
}

/// HMAC-SHA-256 of `message` under `key`.
pub(crate) fn hmac_sign(key: &[u8], message: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Constant-time verification of an HMAC-SHA-256 tag.
pub(crate) fn hmac_verify(key: &[u8], message: &[u8], signature: &[u8]) -> Result<bool> {
    let mut mac = HmacSha256::new_from_slice(key)?;
    mac.update(message);
    Ok(mac.verify_slice(signature).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hmac_sign_and_verify() {
        let key = b"0123456789abcdef0123456789abcdef";
        let message = b"authenticated payload";
        let tag = hmac_sign(key, message).expect("sign");
        assert_eq!(tag.len(), 32);
        assert!(hmac_verify(key, message, &tag).expect("verify"));
    }

    #[test]
    fn test_hmac_rejects_any_flipped_byte() {
        let key = b"0123456789abcdef0123456789abcdef";
        let message = b"ping".to_vec();
        let tag = hmac_sign(key, &message).expect("sign");

        for i in 0..message.len() {
            let mut tampered = message.clone();
            tampered[i] ^= 0x01;
            assert!(!hmac_verify(key, &tampered, &tag).expect("verify"));
        }
        for i in 0..tag.len() {
            let mut tampered = tag.clone();
            tampered[i] ^= 0x01;
            assert!(!hmac_verify(key, &message, &tampered).expect("verify"));
        }
    }

    #[test]
    fn test_hkdf_is_deterministic_and_length_exact() {
        let a = hkdf(b"salt", b"ikm", b"", 44).expect("expand");
        let b = hkdf(b"salt", b"ikm", b"", 44).expect("expand");
        assert_eq!(a.len(), 44);
        assert_eq!(*a, *b);
        let c = hkdf(b"other salt", b"ikm", b"", 44).expect("expand");
        assert_ne!(*a, *c);
    }

    #[test]
    fn test_sha256_concatenation() {
        // hashing parts must equal hashing the joined bytes
        let joined = sha256(&[b"hello world"]);
        let split = sha256(&[b"hello ", b"world"]);
        assert_eq!(joined, split);
    }
}
