// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed
// licenses.

//! The SPEKE engine.
//!
//! Holds the group parameters and per-session secrets, and implements the
//! password-authenticated exchange: the generator is derived by squaring the
//! password hash into the order-`q` subgroup, the Diffie-Hellman result is
//! folded through HKDF into transport keys, and key confirmation is an HMAC
//! under the derived encryption key rather than the raw exchange output, so
//! a successful confirmation proves the peer holds the same transport key.

use crate::errors::SpekeError;
use crate::group::{self, SafePrimeGroup};
use crate::kdf;
use crate::{CipherSuite, Result};
use core::marker::PhantomData;
use num_bigint::BigUint;
use num_traits::{One, Zero};
use once_cell::sync::Lazy;
use rand::{CryptoRng, RngCore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use zeroize::Zeroizing;

static GLOBAL_COUNTER: Lazy<IdCounter> = Lazy::new(IdCounter::new);

/// Process-wide monotone counters keyed by id.
///
/// Every engine construction takes the current value for its own id and
/// advances it, so concurrently constructed engines with the same id receive
/// distinct, contiguous suffixes. Accepting a remote key/id pair advances
/// the counter for the remote id, so a dropped session cannot be reanimated
/// under the same framing identity.
#[derive(Clone, Debug, Default)]
pub struct IdCounter {
    counts: Arc<Mutex<HashMap<String, u64>>>,
}

impl IdCounter {
    /// Creates an empty counter map.
    pub fn new() -> Self {
        Self {
            counts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The library-provided process-wide counter used by [`Speke::new`].
    pub fn global() -> IdCounter {
        GLOBAL_COUNTER.clone()
    }

    /// Returns the current value for `id` and advances it, atomically.
    pub fn next(&self, id: &str) -> u64 {
        let mut counts = self
            .counts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let slot = counts.entry(id.to_owned()).or_insert(0);
        let current = *slot;
        *slot += 1;
        current
    }
}

/// The remote key/id pair, accepted exactly once per session.
struct RemoteParty {
    id_numbered: String,
    public_key: BigUint,
}

/// Key material derived from the exchange, cached after first use and wiped
/// on drop.
struct DerivedSecrets {
    encryption_key: Zeroizing<Vec<u8>>,
    nonce: Zeroizing<Vec<u8>>,
    key_confirmation_data: Zeroizing<Vec<u8>>,
}

/// A SPEKE exchange bound to one `(id, password, group)` triple.
///
/// Construct one engine per session attempt. Send [`Speke::public_key`] and
/// [`Speke::id`] to the peer, feed the peer's pair into
/// [`Speke::provide_remote`], and confirm the exchange with
/// [`Speke::key_confirmation_data`] / [`Speke::confirm_key`]. Once the
/// remote pair is accepted, [`Speke::encryption_key`] and [`Speke::nonce`]
/// hold the same bytes on both sides if and only if the passwords matched.
pub struct Speke<CS: CipherSuite = crate::DefaultCipherSuite> {
    group: SafePrimeGroup,
    private_key: BigUint,
    public_key: BigUint,
    id_numbered: String,
    counter: IdCounter,
    remote: Option<RemoteParty>,
    derived: Option<DerivedSecrets>,
    suite: PhantomData<fn() -> CS>,
}

impl<CS: CipherSuite> Speke<CS> {
    /// Creates an engine using the process-wide id counter.
    ///
    /// The generator is `SHA-256(password)^2 mod p`; squaring lifts the hash
    /// into the order-`q` subgroup regardless of what the hash lands on.
    ///
    /// # Errors
    ///
    /// Returns [`SpekeError::InvalidParameter`] when `id` is empty or the
    /// password hashes to a degenerate generator (`0`, `1`, or `p - 1`).
    pub fn new<R: RngCore + CryptoRng>(
        id: &str,
        password: &str,
        group: SafePrimeGroup,
        rng: &mut R,
    ) -> Result<Self> {
        Self::with_counter(id, password, group, IdCounter::global(), rng)
    }

    /// Creates an engine with an explicit counter service instead of the
    /// process-wide one.
    ///
    /// # Errors
    ///
    /// Same as [`Speke::new`].
    pub fn with_counter<R: RngCore + CryptoRng>(
        id: &str,
        password: &str,
        group: SafePrimeGroup,
        counter: IdCounter,
        rng: &mut R,
    ) -> Result<Self> {
        if id.is_empty() {
            return Err(SpekeError::InvalidParameter("id must not be empty"));
        }

        let digest = Zeroizing::new(kdf::sha256(&[password.as_bytes()]));
        let hashed = BigUint::from_bytes_be(digest.as_slice());
        let generator = group.pow(&hashed, &BigUint::from(2u32));
        let p_minus_one = group.prime() - 1u32;
        if generator.is_zero() || generator.is_one() || generator == p_minus_one {
            return Err(SpekeError::InvalidParameter(
                "password hashes to a degenerate generator",
            ));
        }

        let private_key = group.random_exponent(rng);
        let public_key = group.pow_secret(&generator, &private_key);

        let suffix = counter.next(id);
        let id_numbered = format!("{}:{}", id, suffix);

        Ok(Self {
            group,
            private_key,
            public_key,
            id_numbered,
            counter,
            remote: None,
            derived: None,
            suite: PhantomData,
        })
    }

    /// The public key `g^x mod p` as minimal big-endian bytes.
    pub fn public_key(&self) -> Vec<u8> {
        group::encode(&self.public_key)
    }

    /// The numbered id for this session attempt, `"{id}:{counter}"`.
    pub fn id(&self) -> &str {
        &self.id_numbered
    }

    /// Accepts the peer's public key and numbered id. Callable exactly once.
    ///
    /// The key must decode to a value in `[2, p - 2]`, differ from our own
    /// public key, and lie in the order-`q` subgroup (`Y^q mod p == 1`);
    /// anything else is a small-subgroup or reflection attempt. The counter
    /// for the remote id is advanced on acceptance.
    ///
    /// # Errors
    ///
    /// Returns [`SpekeError::AlreadyProvided`] on a second call (state is
    /// left untouched), [`SpekeError::InvalidPeerKey`] for a key failing
    /// validation, and [`SpekeError::InvalidPeerId`] for an empty remote id
    /// or one equal to our own.
    pub fn provide_remote(&mut self, remote_public_key: &[u8], remote_id: &str) -> Result<()> {
        if self.remote.is_some() {
            return Err(SpekeError::AlreadyProvided);
        }

        let value = self
            .group
            .decode_element(remote_public_key)
            .map_err(|_| SpekeError::InvalidPeerKey)?;
        let two = BigUint::from(2u32);
        let p_minus_two = self.group.prime() - &two;
        if value < two || value > p_minus_two {
            return Err(SpekeError::InvalidPeerKey);
        }
        if value == self.public_key {
            return Err(SpekeError::InvalidPeerKey);
        }
        if !self.group.pow(&value, self.group.subgroup_order()).is_one() {
            return Err(SpekeError::InvalidPeerKey);
        }
        if remote_id.is_empty() || remote_id == self.id_numbered {
            return Err(SpekeError::InvalidPeerId);
        }

        self.counter.next(remote_id);
        self.remote = Some(RemoteParty {
            id_numbered: remote_id.to_owned(),
            public_key: value,
        });
        Ok(())
    }

    /// The symmetric key derived from the exchange via HKDF.
    ///
    /// # Errors
    ///
    /// Returns [`SpekeError::NotInitialized`] before
    /// [`Speke::provide_remote`].
    pub fn encryption_key(&mut self) -> Result<&[u8]> {
        Ok(self.derive()?.encryption_key.as_slice())
    }

    /// The nonce (initialization vector) derived alongside the key.
    ///
    /// # Errors
    ///
    /// Returns [`SpekeError::NotInitialized`] before
    /// [`Speke::provide_remote`].
    pub fn nonce(&mut self) -> Result<&[u8]> {
        Ok(self.derive()?.nonce.as_slice())
    }

    /// Data the peer can use to confirm both sides derived the same key.
    ///
    /// Unlike standard SPEKE this is keyed by the HKDF output, not the raw
    /// exchange result, so confirmation also proves agreement on the
    /// transport key.
    ///
    /// # Errors
    ///
    /// Returns [`SpekeError::NotInitialized`] before
    /// [`Speke::provide_remote`].
    pub fn key_confirmation_data(&mut self) -> Result<Vec<u8>> {
        Ok(self.derive()?.key_confirmation_data.to_vec())
    }

    /// Checks the peer's key confirmation data in constant time.
    ///
    /// The peer computed its tag with its own id and key first, so the
    /// expected value swaps the transcript order relative to ours.
    ///
    /// # Errors
    ///
    /// Returns [`SpekeError::NotInitialized`] before
    /// [`Speke::provide_remote`].
    pub fn confirm_key(&mut self, remote_kcd: &[u8]) -> Result<bool> {
        self.derive()?;
        let remote = self.remote.as_ref().ok_or(SpekeError::NotInitialized)?;
        let derived = self.derived.as_ref().ok_or(SpekeError::NotInitialized)?;
        let transcript = kdf::sha256(&[
            remote.id_numbered.as_bytes(),
            self.id_numbered.as_bytes(),
            &group::encode(&remote.public_key),
            &group::encode(&self.public_key),
        ]);
        kdf::hmac_verify(&derived.encryption_key, &transcript, remote_kcd)
    }

    /// Signs a message with HMAC-SHA-256 under the derived key.
    ///
    /// # Errors
    ///
    /// Returns [`SpekeError::NotInitialized`] before
    /// [`Speke::provide_remote`].
    pub fn hmac_sign(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        let derived = self.derive()?;
        kdf::hmac_sign(&derived.encryption_key, message)
    }

    /// Verifies a signature produced by the peer's [`Speke::hmac_sign`], in
    /// constant time.
    ///
    /// # Errors
    ///
    /// Returns [`SpekeError::NotInitialized`] before
    /// [`Speke::provide_remote`].
    pub fn confirm_hmac_signature(&mut self, signature: &[u8], message: &[u8]) -> Result<bool> {
        let derived = self.derive()?;
        kdf::hmac_verify(&derived.encryption_key, message, signature)
    }

    /// Derives and caches the keying material on first use.
    fn derive(&mut self) -> Result<&DerivedSecrets> {
        if self.derived.is_none() {
            let secrets = {
                let remote = self.remote.as_ref().ok_or(SpekeError::NotInitialized)?;

                let shared = self.group.pow_secret(&remote.public_key, &self.private_key);
                let shared_bytes = Zeroizing::new(group::encode(&shared));
                let local_pk = group::encode(&self.public_key);
                let remote_pk = group::encode(&remote.public_key);

                let (min_id, max_id) = if self.id_numbered <= remote.id_numbered {
                    (self.id_numbered.as_str(), remote.id_numbered.as_str())
                } else {
                    (remote.id_numbered.as_str(), self.id_numbered.as_str())
                };
                let (min_pk, max_pk) = if self.public_key <= remote.public_key {
                    (local_pk.as_slice(), remote_pk.as_slice())
                } else {
                    (remote_pk.as_slice(), local_pk.as_slice())
                };

                let keying_material = Zeroizing::new(kdf::sha256(&[
                    min_id.as_bytes(),
                    max_id.as_bytes(),
                    min_pk,
                    max_pk,
                    &shared_bytes,
                ]));

                let mut salt = Vec::with_capacity(min_pk.len() + max_pk.len());
                salt.extend_from_slice(min_pk);
                salt.extend_from_slice(max_pk);
                let okm = kdf::hkdf(
                    &salt,
                    keying_material.as_slice(),
                    b"",
                    CS::KEY_LENGTH + CS::NONCE_LENGTH,
                )?;
                let encryption_key = Zeroizing::new(okm[..CS::KEY_LENGTH].to_vec());
                let nonce = Zeroizing::new(okm[CS::KEY_LENGTH..].to_vec());

                let transcript = kdf::sha256(&[
                    self.id_numbered.as_bytes(),
                    remote.id_numbered.as_bytes(),
                    &local_pk,
                    &remote_pk,
                ]);
                let key_confirmation_data =
                    Zeroizing::new(kdf::hmac_sign(&encryption_key, &transcript)?);

                DerivedSecrets {
                    encryption_key,
                    nonce,
                    key_confirmation_data,
                }
            };
            self.derived = Some(secrets);
        }
        self.derived.as_ref().ok_or(SpekeError::NotInitialized)
    }
}

impl<CS: CipherSuite> Drop for Speke<CS> {
    fn drop(&mut self) {
        // BigUint has no Zeroize impl; the byte-level secrets wipe
        // themselves, the exponent can only be released.
        self.private_key = BigUint::zero();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DefaultCipherSuite;
    use rand::rngs::OsRng;

    const TEST_PRIME: &str = "9354936252513209999";

    fn test_group() -> SafePrimeGroup {
        SafePrimeGroup::from_decimal(TEST_PRIME).expect("test modulus is a safe prime")
    }

    fn engine(id: &str, password: &str, counter: &IdCounter) -> Speke<DefaultCipherSuite> {
        Speke::with_counter(id, password, test_group(), counter.clone(), &mut OsRng)
            .expect("engine construction")
    }

    #[test]
    fn test_id_numbered_is_contiguous_per_id() {
        let counter = IdCounter::new();
        let a = engine("alice", "hunter2", &counter);
        let b = engine("alice", "hunter2", &counter);
        let c = engine("bob", "hunter2", &counter);
        assert_eq!(a.id(), "alice:0");
        assert_eq!(b.id(), "alice:1");
        assert_eq!(c.id(), "bob:0");
    }

    #[test]
    fn test_counter_is_monotone_under_concurrent_construction() {
        let counter = IdCounter::new();
        let group = test_group();

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let counter = counter.clone();
                let group = group.clone();
                std::thread::spawn(move || {
                    let engine = Speke::<DefaultCipherSuite>::with_counter(
                        "alice", "hunter2", group, counter, &mut OsRng,
                    )
                    .expect("engine construction");
                    engine
                        .id()
                        .rsplit(':')
                        .next()
                        .expect("suffix")
                        .parse::<u64>()
                        .expect("numeric suffix")
                })
            })
            .collect();

        let mut suffixes: Vec<u64> = handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .collect();
        suffixes.sort_unstable();
        assert_eq!(suffixes, (0..100).collect::<Vec<u64>>());
    }

    #[test]
    fn test_empty_id_rejected() {
        let result = Speke::<DefaultCipherSuite>::with_counter(
            "",
            "hunter2",
            test_group(),
            IdCounter::new(),
            &mut OsRng,
        );
        assert!(matches!(result, Err(SpekeError::InvalidParameter(_))));
    }

    #[test]
    fn test_remote_key_boundaries_rejected() {
        let counter = IdCounter::new();
        let mut local = engine("alice", "hunter2", &counter);

        // 1 and p - 1 are outside [2, p - 2]
        let p_minus_one = test_group().prime() - 1u32;
        for value in [BigUint::from(1u32), p_minus_one] {
            let mut fresh = engine("alice", "hunter2", &counter);
            assert!(matches!(
                fresh.provide_remote(&group::encode(&value), "bob:0"),
                Err(SpekeError::InvalidPeerKey)
            ));
        }

        // 7 is a quadratic non-residue for this modulus, so it is outside
        // the order-q subgroup
        assert!(matches!(
            local.provide_remote(&group::encode(&BigUint::from(7u32)), "bob:0"),
            Err(SpekeError::InvalidPeerKey)
        ));

        // reflected public key
        let own = local.public_key();
        assert!(matches!(
            local.provide_remote(&own, "bob:0"),
            Err(SpekeError::InvalidPeerKey)
        ));

        // malformed encodings
        assert!(matches!(
            local.provide_remote(&[], "bob:0"),
            Err(SpekeError::InvalidPeerKey)
        ));
        assert!(matches!(
            local.provide_remote(&[0, 5], "bob:0"),
            Err(SpekeError::InvalidPeerKey)
        ));

        // key material must still be unavailable after every rejection
        assert!(matches!(
            local.encryption_key(),
            Err(SpekeError::NotInitialized)
        ));
    }

    #[test]
    fn test_self_peering_rejected() {
        let counter = IdCounter::new();
        let mut a = engine("alice", "hunter2", &counter);
        let b = engine("bob", "hunter2", &counter);
        let own_id = a.id().to_owned();
        assert!(matches!(
            a.provide_remote(&b.public_key(), &own_id),
            Err(SpekeError::InvalidPeerId)
        ));
        assert!(matches!(
            a.provide_remote(&b.public_key(), ""),
            Err(SpekeError::InvalidPeerId)
        ));
    }

    #[test]
    fn test_provide_remote_is_exactly_once() {
        let counter = IdCounter::new();
        let mut a = engine("alice", "hunter2", &counter);
        let mut b = engine("bob", "hunter2", &counter);
        let c = engine("carol", "hunter2", &counter);

        let (b_pk, b_id) = (b.public_key(), b.id().to_owned());
        a.provide_remote(&b_pk, &b_id).expect("first provide");
        let key_before = a.encryption_key().expect("key").to_vec();

        let (c_pk, c_id) = (c.public_key(), c.id().to_owned());
        assert!(matches!(
            a.provide_remote(&c_pk, &c_id),
            Err(SpekeError::AlreadyProvided)
        ));

        // the rejected call must not have disturbed the established state
        assert_eq!(a.encryption_key().expect("key"), key_before.as_slice());
        let (a_pk, a_id) = (a.public_key(), a.id().to_owned());
        b.provide_remote(&a_pk, &a_id).expect("provide");
        assert!(a
            .confirm_key(&b.key_confirmation_data().expect("kcd"))
            .expect("confirm"));
    }

    #[test]
    fn test_key_material_unavailable_before_remote() {
        let counter = IdCounter::new();
        let mut a = engine("alice", "hunter2", &counter);
        assert!(matches!(
            a.encryption_key(),
            Err(SpekeError::NotInitialized)
        ));
        assert!(matches!(a.nonce(), Err(SpekeError::NotInitialized)));
        assert!(matches!(
            a.key_confirmation_data(),
            Err(SpekeError::NotInitialized)
        ));
        assert!(matches!(
            a.hmac_sign(b"message"),
            Err(SpekeError::NotInitialized)
        ));
        assert!(matches!(
            a.confirm_key(b"data"),
            Err(SpekeError::NotInitialized)
        ));
    }
}
