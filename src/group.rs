// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed
// licenses.

//! Arithmetic over a safe-prime group.
//!
//! A safe prime is a prime `p` for which `q = (p - 1) / 2` is also prime.
//! The multiplicative group modulo such a `p` contains a unique subgroup of
//! prime order `q`, and every square lies in it. All exponents used as
//! private keys are sampled from `[1, q - 1]`.

use crate::errors::SpekeError;
use crate::Result;
use num_bigint::{BigUint, RandBigInt};
use num_traits::{One, Zero};
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};

/// Miller-Rabin rounds used when validating caller-supplied moduli. The
/// residual error probability is at most 4^-40 < 2^-80.
const PRIMALITY_ROUNDS: u32 = 40;

/// The 2048-bit MODP group from RFC 3526, section 3.
const MODP_2048_HEX: &str = "\
FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
3995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF";

/// A validated safe-prime group shared by both parties.
///
/// Construction checks that the modulus is odd, greater than 3, and that
/// both `p` and `q = (p - 1) / 2` pass a 40-round Miller-Rabin test.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SafePrimeGroup {
    p: BigUint,
    q: BigUint,
}

impl SafePrimeGroup {
    /// Validates `p` as a safe prime and derives the subgroup order.
    ///
    /// # Errors
    ///
    /// Returns [`SpekeError::InvalidParameter`] if `p` is even, too small,
    /// or if `p` or `(p - 1) / 2` fails the primality test.
    pub fn new(p: BigUint) -> Result<Self> {
        if p <= BigUint::from(3u32) {
            return Err(SpekeError::InvalidParameter("modulus must exceed 3"));
        }
        if !p.bit(0) {
            return Err(SpekeError::InvalidParameter("modulus must be odd"));
        }
        if !is_probable_prime(&p, PRIMALITY_ROUNDS) {
            return Err(SpekeError::InvalidParameter("modulus is not prime"));
        }
        let q = (&p - 1u32) >> 1usize;
        if !is_probable_prime(&q, PRIMALITY_ROUNDS) {
            return Err(SpekeError::InvalidParameter(
                "modulus is not a safe prime",
            ));
        }
        Ok(Self { p, q })
    }

    /// Parses a decimal string and validates it as a safe prime.
    ///
    /// # Errors
    ///
    /// Returns [`SpekeError::InvalidEncoding`] on malformed input and the
    /// errors of [`SafePrimeGroup::new`] otherwise.
    pub fn from_decimal(digits: &str) -> Result<Self> {
        let p = BigUint::parse_bytes(digits.as_bytes(), 10)
            .ok_or(SpekeError::InvalidEncoding)?;
        Self::new(p)
    }

    /// Parses a hexadecimal string and validates it as a safe prime.
    ///
    /// # Errors
    ///
    /// Returns [`SpekeError::InvalidEncoding`] on malformed input and the
    /// errors of [`SafePrimeGroup::new`] otherwise.
    pub fn from_hex(digits: &str) -> Result<Self> {
        let p = BigUint::parse_bytes(digits.as_bytes(), 16)
            .ok_or(SpekeError::InvalidEncoding)?;
        Self::new(p)
    }

    /// Decodes a minimal big-endian encoding and validates it as a safe
    /// prime.
    ///
    /// # Errors
    ///
    /// Returns [`SpekeError::InvalidEncoding`] for empty or non-minimal
    /// input and the errors of [`SafePrimeGroup::new`] otherwise.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::new(decode(bytes)?)
    }

    /// The 2048-bit MODP group 14 from RFC 3526.
    ///
    /// The parameters are fixed and known to be a safe prime, so the
    /// primality check is elided.
    pub fn modp_2048() -> Self {
        let p = BigUint::parse_bytes(MODP_2048_HEX.as_bytes(), 16)
            .expect("RFC 3526 constant is valid hex");
        let q = (&p - 1u32) >> 1usize;
        Self { p, q }
    }

    /// The prime modulus `p`.
    pub fn prime(&self) -> &BigUint {
        &self.p
    }

    /// The order `q = (p - 1) / 2` of the prime-order subgroup.
    pub fn subgroup_order(&self) -> &BigUint {
        &self.q
    }

    /// Decodes a group element from minimal big-endian bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SpekeError::InvalidEncoding`] for empty or non-minimal
    /// input and [`SpekeError::OutOfRange`] when the value is not below the
    /// modulus.
    pub fn decode_element(&self, bytes: &[u8]) -> Result<BigUint> {
        if bytes.len() > (self.p.bits() as usize + 7) / 8 {
            return Err(SpekeError::OutOfRange);
        }
        let value = decode(bytes)?;
        if value >= self.p {
            return Err(SpekeError::OutOfRange);
        }
        Ok(value)
    }

    /// Samples a uniform exponent from `[1, q - 1]`.
    ///
    /// `RandBigInt` rejection-samples internally, so the result carries no
    /// modulo bias.
    pub fn random_exponent<R: RngCore + CryptoRng>(&self, rng: &mut R) -> BigUint {
        rng.gen_biguint_range(&BigUint::one(), &self.q)
    }

    /// Computes `base^exponent mod p` for non-secret exponents.
    pub fn pow(&self, base: &BigUint, exponent: &BigUint) -> BigUint {
        base.modpow(exponent, &self.p)
    }

    /// Computes `base^exponent mod p` with a Montgomery-ladder schedule.
    ///
    /// One multiplication and one squaring are performed for every bit of
    /// the full width of `q`, so the operation sequence does not depend on
    /// the exponent's bit pattern. Use this for private-key exponents.
    pub fn pow_secret(&self, base: &BigUint, exponent: &BigUint) -> BigUint {
        ladder_pow(base, exponent, &self.p, self.q.bits())
    }
}

/// Serializes to unsigned big-endian bytes of minimal length.
pub fn encode(value: &BigUint) -> Vec<u8> {
    value.to_bytes_be()
}

/// Deserializes an unsigned big-endian encoding, rejecting empty input and
/// encodings with a redundant leading zero byte.
///
/// # Errors
///
/// Returns [`SpekeError::InvalidEncoding`] when the input is empty or not
/// minimal.
pub fn decode(bytes: &[u8]) -> Result<BigUint> {
    if bytes.is_empty() {
        return Err(SpekeError::InvalidEncoding);
    }
    if bytes.len() > 1 && bytes[0] == 0 {
        return Err(SpekeError::InvalidEncoding);
    }
    Ok(BigUint::from_bytes_be(bytes))
}

/// Montgomery-ladder exponentiation over `schedule_bits` bits.
///
/// Invariant at every step: `r1 = r0 * base`. The two multiplications per
/// iteration are issued regardless of the exponent bit.
fn ladder_pow(
    base: &BigUint,
    exponent: &BigUint,
    modulus: &BigUint,
    schedule_bits: u64,
) -> BigUint {
    let mut r0 = BigUint::one();
    let mut r1 = base % modulus;
    let mut bit = schedule_bits;
    while bit > 0 {
        bit -= 1;
        if exponent.bit(bit) {
            r0 = &r0 * &r1 % modulus;
            r1 = &r1 * &r1 % modulus;
        } else {
            r1 = &r0 * &r1 % modulus;
            r0 = &r0 * &r0 % modulus;
        }
    }
    r0
}

const SMALL_PRIMES: [u32; 12] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37];

/// Miller-Rabin primality test with uniformly random witnesses.
fn is_probable_prime(n: &BigUint, rounds: u32) -> bool {
    if n < &BigUint::from(2u32) {
        return false;
    }
    for small in SMALL_PRIMES {
        let small = BigUint::from(small);
        if n % &small == BigUint::zero() {
            return *n == small;
        }
    }

    // n - 1 = d * 2^r with d odd
    let n_minus_one = n - 1u32;
    let mut d = n_minus_one.clone();
    let mut r = 0u32;
    while !d.bit(0) {
        d >>= 1usize;
        r += 1;
    }

    let two = BigUint::from(2u32);
    let mut rng = OsRng;
    'witness: for _ in 0..rounds {
        let a = rng.gen_biguint_range(&two, &n_minus_one);
        let mut x = a.modpow(&d, n);
        if x == BigUint::one() || x == n_minus_one {
            continue;
        }
        for _ in 1..r {
            x = &x * &x % n;
            if x == n_minus_one {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_safe_primes_accepted() {
        for p in [5u32, 23, 167, 1283, 2039] {
            SafePrimeGroup::new(BigUint::from(p))
                .unwrap_or_else(|_| panic!("{} should be a safe prime", p));
        }
    }

    #[test]
    fn test_non_safe_primes_rejected() {
        // 13 is prime but (13 - 1) / 2 = 6 is not
        for p in [0u32, 1, 2, 3, 4, 9, 13, 15, 1285] {
            assert!(
                matches!(
                    SafePrimeGroup::new(BigUint::from(p)),
                    Err(SpekeError::InvalidParameter(_))
                ),
                "{} should be rejected",
                p
            );
        }
    }

    #[test]
    fn test_modp_2048_is_a_safe_prime() {
        let group = SafePrimeGroup::modp_2048();
        assert_eq!(group.prime().bits(), 2048);
        let validated = SafePrimeGroup::new(group.prime().clone())
            .expect("RFC 3526 group 14 must validate");
        assert_eq!(validated.subgroup_order(), group.subgroup_order());
    }

    #[test]
    fn test_constructors_agree() {
        let from_decimal = SafePrimeGroup::from_decimal("2039").expect("decimal");
        let from_hex = SafePrimeGroup::from_hex("7F7").expect("hex");
        let from_bytes = SafePrimeGroup::from_bytes(&[0x07, 0xF7]).expect("bytes");
        assert_eq!(from_decimal, from_hex);
        assert_eq!(from_decimal, from_bytes);
        assert!(matches!(
            SafePrimeGroup::from_decimal("not a number"),
            Err(SpekeError::InvalidEncoding)
        ));
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        for value in [1u64, 2, 255, 256, 65535, 0x0102_0304_0506] {
            let n = BigUint::from(value);
            let bytes = encode(&n);
            assert_eq!(decode(&bytes).expect("minimal encoding"), n);
        }
    }

    #[test]
    fn test_decode_rejects_empty_and_padded() {
        assert!(matches!(decode(&[]), Err(SpekeError::InvalidEncoding)));
        assert!(matches!(
            decode(&[0, 1]),
            Err(SpekeError::InvalidEncoding)
        ));
        // a single zero byte is the minimal encoding of zero
        assert_eq!(decode(&[0]).expect("zero"), BigUint::zero());
    }

    #[test]
    fn test_decode_element_rejects_out_of_range() {
        let group = SafePrimeGroup::from_decimal("1283").expect("safe prime");
        let too_wide = encode(&BigUint::from(1_000_000u32));
        assert!(matches!(
            group.decode_element(&too_wide),
            Err(SpekeError::OutOfRange)
        ));
        assert!(matches!(
            group.decode_element(&encode(&BigUint::from(1283u32))),
            Err(SpekeError::OutOfRange)
        ));
        assert_eq!(
            group
                .decode_element(&encode(&BigUint::from(1282u32)))
                .expect("p - 1 decodes"),
            BigUint::from(1282u32)
        );
    }

    #[test]
    fn test_ladder_matches_modpow() {
        let group = SafePrimeGroup::from_decimal("2039").expect("safe prime");
        let mut rng = OsRng;
        for _ in 0..32 {
            let base = rng.gen_biguint_range(&BigUint::from(2u32), group.prime());
            let exp = group.random_exponent(&mut rng);
            assert_eq!(group.pow_secret(&base, &exp), group.pow(&base, &exp));
        }
    }

    #[test]
    fn test_random_exponent_in_range() {
        let group = SafePrimeGroup::from_decimal("23").expect("safe prime");
        let mut rng = OsRng;
        for _ in 0..200 {
            let x = group.random_exponent(&mut rng);
            assert!(x >= BigUint::one());
            assert!(&x < group.subgroup_order());
        }
    }

    #[test]
    fn test_probable_prime_on_known_values() {
        for prime in [2u64, 3, 641, 1019, 104729] {
            assert!(is_probable_prime(&BigUint::from(prime), 40), "{}", prime);
        }
        for composite in [1u64, 561, 1105, 1285, 104730] {
            assert!(
                !is_probable_prime(&BigUint::from(composite), 40),
                "{}",
                composite
            );
        }
    }
}
