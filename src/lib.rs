// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed
// licenses.

//! An implementation of SPEKE (Simple Password Exponential Key Exchange)
//! with an authenticated session layer over reliable byte streams
//!
//! ⚠️ **Warning**: This implementation has not been audited. Use at your own risk!
//!
//! # Overview
//!
//! speke is a protocol between two peers who share a low-entropy password
//! and a public safe prime. After exchanging public keys derived from a
//! password-dependent generator, both peers hold high-entropy key material
//! that an attacker without the password cannot compute, and key
//! confirmation authenticates the peer as one who knew the password. On top
//! of the exchange, [`SpekeSession`] provides HMAC-authenticated message
//! framing over any connected reliable stream.
//!
//! The generator is `SHA-256(password)² mod p`: squaring lifts the hash
//! into the prime-order subgroup of the safe-prime group, which closes off
//! small-subgroup attacks even though the attacker can influence the hash.
//! Departing from the original SPEKE paper, key confirmation is keyed by
//! the HKDF output rather than the raw Diffie-Hellman secret, so a
//! successful confirmation simultaneously proves knowledge of the password
//! and agreement on the transport key.
//!
//! # Setup
//!
//! Both peers must agree on the safe prime and the password out of band. A
//! standard 2048-bit MODP group is provided:
//!
//! ```
//! use speke::SafePrimeGroup;
//! let group = SafePrimeGroup::modp_2048();
//! ```
//!
//! The lengths of the derived key material are fixed at compile time by a
//! [`CipherSuite`]; [`DefaultCipherSuite`] sizes them for AES-256-GCM.
//!
//! # The exchange
//!
//! Each peer constructs a [`Speke`] engine, sends its public key and
//! numbered id to the other side, and feeds the peer's pair in. Matching
//! passwords produce byte-identical key material on both sides:
//!
//! ```
//! use rand::rngs::OsRng;
//! use speke::{DefaultCipherSuite, SafePrimeGroup, Speke};
//!
//! // a small safe prime keeps the example fast; use modp_2048() in practice
//! let group = SafePrimeGroup::from_decimal("9354936252513209999").expect("safe prime");
//!
//! let mut alice =
//!     Speke::<DefaultCipherSuite>::new("alice", "hunter2", group.clone(), &mut OsRng)
//!         .expect("Error creating alice's engine");
//! let mut bob = Speke::<DefaultCipherSuite>::new("bob", "hunter2", group, &mut OsRng)
//!     .expect("Error creating bob's engine");
//!
//! // exchange public keys and numbered ids
//! let (alice_pk, alice_id) = (alice.public_key(), alice.id().to_owned());
//! let (bob_pk, bob_id) = (bob.public_key(), bob.id().to_owned());
//! alice
//!     .provide_remote(&bob_pk, &bob_id)
//!     .expect("Error providing bob's key");
//! bob.provide_remote(&alice_pk, &alice_id)
//!     .expect("Error providing alice's key");
//!
//! // matching passwords yield identical key material
//! assert_eq!(
//!     alice.encryption_key().expect("key"),
//!     bob.encryption_key().expect("key")
//! );
//!
//! // and each side can prove it to the other
//! let tag = bob.key_confirmation_data().expect("confirmation data");
//! assert!(alice.confirm_key(&tag).expect("confirmation"));
//! ```
//!
//! # Sessions
//!
//! A [`SpekeSession`] drives the exchange over a stream and delivers
//! authenticated payloads to a handler:
//!
//! ```text
//! Peer A                                Peer B
//!   |                                     |
//!   |------ InitData { id, pubkey } ----->|
//!   |<----- InitData { id, pubkey } ------|
//!   |<----- KeyConfirmation { data } -----|
//!   |------ KeyConfirmation { data } ---->|
//!   |                                     |
//!   |------ SignedData { hmac, data } --->|
//!   |<----- SignedData { hmac, data } ----|
//! ```
//!
//! ```no_run
//! use rand::rngs::OsRng;
//! use speke::{DefaultCipherSuite, SafePrimeGroup, Speke, SpekeSession};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), speke::SpekeError> {
//! let group = SafePrimeGroup::modp_2048();
//! let stream = tokio::net::TcpStream::connect("203.0.113.7:7000").await?;
//! let engine = Speke::<DefaultCipherSuite>::new("alice", "hunter2", group, &mut OsRng)?;
//!
//! let session = SpekeSession::new(stream, engine);
//! session
//!     .start(Arc::new(|payload, _handle| {
//!         println!("{} authenticated bytes from the peer", payload.len());
//!     }))
//!     .await?;
//!
//! // sending is possible once the peer's init data has arrived; before
//! // that, send_message fails with NotInitialized and queues nothing
//! session.send_message(b"hello").await?;
//! # Ok(())
//! # }
//! ```
//!
//! A session that observes a protocol violation, a failed key
//! confirmation, or a disconnect moves to a specific terminal state (see
//! [`SessionState`]) and stays there; messages failing HMAC verification
//! draw down a budget of [`BAD_BEHAVIOR_LIMIT`] before the peer is cut
//! off.

#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![cfg_attr(not(test), deny(unsafe_code))]
#![warn(clippy::doc_markdown, missing_docs, rustdoc::all)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub use errors::SpekeError;
pub use group::SafePrimeGroup;
pub use messages::{read_message, write_message, SpekeMessage};
pub use session::{MessageHandler, SessionHandle, SessionState, SpekeSession};
pub use speke::{IdCounter, Speke};

pub use rand;

mod errors;
mod group;
mod kdf;
mod messages;
mod session;
mod speke;
#[cfg(test)]
mod tests;

/// The crate's result type
pub type Result<T> = core::result::Result<T, SpekeError>;

/// Fixes the sizes of the key material the exchange derives:
/// * `KEY_LENGTH`: the symmetric key for the cipher the application will
///   run over the session, and
/// * `NONCE_LENGTH`: the initialization vector that goes with it.
pub trait CipherSuite {
    /// Length in bytes of the derived encryption key.
    const KEY_LENGTH: usize;
    /// Length in bytes of the derived nonce.
    const NONCE_LENGTH: usize;
}

/// The default [`CipherSuite`], sized for AES-256-GCM (32-byte key,
/// 12-byte nonce)
pub struct DefaultCipherSuite;
impl CipherSuite for DefaultCipherSuite {
    const KEY_LENGTH: usize = 32;
    const NONCE_LENGTH: usize = 12;
}

/// How many HMAC verification failures a session tolerates before it
/// terminates with [`SessionState::StoppedPeerBadBehavior`].
pub const BAD_BEHAVIOR_LIMIT: u32 = 3;

/// Upper bound on a frame payload, enforced when reading and writing.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;
