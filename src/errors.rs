// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed
// licenses.

use crate::session::SessionState;
use thiserror::Error;

/// The library's error type
#[derive(Error, Debug)]
pub enum SpekeError {
    /// Error for when a group parameter is unusable: the supplied modulus is
    /// not a safe prime, or the password hashes to a degenerate generator
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    /// Error for when a big-integer encoding is empty or not minimal
    #[error("malformed big-integer encoding")]
    InvalidEncoding,
    /// Error for when a decoded value lies outside the permitted interval
    #[error("value out of permitted range")]
    OutOfRange,
    /// Error for when the peer's public key fails validation
    #[error("peer public key rejected")]
    InvalidPeerKey,
    /// Error for when the peer's id fails validation
    #[error("peer id rejected")]
    InvalidPeerId,
    /// Error for when the remote key/id pair has already been accepted
    #[error("remote public key and id were already provided")]
    AlreadyProvided,
    /// Error for when key material is requested before the remote key/id
    /// pair has been provided
    #[error("remote public key and id not yet provided")]
    NotInitialized,
    /// Error for when a session operation is not permitted in the current
    /// state
    #[error("operation not permitted in session state {0:?}")]
    IllegalState(SessionState),
    /// Error for when a frame cannot be encoded or decoded
    #[error("message framing error: {0}")]
    Framing(String),
    /// Error for when a MAC key has an invalid length
    #[error(transparent)]
    InvalidLength(#[from] hkdf::hmac::digest::InvalidLength),
    /// Error for when the transport fails
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<bincode::Error> for SpekeError {
    fn from(err: bincode::Error) -> Self {
        SpekeError::Framing(err.to_string())
    }
}
