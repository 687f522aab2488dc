// Copyright 2024 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The two forms a Megolm session gets shared in.
//!
//! ```text
//! SessionKey (v2):         0x02 | index (u32 BE) | ratchet (128) | Ed25519 (32) | signature (64)
//! ExportedSessionKey (v1): 0x01 | index (u32 BE) | ratchet (128) | Ed25519 (32)
//! ```

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use vodozemac::{base64_decode, base64_encode, Ed25519PublicKey, Ed25519Signature};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::ratchet::{MegolmRatchet, RATCHET_LENGTH};

const SESSION_KEY_VERSION: u8 = 2;
const EXPORTED_SESSION_KEY_VERSION: u8 = 1;

const EXPORTED_SESSION_KEY_LENGTH: usize = 1 + 4 + RATCHET_LENGTH + 32;
const SIGNATURE_LENGTH: usize = 64;
const SESSION_KEY_LENGTH: usize = EXPORTED_SESSION_KEY_LENGTH + SIGNATURE_LENGTH;

/// Error type describing failures when decoding a session key.
#[derive(Debug, Error)]
pub enum SessionKeyDecodeError {
    /// The version of the session key is not supported.
    #[error("the session key version {0} is not supported, expected {1}")]
    Version(u8, u8),
    /// The session key doesn't have the expected length.
    #[error("the session key has an invalid length, expected {0} bytes, got {1}")]
    Length(usize, usize),
    /// The session key isn't valid base64.
    #[error(transparent)]
    Base64(#[from] vodozemac::Base64DecodeError),
    /// The embedded Ed25519 key is invalid.
    #[error("the session key contains an invalid Ed25519 key: {0}")]
    PublicKey(#[from] vodozemac::KeyError),
    /// The signature of the session key didn't verify.
    #[error("the session key signature is invalid: {0}")]
    Signature(#[from] vodozemac::SignatureError),
}

/// The session key of a Megolm session, signed by the session creator.
///
/// This is the form a session gets shared with the room members in when it's
/// created.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKey {
    #[zeroize(skip)]
    pub(crate) signing_key: Ed25519PublicKey,
    pub(crate) ratchet: Box<[u8; RATCHET_LENGTH]>,
    pub(crate) index: u32,
    #[zeroize(skip)]
    pub(crate) signature: Ed25519Signature,
}

impl SessionKey {
    pub(crate) fn new(
        ratchet: &MegolmRatchet,
        signing_key: Ed25519PublicKey,
        signature: Ed25519Signature,
    ) -> Self {
        Self { signing_key, ratchet: ratchet.to_bytes(), index: ratchet.index(), signature }
    }

    /// The part of the session key the signature covers.
    pub(crate) fn signed_bytes(
        index: u32,
        ratchet: &[u8; RATCHET_LENGTH],
        signing_key: &Ed25519PublicKey,
    ) -> Zeroizing<Vec<u8>> {
        let mut bytes = Zeroizing::new(Vec::with_capacity(EXPORTED_SESSION_KEY_LENGTH));

        bytes.push(SESSION_KEY_VERSION);
        bytes.extend_from_slice(&index.to_be_bytes());
        bytes.extend_from_slice(ratchet.as_slice());
        bytes.extend_from_slice(signing_key.as_bytes());

        bytes
    }

    /// Decode and verify a session key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SessionKeyDecodeError> {
        if bytes.len() != SESSION_KEY_LENGTH {
            return Err(SessionKeyDecodeError::Length(SESSION_KEY_LENGTH, bytes.len()));
        }

        if bytes[0] != SESSION_KEY_VERSION {
            return Err(SessionKeyDecodeError::Version(SESSION_KEY_VERSION, bytes[0]));
        }

        let index = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);

        let mut ratchet = Box::new([0u8; RATCHET_LENGTH]);
        ratchet.copy_from_slice(&bytes[5..5 + RATCHET_LENGTH]);

        let signing_key =
            Ed25519PublicKey::from_slice(
            bytes[5 + RATCHET_LENGTH..EXPORTED_SESSION_KEY_LENGTH]
                .try_into()
                .expect("the length of the session key was checked"),
        )?;
        let signature = Ed25519Signature::from_slice(&bytes[EXPORTED_SESSION_KEY_LENGTH..])?;

        signing_key.verify(&bytes[..EXPORTED_SESSION_KEY_LENGTH], &signature)?;

        Ok(Self { signing_key, ratchet, index, signature })
    }

    /// Encode the session key.
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut bytes = Self::signed_bytes(self.index, &self.ratchet, &self.signing_key);
        bytes.extend_from_slice(&self.signature.to_bytes());

        bytes
    }

    /// Decode and verify a session key from unpadded base64.
    pub fn from_base64(key: &str) -> Result<Self, SessionKeyDecodeError> {
        let bytes = Zeroizing::new(base64_decode(key)?);
        Self::from_bytes(&bytes)
    }

    /// Encode the session key as unpadded base64.
    pub fn to_base64(&self) -> String {
        base64_encode(self.to_bytes().as_slice())
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKey")
            .field("signing_key", &self.signing_key)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

/// An unsigned export of a Megolm session at a given index.
///
/// This is the form sessions take in key exports, forwarded room keys and key
/// backups.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ExportedSessionKey {
    #[zeroize(skip)]
    pub(crate) signing_key: Ed25519PublicKey,
    pub(crate) ratchet: Box<[u8; RATCHET_LENGTH]>,
    pub(crate) index: u32,
}

impl ExportedSessionKey {
    pub(crate) fn new(ratchet: &MegolmRatchet, signing_key: Ed25519PublicKey) -> Self {
        Self { signing_key, ratchet: ratchet.to_bytes(), index: ratchet.index() }
    }

    /// The index of the first message this export can decrypt.
    pub fn first_known_index(&self) -> u32 {
        self.index
    }

    /// The ID of the session this export belongs to.
    pub fn session_id(&self) -> String {
        self.signing_key.to_base64()
    }

    /// Decode an exported session key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SessionKeyDecodeError> {
        if bytes.len() != EXPORTED_SESSION_KEY_LENGTH {
            return Err(SessionKeyDecodeError::Length(EXPORTED_SESSION_KEY_LENGTH, bytes.len()));
        }

        if bytes[0] != EXPORTED_SESSION_KEY_VERSION {
            return Err(SessionKeyDecodeError::Version(EXPORTED_SESSION_KEY_VERSION, bytes[0]));
        }

        let index = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);

        let mut ratchet = Box::new([0u8; RATCHET_LENGTH]);
        ratchet.copy_from_slice(&bytes[5..5 + RATCHET_LENGTH]);

        let signing_key = Ed25519PublicKey::from_slice(
            bytes[5 + RATCHET_LENGTH..]
                .try_into()
                .expect("the length of the exported session key was checked"),
        )?;

        Ok(Self { signing_key, ratchet, index })
    }

    /// Encode the exported session key.
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut bytes = Zeroizing::new(Vec::with_capacity(EXPORTED_SESSION_KEY_LENGTH));

        bytes.push(EXPORTED_SESSION_KEY_VERSION);
        bytes.extend_from_slice(&self.index.to_be_bytes());
        bytes.extend_from_slice(self.ratchet.as_slice());
        bytes.extend_from_slice(self.signing_key.as_bytes());

        bytes
    }

    /// Decode an exported session key from unpadded base64.
    pub fn from_base64(key: &str) -> Result<Self, SessionKeyDecodeError> {
        let bytes = Zeroizing::new(base64_decode(key)?);
        Self::from_bytes(&bytes)
    }

    /// Encode the exported session key as unpadded base64.
    pub fn to_base64(&self) -> String {
        base64_encode(self.to_bytes().as_slice())
    }
}

impl fmt::Debug for ExportedSessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportedSessionKey")
            .field("session_id", &self.session_id())
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

impl Serialize for ExportedSessionKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded = Zeroizing::new(self.to_base64());
        serializer.serialize_str(&encoded)
    }
}

impl<'de> Deserialize<'de> for ExportedSessionKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = Zeroizing::new(String::deserialize(deserializer)?);
        Self::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::megolm::GroupSession;

    #[test]
    fn session_key_layout_and_verification() {
        let session = GroupSession::new();
        let session_key = session.session_key();
        let bytes = session_key.to_bytes();

        assert_eq!(bytes.len(), 229);
        assert_eq!(bytes[0], 2);

        let decoded = SessionKey::from_base64(&session_key.to_base64()).unwrap();
        assert_eq!(decoded.signing_key, session_key.signing_key);
        assert_eq!(decoded.index, 0);
    }

    #[test]
    fn tampered_session_key_is_rejected() {
        let session = GroupSession::new();
        let mut bytes = session.session_key().to_bytes();
        bytes[10] ^= 0x01;

        assert_matches!(SessionKey::from_bytes(&bytes), Err(SessionKeyDecodeError::Signature(_)));
    }

    #[test]
    fn exported_key_layout() {
        let session = GroupSession::new();
        let export = session.export();
        let bytes = export.to_bytes();

        assert_eq!(bytes.len(), 165);
        assert_eq!(bytes[0], 1);
        assert_eq!(export.session_id(), session.session_id());

        assert_matches!(
            ExportedSessionKey::from_bytes(&bytes[..164]),
            Err(SessionKeyDecodeError::Length(165, 164))
        );
        assert_matches!(
            SessionKey::from_bytes(&bytes),
            Err(SessionKeyDecodeError::Length(229, 165))
        );
    }

    #[test]
    fn exported_key_serializes_as_base64() {
        let session = GroupSession::new();
        let export = session.export();

        let json = serde_json::to_value(&export).unwrap();
        assert_eq!(json.as_str(), Some(export.to_base64().as_str()));

        let decoded: ExportedSessionKey = serde_json::from_value(json).unwrap();
        assert_eq!(decoded.session_id(), export.session_id());
    }
}
