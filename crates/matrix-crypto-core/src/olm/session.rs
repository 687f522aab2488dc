// Copyright 2020 The Matrix.org Foundation C.I.C.
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

use std::{fmt, sync::Arc};

use ruma::SecondsSinceUnixEpoch;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{instrument, trace};
use vodozemac::{base64_decode, base64_encode, Curve25519PublicKey};
use zeroize::Zeroizing;

use super::{
    messages::OlmMessage,
    ratchet::{Ratchet, RatchetConfig, RatchetKeyPair},
};
use crate::{
    error::OlmResult,
    pickle::{
        PickleDecode, PickleEncode, PickleError, PickleReader, PickleWriter, U32_PICKLE_LENGTH,
    },
};

const SESSION_PICKLE_VERSION: u32 = 1;

/// The public keys that took part in the creation of an Olm session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionKeys {
    /// The long-term identity key of the session creator.
    pub identity_key: Curve25519PublicKey,
    /// The ephemeral base key of the session creator.
    pub base_key: Curve25519PublicKey,
    /// The one-time key of the receiving side the session was created with.
    pub one_time_key: Curve25519PublicKey,
}

impl SessionKeys {
    /// The session ID these keys produce.
    ///
    /// This is the unpadded base64 encoded SHA-256 hash of the concatenation of
    /// the three keys.
    pub fn session_id(&self) -> String {
        let mut sha = Sha256::new();

        sha.update(self.identity_key.as_bytes());
        sha.update(self.base_key.as_bytes());
        sha.update(self.one_time_key.as_bytes());

        base64_encode(sha.finalize())
    }
}

/// The cryptographic state of an Olm session, the Double Ratchet plus the
/// keys that created it.
#[derive(Debug)]
pub struct InnerSession {
    session_keys: SessionKeys,
    ratchet: Ratchet,
    received_message: bool,
}

impl InnerSession {
    /// Create the session of the side that initiated the key agreement.
    ///
    /// The shared secret is the output of the triple Diffie-Hellman between
    /// the session keys.
    pub fn new_outbound(session_keys: SessionKeys, shared_secret: &[u8]) -> Self {
        let ratchet = Ratchet::initialise_as_alice(shared_secret, RatchetKeyPair::new());
        Self { session_keys, ratchet, received_message: false }
    }

    /// Create the session of the side that received a pre-key message.
    ///
    /// `their_ratchet_key` is the ratchet key found in the received message.
    pub fn new_inbound(
        session_keys: SessionKeys,
        shared_secret: &[u8],
        their_ratchet_key: Curve25519PublicKey,
    ) -> Self {
        let ratchet = Ratchet::initialise_as_bob(shared_secret, their_ratchet_key);
        Self { session_keys, ratchet, received_message: false }
    }

    /// Use the given bounds for the ratchet of this session.
    pub fn with_config(mut self, config: RatchetConfig) -> Self {
        self.ratchet = self.ratchet.with_config(config);
        self
    }

    /// The unique ID of this session.
    pub fn session_id(&self) -> String {
        self.session_keys.session_id()
    }

    /// The keys this session was created with.
    pub fn session_keys(&self) -> SessionKeys {
        self.session_keys
    }

    /// Did we ever successfully decrypt a message using this session.
    pub fn has_received_message(&self) -> bool {
        self.received_message
    }

    /// The Double Ratchet of this session.
    pub fn ratchet(&self) -> &Ratchet {
        &self.ratchet
    }

    /// Encrypt a plaintext for the other side.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> OlmResult<OlmMessage> {
        self.ratchet.encrypt(plaintext)
    }

    /// Decrypt a message from the other side.
    pub fn decrypt(&mut self, message: &OlmMessage) -> OlmResult<Vec<u8>> {
        let plaintext = self.ratchet.decrypt(message)?;
        self.received_message = true;

        Ok(plaintext)
    }

    /// Restore a session from its libolm compatible pickle.
    pub fn from_pickle_bytes_with_config(
        source: &[u8],
        config: RatchetConfig,
    ) -> Result<Self, PickleError> {
        let (session, consumed) = Self::decode_with_config(source, config)?;

        if consumed != source.len() {
            Err(PickleError::Malformed("trailing bytes after the pickle"))
        } else {
            Ok(session)
        }
    }

    fn decode_with_config(
        source: &[u8],
        config: RatchetConfig,
    ) -> Result<(Self, usize), PickleError> {
        let mut reader = PickleReader::new(source);

        let version = reader.read_u32()?;

        if version != SESSION_PICKLE_VERSION {
            return Err(PickleError::UnsupportedVersion(version));
        }

        let received_message = reader.read_bool()?;
        let session_keys = SessionKeys {
            identity_key: reader.read()?,
            base_key: reader.read()?,
            one_time_key: reader.read()?,
        };

        let (ratchet, consumed) =
            Ratchet::decode_with_config(&source[reader.consumed()..], config)?;

        Ok((Self { session_keys, ratchet, received_message }, reader.consumed() + consumed))
    }
}

impl PickleEncode for InnerSession {
    fn pickle_len(&self) -> usize {
        U32_PICKLE_LENGTH
            + self.received_message.pickle_len()
            + self.session_keys.identity_key.pickle_len()
            + self.session_keys.base_key.pickle_len()
            + self.session_keys.one_time_key.pickle_len()
            + self.ratchet.pickle_len()
    }

    fn encode(&self, target: &mut [u8]) -> Result<usize, PickleError> {
        let mut writer = PickleWriter::new(target, self.pickle_len())?;

        writer.write_u32(SESSION_PICKLE_VERSION)?;
        writer.write_bool(self.received_message)?;
        writer.write(&self.session_keys.identity_key)?;
        writer.write(&self.session_keys.base_key)?;
        writer.write(&self.session_keys.one_time_key)?;
        writer.write(&self.ratchet)?;

        Ok(writer.finish())
    }
}

impl PickleDecode for InnerSession {
    fn decode(source: &[u8]) -> Result<(Self, usize), PickleError> {
        Self::decode_with_config(source, RatchetConfig::default())
    }
}

/// Cryptographic session that enables secure communication between two
/// devices.
#[derive(Clone)]
pub struct Session {
    /// The cryptographic state of the session
    pub inner: Arc<Mutex<InnerSession>>,
    /// Our session ID
    pub session_id: Arc<str>,
    /// The identity key of the device we share this session with
    pub sender_key: Curve25519PublicKey,
    /// When the session was created
    pub creation_time: SecondsSinceUnixEpoch,
    /// When the session was last used
    pub last_use_time: SecondsSinceUnixEpoch,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id())
            .field("sender_key", &self.sender_key)
            .finish()
    }
}

impl Session {
    /// Wrap the cryptographic state of a session shared with the device
    /// owning `sender_key`.
    pub fn new(sender_key: Curve25519PublicKey, inner: InnerSession) -> Self {
        let now = SecondsSinceUnixEpoch::now();

        Self {
            session_id: inner.session_id().into(),
            inner: Arc::new(Mutex::new(inner)),
            sender_key,
            creation_time: now,
            last_use_time: now,
        }
    }

    /// Decrypt the given Olm message.
    ///
    /// Returns the decrypted plaintext or an [`OlmError`] if decryption
    /// failed, in which case the session state is left untouched.
    ///
    /// [`OlmError`]: crate::OlmError
    #[instrument(
        skip_all,
        fields(session_id = %self.session_id, chain_index = message.chain_index())
    )]
    pub async fn decrypt(&mut self, message: &OlmMessage) -> OlmResult<Vec<u8>> {
        let plaintext = self.inner.lock().await.decrypt(message)?;
        self.last_use_time = SecondsSinceUnixEpoch::now();

        trace!("Successfully decrypted an Olm message");

        Ok(plaintext)
    }

    /// Encrypt the given plaintext as an Olm message.
    #[instrument(skip_all, fields(session_id = %self.session_id))]
    pub async fn encrypt(&mut self, plaintext: &[u8]) -> OlmResult<OlmMessage> {
        let message = self.inner.lock().await.encrypt(plaintext)?;
        self.last_use_time = SecondsSinceUnixEpoch::now();

        trace!(chain_index = message.chain_index(), "Successfully encrypted an Olm message");

        Ok(message)
    }

    /// Returns the unique identifier for this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Store the session as a base64 encoded libolm compatible pickle.
    pub async fn pickle(&self) -> PickledSession {
        let pickle = Zeroizing::new(self.inner.lock().await.to_pickle_bytes());

        PickledSession {
            pickle: base64_encode(pickle.as_slice()),
            sender_key: self.sender_key,
            creation_time: self.creation_time,
            last_use_time: self.last_use_time,
        }
    }

    /// Restore a session from a previously pickled one.
    pub fn from_pickle(pickle: PickledSession, config: RatchetConfig) -> Result<Self, PickleError> {
        let bytes = Zeroizing::new(
            base64_decode(&pickle.pickle).map_err(|_| PickleError::Malformed("invalid base64"))?,
        );
        let inner = InnerSession::from_pickle_bytes_with_config(&bytes, config)?;

        Ok(Self {
            session_id: inner.session_id().into(),
            inner: Arc::new(Mutex::new(inner)),
            sender_key: pickle.sender_key,
            creation_time: pickle.creation_time,
            last_use_time: pickle.last_use_time,
        })
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.session_id() == other.session_id()
    }
}

/// A pickled version of a `Session`.
///
/// Holds all the information that needs to be stored in a database to restore
/// a Session.
#[derive(Serialize, Deserialize)]
pub struct PickledSession {
    /// The base64 encoded libolm pickle of the session.
    pub pickle: String,
    /// The curve25519 key of the other user that we share this session with.
    pub sender_key: Curve25519PublicKey,
    /// The Unix timestamp when the session was created.
    pub creation_time: SecondsSinceUnixEpoch,
    /// The Unix timestamp when the session was last used.
    pub last_use_time: SecondsSinceUnixEpoch,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for PickledSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PickledSession")
            .field("sender_key", &self.sender_key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use assert_matches::assert_matches;
    use vodozemac::Curve25519SecretKey;

    use super::*;

    fn public_key() -> Curve25519PublicKey {
        Curve25519PublicKey::from(&Curve25519SecretKey::new())
    }

    /// Create a pair of sessions as if the key agreement already happened and
    /// Alice's first message reached Bob.
    pub(crate) fn session_pair() -> (InnerSession, InnerSession) {
        let session_keys = SessionKeys {
            identity_key: public_key(),
            base_key: public_key(),
            one_time_key: public_key(),
        };
        let shared_secret = b"the output of the triple Diffie-Hellman";

        let alice = InnerSession::new_outbound(session_keys, shared_secret);
        let their_ratchet_key = alice
            .ratchet()
            .sender_chain()
            .expect("A new outbound session should have a sender chain")
            .public_ratchet_key();
        let bob = InnerSession::new_inbound(session_keys, shared_secret, their_ratchet_key);

        (alice, bob)
    }

    #[test]
    fn both_sides_share_the_session_id() {
        let (alice, bob) = session_pair();
        assert_eq!(alice.session_id(), bob.session_id());
    }

    #[test]
    fn decrypting_marks_the_session_as_used() {
        let (mut alice, mut bob) = session_pair();
        assert!(!bob.has_received_message());

        let message = alice.encrypt(b"It's a secret to everybody").unwrap();
        assert_eq!(bob.decrypt(&message).unwrap(), b"It's a secret to everybody");
        assert!(bob.has_received_message());
    }

    #[test]
    fn pickle_layout() {
        let (_, bob) = session_pair();
        let pickle = bob.to_pickle_bytes();

        assert_eq!(&pickle[..4], &[0, 0, 0, 1]);
        assert_eq!(pickle[4], 0);
        assert_eq!(&pickle[5..37], bob.session_keys().identity_key.as_bytes());
        assert_eq!(&pickle[37..69], bob.session_keys().base_key.as_bytes());
        assert_eq!(&pickle[69..101], bob.session_keys().one_time_key.as_bytes());
        assert_eq!(pickle.len(), bob.pickle_len());
    }

    #[test]
    fn unknown_pickle_version_is_rejected() {
        let (alice, _) = session_pair();
        let mut pickle = alice.to_pickle_bytes();
        pickle[3] = 9;

        assert_matches!(
            InnerSession::from_pickle_bytes(&pickle),
            Err(PickleError::UnsupportedVersion(9))
        );
    }

    #[test]
    fn truncated_pickle_is_rejected() {
        let (alice, _) = session_pair();
        let pickle = alice.to_pickle_bytes();

        assert_matches!(
            InnerSession::from_pickle_bytes(&pickle[..pickle.len() - 1]),
            Err(PickleError::Truncated { .. })
        );
    }

    #[tokio::test]
    async fn pickled_session_restores() {
        let (mut alice, bob) = session_pair();
        let sender_key = alice.session_keys().identity_key;
        let mut session = Session::new(sender_key, bob);

        let message = alice.encrypt(b"Before pickling").unwrap();
        session.decrypt(&message).await.unwrap();

        let pickle = session.pickle().await;
        let json = serde_json::to_string(&pickle).unwrap();
        let pickle: PickledSession = serde_json::from_str(&json).unwrap();

        let mut restored = Session::from_pickle(pickle, RatchetConfig::default()).unwrap();
        assert_eq!(restored, session);
        assert!(restored.inner.lock().await.has_received_message());

        let message = alice.encrypt(b"After pickling").unwrap();
        assert_eq!(restored.decrypt(&message).await.unwrap(), b"After pickling");

        let reply = restored.encrypt(b"Reply").await.unwrap();
        assert_eq!(alice.decrypt(&reply).unwrap(), b"Reply");
    }
}
