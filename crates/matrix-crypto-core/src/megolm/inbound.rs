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

use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use ruma::{
    DeviceKeyAlgorithm, EventEncryptionAlgorithm, MilliSecondsSinceUnixEpoch, OwnedRoomId, RoomId,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::trace;
use vodozemac::{base64_decode, base64_encode, Curve25519PublicKey, Ed25519PublicKey};
use zeroize::Zeroizing;

use super::{
    message::MegolmMessage,
    ratchet::MegolmRatchet,
    session_keys::{ExportedSessionKey, SessionKey},
};
use crate::{
    error::{MegolmError, MegolmResult},
    pickle::{
        PickleDecode, PickleEncode, PickleError, PickleReader, PickleWriter, BOOL_PICKLE_LENGTH,
        PUBLIC_KEY_PICKLE_LENGTH, U32_PICKLE_LENGTH,
    },
    types::{deserialize_curve_key, serialize_curve_key},
};

const INBOUND_GROUP_SESSION_PICKLE_VERSION: u32 = 2;

/// The result of a successful Megolm decryption.
#[derive(Clone, PartialEq, Eq)]
pub struct DecryptedMessage {
    /// The decrypted plaintext.
    pub plaintext: Vec<u8>,
    /// The index of the message in the session.
    pub message_index: u32,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for DecryptedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptedMessage").field("message_index", &self.message_index).finish()
    }
}

/// The cryptographic state of an inbound Megolm session.
///
/// The initial ratchet is kept at the first known index so earlier messages
/// of the session can always be decrypted, the latest ratchet caches the
/// position of the most recent message to avoid rehashing for in-order
/// messages.
#[cfg_attr(test, derive(Debug))]
pub(crate) struct InnerSession {
    initial_ratchet: MegolmRatchet,
    latest_ratchet: MegolmRatchet,
    signing_key: Ed25519PublicKey,
    signing_key_verified: bool,
}

impl InnerSession {
    pub(crate) fn new(session_key: &SessionKey) -> Self {
        let ratchet = MegolmRatchet::from_bytes(&session_key.ratchet, session_key.index);

        Self {
            initial_ratchet: ratchet.clone(),
            latest_ratchet: ratchet,
            signing_key: session_key.signing_key,
            signing_key_verified: true,
        }
    }

    pub(crate) fn import(session_key: &ExportedSessionKey) -> Self {
        let ratchet = MegolmRatchet::from_bytes(&session_key.ratchet, session_key.index);

        Self {
            initial_ratchet: ratchet.clone(),
            latest_ratchet: ratchet,
            signing_key: session_key.signing_key,
            signing_key_verified: false,
        }
    }

    pub(crate) fn session_id(&self) -> String {
        self.signing_key.to_base64()
    }

    pub(crate) fn first_known_index(&self) -> u32 {
        self.initial_ratchet.index()
    }

    pub(crate) fn latest_index(&self) -> u32 {
        self.latest_ratchet.index()
    }

    /// Has a message signed by the session key been seen, or did the session
    /// come with a signed session key.
    pub(crate) fn is_signing_key_verified(&self) -> bool {
        self.signing_key_verified
    }

    pub(crate) fn decrypt(&mut self, message: &MegolmMessage) -> MegolmResult<DecryptedMessage> {
        self.signing_key
            .verify(&message.signed_bytes(), message.signature())
            .map_err(|_| MegolmError::InvalidSignature)?;

        let message_index = message.message_index();
        let first_known = self.first_known_index();

        if message_index < first_known {
            return Err(MegolmError::UnknownMessageIndex { first_known, requested: message_index });
        }

        let from_latest = message_index >= self.latest_ratchet.index();
        let mut ratchet =
            if from_latest { self.latest_ratchet.clone() } else { self.initial_ratchet.clone() };
        ratchet.advance_to(message_index);

        let cipher = ratchet.cipher();
        cipher
            .verify_truncated_mac(message.mac_input(), message.mac())
            .map_err(|_| MegolmError::InvalidMac)?;
        let plaintext =
            cipher.decrypt(message.ciphertext()).map_err(|_| MegolmError::InvalidPadding)?;

        self.signing_key_verified = true;

        if from_latest {
            self.latest_ratchet = ratchet;
        }

        Ok(DecryptedMessage { plaintext, message_index })
    }

    /// Export the session at the given index, `None` if the index lies before
    /// the first known index.
    pub(crate) fn export_at(&self, index: u32) -> Option<ExportedSessionKey> {
        if index < self.first_known_index() {
            None
        } else {
            let mut ratchet = self.initial_ratchet.clone();
            ratchet.advance_to(index);

            Some(ExportedSessionKey::new(&ratchet, self.signing_key))
        }
    }
}

impl PickleEncode for InnerSession {
    fn pickle_len(&self) -> usize {
        U32_PICKLE_LENGTH
            + 2 * MegolmRatchet::PICKLE_LENGTH
            + PUBLIC_KEY_PICKLE_LENGTH
            + BOOL_PICKLE_LENGTH
    }

    fn encode(&self, target: &mut [u8]) -> Result<usize, PickleError> {
        let mut writer = PickleWriter::new(target, self.pickle_len())?;

        writer.write_u32(INBOUND_GROUP_SESSION_PICKLE_VERSION)?;
        writer.write(&self.initial_ratchet)?;
        writer.write(&self.latest_ratchet)?;
        writer.write(&self.signing_key)?;
        writer.write_bool(self.signing_key_verified)?;

        Ok(writer.finish())
    }
}

impl PickleDecode for InnerSession {
    fn decode(source: &[u8]) -> Result<(Self, usize), PickleError> {
        let mut reader = PickleReader::new(source);

        let version = reader.read_u32()?;
        if version != INBOUND_GROUP_SESSION_PICKLE_VERSION {
            return Err(PickleError::UnsupportedVersion(version));
        }

        let initial_ratchet: MegolmRatchet = reader.read()?;
        let latest_ratchet: MegolmRatchet = reader.read()?;

        if latest_ratchet.index() < initial_ratchet.index() {
            return Err(PickleError::Malformed("the latest ratchet lies before the initial one"));
        }

        let session = Self {
            initial_ratchet,
            latest_ratchet,
            signing_key: reader.read()?,
            signing_key_verified: reader.read_bool()?,
        };

        Ok((session, reader.consumed()))
    }
}

/// Inbound group session.
///
/// Inbound group sessions are used to exchange room messages between a group
/// of participants. Inbound group sessions are used to decrypt the room
/// messages.
#[derive(Clone)]
pub struct InboundGroupSession {
    inner: Arc<Mutex<InnerSession>>,

    /// A copy of [`InnerSession::session_id`] to avoid having to acquire a lock
    /// to get to the session ID.
    session_id: Arc<str>,

    /// A copy of [`InnerSession::first_known_index`], it never changes.
    first_known_index: u32,

    /// The Curve25519 key of the device that created the session.
    sender_key: Curve25519PublicKey,

    /// The keys the creator of the session claims to own, usually only an
    /// Ed25519 key.
    sender_claimed_keys: Arc<BTreeMap<DeviceKeyAlgorithm, String>>,

    /// The room this session belongs to.
    room_id: OwnedRoomId,

    /// The Curve25519 keys of the devices that forwarded this session to us,
    /// oldest first.
    forwarding_chain: Arc<[String]>,

    /// When we received the session.
    received_at: MilliSecondsSinceUnixEpoch,

    /// How long the creator of the session intends to use it.
    max_age: Option<Duration>,

    /// How many messages the creator of the session intends to encrypt with
    /// it.
    max_messages: Option<u64>,

    /// The version of the key backup this session was restored from.
    key_backup_version: Option<Arc<str>>,

    /// Was the session received directly as a room key, or imported from a
    /// backup or export. The sender information of an imported session is
    /// only as trustworthy as the source it was imported from.
    imported: bool,

    algorithm: EventEncryptionAlgorithm,
}

impl InboundGroupSession {
    /// Create a new inbound group session from a signed session key, as it is
    /// received in a room key.
    ///
    /// # Arguments
    ///
    /// * `sender_key` - The public Curve25519 key of the device that sent us
    ///   the session.
    ///
    /// * `signing_key` - The public Ed25519 key of the device that sent us the
    ///   session.
    ///
    /// * `room_id` - The ID of the room that the session is used in.
    ///
    /// * `session_key` - The private session key that is used to decrypt
    ///   messages.
    pub fn new(
        sender_key: Curve25519PublicKey,
        signing_key: Ed25519PublicKey,
        room_id: &RoomId,
        session_key: &SessionKey,
    ) -> Self {
        let session = InnerSession::new(session_key);
        let sender_claimed_keys =
            BTreeMap::from([(DeviceKeyAlgorithm::Ed25519, signing_key.to_base64())]);

        Self::from_parts(session, sender_key, sender_claimed_keys, room_id.to_owned(), false)
    }

    /// Create a new inbound group session out of an unsigned export, for
    /// example one we restored from a key backup.
    pub fn import(
        sender_key: Curve25519PublicKey,
        sender_claimed_keys: BTreeMap<DeviceKeyAlgorithm, String>,
        room_id: &RoomId,
        session_key: &ExportedSessionKey,
    ) -> Self {
        let session = InnerSession::import(session_key);
        Self::from_parts(session, sender_key, sender_claimed_keys, room_id.to_owned(), true)
    }

    fn from_parts(
        session: InnerSession,
        sender_key: Curve25519PublicKey,
        sender_claimed_keys: BTreeMap<DeviceKeyAlgorithm, String>,
        room_id: OwnedRoomId,
        imported: bool,
    ) -> Self {
        Self {
            session_id: session.session_id().into(),
            first_known_index: session.first_known_index(),
            inner: Arc::new(Mutex::new(session)),
            sender_key,
            sender_claimed_keys: sender_claimed_keys.into(),
            room_id,
            forwarding_chain: Arc::new([]),
            received_at: MilliSecondsSinceUnixEpoch::now(),
            max_age: None,
            max_messages: None,
            key_backup_version: None,
            imported,
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
        }
    }

    /// Set the chain of devices that forwarded this session to us.
    pub fn with_forwarding_chain(mut self, forwarding_chain: Vec<String>) -> Self {
        self.forwarding_chain = forwarding_chain.into();
        self
    }

    /// Set the rotation limits the room of this session uses.
    pub fn with_rotation_limits(
        mut self,
        max_age: Option<Duration>,
        max_messages: Option<u64>,
    ) -> Self {
        self.max_age = max_age;
        self.max_messages = max_messages;
        self
    }

    /// Remember the key backup version this session was restored from.
    pub fn with_key_backup_version(mut self, version: &str) -> Self {
        self.key_backup_version = Some(version.into());
        self
    }

    /// The room where this session is used in.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Returns the unique identifier for this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The algorithm that this inbound group session is using to decrypt
    /// events.
    pub fn algorithm(&self) -> &EventEncryptionAlgorithm {
        &self.algorithm
    }

    /// Get the first message index we know how to decrypt.
    pub fn first_known_index(&self) -> u32 {
        self.first_known_index
    }

    /// Get the sender key that this session was received from.
    pub fn sender_key(&self) -> Curve25519PublicKey {
        self.sender_key
    }

    /// The Ed25519 key the creator of the session claims to own.
    pub fn signing_key(&self) -> Option<Ed25519PublicKey> {
        self.sender_claimed_keys
            .get(&DeviceKeyAlgorithm::Ed25519)
            .and_then(|k| Ed25519PublicKey::from_base64(k).ok())
    }

    /// The keys the creator of the session claims to own.
    pub fn sender_claimed_keys(&self) -> &BTreeMap<DeviceKeyAlgorithm, String> {
        &self.sender_claimed_keys
    }

    /// The Curve25519 keys of the devices that forwarded this session, oldest
    /// first.
    pub fn forwarding_chain(&self) -> &[String] {
        &self.forwarding_chain
    }

    /// When we received this session.
    pub fn received_at(&self) -> MilliSecondsSinceUnixEpoch {
        self.received_at
    }

    /// How long the creator of the session intends to use it.
    pub fn max_age(&self) -> Option<Duration> {
        self.max_age
    }

    /// How many messages the creator of the session intends to encrypt with
    /// it.
    pub fn max_messages(&self) -> Option<u64> {
        self.max_messages
    }

    /// The version of the key backup this session was restored from.
    pub fn key_backup_version(&self) -> Option<&str> {
        self.key_backup_version.as_deref()
    }

    /// Has the session been imported from a file or server-side backup? As
    /// opposed to being directly received as a room key.
    pub fn has_been_imported(&self) -> bool {
        self.imported
    }

    /// The index the latest decrypted message of this session was encrypted
    /// with.
    pub async fn latest_index(&self) -> u32 {
        self.inner.lock().await.latest_index()
    }

    /// Did we see a message signed by the session key, or did the session key
    /// itself come signed by its creator.
    ///
    /// Sessions restored from an unsigned export start out unverified.
    pub async fn is_signing_key_verified(&self) -> bool {
        self.inner.lock().await.is_signing_key_verified()
    }

    /// Export this session at the first known message index.
    pub async fn export(&self) -> ExportedSessionKey {
        self.export_at_index(self.first_known_index()).await
    }

    /// Export this session at the given message index.
    ///
    /// Indices before the first known index are clamped to it.
    pub async fn export_at_index(&self, message_index: u32) -> ExportedSessionKey {
        let message_index = std::cmp::max(self.first_known_index(), message_index);

        self.inner
            .lock()
            .await
            .export_at(message_index)
            .expect("The index was clamped to the first known index")
    }

    /// Decrypt the given Megolm message.
    ///
    /// Returns the decrypted plaintext and the message index or a
    /// [`MegolmError`] if decryption failed, in which case the session is
    /// left untouched.
    pub async fn decrypt(&self, message: &MegolmMessage) -> MegolmResult<DecryptedMessage> {
        let decrypted = self.inner.lock().await.decrypt(message)?;

        trace!(
            session_id = self.session_id(),
            message_index = decrypted.message_index,
            "Successfully decrypted a Megolm message",
        );

        Ok(decrypted)
    }

    /// Convert the [`InboundGroupSession`] into a
    /// [`PickledInboundGroupSession`] which can be serialized.
    pub async fn pickle(&self) -> PickledInboundGroupSession {
        let pickle = Zeroizing::new(self.inner.lock().await.to_pickle_bytes());

        PickledInboundGroupSession {
            pickle: base64_encode(pickle.as_slice()),
            sender_key: self.sender_key,
            sender_claimed_keys: (*self.sender_claimed_keys).clone(),
            room_id: self.room_id.clone(),
            forwarding_chain: self.forwarding_chain.to_vec(),
            received_at: self.received_at,
            max_age_ms: self.max_age.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            max_messages: self.max_messages,
            key_backup_version: self.key_backup_version.as_deref().map(ToOwned::to_owned),
            imported: self.imported,
            algorithm: self.algorithm.clone(),
        }
    }

    /// Restore a Session from a previously pickled one.
    pub fn from_pickle(pickle: PickledInboundGroupSession) -> Result<Self, PickleError> {
        let PickledInboundGroupSession {
            pickle,
            sender_key,
            sender_claimed_keys,
            room_id,
            forwarding_chain,
            received_at,
            max_age_ms,
            max_messages,
            key_backup_version,
            imported,
            algorithm,
        } = pickle;

        let bytes = Zeroizing::new(
            base64_decode(&pickle).map_err(|_| PickleError::Malformed("invalid base64"))?,
        );
        let session = InnerSession::from_pickle_bytes(&bytes)?;

        Ok(Self {
            session_id: session.session_id().into(),
            first_known_index: session.first_known_index(),
            inner: Arc::new(Mutex::new(session)),
            sender_key,
            sender_claimed_keys: sender_claimed_keys.into(),
            room_id,
            forwarding_chain: forwarding_chain.into(),
            received_at,
            max_age: max_age_ms.map(Duration::from_millis),
            max_messages,
            key_backup_version: key_backup_version.map(Into::into),
            imported,
            algorithm,
        })
    }
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for InboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundGroupSession")
            .field("room_id", &self.room_id)
            .field("session_id", &self.session_id())
            .field("first_known_index", &self.first_known_index)
            .finish()
    }
}

impl PartialEq for InboundGroupSession {
    fn eq(&self, other: &Self) -> bool {
        self.session_id() == other.session_id()
    }
}

/// A pickled version of an `InboundGroupSession`.
///
/// Holds all the information that needs to be stored in a database to restore
/// an InboundGroupSession.
#[derive(Clone, Serialize, Deserialize)]
pub struct PickledInboundGroupSession {
    /// The base64 encoded libolm pickle of the session.
    pub pickle: String,
    /// The public Curve25519 key of the device that sent us the session.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub sender_key: Curve25519PublicKey,
    /// The keys the creator of the session claims to own.
    pub sender_claimed_keys: BTreeMap<DeviceKeyAlgorithm, String>,
    /// The id of the room that the session is used in.
    pub room_id: OwnedRoomId,
    /// The devices that forwarded the session to us.
    #[serde(default)]
    pub forwarding_chain: Vec<String>,
    /// When we received the session.
    pub received_at: MilliSecondsSinceUnixEpoch,
    /// The rotation period of the room in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_ms: Option<u64>,
    /// The rotation message count of the room.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_messages: Option<u64>,
    /// The key backup version the session was restored from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_backup_version: Option<String>,
    /// Flag remembering if the session was directly sent to us by the sender
    /// or if it was imported.
    pub imported: bool,
    /// The algorithm of this inbound group session.
    #[serde(default = "default_algorithm")]
    pub algorithm: EventEncryptionAlgorithm,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for PickledInboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PickledInboundGroupSession")
            .field("room_id", &self.room_id)
            .field("sender_key", &self.sender_key)
            .finish_non_exhaustive()
    }
}

fn default_algorithm() -> EventEncryptionAlgorithm {
    EventEncryptionAlgorithm::MegolmV1AesSha2
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_let;
    use ruma::room_id;
    use vodozemac::{Curve25519SecretKey, Ed25519Keypair};

    use super::*;
    use crate::megolm::GroupSession;

    fn inbound_for(outbound: &GroupSession) -> InboundGroupSession {
        InboundGroupSession::new(
            Curve25519PublicKey::from(&Curve25519SecretKey::new()),
            Ed25519Keypair::new().public_key(),
            room_id!("!test:localhost"),
            &outbound.session_key(),
        )
    }

    #[tokio::test]
    async fn decrypts_in_and_out_of_order() {
        let mut outbound = GroupSession::new();
        let inbound = inbound_for(&outbound);

        let messages: Vec<_> =
            (0..5).map(|i| outbound.encrypt(format!("Message {i}").as_bytes())).collect();

        let decrypted = inbound.decrypt(&messages[3]).await.unwrap();
        assert_eq!(decrypted.plaintext, b"Message 3");
        assert_eq!(decrypted.message_index, 3);
        assert_eq!(inbound.latest_index().await, 3);

        let decrypted = inbound.decrypt(&messages[1]).await.unwrap();
        assert_eq!(decrypted.plaintext, b"Message 1");
        assert_eq!(inbound.latest_index().await, 3, "Older messages don't move the latest ratchet");

        // Megolm messages can be decrypted multiple times.
        let decrypted = inbound.decrypt(&messages[3]).await.unwrap();
        assert_eq!(decrypted.plaintext, b"Message 3");

        assert_eq!(inbound.session_id(), outbound.session_id());
        assert_eq!(inbound.first_known_index(), 0);
    }

    #[tokio::test]
    async fn messages_before_the_first_known_index_fail() {
        let mut outbound = GroupSession::new();
        let early = outbound.encrypt(b"Too early");
        let _ = outbound.encrypt(b"Still too early");

        let inbound = InboundGroupSession::import(
            Curve25519PublicKey::from(&Curve25519SecretKey::new()),
            BTreeMap::new(),
            room_id!("!test:localhost"),
            &outbound.export(),
        );
        let late = outbound.encrypt(b"Just in time");

        assert_eq!(inbound.first_known_index(), 2);
        assert!(inbound.has_been_imported());
        assert!(!inbound.is_signing_key_verified().await);

        assert_let!(
            Err(MegolmError::UnknownMessageIndex { first_known: 2, requested: 0 }) =
                inbound.decrypt(&early).await
        );
        assert_eq!(inbound.decrypt(&late).await.unwrap().plaintext, b"Just in time");
        assert!(inbound.is_signing_key_verified().await);
    }

    #[tokio::test]
    async fn messages_of_other_sessions_are_rejected() {
        let outbound = GroupSession::new();
        let inbound = inbound_for(&outbound);

        let mut other = GroupSession::new();
        let message = other.encrypt(b"Not for you");

        assert_let!(Err(MegolmError::InvalidSignature) = inbound.decrypt(&message).await);
        assert_eq!(inbound.latest_index().await, 0);
    }

    #[tokio::test]
    async fn export_at_index_clamps_and_advances() {
        let outbound = GroupSession::new();
        let inbound = inbound_for(&outbound);

        let export = inbound.export_at_index(10).await;
        assert_eq!(export.first_known_index(), 10);
        assert_eq!(export.session_id(), inbound.session_id());

        let imported = InboundGroupSession::import(
            inbound.sender_key(),
            BTreeMap::new(),
            inbound.room_id(),
            &export,
        );
        assert_eq!(imported.export_at_index(3).await.first_known_index(), 10);
    }

    #[tokio::test]
    async fn pickle_layout_and_restore() {
        let mut outbound = GroupSession::new();
        let inbound = inbound_for(&outbound)
            .with_forwarding_chain(vec!["forwarder".to_owned()])
            .with_rotation_limits(Some(Duration::from_secs(3600)), Some(100))
            .with_key_backup_version("3");

        for _ in 0..3 {
            let message = outbound.encrypt(b"Advance");
            inbound.decrypt(&message).await.unwrap();
        }

        let pickle = inbound.pickle().await;
        let bytes = base64_decode(&pickle.pickle).unwrap();

        assert_eq!(bytes.len(), 4 + 2 * 132 + 32 + 1);
        assert_eq!(&bytes[..4], &[0, 0, 0, 2]);
        assert_eq!(&bytes[4 + 128..4 + 132], &[0, 0, 0, 0]);
        assert_eq!(&bytes[4 + 132 + 128..4 + 264], &[0, 0, 0, 2]);
        assert_eq!(bytes[bytes.len() - 1], 1);

        let json = serde_json::to_string(&pickle).unwrap();
        let pickle: PickledInboundGroupSession = serde_json::from_str(&json).unwrap();
        let restored = InboundGroupSession::from_pickle(pickle).unwrap();

        assert_eq!(restored.session_id(), inbound.session_id());
        assert_eq!(restored.latest_index().await, 2);
        assert_eq!(restored.forwarding_chain(), ["forwarder".to_owned()]);
        assert_eq!(restored.max_age(), Some(Duration::from_secs(3600)));
        assert_eq!(restored.max_messages(), Some(100));
        assert_eq!(restored.key_backup_version(), Some("3"));
        assert_eq!(restored.signing_key(), inbound.signing_key());

        let message = outbound.encrypt(b"After the restore");
        assert_eq!(restored.decrypt(&message).await.unwrap().plaintext, b"After the restore");
    }

    #[tokio::test]
    async fn oversized_rotation_period_is_pickled_as_the_maximum() {
        let outbound = GroupSession::new();
        let inbound = inbound_for(&outbound).with_rotation_limits(Some(Duration::MAX), None);

        let pickle = inbound.pickle().await;
        assert_eq!(pickle.max_age_ms, Some(u64::MAX));

        let restored = InboundGroupSession::from_pickle(pickle).unwrap();
        assert_eq!(restored.max_age(), Some(Duration::from_millis(u64::MAX)));
        assert_eq!(restored.max_messages(), None);
    }

    #[test]
    fn pickles_with_an_unknown_version_are_rejected() {
        let mut bytes = vec![0, 0, 0, 1];
        bytes.extend_from_slice(&[0; 2 * 132 + 33]);

        assert_let!(
            Err(PickleError::UnsupportedVersion(1)) = InnerSession::from_pickle_bytes(&bytes)
        );
    }
}
