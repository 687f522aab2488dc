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

use std::{pin::pin, sync::Arc, time::Duration};

use ruma::{OwnedUserId, RoomId, UserId};
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, instrument, trace, warn};
use vodozemac::Curve25519PublicKey;

use crate::{
    backups::BackupMachine,
    error::{MegolmError, MegolmResult, OlmError, OlmResult, SessionCreationError},
    megolm::{DecryptedMessage, InboundGroupSession, MegolmMessage},
    olm::{OlmMessage, Session},
    store::{
        Changes, CryptoStoreError, IntoCryptoStore, MemoryStore, RoomKeyInfo, StateStore, Store,
    },
    types::BackedUpRoomKey,
};

/// State machine implementation of the Olm/Megolm encryption protocol used for
/// Matrix end to end encryption.
///
/// The machine is the context object every operation goes through. It's cheap
/// to clone, clones share all of their state.
#[derive(Clone)]
pub struct OlmMachine {
    inner: Arc<OlmMachineInner>,
}

struct OlmMachineInner {
    /// The unique user id that owns this machine.
    user_id: OwnedUserId,
    /// Store for the encryption keys.
    /// Persists all the encryption keys so a client can resume the session
    /// without the need to create new keys.
    store: Store,
    /// A state machine that handles restoring room keys from backups.
    backup_machine: BackupMachine,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for OlmMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OlmMachine").field("user_id", &self.user_id()).finish()
    }
}

impl OlmMachine {
    /// Create a new memory based OlmMachine.
    ///
    /// The created machine will keep the encryption keys only in memory and
    /// once the object is dropped the keys will be lost.
    ///
    /// # Arguments
    ///
    /// * `user_id` - The unique id of the user that owns this machine.
    pub fn new(user_id: &UserId) -> Self {
        let store = Arc::new(MemoryStore::new());
        OlmMachine::with_store(user_id, store.clone(), store)
    }

    /// Create a new OlmMachine with the given [`CryptoStore`] and
    /// [`StateStore`].
    ///
    /// # Arguments
    ///
    /// * `user_id` - The unique id of the user that owns this machine.
    ///
    /// * `store` - A `CryptoStore` implementation that will be used to store
    ///   the encryption keys.
    ///
    /// * `state_store` - The store providing the encryption settings of rooms.
    ///
    /// [`CryptoStore`]: crate::store::CryptoStore
    pub fn with_store(
        user_id: &UserId,
        store: impl IntoCryptoStore,
        state_store: Arc<dyn StateStore>,
    ) -> Self {
        let store = Store::new(user_id.to_owned(), store, state_store);
        let backup_machine = BackupMachine::new(store.clone());

        Self {
            inner: Arc::new(OlmMachineInner {
                user_id: user_id.to_owned(),
                store,
                backup_machine,
            }),
        }
    }

    /// The unique user id that owns this `OlmMachine` instance.
    pub fn user_id(&self) -> &UserId {
        &self.inner.user_id
    }

    /// Get a reference to the backup related state machine.
    ///
    /// This state machine can be used to verify and restore server-side
    /// backups of room keys.
    pub fn backup_machine(&self) -> &BackupMachine {
        &self.inner.backup_machine
    }

    /// Store an Olm session that was established with another device.
    pub async fn add_olm_session(&self, session: Session) -> Result<(), CryptoStoreError> {
        self.inner
            .store
            .save_changes(Changes { sessions: vec![session], ..Default::default() })
            .await
    }

    /// Encrypt the plaintext for the device owning the given identity key.
    ///
    /// The most recently used session with the device is picked. Only one
    /// encryption or decryption per device happens at a time.
    #[instrument(skip_all, fields(sender_key = %sender_key.to_base64()))]
    pub async fn encrypt_olm_message(
        &self,
        sender_key: Curve25519PublicKey,
        plaintext: &[u8],
    ) -> OlmResult<OlmMessage> {
        let sessions = self.inner.store.get_sessions(&sender_key.to_base64()).await?;

        let (message, session) = {
            let mut sessions = sessions.lock().await;

            let Some(session) = sessions.iter_mut().max_by_key(|s| s.last_use_time) else {
                return Err(OlmError::MissingSession(sender_key));
            };

            (session.encrypt(plaintext).await?, session.clone())
        };

        self.inner
            .store
            .save_changes(Changes { sessions: vec![session], ..Default::default() })
            .await?;

        Ok(message)
    }

    /// Decrypt an Olm message sent by the device owning the given identity
    /// key.
    ///
    /// Every session we share with the device is tried in turn, a session
    /// that fails to decrypt the message is left untouched.
    #[instrument(
        skip_all,
        fields(sender_key = %sender_key.to_base64(), chain_index = message.chain_index())
    )]
    pub async fn decrypt_olm_message(
        &self,
        sender_key: Curve25519PublicKey,
        message: &OlmMessage,
    ) -> OlmResult<Vec<u8>> {
        let sessions = self.inner.store.get_sessions(&sender_key.to_base64()).await?;

        let (plaintext, session) = {
            let mut sessions = sessions.lock().await;
            let mut decrypted = None;

            for session in sessions.iter_mut() {
                match session.decrypt(message).await {
                    Ok(plaintext) => {
                        decrypted = Some((plaintext, session.clone()));
                        break;
                    }
                    Err(e) => {
                        trace!(
                            session_id = session.session_id(),
                            error = ?e,
                            "Failed to decrypt an Olm message with a session"
                        );
                    }
                }
            }

            match decrypted {
                Some(decrypted) => decrypted,
                None => {
                    warn!(session_count = sessions.len(), "Failed to decrypt an Olm message");
                    return Err(OlmError::MissingSession(sender_key));
                }
            }
        };

        self.inner
            .store
            .save_changes(Changes { sessions: vec![session], ..Default::default() })
            .await?;

        Ok(plaintext)
    }

    /// Attempt to retrieve an inbound group session from the store.
    ///
    /// If the session is not found a [`MegolmError::MissingRoomKey`] error is
    /// returned.
    async fn get_inbound_group_session_or_error(
        &self,
        room_id: &RoomId,
        sender_key: Curve25519PublicKey,
        session_id: &str,
    ) -> MegolmResult<InboundGroupSession> {
        match self.inner.store.get_inbound_group_session(room_id, sender_key, session_id).await? {
            Some(session) => Ok(session),
            None => Err(MegolmError::MissingRoomKey {
                room_id: room_id.to_owned(),
                session_id: session_id.to_owned(),
            }),
        }
    }

    /// Decrypt a Megolm message from a room timeline.
    ///
    /// # Arguments
    ///
    /// * `room_id` - The ID of the room where the message was sent to.
    ///
    /// * `sender_key` - The identity key of the device that created the
    ///   session.
    ///
    /// * `session_id` - The ID of the session the message was encrypted with.
    ///
    /// * `message` - The message that should be decrypted.
    #[instrument(skip(self, sender_key, message), fields(message_index = message.message_index()))]
    pub async fn decrypt_room_message(
        &self,
        room_id: &RoomId,
        sender_key: Curve25519PublicKey,
        session_id: &str,
        message: &MegolmMessage,
    ) -> MegolmResult<DecryptedMessage> {
        let session =
            self.get_inbound_group_session_or_error(room_id, sender_key, session_id).await?;

        let result = session.decrypt(message).await;

        if let Err(e) = &result {
            warn!("Failed to decrypt a room message: {e}");
        }

        result
    }

    /// Import a single room key that was restored from a key backup.
    ///
    /// # Arguments
    ///
    /// * `version` - The version of the backup the key was restored from.
    ///
    /// * `room_id` - The room the key was stored under in the backup.
    ///
    /// * `session_id` - The session ID the key was stored under in the backup,
    ///   the import fails if the session key belongs to another session.
    ///
    /// * `room_key` - The decrypted room key.
    pub async fn import_room_key_from_backup(
        &self,
        version: &str,
        room_id: &RoomId,
        session_id: &str,
        room_key: BackedUpRoomKey,
    ) -> Result<InboundGroupSession, SessionCreationError> {
        self.inner.store.import_room_key_from_backup(version, room_id, session_id, room_key).await
    }

    /// Receive notifications of room keys being received as a [`Stream`].
    ///
    /// Each time a room key is updated in any way, an update will be sent to
    /// the stream. Updates that happen at the same time are batched into a
    /// [`Vec`].
    ///
    /// If the reader of the stream lags too far behind, a warning will be
    /// logged and items will be dropped.
    pub fn room_keys_received_stream(&self) -> impl Stream<Item = Vec<RoomKeyInfo>> {
        let stream = self.inner.store.room_keys_received_stream();

        stream.filter_map(|result| match result {
            Ok(r) => Some(r),
            Err(e) => {
                warn!("Error reading from the room keys received stream: {e}");
                None
            }
        })
    }

    /// Wait until the room key for the given session is received, or the
    /// timeout passes.
    ///
    /// Returns `true` if the room key is available.
    #[instrument(skip(self, sender_key))]
    pub async fn wait_for_room_key(
        &self,
        room_id: &RoomId,
        sender_key: Curve25519PublicKey,
        session_id: &str,
        timeout: Duration,
    ) -> Result<bool, CryptoStoreError> {
        // Subscribe before checking the store, otherwise a key arriving in
        // between would be missed.
        let mut stream = pin!(self.inner.store.room_keys_received_stream());

        let store = &self.inner.store;

        if store.get_inbound_group_session(room_id, sender_key, session_id).await?.is_some() {
            return Ok(true);
        }

        let wait = async {
            while let Some(update) = stream.next().await {
                match update {
                    Ok(infos) => {
                        if infos.iter().any(|info| {
                            info.room_id == room_id
                                && info.sender_key == sender_key
                                && info.session_id == session_id
                        }) {
                            return Ok(true);
                        }
                    }
                    Err(e) => {
                        debug!("Missed room key updates while waiting for a room key: {e}");

                        if store
                            .get_inbound_group_session(room_id, sender_key, session_id)
                            .await?
                            .is_some()
                        {
                            return Ok(true);
                        }
                    }
                }
            }

            Ok(false)
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                debug!("Timed out waiting for the room key");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use assert_matches2::{assert_let, assert_matches};
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use ruma::{room_id, user_id, DeviceKeyAlgorithm, EventEncryptionAlgorithm, RoomId};
    use vodozemac::{Curve25519PublicKey, Curve25519SecretKey, Ed25519Keypair};

    use super::OlmMachine;
    use crate::{
        error::{MegolmError, OlmError, SessionCreationError},
        megolm::{GroupSession, InboundGroupSession},
        olm::{session_pair, Session},
        store::{CryptoStore, CryptoStoreError, MemoryStore, StateStore},
        types::{BackedUpRoomKey, RoomEncryptionSettings},
    };

    #[derive(Debug)]
    struct UnavailableStateStore;

    #[async_trait]
    impl StateStore for UnavailableStateStore {
        async fn get_encryption_settings(
            &self,
            _: &RoomId,
        ) -> Result<Option<RoomEncryptionSettings>, CryptoStoreError> {
            Err(CryptoStoreError::backend(std::io::Error::other("state store is unavailable")))
        }
    }

    fn curve_key() -> Curve25519PublicKey {
        Curve25519PublicKey::from(&Curve25519SecretKey::new())
    }

    fn machine_with_store() -> (OlmMachine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let state_store: Arc<dyn StateStore> = store.clone();
        let machine =
            OlmMachine::with_store(user_id!("@alice:localhost"), store.clone(), state_store);

        (machine, store)
    }

    /// Export the given outbound session as a room key restored from a backup.
    async fn backed_up_room_key(
        outbound: &GroupSession,
        room_id: &RoomId,
        sender_key: Curve25519PublicKey,
        index: u32,
    ) -> BackedUpRoomKey {
        let inbound = InboundGroupSession::new(
            sender_key,
            Ed25519Keypair::new().public_key(),
            room_id,
            &outbound.session_key(),
        );

        BackedUpRoomKey {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            sender_key,
            session_key: inbound.export_at_index(index).await,
            sender_claimed_keys: inbound.sender_claimed_keys().clone(),
            forwarding_curve25519_key_chain: Vec::new(),
        }
    }

    #[tokio::test]
    async fn olm_messages_are_exchanged() {
        let alice_key = curve_key();
        let bob_key = curve_key();
        let (alice_session, bob_session) = session_pair();

        let alice = OlmMachine::new(user_id!("@alice:localhost"));
        let bob_store = Arc::new(MemoryStore::new());
        let bob = OlmMachine::with_store(
            user_id!("@bob:localhost"),
            bob_store.clone(),
            bob_store.clone(),
        );

        alice.add_olm_session(Session::new(bob_key, alice_session)).await.unwrap();
        bob.add_olm_session(Session::new(alice_key, bob_session)).await.unwrap();

        let message = alice.encrypt_olm_message(bob_key, b"Hello").await.unwrap();
        assert_eq!(bob.decrypt_olm_message(alice_key, &message).await.unwrap(), b"Hello");

        // A fresh machine on top of the same store continues where the old one
        // stopped.
        let bob = OlmMachine::with_store(user_id!("@bob:localhost"), bob_store.clone(), bob_store);
        let message = alice.encrypt_olm_message(bob_key, b"Hello again").await.unwrap();
        assert_eq!(bob.decrypt_olm_message(alice_key, &message).await.unwrap(), b"Hello again");

        assert_let!(
            Err(OlmError::MissingSession(key)) =
                bob.decrypt_olm_message(curve_key(), &message).await
        );
        assert_ne!(key, alice_key);
        assert_matches!(
            alice.encrypt_olm_message(curve_key(), b"Hello").await,
            Err(OlmError::MissingSession(_))
        );
    }

    #[tokio::test]
    async fn replayed_olm_message_is_rejected() {
        let alice_key = curve_key();
        let bob_key = curve_key();
        let (alice_session, bob_session) = session_pair();

        let alice = OlmMachine::new(user_id!("@alice:localhost"));
        let bob = OlmMachine::new(user_id!("@bob:localhost"));

        alice.add_olm_session(Session::new(bob_key, alice_session)).await.unwrap();
        bob.add_olm_session(Session::new(alice_key, bob_session)).await.unwrap();

        let message = alice.encrypt_olm_message(bob_key, b"Hello").await.unwrap();
        bob.decrypt_olm_message(alice_key, &message).await.unwrap();

        assert_matches!(
            bob.decrypt_olm_message(alice_key, &message).await,
            Err(OlmError::MissingSession(_))
        );
    }

    #[tokio::test]
    async fn mismatched_session_id_is_not_imported() {
        let (machine, store) = machine_with_store();
        let room_id = room_id!("!test:localhost");
        let outbound = GroupSession::new();
        let other = GroupSession::new();

        let room_key = backed_up_room_key(&outbound, room_id, curve_key(), 0).await;

        assert_let!(
            Err(SessionCreationError::SessionIdMismatch { claimed, actual }) = machine
                .import_room_key_from_backup("1", room_id, &other.session_id(), room_key)
                .await
        );
        assert_eq!(claimed, other.session_id());
        assert_eq!(actual, outbound.session_id());
        assert_eq!(store.inbound_group_session_count(), 0);
    }

    #[tokio::test]
    async fn unsupported_algorithm_is_not_imported() {
        let (machine, store) = machine_with_store();
        let room_id = room_id!("!test:localhost");
        let outbound = GroupSession::new();

        let mut room_key = backed_up_room_key(&outbound, room_id, curve_key(), 0).await;
        room_key.algorithm = EventEncryptionAlgorithm::OlmV1Curve25519AesSha2;

        assert_matches!(
            machine
                .import_room_key_from_backup("1", room_id, &outbound.session_id(), room_key)
                .await,
            Err(SessionCreationError::UnsupportedAlgorithm(_))
        );
        assert_eq!(store.inbound_group_session_count(), 0);
    }

    #[tokio::test]
    async fn partial_session_is_usable_from_its_first_index() {
        let (machine, _) = machine_with_store();
        let room_id = room_id!("!test:localhost");
        let sender_key = curve_key();
        let forwarder = curve_key().to_base64();

        let mut outbound = GroupSession::new();
        let early_message = outbound.encrypt(b"Too early");
        outbound.encrypt(b"Also too early");

        let mut room_key = backed_up_room_key(&outbound, room_id, sender_key, 2).await;
        room_key.forwarding_curve25519_key_chain = vec![forwarder.clone()];

        let session = machine
            .import_room_key_from_backup("2", room_id, &outbound.session_id(), room_key)
            .await
            .unwrap();

        assert_eq!(session.first_known_index(), 2);
        assert_eq!(session.key_backup_version(), Some("2"));
        assert!(session.has_been_imported());
        assert_eq!(session.forwarding_chain(), [forwarder, sender_key.to_base64()]);
        assert!(session.sender_claimed_keys().contains_key(&DeviceKeyAlgorithm::Ed25519));

        let message = outbound.encrypt(b"Just in time");
        let decrypted = machine
            .decrypt_room_message(room_id, sender_key, &outbound.session_id(), &message)
            .await
            .unwrap();
        assert_eq!(decrypted.plaintext, b"Just in time");
        assert_eq!(decrypted.message_index, 2);

        assert_matches!(
            machine
                .decrypt_room_message(room_id, sender_key, &outbound.session_id(), &early_message)
                .await,
            Err(MegolmError::UnknownMessageIndex { first_known: 2, requested: 0 })
        );
    }

    #[tokio::test]
    async fn rotation_settings_of_the_room_are_applied() {
        let (machine, store) = machine_with_store();
        let room_id = room_id!("!test:localhost");
        let outbound = GroupSession::new();

        store.save_room_settings(
            room_id,
            RoomEncryptionSettings {
                rotation_period_ms: Some(604_800_000),
                rotation_period_msgs: Some(100),
                ..Default::default()
            },
        );

        let room_key = backed_up_room_key(&outbound, room_id, curve_key(), 0).await;
        let session = machine
            .import_room_key_from_backup("1", room_id, &outbound.session_id(), room_key)
            .await
            .unwrap();

        assert_eq!(session.max_age(), Some(Duration::from_secs(7 * 24 * 60 * 60)));
        assert_eq!(session.max_messages(), Some(100));

        let other_room = room_id!("!other:localhost");
        let outbound = GroupSession::new();
        let room_key = backed_up_room_key(&outbound, other_room, curve_key(), 0).await;
        let session = machine
            .import_room_key_from_backup("1", other_room, &outbound.session_id(), room_key)
            .await
            .unwrap();

        assert_eq!(session.max_age(), None);
        assert_eq!(session.max_messages(), None);
    }

    #[tokio::test]
    async fn room_settings_lookup_failure_does_not_block_import() {
        let store = Arc::new(MemoryStore::new());
        let machine = OlmMachine::with_store(
            user_id!("@alice:localhost"),
            store.clone(),
            Arc::new(UnavailableStateStore),
        );

        let room_id = room_id!("!test:localhost");
        let sender_key = curve_key();
        let mut outbound = GroupSession::new();

        let room_key = backed_up_room_key(&outbound, room_id, sender_key, 0).await;
        let session = machine
            .import_room_key_from_backup("1", room_id, &outbound.session_id(), room_key)
            .await
            .expect("A failing state store shouldn't prevent the import");

        assert_eq!(session.max_age(), None);
        assert_eq!(session.max_messages(), None);

        let stored = store
            .get_inbound_group_session(room_id, sender_key, &outbound.session_id())
            .await
            .unwrap()
            .expect("The imported session should be persisted");
        assert_eq!(stored.session_id(), outbound.session_id());

        let message = outbound.encrypt(b"Still readable");
        let decrypted = machine
            .decrypt_room_message(room_id, sender_key, &outbound.session_id(), &message)
            .await
            .unwrap();
        assert_eq!(decrypted.plaintext, b"Still readable");
    }

    #[tokio::test]
    async fn missing_room_key() {
        let machine = OlmMachine::new(user_id!("@alice:localhost"));
        let room_id = room_id!("!test:localhost");
        let mut outbound = GroupSession::new();
        let message = outbound.encrypt(b"Hello");

        assert_let!(
            Err(MegolmError::MissingRoomKey { room_id: missing_room, session_id }) = machine
                .decrypt_room_message(room_id, curve_key(), &outbound.session_id(), &message)
                .await
        );
        assert_eq!(missing_room, room_id);
        assert_eq!(session_id, outbound.session_id());
    }

    #[tokio::test]
    async fn imported_room_keys_are_announced() {
        let machine = OlmMachine::new(user_id!("@alice:localhost"));
        let room_id = room_id!("!test:localhost");
        let outbound = GroupSession::new();
        let sender_key = curve_key();

        let mut stream = Box::pin(machine.room_keys_received_stream());

        let room_key = backed_up_room_key(&outbound, room_id, sender_key, 0).await;
        machine
            .import_room_key_from_backup("1", room_id, &outbound.session_id(), room_key)
            .await
            .unwrap();

        let update = stream.next().await.unwrap();
        assert_eq!(update.len(), 1);
        assert_eq!(update[0].session_id, outbound.session_id());
        assert_eq!(update[0].sender_key, sender_key);
    }

    #[tokio::test]
    async fn waiting_for_a_room_key() {
        let machine = OlmMachine::new(user_id!("@alice:localhost"));
        let room_id = room_id!("!test:localhost");
        let outbound = GroupSession::new();
        let sender_key = curve_key();
        let session_id = outbound.session_id();

        assert!(!machine
            .wait_for_room_key(room_id, sender_key, &session_id, Duration::from_millis(10))
            .await
            .unwrap());

        let room_key = backed_up_room_key(&outbound, room_id, sender_key, 0).await;
        let importer = machine.clone();
        let import_session_id = session_id.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            importer
                .import_room_key_from_backup("1", room_id, &import_session_id, room_key)
                .await
                .unwrap();
        });

        assert!(machine
            .wait_for_room_key(room_id, sender_key, &session_id, Duration::from_secs(5))
            .await
            .unwrap());

        task.await.unwrap();

        // The key is known now, no waiting needed.
        assert!(machine
            .wait_for_room_key(room_id, sender_key, &session_id, Duration::ZERO)
            .await
            .unwrap());
    }
}
