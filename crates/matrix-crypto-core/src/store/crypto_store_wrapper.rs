// Copyright 2023 The Matrix.org Foundation C.I.C.
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

use std::{ops::Deref, sync::Arc};

use ruma::RoomId;
use tokio::sync::{broadcast, Mutex};
use tokio_stream::{
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
    Stream,
};
use tracing::debug;
use vodozemac::Curve25519PublicKey;

use super::{
    caches::{GroupSessionStore, SessionStore},
    Changes, CryptoStore, IntoCryptoStore, Result, RoomKeyInfo,
};
use crate::{megolm::InboundGroupSession, olm::Session};

/// A wrapper for crypto store implementations that adds caches and update
/// notifiers.
#[derive(Debug)]
pub(crate) struct CryptoStoreWrapper {
    store: Arc<dyn CryptoStore>,

    /// A cache for the Olm Sessions.
    sessions: SessionStore,

    /// A cache for the inbound group sessions, so the ratchet state of a
    /// session is shared between concurrent decryptions.
    group_sessions: GroupSessionStore,

    /// The sender side of a broadcast stream that is notified whenever we get
    /// an update to an inbound group session.
    room_keys_received_sender: broadcast::Sender<Vec<RoomKeyInfo>>,
}

impl CryptoStoreWrapper {
    pub(crate) fn new(store: impl IntoCryptoStore) -> Self {
        let (room_keys_received_sender, _) = broadcast::channel(10);

        Self {
            store: store.into_crypto_store(),
            sessions: SessionStore::new(),
            group_sessions: GroupSessionStore::new(),
            room_keys_received_sender,
        }
    }

    /// Save the set of changes to the store.
    ///
    /// Also responsible for sending updates to the `room_keys_received`
    /// stream, listeners only hear about sessions once they are persisted.
    ///
    /// # Arguments
    ///
    /// * `changes` - The set of changes that should be stored.
    pub async fn save_changes(&self, changes: Changes) -> Result<()> {
        let room_key_updates: Vec<_> =
            changes.inbound_group_sessions.iter().map(RoomKeyInfo::from).collect();

        let sessions = changes.sessions.clone();
        let group_sessions = changes.inbound_group_sessions.clone();

        self.store.save_changes(changes).await?;

        for session in sessions {
            self.sessions.add(session).await;
        }

        for session in group_sessions {
            self.group_sessions.add(session);
        }

        if !room_key_updates.is_empty() {
            debug!(count = room_key_updates.len(), "Stored new room keys");

            // Ignore the result. It can only fail if there are no listeners.
            let _ = self.room_keys_received_sender.send(room_key_updates);
        }

        Ok(())
    }

    /// Get the Olm sessions shared with the device owning the given sender
    /// key, loading them from the store on the first access.
    pub async fn get_sessions(&self, sender_key: &str) -> Result<Arc<Mutex<Vec<Session>>>> {
        if let Some(sessions) = self.sessions.get(sender_key) {
            return Ok(sessions);
        }

        let sessions = self.store.get_sessions(sender_key).await?.unwrap_or_default();

        Ok(self.sessions.get_or_insert(sender_key, sessions))
    }

    /// Get an inbound group session, loading it from the store if it isn't
    /// cached yet.
    pub async fn get_inbound_group_session(
        &self,
        room_id: &RoomId,
        sender_key: Curve25519PublicKey,
        session_id: &str,
    ) -> Result<Option<InboundGroupSession>> {
        if let Some(session) = self.group_sessions.get(room_id, &sender_key.to_base64(), session_id)
        {
            return Ok(Some(session));
        }

        let session = self.store.get_inbound_group_session(room_id, sender_key, session_id).await?;

        if let Some(session) = &session {
            self.group_sessions.add(session.clone());
        }

        Ok(session)
    }

    /// Receive notifications of room keys being received as a [`Stream`].
    ///
    /// Each time a room key is updated in any way, an update will be sent to
    /// the stream. Updates that happen at the same time are batched into a
    /// [`Vec`].
    ///
    /// If the reader of the stream lags too far behind an error will be sent to
    /// the reader.
    pub fn room_keys_received_stream(
        &self,
    ) -> impl Stream<Item = Result<Vec<RoomKeyInfo>, BroadcastStreamRecvError>> {
        BroadcastStream::new(self.room_keys_received_sender.subscribe())
    }
}

impl Deref for CryptoStoreWrapper {
    type Target = dyn CryptoStore;

    fn deref(&self) -> &Self::Target {
        self.store.deref()
    }
}

#[cfg(test)]
mod tests {
    use std::{pin::pin, sync::Arc};

    use futures_util::StreamExt;
    use ruma::room_id;
    use vodozemac::{Curve25519PublicKey, Curve25519SecretKey, Ed25519Keypair};

    use super::CryptoStoreWrapper;
    use crate::{
        megolm::{GroupSession, InboundGroupSession},
        olm::{session_pair, Session},
        store::{Changes, CryptoStore, MemoryStore},
    };

    #[tokio::test]
    async fn room_keys_are_broadcast_after_saving() {
        let store = Arc::new(MemoryStore::new());
        let wrapper = CryptoStoreWrapper::new(store.clone());
        let mut stream = pin!(wrapper.room_keys_received_stream());

        let room_id = room_id!("!test:localhost");
        let outbound = GroupSession::new();
        let sender_key = Curve25519PublicKey::from(&Curve25519SecretKey::new());
        let session = InboundGroupSession::new(
            sender_key,
            Ed25519Keypair::new().public_key(),
            room_id,
            &outbound.session_key(),
        );

        wrapper
            .save_changes(Changes { inbound_group_sessions: vec![session], ..Default::default() })
            .await
            .unwrap();

        let update = stream.next().await.unwrap().unwrap();
        assert_eq!(update.len(), 1);
        assert_eq!(update[0].room_id, room_id);
        assert_eq!(update[0].session_id, outbound.session_id());
        assert_eq!(update[0].sender_key, sender_key);
        assert_eq!(update[0].first_known_index, 0);

        assert_eq!(store.inbound_group_session_count(), 1);
        assert!(wrapper
            .get_inbound_group_session(room_id, sender_key, &outbound.session_id())
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn sessions_are_loaded_once_and_cached() {
        let store = Arc::new(MemoryStore::new());
        let (alice, _) = session_pair();
        let sender_key = Curve25519PublicKey::from(&Curve25519SecretKey::new());
        let session = Session::new(sender_key, alice);

        let changes = Changes { sessions: vec![session], ..Default::default() };
        store.save_changes(changes).await.unwrap();

        let wrapper = CryptoStoreWrapper::new(store);
        let first = wrapper.get_sessions(&sender_key.to_base64()).await.unwrap();
        let second = wrapper.get_sessions(&sender_key.to_base64()).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.lock().await.len(), 1);

        let unknown = wrapper.get_sessions("unknown").await.unwrap();
        assert!(unknown.lock().await.is_empty());
    }
}
