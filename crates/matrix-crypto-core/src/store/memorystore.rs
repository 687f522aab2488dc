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

use std::{
    collections::{BTreeMap, HashMap},
    sync::RwLock as StdRwLock,
};

use async_trait::async_trait;
use ruma::{DeviceId, OwnedDeviceId, OwnedRoomId, OwnedUserId, RoomId, UserId};
use tokio::sync::Mutex;
use vodozemac::Curve25519PublicKey;

use super::{Changes, CryptoStore, Result, StateStore};
use crate::{
    identities::{CrossSigningPublicKeys, Device},
    megolm::{InboundGroupSession, PickledInboundGroupSession},
    olm::{PickledSession, RatchetConfig, Session},
    types::RoomEncryptionSettings,
};

/// Inbound group session pickles of a room, keyed by sender key and session
/// ID.
type RoomGroupSessions = HashMap<(String, String), String>;

/// An in-memory only store that will forget all the E2EE key once it's dropped.
///
/// Sessions are kept in their serialized pickled form, the same way a
/// persistent store would keep them, so every load hands out fresh copies.
#[derive(Default, Debug)]
pub struct MemoryStore {
    ratchet_config: RatchetConfig,

    // Map of sender_key to map of session_id to serialized pickle
    sessions: StdRwLock<BTreeMap<String, BTreeMap<String, String>>>,
    inbound_group_sessions: StdRwLock<BTreeMap<OwnedRoomId, RoomGroupSessions>>,
    devices: StdRwLock<HashMap<OwnedUserId, HashMap<OwnedDeviceId, Device>>>,
    cross_signing_keys: StdRwLock<Option<CrossSigningPublicKeys>>,
    backup_version: StdRwLock<Option<String>>,
    room_settings: StdRwLock<HashMap<OwnedRoomId, RoomEncryptionSettings>>,

    save_changes_lock: Mutex<()>,
}

impl MemoryStore {
    /// Create a new empty `MemoryStore`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new empty `MemoryStore` restoring Olm sessions with the given
    /// ratchet limits.
    pub fn with_ratchet_config(ratchet_config: RatchetConfig) -> Self {
        Self { ratchet_config, ..Default::default() }
    }

    /// Remember the encryption settings of a room.
    ///
    /// The state store is usually fed by the sync loop, tests and embedders
    /// without one set the settings here.
    pub fn save_room_settings(&self, room_id: &RoomId, settings: RoomEncryptionSettings) {
        self.room_settings
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(room_id.to_owned(), settings);
    }

    /// The number of inbound group sessions in the store.
    pub fn inbound_group_session_count(&self) -> usize {
        self.inbound_group_sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(HashMap::len)
            .sum()
    }

    fn save_sessions(&self, sessions: Vec<(String, PickledSession)>) -> Result<()> {
        let mut session_store = self.sessions.write().unwrap_or_else(|e| e.into_inner());

        for (session_id, pickle) in sessions {
            let entry = session_store.entry(pickle.sender_key.to_base64()).or_default();

            // insert or replace if exists
            entry.insert(session_id, serde_json::to_string(&pickle)?);
        }

        Ok(())
    }

    fn save_inbound_group_sessions(
        &self,
        sessions: Vec<(String, PickledInboundGroupSession)>,
    ) -> Result<()> {
        let mut session_store =
            self.inbound_group_sessions.write().unwrap_or_else(|e| e.into_inner());

        for (session_id, pickle) in sessions {
            let key = (pickle.sender_key.to_base64(), session_id);

            session_store
                .entry(pickle.room_id.clone())
                .or_default()
                .insert(key, serde_json::to_string(&pickle)?);
        }

        Ok(())
    }

    fn save_devices(&self, devices: Vec<Device>) {
        let mut device_store = self.devices.write().unwrap_or_else(|e| e.into_inner());

        for device in devices {
            device_store
                .entry(device.user_id().to_owned())
                .or_default()
                .insert(device.device_id().to_owned(), device);
        }
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl CryptoStore for MemoryStore {
    async fn save_changes(&self, changes: Changes) -> Result<()> {
        let _guard = self.save_changes_lock.lock().await;

        let mut pickled_sessions = Vec::with_capacity(changes.sessions.len());

        for session in changes.sessions {
            let session_id = session.session_id().to_owned();
            let pickle = session.pickle().await;
            pickled_sessions.push((session_id, pickle));
        }

        let mut pickled_group_sessions = Vec::with_capacity(changes.inbound_group_sessions.len());

        for session in changes.inbound_group_sessions {
            let session_id = session.session_id().to_owned();
            pickled_group_sessions.push((session_id, session.pickle().await));
        }

        self.save_sessions(pickled_sessions)?;
        self.save_inbound_group_sessions(pickled_group_sessions)?;
        self.save_devices(changes.devices);

        if let Some(keys) = changes.cross_signing_keys {
            *self.cross_signing_keys.write().unwrap_or_else(|e| e.into_inner()) = Some(keys);
        }

        if let Some(version) = changes.backup_version {
            *self.backup_version.write().unwrap_or_else(|e| e.into_inner()) = Some(version);
        }

        Ok(())
    }

    async fn get_sessions(&self, sender_key: &str) -> Result<Option<Vec<Session>>> {
        let pickles: Vec<PickledSession> = match self
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(sender_key)
        {
            Some(sessions) => sessions
                .values()
                .map(|pickle| serde_json::from_str(pickle))
                .collect::<std::result::Result<_, _>>()?,
            None => return Ok(None),
        };

        let sessions = pickles
            .into_iter()
            .map(|pickle| Session::from_pickle(pickle, self.ratchet_config))
            .collect::<std::result::Result<_, _>>()?;

        Ok(Some(sessions))
    }

    async fn get_inbound_group_session(
        &self,
        room_id: &RoomId,
        sender_key: Curve25519PublicKey,
        session_id: &str,
    ) -> Result<Option<InboundGroupSession>> {
        let pickle = self
            .inbound_group_sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(room_id)
            .and_then(|sessions| sessions.get(&(sender_key.to_base64(), session_id.to_owned())))
            .cloned();

        let Some(pickle) = pickle else { return Ok(None) };
        let pickle: PickledInboundGroupSession = serde_json::from_str(&pickle)?;

        Ok(Some(InboundGroupSession::from_pickle(pickle)?))
    }

    async fn get_inbound_group_sessions(&self) -> Result<Vec<InboundGroupSession>> {
        let pickles: Vec<String> = self
            .inbound_group_sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .flat_map(HashMap::values)
            .cloned()
            .collect();

        pickles
            .iter()
            .map(|pickle| -> Result<InboundGroupSession> {
                let pickle: PickledInboundGroupSession = serde_json::from_str(pickle)?;
                Ok(InboundGroupSession::from_pickle(pickle)?)
            })
            .collect()
    }

    async fn get_device(&self, user_id: &UserId, device_id: &DeviceId) -> Result<Option<Device>> {
        Ok(self
            .devices
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(user_id)
            .and_then(|devices| devices.get(device_id).cloned()))
    }

    async fn get_own_cross_signing_keys(&self) -> Result<Option<CrossSigningPublicKeys>> {
        Ok(self.cross_signing_keys.read().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn get_backup_version(&self) -> Result<Option<String>> {
        Ok(self.backup_version.read().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl StateStore for MemoryStore {
    async fn get_encryption_settings(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<RoomEncryptionSettings>> {
        Ok(self.room_settings.read().unwrap_or_else(|e| e.into_inner()).get(room_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_let;
    use ruma::{room_id, user_id};
    use vodozemac::{Curve25519PublicKey, Curve25519SecretKey, Ed25519Keypair};

    use super::MemoryStore;
    use crate::{
        identities::{testing::device_with_keys, CrossSigningPublicKeys, LocalTrust},
        megolm::{GroupSession, InboundGroupSession},
        olm::{session_pair, Session},
        store::{Changes, CryptoStore, StateStore},
        types::RoomEncryptionSettings,
    };

    #[tokio::test]
    async fn sessions_are_restored_from_their_pickle() {
        let (mut alice, mut bob) = session_pair();
        let message = alice.encrypt(b"It's a secret to everybody").unwrap();
        bob.decrypt(&message).unwrap();

        let sender_key = Curve25519PublicKey::from(&Curve25519SecretKey::new());
        let session = Session::new(sender_key, bob);

        let store = MemoryStore::new();
        let changes = Changes { sessions: vec![session.clone()], ..Default::default() };
        store.save_changes(changes).await.unwrap();

        let sessions = store.get_sessions(&sender_key.to_base64()).await.unwrap().unwrap();
        assert_eq!(sessions, vec![session]);

        let mut restored = sessions.into_iter().next().unwrap();
        let reply = restored.encrypt(b"Reply").await.unwrap();
        assert_eq!(alice.decrypt(&reply).unwrap(), b"Reply");

        assert!(store.get_sessions("unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn inbound_group_sessions_are_saved_and_loaded() {
        let room_id = room_id!("!test:localhost");
        let mut outbound = GroupSession::new();
        let sender_key = Curve25519PublicKey::from(&Curve25519SecretKey::new());
        let inbound = InboundGroupSession::new(
            sender_key,
            Ed25519Keypair::new().public_key(),
            room_id,
            &outbound.session_key(),
        );

        let store = MemoryStore::new();
        let changes =
            Changes { inbound_group_sessions: vec![inbound.clone()], ..Default::default() };
        store.save_changes(changes).await.unwrap();

        assert_eq!(store.inbound_group_session_count(), 1);

        let loaded = store
            .get_inbound_group_session(room_id, sender_key, &outbound.session_id())
            .await
            .unwrap()
            .unwrap();

        let message = outbound.encrypt(b"Hello");
        assert_eq!(loaded.decrypt(&message).await.unwrap().plaintext, b"Hello");

        let other_sender = Curve25519PublicKey::from(&Curve25519SecretKey::new());
        assert!(store
            .get_inbound_group_session(room_id, other_sender, &outbound.session_id())
            .await
            .unwrap()
            .is_none());

        assert_eq!(store.get_inbound_group_sessions().await.unwrap(), vec![inbound]);
    }

    #[tokio::test]
    async fn devices_keys_and_settings() {
        let (device, _) = device_with_keys("@alice:localhost", "ALICEDEVICE", LocalTrust::Verified);
        let master_key = Ed25519Keypair::new().public_key();
        let keys = CrossSigningPublicKeys::new(device.user_id().to_owned(), master_key);

        let store = MemoryStore::new();
        assert!(store.get_own_cross_signing_keys().await.unwrap().is_none());

        store
            .save_changes(Changes {
                devices: vec![device.clone()],
                cross_signing_keys: Some(keys.clone()),
                backup_version: Some("1".to_owned()),
                ..Default::default()
            })
            .await
            .unwrap();

        let loaded = store.get_device(device.user_id(), device.device_id()).await.unwrap();
        assert_let!(Some(loaded) = loaded);
        assert_eq!(loaded, device);
        assert!(loaded.is_verified());
        assert!(store
            .get_device(user_id!("@bob:localhost"), device.device_id())
            .await
            .unwrap()
            .is_none());

        assert_eq!(store.get_own_cross_signing_keys().await.unwrap(), Some(keys));
        assert_eq!(store.get_backup_version().await.unwrap().as_deref(), Some("1"));

        let room_id = room_id!("!test:localhost");
        assert!(store.get_encryption_settings(room_id).await.unwrap().is_none());

        let settings =
            RoomEncryptionSettings { rotation_period_msgs: Some(10), ..Default::default() };
        store.save_room_settings(room_id, settings.clone());
        assert_eq!(store.get_encryption_settings(room_id).await.unwrap(), Some(settings));
    }
}
