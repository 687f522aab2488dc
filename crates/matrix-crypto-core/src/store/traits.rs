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

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use ruma::{DeviceId, RoomId, UserId};
use vodozemac::Curve25519PublicKey;

use super::{Changes, Result};
use crate::{
    identities::{CrossSigningPublicKeys, Device},
    megolm::InboundGroupSession,
    olm::Session,
    types::RoomEncryptionSettings,
};

/// Represents a store that the `OlmMachine` uses to store E2EE data (such as
/// cryptographic keys).
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait CryptoStore: fmt::Debug + Send + Sync {
    /// Save the set of changes to the store.
    ///
    /// # Arguments
    ///
    /// * `changes` - The set of changes that should be stored.
    async fn save_changes(&self, changes: Changes) -> Result<()>;

    /// Get all the sessions that belong to the given sender key.
    ///
    /// # Arguments
    ///
    /// * `sender_key` - The sender key that was used to establish the sessions.
    async fn get_sessions(&self, sender_key: &str) -> Result<Option<Vec<Session>>>;

    /// Get the inbound group session from our store.
    ///
    /// # Arguments
    /// * `room_id` - The room id of the room that the session belongs to.
    ///
    /// * `sender_key` - The sender key that sent us the session.
    ///
    /// * `session_id` - The unique id of the session.
    async fn get_inbound_group_session(
        &self,
        room_id: &RoomId,
        sender_key: Curve25519PublicKey,
        session_id: &str,
    ) -> Result<Option<InboundGroupSession>>;

    /// Get all the inbound group sessions we have stored.
    async fn get_inbound_group_sessions(&self) -> Result<Vec<InboundGroupSession>>;

    /// Get the device for the given user with the given device ID.
    ///
    /// # Arguments
    ///
    /// * `user_id` - The user that the device belongs to.
    ///
    /// * `device_id` - The unique id of the device.
    async fn get_device(&self, user_id: &UserId, device_id: &DeviceId) -> Result<Option<Device>>;

    /// Get the public cross-signing keys of our own user, if we know them.
    async fn get_own_cross_signing_keys(&self) -> Result<Option<CrossSigningPublicKeys>>;

    /// Get the version of the key backup we last restored from.
    async fn get_backup_version(&self) -> Result<Option<String>>;
}

/// The part of the client state store the crypto layer reads from.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait StateStore: fmt::Debug + Send + Sync {
    /// Get the encryption settings of the given room, `None` if the room isn't
    /// encrypted or we don't know its `m.room.encryption` state event.
    async fn get_encryption_settings(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<RoomEncryptionSettings>>;
}

/// A type that can be type-erased into `Arc<dyn CryptoStore>`.
///
/// This trait is not meant to be implemented directly outside this crate, but
/// it is automatically implemented for everything that implements
/// `CryptoStore`.
pub trait IntoCryptoStore {
    #[doc(hidden)]
    fn into_crypto_store(self) -> Arc<dyn CryptoStore>;
}

impl<T> IntoCryptoStore for T
where
    T: CryptoStore + 'static,
{
    fn into_crypto_store(self) -> Arc<dyn CryptoStore> {
        Arc::new(self)
    }
}

impl<T> IntoCryptoStore for Arc<T>
where
    T: CryptoStore + 'static,
{
    fn into_crypto_store(self) -> Arc<dyn CryptoStore> {
        self
    }
}

impl IntoCryptoStore for Arc<dyn CryptoStore> {
    fn into_crypto_store(self) -> Arc<dyn CryptoStore> {
        self
    }
}
