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

//! Types and traits to implement the storage layer for the [`OlmMachine`]
//!
//! The storage layer for the [`OlmMachine`] can be customized using a trait.
//! Implementing your own [`CryptoStore`] and [`StateStore`] lets sessions
//! and room keys outlive the process.
//!
//! An in-memory only store is provided as well:
//!
//! ```
//! # use std::sync::Arc;
//! # use matrix_crypto_core::{
//! #     OlmMachine,
//! #     store::MemoryStore,
//! # };
//! # use ruma::user_id;
//! # let user_id = user_id!("@example:localhost");
//! let store = Arc::new(MemoryStore::new());
//!
//! let machine = OlmMachine::with_store(user_id, store.clone(), store);
//! ```
//!
//! [`OlmMachine`]: crate::OlmMachine

pub mod caches;
mod crypto_store_wrapper;
mod error;
mod memorystore;
mod traits;

use std::{ops::Deref, sync::Arc};

pub(crate) use crypto_store_wrapper::CryptoStoreWrapper;
pub use error::{CryptoStoreError, Result};
pub use memorystore::MemoryStore;
use ruma::{EventEncryptionAlgorithm, OwnedRoomId, OwnedUserId, RoomId, UserId};
use serde::{Deserialize, Serialize};
pub use traits::{CryptoStore, IntoCryptoStore, StateStore};
use tracing::{error, instrument, warn};
use vodozemac::Curve25519PublicKey;

use crate::{
    error::SessionCreationError,
    identities::{CrossSigningPublicKeys, Device},
    megolm::InboundGroupSession,
    olm::Session,
    types::BackedUpRoomKey,
};

/// The store handle shared by the [`OlmMachine`] and the [`BackupMachine`].
///
/// Bundles the cached crypto store of our user with the store holding the
/// encryption settings of rooms.
///
/// [`OlmMachine`]: crate::OlmMachine
/// [`BackupMachine`]: crate::backups::BackupMachine
#[derive(Debug, Clone)]
pub(crate) struct Store {
    inner: Arc<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    user_id: OwnedUserId,
    store: CryptoStoreWrapper,
    state_store: Arc<dyn StateStore>,
}

impl Store {
    /// Create a new Store.
    pub(crate) fn new(
        user_id: OwnedUserId,
        store: impl IntoCryptoStore,
        state_store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            inner: StoreInner { user_id, store: CryptoStoreWrapper::new(store), state_store }
                .into(),
        }
    }

    /// The user ID of our own user.
    pub(crate) fn user_id(&self) -> &UserId {
        &self.inner.user_id
    }

    /// Turn a room key restored from a key backup into an inbound group
    /// session and persist it.
    ///
    /// The session key must produce the session ID the key was stored under
    /// in the backup, otherwise nothing is stored.
    ///
    /// # Arguments
    ///
    /// * `version` - The version of the backup the key was restored from.
    ///
    /// * `room_id` - The room the key was stored under.
    ///
    /// * `session_id` - The session ID the key was stored under.
    ///
    /// * `room_key` - The decrypted room key.
    #[instrument(skip(self, room_key))]
    pub(crate) async fn import_room_key_from_backup(
        &self,
        version: &str,
        room_id: &RoomId,
        session_id: &str,
        room_key: BackedUpRoomKey,
    ) -> std::result::Result<InboundGroupSession, SessionCreationError> {
        if room_key.algorithm != EventEncryptionAlgorithm::MegolmV1AesSha2 {
            return Err(SessionCreationError::UnsupportedAlgorithm(
                room_key.algorithm.to_string(),
            ));
        }

        let BackedUpRoomKey {
            sender_key,
            session_key,
            sender_claimed_keys,
            mut forwarding_curve25519_key_chain,
            ..
        } = room_key;

        let session =
            InboundGroupSession::import(sender_key, sender_claimed_keys, room_id, &session_key);

        if session.session_id() != session_id {
            warn!(
                actual_session_id = session.session_id(),
                "Mismatched session ID while creating inbound group session from key backup"
            );

            return Err(SessionCreationError::SessionIdMismatch {
                claimed: session_id.to_owned(),
                actual: session.session_id().to_owned(),
            });
        }

        let (max_age, max_messages) =
            match self.inner.state_store.get_encryption_settings(room_id).await {
                Ok(Some(settings)) => (settings.rotation_period(), settings.rotation_period_msgs),
                Ok(None) => (None, None),
                Err(e) => {
                    error!(error = ?e, "Failed to get encryption event for room");
                    (None, None)
                }
            };

        let first_known_index = session.first_known_index();

        if first_known_index > 0 {
            warn!(first_known_index, "Importing partial session");
        }

        forwarding_curve25519_key_chain.push(sender_key.to_base64());

        let session = session
            .with_forwarding_chain(forwarding_curve25519_key_chain)
            .with_rotation_limits(max_age, max_messages)
            .with_key_backup_version(version);

        self.save_changes(Changes {
            inbound_group_sessions: vec![session.clone()],
            ..Default::default()
        })
        .await?;

        Ok(session)
    }
}

impl Deref for Store {
    type Target = CryptoStoreWrapper;

    fn deref(&self) -> &Self::Target {
        &self.inner.store
    }
}

/// Aggregated changes to be saved in the database.
#[derive(Debug, Default)]
#[allow(missing_docs)]
pub struct Changes {
    pub sessions: Vec<Session>,
    pub inbound_group_sessions: Vec<InboundGroupSession>,
    pub devices: Vec<Device>,
    pub cross_signing_keys: Option<CrossSigningPublicKeys>,
    /// The version of the key backup we restored sessions from.
    pub backup_version: Option<String>,
}

impl Changes {
    /// Are there any changes stored or is this an empty `Changes` struct?
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
            && self.inbound_group_sessions.is_empty()
            && self.devices.is_empty()
            && self.cross_signing_keys.is_none()
            && self.backup_version.is_none()
    }
}

/// Information on a room key that has been received or imported.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct RoomKeyInfo {
    /// The [messaging algorithm] that this key is used for. Will be one of the
    /// `m.megolm.*` algorithms.
    ///
    /// [messaging algorithm]: https://spec.matrix.org/v1.6/client-server-api/#messaging-algorithms
    pub algorithm: EventEncryptionAlgorithm,

    /// The room where the key is used.
    pub room_id: OwnedRoomId,

    /// The Curve25519 key of the device which initiated the session originally.
    pub sender_key: Curve25519PublicKey,

    /// The ID of the session that the key is for.
    pub session_id: String,

    /// The lowest message index the key can decrypt.
    pub first_known_index: u32,
}

impl From<&InboundGroupSession> for RoomKeyInfo {
    fn from(group_session: &InboundGroupSession) -> Self {
        RoomKeyInfo {
            algorithm: group_session.algorithm().clone(),
            room_id: group_session.room_id().to_owned(),
            sender_key: group_session.sender_key(),
            session_id: group_session.session_id().to_owned(),
            first_known_index: group_session.first_known_index(),
        }
    }
}
