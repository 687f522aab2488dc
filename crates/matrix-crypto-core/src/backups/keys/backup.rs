// Copyright 2021 The Matrix.org Foundation C.I.C.
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

use vodozemac::{base64_encode, Curve25519PublicKey, Curve25519SecretKey, KeyError};
use zeroize::Zeroizing;

use crate::{
    ciphers::{AesHmacSha2Key, BACKUP_KEYS_INFO},
    megolm::InboundGroupSession,
    types::{BackedUpRoomKey, EncryptedSessionData, KeyBackupData, MEGOLM_BACKUP_V1},
};

/// The public part of a backup key.
#[derive(Clone)]
pub struct MegolmV1BackupKey {
    key: Curve25519PublicKey,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for MegolmV1BackupKey {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("MegolmV1BackupKey")
            .field("key", &self.to_base64())
            .finish()
    }
}

impl MegolmV1BackupKey {
    pub(super) fn new(key: Curve25519PublicKey) -> Self {
        Self { key }
    }

    /// Get the full name of the backup algorithm this backup key supports.
    pub fn backup_algorithm(&self) -> &str {
        MEGOLM_BACKUP_V1
    }

    /// Try to create a new `MegolmV1BackupKey` from a base 64 encoded string.
    pub fn from_base64(public_key: &str) -> Result<Self, KeyError> {
        Ok(Self::new(Curve25519PublicKey::from_base64(public_key)?))
    }

    /// Convert the [`MegolmV1BackupKey`] to a base 64 encoded string.
    pub fn to_base64(&self) -> String {
        self.key.to_base64()
    }

    /// The Curve25519 public key room keys get encrypted for.
    pub fn public_key(&self) -> Curve25519PublicKey {
        self.key
    }

    /// Encrypt the given inbound group session so it can be uploaded to the
    /// backup.
    ///
    /// The session is exported at its first known index.
    pub async fn encrypt(
        &self,
        session: &InboundGroupSession,
    ) -> Result<KeyBackupData, serde_json::Error> {
        // The forwarding chains don't mean much, we only care whether we received the
        // session directly from the creator of the session or not.
        let forwarded_count = session.has_been_imported() as u32;
        let first_message_index = session.first_known_index();

        // Convert our key to the backup representation.
        let key = BackedUpRoomKey {
            algorithm: session.algorithm().clone(),
            sender_key: session.sender_key(),
            session_key: session.export().await,
            sender_claimed_keys: session.sender_claimed_keys().clone(),
            forwarding_curve25519_key_chain: session.forwarding_chain().to_vec(),
        };

        let plaintext = Zeroizing::new(serde_json::to_vec(&key)?);

        let ephemeral_key = Curve25519SecretKey::new();
        let shared_secret = ephemeral_key.diffie_hellman(&self.key);
        let keys = AesHmacSha2Key::from_secret(shared_secret.as_bytes(), BACKUP_KEYS_INFO);

        let ciphertext = keys.encrypt(&plaintext);
        let mac = keys.create_truncated_mac(b"");

        Ok(KeyBackupData {
            first_message_index,
            forwarded_count,
            is_verified: false,
            session_data: EncryptedSessionData {
                ephemeral: Curve25519PublicKey::from(&ephemeral_key).to_base64(),
                ciphertext: base64_encode(ciphertext),
                mac: base64_encode(mac),
            },
        })
    }
}
