// Copyright 2022 The Matrix.org Foundation C.I.C.
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

use std::collections::BTreeMap;

use ruma::{DeviceKeyAlgorithm, EventEncryptionAlgorithm, OwnedRoomId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vodozemac::Curve25519PublicKey;

use super::{deserialize_curve_key, serialize_curve_key, Signatures};
use crate::megolm::ExportedSessionKey;

/// The name of the only backup algorithm we support.
pub const MEGOLM_BACKUP_V1: &str = "m.megolm_backup.v1.curve25519-aes-sha2";

/// Auth data for the `m.megolm_backup.v1.curve25519-aes-sha2` backup algorithm
/// as defined in the [spec].
///
/// [spec]: https://spec.matrix.org/unstable/client-server-api/#backup-algorithm-mmegolm_backupv1curve25519-aes-sha2
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MegolmV1AuthData {
    /// The Curve25519 public key used to encrypt the backups.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub public_key: Curve25519PublicKey,
    /// *Optional.* Signatures of the auth_data, as Signed JSON.
    #[serde(default)]
    pub signatures: Signatures,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

impl MegolmV1AuthData {
    /// Create a new [`MegolmV1AuthData`] from a public Curve25519 key and a
    /// [`Signatures`] map.
    pub fn new(public_key: Curve25519PublicKey, signatures: Signatures) -> Self {
        Self { public_key, signatures, extra: Default::default() }
    }
}

/// Information pertaining to a room key backup.
#[derive(Clone, Debug, Deserialize)]
#[serde(try_from = "BackupInfoHelper")]
pub enum RoomKeyBackupInfo {
    /// The `m.megolm_backup.v1.curve25519-aes-sha2` variant of a backup.
    MegolmBackupV1Curve25519AesSha2(MegolmV1AuthData),
    /// Any other unknown backup variant.
    Other {
        /// The algorithm of the unknown backup variant.
        algorithm: String,
        /// The auth data of the unknown backup variant.
        auth_data: BTreeMap<String, Value>,
    },
}

impl RoomKeyBackupInfo {
    /// The name of the algorithm of the backup.
    pub fn algorithm(&self) -> &str {
        match self {
            RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(_) => MEGOLM_BACKUP_V1,
            RoomKeyBackupInfo::Other { algorithm, .. } => algorithm,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct BackupInfoHelper {
    algorithm: String,
    auth_data: Value,
}

impl TryFrom<BackupInfoHelper> for RoomKeyBackupInfo {
    type Error = serde_json::Error;

    fn try_from(value: BackupInfoHelper) -> Result<Self, Self::Error> {
        Ok(match value.algorithm.as_str() {
            MEGOLM_BACKUP_V1 => {
                let data: MegolmV1AuthData = serde_json::from_value(value.auth_data)?;
                RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(data)
            }
            _ => RoomKeyBackupInfo::Other {
                algorithm: value.algorithm,
                auth_data: serde_json::from_value(value.auth_data)?,
            },
        })
    }
}

impl Serialize for RoomKeyBackupInfo {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let helper = match self {
            RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(d) => BackupInfoHelper {
                algorithm: MEGOLM_BACKUP_V1.to_owned(),
                auth_data: serde_json::to_value(d).map_err(serde::ser::Error::custom)?,
            },
            RoomKeyBackupInfo::Other { algorithm, auth_data } => BackupInfoHelper {
                algorithm: algorithm.to_owned(),
                auth_data: serde_json::to_value(auth_data).map_err(serde::ser::Error::custom)?,
            },
        };

        helper.serialize(serializer)
    }
}

/// A backup version as returned by the `GET /room_keys/version` endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyBackupVersion {
    /// The version of the backup.
    pub version: String,
    /// The algorithm and auth data of the backup.
    #[serde(flatten)]
    pub info: RoomKeyBackupInfo,
    /// The number of keys stored in the backup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    /// An opaque string representing the stored keys in the backup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

/// The content of a backup as returned by the `GET /room_keys/keys` endpoint.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RoomKeyBackupResponse {
    /// The backed up sessions, per room.
    pub rooms: BTreeMap<OwnedRoomId, RoomKeyBackup>,
}

/// The backed up sessions of a single room.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RoomKeyBackup {
    /// The backed up sessions, keyed by session ID.
    pub sessions: BTreeMap<String, KeyBackupData>,
}

/// A single backed up session, as stored on the server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyBackupData {
    /// The index of the first message in the session the key can decrypt.
    pub first_message_index: u32,
    /// The number of times this key has been forwarded via key-sharing
    /// between devices.
    pub forwarded_count: u32,
    /// Whether the device backing up the key verified the device that the key
    /// is from.
    pub is_verified: bool,
    /// The encrypted session.
    pub session_data: EncryptedSessionData,
}

/// The encrypted form of a [`BackedUpRoomKey`], using the
/// `m.megolm_backup.v1.curve25519-aes-sha2` algorithm.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptedSessionData {
    /// The unpadded base64 encoded ephemeral Curve25519 key.
    pub ephemeral: String,
    /// The unpadded base64 encoded ciphertext.
    pub ciphertext: String,
    /// The unpadded base64 encoded truncated MAC.
    pub mac: String,
}

/// The plaintext of a backed up session.
///
/// Unlike an exported room key, the room ID and session ID are implied by the
/// location of the key in the backup.
#[derive(Debug, Serialize, Deserialize)]
pub struct BackedUpRoomKey {
    /// The encryption algorithm that the session uses.
    pub algorithm: EventEncryptionAlgorithm,

    /// The Curve25519 key of the device which initiated the session originally.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub sender_key: Curve25519PublicKey,

    /// The key for the session.
    pub session_key: ExportedSessionKey,

    /// The Ed25519 key of the device which initiated the session originally.
    #[serde(default)]
    pub sender_claimed_keys: BTreeMap<DeviceKeyAlgorithm, String>,

    /// Chain of Curve25519 keys through which this session was forwarded, via
    /// m.forwarded_room_key events.
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,
}
