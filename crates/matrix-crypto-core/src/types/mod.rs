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

//! Module containing customized types modeling Matrix keys and the key backup
//! API.
//!
//! The types use vodozemac types where possible, so we directly deserialize
//! into a vodozemac curve25519 or ed25519 key, and they support lossless
//! serialization cycles in a canonical JSON supported way, which is needed to
//! check the signatures of the objects.

mod backup;

use std::{collections::BTreeMap, time::Duration};

pub use backup::*;
use ruma::{DeviceKeyAlgorithm, EventEncryptionAlgorithm, OwnedDeviceKeyId, OwnedUserId, UserId};
use serde::{Deserialize, Serialize, Serializer};
use vodozemac::{Curve25519PublicKey, Ed25519Signature};

/// An enum over all the signature types.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Signature {
    /// A Ed25519 digital signature.
    Ed25519(Ed25519Signature),
    /// An unknown digital signature as a base64 encoded string.
    Other(String),
    /// An invalid signature that could not be decoded, left unmodified as a
    /// string.
    Invalid(String),
}

impl Signature {
    /// Convert the signature to a base64 encoded string.
    pub fn to_base64(&self) -> String {
        match self {
            Signature::Ed25519(s) => s.to_base64(),
            Signature::Other(s) | Signature::Invalid(s) => s.to_owned(),
        }
    }
}

impl From<Ed25519Signature> for Signature {
    fn from(signature: Ed25519Signature) -> Self {
        Self::Ed25519(signature)
    }
}

/// Signatures for a signed object.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Signatures(BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceKeyId, Signature>>);

impl Signatures {
    /// Create a new, empty, signatures collection.
    pub fn new() -> Self {
        Signatures(Default::default())
    }

    /// Add the given signature from the given signer and the given key_id to
    /// the collection.
    pub fn add_signature(
        &mut self,
        signer: OwnedUserId,
        key_id: OwnedDeviceKeyId,
        signature: Ed25519Signature,
    ) -> Option<Signature> {
        self.0.entry(signer).or_default().insert(key_id, signature.into())
    }

    /// Get the map of signatures that belong to the given user.
    pub fn get(&self, signer: &UserId) -> Option<&BTreeMap<OwnedDeviceKeyId, Signature>> {
        self.0.get(signer)
    }

    /// Do we hold any signatures or is our collection completely empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for Signatures {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let map: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceKeyId, String>> =
            Deserialize::deserialize(deserializer)?;

        let map = map
            .into_iter()
            .map(|(user, signatures)| {
                let signatures = signatures
                    .into_iter()
                    .map(|(key_id, s)| {
                        let signature = match key_id.algorithm() {
                            DeviceKeyAlgorithm::Ed25519 => Ed25519Signature::from_base64(&s)
                                .map(Signature::from)
                                .unwrap_or(Signature::Invalid(s)),
                            _ => Signature::Other(s),
                        };

                        (key_id, signature)
                    })
                    .collect();

                (user, signatures)
            })
            .collect();

        Ok(Signatures(map))
    }
}

impl Serialize for Signatures {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let signatures: BTreeMap<&OwnedUserId, BTreeMap<&OwnedDeviceKeyId, String>> = self
            .0
            .iter()
            .map(|(u, m)| (u, m.iter().map(|(d, s)| (d, s.to_base64())).collect()))
            .collect();

        Serialize::serialize(&signatures, serializer)
    }
}

/// The encryption settings of a room, as found in its `m.room.encryption`
/// state event.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct RoomEncryptionSettings {
    /// The encryption algorithm used in the room.
    pub algorithm: EventEncryptionAlgorithm,
    /// How long a Megolm session should be used before changing it, in
    /// milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_period_ms: Option<u64>,
    /// How many messages should be sent before changing the Megolm session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_period_msgs: Option<u64>,
}

impl RoomEncryptionSettings {
    /// The rotation period as a duration.
    pub fn rotation_period(&self) -> Option<Duration> {
        self.rotation_period_ms.map(Duration::from_millis)
    }
}

impl Default for RoomEncryptionSettings {
    fn default() -> Self {
        Self {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            rotation_period_ms: None,
            rotation_period_msgs: None,
        }
    }
}

// Vodozemac serializes curve keys directly as a byteslice, while matrix likes
// to base64 encode all byte slices.
//
// This ensures that we serialize/deserialize in a Matrix compatible way.
pub(crate) fn deserialize_curve_key<'de, D>(de: D) -> Result<Curve25519PublicKey, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let key: String = Deserialize::deserialize(de)?;
    Curve25519PublicKey::from_base64(&key).map_err(serde::de::Error::custom)
}

pub(crate) fn serialize_curve_key<S>(key: &Curve25519PublicKey, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let key = key.to_base64();
    s.serialize_str(&key)
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, user_id, DeviceKeyId};
    use serde_json::json;
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn signatures_keep_unknown_and_invalid_entries() {
        let json = json!({
            "@alice:example.org": {
                "ed25519:DEVICE": "not a signature",
                "curve25519:DEVICE": "c29tZXRoaW5n",
            }
        });

        let signatures: Signatures = serde_json::from_value(json.clone()).unwrap();
        let user_signatures = signatures.get(user_id!("@alice:example.org")).unwrap();

        let ed25519 = DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, device_id!("DEVICE"));
        assert_eq!(
            user_signatures.get(&ed25519),
            Some(&Signature::Invalid("not a signature".to_owned()))
        );

        assert_eq!(serde_json::to_value(&signatures).unwrap(), json);
    }

    #[test]
    fn room_encryption_settings() {
        let settings: RoomEncryptionSettings = serde_json::from_value(json!({
            "algorithm": "m.megolm.v1.aes-sha2",
            "rotation_period_ms": 604800000,
            "rotation_period_msgs": 100,
        }))
        .unwrap();

        assert_eq!(settings.algorithm, EventEncryptionAlgorithm::MegolmV1AesSha2);
        assert_eq!(settings.rotation_period(), Some(Duration::from_secs(7 * 24 * 60 * 60)));
        assert_eq!(settings.rotation_period_msgs, Some(100));
        assert_eq!(RoomEncryptionSettings::default().rotation_period(), None);
    }
}
