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

use ruma::{CanonicalJsonValue, DeviceKeyAlgorithm, DeviceKeyId, UserId};
use serde_json::Value;
use vodozemac::{Ed25519Keypair, Ed25519PublicKey, Ed25519Signature};

use crate::error::SignatureError;

/// Turn a signed JSON object into the canonical string the signatures are
/// calculated over, the `signatures` and `unsigned` fields are left out.
fn to_signable_json(json: &Value) -> Result<String, SignatureError> {
    let mut json = json.clone();
    let json_object = json.as_object_mut().ok_or(SignatureError::NotAnObject)?;

    json_object.remove("signatures");
    json_object.remove("unsigned");

    let canonical_json = CanonicalJsonValue::try_from(json)?;

    Ok(canonical_json.to_string())
}

pub(crate) trait VerifyJson {
    /// Verify a signed JSON object.
    ///
    /// The object must have a signatures key associated with an object of the
    /// form `user_id: {key_id: signature}`.
    ///
    /// Returns Ok if the signature was successfully verified, otherwise an
    /// SignatureError.
    ///
    /// # Arguments
    ///
    /// * `user_id` - The user who signed the JSON object.
    ///
    /// * `key_id` - The id of the key that signed the JSON object.
    ///
    /// * `json` - The JSON object that should be verified.
    fn verify_json(
        &self,
        user_id: &UserId,
        key_id: &DeviceKeyId,
        json: &Value,
    ) -> Result<(), SignatureError>;
}

impl VerifyJson for Ed25519PublicKey {
    fn verify_json(
        &self,
        user_id: &UserId,
        key_id: &DeviceKeyId,
        json: &Value,
    ) -> Result<(), SignatureError> {
        if key_id.algorithm() != DeviceKeyAlgorithm::Ed25519 {
            return Err(SignatureError::UnsupportedAlgorithm);
        }

        let signature = json
            .get("signatures")
            .and_then(|s| s.get(user_id.as_str()))
            .and_then(|s| s.get(key_id.as_str()))
            .and_then(Value::as_str)
            .ok_or(SignatureError::NoSignatureFound)?;
        let signature =
            Ed25519Signature::from_base64(signature).map_err(|_| SignatureError::InvalidSignature)?;

        let canonical_json = to_signable_json(json)?;

        Ok(self.verify(canonical_json.as_bytes(), &signature)?)
    }
}

pub(crate) trait SignJson {
    /// Sign the canonical form of the given JSON object.
    fn sign_json(&self, json: &Value) -> Result<Ed25519Signature, SignatureError>;
}

impl SignJson for Ed25519Keypair {
    fn sign_json(&self, json: &Value) -> Result<Ed25519Signature, SignatureError> {
        let canonical_json = to_signable_json(json)?;
        Ok(self.sign(canonical_json.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use ruma::{device_id, user_id, DeviceKeyAlgorithm, DeviceKeyId};
    use serde_json::json;
    use vodozemac::{Ed25519Keypair, Ed25519PublicKey};

    use super::{SignJson, VerifyJson};
    use crate::error::SignatureError;

    #[test]
    fn device_keys_signature() {
        let device_keys = json!({
            "device_id": "GBEWHQOYGS",
            "algorithms": [
                "m.olm.v1.curve25519-aes-sha2",
                "m.megolm.v1.aes-sha2"
            ],
            "keys": {
                "curve25519:GBEWHQOYGS": "F8QhZ0Z1rjtWrQOblMDgZtEX5x1UrG7sZ2Kk3xliNAU",
                "ed25519:GBEWHQOYGS": "n469gw7zm+KW+JsFIJKnFVvCKU14HwQyocggcCIQgZY"
            },
            "signatures": {
                "@example:localhost": {
                    "ed25519:GBEWHQOYGS": "OlF2REsqjYdAfr04ONx8VS/5cB7KjrWYRlLF4eUm2foAiQL/RAfsjsa2JXZeoOHh6vEualZHbWlod49OewVqBg"
                }
            },
            "unsigned": {
                "device_display_name": "Weechat-Matrix-rs"
            },
            "user_id": "@example:localhost"
        });

        let signing_key =
            Ed25519PublicKey::from_base64("n469gw7zm+KW+JsFIJKnFVvCKU14HwQyocggcCIQgZY").unwrap();

        signing_key
            .verify_json(
                user_id!("@example:localhost"),
                &DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, device_id!("GBEWHQOYGS")),
                &device_keys,
            )
            .expect("Can't verify device keys");
    }

    #[test]
    fn signing_ignores_signatures_and_unsigned() {
        let keypair = Ed25519Keypair::new();
        let key_id = DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, device_id!("DEVICE"));

        let mut json = json!({ "public_key": "abc" });
        let signature = keypair.sign_json(&json).unwrap();

        json["signatures"] =
            json!({ "@alice:localhost": { key_id.as_str(): signature.to_base64() } });
        json["unsigned"] = json!({ "age": 10 });

        keypair.public_key().verify_json(user_id!("@alice:localhost"), &key_id, &json).unwrap();

        assert_matches!(
            keypair.public_key().verify_json(user_id!("@bob:localhost"), &key_id, &json),
            Err(SignatureError::NoSignatureFound)
        );

        json["public_key"] = "abd".into();
        assert_matches!(
            keypair.public_key().verify_json(user_id!("@alice:localhost"), &key_id, &json),
            Err(SignatureError::VerificationError(_))
        );
    }
}
