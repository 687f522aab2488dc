// Copyright 2024 The Matrix.org Foundation C.I.C.
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

use std::fmt;

use prost::Message;
use vodozemac::{base64_decode, base64_encode, Ed25519Signature};

use crate::{ciphers::TRUNCATED_MAC_SIZE, utilities::MessageDecodeError};

const VERSION: u8 = 3;
const SIGNATURE_LENGTH: usize = 64;

#[derive(Clone, PartialEq, Message)]
struct MegolmMessageBody {
    #[prost(uint32, optional, tag = "1")]
    message_index: Option<u32>,
    #[prost(bytes = "vec", optional, tag = "2")]
    ciphertext: Option<Vec<u8>>,
}

/// An encrypted Megolm room message.
///
/// The encoded form is the version byte, the message index and the
/// ciphertext as protobuf fields, an 8 byte MAC over all of that and finally
/// an Ed25519 signature over everything before it.
#[derive(Clone, PartialEq, Eq)]
pub struct MegolmMessage {
    message_index: u32,
    ciphertext: Vec<u8>,
    body: Vec<u8>,
    mac: [u8; TRUNCATED_MAC_SIZE],
    signature: Ed25519Signature,
}

impl fmt::Debug for MegolmMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MegolmMessage")
            .field("message_index", &self.message_index)
            .field("ciphertext_length", &self.ciphertext.len())
            .finish_non_exhaustive()
    }
}

impl MegolmMessage {
    pub(crate) fn encode_body(message_index: u32, ciphertext: &[u8]) -> Vec<u8> {
        let fields = MegolmMessageBody {
            message_index: Some(message_index),
            ciphertext: Some(ciphertext.to_vec()),
        };

        let mut body = vec![VERSION];
        body.extend(fields.encode_to_vec());

        body
    }

    pub(crate) fn new(
        message_index: u32,
        ciphertext: Vec<u8>,
        body: Vec<u8>,
        mac: [u8; TRUNCATED_MAC_SIZE],
        signature: Ed25519Signature,
    ) -> Self {
        Self { message_index, ciphertext, body, mac, signature }
    }

    /// The index of the ratchet that encrypted this message.
    pub fn message_index(&self) -> u32 {
        self.message_index
    }

    /// The encrypted payload.
    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    /// The signature of the session creator.
    pub fn signature(&self) -> &Ed25519Signature {
        &self.signature
    }

    pub(crate) fn mac_input(&self) -> &[u8] {
        &self.body
    }

    pub(crate) fn mac(&self) -> &[u8] {
        &self.mac
    }

    /// The bytes the signature covers, the body followed by the MAC.
    pub(crate) fn signed_bytes(&self) -> Vec<u8> {
        [self.body.as_slice(), self.mac.as_slice()].concat()
    }

    /// Decode a message from its binary form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessageDecodeError> {
        let minimal_length = 1 + TRUNCATED_MAC_SIZE + SIGNATURE_LENGTH;

        if bytes.len() < minimal_length {
            return Err(MessageDecodeError::MessageTooShort {
                expected: minimal_length,
                got: bytes.len(),
            });
        }

        if bytes[0] != VERSION {
            return Err(MessageDecodeError::UnsupportedVersion(bytes[0]));
        }

        let (rest, signature) = bytes.split_at(bytes.len() - SIGNATURE_LENGTH);
        let (body, mac) = rest.split_at(rest.len() - TRUNCATED_MAC_SIZE);

        let fields = MegolmMessageBody::decode(&body[1..])?;

        let signature = Ed25519Signature::from_slice(signature)
            .map_err(|_| MessageDecodeError::InvalidField("signature"))?;

        let mut mac_bytes = [0u8; TRUNCATED_MAC_SIZE];
        mac_bytes.copy_from_slice(mac);

        Ok(Self {
            message_index: fields
                .message_index
                .ok_or(MessageDecodeError::InvalidField("message_index"))?,
            ciphertext: fields.ciphertext.ok_or(MessageDecodeError::InvalidField("ciphertext"))?,
            body: body.to_vec(),
            mac: mac_bytes,
            signature,
        })
    }

    /// Encode the message into its binary form.
    pub fn to_bytes(&self) -> Vec<u8> {
        [self.body.as_slice(), self.mac.as_slice(), self.signature.to_bytes().as_slice()].concat()
    }

    /// Decode a message from unpadded base64.
    pub fn from_base64(message: &str) -> Result<Self, MessageDecodeError> {
        Self::from_bytes(&base64_decode(message)?)
    }

    /// Encode the message as unpadded base64.
    pub fn to_base64(&self) -> String {
        base64_encode(self.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::megolm::GroupSession;

    #[test]
    fn encoding_layout() {
        let mut session = GroupSession::new();
        let message = session.encrypt(b"Hello room");
        let bytes = message.to_bytes();

        assert_eq!(bytes[0], 3);
        assert_eq!(&bytes[1..3], &[0x08, 0x00]);
        assert_eq!(bytes[3], 0x12);
        assert_eq!(&bytes[bytes.len() - 64..], message.signature().to_bytes().as_slice());

        let decoded = MegolmMessage::from_base64(&message.to_base64()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn short_message_is_rejected() {
        assert_matches!(
            MegolmMessage::from_bytes(&[3; 40]),
            Err(MessageDecodeError::MessageTooShort { expected: 73, got: 40 })
        );
    }

    #[test]
    fn missing_message_index_is_rejected() {
        // Only an empty ciphertext field, followed by a zeroed MAC and signature.
        let mut bytes = vec![3u8, 0x12, 0];
        bytes.extend([0u8; TRUNCATED_MAC_SIZE + SIGNATURE_LENGTH]);

        assert_matches!(
            MegolmMessage::from_bytes(&bytes),
            Err(MessageDecodeError::InvalidField("message_index"))
        );
    }
}
