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

use std::fmt;

use thiserror::Error;
use vodozemac::{base64_decode, base64_encode, Curve25519PublicKey, Curve25519SecretKey};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::MegolmV1BackupKey;
use crate::{
    ciphers::{AesHmacSha2Key, BACKUP_KEYS_INFO},
    types::{BackedUpRoomKey, EncryptedSessionData},
};

/// Error type for the decoding of a [`BackupDecryptionKey`].
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The decoded recovery key has an invalid prefix.
    #[error("The decoded recovery key has an invalid prefix: expected {0:?}, got {1:?}")]
    Prefix([u8; 2], [u8; 2]),
    /// The parity byte of the recovery key didn't match.
    #[error("The parity byte of the recovery key doesn't match: expected {0:?}, got {1:?}")]
    Parity(u8, u8),
    /// The recovery key has an invalid length.
    #[error("The decoded recovery key has a invalid length: expected {0}, got {1}")]
    Length(usize, usize),
    /// The recovery key isn't valid base58.
    #[error(transparent)]
    Base58(#[from] bs58::decode::Error),
    /// The recovery key isn't valid base64.
    #[error(transparent)]
    Base64(#[from] vodozemac::Base64DecodeError),
}

/// Error type for the decryption of a backed up room key.
#[derive(Debug, Error)]
pub enum DecryptionError {
    /// One of the fields of the encrypted session data isn't valid base64.
    #[error(transparent)]
    Base64(#[from] vodozemac::Base64DecodeError),
    /// The ephemeral key of the encrypted session data isn't a valid
    /// Curve25519 key.
    #[error(transparent)]
    EphemeralKey(#[from] vodozemac::KeyError),
    /// The MAC of the encrypted session data didn't match.
    #[error("The MAC of the backed up room key doesn't match")]
    Mac,
    /// The decrypted room key had invalid padding.
    #[error("The backed up room key has invalid padding")]
    Padding,
    /// The decrypted room key couldn't be deserialized.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// The private part of a backup key.
///
/// The private part of the key is not used on a regular basis. Rather, it is
/// used only when we need to *recover* the backup, usually by the user typing
/// in the recovery key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct BackupDecryptionKey {
    pub(crate) inner: Box<[u8; BackupDecryptionKey::KEY_SIZE]>,
}

impl BackupDecryptionKey {
    /// The number of bytes the decryption key will hold.
    pub const KEY_SIZE: usize = 32;

    const PREFIX: [u8; 2] = [0x8b, 0x01];
    const PREFIX_PARITY: u8 = Self::PREFIX[0] ^ Self::PREFIX[1];
    const DISPLAY_CHUNK_SIZE: usize = 4;

    fn parity_byte(bytes: &[u8]) -> u8 {
        bytes.iter().fold(Self::PREFIX_PARITY, |acc, x| acc ^ x)
    }

    /// Create a new random decryption key.
    pub fn new() -> Result<Self, rand::Error> {
        let mut rng = rand::thread_rng();

        let mut key = Box::new([0u8; Self::KEY_SIZE]);
        rand::Fill::try_fill(key.as_mut_slice(), &mut rng)?;

        Ok(Self { inner: key })
    }

    /// Create a decryption key from its raw bytes.
    pub fn from_bytes(key: &[u8; Self::KEY_SIZE]) -> Self {
        Self { inner: Box::new(*key) }
    }

    /// Try to create a [`BackupDecryptionKey`] from a base64 export.
    pub fn from_base64(key: &str) -> Result<Self, DecodeError> {
        let decoded = Zeroizing::new(base64_decode(key)?);

        if decoded.len() != Self::KEY_SIZE {
            Err(DecodeError::Length(Self::KEY_SIZE, decoded.len()))
        } else {
            let mut key = Box::new([0u8; Self::KEY_SIZE]);
            key.copy_from_slice(&decoded);

            Ok(Self { inner: key })
        }
    }

    /// Export the [`BackupDecryptionKey`] as a base64 encoded string.
    pub fn to_base64(&self) -> String {
        base64_encode(self.inner.as_slice())
    }

    /// Try to create a [`BackupDecryptionKey`] from a base58 encoded recovery
    /// key, the form users get to write down.
    ///
    /// Whitespace is ignored, so the chunked display form is accepted as well.
    pub fn from_base58(value: &str) -> Result<Self, DecodeError> {
        // Remove any whitespace we might have
        let value: Zeroizing<String> =
            Zeroizing::new(value.chars().filter(|c| !c.is_whitespace()).collect());

        let decoded = Zeroizing::new(
            bs58::decode(value.as_bytes()).with_alphabet(bs58::Alphabet::BITCOIN).into_vec()?,
        );

        let expected_length = Self::PREFIX.len() + Self::KEY_SIZE + 1;

        if decoded.len() != expected_length {
            return Err(DecodeError::Length(expected_length, decoded.len()));
        }

        let (prefix, rest) = decoded.split_at(Self::PREFIX.len());
        let (key, parity) = rest.split_at(Self::KEY_SIZE);

        let expected_parity = parity[0];
        let computed_parity = Self::parity_byte(key);

        if prefix != Self::PREFIX {
            let mut found = [0u8; 2];
            found.copy_from_slice(prefix);

            Err(DecodeError::Prefix(Self::PREFIX, found))
        } else if expected_parity != computed_parity {
            Err(DecodeError::Parity(expected_parity, computed_parity))
        } else {
            let mut inner = Box::new([0u8; Self::KEY_SIZE]);
            inner.copy_from_slice(key);

            Ok(Self { inner })
        }
    }

    /// Export the [`BackupDecryptionKey`] as a base58 encoded recovery key.
    pub fn to_base58(&self) -> String {
        let bytes = Zeroizing::new(
            [
                Self::PREFIX.as_ref(),
                self.inner.as_ref(),
                [Self::parity_byte(self.inner.as_ref())].as_ref(),
            ]
            .concat(),
        );

        bs58::encode(bytes.as_slice()).with_alphabet(bs58::Alphabet::BITCOIN).into_string()
    }

    /// The base58 recovery key split into groups of four characters, the way
    /// it is shown to users.
    pub fn to_display_string(&self) -> String {
        let string = Zeroizing::new(self.to_base58());

        string
            .as_bytes()
            .chunks(Self::DISPLAY_CHUNK_SIZE)
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn secret_key(&self) -> Curve25519SecretKey {
        Curve25519SecretKey::from_slice(&self.inner)
    }

    /// Get the public part of the backup key, this is the key that gets
    /// published in the `auth_data` of a backup version.
    pub fn public_key(&self) -> Curve25519PublicKey {
        Curve25519PublicKey::from(&self.secret_key())
    }

    /// Get the public part of the backup key as a [`MegolmV1BackupKey`], which
    /// can be used to encrypt room keys for the backup.
    pub fn megolm_v1_public_key(&self) -> MegolmV1BackupKey {
        MegolmV1BackupKey::new(self.public_key())
    }

    /// Decrypt the session data of a single backed up room key.
    ///
    /// The shared secret of the ephemeral key and our private key is expanded
    /// into the AES and MAC keys. The MAC is checked before anything gets
    /// decrypted.
    pub fn decrypt_session_data(
        &self,
        session_data: &EncryptedSessionData,
    ) -> Result<BackedUpRoomKey, DecryptionError> {
        let ephemeral_key = Curve25519PublicKey::from_base64(&session_data.ephemeral)?;
        let ciphertext = base64_decode(&session_data.ciphertext)?;
        let mac = base64_decode(&session_data.mac)?;

        let shared_secret = self.secret_key().diffie_hellman(&ephemeral_key);
        let keys = AesHmacSha2Key::from_secret(shared_secret.as_bytes(), BACKUP_KEYS_INFO);

        // The MAC of this backup format covers an empty message, not the
        // ciphertext.
        keys.verify_truncated_mac(b"", &mac).map_err(|_| DecryptionError::Mac)?;

        let plaintext =
            Zeroizing::new(keys.decrypt(&ciphertext).map_err(|_| DecryptionError::Padding)?);

        Ok(serde_json::from_slice(&plaintext)?)
    }
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for BackupDecryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BackupDecryptionKey").field(&"...").finish()
    }
}
