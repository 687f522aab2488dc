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

use aes::{
    cipher::{generic_array::GenericArray, IvSizeUser, KeySizeUser},
    Aes256,
};
use cbc::cipher::{
    block_padding::{Pkcs7, UnpadError},
    BlockDecryptMut, BlockEncryptMut, KeyIvInit,
};
use hkdf::Hkdf;
use hmac::{digest::MacError, Hmac, Mac as _};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub(crate) const IV_SIZE: usize = 16;
pub(crate) const KEY_SIZE: usize = 32;
pub(crate) const MAC_SIZE: usize = 32;
/// The length of the MAC tags our messages carry, the HMAC-SHA-256 output is
/// truncated to this many bytes.
pub(crate) const TRUNCATED_MAC_SIZE: usize = 8;

/// HKDF info used to expand Olm message keys.
pub(crate) const OLM_KEYS_INFO: &[u8] = b"OLM_KEYS";
/// HKDF info used to expand a Megolm ratchet into message keys.
pub(crate) const MEGOLM_KEYS_INFO: &[u8] = b"MEGOLM_KEYS";
/// HKDF info used to expand the shared secret of a backed up room key.
pub(crate) const BACKUP_KEYS_INFO: &[u8] = b"";

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

type Aes256Key = GenericArray<u8, <Aes256CbcEnc as KeySizeUser>::KeySize>;
type Aes256Iv = GenericArray<u8, <Aes256CbcEnc as IvSizeUser>::IvSize>;

/// Compute a HMAC-SHA-256 over `message`.
pub(crate) fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; MAC_SIZE] {
    let mut hmac =
        Hmac::<Sha256>::new_from_slice(key).expect("HMAC can be initialized with any key length");
    hmac.update(message);

    let mut mac = [0u8; MAC_SIZE];
    mac.copy_from_slice(&hmac.finalize().into_bytes());

    mac
}

/// Keys used for our combination of AES-CBC-256 and HMAC-SHA-256.
///
/// ⚠️  This struct provides low-level cryptographic primitives.
///
/// The keys are all derived from a single secret using HKDF-SHA-256, the
/// secret gets expanded into 80 bytes:
///
/// * bytes 0 to 31 are the AES-256 key,
/// * bytes 32 to 63 are the HMAC-SHA-256 key,
/// * bytes 64 to 79 are the AES-CBC initialization vector.
///
/// This combination is, as of now, used in the following places:
///
/// 1. Olm message encryption, the secret is the message key.
/// 2. Megolm message encryption, the secret is the ratchet state.
/// 3. `m.megolm_backup.v1.curve25519-aes-sha2` key backups, the secret is
///    the output of an ephemeral Diffie-Hellman exchange.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct AesHmacSha2Key {
    aes_key: Box<[u8; KEY_SIZE]>,
    mac_key: Box<[u8; KEY_SIZE]>,
    iv: Box<[u8; IV_SIZE]>,
}

impl AesHmacSha2Key {
    /// Expand the given secret into a [`AesHmacSha2Key`].
    pub(crate) fn from_secret(secret: &[u8], info: &[u8]) -> Self {
        let mut expanded_keys = Box::new([0u8; KEY_SIZE * 2 + IV_SIZE]);

        Hkdf::<Sha256>::new(None, secret)
            .expand(info, expanded_keys.as_mut_slice())
            .expect("We should be able to expand the secret into 80 bytes of key material");

        let mut aes_key = Box::new([0u8; KEY_SIZE]);
        let mut mac_key = Box::new([0u8; KEY_SIZE]);
        let mut iv = Box::new([0u8; IV_SIZE]);

        aes_key.copy_from_slice(&expanded_keys[0..32]);
        mac_key.copy_from_slice(&expanded_keys[32..64]);
        iv.copy_from_slice(&expanded_keys[64..80]);

        expanded_keys.zeroize();

        Self { aes_key, mac_key, iv }
    }

    /// Encrypt the given plaintext and return the ciphertext.
    ///
    /// ⚠️  This method is a low-level cryptographic primitive.
    ///
    /// The method does not provide authenticity. You *must* call the
    /// [`AesHmacSha2Key::create_truncated_mac()`] method after the encryption
    /// step to create an authentication tag.
    pub(crate) fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        Aes256CbcEnc::new(self.aes_key(), self.iv()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
    }

    /// Create a truncated authentication tag for the given message.
    pub(crate) fn create_truncated_mac(&self, message: &[u8]) -> [u8; TRUNCATED_MAC_SIZE] {
        let mac = hmac_sha256(self.mac_key.as_slice(), message);

        let mut truncated = [0u8; TRUNCATED_MAC_SIZE];
        truncated.copy_from_slice(&mac[..TRUNCATED_MAC_SIZE]);

        truncated
    }

    /// Verify a truncated authentication tag for the given message.
    ///
    /// The comparison happens in constant time. This method *must* be called
    /// before a call to [`AesHmacSha2Key::decrypt()`].
    pub(crate) fn verify_truncated_mac(&self, message: &[u8], tag: &[u8]) -> Result<(), MacError> {
        if tag.len() != TRUNCATED_MAC_SIZE {
            return Err(MacError);
        }

        let mut hmac = Hmac::<Sha256>::new_from_slice(self.mac_key.as_slice())
            .expect("We should be able to create a new HMAC object from our 32 byte MAC key");
        hmac.update(message);

        hmac.verify_truncated_left(tag)
    }

    /// Decrypt the given ciphertext and return the decrypted plaintext.
    ///
    /// The method does not provide authenticity. You *must* call the
    /// [`AesHmacSha2Key::verify_truncated_mac()`] method before the decryption
    /// step to verify the authentication tag.
    pub(crate) fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, UnpadError> {
        Aes256CbcDec::new(self.aes_key(), self.iv()).decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
    }

    fn aes_key(&self) -> &Aes256Key {
        Aes256Key::from_slice(self.aes_key.as_slice())
    }

    fn iv(&self) -> &Aes256Iv {
        Aes256Iv::from_slice(self.iv.as_slice())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encryption_roundtrip() {
        let plaintext = "It's a secret to everybody";
        let key = AesHmacSha2Key::from_secret(&[7u8; 32], OLM_KEYS_INFO);

        let ciphertext = key.encrypt(plaintext.as_bytes());
        let mac = key.create_truncated_mac(&ciphertext);

        assert_eq!(ciphertext.len() % 16, 0, "AES-CBC output should be padded to the block size");

        key.verify_truncated_mac(&ciphertext, &mac)
            .expect("The MAC tag should be successfully verified");
        let decrypted = key.decrypt(&ciphertext).unwrap();

        assert_eq!(
            plaintext.as_bytes(),
            decrypted,
            "An encryption roundtrip should produce the same plaintext"
        );
    }

    #[test]
    fn info_separates_the_keys() {
        let olm = AesHmacSha2Key::from_secret(&[1u8; 32], OLM_KEYS_INFO);
        let megolm = AesHmacSha2Key::from_secret(&[1u8; 32], MEGOLM_KEYS_INFO);

        let ciphertext = olm.encrypt(b"hello");
        let mac = olm.create_truncated_mac(&ciphertext);

        assert!(megolm.verify_truncated_mac(&ciphertext, &mac).is_err());
    }

    #[test]
    fn tampered_or_short_tags_are_rejected() {
        let key = AesHmacSha2Key::from_secret(&[3u8; 32], BACKUP_KEYS_INFO);
        let mut mac = key.create_truncated_mac(b"");

        assert!(key.verify_truncated_mac(b"", &mac[..4]).is_err());

        mac[0] ^= 1;
        assert!(key.verify_truncated_mac(b"", &mac).is_err());
    }
}
