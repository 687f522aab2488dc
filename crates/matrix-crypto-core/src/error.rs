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

use ruma::{CanonicalJsonError, OwnedRoomId, OwnedUserId};
use thiserror::Error;
use vodozemac::Curve25519PublicKey;

use super::store::CryptoStoreError;
use crate::{megolm::SessionKeyDecodeError, utilities::MessageDecodeError};

/// Result type for device to device cryptographic operations.
pub type OlmResult<T> = Result<T, OlmError>;
/// Result type for group cryptographic operations.
pub type MegolmResult<T> = Result<T, MegolmError>;

/// Error representing a failure during a device to device cryptographic
/// operation.
#[derive(Error, Debug)]
pub enum OlmError {
    /// The Olm message couldn't be decoded.
    #[error(transparent)]
    Decode(#[from] MessageDecodeError),

    /// The message is for a chain index we have already moved past and we
    /// don't hold a skipped message key for it.
    #[error("the message with chain index {index} was already decrypted or its key was discarded")]
    ReplayOrUnknownMessage {
        /// The chain index of the message.
        index: u32,
    },

    /// The message would require us to skip over too many message keys.
    #[error("the message requires skipping {skipped} message keys, at most {max} are allowed")]
    TooManySkippedMessages {
        /// How many message keys would need to be skipped.
        skipped: u32,
        /// The maximal number of message keys that can be skipped.
        max: u32,
    },

    /// The MAC of the message didn't match.
    #[error("the MAC of the Olm message didn't match")]
    InvalidMac,

    /// The decrypted plaintext had invalid padding.
    #[error("the decrypted Olm message had invalid padding")]
    InvalidPadding,

    /// The ratchet doesn't have a chain that could be used for the operation.
    #[error("the ratchet doesn't have a chain that can be used to encrypt or decrypt")]
    MissingChain,

    /// Encryption or decryption failed because we don't have an Olm session
    /// with the given device.
    #[error("we don't share an Olm session with the device owning the sender key {0}")]
    MissingSession(Curve25519PublicKey),

    /// The storage layer returned an error.
    #[error("failed to read or write to the crypto store {0}")]
    Store(#[from] CryptoStoreError),
}

/// Error representing a failure during a group encryption operation.
#[derive(Error, Debug)]
pub enum MegolmError {
    /// The encrypted megolm message couldn't be decoded.
    #[error(transparent)]
    Decode(#[from] MessageDecodeError),

    /// The message was encrypted with a message index that is lower than the
    /// first index our session knows about.
    #[error(
        "the message index {requested} is lower than the first known index {first_known} \
        of the session"
    )]
    UnknownMessageIndex {
        /// The first message index the session can decrypt.
        first_known: u32,
        /// The message index the message was encrypted with.
        requested: u32,
    },

    /// The signature of the message didn't verify.
    #[error("the signature of the Megolm message didn't verify")]
    InvalidSignature,

    /// The MAC of the message didn't match.
    #[error("the MAC of the Megolm message didn't match")]
    InvalidMac,

    /// The decrypted plaintext had invalid padding.
    #[error("the decrypted Megolm message had invalid padding")]
    InvalidPadding,

    /// Decryption failed because we're missing the room key that was used to
    /// encrypt the message.
    #[error("can't find the room key for the session {session_id} in the room {room_id}")]
    MissingRoomKey {
        /// The room the message was sent in.
        room_id: OwnedRoomId,
        /// The ID of the missing session.
        session_id: String,
    },

    /// The storage layer returned an error.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),
}

/// Error type describing different errors that can happen when we create an
/// inbound group session out of a room key.
#[derive(Error, Debug)]
pub enum SessionCreationError {
    /// The room key uses an algorithm we don't support.
    #[error("the room key uses the unsupported algorithm {0}")]
    UnsupportedAlgorithm(String),

    /// The session ID of the room key doesn't match the ID it was advertised
    /// under.
    #[error("the room key was advertised as session {claimed} but belongs to {actual}")]
    SessionIdMismatch {
        /// The session ID the room key was sent or stored under.
        claimed: String,
        /// The session ID the session key itself produces.
        actual: String,
    },

    /// The session key couldn't be decoded.
    #[error(transparent)]
    InvalidSessionKey(#[from] SessionKeyDecodeError),

    /// The session couldn't be persisted.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),
}

/// Error type describing why a key backup couldn't be verified or restored.
#[derive(Error, Debug)]
pub enum KeyBackupError {
    /// The backup uses an algorithm we don't support.
    #[error("the key backup uses the unsupported algorithm {0}")]
    UnsupportedBackupAlgorithm(String),

    /// Neither the recovery key nor any of the signatures establish trust in
    /// the backup.
    #[error("the key backup isn't trusted, no valid signature of {0} was found")]
    BackupNotTrusted(OwnedUserId),

    /// We don't know our own cross-signing keys, the signatures of the backup
    /// can't be checked.
    #[error("our own cross-signing keys aren't cached, can't check the backup signatures")]
    CrossSigningKeysNotCached,

    /// The homeserver couldn't be queried for the backup.
    #[error("failed to fetch the key backup: {0}")]
    Client(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The storage layer returned an error.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),
}

/// Error type describing different errors that happen when we check or create
/// signatures for a Matrix JSON object.
#[derive(Error, Debug)]
pub enum SignatureError {
    /// The signature was made using an unsupported algorithm.
    #[error("the signature used an unsupported algorithm")]
    UnsupportedAlgorithm,

    /// The provided JSON value that was signed and the signature should be
    /// checked isn't a valid JSON object.
    #[error("the provided JSON value isn't an object")]
    NotAnObject,

    /// The provided JSON object doesn't contain a signature of the given key.
    #[error("the provided JSON object doesn't contain a matching signature")]
    NoSignatureFound,

    /// The signature could not be decoded.
    #[error("the given signature is not valid and can't be decoded")]
    InvalidSignature,

    /// The JSON object couldn't be converted into canonical JSON.
    #[error(transparent)]
    CanonicalJson(#[from] CanonicalJsonError),

    /// The signature couldn't be verified.
    #[error(transparent)]
    VerificationError(#[from] vodozemac::SignatureError),
}
