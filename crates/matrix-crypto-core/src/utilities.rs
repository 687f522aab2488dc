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

use thiserror::Error;

#[cfg(test)]
pub(crate) fn json_convert<T, U>(value: &T) -> serde_json::Result<U>
where
    T: serde::Serialize,
    U: serde::de::DeserializeOwned,
{
    let json = serde_json::to_string(value)?;
    serde_json::from_str(&json)
}

/// Error type for the protobuf-style encoding of our wire messages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageDecodeError {
    /// The message is shorter than its fixed-size parts.
    #[error("the message is too short, expected at least {expected} bytes, got {got}")]
    MessageTooShort {
        /// The minimal length of the message.
        expected: usize,
        /// The actual length of the message.
        got: usize,
    },
    /// The message uses an unsupported version.
    #[error("the message version {0} is not supported")]
    UnsupportedVersion(u8),
    /// The protobuf fields of the message couldn't be decoded.
    #[error(transparent)]
    ProtoBuf(#[from] prost::DecodeError),
    /// A required field is missing or has an invalid value.
    #[error("the message field `{0}` is missing or invalid")]
    InvalidField(&'static str),
    /// The message isn't valid base64.
    #[error(transparent)]
    Base64(#[from] vodozemac::Base64DecodeError),
}
