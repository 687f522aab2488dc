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

//! The Megolm group ratchet, used to encrypt room messages.

mod group_session;
mod inbound;
mod message;
mod ratchet;
mod session_keys;

pub use group_session::GroupSession;
pub use inbound::{DecryptedMessage, InboundGroupSession, PickledInboundGroupSession};
pub use message::MegolmMessage;
pub use session_keys::{ExportedSessionKey, SessionKey, SessionKeyDecodeError};
