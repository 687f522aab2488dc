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

//! The Olm Double Ratchet and the 1:1 sessions built on top of it.

mod messages;
pub mod ratchet;
mod session;
mod utility;

pub use messages::OlmMessage;
pub use ratchet::{Ratchet, RatchetConfig};
#[cfg(test)]
pub(crate) use session::tests::session_pair;
pub use session::{InnerSession, PickledSession, Session, SessionKeys};
pub(crate) use utility::{SignJson, VerifyJson};
