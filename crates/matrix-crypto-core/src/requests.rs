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

//! The requests the crypto layer needs the homeserver to answer.
//!
//! The crate doesn't do any networking itself, embedders implement
//! [`KeyBackupClient`] on top of their HTTP client.

use std::fmt;

use async_trait::async_trait;

use crate::types::{KeyBackupVersion, RoomKeyBackupResponse};

/// The error type a [`KeyBackupClient`] returns.
pub type ClientError = Box<dyn std::error::Error + Send + Sync>;

/// Access to the server-side key backup endpoints.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait KeyBackupClient: fmt::Debug + Send + Sync {
    /// Fetch the latest backup version, the [`GET /room_keys/version`]
    /// endpoint.
    ///
    /// [`GET /room_keys/version`]: https://spec.matrix.org/v1.10/client-server-api/#get_matrixclientv3room_keysversion
    async fn get_key_backup_latest_version(&self) -> Result<KeyBackupVersion, ClientError>;

    /// Fetch all the room keys of the given backup version, the
    /// [`GET /room_keys/keys`] endpoint.
    ///
    /// [`GET /room_keys/keys`]: https://spec.matrix.org/v1.10/client-server-api/#get_matrixclientv3room_keyskeys
    async fn get_key_backup(&self, version: &str) -> Result<RoomKeyBackupResponse, ClientError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{
        fmt,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;

    use super::{ClientError, KeyBackupClient};
    use crate::types::{KeyBackupVersion, RoomKeyBackupResponse};

    #[derive(Debug)]
    struct NotFound;

    impl fmt::Display for NotFound {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("M_NOT_FOUND: no backup found")
        }
    }

    impl std::error::Error for NotFound {}

    /// A [`KeyBackupClient`] serving a fixed backup.
    #[derive(Debug, Default)]
    pub(crate) struct StaticBackupClient {
        pub version: Option<KeyBackupVersion>,
        pub backup: RoomKeyBackupResponse,
        pub backup_requests: AtomicUsize,
    }

    impl StaticBackupClient {
        pub fn new(version: KeyBackupVersion, backup: RoomKeyBackupResponse) -> Self {
            Self { version: Some(version), backup, backup_requests: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl KeyBackupClient for StaticBackupClient {
        async fn get_key_backup_latest_version(&self) -> Result<KeyBackupVersion, ClientError> {
            self.version.clone().ok_or_else(|| NotFound.into())
        }

        async fn get_key_backup(
            &self,
            version: &str,
        ) -> Result<RoomKeyBackupResponse, ClientError> {
            self.backup_requests.fetch_add(1, Ordering::SeqCst);

            match &self.version {
                Some(v) if v.version == version => Ok(self.backup.clone()),
                _ => Err(NotFound.into()),
            }
        }
    }
}
