// Copyright 2021, 2022 The Matrix.org Foundation C.I.C.
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

//! Server-side backup support for room keys
//!
//! This module implements restoring room keys from server-side backups using
//! the `m.megolm_backup.v1.curve25519-aes-sha2` backup algorithm.
//!
//! A backup is only restored once we trust it. Trust is established either by
//! the recovery key, if its public part is the backup key, or by a valid
//! signature of the backup auth data from our master key or from one of our
//! verified devices.
//!
//! [spec]: https://spec.matrix.org/unstable/client-server-api/#server-side-key-backups

use std::collections::{BTreeMap, BTreeSet};

use ruma::DeviceKeyAlgorithm;
use tracing::{debug, info, instrument, trace, warn};
use vodozemac::Ed25519PublicKey;

use crate::{
    error::KeyBackupError,
    olm::VerifyJson,
    requests::KeyBackupClient,
    store::{Changes, Store},
    types::{KeyBackupVersion, MegolmV1AuthData, RoomKeyBackupInfo, MEGOLM_BACKUP_V1},
    RoomKeyImportResult,
};

mod keys;

pub use keys::{BackupDecryptionKey, DecodeError, DecryptionError, MegolmV1BackupKey};

/// A state machine that checks and restores server-side key backups.
#[derive(Debug, Clone)]
pub struct BackupMachine {
    store: Store,
}

impl BackupMachine {
    pub(crate) fn new(store: Store) -> Self {
        Self { store }
    }

    /// Check that the given backup can be trusted.
    ///
    /// If a decryption key is given and its public part matches the public
    /// key of the backup, the backup is trusted without looking at any
    /// signatures. Otherwise the auth data needs a valid signature from our
    /// master key or from one of our verified devices.
    ///
    /// # Arguments
    ///
    /// * `backup_info` - The backup info, fetched from the
    ///   [`/room_keys/version`] endpoint.
    ///
    /// * `decryption_key` - The recovery key of the backup, if we have it.
    ///
    /// [`/room_keys/version`]: https://spec.matrix.org/unstable/client-server-api/#get_matrixclientv3room_keysversion
    pub async fn verify_backup(
        &self,
        backup_info: &RoomKeyBackupInfo,
        decryption_key: Option<&BackupDecryptionKey>,
    ) -> Result<(), KeyBackupError> {
        trace!(?backup_info, "Verifying backup auth data");

        match backup_info {
            RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(auth_data) => {
                self.verify_auth_data_v1(auth_data, decryption_key).await
            }
            RoomKeyBackupInfo::Other { algorithm, .. } => {
                Err(KeyBackupError::UnsupportedBackupAlgorithm(algorithm.to_owned()))
            }
        }
    }

    async fn verify_auth_data_v1(
        &self,
        auth_data: &MegolmV1AuthData,
        decryption_key: Option<&BackupDecryptionKey>,
    ) -> Result<(), KeyBackupError> {
        if let Some(decryption_key) = decryption_key {
            let expected = decryption_key.public_key();

            if expected == auth_data.public_key {
                debug!("Key backup is trusted based on derived public key");
                return Ok(());
            }

            debug!(
                expected = expected.to_base64(),
                actual = auth_data.public_key.to_base64(),
                "Key backup public keys do not match, proceeding to check device signatures"
            );
        }

        let user_id = self.store.user_id();

        let Some(user_signatures) = auth_data.signatures.get(user_id) else {
            return Err(KeyBackupError::BackupNotTrusted(user_id.to_owned()));
        };

        let cross_signing_keys = self
            .store
            .get_own_cross_signing_keys()
            .await?
            .ok_or(KeyBackupError::CrossSigningKeysNotCached)?;

        let signed_json = match serde_json::to_value(auth_data) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = ?e, "Error while verifying backup, can't serialize the auth data");
                return Err(KeyBackupError::BackupNotTrusted(user_id.to_owned()));
            }
        };

        for key_id in user_signatures.keys() {
            if key_id.algorithm() != DeviceKeyAlgorithm::Ed25519 {
                continue;
            }

            let key_name = key_id.key_name();

            let signing_key: Ed25519PublicKey =
                if cross_signing_keys.is_master_key(key_name.as_str()) {
                    cross_signing_keys.master_key
                } else {
                    match self.store.get_device(user_id, key_name).await? {
                        None => {
                            warn!(%key_id, "Device does not exist, ignoring signature");
                            continue;
                        }
                        Some(device) if !device.is_verified() => {
                            warn!(%key_id, "Device is not trusted");
                            continue;
                        }
                        Some(device) => device.ed25519_key(),
                    }
                };

            if let Err(e) = signing_key.verify_json(user_id, key_id, &signed_json) {
                warn!(%key_id, error = ?e, "Signature verification failed");
                continue;
            }

            debug!(%key_id, "Key backup is trusted based on matching signature");
            return Ok(());
        }

        Err(KeyBackupError::BackupNotTrusted(user_id.to_owned()))
    }

    /// Fetch the latest backup version from the server and check that we
    /// trust it.
    ///
    /// See [`BackupMachine::verify_backup`] for the trust rules.
    #[instrument(skip_all)]
    pub async fn get_and_verify_latest_key_backup_version(
        &self,
        client: &dyn KeyBackupClient,
        decryption_key: Option<&BackupDecryptionKey>,
    ) -> Result<KeyBackupVersion, KeyBackupError> {
        let version =
            client.get_key_backup_latest_version().await.map_err(KeyBackupError::Client)?;

        if version.info.algorithm() != MEGOLM_BACKUP_V1 {
            return Err(KeyBackupError::UnsupportedBackupAlgorithm(
                version.info.algorithm().to_owned(),
            ));
        }

        self.verify_backup(&version.info, decryption_key).await?;

        Ok(version)
    }

    /// Download all the room keys of the given backup version and import
    /// them.
    ///
    /// Room keys that fail to decrypt or to import are skipped and counted,
    /// they don't abort the restore. Every room key that got imported stays
    /// imported if the restore is cancelled midway.
    ///
    /// The backup is not checked, use
    /// [`BackupMachine::get_and_verify_latest_key_backup_version`] first.
    #[instrument(skip(self, client, decryption_key))]
    pub async fn restore_backup(
        &self,
        client: &dyn KeyBackupClient,
        version: &str,
        decryption_key: &BackupDecryptionKey,
    ) -> Result<RoomKeyImportResult, KeyBackupError> {
        let backup = client.get_key_backup(version).await.map_err(KeyBackupError::Client)?;

        let mut imported_count = 0;
        let mut failed_count = 0;
        let mut keys: BTreeMap<_, BTreeMap<String, BTreeSet<String>>> = BTreeMap::new();

        for (room_id, room_backup) in backup.rooms {
            for (session_id, key_backup_data) in room_backup.sessions {
                let room_key =
                    match decryption_key.decrypt_session_data(&key_backup_data.session_data) {
                        Ok(room_key) => room_key,
                        Err(e) => {
                            warn!(
                                %room_id,
                                %session_id,
                                error = ?e,
                                "Failed to decrypt session data"
                            );
                            failed_count += 1;
                            continue;
                        }
                    };

                match self
                    .store
                    .import_room_key_from_backup(version, &room_id, &session_id, room_key)
                    .await
                {
                    Ok(session) => {
                        imported_count += 1;
                        keys.entry(room_id.clone())
                            .or_default()
                            .entry(session.sender_key().to_base64())
                            .or_default()
                            .insert(session_id);
                    }
                    Err(e) => {
                        warn!(
                            %room_id,
                            %session_id,
                            error = ?e,
                            "Failed to import room key from backup"
                        );
                        failed_count += 1;
                    }
                }
            }
        }

        let changes = Changes { backup_version: Some(version.to_owned()), ..Default::default() };
        self.store.save_changes(changes).await?;

        info!(imported_count, failed_count, "Successfully imported sessions from backup");

        Ok(RoomKeyImportResult::new(imported_count, failed_count, keys))
    }

    /// Fetch the latest backup version, check that we trust it and restore
    /// all of its room keys.
    ///
    /// Returns the restored backup version alongside the import counts.
    pub async fn download_and_store_latest_key_backup(
        &self,
        client: &dyn KeyBackupClient,
        decryption_key: &BackupDecryptionKey,
    ) -> Result<(String, RoomKeyImportResult), KeyBackupError> {
        let version =
            self.get_and_verify_latest_key_backup_version(client, Some(decryption_key)).await?;

        let result = self.restore_backup(client, &version.version, decryption_key).await?;

        Ok((version.version, result))
    }
}
