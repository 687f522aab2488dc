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

//! The devices and cross-signing keys the key backup trust checks rely on.
//!
//! Fetching and verifying device lists is left to the device tracking layer,
//! these types only record its outcome.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
};

use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};
use serde::{Deserialize, Serialize};
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};

/// The local trust state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalTrust {
    /// The device has been verified and is trusted.
    Verified = 0,
    /// The device been blacklisted from communicating.
    BlackListed = 1,
    /// The trust state of the device is being ignored.
    Ignored = 2,
    /// The trust state is unset.
    Unset = 3,
}

/// A device of a Matrix user and the keys it published.
#[derive(Clone)]
pub struct Device {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    ed25519_key: Ed25519PublicKey,
    curve25519_key: Curve25519PublicKey,
    trust_state: Arc<RwLock<LocalTrust>>,
    cross_signing_trusted: Arc<AtomicBool>,
}

impl Device {
    /// Create a new device with the given keys and local trust state.
    pub fn new(
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
        ed25519_key: Ed25519PublicKey,
        curve25519_key: Curve25519PublicKey,
        trust_state: LocalTrust,
    ) -> Self {
        Self {
            user_id,
            device_id,
            ed25519_key,
            curve25519_key,
            trust_state: Arc::new(RwLock::new(trust_state)),
            cross_signing_trusted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The user id of the device owner.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The unique ID of the device.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// The Ed25519 key the device signs with.
    pub fn ed25519_key(&self) -> Ed25519PublicKey {
        self.ed25519_key
    }

    /// The Curve25519 identity key of the device.
    pub fn curve25519_key(&self) -> Curve25519PublicKey {
        self.curve25519_key
    }

    /// Get the trust state of the device.
    pub fn local_trust_state(&self) -> LocalTrust {
        *self.trust_state.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Is the device locally marked as trusted.
    pub fn is_locally_trusted(&self) -> bool {
        self.local_trust_state() == LocalTrust::Verified
    }

    /// Is the device locally marked as blacklisted.
    pub fn is_blacklisted(&self) -> bool {
        self.local_trust_state() == LocalTrust::BlackListed
    }

    /// Set the trust state of the device to the given state.
    pub fn set_trust_state(&self, state: LocalTrust) {
        *self.trust_state.write().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Is this device considered to be verified using cross signing.
    pub fn is_cross_signing_trusted(&self) -> bool {
        self.cross_signing_trusted.load(Ordering::SeqCst)
    }

    /// Record whether the owner's self-signing key signed this device.
    pub fn set_cross_signing_trusted(&self, trusted: bool) {
        self.cross_signing_trusted.store(trusted, Ordering::SeqCst)
    }

    /// Is this device considered to be verified.
    ///
    /// A device is verified if it was verified locally or if it is trusted
    /// through cross-signing.
    pub fn is_verified(&self) -> bool {
        self.is_locally_trusted() || self.is_cross_signing_trusted()
    }
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("ed25519_key", &self.ed25519_key)
            .field("trust_state", &self.local_trust_state())
            .finish()
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.user_id == other.user_id
            && self.device_id == other.device_id
            && self.ed25519_key == other.ed25519_key
    }
}

/// The public cross-signing keys of our own user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CrossSigningPublicKeys {
    /// The user owning the keys.
    pub user_id: OwnedUserId,
    /// The master key, the root of trust of the user.
    pub master_key: Ed25519PublicKey,
    /// The key signing the devices of the user.
    pub self_signing_key: Option<Ed25519PublicKey>,
    /// The key signing the master keys of other users.
    pub user_signing_key: Option<Ed25519PublicKey>,
}

impl CrossSigningPublicKeys {
    /// Create the key set out of a master key only.
    pub fn new(user_id: OwnedUserId, master_key: Ed25519PublicKey) -> Self {
        Self { user_id, master_key, self_signing_key: None, user_signing_key: None }
    }

    /// Is the key ID name the base64 form of our master key.
    ///
    /// Cross-signing keys use their own public key as the key ID.
    pub fn is_master_key(&self, key_name: &str) -> bool {
        self.master_key.to_base64() == key_name
    }
}

/// Helpers to create devices with known keys.
#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use ruma::{OwnedDeviceId, OwnedUserId};
    use vodozemac::{Curve25519PublicKey, Curve25519SecretKey, Ed25519Keypair};

    use super::{Device, LocalTrust};

    /// Create a device with fresh keys, returning the signing keypair too.
    pub fn device_with_keys(
        user_id: &str,
        device_id: &str,
        trust_state: LocalTrust,
    ) -> (Device, Ed25519Keypair) {
        let keypair = Ed25519Keypair::new();
        let device = Device::new(
            OwnedUserId::try_from(user_id).expect("A valid user ID"),
            OwnedDeviceId::from(device_id),
            keypair.public_key(),
            Curve25519PublicKey::from(&Curve25519SecretKey::new()),
            trust_state,
        );

        (device, keypair)
    }
}
