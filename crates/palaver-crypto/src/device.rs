//! Peer device directory.
//!
//! Holds every device record learned from key queries, together with the
//! local trust decision for each. The Ed25519 signing key of a record is
//! pinned on first sight and never changes afterwards; a device that
//! re-announces with a different signing key is a different device (or an
//! attacker) and its update is rejected upstream.

use std::collections::HashMap;

use palaver_proto::{DeviceId, UserId};
use serde::{Deserialize, Serialize};

use crate::store::StoredDevice;

/// Local trust decision for a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustState {
    /// Nobody has reviewed the device yet.
    #[default]
    Unset,
    /// A human compared keys and confirmed the device.
    Verified,
    /// The device must never receive encrypted content.
    Blacklisted,
}

/// One peer device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// Owning user.
    pub user_id: UserId,
    /// Device identifier.
    pub device_id: DeviceId,
    /// Pinned base64 Ed25519 signing key. Immutable after first sight.
    pub ed25519: String,
    /// Current base64 Curve25519 identity key. May rotate.
    pub curve25519: String,
    /// True once the server stopped listing the device.
    pub deleted: bool,
    /// Local trust decision.
    pub trust: TrustState,
}

impl Device {
    /// True when the device should take part in encryption: still listed
    /// and not blacklisted.
    pub fn is_active(&self) -> bool {
        !self.deleted && self.trust != TrustState::Blacklisted
    }
}

impl From<&Device> for StoredDevice {
    fn from(device: &Device) -> Self {
        Self {
            user_id: device.user_id.clone(),
            device_id: device.device_id.clone(),
            ed25519: device.ed25519.clone(),
            curve25519: device.curve25519.clone(),
            deleted: device.deleted,
        }
    }
}

/// In-memory directory of peer devices, keyed by user and device id.
#[derive(Debug, Default)]
pub struct DeviceDirectory {
    devices: HashMap<UserId, HashMap<DeviceId, Device>>,
}

impl DeviceDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up one device.
    pub fn get(&self, user_id: &UserId, device_id: &DeviceId) -> Option<&Device> {
        self.devices.get(user_id)?.get(device_id)
    }

    /// Looks up one device mutably.
    pub fn get_mut(&mut self, user_id: &UserId, device_id: &DeviceId) -> Option<&mut Device> {
        self.devices.get_mut(user_id)?.get_mut(device_id)
    }

    /// Inserts or replaces a device record.
    pub fn insert(&mut self, device: Device) {
        self.devices
            .entry(device.user_id.clone())
            .or_default()
            .insert(device.device_id.clone(), device);
    }

    /// All known devices of a user, including deleted and blacklisted
    /// ones.
    pub fn user_devices(&self, user_id: &UserId) -> Vec<&Device> {
        self.devices.get(user_id).map(|devices| devices.values().collect()).unwrap_or_default()
    }

    /// Non-deleted devices of a user.
    pub fn active_user_devices(&self, user_id: &UserId) -> Vec<&Device> {
        self.devices
            .get(user_id)
            .map(|devices| devices.values().filter(|device| !device.deleted).collect())
            .unwrap_or_default()
    }

    /// Marks a device deleted, returning the updated record.
    pub fn mark_deleted(&mut self, user_id: &UserId, device_id: &DeviceId) -> Option<&Device> {
        let device = self.devices.get_mut(user_id)?.get_mut(device_id)?;
        device.deleted = true;
        Some(device)
    }

    /// True when every non-deleted device of the user has been reviewed:
    /// verified or blacklisted, none left in the unreviewed state.
    /// Vacuously true for a user with no active devices.
    pub fn user_fully_verified(&self, user_id: &UserId) -> bool {
        self.active_user_devices(user_id)
            .iter()
            .all(|device| device.trust != TrustState::Unset)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use palaver_proto::{DeviceId, UserId};

    use super::{Device, DeviceDirectory, TrustState};

    fn device(user: &str, id: &str, trust: TrustState) -> Device {
        Device {
            user_id: UserId::new(user),
            device_id: DeviceId::new(id),
            ed25519: format!("ed-{id}"),
            curve25519: format!("curve-{id}"),
            deleted: false,
            trust,
        }
    }

    #[test]
    fn active_excludes_deleted() {
        let mut directory = DeviceDirectory::new();
        directory.insert(device("@a:x", "D1", TrustState::Unset));
        directory.insert(device("@a:x", "D2", TrustState::Unset));
        directory.mark_deleted(&UserId::new("@a:x"), &DeviceId::new("D1"));

        let active = directory.active_user_devices(&UserId::new("@a:x"));
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].device_id, DeviceId::new("D2"));
        assert_eq!(directory.user_devices(&UserId::new("@a:x")).len(), 2);
    }

    #[test]
    fn blacklisted_devices_are_not_activeable() {
        let record = device("@a:x", "D1", TrustState::Blacklisted);
        assert!(!record.is_active());
        assert!(device("@a:x", "D1", TrustState::Unset).is_active());
    }

    #[test]
    fn fully_verified_requires_every_active_device_reviewed() {
        let mut directory = DeviceDirectory::new();
        let user = UserId::new("@a:x");
        assert!(directory.user_fully_verified(&user));

        directory.insert(device("@a:x", "D1", TrustState::Verified));
        assert!(directory.user_fully_verified(&user));

        directory.insert(device("@a:x", "D2", TrustState::Unset));
        assert!(!directory.user_fully_verified(&user));

        directory.mark_deleted(&user, &DeviceId::new("D2"));
        assert!(directory.user_fully_verified(&user));
    }

    #[test]
    fn blacklisted_devices_count_as_reviewed() {
        let mut directory = DeviceDirectory::new();
        directory.insert(device("@a:x", "D1", TrustState::Verified));
        directory.insert(device("@a:x", "D2", TrustState::Blacklisted));
        assert!(directory.user_fully_verified(&UserId::new("@a:x")));

        directory.insert(device("@a:x", "D3", TrustState::Unset));
        assert!(!directory.user_fully_verified(&UserId::new("@a:x")));
    }
}
