//! Key publication payloads.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::{DeviceId, UserId};

/// Signature map: user id -> signing key name -> base64 signature.
///
/// The key name is `ed25519:<device_id>` for device signatures.
pub type Signatures = BTreeMap<String, BTreeMap<String, String>>;

/// Signed advertisement of a device's long-lived identity keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceKeysPayload {
    /// Encryption algorithms the device supports.
    pub algorithms: Vec<String>,
    /// Device this payload describes.
    pub device_id: DeviceId,
    /// User owning the device.
    pub user_id: UserId,
    /// Identity keys, keyed by `<algorithm>:<device_id>`.
    pub keys: BTreeMap<String, String>,
    /// Self-signature over the canonical form of this payload.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub signatures: Signatures,
}

/// A one-time key signed by the owning device's Ed25519 key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedOneTimeKey {
    /// Base64 Curve25519 public key.
    pub key: String,
    /// Signature over the canonical `{"key": ...}` object.
    pub signatures: Signatures,
}

/// Body of a key upload request.
///
/// `device_keys` is present only on the first upload of an account's
/// lifetime; retries and top-ups carry one-time keys alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyUploadPayload {
    /// Signed device identity keys, first upload only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_keys: Option<DeviceKeysPayload>,
    /// Fresh signed one-time keys, keyed by `signed_curve25519:<key_id>`.
    pub one_time_keys: BTreeMap<String, SignedOneTimeKey>,
}
