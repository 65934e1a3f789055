//! Canonical JSON signature verification.

use palaver_proto::{DeviceId, UserId, canonical_json, ed25519_key_name, signable_json};
use serde_json::Value;
use vodozemac::{Ed25519PublicKey, Ed25519Signature};

use crate::error::AuthenticationError;

/// Verifies a device's signature over a JSON payload.
///
/// The signature is expected under `signatures.<user_id>.ed25519:<device_id>`
/// and must cover the canonical form of the payload with `signatures` and
/// `unsigned` removed.
pub fn verify_signed(
    payload: &Value,
    signing_key: &Ed25519PublicKey,
    user_id: &UserId,
    device_id: &DeviceId,
) -> Result<(), AuthenticationError> {
    let missing = || AuthenticationError::MissingSignature {
        user_id: user_id.clone(),
        device_id: device_id.clone(),
    };
    let invalid = || AuthenticationError::InvalidSignature {
        user_id: user_id.clone(),
        device_id: device_id.clone(),
    };

    let signature = payload
        .get("signatures")
        .and_then(|signatures| signatures.get(user_id.as_str()))
        .and_then(|by_key| by_key.get(ed25519_key_name(device_id)))
        .and_then(Value::as_str)
        .ok_or_else(missing)?;
    let signature = Ed25519Signature::from_base64(signature).map_err(|_| invalid())?;

    let canonical = canonical_json(&signable_json(payload));
    signing_key.verify(canonical.as_bytes(), &signature).map_err(|_| invalid())
}
