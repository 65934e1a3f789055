//! Protocol Types
//!
//! Wire-level payloads for the Palaver end-to-end encryption layer: key
//! uploads, key queries and claims, encrypted to-device messages, and
//! encrypted room events. Also provides the canonical JSON form used for
//! signing and the typed identifiers shared across crates.
//!
//! This crate is transport-agnostic. It describes the shapes that cross the
//! federation boundary; how they get there is the caller's problem.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod canonical;
mod ids;
pub mod payloads;
mod response;

pub use canonical::{canonical_json, signable_json};
pub use ids::{DeviceId, RoomId, UserId};
pub use payloads::{
    DeviceKeysPayload, EncryptedToDevice, EnvelopeKeys, KeyUploadPayload, OlmCiphertext,
    OlmEnvelope, RoomEncryptedPayload, RoomEnvelope, RoomKeyContent, Signatures,
    SignedOneTimeKey, ToDeviceBatch,
};
pub use response::{
    KeysClaimResponse, KeysQueryResponse, KeysUploadResponse, ShareGroupSessionResponse,
};

/// Algorithm identifier for pairwise (Olm-style) encryption.
pub const OLM_ALGORITHM: &str = "olm.v1.curve25519-aes-sha2";

/// Algorithm identifier for group (Megolm-style) encryption.
pub const MEGOLM_ALGORITHM: &str = "megolm.v1.aes-sha2";

/// To-device event type carrying a group session key.
pub const ROOM_KEY_TYPE: &str = "room_key";

/// Key name for an Ed25519 device signing key, e.g. `ed25519:DEVICEID`.
pub fn ed25519_key_name(device_id: &DeviceId) -> String {
    format!("ed25519:{device_id}")
}

/// Key name for a Curve25519 device identity key, e.g. `curve25519:DEVICEID`.
pub fn curve25519_key_name(device_id: &DeviceId) -> String {
    format!("curve25519:{device_id}")
}

/// Key name for a signed one-time key upload, e.g. `signed_curve25519:AAAAAQ`.
pub fn signed_curve25519_key_name(key_id: &str) -> String {
    format!("signed_curve25519:{key_id}")
}
