//! Request payloads crossing the federation boundary.
//!
//! Split by direction of concern: [`keys`] covers the key-publication
//! surface (device keys, one-time keys), [`messages`] covers encrypted
//! traffic (to-device messages and room events).

pub mod keys;
pub mod messages;

pub use keys::{DeviceKeysPayload, KeyUploadPayload, Signatures, SignedOneTimeKey};
pub use messages::{
    EncryptedToDevice, EnvelopeKeys, OlmCiphertext, OlmEnvelope, RoomEncryptedPayload,
    RoomEnvelope, RoomKeyContent, ToDeviceBatch,
};
