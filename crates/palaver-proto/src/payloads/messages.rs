//! Encrypted message payloads.
//!
//! Two layers appear here. The outer shapes ([`EncryptedToDevice`],
//! [`RoomEncryptedPayload`]) travel over federation in the clear. The inner
//! envelopes ([`OlmEnvelope`], [`RoomEnvelope`]) only ever exist as
//! plaintext inside a ratchet message and bind sender, recipient, and room
//! so ciphertext cannot be replayed into a different context.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{DeviceId, RoomId, UserId};

/// A single pairwise ciphertext with its wire format discriminator.
///
/// `message_type` 0 is a prekey message (carries the session handshake),
/// 1 is a normal ratchet message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OlmCiphertext {
    /// Wire format: 0 for prekey, 1 for normal.
    #[serde(rename = "type")]
    pub message_type: usize,
    /// Base64 message body.
    pub body: String,
}

/// An encrypted to-device message addressed to one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedToDevice {
    /// Always [`crate::OLM_ALGORITHM`].
    pub algorithm: String,
    /// Sender's base64 Curve25519 identity key.
    pub sender_key: String,
    /// Ciphertext keyed by the recipient's base64 Curve25519 identity key.
    pub ciphertext: BTreeMap<String, OlmCiphertext>,
}

/// A batch of to-device messages, grouped by recipient user and device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToDeviceBatch {
    /// user id -> device id -> encrypted message.
    pub messages: BTreeMap<UserId, BTreeMap<DeviceId, EncryptedToDevice>>,
}

impl ToDeviceBatch {
    /// True when the batch carries no messages at all.
    pub fn is_empty(&self) -> bool {
        self.messages.values().all(BTreeMap::is_empty)
    }

    /// Adds one message to the batch.
    pub fn insert(&mut self, user_id: UserId, device_id: DeviceId, message: EncryptedToDevice) {
        self.messages.entry(user_id).or_default().insert(device_id, message);
    }
}

/// Plaintext envelope carried inside a pairwise ciphertext.
///
/// The sender fills in who they are and who they believe they are talking
/// to; the recipient checks those claims against its own identity before
/// trusting the content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OlmEnvelope {
    /// Event type of the inner content, e.g. [`crate::ROOM_KEY_TYPE`].
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event content.
    pub content: Value,
    /// Claimed sender.
    pub sender: UserId,
    /// Claimed sending device.
    pub sender_device: DeviceId,
    /// Sender's signing keys.
    pub keys: EnvelopeKeys,
    /// Intended recipient.
    pub recipient: UserId,
    /// Intended recipient's signing keys.
    pub recipient_keys: EnvelopeKeys,
}

/// Signing keys referenced from an [`OlmEnvelope`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeKeys {
    /// Base64 Ed25519 key.
    pub ed25519: String,
}

/// Content of a `room_key` to-device event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomKeyContent {
    /// Always [`crate::MEGOLM_ALGORITHM`].
    pub algorithm: String,
    /// Room the group session belongs to.
    pub room_id: RoomId,
    /// Group session identifier.
    pub session_id: String,
    /// Exported ratchet key, base64.
    pub session_key: String,
    /// Ratchet index the exported key starts at.
    pub chain_index: u32,
}

/// An encrypted room event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomEncryptedPayload {
    /// Always [`crate::MEGOLM_ALGORITHM`].
    pub algorithm: String,
    /// Sender's base64 Curve25519 identity key.
    pub sender_key: String,
    /// Base64 group ratchet ciphertext.
    pub ciphertext: String,
    /// Group session the ciphertext belongs to.
    pub session_id: String,
    /// Sending device.
    pub device_id: DeviceId,
}

/// Plaintext envelope carried inside a group ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomEnvelope {
    /// Event type of the inner content.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event content.
    pub content: Value,
    /// Room the event was encrypted for. Checked against the room the
    /// ciphertext arrived in.
    pub room_id: RoomId,
}
