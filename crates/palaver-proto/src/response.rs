//! Server response shapes fed back into the session manager.
//!
//! The encryption layer never talks to the network itself. The caller
//! performs the request, parses one of these, and hands it over.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{DeviceId, RoomId, UserId};

/// Acknowledgement of a key upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysUploadResponse {
    /// Number of unclaimed one-time keys the server now holds for us.
    pub one_time_key_count: u64,
}

/// Result of a device key query.
///
/// Device payloads stay as raw JSON here; signature verification works on
/// the exact bytes the server returned, not a re-serialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysQueryResponse {
    /// user id -> device id -> unverified [`crate::DeviceKeysPayload`] value.
    pub device_keys: BTreeMap<UserId, BTreeMap<DeviceId, Value>>,
}

/// Result of a one-time key claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysClaimResponse {
    /// user id -> device id -> object holding one signed one-time key under
    /// a `signed_curve25519:<key_id>` name.
    pub one_time_keys: BTreeMap<UserId, BTreeMap<DeviceId, Value>>,
}

/// Acknowledgement that a group session share batch was delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareGroupSessionResponse {
    /// Room whose session was shared.
    pub room_id: RoomId,
}
