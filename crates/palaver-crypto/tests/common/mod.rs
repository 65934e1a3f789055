//! Helpers simulating the server side of the key exchange.

use std::collections::BTreeMap;

use palaver_crypto::{Machine, store::MemoryStore};
use palaver_proto::{
    DeviceId, KeyUploadPayload, KeysClaimResponse, KeysQueryResponse, KeysUploadResponse,
    OlmCiphertext, ToDeviceBatch, UserId,
};
use serde_json::Value;

pub fn machine(user: &str, device: &str) -> Machine<MemoryStore> {
    Machine::new(UserId::new(user), DeviceId::new(device), MemoryStore::new()).unwrap()
}

/// Uploads `from`'s keys as a server would accept them, returning the
/// payload so tests can claim keys from it.
pub fn upload_keys(from: &mut Machine<MemoryStore>) -> KeyUploadPayload {
    let payload = from.key_upload_payload().unwrap();
    let count = payload.one_time_keys.len() as u64;
    from.receive_keys_upload_response(&KeysUploadResponse { one_time_key_count: count }).unwrap();
    payload
}

/// Feeds `to` a key query response describing `from`'s device.
pub fn learn_device(to: &mut Machine<MemoryStore>, from: &Machine<MemoryStore>) {
    let payload = serde_json::to_value(from.device_keys_payload().unwrap()).unwrap();
    let mut by_device = BTreeMap::new();
    by_device.insert(from.device_id().clone(), payload);
    let mut device_keys = BTreeMap::new();
    device_keys.insert(from.user_id().clone(), by_device);
    let changed = to.receive_keys_query_response(&KeysQueryResponse { device_keys }).unwrap();
    assert_eq!(changed.len(), 1, "device should be new to the directory");
}

/// Hands `claimer` one one-time key of `target` out of an upload payload,
/// as a claim response, establishing an outbound session.
pub fn claim_key(
    claimer: &mut Machine<MemoryStore>,
    target_user: &UserId,
    target_device: &DeviceId,
    upload: &KeyUploadPayload,
    index: usize,
) {
    let (name, key) = upload
        .one_time_keys
        .iter()
        .nth(index)
        .expect("upload payload must hold enough one-time keys");

    let mut object = serde_json::Map::new();
    object.insert(name.clone(), serde_json::to_value(key).unwrap());
    let mut by_device = BTreeMap::new();
    by_device.insert(target_device.clone(), Value::Object(object));
    let mut one_time_keys = BTreeMap::new();
    one_time_keys.insert(target_user.clone(), by_device);

    claimer.receive_keys_claim_response(&KeysClaimResponse { one_time_keys }).unwrap();
}

/// Pulls the single ciphertext addressed to `recipient` out of a share
/// batch.
pub fn ciphertext_for(
    batch: &ToDeviceBatch,
    user: &UserId,
    device: &DeviceId,
    recipient_curve25519: &str,
) -> OlmCiphertext {
    batch
        .messages
        .get(user)
        .and_then(|devices| devices.get(device))
        .and_then(|message| message.ciphertext.get(recipient_curve25519))
        .cloned()
        .expect("batch must contain a message for the recipient")
}
