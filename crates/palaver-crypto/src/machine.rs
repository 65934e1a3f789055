//! Session manager orchestration.
//!
//! [`Machine`] ties the pieces together: it owns the identity account, the
//! device directory, both session stores, and the persistence backend, and
//! exposes one operation per step of the encryption protocol. It is
//! sans-IO; every operation either builds a request payload for the caller
//! to send or consumes a response the caller already received.
//!
//! ```text
//! Caller (transport)
//!   ├─ key_upload_payload / receive_keys_upload_response
//!   ├─ receive_keys_query_response      (device directory)
//!   ├─ receive_keys_claim_response      (pairwise sessions)
//!   ├─ share_group_session / receive_share_group_session_response
//!   ├─ encrypt_room_message / handle_room_payload
//!   └─ encrypt_to_device / decrypt_to_device
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};

use palaver_proto::{
    DeviceId, DeviceKeysPayload, EncryptedToDevice, EnvelopeKeys, KeyUploadPayload,
    KeysClaimResponse, KeysQueryResponse, KeysUploadResponse, MEGOLM_ALGORITHM, OLM_ALGORITHM,
    OlmCiphertext, OlmEnvelope, ROOM_KEY_TYPE, RoomEncryptedPayload, RoomEnvelope, RoomId,
    RoomKeyContent, ShareGroupSessionResponse, Signatures, SignedOneTimeKey, ToDeviceBatch,
    UserId, canonical_json,
    curve25519_key_name, ed25519_key_name, signable_json, signed_curve25519_key_name,
};
use serde_json::Value;
use vodozemac::{
    Curve25519PublicKey, Ed25519PublicKey,
    megolm::{MegolmMessage, SessionKey},
    olm::{Message, OlmMessage, PreKeyMessage, Session, SessionPickle},
};

use crate::{
    account::Account,
    device::{Device, DeviceDirectory, TrustState},
    error::{
        AuthenticationError, EncryptionError, GroupEncryptionError, TrustError,
        VerificationError,
    },
    group_session::{
        GroupSessionStore, InboundGroupSession, OutboundGroupSession, RotationPolicy,
    },
    session_store::SessionStore,
    signing::verify_signed,
    store::{CryptoStore, StoreError, StoredDevice, StoredSession},
};

/// A decrypted room event with its verification status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedRoomMessage {
    /// Event type from the inner envelope.
    pub event_type: String,
    /// Event content from the inner envelope.
    pub content: Value,
    /// Ratchet index the message was encrypted at.
    pub message_index: u32,
    /// True when the sending device is verified and its keys match the
    /// session the message used.
    pub verified: bool,
    /// Sender identity key from the wire payload.
    pub sender_key: String,
    /// Group session the message used.
    pub session_id: String,
}

/// A room event that could not be decrypted. Terminal: the caller renders
/// a placeholder and moves on, it never retries the same ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndecryptableMessage {
    /// Room the ciphertext arrived in.
    pub room_id: RoomId,
    /// Sender identity key from the wire payload.
    pub sender_key: String,
    /// Group session the ciphertext claimed to use.
    pub session_id: String,
    /// Human-readable failure reason.
    pub reason: String,
}

/// Outcome of handling an encrypted room event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomMessage {
    /// Decryption succeeded.
    Decrypted(DecryptedRoomMessage),
    /// Decryption failed; show a placeholder.
    Undecryptable(UndecryptableMessage),
}

/// End-to-end encryption state machine for one device.
pub struct Machine<S: CryptoStore> {
    user_id: UserId,
    device_id: DeviceId,
    store: S,
    account: Account,
    /// Unclaimed one-time keys the server holds for us. `None` until the
    /// first upload response (or first sync after restart) tells us.
    uploaded_key_count: Option<u64>,
    sessions: SessionStore,
    inbound_group_sessions: GroupSessionStore,
    /// Outbound sessions never persist; a restart forces rotation.
    outbound_group_sessions: HashMap<RoomId, OutboundGroupSession>,
    devices: DeviceDirectory,
    users_for_key_query: BTreeSet<UserId>,
    rotation_policy: RotationPolicy,
}

impl<S: CryptoStore> Machine<S> {
    /// Creates a machine, loading any persisted state from the store. A
    /// fresh account is created and saved when none exists yet.
    pub fn new(user_id: UserId, device_id: DeviceId, store: S) -> Result<Self, EncryptionError> {
        Self::with_rotation_policy(user_id, device_id, store, RotationPolicy::default())
    }

    /// Like [`Self::new`] with an explicit group session rotation policy.
    pub fn with_rotation_policy(
        user_id: UserId,
        device_id: DeviceId,
        store: S,
        rotation_policy: RotationPolicy,
    ) -> Result<Self, EncryptionError> {
        let account = match store.load_account()? {
            Some(stored) => Account::from_stored(&stored)?,
            None => {
                let account = Account::new();
                store.save_account(&account.to_stored()?)?;
                account
            },
        };

        let mut sessions = SessionStore::new();
        for (sender_key, stored) in store.load_sessions()? {
            let pickle: SessionPickle =
                serde_json::from_str(&stored.pickle).map_err(StoreError::from)?;
            sessions.push_back(&sender_key, Session::from_pickle(pickle));
        }

        let mut inbound_group_sessions = GroupSessionStore::new();
        for stored in store.load_inbound_group_sessions()? {
            inbound_group_sessions.add(InboundGroupSession::from_stored(&stored)?);
        }

        let mut devices = DeviceDirectory::new();
        for stored in store.load_device_keys()? {
            let trust =
                store.load_trust_state(&stored.user_id, &stored.device_id)?.unwrap_or_default();
            devices.insert(Device {
                user_id: stored.user_id,
                device_id: stored.device_id,
                ed25519: stored.ed25519,
                curve25519: stored.curve25519,
                deleted: stored.deleted,
                trust,
            });
        }

        Ok(Self {
            user_id,
            device_id,
            store,
            account,
            uploaded_key_count: None,
            sessions,
            inbound_group_sessions,
            outbound_group_sessions: HashMap::new(),
            devices,
            users_for_key_query: BTreeSet::new(),
            rotation_policy,
        })
    }

    /// Our user id.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Our device id.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Our base64 Curve25519 identity key.
    pub fn curve25519_key(&self) -> String {
        self.account.curve25519_key().to_base64()
    }

    /// Our base64 Ed25519 signing key.
    pub fn ed25519_key(&self) -> String {
        self.account.ed25519_key().to_base64()
    }

    // --- key publication -------------------------------------------------

    /// True when a key upload is due: the device keys were never published,
    /// or the server's one-time key pool dropped below half the maximum.
    pub fn should_upload_keys(&self) -> bool {
        if !self.account.shared() {
            return true;
        }
        match self.uploaded_key_count {
            Some(count) => count < (self.account.max_one_time_keys() / 2) as u64,
            // After a restart we don't know the server-side count yet.
            None => false,
        }
    }

    /// Generates `count` fresh one-time keys, enforcing the outstanding-key
    /// budget of half the account maximum.
    pub fn generate_one_time_keys(&mut self, count: usize) -> Result<(), EncryptionError> {
        let limit = (self.account.max_one_time_keys() / 2) as u64;
        let outstanding =
            self.uploaded_key_count.unwrap_or(0) + self.account.one_time_keys().len() as u64;
        if outstanding + count as u64 > limit {
            return Err(EncryptionError::KeyBudgetExceeded { outstanding, limit });
        }
        self.account.generate_one_time_keys(count);
        self.persist_account()
    }

    /// Builds a key upload request, generating enough one-time keys to top
    /// the server pool back up to its target.
    ///
    /// The first upload of an account's lifetime also carries the signed
    /// device keys; retries of it are safe because the payload is rebuilt
    /// from the same unpublished key pool until a response arrives.
    pub fn key_upload_payload(&mut self) -> Result<KeyUploadPayload, EncryptionError> {
        let limit = (self.account.max_one_time_keys() / 2) as u64;
        let uploaded = if self.account.shared() {
            self.uploaded_key_count.ok_or(EncryptionError::UploadCountUnknown)?
        } else {
            0
        };

        let needed = limit.saturating_sub(uploaded) as usize;
        let unpublished = self.account.one_time_keys().len();
        if needed > unpublished {
            self.generate_one_time_keys(needed - unpublished)?;
        } else if needed == 0 && unpublished == 0 {
            return Err(EncryptionError::KeyBudgetExceeded { outstanding: uploaded, limit });
        }

        let device_keys =
            if self.account.shared() { None } else { Some(self.device_keys_payload()?) };
        Ok(KeyUploadPayload { device_keys, one_time_keys: self.signed_one_time_keys() })
    }

    /// Marks the upload as accepted: device keys count as published and
    /// local copies of the uploaded one-time keys are discarded.
    pub fn receive_keys_upload_response(
        &mut self,
        response: &KeysUploadResponse,
    ) -> Result<(), EncryptionError> {
        self.account.mark_shared();
        self.account.mark_keys_as_published();
        self.uploaded_key_count = Some(response.one_time_key_count);
        self.persist_account()
    }

    /// Our signed device keys payload.
    pub fn device_keys_payload(&self) -> Result<DeviceKeysPayload, EncryptionError> {
        let mut keys = BTreeMap::new();
        keys.insert(
            curve25519_key_name(&self.device_id),
            self.account.curve25519_key().to_base64(),
        );
        keys.insert(ed25519_key_name(&self.device_id), self.account.ed25519_key().to_base64());

        let mut payload = DeviceKeysPayload {
            algorithms: vec![OLM_ALGORITHM.to_owned(), MEGOLM_ALGORITHM.to_owned()],
            device_id: self.device_id.clone(),
            user_id: self.user_id.clone(),
            keys,
            signatures: Signatures::new(),
        };

        let value = serde_json::to_value(&payload)?;
        let signature = self.account.sign(&canonical_json(&signable_json(&value)));
        payload.signatures.insert(
            self.user_id.as_str().to_owned(),
            BTreeMap::from([(ed25519_key_name(&self.device_id), signature)]),
        );
        Ok(payload)
    }

    fn signed_one_time_keys(&self) -> BTreeMap<String, SignedOneTimeKey> {
        let mut keys = BTreeMap::new();
        for (key_id, key) in self.account.one_time_keys() {
            let content = serde_json::json!({ "key": &key });
            let signature = self.account.sign(&canonical_json(&content));
            let mut signatures = Signatures::new();
            signatures.insert(
                self.user_id.as_str().to_owned(),
                BTreeMap::from([(ed25519_key_name(&self.device_id), signature)]),
            );
            keys.insert(
                signed_curve25519_key_name(&key_id),
                SignedOneTimeKey { key, signatures },
            );
        }
        keys
    }

    // --- device directory ------------------------------------------------

    /// Queues a user for a device key query.
    pub fn track_user(&mut self, user_id: UserId) {
        self.users_for_key_query.insert(user_id);
    }

    /// Queues several users for a device key query.
    pub fn track_users(&mut self, user_ids: impl IntoIterator<Item = UserId>) {
        self.users_for_key_query.extend(user_ids);
    }

    /// True when tracked users are waiting for a key query.
    pub fn should_query_keys(&self) -> bool {
        !self.users_for_key_query.is_empty()
    }

    /// Users whose device keys need querying.
    pub fn users_for_key_query(&self) -> &BTreeSet<UserId> {
        &self.users_for_key_query
    }

    /// Looks up a device record.
    pub fn device(&self, user_id: &UserId, device_id: &DeviceId) -> Option<&Device> {
        self.devices.get(user_id, device_id)
    }

    /// Ingests a device key query response, returning the records that
    /// changed.
    ///
    /// Every payload is checked individually: wrong owner, missing keys, or
    /// a bad self-signature drops that record and keeps the rest. A changed
    /// Ed25519 signing key is rejected outright; the key pinned on first
    /// sight wins. Devices the server stopped listing are marked deleted.
    pub fn receive_keys_query_response(
        &mut self,
        response: &KeysQueryResponse,
    ) -> Result<Vec<Device>, EncryptionError> {
        let mut changed = Vec::new();
        for (user_id, payloads) in &response.device_keys {
            self.users_for_key_query.remove(user_id);

            for (device_id, payload) in payloads {
                if user_id == &self.user_id && device_id == &self.device_id {
                    continue;
                }
                match self.update_device_from_payload(user_id, device_id, payload) {
                    Ok(Some(device)) => changed.push(device),
                    Ok(None) => {},
                    Err(error) => {
                        tracing::warn!(
                            user_id = %user_id,
                            device_id = %device_id,
                            error = %error,
                            "discarding device record from key query response"
                        );
                    },
                }
            }

            let vanished: Vec<DeviceId> = self
                .devices
                .user_devices(user_id)
                .into_iter()
                .filter(|device| !device.deleted && !payloads.contains_key(&device.device_id))
                .map(|device| device.device_id.clone())
                .collect();
            for device_id in vanished {
                if let Some(device) = self.devices.mark_deleted(user_id, &device_id) {
                    changed.push(device.clone());
                }
            }
        }

        if !changed.is_empty() {
            let stored: Vec<StoredDevice> = changed.iter().map(StoredDevice::from).collect();
            self.store.save_device_keys(&stored)?;
        }
        Ok(changed)
    }

    fn update_device_from_payload(
        &mut self,
        user_id: &UserId,
        device_id: &DeviceId,
        payload: &Value,
    ) -> Result<Option<Device>, EncryptionError> {
        let claimed_user = payload.get("user_id").and_then(Value::as_str);
        let claimed_device = payload.get("device_id").and_then(Value::as_str);
        if claimed_user != Some(user_id.as_str()) || claimed_device != Some(device_id.as_str()) {
            return Err(AuthenticationError::MismatchedOwner {
                user_id: user_id.clone(),
                device_id: device_id.clone(),
            }
            .into());
        }

        let malformed = || AuthenticationError::MalformedDeviceKeys {
            user_id: user_id.clone(),
            device_id: device_id.clone(),
        };
        let keys = payload.get("keys");
        let ed25519 = keys
            .and_then(|keys| keys.get(ed25519_key_name(device_id)))
            .and_then(Value::as_str)
            .ok_or_else(malformed)?;
        let curve25519 = keys
            .and_then(|keys| keys.get(curve25519_key_name(device_id)))
            .and_then(Value::as_str)
            .ok_or_else(malformed)?;

        let signing_key = Ed25519PublicKey::from_base64(ed25519)?;
        verify_signed(payload, &signing_key, user_id, device_id)?;

        if let Some(existing) = self.devices.get_mut(user_id, device_id) {
            if existing.ed25519 != ed25519 {
                return Err(AuthenticationError::SigningKeyChanged {
                    user_id: user_id.clone(),
                    device_id: device_id.clone(),
                }
                .into());
            }
            let mut dirty = false;
            if existing.curve25519 != curve25519 {
                existing.curve25519 = curve25519.to_owned();
                dirty = true;
            }
            if existing.deleted {
                existing.deleted = false;
                dirty = true;
            }
            return Ok(dirty.then(|| existing.clone()));
        }

        let trust = self.store.load_trust_state(user_id, device_id)?.unwrap_or_default();
        let device = Device {
            user_id: user_id.clone(),
            device_id: device_id.clone(),
            ed25519: ed25519.to_owned(),
            curve25519: curve25519.to_owned(),
            deleted: false,
            trust,
        };
        self.devices.insert(device.clone());
        Ok(Some(device))
    }

    // --- trust ------------------------------------------------------------

    /// Sets the trust flag for a device and persists the decision.
    pub fn set_device_trust(
        &mut self,
        user_id: &UserId,
        device_id: &DeviceId,
        trust: TrustState,
    ) -> Result<(), EncryptionError> {
        let device = self.devices.get_mut(user_id, device_id).ok_or_else(|| {
            EncryptionError::UnknownDevice {
                user_id: user_id.clone(),
                device_id: device_id.clone(),
            }
        })?;
        device.trust = trust;
        self.store.save_trust_state(user_id, device_id, trust)?;
        Ok(())
    }

    /// Marks a device verified.
    pub fn verify_device(
        &mut self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<(), EncryptionError> {
        self.set_device_trust(user_id, device_id, TrustState::Verified)
    }

    /// Reverts a device to the unreviewed state.
    pub fn unverify_device(
        &mut self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<(), EncryptionError> {
        self.set_device_trust(user_id, device_id, TrustState::Unset)
    }

    /// Marks a device blacklisted.
    pub fn blacklist_device(
        &mut self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<(), EncryptionError> {
        self.set_device_trust(user_id, device_id, TrustState::Blacklisted)
    }

    /// Lifts a blacklist, returning the device to the unreviewed state.
    pub fn unblacklist_device(
        &mut self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<(), EncryptionError> {
        self.set_device_trust(user_id, device_id, TrustState::Unset)
    }

    /// True when every non-deleted device of the user is either verified
    /// or blacklisted, with none left unreviewed.
    pub fn user_fully_verified(&self, user_id: &UserId) -> bool {
        self.devices.user_fully_verified(user_id)
    }

    // --- pairwise sessions -------------------------------------------------

    /// Devices of the given users that have no pairwise session yet,
    /// excluding our own device and blacklisted ones. The caller claims
    /// one-time keys for these.
    pub fn missing_sessions(&self, users: &[UserId]) -> BTreeMap<UserId, Vec<DeviceId>> {
        let mut missing = BTreeMap::new();
        for user_id in users {
            let mut devices: Vec<DeviceId> = self
                .devices
                .active_user_devices(user_id)
                .into_iter()
                .filter(|device| {
                    !(device.user_id == self.user_id && device.device_id == self.device_id)
                })
                .filter(|device| device.trust != TrustState::Blacklisted)
                .filter(|device| !self.sessions.contains(&device.curve25519))
                .map(|device| device.device_id.clone())
                .collect();
            devices.sort();
            if !devices.is_empty() {
                missing.insert(user_id.clone(), devices);
            }
        }
        missing
    }

    /// Ingests a one-time key claim response, starting an outbound session
    /// for every valid key. Invalid entries are dropped individually.
    pub fn receive_keys_claim_response(
        &mut self,
        response: &KeysClaimResponse,
    ) -> Result<(), EncryptionError> {
        for (user_id, devices) in &response.one_time_keys {
            for (device_id, key_object) in devices {
                if let Err(error) = self.create_session_from_claim(user_id, device_id, key_object)
                {
                    tracing::warn!(
                        user_id = %user_id,
                        device_id = %device_id,
                        error = %error,
                        "could not start session from claimed one-time key"
                    );
                }
            }
        }
        Ok(())
    }

    fn create_session_from_claim(
        &mut self,
        user_id: &UserId,
        device_id: &DeviceId,
        key_object: &Value,
    ) -> Result<(), EncryptionError> {
        let (ed25519, curve25519) = {
            let device = self.devices.get(user_id, device_id).ok_or_else(|| {
                EncryptionError::UnknownDevice {
                    user_id: user_id.clone(),
                    device_id: device_id.clone(),
                }
            })?;
            (device.ed25519.clone(), device.curve25519.clone())
        };

        let malformed = || AuthenticationError::MalformedOneTimeKey {
            user_id: user_id.clone(),
            device_id: device_id.clone(),
        };
        let signed = key_object
            .as_object()
            .and_then(|object| {
                object.iter().find(|(name, _)| name.starts_with("signed_curve25519"))
            })
            .map(|(_, value)| value)
            .ok_or_else(malformed)?;

        let signing_key = Ed25519PublicKey::from_base64(&ed25519)?;
        verify_signed(signed, &signing_key, user_id, device_id)?;

        let key = signed.get("key").and_then(Value::as_str).ok_or_else(malformed)?;
        let one_time_key = Curve25519PublicKey::from_base64(key)?;
        let identity_key = Curve25519PublicKey::from_base64(&curve25519)?;

        let session = self.account.create_outbound_session(identity_key, one_time_key);
        let stored = stored_session(&session)?;
        self.sessions.add(&curve25519, session);
        self.store.save_session(&curve25519, &stored)?;
        Ok(())
    }

    // --- to-device encryption ----------------------------------------------

    /// Encrypts a to-device event for one device over the most recent
    /// pairwise session.
    pub fn encrypt_to_device(
        &mut self,
        user_id: &UserId,
        device_id: &DeviceId,
        event_type: &str,
        content: Value,
    ) -> Result<EncryptedToDevice, EncryptionError> {
        let device = self.devices.get(user_id, device_id).cloned().ok_or_else(|| {
            EncryptionError::UnknownDevice {
                user_id: user_id.clone(),
                device_id: device_id.clone(),
            }
        })?;
        self.encrypt_for_device(&device, event_type, content)
    }

    fn encrypt_for_device(
        &mut self,
        device: &Device,
        event_type: &str,
        content: Value,
    ) -> Result<EncryptedToDevice, EncryptionError> {
        let envelope = OlmEnvelope {
            event_type: event_type.to_owned(),
            content,
            sender: self.user_id.clone(),
            sender_device: self.device_id.clone(),
            keys: EnvelopeKeys { ed25519: self.account.ed25519_key().to_base64() },
            recipient: device.user_id.clone(),
            recipient_keys: EnvelopeKeys { ed25519: device.ed25519.clone() },
        };
        let plaintext = serde_json::to_vec(&envelope)?;

        let session = self.sessions.most_recent_mut(&device.curve25519).ok_or_else(|| {
            EncryptionError::MissingOlmSession {
                user_id: device.user_id.clone(),
                device_id: device.device_id.clone(),
            }
        })?;
        let message = session.encrypt(&plaintext);
        let stored = stored_session(session)?;
        self.store.save_session(&device.curve25519, &stored)?;

        let (message_type, body) = match message {
            OlmMessage::PreKey(prekey) => (0, prekey.to_base64()),
            OlmMessage::Normal(normal) => (1, normal.to_base64()),
        };
        let mut ciphertext = BTreeMap::new();
        ciphertext.insert(device.curve25519.clone(), OlmCiphertext { message_type, body });
        Ok(EncryptedToDevice {
            algorithm: OLM_ALGORITHM.to_owned(),
            sender_key: self.account.curve25519_key().to_base64(),
            ciphertext,
        })
    }

    /// Decrypts a to-device message and verifies its envelope bindings.
    ///
    /// Existing sessions for the sender are tried most-recently-used first.
    /// A prekey message only ever decrypts on the session it belongs to; if
    /// that session exists but fails, the failure is terminal. A prekey
    /// message with no matching session creates a fresh inbound session,
    /// consuming the one-time key it references. A `room_key` envelope is
    /// additionally ingested into the inbound group session store.
    pub fn decrypt_to_device(
        &mut self,
        sender: &UserId,
        sender_key: &str,
        ciphertext: &OlmCiphertext,
    ) -> Result<OlmEnvelope, EncryptionError> {
        let message = decode_olm_message(ciphertext)?;

        let plaintext = match self.try_existing_sessions(sender_key, &message)? {
            Some(plaintext) => plaintext,
            None => match &message {
                OlmMessage::PreKey(prekey) => self.create_inbound_session(sender_key, prekey)?,
                OlmMessage::Normal(_) => {
                    return Err(EncryptionError::MissingSession {
                        sender_key: sender_key.to_owned(),
                    });
                },
            },
        };

        let envelope: OlmEnvelope = serde_json::from_slice(&plaintext)?;
        self.verify_envelope(sender, &envelope)?;

        if envelope.event_type == ROOM_KEY_TYPE {
            self.accept_room_key_from_envelope(sender_key, &envelope)?;
        }
        Ok(envelope)
    }

    fn try_existing_sessions(
        &mut self,
        sender_key: &str,
        message: &OlmMessage,
    ) -> Result<Option<Vec<u8>>, EncryptionError> {
        let Some(sessions) = self.sessions.get_mut(sender_key) else {
            return Ok(None);
        };

        let mut decrypted = None;
        for index in 0..sessions.len() {
            let matches = match message {
                OlmMessage::PreKey(prekey) => {
                    if sessions[index].session_id() != prekey.session_id() {
                        continue;
                    }
                    true
                },
                OlmMessage::Normal(_) => false,
            };

            match sessions[index].decrypt(message) {
                Ok(plaintext) => {
                    decrypted = Some((index, plaintext));
                    break;
                },
                Err(error) if matches => {
                    tracing::warn!(
                        sender_key = %sender_key,
                        error = %error,
                        "matching session failed to decrypt prekey message"
                    );
                    return Err(EncryptionError::MatchingSessionFailed {
                        sender_key: sender_key.to_owned(),
                    });
                },
                Err(error) => {
                    tracing::debug!(
                        sender_key = %sender_key,
                        error = %error,
                        "session did not decrypt message, trying next"
                    );
                },
            }
        }

        let Some((index, plaintext)) = decrypted else {
            return Ok(None);
        };
        let Some(session) = self.sessions.promote(sender_key, index) else {
            return Ok(None);
        };
        let stored = stored_session(session)?;
        self.store.save_session(sender_key, &stored)?;
        Ok(Some(plaintext))
    }

    fn create_inbound_session(
        &mut self,
        sender_key: &str,
        prekey: &PreKeyMessage,
    ) -> Result<Vec<u8>, EncryptionError> {
        let identity_key = Curve25519PublicKey::from_base64(sender_key)?;
        let (session, plaintext) = self.account.create_inbound_session(identity_key, prekey)?;

        // The one-time key the message referenced is gone now.
        self.persist_account()?;
        self.uploaded_key_count = self.uploaded_key_count.map(|count| count.saturating_sub(1));

        let stored = stored_session(&session)?;
        self.sessions.add(sender_key, session);
        self.store.save_session(sender_key, &stored)?;
        Ok(plaintext)
    }

    fn verify_envelope(
        &self,
        sender: &UserId,
        envelope: &OlmEnvelope,
    ) -> Result<(), VerificationError> {
        if &envelope.sender != sender {
            return Err(VerificationError::SenderMismatch {
                claimed: envelope.sender.clone(),
                actual: sender.clone(),
            });
        }
        if envelope.recipient != self.user_id {
            return Err(VerificationError::RecipientMismatch {
                recipient: envelope.recipient.clone(),
            });
        }
        if envelope.recipient_keys.ed25519 != self.account.ed25519_key().to_base64() {
            return Err(VerificationError::RecipientKeyMismatch);
        }
        Ok(())
    }

    // --- group sessions ----------------------------------------------------

    fn accept_room_key_from_envelope(
        &mut self,
        sender_key: &str,
        envelope: &OlmEnvelope,
    ) -> Result<(), EncryptionError> {
        let content: RoomKeyContent = serde_json::from_value(envelope.content.clone())?;
        if content.algorithm != MEGOLM_ALGORITHM {
            tracing::warn!(
                algorithm = %content.algorithm,
                "ignoring room key with unsupported algorithm"
            );
            return Ok(());
        }
        self.accept_room_key(&content, sender_key, &envelope.keys.ed25519, false)?;
        Ok(())
    }

    /// Imports a received group session key.
    ///
    /// Returns `false` (and keeps nothing) when the key does not produce
    /// the session id it claims; an honest sender can never hit this, so
    /// the mismatch is logged and the key dropped.
    pub fn accept_room_key(
        &mut self,
        content: &RoomKeyContent,
        sender_key: &str,
        sender_ed25519: &str,
        forwarding_chain: bool,
    ) -> Result<bool, EncryptionError> {
        let key = SessionKey::from_base64(&content.session_key)
            .map_err(|error| EncryptionError::MalformedSessionKey(error.to_string()))?;
        let session = InboundGroupSession::new(
            &key,
            content.room_id.clone(),
            sender_key.to_owned(),
            sender_ed25519.to_owned(),
            forwarding_chain,
        );
        if session.session_id() != content.session_id {
            tracing::warn!(
                room_id = %content.room_id,
                claimed = %content.session_id,
                "dropping room key whose session id does not match its key"
            );
            return Ok(false);
        }

        let stored = session.to_stored()?;
        self.inbound_group_sessions.add(session);
        self.store.save_inbound_group_session(&stored)?;
        Ok(true)
    }

    /// Creates a fresh outbound group session for a room, replacing any
    /// existing one. The matching inbound session is stored immediately so
    /// we can decrypt our own messages.
    pub fn create_outbound_group_session(
        &mut self,
        room_id: &RoomId,
    ) -> Result<(), EncryptionError> {
        let session = OutboundGroupSession::new(room_id.clone(), self.rotation_policy);
        let content = RoomKeyContent {
            algorithm: MEGOLM_ALGORITHM.to_owned(),
            room_id: room_id.clone(),
            session_id: session.session_id(),
            session_key: session.session_key(),
            chain_index: session.message_index(),
        };
        self.outbound_group_sessions.insert(room_id.clone(), session);

        let sender_key = self.account.curve25519_key().to_base64();
        let sender_ed25519 = self.account.ed25519_key().to_base64();
        self.accept_room_key(&content, &sender_key, &sender_ed25519, false)?;
        Ok(())
    }

    /// Rotates the room's group session. The new session must be shared
    /// before it can encrypt.
    pub fn rotate_group_session(&mut self, room_id: &RoomId) -> Result<(), EncryptionError> {
        self.create_outbound_group_session(room_id)
    }

    /// The room's current outbound group session, if any.
    pub fn outbound_group_session(&self, room_id: &RoomId) -> Option<&OutboundGroupSession> {
        self.outbound_group_sessions.get(room_id)
    }

    /// Builds the to-device batch distributing the room's group session
    /// key to every reachable device of the given users.
    ///
    /// Per device: our own device is skipped, blacklisted devices are
    /// skipped silently, unreviewed devices are a hard error, and a device
    /// without a pairwise session is an error unless
    /// `ignore_missing_sessions` turns it into a skip. A user for whom
    /// nothing could be produced is an error under the same flag. The
    /// session does not count as shared until
    /// [`Self::receive_share_group_session_response`] confirms delivery.
    pub fn share_group_session(
        &mut self,
        room_id: &RoomId,
        users: &[UserId],
        ignore_missing_sessions: bool,
    ) -> Result<ToDeviceBatch, EncryptionError> {
        let content = {
            let session = self.outbound_group_sessions.get(room_id).ok_or_else(|| {
                GroupEncryptionError::MissingSession { room_id: room_id.clone() }
            })?;
            RoomKeyContent {
                algorithm: MEGOLM_ALGORITHM.to_owned(),
                room_id: room_id.clone(),
                session_id: session.session_id(),
                session_key: session.session_key(),
                chain_index: session.message_index(),
            }
        };
        let content = serde_json::to_value(content)?;

        let mut batch = ToDeviceBatch::default();
        let mut staged: Vec<(UserId, DeviceId)> = Vec::new();
        for user_id in users {
            let devices: Vec<Device> =
                self.devices.active_user_devices(user_id).into_iter().cloned().collect();

            let mut produced = false;
            for device in devices {
                if device.user_id == self.user_id && device.device_id == self.device_id {
                    continue;
                }
                match device.trust {
                    TrustState::Blacklisted => continue,
                    TrustState::Unset => {
                        return Err(TrustError::UnreviewedDevice {
                            user_id: device.user_id,
                            device_id: device.device_id,
                        }
                        .into());
                    },
                    TrustState::Verified => {},
                }
                if !self.sessions.contains(&device.curve25519) {
                    if ignore_missing_sessions {
                        tracing::debug!(
                            user_id = %device.user_id,
                            device_id = %device.device_id,
                            "skipping device without a pairwise session"
                        );
                        continue;
                    }
                    return Err(EncryptionError::MissingOlmSession {
                        user_id: device.user_id,
                        device_id: device.device_id,
                    });
                }

                let message =
                    self.encrypt_for_device(&device, ROOM_KEY_TYPE, content.clone())?;
                staged.push((device.user_id.clone(), device.device_id.clone()));
                batch.insert(device.user_id, device.device_id, message);
                produced = true;
            }

            if !produced && !ignore_missing_sessions {
                return Err(EncryptionError::NoReachableDevices { user_id: user_id.clone() });
            }
        }

        if let Some(session) = self.outbound_group_sessions.get_mut(room_id) {
            session.stage_share(staged);
        }
        Ok(batch)
    }

    /// Confirms delivery of a share batch; the session becomes usable for
    /// encryption.
    pub fn receive_share_group_session_response(
        &mut self,
        response: &ShareGroupSessionResponse,
    ) -> Result<(), EncryptionError> {
        let session =
            self.outbound_group_sessions.get_mut(&response.room_id).ok_or_else(|| {
                GroupEncryptionError::MissingSession { room_id: response.room_id.clone() }
            })?;
        session.mark_shared();
        Ok(())
    }

    /// Encrypts a room event with the room's outbound group session.
    ///
    /// Refuses to encrypt with a session that was never shared or that
    /// passed its rotation threshold; the caller must rotate and re-share
    /// first. Expiry never rotates implicitly, so no ciphertext ever uses
    /// a key the caller did not distribute on purpose.
    pub fn encrypt_room_message(
        &mut self,
        room_id: &RoomId,
        event_type: &str,
        content: Value,
    ) -> Result<RoomEncryptedPayload, EncryptionError> {
        let session = self
            .outbound_group_sessions
            .get_mut(room_id)
            .ok_or_else(|| GroupEncryptionError::MissingSession { room_id: room_id.clone() })?;
        if !session.shared() {
            return Err(GroupEncryptionError::NotShared { room_id: room_id.clone() }.into());
        }
        if session.expired() {
            return Err(GroupEncryptionError::Expired { room_id: room_id.clone() }.into());
        }

        let envelope = RoomEnvelope {
            event_type: event_type.to_owned(),
            content,
            room_id: room_id.clone(),
        };
        let plaintext = serde_json::to_vec(&envelope)?;
        let ciphertext = session.encrypt(&plaintext);
        let session_id = session.session_id();

        Ok(RoomEncryptedPayload {
            algorithm: MEGOLM_ALGORITHM.to_owned(),
            sender_key: self.account.curve25519_key().to_base64(),
            ciphertext,
            session_id,
            device_id: self.device_id.clone(),
        })
    }

    /// Decrypts an encrypted room event and determines whether its sender
    /// can be considered verified.
    ///
    /// The sender counts as verified when the message came from this very
    /// device, or when the sending device is verified, its pinned keys
    /// match both the session's claimed signing key and the payload's
    /// sender key, and the session key arrived directly rather than over a
    /// forwarding chain. A verified device whose keys do not match is a
    /// hard error, not merely unverified.
    pub fn decrypt_room_payload(
        &mut self,
        room_id: &RoomId,
        sender: &UserId,
        payload: &RoomEncryptedPayload,
    ) -> Result<DecryptedRoomMessage, EncryptionError> {
        if payload.algorithm != MEGOLM_ALGORITHM {
            return Err(EncryptionError::UnsupportedAlgorithm(payload.algorithm.clone()));
        }
        let message = MegolmMessage::from_base64(&payload.ciphertext)?;

        let (plaintext, message_index, stored, session_ed25519, forwarding_chain) = {
            let session = self
                .inbound_group_sessions
                .get_mut(room_id, &payload.sender_key, &payload.session_id)
                .ok_or_else(|| EncryptionError::UnknownInboundGroupSession {
                    room_id: room_id.clone(),
                    session_id: payload.session_id.clone(),
                })?;
            let (plaintext, message_index) = session.decrypt(&message)?;
            (
                plaintext,
                message_index,
                session.to_stored()?,
                session.sender_ed25519().to_owned(),
                session.forwarding_chain(),
            )
        };
        self.store.save_inbound_group_session(&stored)?;

        let envelope: RoomEnvelope = serde_json::from_slice(&plaintext)?;
        if &envelope.room_id != room_id {
            return Err(VerificationError::RoomMismatch {
                claimed: envelope.room_id,
                actual: room_id.clone(),
            }
            .into());
        }

        let verified =
            self.check_sender_verified(sender, payload, &session_ed25519, forwarding_chain)?;
        Ok(DecryptedRoomMessage {
            event_type: envelope.event_type,
            content: envelope.content,
            message_index,
            verified,
            sender_key: payload.sender_key.clone(),
            session_id: payload.session_id.clone(),
        })
    }

    /// Like [`Self::decrypt_room_payload`] but absorbs failures into an
    /// [`UndecryptableMessage`] placeholder. The failure is terminal; the
    /// caller never feeds the same ciphertext back in.
    pub fn handle_room_payload(
        &mut self,
        room_id: &RoomId,
        sender: &UserId,
        payload: &RoomEncryptedPayload,
    ) -> RoomMessage {
        match self.decrypt_room_payload(room_id, sender, payload) {
            Ok(message) => RoomMessage::Decrypted(message),
            Err(error) => {
                tracing::warn!(
                    room_id = %room_id,
                    session_id = %payload.session_id,
                    error = %error,
                    "room message left undecryptable"
                );
                RoomMessage::Undecryptable(UndecryptableMessage {
                    room_id: room_id.clone(),
                    sender_key: payload.sender_key.clone(),
                    session_id: payload.session_id.clone(),
                    reason: error.to_string(),
                })
            },
        }
    }

    fn check_sender_verified(
        &mut self,
        sender: &UserId,
        payload: &RoomEncryptedPayload,
        session_ed25519: &str,
        forwarding_chain: bool,
    ) -> Result<bool, EncryptionError> {
        if sender == &self.user_id
            && payload.device_id == self.device_id
            && session_ed25519 == self.account.ed25519_key().to_base64()
            && payload.sender_key == self.account.curve25519_key().to_base64()
        {
            return Ok(true);
        }

        let Some(device) = self.devices.get(sender, &payload.device_id) else {
            tracing::debug!(
                user_id = %sender,
                device_id = %payload.device_id,
                "group message from unknown device, queueing key query"
            );
            self.users_for_key_query.insert(sender.clone());
            return Ok(false);
        };

        if device.trust == TrustState::Verified && !forwarding_chain {
            if device.ed25519 != session_ed25519 || device.curve25519 != payload.sender_key {
                return Err(VerificationError::DeviceKeyMismatch {
                    user_id: sender.clone(),
                    device_id: payload.device_id.clone(),
                }
                .into());
            }
            return Ok(true);
        }
        Ok(false)
    }

    fn persist_account(&mut self) -> Result<(), EncryptionError> {
        self.store.save_account(&self.account.to_stored()?)?;
        Ok(())
    }
}

impl<S: CryptoStore> std::fmt::Debug for Machine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("sessions", &self.sessions)
            .field("tracked_users", &self.users_for_key_query.len())
            .finish_non_exhaustive()
    }
}

fn decode_olm_message(ciphertext: &OlmCiphertext) -> Result<OlmMessage, EncryptionError> {
    match ciphertext.message_type {
        0 => Ok(OlmMessage::PreKey(PreKeyMessage::from_base64(&ciphertext.body)?)),
        1 => Ok(OlmMessage::Normal(Message::from_base64(&ciphertext.body)?)),
        other => Err(EncryptionError::UnknownMessageType(other)),
    }
}

fn stored_session(session: &Session) -> Result<StoredSession, StoreError> {
    Ok(StoredSession {
        session_id: session.session_id(),
        pickle: serde_json::to_string(&session.pickle())?,
    })
}
