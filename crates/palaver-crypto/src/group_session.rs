//! Group ratchet sessions.
//!
//! Outbound sessions encrypt room events and age out under a rotation
//! policy; they live only in memory and are rebuilt by rotation after a
//! restart. Inbound sessions decrypt room events and persist, since losing
//! one loses message history.

use std::{
    collections::{HashMap, HashSet},
    time::{Duration, Instant},
};

use palaver_proto::{DeviceId, RoomId, UserId};
use vodozemac::megolm::{
    DecryptionError, GroupSession, InboundGroupSession as RatchetInboundSession,
    InboundGroupSessionPickle, MegolmMessage, SessionConfig, SessionKey,
};

use crate::store::{StoreError, StoredInboundGroupSession};

fn session_config() -> SessionConfig {
    SessionConfig::version_2()
}

/// When an outbound group session must be rotated.
///
/// A session expires once it has encrypted `max_messages` events or has
/// existed for `max_age`, whichever comes first. Expiry is checked at
/// encrypt time; an expired session refuses to encrypt rather than
/// rotating silently, so key distribution stays under caller control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    /// Messages a session may encrypt before rotation.
    pub max_messages: u32,
    /// Wall-clock lifetime of a session.
    pub max_age: Duration,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self { max_messages: 100, max_age: Duration::from_secs(7 * 24 * 60 * 60) }
    }
}

/// Outbound group ratchet for one room.
pub struct OutboundGroupSession {
    inner: GroupSession,
    room_id: RoomId,
    created_at: Instant,
    policy: RotationPolicy,
    shared: bool,
    shared_with: HashSet<(UserId, DeviceId)>,
    pending_shared_with: HashSet<(UserId, DeviceId)>,
}

impl OutboundGroupSession {
    /// Creates a fresh session for a room.
    pub fn new(room_id: RoomId, policy: RotationPolicy) -> Self {
        Self {
            inner: GroupSession::new(session_config()),
            room_id,
            created_at: Instant::now(),
            policy,
            shared: false,
            shared_with: HashSet::new(),
            pending_shared_with: HashSet::new(),
        }
    }

    /// Room this session belongs to.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Session identifier.
    pub fn session_id(&self) -> String {
        self.inner.session_id()
    }

    /// Current ratchet index; the next encrypted message will use it.
    pub fn message_index(&self) -> u32 {
        self.inner.message_index()
    }

    /// Exports the current ratchet key in base64. Recipients given this
    /// key can decrypt from the current index onward, nothing earlier.
    pub fn session_key(&self) -> String {
        self.inner.session_key().to_base64()
    }

    /// True once at least one share has been acknowledged.
    pub fn shared(&self) -> bool {
        self.shared
    }

    /// True when the session has hit its rotation threshold.
    pub fn expired(&self) -> bool {
        self.inner.message_index() >= self.policy.max_messages
            || self.created_at.elapsed() >= self.policy.max_age
    }

    /// Devices a share batch was built for but not yet acknowledged.
    pub fn pending_shared_with(&self) -> &HashSet<(UserId, DeviceId)> {
        &self.pending_shared_with
    }

    /// Devices that hold this session's key.
    pub fn shared_with(&self) -> &HashSet<(UserId, DeviceId)> {
        &self.shared_with
    }

    /// Records the devices a share batch was addressed to. They do not
    /// count as reached until [`Self::mark_shared`] confirms delivery.
    pub fn stage_share(&mut self, devices: impl IntoIterator<Item = (UserId, DeviceId)>) {
        self.pending_shared_with.extend(devices);
    }

    /// Confirms delivery of the staged share batch. Only now does the
    /// session become usable for encryption.
    pub fn mark_shared(&mut self) {
        self.shared_with.extend(self.pending_shared_with.drain());
        self.shared = true;
    }

    /// Encrypts a plaintext, advancing the ratchet. Callers must check
    /// [`Self::shared`] and [`Self::expired`] first; this method only
    /// performs the ratchet step.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> String {
        self.inner.encrypt(plaintext).to_base64()
    }
}

impl std::fmt::Debug for OutboundGroupSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundGroupSession")
            .field("room_id", &self.room_id)
            .field("session_id", &self.inner.session_id())
            .field("message_index", &self.inner.message_index())
            .field("shared", &self.shared)
            .finish_non_exhaustive()
    }
}

/// Inbound group ratchet with the provenance needed for verification.
pub struct InboundGroupSession {
    inner: RatchetInboundSession,
    /// Room the session was announced for.
    room_id: RoomId,
    /// Curve25519 identity key of the announcing device.
    sender_key: String,
    /// Ed25519 signing key claimed for the announcing device.
    sender_ed25519: String,
    /// True when the key passed through third hands on its way here.
    forwarding_chain: bool,
}

impl InboundGroupSession {
    /// Imports an exported session key.
    pub fn new(
        key: &SessionKey,
        room_id: RoomId,
        sender_key: String,
        sender_ed25519: String,
        forwarding_chain: bool,
    ) -> Self {
        Self {
            inner: RatchetInboundSession::new(key, session_config()),
            room_id,
            sender_key,
            sender_ed25519,
            forwarding_chain,
        }
    }

    /// Restores a session from its persisted form.
    pub fn from_stored(stored: &StoredInboundGroupSession) -> Result<Self, StoreError> {
        let pickle: InboundGroupSessionPickle = serde_json::from_str(&stored.pickle)?;
        Ok(Self {
            inner: RatchetInboundSession::from_pickle(pickle),
            room_id: RoomId::new(stored.room_id.clone()),
            sender_key: stored.sender_key.clone(),
            sender_ed25519: stored.sender_ed25519.clone(),
            forwarding_chain: stored.forwarding_chain,
        })
    }

    /// Serializes the session for persistence.
    pub fn to_stored(&self) -> Result<StoredInboundGroupSession, StoreError> {
        Ok(StoredInboundGroupSession {
            room_id: self.room_id.as_str().to_owned(),
            sender_key: self.sender_key.clone(),
            sender_ed25519: self.sender_ed25519.clone(),
            session_id: self.inner.session_id(),
            forwarding_chain: self.forwarding_chain,
            pickle: serde_json::to_string(&self.inner.pickle())?,
        })
    }

    /// Session identifier.
    pub fn session_id(&self) -> String {
        self.inner.session_id()
    }

    /// Room the session belongs to.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Identity key of the announcing device.
    pub fn sender_key(&self) -> &str {
        &self.sender_key
    }

    /// Signing key claimed for the announcing device.
    pub fn sender_ed25519(&self) -> &str {
        &self.sender_ed25519
    }

    /// Whether the key arrived through a forwarding chain.
    pub fn forwarding_chain(&self) -> bool {
        self.forwarding_chain
    }

    /// Decrypts a group ciphertext, returning the plaintext and its
    /// ratchet index.
    pub fn decrypt(&mut self, message: &MegolmMessage) -> Result<(Vec<u8>, u32), DecryptionError> {
        let decrypted = self.inner.decrypt(message)?;
        Ok((decrypted.plaintext, decrypted.message_index))
    }
}

impl std::fmt::Debug for InboundGroupSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundGroupSession")
            .field("room_id", &self.room_id)
            .field("session_id", &self.inner.session_id())
            .field("sender_key", &self.sender_key)
            .field("forwarding_chain", &self.forwarding_chain)
            .finish_non_exhaustive()
    }
}

/// Inbound group sessions keyed by room, sender identity key, and session
/// id.
#[derive(Debug, Default)]
pub struct GroupSessionStore {
    sessions: HashMap<RoomId, HashMap<String, HashMap<String, InboundGroupSession>>>,
}

impl GroupSessionStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a session, replacing any previous one under the same keys.
    pub fn add(&mut self, session: InboundGroupSession) {
        self.sessions
            .entry(session.room_id().clone())
            .or_default()
            .entry(session.sender_key().to_owned())
            .or_default()
            .insert(session.session_id(), session);
    }

    /// Looks up a session.
    pub fn get(
        &self,
        room_id: &RoomId,
        sender_key: &str,
        session_id: &str,
    ) -> Option<&InboundGroupSession> {
        self.sessions.get(room_id)?.get(sender_key)?.get(session_id)
    }

    /// Looks up a session mutably for decryption.
    pub fn get_mut(
        &mut self,
        room_id: &RoomId,
        sender_key: &str,
        session_id: &str,
    ) -> Option<&mut InboundGroupSession> {
        self.sessions.get_mut(room_id)?.get_mut(sender_key)?.get_mut(session_id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use palaver_proto::{DeviceId, RoomId, UserId};
    use vodozemac::megolm::{MegolmMessage, SessionKey};

    use super::{
        GroupSessionStore, InboundGroupSession, OutboundGroupSession, RotationPolicy,
    };

    fn room() -> RoomId {
        RoomId::new("!kitchen:example.org")
    }

    fn inbound_for(outbound: &OutboundGroupSession) -> InboundGroupSession {
        let key = SessionKey::from_base64(&outbound.session_key()).unwrap();
        InboundGroupSession::new(&key, room(), "curve".to_owned(), "ed".to_owned(), false)
    }

    #[test]
    fn round_trip_through_exported_key() {
        let mut outbound = OutboundGroupSession::new(room(), RotationPolicy::default());
        let mut inbound = inbound_for(&outbound);
        assert_eq!(inbound.session_id(), outbound.session_id());

        let ciphertext = outbound.encrypt(b"soup's on");
        let message = MegolmMessage::from_base64(&ciphertext).unwrap();
        let (plaintext, index) = inbound.decrypt(&message).unwrap();
        assert_eq!(plaintext, b"soup's on");
        assert_eq!(index, 0);
    }

    #[test]
    fn message_index_is_monotonic() {
        let mut outbound = OutboundGroupSession::new(room(), RotationPolicy::default());
        let mut inbound = inbound_for(&outbound);

        for expected in 0..3 {
            let message = MegolmMessage::from_base64(&outbound.encrypt(b"tick")).unwrap();
            let (_, index) = inbound.decrypt(&message).unwrap();
            assert_eq!(index, expected);
        }
        assert_eq!(outbound.message_index(), 3);
    }

    #[test]
    fn late_export_cannot_read_earlier_messages() {
        let mut outbound = OutboundGroupSession::new(room(), RotationPolicy::default());
        let early = MegolmMessage::from_base64(&outbound.encrypt(b"before export")).unwrap();

        let mut late_inbound = inbound_for(&outbound);
        assert!(late_inbound.decrypt(&early).is_err());
    }

    #[test]
    fn expires_after_message_budget() {
        let policy = RotationPolicy { max_messages: 2, max_age: Duration::from_secs(3600) };
        let mut outbound = OutboundGroupSession::new(room(), policy);
        assert!(!outbound.expired());

        outbound.encrypt(b"one");
        outbound.encrypt(b"two");
        assert!(outbound.expired());
    }

    #[test]
    fn expires_by_age() {
        let policy = RotationPolicy { max_messages: 100, max_age: Duration::ZERO };
        let outbound = OutboundGroupSession::new(room(), policy);
        assert!(outbound.expired());
    }

    #[test]
    fn staged_shares_only_count_after_confirmation() {
        let mut outbound = OutboundGroupSession::new(room(), RotationPolicy::default());
        let target = (UserId::new("@bob:x"), DeviceId::new("BDEV"));

        outbound.stage_share([target.clone()]);
        assert!(!outbound.shared());
        assert!(outbound.shared_with().is_empty());

        outbound.mark_shared();
        assert!(outbound.shared());
        assert!(outbound.shared_with().contains(&target));
        assert!(outbound.pending_shared_with().is_empty());
    }

    #[test]
    fn stored_round_trip_keeps_provenance_and_ratchet() {
        let mut outbound = OutboundGroupSession::new(room(), RotationPolicy::default());
        let inbound = inbound_for(&outbound);

        let stored = inbound.to_stored().unwrap();
        let mut restored = InboundGroupSession::from_stored(&stored).unwrap();
        assert_eq!(restored.sender_key(), "curve");
        assert_eq!(restored.sender_ed25519(), "ed");
        assert!(!restored.forwarding_chain());

        let message = MegolmMessage::from_base64(&outbound.encrypt(b"persisted")).unwrap();
        let (plaintext, _) = restored.decrypt(&message).unwrap();
        assert_eq!(plaintext, b"persisted");
    }

    #[test]
    fn store_lookup_is_exact() {
        let outbound = OutboundGroupSession::new(room(), RotationPolicy::default());
        let inbound = inbound_for(&outbound);
        let session_id = inbound.session_id();

        let mut store = GroupSessionStore::new();
        store.add(inbound);

        assert!(store.get(&room(), "curve", &session_id).is_some());
        assert!(store.get(&room(), "other", &session_id).is_none());
        assert!(store.get(&RoomId::new("!other:x"), "curve", &session_id).is_none());
    }
}
