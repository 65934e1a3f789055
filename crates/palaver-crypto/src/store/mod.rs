//! Persistence boundary.
//!
//! Everything the session manager must survive a restart with crosses this
//! trait: the pickled account, pairwise sessions, inbound group sessions,
//! peer device keys, and trust flags. Outbound group sessions are
//! deliberately absent; losing one only forces a rotation, and persisting
//! it would extend the compromise window of its ratchet key.
//!
//! Pickles are stored as opaque strings so backends never depend on the
//! underlying crypto library's types.

mod error;
mod memory;

use palaver_proto::{DeviceId, UserId};
use serde::{Deserialize, Serialize};

pub use error::StoreError;
pub use memory::MemoryStore;

use crate::device::TrustState;

/// Persisted account state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAccount {
    /// Whether the device keys have ever been published.
    pub shared: bool,
    /// JSON account pickle.
    pub pickle: String,
}

/// Persisted pairwise session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    /// Session identifier, stable across pickling.
    pub session_id: String,
    /// JSON session pickle.
    pub pickle: String,
}

/// Persisted inbound group session with its provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredInboundGroupSession {
    /// Room the session belongs to.
    pub room_id: String,
    /// Curve25519 identity key of the device that created the session.
    pub sender_key: String,
    /// Ed25519 signing key claimed for the creating device.
    pub sender_ed25519: String,
    /// Session identifier.
    pub session_id: String,
    /// True when the key arrived through a forwarding chain rather than
    /// directly from its creator.
    pub forwarding_chain: bool,
    /// JSON session pickle.
    pub pickle: String,
}

/// Persisted peer device record. Trust is stored separately so wiping
/// device keys never wipes a trust decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDevice {
    /// Owning user.
    pub user_id: UserId,
    /// Device identifier.
    pub device_id: DeviceId,
    /// Pinned base64 Ed25519 signing key.
    pub ed25519: String,
    /// Current base64 Curve25519 identity key.
    pub curve25519: String,
    /// True once the server stopped listing the device.
    pub deleted: bool,
}

/// Persistence backend for encryption state.
///
/// # Contract
///
/// - `load_sessions` returns sessions most-recently-used first within each
///   peer key, matching the order `save_session` promotes them in.
/// - `save_session` upserts by `session_id` and moves the session to the
///   front of its peer's list.
/// - `save_device_keys` upserts each record by `(user_id, device_id)`.
pub trait CryptoStore: Clone + Send + Sync + 'static {
    /// Loads the account, if one was ever saved.
    fn load_account(&self) -> Result<Option<StoredAccount>, StoreError>;

    /// Saves the account, replacing any previous state.
    fn save_account(&self, account: &StoredAccount) -> Result<(), StoreError>;

    /// Loads all pairwise sessions as `(peer identity key, session)` pairs.
    fn load_sessions(&self) -> Result<Vec<(String, StoredSession)>, StoreError>;

    /// Upserts one pairwise session under its peer's identity key.
    fn save_session(&self, sender_key: &str, session: &StoredSession) -> Result<(), StoreError>;

    /// Loads all inbound group sessions.
    fn load_inbound_group_sessions(&self) -> Result<Vec<StoredInboundGroupSession>, StoreError>;

    /// Upserts one inbound group session, keyed by room, sender key, and
    /// session id.
    fn save_inbound_group_session(
        &self,
        session: &StoredInboundGroupSession,
    ) -> Result<(), StoreError>;

    /// Loads all known peer device records.
    fn load_device_keys(&self) -> Result<Vec<StoredDevice>, StoreError>;

    /// Upserts the given device records.
    fn save_device_keys(&self, devices: &[StoredDevice]) -> Result<(), StoreError>;

    /// Loads the trust flag for a device, if one was ever saved.
    fn load_trust_state(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<TrustState>, StoreError>;

    /// Saves the trust flag for a device.
    fn save_trust_state(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        trust: TrustState,
    ) -> Result<(), StoreError>;
}
