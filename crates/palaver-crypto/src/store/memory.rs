//! In-memory store.
//!
//! Reference implementation of [`CryptoStore`], used by tests and by
//! callers that accept losing state on shutdown. Cloning shares the same
//! underlying state.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use palaver_proto::{DeviceId, UserId};

use super::{
    CryptoStore, StoreError, StoredAccount, StoredDevice, StoredInboundGroupSession,
    StoredSession,
};
use crate::device::TrustState;

#[derive(Debug, Default)]
struct Inner {
    account: Option<StoredAccount>,
    /// Peer identity key -> sessions, most-recently-used first.
    sessions: HashMap<String, Vec<StoredSession>>,
    /// (room, sender key, session id) -> session.
    inbound_group_sessions: HashMap<(String, String, String), StoredInboundGroupSession>,
    devices: HashMap<(UserId, DeviceId), StoredDevice>,
    trust: HashMap<(UserId, DeviceId), TrustState>,
}

/// Shared in-memory persistence backend.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned lock only means another thread panicked mid-write;
        // the data itself is still coherent for our access pattern.
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl CryptoStore for MemoryStore {
    fn load_account(&self) -> Result<Option<StoredAccount>, StoreError> {
        Ok(self.lock().account.clone())
    }

    fn save_account(&self, account: &StoredAccount) -> Result<(), StoreError> {
        self.lock().account = Some(account.clone());
        Ok(())
    }

    fn load_sessions(&self) -> Result<Vec<(String, StoredSession)>, StoreError> {
        let inner = self.lock();
        let mut sessions = Vec::new();
        for (sender_key, list) in &inner.sessions {
            for session in list {
                sessions.push((sender_key.clone(), session.clone()));
            }
        }
        Ok(sessions)
    }

    fn save_session(&self, sender_key: &str, session: &StoredSession) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let list = inner.sessions.entry(sender_key.to_owned()).or_default();
        list.retain(|existing| existing.session_id != session.session_id);
        list.insert(0, session.clone());
        Ok(())
    }

    fn load_inbound_group_sessions(&self) -> Result<Vec<StoredInboundGroupSession>, StoreError> {
        Ok(self.lock().inbound_group_sessions.values().cloned().collect())
    }

    fn save_inbound_group_session(
        &self,
        session: &StoredInboundGroupSession,
    ) -> Result<(), StoreError> {
        let key =
            (session.room_id.clone(), session.sender_key.clone(), session.session_id.clone());
        self.lock().inbound_group_sessions.insert(key, session.clone());
        Ok(())
    }

    fn load_device_keys(&self) -> Result<Vec<StoredDevice>, StoreError> {
        Ok(self.lock().devices.values().cloned().collect())
    }

    fn save_device_keys(&self, devices: &[StoredDevice]) -> Result<(), StoreError> {
        let mut inner = self.lock();
        for device in devices {
            inner
                .devices
                .insert((device.user_id.clone(), device.device_id.clone()), device.clone());
        }
        Ok(())
    }

    fn load_trust_state(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<TrustState>, StoreError> {
        Ok(self.lock().trust.get(&(user_id.clone(), device_id.clone())).copied())
    }

    fn save_trust_state(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        trust: TrustState,
    ) -> Result<(), StoreError> {
        self.lock().trust.insert((user_id.clone(), device_id.clone()), trust);
        Ok(())
    }
}
