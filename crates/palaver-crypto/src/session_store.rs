//! Pairwise session store.
//!
//! Sessions are grouped by the peer's Curve25519 identity key (base64) and
//! kept most-recently-used first, so decryption scans try the likeliest
//! session before older ones. Several live sessions per peer are normal:
//! both sides may start a session concurrently, and either may lose state
//! and re-handshake.

use std::collections::HashMap;

use vodozemac::olm::Session;

/// In-memory collection of pairwise sessions.
#[derive(Default)]
pub struct SessionStore {
    sessions: HashMap<String, Vec<Session>>,
}

impl SessionStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a session for a peer, making it the most recently used.
    pub fn add(&mut self, sender_key: &str, session: Session) {
        self.sessions.entry(sender_key.to_owned()).or_default().insert(0, session);
    }

    /// Appends a session at the end of a peer's list, preserving the order
    /// sessions were loaded in.
    pub fn push_back(&mut self, sender_key: &str, session: Session) {
        self.sessions.entry(sender_key.to_owned()).or_default().push(session);
    }

    /// True when at least one session exists for the peer.
    pub fn contains(&self, sender_key: &str) -> bool {
        self.sessions.get(sender_key).is_some_and(|list| !list.is_empty())
    }

    /// All sessions for a peer, most recently used first.
    pub fn get(&self, sender_key: &str) -> Option<&[Session]> {
        self.sessions.get(sender_key).map(Vec::as_slice)
    }

    /// Mutable access to a peer's sessions for decryption scans.
    pub fn get_mut(&mut self, sender_key: &str) -> Option<&mut Vec<Session>> {
        self.sessions.get_mut(sender_key)
    }

    /// The most recently used session for a peer.
    pub fn most_recent_mut(&mut self, sender_key: &str) -> Option<&mut Session> {
        self.sessions.get_mut(sender_key)?.first_mut()
    }

    /// Moves the session at `index` to the front of its peer's list and
    /// returns a reference to it.
    pub fn promote(&mut self, sender_key: &str, index: usize) -> Option<&Session> {
        let list = self.sessions.get_mut(sender_key)?;
        if index >= list.len() {
            return None;
        }
        let session = list.remove(index);
        list.insert(0, session);
        list.first()
    }

    /// Total number of sessions across all peers.
    pub fn len(&self) -> usize {
        self.sessions.values().map(Vec::len).sum()
    }

    /// True when no sessions exist at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("peers", &self.sessions.len())
            .field("sessions", &self.len())
            .finish()
    }
}
