//! Device identity account.
//!
//! Owns the long-lived Curve25519/Ed25519 identity keypair and the pool of
//! one-time prekeys. Wraps the underlying ratchet library account with the
//! publication state the session manager needs: whether device keys were
//! ever uploaded, and a pickle round-trip for persistence.

use vodozemac::{
    Curve25519PublicKey, Ed25519PublicKey,
    olm::{
        Account as RatchetAccount, AccountPickle, PreKeyMessage, Session, SessionConfig,
        SessionCreationError,
    },
};

use crate::store::{StoreError, StoredAccount};

/// Identity account for the local device.
pub struct Account {
    inner: RatchetAccount,
    shared: bool,
}

impl Account {
    /// Creates a fresh account with new identity keys.
    pub fn new() -> Self {
        Self { inner: RatchetAccount::new(), shared: false }
    }

    /// Restores an account from its persisted form.
    pub fn from_stored(stored: &StoredAccount) -> Result<Self, StoreError> {
        let pickle: AccountPickle = serde_json::from_str(&stored.pickle)?;
        Ok(Self { inner: RatchetAccount::from_pickle(pickle), shared: stored.shared })
    }

    /// Serializes the account for persistence.
    pub fn to_stored(&self) -> Result<StoredAccount, StoreError> {
        Ok(StoredAccount {
            shared: self.shared,
            pickle: serde_json::to_string(&self.inner.pickle())?,
        })
    }

    /// The account's Curve25519 identity key.
    pub fn curve25519_key(&self) -> Curve25519PublicKey {
        self.inner.curve25519_key()
    }

    /// The account's Ed25519 signing key.
    pub fn ed25519_key(&self) -> Ed25519PublicKey {
        self.inner.ed25519_key()
    }

    /// Whether the device keys have ever been published.
    pub fn shared(&self) -> bool {
        self.shared
    }

    /// Records that the device keys were accepted by the server.
    pub fn mark_shared(&mut self) {
        self.shared = true;
    }

    /// Discards local copies of one-time keys the server now holds.
    pub fn mark_keys_as_published(&mut self) {
        self.inner.mark_keys_as_published();
    }

    /// Upper bound on one-time keys the account can hold at once.
    pub fn max_one_time_keys(&self) -> usize {
        self.inner.max_number_of_one_time_keys()
    }

    /// Generates `count` fresh one-time keys. Budget enforcement happens
    /// in the session manager, which knows the server-side count.
    pub fn generate_one_time_keys(&mut self, count: usize) {
        let _ = self.inner.generate_one_time_keys(count);
    }

    /// Unpublished one-time keys as `(key id, base64 key)` pairs, sorted
    /// by key id for deterministic upload payloads.
    pub fn one_time_keys(&self) -> Vec<(String, String)> {
        let mut keys: Vec<(String, String)> = self
            .inner
            .one_time_keys()
            .into_iter()
            .map(|(key_id, key)| (key_id.to_base64(), key.to_base64()))
            .collect();
        keys.sort();
        keys
    }

    /// Signs a message with the Ed25519 identity key, returning the
    /// signature in base64.
    pub fn sign(&self, message: &str) -> String {
        self.inner.sign(message).to_base64()
    }

    /// Starts an outbound pairwise session using a claimed one-time key.
    pub fn create_outbound_session(
        &self,
        identity_key: Curve25519PublicKey,
        one_time_key: Curve25519PublicKey,
    ) -> Session {
        self.inner.create_outbound_session(SessionConfig::version_2(), identity_key, one_time_key)
    }

    /// Creates an inbound session from a prekey message, consuming the
    /// one-time key it references and decrypting the message in the same
    /// step.
    pub fn create_inbound_session(
        &mut self,
        sender_key: Curve25519PublicKey,
        message: &PreKeyMessage,
    ) -> Result<(Session, Vec<u8>), SessionCreationError> {
        let result = self.inner.create_inbound_session(sender_key, message)?;
        Ok((result.session, result.plaintext))
    }
}

impl Default for Account {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("curve25519", &self.inner.curve25519_key().to_base64())
            .field("shared", &self.shared)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use vodozemac::Ed25519Signature;

    use super::Account;

    #[test]
    fn pickle_round_trip_preserves_identity() {
        let mut account = Account::new();
        account.generate_one_time_keys(3);
        account.mark_shared();

        let stored = account.to_stored().unwrap();
        let restored = Account::from_stored(&stored).unwrap();

        assert_eq!(restored.curve25519_key(), account.curve25519_key());
        assert_eq!(restored.ed25519_key(), account.ed25519_key());
        assert!(restored.shared());
        assert_eq!(restored.one_time_keys(), account.one_time_keys());
    }

    #[test]
    fn publishing_clears_one_time_keys() {
        let mut account = Account::new();
        account.generate_one_time_keys(5);
        assert_eq!(account.one_time_keys().len(), 5);

        account.mark_keys_as_published();
        assert!(account.one_time_keys().is_empty());
    }

    #[test]
    fn signatures_verify_against_signing_key() {
        let account = Account::new();
        let signature = account.sign("payload");
        let signature = Ed25519Signature::from_base64(&signature).unwrap();
        assert!(account.ed25519_key().verify(b"payload", &signature).is_ok());
    }

    #[test]
    fn inbound_session_consumes_a_one_time_key() {
        let mut alice = Account::new();
        let mut bob = Account::new();
        bob.generate_one_time_keys(1);
        let (_, one_time_key) = bob.one_time_keys().remove(0);
        let one_time_key = vodozemac::Curve25519PublicKey::from_base64(&one_time_key).unwrap();
        bob.mark_keys_as_published();

        let mut outbound = alice.create_outbound_session(bob.curve25519_key(), one_time_key);
        let message = outbound.encrypt(b"hello bob");
        let vodozemac::olm::OlmMessage::PreKey(prekey) = message else {
            panic!("first message must be a prekey message");
        };

        let (inbound, plaintext) =
            bob.create_inbound_session(alice.curve25519_key(), &prekey).unwrap();
        assert_eq!(plaintext, b"hello bob");
        assert_eq!(inbound.session_id(), prekey.session_id());
    }
}
