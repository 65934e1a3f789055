//! Error taxonomy for the encryption layer.
//!
//! Split by the decision a caller has to make: authentication failures mean
//! a payload or key could not be proven genuine, trust failures mean policy
//! blocked an otherwise-valid operation, group errors mean an outbound
//! session is unusable, verification failures mean a decrypted envelope was
//! addressed to someone else. [`EncryptionError`] is the umbrella that every
//! `Machine` operation returns.

use palaver_proto::{DeviceId, RoomId, UserId};

use crate::store::StoreError;

/// A payload, key, or signature failed cryptographic authentication.
#[derive(Debug, thiserror::Error)]
pub enum AuthenticationError {
    /// The payload carries no signature from the expected device.
    #[error("missing signature from {user_id}/{device_id}")]
    MissingSignature {
        /// User expected to have signed.
        user_id: UserId,
        /// Device expected to have signed.
        device_id: DeviceId,
    },

    /// The signature was present but did not verify.
    #[error("invalid signature from {user_id}/{device_id}")]
    InvalidSignature {
        /// Claimed signer.
        user_id: UserId,
        /// Claimed signing device.
        device_id: DeviceId,
    },

    /// A device keys payload named a different user or device than the
    /// response slot it arrived in.
    #[error("device keys payload for {user_id}/{device_id} names a different owner")]
    MismatchedOwner {
        /// Expected user.
        user_id: UserId,
        /// Expected device.
        device_id: DeviceId,
    },

    /// A device keys payload was missing its identity keys.
    #[error("malformed device keys for {user_id}/{device_id}")]
    MalformedDeviceKeys {
        /// User the payload was for.
        user_id: UserId,
        /// Device the payload was for.
        device_id: DeviceId,
    },

    /// A claimed one-time key was missing its key material.
    #[error("malformed one-time key from {user_id}/{device_id}")]
    MalformedOneTimeKey {
        /// User the key was claimed from.
        user_id: UserId,
        /// Device the key was claimed from.
        device_id: DeviceId,
    },

    /// A device re-announced itself with a different Ed25519 signing key.
    /// The pinned key wins; the new record is discarded.
    #[error("signing key changed for {user_id}/{device_id}")]
    SigningKeyChanged {
        /// User whose device changed keys.
        user_id: UserId,
        /// Device that changed keys.
        device_id: DeviceId,
    },
}

/// Local trust policy blocked an operation.
#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    /// A group session would be shared with a device nobody has reviewed.
    /// Unset trust is never silently skipped.
    #[error("device {user_id}/{device_id} is neither verified nor blacklisted")]
    UnreviewedDevice {
        /// User owning the unreviewed device.
        user_id: UserId,
        /// The unreviewed device.
        device_id: DeviceId,
    },
}

/// An outbound group session cannot encrypt.
#[derive(Debug, thiserror::Error)]
pub enum GroupEncryptionError {
    /// No outbound group session exists for the room.
    #[error("no outbound group session for room {room_id}")]
    MissingSession {
        /// Room without a session.
        room_id: RoomId,
    },

    /// The session exists but has never been shared with anyone.
    #[error("group session for room {room_id} has not been shared")]
    NotShared {
        /// Room whose session is unshared.
        room_id: RoomId,
    },

    /// The session passed its rotation threshold. The caller must rotate
    /// and re-share before encrypting again.
    #[error("group session for room {room_id} has expired")]
    Expired {
        /// Room whose session expired.
        room_id: RoomId,
    },
}

/// A decrypted envelope failed its binding checks.
#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    /// The envelope's claimed sender differs from the transport sender.
    #[error("envelope sender {claimed} does not match transport sender {actual}")]
    SenderMismatch {
        /// Sender named inside the envelope.
        claimed: UserId,
        /// Sender the message actually arrived from.
        actual: UserId,
    },

    /// The envelope was addressed to a different user.
    #[error("envelope recipient {recipient} is not us")]
    RecipientMismatch {
        /// Recipient named inside the envelope.
        recipient: UserId,
    },

    /// The envelope was addressed to a different signing key.
    #[error("envelope recipient key does not match our signing key")]
    RecipientKeyMismatch,

    /// A group envelope was encrypted for a different room.
    #[error("envelope room {claimed} does not match receiving room {actual}")]
    RoomMismatch {
        /// Room named inside the envelope.
        claimed: RoomId,
        /// Room the ciphertext arrived in.
        actual: RoomId,
    },

    /// A verified device's pinned keys disagree with the keys bound to the
    /// group session. Either the device record or the session is lying.
    #[error("keys of verified device {user_id}/{device_id} do not match the group session")]
    DeviceKeyMismatch {
        /// User owning the device.
        user_id: UserId,
        /// The disagreeing device.
        device_id: DeviceId,
    },
}

/// Umbrella error for every session manager operation.
#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    /// Persistence failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Authentication failed.
    #[error("authentication error: {0}")]
    Authentication(#[from] AuthenticationError),

    /// Trust policy blocked the operation.
    #[error("trust error: {0}")]
    Trust(#[from] TrustError),

    /// Outbound group session is unusable.
    #[error("group encryption error: {0}")]
    Group(#[from] GroupEncryptionError),

    /// Envelope binding check failed.
    #[error("verification error: {0}")]
    Verification(#[from] VerificationError),

    /// A public key failed to decode.
    #[error("malformed key: {0}")]
    Key(#[from] vodozemac::KeyError),

    /// A wire message failed to decode.
    #[error("malformed ciphertext: {0}")]
    Decode(#[from] vodozemac::DecodeError),

    /// A JSON payload failed to serialize or parse.
    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),

    /// Creating an inbound session from a prekey message failed.
    #[error("inbound session creation failed: {0}")]
    SessionCreation(#[from] vodozemac::olm::SessionCreationError),

    /// A group ciphertext failed to decrypt.
    #[error("group decryption failed: {0}")]
    GroupDecryption(#[from] vodozemac::megolm::DecryptionError),

    /// An exported group session key failed to decode.
    #[error("malformed group session key: {0}")]
    MalformedSessionKey(String),

    /// A normal (non-prekey) message arrived with no session able to
    /// decrypt it.
    #[error("no pairwise session for sender key {sender_key}")]
    MissingSession {
        /// Sender identity key the message came from.
        sender_key: String,
    },

    /// The session a prekey message belongs to exists but failed to
    /// decrypt it. Terminal: retrying or creating a new session would
    /// desynchronize the ratchet.
    #[error("matching session failed to decrypt prekey message from {sender_key}")]
    MatchingSessionFailed {
        /// Sender identity key the message came from.
        sender_key: String,
    },

    /// A group session share requires a pairwise session that does not
    /// exist.
    #[error("no pairwise session with {user_id}/{device_id}")]
    MissingOlmSession {
        /// User the share was addressed to.
        user_id: UserId,
        /// Device missing a session.
        device_id: DeviceId,
    },

    /// A group session share produced no messages for a target user.
    #[error("no reachable devices for user {user_id}")]
    NoReachableDevices {
        /// User with nothing to share to.
        user_id: UserId,
    },

    /// A group ciphertext referenced a session we never received.
    #[error("unknown inbound group session {session_id} in room {room_id}")]
    UnknownInboundGroupSession {
        /// Room the ciphertext arrived in.
        room_id: RoomId,
        /// Session the ciphertext claims to use.
        session_id: String,
    },

    /// An operation referenced a device not present in the directory.
    #[error("unknown device {user_id}/{device_id}")]
    UnknownDevice {
        /// User the device belongs to.
        user_id: UserId,
        /// The unknown device.
        device_id: DeviceId,
    },

    /// Generating one-time keys would exceed the outstanding-key budget.
    #[error("one-time key budget exceeded: {outstanding} outstanding of {limit}")]
    KeyBudgetExceeded {
        /// Keys already outstanding (uploaded plus pending).
        outstanding: u64,
        /// Maximum outstanding keys allowed.
        limit: u64,
    },

    /// A key upload was requested before the first upload response told us
    /// how many keys the server holds.
    #[error("server one-time key count unknown, upload response not yet seen")]
    UploadCountUnknown,

    /// A payload used an algorithm this implementation does not speak.
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// A pairwise ciphertext used an unknown wire format discriminator.
    #[error("unknown pairwise message type {0}")]
    UnknownMessageType(usize),
}
