//! Encryption Session Manager
//!
//! Per-device end-to-end encryption state for a federated messaging client:
//! the device's identity account and one-time keys, a directory of peer
//! devices with trust decisions, pairwise double-ratchet sessions, and
//! group ratchet sessions with rotation and sharing.
//!
//! # Architecture
//!
//! The crate is sans-IO. [`Machine`] consumes parsed server responses and
//! produces request payloads; the caller owns the transport. Durable state
//! flows through the [`store::CryptoStore`] trait so a process restart
//! resumes mid-conversation without losing ratchet positions.
//!
//! # Components
//!
//! - [`Machine`]: orchestrates every encrypt/decrypt path
//! - [`Account`]: identity keys and one-time key lifecycle
//! - [`DeviceDirectory`]: peer device records with key pinning and trust
//! - [`SessionStore`]: pairwise sessions, most-recently-used first
//! - [`GroupSessionStore`] / [`OutboundGroupSession`]: group ratchets
//! - [`store::MemoryStore`]: reference in-memory persistence backend

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod account;
mod device;
mod error;
mod group_session;
mod machine;
mod session_store;
mod signing;
pub mod store;

pub use account::Account;
pub use device::{Device, DeviceDirectory, TrustState};
pub use error::{
    AuthenticationError, EncryptionError, GroupEncryptionError, TrustError, VerificationError,
};
pub use group_session::{
    GroupSessionStore, InboundGroupSession, OutboundGroupSession, RotationPolicy,
};
pub use machine::{DecryptedRoomMessage, Machine, RoomMessage, UndecryptableMessage};
pub use session_store::SessionStore;
pub use signing::verify_signed;
