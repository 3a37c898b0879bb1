//! Per-author signing keys for BookChat
//!
//! - [`KeyManager`]: generate, rotate, sign, verify
//! - [`PublicKeyHistory`]: the append-only list of an author's public keys,
//!   published on the author's branch so other clones can verify
//!
//! Verification is always a boolean. A message with a missing or bad
//! signature is still a message; it is just not `verified`.

#![forbid(unsafe_code)]

pub mod error;
pub mod manager;
pub mod record;

pub use error::{KeyError, Result};
pub use manager::{KeyManager, KeyOutcome};
pub use record::{PublicKeyHistory, PublicKeyRecord, SignatureToken, fingerprint};
