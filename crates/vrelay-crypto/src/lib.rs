#![forbid(unsafe_code)]

//! Signed request envelopes exchanged between miners and validators.
//!
//! A request body is bound to its sender (and optionally to an intended
//! receiver) by a set of HTTP headers carrying an Ed25519 signature, a
//! timestamp and a unique message id.

pub mod envelope;
pub mod hash;
pub mod headers;
pub mod identity;
pub mod verify;

#[cfg(test)]
mod proptests;

pub use envelope::{sign_request, sign_request_at, SignedEnvelope, PROTOCOL_VERSION};
pub use identity::{Identity, IdentityError, Keypair};
pub use verify::{
    verify_request, verify_secret_binding, FreshnessPolicy, SignerSet, VerificationError,
};
