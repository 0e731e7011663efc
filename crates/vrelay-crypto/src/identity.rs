//! Identities and signing keys.
//!
//! An identity is the lowercase hex encoding of an Ed25519 public key. It is
//! the principal every roster lookup, stake query and rate-limit window is
//! keyed by.

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand_core::OsRng;

/// Error type for identity and signature decoding.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
    #[error("invalid hex encoding")]
    InvalidHex,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid signature")]
    InvalidSignature,
}

/// Public identity of a network participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(String);

impl Identity {
    /// Parse and normalize a hex-encoded public key.
    pub fn parse(s: &str) -> Result<Self, IdentityError> {
        let bytes = hex::decode(s.trim()).map_err(|_| IdentityError::InvalidHex)?;
        let bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::InvalidKeyLength {
                expected: 32,
                got: bytes.len(),
            })?;
        VerifyingKey::from_bytes(&bytes).map_err(|_| IdentityError::InvalidPublicKey)?;
        Ok(Self(hex::encode(bytes)))
    }

    /// Wrap a wire string without validating it.
    ///
    /// Used for identities that are only compared, never verified against.
    pub fn from_wire(s: &str) -> Self {
        Self(s.trim().to_ascii_lowercase())
    }

    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        Self(hex::encode(key.to_bytes()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decode the Ed25519 public key behind this identity.
    pub fn verifying_key(&self) -> Result<VerifyingKey, IdentityError> {
        let bytes = hex::decode(&self.0).map_err(|_| IdentityError::InvalidHex)?;
        let bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::InvalidKeyLength {
                expected: 32,
                got: bytes.len(),
            })?;
        VerifyingKey::from_bytes(&bytes).map_err(|_| IdentityError::InvalidPublicKey)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Identity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Ed25519 signing key together with its public identity.
pub struct Keypair {
    sign_key: SigningKey,
    identity: Identity,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Create a keypair from a 32-byte Ed25519 seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(seed))
    }

    /// Create a keypair from a hex-encoded 32-byte seed.
    pub fn from_seed_hex(seed_hex: &str) -> Result<Self, IdentityError> {
        let bytes = hex::decode(seed_hex.trim()).map_err(|_| IdentityError::InvalidHex)?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::InvalidKeyLength {
                expected: 32,
                got: bytes.len(),
            })?;
        Ok(Self::from_seed(&seed))
    }

    fn from_signing_key(sign_key: SigningKey) -> Self {
        let identity = Identity::from_verifying_key(&sign_key.verifying_key());
        Self { sign_key, identity }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Sign a message and return the wire encoding (`0x` + hex).
    pub fn sign(&self, message: &[u8]) -> String {
        let signature: Signature = self.sign_key.sign(message);
        encode_signature(&signature.to_bytes())
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

pub fn encode_signature(signature: &[u8; 64]) -> String {
    format!("0x{}", hex::encode(signature))
}

/// Decode a wire signature; the `0x` prefix is optional.
pub fn decode_signature(s: &str) -> Result<[u8; 64], IdentityError> {
    let s = s.trim();
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(s).map_err(|_| IdentityError::InvalidHex)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| IdentityError::InvalidKeyLength {
            expected: 64,
            got: bytes.len(),
        })
}

/// Verify a wire-encoded Ed25519 signature from `signer` over `message`.
pub fn verify_signature(
    signer: &Identity,
    message: &[u8],
    signature: &str,
) -> Result<(), IdentityError> {
    let verifying_key = signer.verifying_key()?;
    let sig = Signature::from_bytes(&decode_signature(signature)?);
    verifying_key
        .verify_strict(message, &sig)
        .map_err(|_| IdentityError::InvalidSignature)
}
