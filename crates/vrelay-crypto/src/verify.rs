//! Envelope verification.
//!
//! Checks run in a fixed order and stop at the first failure: version,
//! required fields, roster membership, freshness, recipient, signature.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::envelope::{
    request_signing_message, secret_binding_message, secret_bucket, SignedEnvelope,
    PROTOCOL_VERSION, SECRET_OFFSETS,
};
use crate::headers;
use crate::identity::{verify_signature, Identity};

/// Default tolerated age of a request, in milliseconds.
pub const ALLOWED_SKEW_MS: u64 = 8_000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    #[error("unsupported protocol version: {0:?}")]
    UnsupportedVersion(String),
    #[error("missing header: {0}")]
    MissingField(&'static str),
    #[error("malformed header: {0}")]
    MalformedField(&'static str),
    #[error("signer {0} is not a known identity")]
    UnknownSigner(String),
    #[error("request too stale: timestamp {timestamp} ms, now {now} ms")]
    Stale { timestamp: u64, now: u64 },
    #[error("request timestamp {timestamp} ms is ahead of now {now} ms")]
    FromFuture { timestamp: u64, now: u64 },
    #[error("request signed for {got}, expected {expected}")]
    WrongRecipient { expected: String, got: String },
    #[error("invalid request signature")]
    BadSignature,
    #[error("invalid secret-binding signatures")]
    BadSecretBinding,
}

impl VerificationError {
    /// Malformed or incomplete requests, as opposed to authentication failures.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedVersion(_) | Self::MissingField(_) | Self::MalformedField(_)
        )
    }

    /// Short machine-readable name used in API error bodies and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnsupportedVersion(_) => "unsupported_version",
            Self::MissingField(_) => "missing_field",
            Self::MalformedField(_) => "malformed_field",
            Self::UnknownSigner(_) => "unknown_signer",
            Self::Stale { .. } => "stale",
            Self::FromFuture { .. } => "from_future",
            Self::WrongRecipient { .. } => "wrong_recipient",
            Self::BadSignature => "bad_signature",
            Self::BadSecretBinding => "bad_secret_binding",
        }
    }
}

/// Accepted age and lead of a request timestamp relative to the verifier's clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessPolicy {
    pub allowed_skew_ms: u64,
    /// `None` disables the future bound.
    pub max_future_skew_ms: Option<u64>,
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self {
            allowed_skew_ms: ALLOWED_SKEW_MS,
            max_future_skew_ms: Some(ALLOWED_SKEW_MS),
        }
    }
}

impl FreshnessPolicy {
    pub fn check(&self, timestamp: u64, now: u64) -> Result<(), VerificationError> {
        if timestamp.saturating_add(self.allowed_skew_ms) < now {
            return Err(VerificationError::Stale { timestamp, now });
        }
        if let Some(max_future) = self.max_future_skew_ms {
            if timestamp > now.saturating_add(max_future) {
                return Err(VerificationError::FromFuture { timestamp, now });
            }
        }
        Ok(())
    }
}

/// The set of identities allowed to sign requests.
pub trait SignerSet {
    fn contains_signer(&self, identity: &Identity) -> bool;
}

impl SignerSet for HashSet<Identity> {
    fn contains_signer(&self, identity: &Identity) -> bool {
        self.contains(identity)
    }
}

impl<V> SignerSet for HashMap<Identity, V> {
    fn contains_signer(&self, identity: &Identity) -> bool {
        self.contains_key(identity)
    }
}

impl<V> SignerSet for BTreeMap<Identity, V> {
    fn contains_signer(&self, identity: &Identity) -> bool {
        self.contains_key(identity)
    }
}

impl<T: SignerSet + ?Sized> SignerSet for &T {
    fn contains_signer(&self, identity: &Identity) -> bool {
        (**self).contains_signer(identity)
    }
}

fn required<'a>(
    value: &'a Option<String>,
    name: &'static str,
) -> Result<&'a str, VerificationError> {
    match value.as_deref() {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(VerificationError::MissingField(name)),
    }
}

/// Verify `envelope` over `body` and return the authenticated signer.
///
/// When `expected_recipient` is given and the envelope is addressed, the
/// addressee must match it. Unaddressed envelopes pass that check.
pub fn verify_request<S: SignerSet + ?Sized>(
    envelope: &SignedEnvelope,
    body: &[u8],
    signers: &S,
    expected_recipient: Option<&Identity>,
    now_millis: u64,
    policy: &FreshnessPolicy,
) -> Result<Identity, VerificationError> {
    let version = envelope.version.as_deref().unwrap_or("");
    if version != PROTOCOL_VERSION {
        return Err(VerificationError::UnsupportedVersion(version.to_string()));
    }

    let signature = required(&envelope.signature, headers::REQUEST_SIGNATURE)?;
    let timestamp = required(&envelope.timestamp, headers::TIMESTAMP)?;
    let message_id = required(&envelope.message_id, headers::MESSAGE_ID)?;
    let signer = required(&envelope.signer, headers::SIGNED_BY)?;

    let timestamp_millis: u64 = timestamp
        .parse()
        .map_err(|_| VerificationError::MalformedField(headers::TIMESTAMP))?;

    let signer = Identity::parse(signer)
        .ok()
        .filter(|id| signers.contains_signer(id))
        .ok_or_else(|| VerificationError::UnknownSigner(signer.to_string()))?;

    policy.check(timestamp_millis, now_millis)?;

    if let Some(expected) = expected_recipient {
        if envelope.is_addressed() && Identity::from_wire(envelope.recipient()) != *expected {
            return Err(VerificationError::WrongRecipient {
                expected: expected.to_string(),
                got: envelope.recipient().to_string(),
            });
        }
    }

    let message = request_signing_message(body, message_id, timestamp, envelope.recipient());
    verify_signature(&signer, message.as_bytes(), signature)
        .map_err(|_| VerificationError::BadSignature)?;

    Ok(signer)
}

/// Check that the sender deliberately addressed `expected_recipient`.
///
/// Passes when the envelope is addressed to `expected_recipient` and at
/// least one of its secret signatures verifies for its bucket offset.
pub fn verify_secret_binding(envelope: &SignedEnvelope, expected_recipient: &Identity) -> bool {
    let (Some(timestamp), Some(signer), Some(recipient)) = (
        envelope.timestamp.as_deref(),
        envelope.signer.as_deref(),
        envelope.recipient.as_deref(),
    ) else {
        return false;
    };

    if Identity::from_wire(recipient) != *expected_recipient {
        return false;
    }

    let (Ok(timestamp_millis), Ok(signer)) = (timestamp.parse::<u64>(), Identity::parse(signer))
    else {
        return false;
    };

    let bucket = secret_bucket(timestamp_millis);
    envelope
        .secret_signatures
        .iter()
        .zip(SECRET_OFFSETS)
        .any(|(signature, offset)| {
            let Some(signature) = signature.as_deref() else {
                return false;
            };
            let message = secret_binding_message(bucket, offset, recipient);
            verify_signature(&signer, message.as_bytes(), signature).is_ok()
        })
}
