//! Signed request envelope construction and header codec.
//!
//! The request signature covers
//! `hex(sha256(body)) . message_id . timestamp . recipient`, where an
//! unaddressed request uses the empty string as recipient. Addressed
//! requests additionally carry three secret-binding signatures over
//! `"{bucket + offset}.{recipient}"` for offsets -1, 0 and +1, where the
//! bucket is the timestamp rounded up to the next 10 second boundary.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::hash::sha256_hex;
use crate::headers;
use crate::identity::{Identity, Keypair};

/// Supported protocol version tag.
pub const PROTOCOL_VERSION: &str = "2";

/// Width of a secret-binding time bucket in milliseconds.
pub const SECRET_BUCKET_MS: u64 = 10_000;

/// Offsets tried around the bucket, one per secret signature slot.
pub const SECRET_OFFSETS: [i64; 3] = [-1, 0, 1];

/// Wire-level envelope as carried in request headers.
///
/// Fields are kept as received so that verification can report exactly
/// which one is missing or malformed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignedEnvelope {
    pub version: Option<String>,
    pub timestamp: Option<String>,
    pub message_id: Option<String>,
    pub signer: Option<String>,
    pub recipient: Option<String>,
    pub signature: Option<String>,
    pub secret_signatures: [Option<String>; 3],
}

impl SignedEnvelope {
    /// Parse an envelope from header pairs. Header names match case-insensitively.
    pub fn from_headers<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
        I::IntoIter: Clone,
    {
        let pairs = pairs.into_iter();
        let get = |name: &str| headers::find(pairs.clone(), name).map(str::to_owned);

        Self {
            version: get(headers::PROTOCOL_VERSION),
            timestamp: get(headers::TIMESTAMP),
            message_id: get(headers::MESSAGE_ID),
            signer: get(headers::SIGNED_BY),
            recipient: get(headers::SIGNED_FOR),
            signature: get(headers::REQUEST_SIGNATURE),
            secret_signatures: [
                get(headers::SECRET_SIGNATURES[0]),
                get(headers::SECRET_SIGNATURES[1]),
                get(headers::SECRET_SIGNATURES[2]),
            ],
        }
    }

    /// Parse from a string map, e.g. the relayed headers inside a gossip message.
    pub fn from_header_map(map: &BTreeMap<String, String>) -> Self {
        Self::from_headers(map.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }

    /// Emit the present fields as `(name, value)` header pairs.
    pub fn to_headers(&self) -> Vec<(&'static str, String)> {
        let fields = [
            (headers::PROTOCOL_VERSION, &self.version),
            (headers::TIMESTAMP, &self.timestamp),
            (headers::MESSAGE_ID, &self.message_id),
            (headers::SIGNED_BY, &self.signer),
            (headers::SIGNED_FOR, &self.recipient),
            (headers::REQUEST_SIGNATURE, &self.signature),
            (headers::SECRET_SIGNATURES[0], &self.secret_signatures[0]),
            (headers::SECRET_SIGNATURES[1], &self.secret_signatures[1]),
            (headers::SECRET_SIGNATURES[2], &self.secret_signatures[2]),
        ];
        fields
            .into_iter()
            .filter_map(|(name, value)| value.as_ref().map(|v| (name, v.clone())))
            .collect()
    }

    pub fn to_header_map(&self) -> BTreeMap<String, String> {
        self.to_headers()
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect()
    }

    /// Intended receiver, or the empty string when unaddressed.
    pub fn recipient(&self) -> &str {
        self.recipient.as_deref().unwrap_or("")
    }

    pub fn is_addressed(&self) -> bool {
        !self.recipient().is_empty()
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn signer(&self) -> Option<&str> {
        self.signer.as_deref()
    }
}

/// The string covered by the request signature.
pub fn request_signing_message(
    body: &[u8],
    message_id: &str,
    timestamp: &str,
    recipient: &str,
) -> String {
    format!("{}.{}.{}.{}", sha256_hex(body), message_id, timestamp, recipient)
}

/// Round a millisecond timestamp up to the next secret-binding bucket boundary.
pub fn secret_bucket(timestamp_millis: u64) -> u64 {
    timestamp_millis.div_ceil(SECRET_BUCKET_MS) * SECRET_BUCKET_MS
}

/// The string covered by one secret-binding signature.
pub fn secret_binding_message(bucket: u64, offset: i64, recipient: &str) -> String {
    format!("{}.{}", i128::from(bucket) + i128::from(offset), recipient)
}

/// Sign `body` with a fresh timestamp and message id.
///
/// The body itself is not modified; the caller sends it alongside the
/// returned envelope headers.
pub fn sign_request(
    body: &[u8],
    sender: &Keypair,
    recipient: Option<&Identity>,
) -> SignedEnvelope {
    let timestamp_millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    let message_id = uuid::Uuid::new_v4().to_string();
    sign_request_at(body, sender, recipient, timestamp_millis, &message_id)
}

/// Sign `body` with an explicit timestamp and message id.
pub fn sign_request_at(
    body: &[u8],
    sender: &Keypair,
    recipient: Option<&Identity>,
    timestamp_millis: u64,
    message_id: &str,
) -> SignedEnvelope {
    let timestamp = timestamp_millis.to_string();
    let recipient_str = recipient.map(Identity::as_str).unwrap_or("");
    let message = request_signing_message(body, message_id, &timestamp, recipient_str);

    let mut envelope = SignedEnvelope {
        version: Some(PROTOCOL_VERSION.to_string()),
        timestamp: Some(timestamp),
        message_id: Some(message_id.to_string()),
        signer: Some(sender.identity().to_string()),
        recipient: None,
        signature: Some(sender.sign(message.as_bytes())),
        secret_signatures: [None, None, None],
    };

    if let Some(recipient) = recipient {
        let bucket = secret_bucket(timestamp_millis);
        envelope.recipient = Some(recipient.to_string());
        for (slot, offset) in SECRET_OFFSETS.iter().enumerate() {
            let message = secret_binding_message(bucket, *offset, recipient.as_str());
            envelope.secret_signatures[slot] = Some(sender.sign(message.as_bytes()));
        }
    }

    envelope
}
