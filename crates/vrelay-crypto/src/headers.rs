//! Envelope header names and case-insensitive lookup.

pub const PROTOCOL_VERSION: &str = "Protocol-Version";
pub const TIMESTAMP: &str = "Timestamp";
pub const MESSAGE_ID: &str = "Message-Id";
pub const SIGNED_BY: &str = "Signed-By";
pub const SIGNED_FOR: &str = "Signed-For";
pub const REQUEST_SIGNATURE: &str = "Request-Signature";
pub const SECRET_SIGNATURES: [&str; 3] = [
    "Secret-Signature-0",
    "Secret-Signature-1",
    "Secret-Signature-2",
];

/// All header names that make up an envelope, in emission order.
pub const ENVELOPE_HEADERS: [&str; 9] = [
    PROTOCOL_VERSION,
    TIMESTAMP,
    MESSAGE_ID,
    SIGNED_BY,
    SIGNED_FOR,
    REQUEST_SIGNATURE,
    SECRET_SIGNATURES[0],
    SECRET_SIGNATURES[1],
    SECRET_SIGNATURES[2],
];

/// Find `name` among `(key, value)` pairs ignoring ASCII case.
///
/// The first match wins.
pub fn find<'a, I>(pairs: I, name: &str) -> Option<&'a str>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    pairs
        .into_iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value)
}
