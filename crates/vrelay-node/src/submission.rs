//! Submission payloads and the gossip wrapper around them.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Twitter,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Twitter => "twitter",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmissionError {
    #[error("one of account_id or username is required")]
    MissingAccount,
    #[error("interaction_id requires post_id")]
    InteractionWithoutPost,
    #[error("one of verification_post_id or owner is required")]
    MissingVerification,
}

/// A claim that an account (and optionally one of its posts or
/// interactions) belongs to a miner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub platform: Platform,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_post_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interaction_id: Option<String>,
    /// Explicit owning identity when submitted on someone else's behalf.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

fn present(field: &Option<String>) -> bool {
    field.as_deref().is_some_and(|v| !v.is_empty())
}

impl Submission {
    pub fn validate(&self) -> Result<(), SubmissionError> {
        if !present(&self.account_id) && !present(&self.username) {
            return Err(SubmissionError::MissingAccount);
        }
        if present(&self.interaction_id) && !present(&self.post_id) {
            return Err(SubmissionError::InteractionWithoutPost);
        }
        if !present(&self.verification_post_id) && !present(&self.owner) {
            return Err(SubmissionError::MissingVerification);
        }
        Ok(())
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref().filter(|o| !o.is_empty())
    }
}

/// Known payload schemas that can travel inside a gossip message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadSchema {
    Submission,
}

impl PayloadSchema {
    pub fn name(&self) -> &'static str {
        match self {
            PayloadSchema::Submission => "Submission",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Submission(Submission),
}

impl Payload {
    pub fn schema(&self) -> PayloadSchema {
        match self {
            Payload::Submission(_) => PayloadSchema::Submission,
        }
    }

    pub fn validate(&self) -> Result<(), SubmissionError> {
        match self {
            Payload::Submission(s) => s.validate(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("unknown payload schema: {0}")]
    UnknownSchema(String),
    #[error("failed to decode {schema} payload: {source}")]
    Decode {
        schema: &'static str,
        source: serde_json::Error,
    },
}

type Decoder = fn(&[u8]) -> Result<Payload, serde_json::Error>;

fn decode_submission(bytes: &[u8]) -> Result<Payload, serde_json::Error> {
    serde_json::from_slice(bytes).map(Payload::Submission)
}

/// Maps a schema name to its decoder. Unknown names are rejected.
#[derive(Clone)]
pub struct SchemaRegistry {
    decoders: HashMap<&'static str, (PayloadSchema, Decoder)>,
}

impl SchemaRegistry {
    pub fn empty() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    pub fn register(&mut self, schema: PayloadSchema, decoder: Decoder) {
        self.decoders.insert(schema.name(), (schema, decoder));
    }

    pub fn lookup(&self, name: &str) -> Option<PayloadSchema> {
        self.decoders.get(name).map(|(schema, _)| *schema)
    }

    pub fn decode(&self, name: &str, bytes: &[u8]) -> Result<Payload, SchemaError> {
        let (schema, decoder) = self
            .decoders
            .get(name)
            .ok_or_else(|| SchemaError::UnknownSchema(name.to_string()))?;
        decoder(bytes).map_err(|source| SchemaError::Decode {
            schema: schema.name(),
            source,
        })
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(PayloadSchema::Submission, decode_submission);
        registry
    }
}

/// A relayed submission: the original signed body and headers, as received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipEnvelope {
    pub original_body_hex: String,
    pub original_body_schema: String,
    pub original_headers: BTreeMap<String, String>,
    /// Relay time in unix milliseconds.
    pub forwarded_at: u64,
}

impl GossipEnvelope {
    pub fn new(
        original_body: &[u8],
        schema: PayloadSchema,
        original_headers: BTreeMap<String, String>,
        forwarded_at: u64,
    ) -> Self {
        Self {
            original_body_hex: hex::encode(original_body),
            original_body_schema: schema.name().to_string(),
            original_headers,
            forwarded_at,
        }
    }

    pub fn original_body(&self) -> Result<Vec<u8>, hex::FromHexError> {
        hex::decode(&self.original_body_hex)
    }
}
