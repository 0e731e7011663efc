//! Request authentication for the submission and gossip routes.

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vrelay_crypto::{
    verify_request, verify_secret_binding, FreshnessPolicy, Identity, SignedEnvelope,
    VerificationError,
};

use crate::membership::MembershipSnapshot;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Maximum age of a direct or relay request.
    pub allowed_skew_ms: u64,
    /// Maximum lead of a request timestamp over the local clock.
    pub max_future_skew_ms: u64,
    /// Maximum age of the original request inside a relay message.
    pub gossip_inner_max_age_ms: u64,
    /// Require valid secret-binding signatures on addressed requests.
    pub require_secret_binding: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            allowed_skew_ms: 8_000,
            max_future_skew_ms: 8_000,
            gossip_inner_max_age_ms: 60_000,
            require_secret_binding: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error(transparent)]
    Verification(#[from] VerificationError),
    #[error("{0} is not allowed to relay submissions")]
    NotPrivileged(Identity),
}

impl AuthConfig {
    pub fn direct_policy(&self) -> FreshnessPolicy {
        FreshnessPolicy {
            allowed_skew_ms: self.allowed_skew_ms,
            max_future_skew_ms: Some(self.max_future_skew_ms),
        }
    }

    pub fn relayed_policy(&self) -> FreshnessPolicy {
        FreshnessPolicy {
            allowed_skew_ms: self.gossip_inner_max_age_ms,
            max_future_skew_ms: Some(self.max_future_skew_ms),
        }
    }

    /// Authenticate a direct submission. Addressed requests must be bound to this node.
    pub fn verify_direct(
        &self,
        envelope: &SignedEnvelope,
        body: &[u8],
        membership: &dyn MembershipSnapshot,
        now_millis: u64,
    ) -> Result<Identity, AuthError> {
        let self_identity = membership.self_identity();
        let signer = verify_request(
            envelope,
            body,
            membership,
            Some(&self_identity),
            now_millis,
            &self.direct_policy(),
        )?;

        if self.require_secret_binding
            && envelope.is_addressed()
            && !verify_secret_binding(envelope, &self_identity)
        {
            return Err(VerificationError::BadSecretBinding.into());
        }
        Ok(signer)
    }

    /// Authenticate the outer envelope of a relay message.
    ///
    /// The relayer must be privileged, and with secret binding enabled the
    /// message must be addressed and bound to this node.
    pub fn verify_relay(
        &self,
        envelope: &SignedEnvelope,
        body: &[u8],
        membership: &dyn MembershipSnapshot,
        now_millis: u64,
    ) -> Result<Identity, AuthError> {
        let self_identity = membership.self_identity();
        let relayer = verify_request(
            envelope,
            body,
            membership,
            Some(&self_identity),
            now_millis,
            &self.direct_policy(),
        )?;

        if !membership.is_privileged(&relayer) {
            return Err(AuthError::NotPrivileged(relayer));
        }
        if self.require_secret_binding && !verify_secret_binding(envelope, &self_identity) {
            return Err(VerificationError::BadSecretBinding.into());
        }
        Ok(relayer)
    }

    /// Authenticate the original request carried inside a relay message.
    ///
    /// It was addressed to the relaying validator, not to this node.
    pub fn verify_relayed(
        &self,
        envelope: &SignedEnvelope,
        body: &[u8],
        membership: &dyn MembershipSnapshot,
        relayer: &Identity,
        now_millis: u64,
    ) -> Result<Identity, AuthError> {
        let signer = verify_request(
            envelope,
            body,
            membership,
            Some(relayer),
            now_millis,
            &self.relayed_policy(),
        )?;

        if self.require_secret_binding
            && envelope.is_addressed()
            && !verify_secret_binding(envelope, relayer)
        {
            return Err(VerificationError::BadSecretBinding.into());
        }
        Ok(signer)
    }
}

/// Read the envelope headers of an inbound request.
///
/// Values that are not visible ASCII are treated as absent.
pub fn envelope_from_headers(headers: &HeaderMap) -> SignedEnvelope {
    let pairs: Vec<(&str, &str)> = headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v)))
        .collect();
    SignedEnvelope::from_headers(pairs.iter().copied())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::{Member, Roster, RosterMembership};
    use axum::http::{HeaderName, HeaderValue};
    use vrelay_crypto::{sign_request_at, Keypair};

    const NOW: u64 = 1_700_000_000_000;

    struct Net {
        me: Keypair,
        validator: Keypair,
        miner: Keypair,
        membership: RosterMembership,
    }

    fn net() -> Net {
        let me = Keypair::generate();
        let validator = Keypair::generate();
        let miner = Keypair::generate();
        let member = |privileged| Member {
            stake: 100.0,
            privileged,
            address: None,
        };
        let roster = Roster::new()
            .with_member(me.identity().clone(), member(true))
            .with_member(validator.identity().clone(), member(true))
            .with_member(miner.identity().clone(), member(false));
        let membership = RosterMembership::new(me.identity().clone(), roster);
        Net {
            me,
            validator,
            miner,
            membership,
        }
    }

    #[test]
    fn test_envelope_from_headers_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert("protocol-version", HeaderValue::from_static("2"));
        headers.insert(
            HeaderName::from_bytes(b"MESSAGE-ID").unwrap(),
            HeaderValue::from_static("m-1"),
        );
        headers.insert("signed-by", HeaderValue::from_static("abc"));

        let envelope = envelope_from_headers(&headers);
        assert_eq!(envelope.version.as_deref(), Some("2"));
        assert_eq!(envelope.message_id(), Some("m-1"));
        assert_eq!(envelope.signer(), Some("abc"));
        assert!(envelope.signature.is_none());
    }

    #[test]
    fn test_direct_unaddressed_and_addressed() {
        let net = net();
        let auth = AuthConfig::default();

        let plain = sign_request_at(b"body", &net.miner, None, NOW, "m-1");
        assert_eq!(
            auth.verify_direct(&plain, b"body", &net.membership, NOW),
            Ok(net.miner.identity().clone())
        );

        let addressed = sign_request_at(b"body", &net.miner, Some(net.me.identity()), NOW, "m-2");
        assert!(auth.verify_direct(&addressed, b"body", &net.membership, NOW).is_ok());

        let elsewhere =
            sign_request_at(b"body", &net.miner, Some(net.validator.identity()), NOW, "m-3");
        assert!(matches!(
            auth.verify_direct(&elsewhere, b"body", &net.membership, NOW),
            Err(AuthError::Verification(VerificationError::WrongRecipient { .. }))
        ));
    }

    #[test]
    fn test_direct_rejects_stripped_binding() {
        let net = net();
        let mut envelope =
            sign_request_at(b"body", &net.miner, Some(net.me.identity()), NOW, "m-1");
        envelope.secret_signatures = [None, None, None];

        assert_eq!(
            AuthConfig::default().verify_direct(&envelope, b"body", &net.membership, NOW),
            Err(AuthError::Verification(VerificationError::BadSecretBinding))
        );

        let lenient = AuthConfig {
            require_secret_binding: false,
            ..Default::default()
        };
        assert!(lenient
            .verify_direct(&envelope, b"body", &net.membership, NOW)
            .is_ok());
    }

    #[test]
    fn test_relay_requires_privileged_bound_sender() {
        let net = net();
        let auth = AuthConfig::default();

        let relay = sign_request_at(b"{}", &net.validator, Some(net.me.identity()), NOW, "r-1");
        assert_eq!(
            auth.verify_relay(&relay, b"{}", &net.membership, NOW),
            Ok(net.validator.identity().clone())
        );

        let from_miner = sign_request_at(b"{}", &net.miner, Some(net.me.identity()), NOW, "r-2");
        assert_eq!(
            auth.verify_relay(&from_miner, b"{}", &net.membership, NOW),
            Err(AuthError::NotPrivileged(net.miner.identity().clone()))
        );

        let unaddressed = sign_request_at(b"{}", &net.validator, None, NOW, "r-3");
        assert_eq!(
            auth.verify_relay(&unaddressed, b"{}", &net.membership, NOW),
            Err(AuthError::Verification(VerificationError::BadSecretBinding))
        );
    }

    #[test]
    fn test_relayed_original_uses_wider_window() {
        let net = net();
        let auth = AuthConfig::default();
        let signed_at = NOW - 30_000;
        let original = sign_request_at(
            b"body",
            &net.miner,
            Some(net.validator.identity()),
            signed_at,
            "m-1",
        );

        assert_eq!(
            auth.verify_relayed(&original, b"body", &net.membership, net.validator.identity(), NOW),
            Ok(net.miner.identity().clone())
        );
        assert!(matches!(
            auth.verify_direct(&original, b"body", &net.membership, NOW),
            Err(AuthError::Verification(VerificationError::Stale { .. }))
        ));
        assert!(matches!(
            auth.verify_relayed(
                &original,
                b"body",
                &net.membership,
                net.validator.identity(),
                signed_at + 60_001
            ),
            Err(AuthError::Verification(VerificationError::Stale { .. }))
        ));
    }

    #[test]
    fn test_relayed_original_must_be_addressed_to_relayer() {
        let net = net();
        let original = sign_request_at(b"body", &net.miner, Some(net.me.identity()), NOW, "m-1");
        assert!(matches!(
            AuthConfig::default().verify_relayed(
                &original,
                b"body",
                &net.membership,
                net.validator.identity(),
                NOW
            ),
            Err(AuthError::Verification(VerificationError::WrongRecipient { .. }))
        ));
    }
}
