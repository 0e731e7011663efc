use std::collections::HashSet;

use proptest::prelude::*;

use crate::envelope::sign_request_at;
use crate::identity::Keypair;
use crate::verify::{verify_request, FreshnessPolicy, VerificationError, ALLOWED_SKEW_MS};

const NOW: u64 = 1_700_000_000_000;

proptest! {
    // Any in-window request verifies; flipping a single body byte breaks it.
    #[test]
    fn prop_single_byte_mutation_breaks_signature(
        seed in prop::array::uniform32(any::<u8>()),
        body in prop::collection::vec(any::<u8>(), 1..512),
        index in any::<prop::sample::Index>(),
        flip in 1u8..=255u8,
        age in 0u64..=ALLOWED_SKEW_MS,
    ) {
        let sender = Keypair::from_seed(&seed);
        let signers: HashSet<_> = [sender.identity().clone()].into_iter().collect();
        let policy = FreshnessPolicy::default();
        let envelope = sign_request_at(&body, &sender, None, NOW - age, "prop-message");

        let signer = verify_request(&envelope, &body, &signers, None, NOW, &policy);
        prop_assert_eq!(signer.as_ref(), Ok(sender.identity()));

        let mut tampered = body.clone();
        let i = index.index(tampered.len());
        tampered[i] ^= flip;
        prop_assert_eq!(
            verify_request(&envelope, &tampered, &signers, None, NOW, &policy),
            Err(VerificationError::BadSignature)
        );
    }

    // Staleness wins over a perfectly valid signature.
    #[test]
    fn prop_stale_requests_always_rejected(
        extra_age in 1u64..10_000_000u64,
        body in prop::collection::vec(any::<u8>(), 0..64),
    ) {
        let sender = Keypair::from_seed(&[3u8; 32]);
        let signers: HashSet<_> = [sender.identity().clone()].into_iter().collect();
        let timestamp = NOW - ALLOWED_SKEW_MS - extra_age;
        let envelope = sign_request_at(&body, &sender, None, timestamp, "prop-stale");

        let policy = FreshnessPolicy::default();
        let result = verify_request(&envelope, &body, &signers, None, NOW, &policy);
        let is_stale = matches!(result, Err(VerificationError::Stale { .. }));
        prop_assert!(is_stale);
    }
}
