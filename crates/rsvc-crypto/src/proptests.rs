#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::hash::derive_id;
    use crate::identity::{Identity, SignatureScheme};

    proptest! {
        #[test]
        fn test_identity_signature_round_trip(
            seed in any::<[u8; 32]>(),
            message in any::<Vec<u8>>()
        ) {
            let identity = Identity::from_seed("prop", &seed);
            let sig = identity.sign(&message).unwrap();
            prop_assert!(identity.verify(&sig, &message));
            prop_assert!(identity.strip_private().verify(&sig, &message));
        }

        #[test]
        fn test_single_byte_change_breaks_signature(
            seed in any::<[u8; 32]>(),
            message in proptest::collection::vec(any::<u8>(), 1..256),
            index in any::<prop::sample::Index>(),
            flip in 1u8..=255
        ) {
            let identity = Identity::from_seed("prop", &seed);
            let sig = identity.sign(&message).unwrap();

            let mut tampered = message.clone();
            let i = index.index(tampered.len());
            tampered[i] ^= flip;
            prop_assert!(!identity.verify(&sig, &tampered));

            let mut bad_sig = sig.clone();
            let sig_len = bad_sig.len();
            bad_sig[i % sig_len] ^= flip;
            prop_assert!(!identity.verify(&bad_sig, &message));
        }

        #[test]
        fn test_legacy_round_trip(
            seed in any::<[u8; 32]>(),
            message in any::<Vec<u8>>()
        ) {
            let identity = Identity::from_seed("prop", &seed);
            let sig = identity.sign_with(SignatureScheme::LegacySha1, &message).unwrap();
            prop_assert!(identity.verify_with(SignatureScheme::LegacySha1, &sig, &message));
        }

        #[test]
        fn test_id_matches_key(seed in any::<[u8; 32]>()) {
            let identity = Identity::from_seed("prop", &seed);
            prop_assert!(identity.is_valid());
            prop_assert_eq!(identity.id(), derive_id(&identity.public_key()));
        }
    }
}
