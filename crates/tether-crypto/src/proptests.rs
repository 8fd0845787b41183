#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::encoding;
    use crate::error::CryptoError;
    use crate::keys::{KeyPair, PrivateKey};
    use crate::{decrypt, encrypt};

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        // decrypt(encrypt(P, K.public), K.private) == P
        #[test]
        fn test_seal_round_trip(plaintext in any::<Vec<u8>>()) {
            let pair = KeyPair::generate();
            let ct = encrypt(&plaintext, pair.public()).unwrap();
            prop_assert_eq!(decrypt(&ct, pair.private()).unwrap(), plaintext);
        }

        // A ciphertext for K1 never opens under K2.
        #[test]
        fn test_cross_key_failure(plaintext in any::<Vec<u8>>()) {
            let k1 = KeyPair::generate();
            let k2 = KeyPair::generate();
            let ct = encrypt(&plaintext, k1.public()).unwrap();
            prop_assert_eq!(decrypt(&ct, k2.private()).unwrap_err(), CryptoError::DecryptionFailed);
        }

        // Deterministic private keys from seeds derive stable public keys.
        #[test]
        fn test_private_key_export_round_trip(seed in any::<[u8; 32]>()) {
            let private = PrivateKey::from_bytes(&seed).unwrap();
            let text = private.to_base64();
            let restored = PrivateKey::from_base64(&text).unwrap();
            prop_assert_eq!(restored.public_key(), private.public_key());
        }

        #[test]
        fn test_base64_round_trip(bytes in any::<Vec<u8>>()) {
            prop_assert_eq!(encoding::decode(&encoding::encode(&bytes)).unwrap(), bytes);
        }

        // Arbitrary garbage never panics the decryptor.
        #[test]
        fn test_garbage_never_panics(garbage in any::<Vec<u8>>()) {
            let pair = KeyPair::generate();
            prop_assert!(decrypt(&garbage, pair.private()).is_err());
        }
    }
}
