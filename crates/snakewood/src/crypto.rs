use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

pub(crate) const PUBLIC_KEY_SIZE: usize = 32;
pub(crate) const SIGNATURE_SIZE: usize = 64;

/// Fixed-size public key for internal use.
pub(crate) type PublicKey = [u8; PUBLIC_KEY_SIZE];

/// Fixed-size signature for internal use.
pub(crate) type Sig = [u8; SIGNATURE_SIZE];

/// Cryptographic identity: holds signing key and derived public key.
pub(crate) struct Crypto {
    pub signing_key: SigningKey,
    pub public_key: PublicKey,
}

impl Crypto {
    pub fn new(signing_key: SigningKey) -> Self {
        let public_key: PublicKey = signing_key.verifying_key().to_bytes();
        Self {
            signing_key,
            public_key,
        }
    }

    /// Sign a message with our private key.
    pub fn sign(&self, message: &[u8]) -> Sig {
        let sig = self.signing_key.sign(message);
        sig.to_bytes()
    }

    /// Verify a signature from the given public key.
    pub fn verify(key: &PublicKey, message: &[u8], sig: &Sig) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_bytes(key) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(sig) else {
            return false;
        };
        verifying_key.verify(message, &signature).is_ok()
    }
}

/// Compare two public keys in plain lexicographic order.
pub(crate) fn key_less(a: &PublicKey, b: &PublicKey) -> bool {
    a < b
}

/// True iff `second` lies strictly between `first` and `third` on the cyclic
/// keyspace, traversing upward from `first` and wrapping at the maximum key.
/// For any three distinct keys exactly one rotation of the arguments holds.
pub(crate) fn dht_ordered(first: &PublicKey, second: &PublicKey, third: &PublicKey) -> bool {
    (first < second && second < third)
        || (second < third && third < first)
        || (third < first && first < second)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn sign_and_verify() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let crypto = Crypto::new(signing_key);
        let message = b"hello snakewood";
        let sig = crypto.sign(message);
        assert!(Crypto::verify(&crypto.public_key, message, &sig));
    }

    #[test]
    fn verify_wrong_message_fails() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let crypto = Crypto::new(signing_key);
        let sig = crypto.sign(b"correct");
        assert!(!Crypto::verify(&crypto.public_key, b"wrong", &sig));
    }

    #[test]
    fn dht_ordered_in_sequence() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        let c = [3u8; 32];
        assert!(dht_ordered(&a, &b, &c));
        assert!(!dht_ordered(&a, &c, &b));
    }

    #[test]
    fn dht_ordered_wraps() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        let c = [3u8; 32];
        // Traversal wraps past the maximum key.
        assert!(dht_ordered(&b, &c, &a));
        assert!(dht_ordered(&c, &a, &b));
    }

    #[test]
    fn dht_ordered_exactly_one_rotation() {
        let mut keys = Vec::new();
        for _ in 0..16 {
            let k = SigningKey::generate(&mut OsRng);
            keys.push(k.verifying_key().to_bytes());
        }
        for x in &keys {
            for y in &keys {
                for z in &keys {
                    if x == y || y == z || x == z {
                        continue;
                    }
                    let count = [
                        dht_ordered(x, y, z),
                        dht_ordered(y, z, x),
                        dht_ordered(z, x, y),
                    ]
                    .iter()
                    .filter(|&&v| v)
                    .count();
                    assert_eq!(count, 1, "exactly one rotation must hold");
                }
            }
        }
    }

    #[test]
    fn dht_ordered_rejects_duplicates() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        assert!(!dht_ordered(&a, &a, &b));
        assert!(!dht_ordered(&a, &b, &b));
        assert!(!dht_ordered(&a, &a, &a));
    }
}
