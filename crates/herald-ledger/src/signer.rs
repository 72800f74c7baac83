use ed25519_dalek::{Signer as DalekSigner, SigningKey, VerifyingKey};
use herald_core::{HeraldResult, Signer};
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use crate::error::{LedgerError, LedgerResult};

/// Ed25519 signer for detached document signatures.
///
/// Holds the seed in zeroizing memory and the identity string that ends up
/// in every signature envelope.
pub struct LedgerSigner {
    signing_key: Zeroizing<[u8; 32]>,
    verifying_key: [u8; 32],
    identity: String,
}

impl LedgerSigner {
    pub fn from_bytes(seed: [u8; 32], identity: impl Into<String>) -> Self {
        let signing_key = SigningKey::from_bytes(&seed);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key: Zeroizing::new(seed),
            verifying_key: verifying_key.to_bytes(),
            identity: identity.into(),
        }
    }

    /// Create a signer from a hex-encoded 32-byte seed (configuration form).
    pub fn from_hex(seed_hex: &str, identity: impl Into<String>) -> LedgerResult<Self> {
        let bytes = Zeroizing::new(
            hex::decode(seed_hex.trim()).map_err(|e| LedgerError::Key(e.to_string()))?,
        );
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| LedgerError::Key("seed must be 32 bytes".into()))?;
        Ok(Self::from_bytes(seed, identity))
    }

    /// Fresh random key.
    pub fn generate(identity: impl Into<String>) -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self::from_bytes(signing_key.to_bytes(), identity)
    }

    /// Hex seed for writing into a fresh configuration file.
    pub fn generate_seed_hex() -> String {
        hex::encode(SigningKey::generate(&mut OsRng).to_bytes())
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.verifying_key)
    }

    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> bool {
        verify_detached(&self.verifying_key, message, signature)
    }
}

/// Strict Ed25519 verification against a raw public key.
pub fn verify_detached(public_key: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> bool {
    match VerifyingKey::from_bytes(public_key) {
        Ok(vk) => {
            let sig = ed25519_dalek::Signature::from_bytes(signature);
            vk.verify_strict(message, &sig).is_ok()
        }
        Err(_) => false,
    }
}

impl Signer for LedgerSigner {
    fn sign_ed25519(&self, message: &[u8]) -> HeraldResult<[u8; 64]> {
        let signing_key = SigningKey::from_bytes(&self.signing_key);
        Ok(signing_key.sign(message).to_bytes())
    }

    fn public_key_ed25519(&self) -> [u8; 32] {
        self.verifying_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let signer = LedgerSigner::from_bytes([0x42; 32], "hr@acme");
        let sig = signer.sign_ed25519(b"envelope").unwrap();
        assert!(signer.verify(b"envelope", &sig));
        assert!(!signer.verify(b"tampered", &sig));
    }

    #[test]
    fn test_from_hex_matches_from_bytes() {
        let a = LedgerSigner::from_bytes([7; 32], "a");
        let b = LedgerSigner::from_hex(&hex::encode([7u8; 32]), "a").unwrap();
        assert_eq!(a.public_key_ed25519(), b.public_key_ed25519());
        assert!(LedgerSigner::from_hex("abcd", "a").is_err());
        assert!(LedgerSigner::from_hex("zz", "a").is_err());
    }

    #[test]
    fn test_generated_keys_differ() {
        let a = LedgerSigner::generate("a");
        let b = LedgerSigner::generate("a");
        assert_ne!(a.public_key_hex(), b.public_key_hex());
        assert_eq!(LedgerSigner::generate_seed_hex().len(), 64);
    }
}
