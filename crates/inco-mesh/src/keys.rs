use anyhow::{Context, Result};
use base64::Engine;
use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use k256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Generate a fresh secp256k1 key pair for this node.
pub fn generate_key_pair() -> SecretKey {
    SecretKey::random(&mut OsRng)
}

/// The node's asymmetric key material in its persisted form.
///
/// Both halves are base64 encoded: the public key as SEC1 bytes, the secret
/// key as its 32-byte scalar. The strings are wiped from memory on drop.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeySet {
    pub public_key_b64: String,
    secret_key_b64: String,
}

impl std::fmt::Debug for KeySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySet")
            .field("public_key_b64", &self.public_key_b64)
            .field("secret_key_b64", &"<redacted>")
            .finish()
    }
}

impl KeySet {
    /// Convert a generated key pair into the session's key-set representation.
    pub fn from_secret_key(secret_key: &SecretKey) -> Self {
        let b64 = base64::engine::general_purpose::STANDARD;
        Self {
            public_key_b64: b64.encode(secret_key.public_key().to_sec1_bytes()),
            secret_key_b64: b64.encode(secret_key.to_bytes()),
        }
    }

    /// Generate a new key pair and wrap it.
    pub fn generate() -> Self {
        Self::from_secret_key(&generate_key_pair())
    }

    /// Decode the secret half back into a usable key.
    pub fn secret_key(&self) -> Result<SecretKey> {
        let bytes = zeroize::Zeroizing::new(
            base64::engine::general_purpose::STANDARD
                .decode(&self.secret_key_b64)
                .context("secret key is not valid base64")?,
        );
        SecretKey::from_slice(&bytes).context("secret key is not valid secp256k1")
    }

    /// Decode the public half.
    pub fn public_key(&self) -> Result<PublicKey> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&self.public_key_b64)
            .context("public key is not valid base64")?;
        PublicKey::from_sec1_bytes(&bytes).context("public key is not valid SEC1")
    }

    /// Sign a payload, returning a base64 ECDSA signature.
    pub fn sign(&self, payload: &[u8]) -> Result<String> {
        let signing_key = SigningKey::from(self.secret_key()?);
        let signature: Signature = signing_key.sign(payload);
        Ok(base64::engine::general_purpose::STANDARD.encode(signature.to_bytes()))
    }
}

/// Verify a base64 signature produced by [`KeySet::sign`].
pub fn verify_signature(public_key_b64: &str, payload: &[u8], signature_b64: &str) -> bool {
    let b64 = base64::engine::general_purpose::STANDARD;
    let Ok(pub_bytes) = b64.decode(public_key_b64) else {
        return false;
    };
    let Ok(sig_bytes) = b64.decode(signature_b64) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_sec1_bytes(&pub_bytes) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&sig_bytes) else {
        return false;
    };
    verifying_key.verify(payload, &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_sets_differ() {
        let a = KeySet::generate();
        let b = KeySet::generate();
        assert_ne!(a.public_key_b64, b.public_key_b64);
    }

    #[test]
    fn secret_and_public_halves_match() {
        let key_set = KeySet::generate();
        let secret = key_set.secret_key().unwrap();
        assert_eq!(secret.public_key(), key_set.public_key().unwrap());
    }

    #[test]
    fn sign_verify_round_trip() {
        let key_set = KeySet::generate();
        let sig = key_set.sign(b"register").unwrap();
        assert!(verify_signature(&key_set.public_key_b64, b"register", &sig));
        assert!(!verify_signature(&key_set.public_key_b64, b"tampered", &sig));
    }

    #[test]
    fn serde_keeps_both_halves() {
        let key_set = KeySet::generate();
        let json = serde_json::to_string(&key_set).unwrap();
        let loaded: KeySet = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded, key_set);
    }

    #[test]
    fn debug_redacts_secret() {
        let key_set = KeySet::generate();
        let debug = format!("{key_set:?}");
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains(&key_set.secret_key_b64));
    }
}
