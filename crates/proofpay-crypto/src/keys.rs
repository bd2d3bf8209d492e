//! Ed25519 key loading
//!
//! Keys are supplied by the operator as PEM text (PKCS#8 for private keys,
//! SPKI for public keys). Values read from environment variables often carry
//! literal `\n` sequences instead of newlines; both forms are accepted.

use ed25519_dalek::pkcs8::{DecodePrivateKey, DecodePublicKey};
use ed25519_dalek::{SigningKey, VerifyingKey};

use crate::{CryptoError, CryptoResult};

fn normalize_pem(pem: &str) -> String {
    pem.trim().replace("\\n", "\n")
}

/// Load an Ed25519 private key from PKCS#8 PEM
pub fn signing_key_from_pem(pem: &str) -> CryptoResult<SigningKey> {
    SigningKey::from_pkcs8_pem(&normalize_pem(pem))
        .map_err(|e| CryptoError::InvalidKeyFormat(format!("private key: {e}")))
}

/// Load an Ed25519 public key from SPKI PEM
pub fn verifying_key_from_pem(pem: &str) -> CryptoResult<VerifyingKey> {
    VerifyingKey::from_public_key_pem(&normalize_pem(pem))
        .map_err(|e| CryptoError::InvalidKeyFormat(format!("public key: {e}")))
}

/// Hex form of a public key, for logs and audit records
pub fn public_key_hex(key: &VerifyingKey) -> String {
    hex::encode(key.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
    use ed25519_dalek::pkcs8::{EncodePrivateKey, EncodePublicKey};
    use rand::rngs::OsRng;

    #[test]
    fn test_pem_roundtrip() {
        let signing = SigningKey::generate(&mut OsRng);
        let private_pem = signing.to_pkcs8_pem(LineEnding::LF).unwrap();
        let public_pem = signing
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap();

        let loaded = signing_key_from_pem(&private_pem).unwrap();
        assert_eq!(loaded.to_bytes(), signing.to_bytes());

        let escaped = public_pem.replace('\n', "\\n");
        let verifying = verifying_key_from_pem(&escaped).unwrap();
        assert_eq!(verifying, signing.verifying_key());
        assert_eq!(public_key_hex(&verifying).len(), 64);
    }

    #[test]
    fn test_garbage_pem_rejected() {
        assert!(signing_key_from_pem("not a key").is_err());
        assert!(verifying_key_from_pem("").is_err());
    }
}
