//! Mandate signing

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use proofpay_crypto::{b64url_encode, signing_key_from_pem, stable_stringify};
use serde::Serialize;
use serde_json::Value;

use crate::envelope::{MandateEnvelope, ProtectedHeader};
use crate::error::{MandateError, Result};

/// Signs mandate payloads under a fixed `kid`
#[derive(Clone)]
pub struct MandateSigner {
    kid: String,
    signing_key: SigningKey,
}

impl std::fmt::Debug for MandateSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MandateSigner")
            .field("kid", &self.kid)
            .finish_non_exhaustive()
    }
}

impl MandateSigner {
    pub fn new(kid: impl Into<String>, signing_key: SigningKey) -> Self {
        Self {
            kid: kid.into(),
            signing_key,
        }
    }

    /// Build a signer from a PKCS#8 PEM private key
    pub fn from_pem(kid: impl Into<String>, pem: &str) -> Result<Self> {
        Ok(Self::new(kid, signing_key_from_pem(pem)?))
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Sign a raw payload.
    ///
    /// The signature covers `stable_stringify(payload)`; the payload must be
    /// a JSON object.
    pub fn sign(&self, payload: Value) -> Result<MandateEnvelope> {
        if !payload.is_object() {
            return Err(MandateError::InvalidPayload(
                "payload must be a JSON object".to_string(),
            ));
        }
        let message = stable_stringify(&payload);
        let signature = self.signing_key.sign(message.as_bytes());

        Ok(MandateEnvelope {
            protected: ProtectedHeader::new(self.kid.clone()),
            payload,
            signature: b64url_encode(&signature.to_bytes()),
        })
    }

    /// Sign a typed payload (intent, quote or payment)
    pub fn sign_typed<T: Serialize>(&self, payload: &T) -> Result<MandateEnvelope> {
        self.sign(serde_json::to_value(payload)?)
    }
}
