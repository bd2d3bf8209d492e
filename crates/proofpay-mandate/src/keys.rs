//! Public key resolution by `kid`
//!
//! A resolver that has no key for a kid returns [`MandateError::UnknownKid`];
//! the verifier never treats an unknown signer as a soft failure.

use std::collections::HashMap;

use ed25519_dalek::{SigningKey, VerifyingKey};
use proofpay_crypto::{signing_key_from_pem, verifying_key_from_pem};

use crate::error::{MandateError, Result};

/// Default environment variable holding a JSON `kid -> PEM` map
pub const PUBLIC_KEYS_JSON_VAR: &str = "AP2_PUBLIC_KEYS_JSON";
/// Prefix of per-kid public key variables
pub const PUBLIC_KEY_VAR_PREFIX: &str = "AP2_PUBLIC_KEY_";
/// Default environment variable holding the signing key PEM
pub const PRIVATE_KEY_VAR: &str = "AP2_PRIVATE_KEY_PEM";

/// Resolves a verifying key for a key id
pub trait KeyResolver: Send + Sync {
    fn resolve(&self, kid: &str) -> Result<VerifyingKey>;
}

impl<R: KeyResolver + ?Sized> KeyResolver for std::sync::Arc<R> {
    fn resolve(&self, kid: &str) -> Result<VerifyingKey> {
        (**self).resolve(kid)
    }
}

/// In-memory map of kid to key
#[derive(Debug, Clone, Default)]
pub struct StaticKeyResolver {
    keys: HashMap<String, VerifyingKey>,
}

impl StaticKeyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, kid: impl Into<String>, key: VerifyingKey) -> Self {
        self.keys.insert(kid.into(), key);
        self
    }

    pub fn insert(&mut self, kid: impl Into<String>, key: VerifyingKey) {
        self.keys.insert(kid.into(), key);
    }

    /// Parse a JSON object of `kid -> PEM`
    pub fn from_json_map(json: &str) -> Result<Self> {
        let map: HashMap<String, String> = serde_json::from_str(json)
            .map_err(|e| MandateError::InvalidKey(format!("public key map: {e}")))?;
        let mut resolver = Self::new();
        for (kid, pem) in map {
            let key = verifying_key_from_pem(&pem)
                .map_err(|e| MandateError::InvalidKey(format!("kid {kid:?}: {e}")))?;
            resolver.insert(kid, key);
        }
        Ok(resolver)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl KeyResolver for StaticKeyResolver {
    fn resolve(&self, kid: &str) -> Result<VerifyingKey> {
        self.keys
            .get(kid)
            .copied()
            .ok_or_else(|| MandateError::UnknownKid(kid.to_string()))
    }
}

/// Environment variable name for a kid: prefix + upper-cased kid with every
/// non-alphanumeric character replaced by `_`
pub fn kid_env_var(prefix: &str, kid: &str) -> String {
    let sanitized: String = kid
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{prefix}{sanitized}")
}

/// Resolves keys from the process environment
///
/// The JSON map variable is consulted first, then the per-kid variable.
/// Values are read at resolution time so rotated keys are picked up.
#[derive(Debug, Clone)]
pub struct EnvKeyResolver {
    json_var: String,
    prefix: String,
}

impl Default for EnvKeyResolver {
    fn default() -> Self {
        Self::new(PUBLIC_KEYS_JSON_VAR, PUBLIC_KEY_VAR_PREFIX)
    }
}

impl EnvKeyResolver {
    pub fn new(json_var: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            json_var: json_var.into(),
            prefix: prefix.into(),
        }
    }

    fn from_json_var(&self, kid: &str) -> Result<Option<VerifyingKey>> {
        let Ok(raw) = std::env::var(&self.json_var) else {
            return Ok(None);
        };
        if raw.trim().is_empty() {
            return Ok(None);
        }
        match StaticKeyResolver::from_json_map(&raw)?.resolve(kid) {
            Ok(key) => Ok(Some(key)),
            Err(MandateError::UnknownKid(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl KeyResolver for EnvKeyResolver {
    fn resolve(&self, kid: &str) -> Result<VerifyingKey> {
        if let Some(key) = self.from_json_var(kid)? {
            return Ok(key);
        }
        let var = kid_env_var(&self.prefix, kid);
        match std::env::var(&var) {
            Ok(pem) if !pem.trim().is_empty() => verifying_key_from_pem(&pem)
                .map_err(|e| MandateError::InvalidKey(format!("{var}: {e}"))),
            _ => Err(MandateError::UnknownKid(kid.to_string())),
        }
    }
}

/// Load the signing key from a single PEM environment value
pub fn signing_key_from_env(var: &str) -> Result<SigningKey> {
    let pem = std::env::var(var)
        .map_err(|_| MandateError::InvalidKey(format!("{var} is not set")))?;
    Ok(signing_key_from_pem(&pem)?)
}
