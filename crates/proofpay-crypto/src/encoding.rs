//! base64url without padding

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::{CryptoError, CryptoResult};

/// Encode bytes as base64url without padding
pub fn b64url_encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decode base64url, tolerating trailing padding
pub fn b64url_decode(text: &str) -> CryptoResult<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(text.trim().trim_end_matches('='))
        .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))
}
