use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha512};
use tracing::warn;

use crate::error::{AppError, AppResult};
use crate::ledger::models::Rail;

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Webhooks for a rail without a configured secret are refused outright
pub fn require_secret(rail: Rail, secret: Option<&str>) -> AppResult<&str> {
    secret.filter(|s| !s.is_empty()).ok_or_else(|| {
        warn!("Rejected {} webhook: no webhook secret configured", rail);
        AppError::InvalidSignature(rail)
    })
}

/// Sign a message with HMAC-SHA256, hex encoded
pub fn sign_sha256(secret: &str, message: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(message);
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Sign a message with HMAC-SHA512, hex encoded
pub fn sign_sha512(secret: &str, message: &[u8]) -> Option<String> {
    let mut mac = HmacSha512::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(message);
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a hex HMAC-SHA256 signature
pub fn verify_sha256(secret: &str, message: &[u8], signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(message);
    mac.verify_slice(&expected).is_ok()
}

/// Constant-time check of a hex HMAC-SHA512 signature
pub fn verify_sha512(secret: &str, message: &[u8], signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha512::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(message);
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_sign_verify() {
        let sig = sign_sha256("whsec", b"payload").unwrap();
        assert!(verify_sha256("whsec", b"payload", &sig));
        assert!(!verify_sha256("whsec", b"tampered", &sig));
        assert!(!verify_sha256("other", b"payload", &sig));
        assert!(!verify_sha256("whsec", b"payload", "not-hex"));
    }

    #[test]
    fn test_sha512_sign_verify() {
        let sig = sign_sha512("ipn", b"{\"a\":1}").unwrap();
        assert_eq!(sig.len(), 128);
        assert!(verify_sha512("ipn", b"{\"a\":1}", &sig));
        assert!(!verify_sha512("ipn", b"{\"a\":2}", &sig));
    }
}
