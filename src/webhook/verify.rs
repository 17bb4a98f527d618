//! Request authentication hooks for webhook routes
//!
//! A verifier only runs when the route has a secret; routes without one accept
//! unsigned requests (logged once at registration).

use std::time::Duration;

use axum::http::HeaderMap;
use hmac::Mac;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::{Error, Result};

type HmacSha256 = hmac::Hmac<Sha256>;

/// Authenticates a raw inbound request against a shared secret
pub trait SignatureVerifier: Send + Sync {
    /// Verify headers and raw body; any error rejects the request
    fn verify(&self, headers: &HeaderMap, body: &[u8], secret: &str) -> Result<()>;
}

/// Compute a hex HMAC-SHA256 over `data`
pub fn sign_hmac_sha256(secret: &str, data: &[u8]) -> Result<String> {
    let mut mac = <HmacSha256 as hmac::KeyInit>::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::Verification(format!("invalid secret: {e}")))?;
    mac.update(data);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::Verification(format!("missing {name} header")))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// HMAC-SHA256 over the raw body, carried in one header
///
/// Accepts both `sha256=<hex>` (GitHub style) and bare `<hex>`.
#[derive(Debug, Clone)]
pub struct HmacSha256Verifier {
    header: String,
}

impl HmacSha256Verifier {
    /// Default signature header
    pub const DEFAULT_HEADER: &'static str = "X-Hub-Signature-256";

    /// Read the signature from `header`
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
        }
    }
}

impl Default for HmacSha256Verifier {
    fn default() -> Self {
        Self::new(Self::DEFAULT_HEADER)
    }
}

impl SignatureVerifier for HmacSha256Verifier {
    fn verify(&self, headers: &HeaderMap, body: &[u8], secret: &str) -> Result<()> {
        let provided = header(headers, &self.header)?;
        let provided = provided.strip_prefix("sha256=").unwrap_or(provided);
        let computed = sign_hmac_sha256(secret, body)?;

        if constant_time_eq(computed.as_bytes(), provided.to_ascii_lowercase().as_bytes()) {
            Ok(())
        } else {
            Err(Error::Verification("signature mismatch".to_string()))
        }
    }
}

/// Slack v0 request signatures
///
/// `X-Slack-Signature` must equal `v0=` + HMAC-SHA256 of
/// `v0:{X-Slack-Request-Timestamp}:{body}`; stale timestamps are rejected.
#[derive(Debug, Clone)]
pub struct SlackSignatureVerifier {
    max_skew: Duration,
}

impl SlackSignatureVerifier {
    /// Signature header
    pub const SIGNATURE_HEADER: &'static str = "X-Slack-Signature";
    /// Timestamp header
    pub const TIMESTAMP_HEADER: &'static str = "X-Slack-Request-Timestamp";

    /// Create a verifier that tolerates `max_skew` of clock difference
    #[must_use]
    pub fn new(max_skew: Duration) -> Self {
        Self { max_skew }
    }

    /// Signature Slack would send for `body` at `timestamp`
    pub fn sign(secret: &str, timestamp: i64, body: &[u8]) -> Result<String> {
        let mut base = format!("v0:{timestamp}:").into_bytes();
        base.extend_from_slice(body);
        Ok(format!("v0={}", sign_hmac_sha256(secret, &base)?))
    }
}

impl Default for SlackSignatureVerifier {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl SignatureVerifier for SlackSignatureVerifier {
    fn verify(&self, headers: &HeaderMap, body: &[u8], secret: &str) -> Result<()> {
        let timestamp: i64 = header(headers, Self::TIMESTAMP_HEADER)?
            .trim()
            .parse()
            .map_err(|_| Error::Verification("malformed request timestamp".to_string()))?;

        let skew = chrono::Utc::now().timestamp().abs_diff(timestamp);
        if skew > self.max_skew.as_secs() {
            return Err(Error::Verification(format!(
                "request timestamp is {skew}s away from now"
            )));
        }

        let provided = header(headers, Self::SIGNATURE_HEADER)?;
        let expected = Self::sign(secret, timestamp, body)?;
        if constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
            Ok(())
        } else {
            Err(Error::Verification("signature mismatch".to_string()))
        }
    }
}

/// Shared token sent verbatim in a header (Gitlab `X-Gitlab-Token`)
#[derive(Debug, Clone)]
pub struct TokenVerifier {
    header: String,
}

impl TokenVerifier {
    /// Gitlab's webhook token header
    pub const GITLAB_HEADER: &'static str = "X-Gitlab-Token";

    /// Read the token from `header`
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
        }
    }
}

impl SignatureVerifier for TokenVerifier {
    fn verify(&self, headers: &HeaderMap, _body: &[u8], secret: &str) -> Result<()> {
        let provided = header(headers, &self.header)?;
        if constant_time_eq(provided.as_bytes(), secret.as_bytes()) {
            Ok(())
        } else {
            Err(Error::Verification("token mismatch".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, String)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_hmac_accepts_both_formats() {
        let body = br#"{"action":"opened"}"#;
        let sig = sign_hmac_sha256("topsecret", body).unwrap();
        let verifier = HmacSha256Verifier::default();

        let prefixed = headers(&[("x-hub-signature-256", format!("sha256={sig}"))]);
        assert!(verifier.verify(&prefixed, body, "topsecret").is_ok());

        let bare = headers(&[("x-hub-signature-256", sig)]);
        assert!(verifier.verify(&bare, body, "topsecret").is_ok());
    }

    #[test]
    fn test_hmac_rejects_tampered_body() {
        let sig = sign_hmac_sha256("topsecret", b"original").unwrap();
        let verifier = HmacSha256Verifier::new("X-Signature");
        let h = headers(&[("x-signature", sig)]);
        let err = verifier.verify(&h, b"tampered", "topsecret").unwrap_err();
        assert!(matches!(err, Error::Verification(_)));
    }

    #[test]
    fn test_hmac_missing_header() {
        let err = HmacSha256Verifier::default()
            .verify(&HeaderMap::new(), b"{}", "s")
            .unwrap_err();
        assert!(err.to_string().contains("missing X-Hub-Signature-256"));
    }

    #[test]
    fn test_slack_signature() {
        let body = b"token=abc&type=event_callback";
        let now = chrono::Utc::now().timestamp();
        let sig = SlackSignatureVerifier::sign("slack-secret", now, body).unwrap();
        assert!(sig.starts_with("v0="));

        let h = headers(&[
            ("x-slack-request-timestamp", now.to_string()),
            ("x-slack-signature", sig),
        ]);
        let verifier = SlackSignatureVerifier::default();
        assert!(verifier.verify(&h, body, "slack-secret").is_ok());
        assert!(verifier.verify(&h, body, "wrong-secret").is_err());
    }

    #[test]
    fn test_slack_rejects_stale_timestamp() {
        let body = b"{}";
        let stale = chrono::Utc::now().timestamp() - 3600;
        let sig = SlackSignatureVerifier::sign("s", stale, body).unwrap();
        let h = headers(&[
            ("x-slack-request-timestamp", stale.to_string()),
            ("x-slack-signature", sig),
        ]);
        let err = SlackSignatureVerifier::default()
            .verify(&h, body, "s")
            .unwrap_err();
        assert!(err.to_string().contains("away from now"));
    }

    #[test]
    fn test_token_verifier() {
        let verifier = TokenVerifier::new(TokenVerifier::GITLAB_HEADER);
        let good = headers(&[("x-gitlab-token", "hook-token".to_string())]);
        let bad = headers(&[("x-gitlab-token", "nope".to_string())]);
        assert!(verifier.verify(&good, b"", "hook-token").is_ok());
        assert!(verifier.verify(&bad, b"", "hook-token").is_err());
    }
}
