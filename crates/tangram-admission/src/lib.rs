//! Admission: issuing and verifying short-lived signed channel tokens.
//!
//! A token binds a subject (client id) to an authorised topic scope and an
//! expiration, and is verified locally — no round trip to anything — by
//! recomputing an HMAC-SHA256 over the claims and comparing in constant time.
//! The wire format is `base64url(claims_json).base64url(hmac)`, the signing
//! half of a JWT, built from crates already in the dependency graph rather
//! than pulling in a JWT library for a format we don't need the rest of.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("malformed token")]
    Malformed,
    #[error("bad signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
}

/// What a token authorises its holder to join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopicScope {
    /// May join any topic.
    Any,
    /// May join exactly this topic.
    Exact(String),
    /// May join this topic or any `<prefix>:<suffix>` topic.
    Prefix(String),
}

impl TopicScope {
    pub fn authorizes(&self, topic: &str) -> bool {
        match self {
            TopicScope::Any => true,
            TopicScope::Exact(t) => t == topic,
            TopicScope::Prefix(prefix) => topic == prefix.as_str() || topic.starts_with(&format!("{prefix}:")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Claims {
    subject: String,
    scope: TopicScope,
    issued_at: f64,
    expires_at: f64,
}

/// The decoded, verified contents of a token.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenClaims {
    pub subject: String,
    pub scope: TopicScope,
    pub issued_at: f64,
    pub expires_at: f64,
}

impl TokenClaims {
    pub fn authorizes(&self, topic: &str) -> bool {
        self.scope.authorizes(topic)
    }
}

/// Issues and verifies tokens under one secret/TTL configuration.
#[derive(Clone)]
pub struct Admission {
    secret: Vec<u8>,
    default_ttl_secs: u64,
}

impl Admission {
    pub fn new(secret: impl Into<Vec<u8>>, default_ttl_secs: u64) -> Self {
        Admission {
            secret: secret.into(),
            default_ttl_secs,
        }
    }

    /// Issue a token for `subject` (a random UUIDv4 if `None`) authorising
    /// `scope`, using `now` as the issued-at timestamp (seconds since epoch).
    pub fn issue(&self, subject: Option<String>, scope: TopicScope, now: f64) -> (String, String) {
        let subject = subject.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let claims = Claims {
            subject: subject.clone(),
            scope,
            issued_at: now,
            expires_at: now + self.default_ttl_secs as f64,
        };
        (self.sign(&claims), subject)
    }

    pub fn verify(&self, token: &str, now: f64) -> Result<TokenClaims, AdmissionError> {
        let (body_b64, sig_b64) = token.split_once('.').ok_or(AdmissionError::Malformed)?;
        let body = URL_SAFE_NO_PAD
            .decode(body_b64)
            .map_err(|_| AdmissionError::Malformed)?;
        let expected_sig = self.sign_bytes(&body);
        let given_sig = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| AdmissionError::Malformed)?;
        if !constant_time_eq(&expected_sig, &given_sig) {
            return Err(AdmissionError::BadSignature);
        }
        let claims: Claims = serde_json::from_slice(&body).map_err(|_| AdmissionError::Malformed)?;
        if now > claims.expires_at {
            return Err(AdmissionError::Expired);
        }
        Ok(TokenClaims {
            subject: claims.subject,
            scope: claims.scope,
            issued_at: claims.issued_at,
            expires_at: claims.expires_at,
        })
    }

    fn sign(&self, claims: &Claims) -> String {
        let body = serde_json::to_vec(claims).expect("Claims serialization cannot fail");
        let sig = self.sign_bytes(&body);
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&body),
            URL_SAFE_NO_PAD.encode(sig)
        )
    }

    fn sign_bytes(&self, body: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(body);
        mac.finalize().into_bytes().to_vec()
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Extracts the bearer token from an `Authorization: Bearer <token>` header
/// value.
pub fn extract_bearer(authorization: &str) -> Option<&str> {
    authorization.strip_prefix("Bearer ")
}
