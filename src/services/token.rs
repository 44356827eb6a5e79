//! Single-use preview capability tokens.
//!
//! A token is `base64url(payload) "." base64url(hmac_sha256(payload))` where
//! the payload is the JSON encoding of [`TokenClaims`]. Validation needs only
//! the signing key; single use is enforced separately by a replay store.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Duration, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Fixed validity window of a preview token.
pub const TOKEN_LIFETIME_SECS: i64 = 15 * 60;

const SEPARATOR: char = '.';
const MIN_SECRET_LEN: usize = 32;

/// Signed contents of a preview token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub file_id: Uuid,
    /// Unix seconds.
    pub expires_at: i64,
    pub nonce: String,
}

impl TokenClaims {
    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.expires_at, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// A minted token together with the claims it carries.
#[derive(Debug, Clone)]
pub struct MintedToken {
    pub token: String,
    pub claims: TokenClaims,
}

/// Mints and validates preview tokens with a server-wide HMAC key.
pub struct TokenIssuer {
    key: Vec<u8>,
    lifetime: Duration,
}

impl fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("key", &"<redacted>")
            .field("lifetime", &self.lifetime)
            .finish()
    }
}

impl TokenIssuer {
    pub fn new(secret: &[u8]) -> Result<Self, TokenError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(TokenError::InvalidSecret);
        }
        Ok(Self {
            key: secret.to_vec(),
            lifetime: Duration::seconds(TOKEN_LIFETIME_SECS),
        })
    }

    /// Create from a base64-encoded key of at least 32 bytes.
    pub fn from_base64(secret_base64: &str) -> Result<Self, TokenError> {
        let secret = STANDARD
            .decode(secret_base64.trim())
            .map_err(|_| TokenError::InvalidSecret)?;
        Self::new(&secret)
    }

    pub fn mint(&self, file_id: Uuid) -> Result<MintedToken, TokenError> {
        self.mint_at(file_id, Utc::now())
    }

    pub fn mint_at(&self, file_id: Uuid, now: DateTime<Utc>) -> Result<MintedToken, TokenError> {
        let claims = TokenClaims {
            file_id,
            expires_at: (now + self.lifetime).timestamp(),
            nonce: Uuid::new_v4().simple().to_string(),
        };
        let payload = serde_json::to_vec(&claims).map_err(TokenError::Encode)?;
        let signature = self.sign(&payload)?;

        let token = format!(
            "{}{}{}",
            URL_SAFE_NO_PAD.encode(&payload),
            SEPARATOR,
            URL_SAFE_NO_PAD.encode(signature)
        );
        Ok(MintedToken { token, claims })
    }

    pub fn validate(&self, token: &str) -> Result<TokenClaims, TokenError> {
        self.validate_at(token, Utc::now())
    }

    /// Check structure, signature and expiry. Replay is not checked here.
    pub fn validate_at(&self, token: &str, now: DateTime<Utc>) -> Result<TokenClaims, TokenError> {
        let (payload_b64, signature_b64) =
            token.split_once(SEPARATOR).ok_or(TokenError::Malformed)?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| TokenError::Malformed)?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| TokenError::Malformed)?;

        let mut mac = self.mac()?;
        mac.update(&payload);
        // verify_slice compares in constant time.
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::Tampered)?;

        let claims: TokenClaims =
            serde_json::from_slice(&payload).map_err(|_| TokenError::Malformed)?;

        // Expired from the signed second onward; the replay store keeps
        // nonces through that instant.
        if now >= claims.expires_at() {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }

    fn mac(&self) -> Result<HmacSha256, TokenError> {
        HmacSha256::new_from_slice(&self.key).map_err(|_| TokenError::InvalidSecret)
    }

    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, TokenError> {
        let mut mac = self.mac()?;
        mac.update(payload);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("Token is malformed")]
    Malformed,

    #[error("Token signature mismatch")]
    Tampered,

    #[error("Token has expired")]
    Expired,

    #[error("Token signing key must be base64 and at least 32 bytes")]
    InvalidSecret,

    #[error("Failed to encode token payload: {0}")]
    Encode(#[source] serde_json::Error),
}
