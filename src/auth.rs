use std::collections::HashMap;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64, Engine as _};
use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::AuthError;
use crate::messages::UserId;

pub const DEFAULT_TOKEN_TTL_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub username: String,
}

/// Resolves a bearer credential to the caller's identity.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve_identity(&self, credential: &str) -> Result<Identity, AuthError>;

    /// Invalidates a valid credential for the rest of its lifetime.
    async fn revoke(&self, credential: &str) -> Result<Identity, AuthError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    /// User id
    sub: String,
    username: String,
    /// Unique per issued token so revoking one never revokes a twin.
    jti: String,
    iat: i64,
    exp: i64,
}

impl Claims {
    fn identity(&self) -> Result<Identity, AuthError> {
        let user_id = self.sub.parse::<u64>().map_err(|_| AuthError::Malformed)?;
        Ok(Identity {
            user_id: UserId(user_id),
            username: self.username.clone(),
        })
    }
}

/// Issues and verifies HS256 JWTs. Revoked tokens are remembered by digest
/// until they would have expired anyway.
pub struct TokenAuthority {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl_secs: i64,
    revoked: RwLock<HashMap<String, i64>>,
}

impl TokenAuthority {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        let secret = secret.as_ref();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);
        TokenAuthority {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            ttl_secs: DEFAULT_TOKEN_TTL_SECS,
            revoked: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl_secs: i64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    pub fn issue(&self, user_id: UserId, username: &str) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            username: username.to_string(),
            jti: Uuid::new_v4().to_string(),
            iat: now,
            exp: now + self.ttl_secs,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|err| AuthError::Signing(err.to_string()))
    }

    fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|err| match err.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                ErrorKind::InvalidSignature => AuthError::BadSignature,
                _ => AuthError::Malformed,
            })
    }
}

fn digest(token: &str) -> String {
    BASE64.encode(Sha256::digest(token.as_bytes()))
}

fn non_empty(credential: &str) -> Result<&str, AuthError> {
    let credential = credential.trim();
    if credential.is_empty() {
        return Err(AuthError::MissingCredential);
    }
    Ok(credential)
}

#[async_trait]
impl IdentityResolver for TokenAuthority {
    async fn resolve_identity(&self, credential: &str) -> Result<Identity, AuthError> {
        let credential = non_empty(credential)?;
        let claims = self.verify(credential)?;
        if self.revoked.read().await.contains_key(&digest(credential)) {
            return Err(AuthError::Revoked);
        }
        claims.identity()
    }

    async fn revoke(&self, credential: &str) -> Result<Identity, AuthError> {
        let credential = non_empty(credential)?;
        let claims = self.verify(credential)?;
        let identity = claims.identity()?;

        let now = Utc::now().timestamp();
        let mut revoked = self.revoked.write().await;
        revoked.retain(|_, exp| *exp >= now);
        if revoked.insert(digest(credential), claims.exp).is_some() {
            return Err(AuthError::Revoked);
        }
        Ok(identity)
    }
}
