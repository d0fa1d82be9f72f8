//! Password hashing, bearer tokens and the caller identity derived from them.

use anyhow::{anyhow, Context, Result};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use time::OffsetDateTime;

use crate::ApiError;

type HmacSha256 = Hmac<Sha256>;

/// The one account allowed to manage items and other users.
pub const ADMIN_USER: &str = "admin";

const SALT_LEN: usize = 16;
const TOKEN_ALG: &str = "HS256";

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct TokenHeader {
    alg: String,
    typ: String,
}

impl TokenHeader {
    fn hs256() -> Self {
        Self { alg: TOKEN_ALG.to_string(), typ: "JWT".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenClaims {
    pub sub: String,
    pub iat: i64,
}

/// Authenticated caller of an api operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
}

impl Principal {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.name == ADMIN_USER
    }

    /// # Errors
    /// Returns [`ApiError::Forbidden`] unless the caller is the administrator.
    pub fn require_admin(&self) -> Result<(), ApiError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(ApiError::Forbidden(format!("{} is not an administrator", self.name)))
        }
    }

    /// # Errors
    /// Returns [`ApiError::Forbidden`] unless the caller is `user` or the administrator.
    pub fn require_self_or_admin(&self, user: &str) -> Result<(), ApiError> {
        if self.name == user || self.is_admin() {
            Ok(())
        } else {
            Err(ApiError::Forbidden(format!("{} may not act on behalf of {user}", self.name)))
        }
    }
}

/// Hash a password into an Argon2id PHC string with a fresh random salt.
///
/// # Errors
/// Returns an error when salt encoding or hashing fails.
pub fn hash_password(password: &str) -> Result<String> {
    let mut salt_bytes = [0_u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt_bytes);
    let salt = SaltString::encode_b64(&salt_bytes)
        .map_err(|err| anyhow!("failed to encode password salt: {err}"))?;
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| anyhow!("failed to hash password: {err}"))?;
    Ok(hash.to_string())
}

/// Check `password` against a stored PHC string. A mismatch is `Ok(false)`.
///
/// # Errors
/// Returns an error when the stored hash cannot be parsed.
pub fn verify_password(password: &str, stored_hash: &str) -> Result<bool> {
    let parsed = PasswordHash::new(stored_hash)
        .map_err(|err| anyhow!("stored password hash is malformed: {err}"))?;
    Ok(Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok())
}

/// Issue a compact HS256 token naming `user` as subject.
///
/// # Errors
/// Returns an error when the signing key cannot be initialized or claims cannot be encoded.
pub fn issue_token(secret: &[u8], user: &str) -> Result<String> {
    let claims =
        TokenClaims { sub: user.to_string(), iat: OffsetDateTime::now_utc().unix_timestamp() };
    let header = encode_segment(&TokenHeader::hs256())?;
    let body = encode_segment(&claims)?;
    let signing_input = format!("{header}.{body}");
    let signature = URL_SAFE_NO_PAD.encode(sign(secret, signing_input.as_bytes())?);
    Ok(format!("{signing_input}.{signature}"))
}

/// Verify signature and header of a token and return its claims.
///
/// Accepts the raw token or an `Authorization` value with a `Bearer ` prefix.
///
/// # Errors
/// Returns [`ApiError::Unauthorized`] when the token is malformed, signed with another key
/// or uses a different algorithm.
pub fn verify_token(secret: &[u8], token: &str) -> Result<TokenClaims, ApiError> {
    let token = token.trim();
    let token = token.strip_prefix("Bearer ").unwrap_or(token).trim();
    let mut segments = token.split('.');
    let (Some(header), Some(body), Some(signature), None) =
        (segments.next(), segments.next(), segments.next(), segments.next())
    else {
        return Err(unauthorized("token is not a compact JWT"));
    };

    let signature = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|_| unauthorized("token signature is not base64url"))?;
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret)
        .map_err(|err| ApiError::Internal(anyhow!("failed to initialize token key: {err}")))?;
    mac.update(header.as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());
    mac.verify_slice(&signature).map_err(|_| unauthorized("token signature does not match"))?;

    let header: TokenHeader =
        decode_segment(header).map_err(|_| unauthorized("token header is invalid"))?;
    if header.alg != TOKEN_ALG {
        return Err(unauthorized("token algorithm is not HS256"));
    }
    decode_segment(body).map_err(|_| unauthorized("token claims are invalid"))
}

fn unauthorized(message: &str) -> ApiError {
    ApiError::Unauthorized(message.to_string())
}

fn sign(secret: &[u8], input: &[u8]) -> Result<Vec<u8>> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret)
        .map_err(|err| anyhow!("failed to initialize token key: {err}"))?;
    mac.update(input);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn encode_segment<T: Serialize>(value: &T) -> Result<String> {
    let json = serde_json::to_vec(value).context("failed to serialize token segment")?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

fn decode_segment<T: DeserializeOwned>(segment: &str) -> Result<T> {
    let bytes = URL_SAFE_NO_PAD.decode(segment).context("token segment is not base64url")?;
    serde_json::from_slice(&bytes).context("token segment is not valid json")
}
