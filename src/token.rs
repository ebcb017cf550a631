use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use crate::db::{self, DbPool};
use crate::error::AppError;
use crate::models::{ObjectId, User, AUTH_ACCESS};

#[derive(Debug, Error, PartialEq)]
pub enum TokenError {
    #[error("invalid token")]
    Invalid,
    #[error("token signing failed: {0}")]
    Signing(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    #[serde(rename = "_id")]
    id: String,
    access: String,
    iat: i64,
    /// Keeps tokens issued within the same second distinct.
    jti: String,
}

/// Issues and checks HS256 tokens bound to a user id and the `auth` purpose.
/// A token is only accepted while it is also present in the user's token list.
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl TokenService {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.required_spec_claims.clear();

        TokenService {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    fn sign(&self, user_id: &ObjectId, access: &str) -> Result<String, TokenError> {
        let claims = Claims {
            id: user_id.to_string(),
            access: access.to_string(),
            iat: OffsetDateTime::now_utc().unix_timestamp(),
            jti: format!("{:016x}", rand::rng().random::<u64>()),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| TokenError::Signing(e.to_string()))
    }

    /// Signs a fresh token for `user` and appends it to the stored token list.
    pub fn issue(&self, pool: &DbPool, user: &mut User) -> Result<String, AppError> {
        let token = self.sign(&user.id, AUTH_ACCESS)?;
        db::push_token(pool, &user.id, AUTH_ACCESS, &token)?;
        user.push_token(AUTH_ACCESS, &token);
        Ok(token)
    }

    /// Checks the signature and purpose. Says nothing about revocation.
    pub fn verify(&self, token: &str) -> Result<ObjectId, TokenError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|_| TokenError::Invalid)?;
        if data.claims.access != AUTH_ACCESS {
            return Err(TokenError::Invalid);
        }
        ObjectId::parse(&data.claims.id).ok_or(TokenError::Invalid)
    }

    pub fn resolve(&self, pool: &DbPool, token: &str) -> Result<User, AppError> {
        let id = self
            .verify(token)
            .map_err(|_| AppError::Unauthenticated)?;
        db::find_user_by_token(pool, &id, AUTH_ACCESS, token)?.ok_or(AppError::Unauthenticated)
    }

    pub fn revoke(&self, pool: &DbPool, user: &mut User, token: &str) -> Result<(), AppError> {
        db::remove_token(pool, &user.id, token)?;
        user.remove_token(token);
        Ok(())
    }
}
