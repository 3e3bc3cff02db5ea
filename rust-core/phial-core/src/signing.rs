//! # Signing
//!
//! HS256 tokens carrying a JSON payload and its issue time. The key is the
//! secret combined with a salt, so tokens minted for one purpose do not verify
//! for another.

use crate::error::{Error, Result};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    data: Value,
    iat: i64,
}

/// Signs and verifies payloads
#[derive(Clone)]
pub struct Signer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer").finish_non_exhaustive()
    }
}

impl Signer {
    /// Create a signer from a secret and a salt
    #[must_use]
    pub fn new(secret: &str, salt: &str) -> Self {
        let key = format!("{salt}signer{secret}");
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.required_spec_claims = HashSet::new();
        Self {
            encoding_key: EncodingKey::from_secret(key.as_bytes()),
            decoding_key: DecodingKey::from_secret(key.as_bytes()),
            validation,
        }
    }

    /// Sign a payload
    ///
    /// # Errors
    ///
    /// Returns `Error::Signature` if the token cannot be encoded.
    pub fn sign(&self, payload: &Value) -> Result<String> {
        let claims = Claims {
            data: payload.clone(),
            iat: chrono::Utc::now().timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| Error::Signature(e.to_string()))
    }

    /// Verify a token and return its payload
    ///
    /// # Errors
    ///
    /// Returns `Error::Signature` for a tampered token or one older than `max_age`.
    pub fn verify(&self, token: &str, max_age: Option<Duration>) -> Result<Value> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| Error::Signature(e.to_string()))?;

        if let Some(max_age) = max_age {
            let age = chrono::Utc::now().timestamp() - data.claims.iat;
            let limit = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX);
            if age > limit {
                return Err(Error::Signature(format!(
                    "Signature age {age} > {limit} seconds"
                )));
            }
        }

        Ok(data.claims.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sign_and_verify() {
        let signer = Signer::new("secret", "cookie-session");
        let token = signer.sign(&json!({"user": 1})).unwrap();
        let payload = signer.verify(&token, Some(Duration::from_secs(60))).unwrap();
        assert_eq!(payload, json!({"user": 1}));
    }

    #[test]
    fn test_wrong_secret_or_salt() {
        let token = Signer::new("secret", "a").sign(&json!(1)).unwrap();
        assert!(matches!(
            Signer::new("other", "a").verify(&token, None),
            Err(Error::Signature(_))
        ));
        assert!(Signer::new("secret", "b").verify(&token, None).is_err());
    }

    #[test]
    fn test_tampered_token() {
        let signer = Signer::new("secret", "s");
        let mut token = signer.sign(&json!({"a": true})).unwrap();
        token.push('x');
        assert!(signer.verify(&token, None).is_err());
    }

    #[test]
    fn test_expired_token() {
        let signer = Signer::new("secret", "s");
        let claims = Claims {
            data: json!(null),
            iat: chrono::Utc::now().timestamp() - 120,
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &signer.encoding_key).unwrap();
        assert!(signer.verify(&token, Some(Duration::from_secs(60))).is_err());
        assert!(signer.verify(&token, Some(Duration::from_secs(600))).is_ok());
    }
}
