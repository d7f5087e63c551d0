use async_trait::async_trait;
use jsonwebtoken::{decode, DecodingKey, Validation};

use crate::config::JwtConfig;
use crate::error::AppError;

use super::{Authenticator, Claims};

pub struct JwtValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    pub fn new(config: &JwtConfig) -> Self {
        let decoding_key = DecodingKey::from_secret(config.secret.as_bytes());

        let mut validation = Validation::default();
        // Tokens without `exp` are accepted; `exp` is still checked when present.
        validation.required_spec_claims.clear();

        if let Some(ref issuer) = config.issuer {
            validation.set_issuer(&[issuer]);
        }

        if let Some(ref audience) = config.audience {
            validation.set_audience(&[audience]);
        }

        Self {
            decoding_key,
            validation,
        }
    }

    pub fn validate(&self, token: &str) -> Result<Claims, AppError> {
        let token_data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| AppError::Unauthorized(format!("Invalid token: {}", e)))?;

        Ok(token_data.claims)
    }
}

#[async_trait]
impl Authenticator for JwtValidator {
    async fn authenticate(&self, token: &str) -> Result<String, AppError> {
        let claims = self.validate(token)?;
        claims
            .user_id()
            .map(str::to_string)
            .ok_or_else(|| AppError::Unauthorized("Token carries no user id".to_string()))
    }
}
