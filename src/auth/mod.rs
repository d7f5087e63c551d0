mod claims;
mod jwt;
mod token;

use async_trait::async_trait;

pub use claims::Claims;
pub use jwt::JwtValidator;
pub use token::{extract_token, TokenQuery};

use crate::error::AppError;

/// Resolves a bearer credential to the user id it was issued for.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<String, AppError>;
}
