//! SASL authentication surface shared by both AMQP protocol versions.
//!
//! The broker core only consumes the [`Provider`] trait; credential
//! verification itself is a collaborator supplied at startup.

use crate::{MeshmqError, Result};
use async_trait::async_trait;
use std::sync::Arc;

pub const MECHANISM_PLAIN: &str = "PLAIN";

/// Outcome of a successful authentication exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Anonymous,
    UsernamePassword { username: String },
}

impl Token {
    pub fn subject(&self) -> &str {
        match self {
            Token::Anonymous => "<anonymous>",
            Token::UsernamePassword { username } => username,
        }
    }
}

/// One SASL mechanism implementation.
#[async_trait]
pub trait Provider: Send + Sync {
    fn mechanism(&self) -> &'static str;

    /// Process one client response; either yields a token or fails.
    async fn authenticate(&self, response: &[u8]) -> Result<Token>;
}

/// Pluggable credential check backing the PLAIN mechanism.
pub type UsernamePasswordVerifier =
    Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// SASL PLAIN: the response is `\0<username>\0<password>`.
pub struct PlainProvider {
    verify: UsernamePasswordVerifier,
}

impl PlainProvider {
    pub fn new(verify: UsernamePasswordVerifier) -> Self {
        Self { verify }
    }

    /// Accepts any credentials. Development default, matching an open broker.
    pub fn permissive() -> Self {
        Self::new(Arc::new(|_, _| true))
    }
}

#[async_trait]
impl Provider for PlainProvider {
    fn mechanism(&self) -> &'static str {
        MECHANISM_PLAIN
    }

    async fn authenticate(&self, response: &[u8]) -> Result<Token> {
        let mut parts = response.split(|b| *b == 0);
        let _authzid = parts.next();
        let (Some(username), Some(password)) = (parts.next(), parts.next()) else {
            return Err(MeshmqError::Validation(
                "malformed PLAIN response".to_string(),
            ));
        };
        let username = std::str::from_utf8(username)
            .map_err(|_| MeshmqError::Validation("username is not utf-8".to_string()))?;
        let password = std::str::from_utf8(password)
            .map_err(|_| MeshmqError::Validation("password is not utf-8".to_string()))?;

        if (self.verify)(username, password) {
            Ok(Token::UsernamePassword {
                username: username.to_string(),
            })
        } else {
            Err(MeshmqError::Validation(format!(
                "authentication failed for {:?}",
                username
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plain_parses_null_separated_response() {
        let provider = PlainProvider::new(Arc::new(|user, pass| user == "guest" && pass == "s3cret"));

        let token = provider.authenticate(b"\0guest\0s3cret").await.unwrap();
        assert_eq!(
            token,
            Token::UsernamePassword {
                username: "guest".to_string()
            }
        );

        assert!(provider.authenticate(b"\0guest\0wrong").await.is_err());
    }

    #[tokio::test]
    async fn plain_rejects_empty_and_single_null_responses() {
        let provider = PlainProvider::permissive();
        assert!(provider.authenticate(b"").await.is_err());
        assert!(provider.authenticate(b"\0").await.is_err());
    }
}
