//! Credential tokens presented when an origin demands authorization.

use base64::{engine::general_purpose::STANDARD, Engine as _};

/// Produces opaque credential tokens on demand.
pub trait CredentialProvider: Send + Sync {
    /// Mint a token for one authorization exchange.
    ///
    /// # Errors
    ///
    /// Returns error if no token can be produced.
    fn create_token(&self) -> Result<Vec<u8>, CredentialError>;
}

impl<F> CredentialProvider for F
where
    F: Fn() -> Result<Vec<u8>, CredentialError> + Send + Sync,
{
    fn create_token(&self) -> Result<Vec<u8>, CredentialError> {
        self()
    }
}

/// Provider that presents the same token every time.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: Vec<u8>,
}

impl StaticTokenProvider {
    /// Create a provider for a raw token.
    #[must_use]
    pub fn new(token: impl Into<Vec<u8>>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// Create a provider from a base64-encoded token.
    ///
    /// # Errors
    ///
    /// Returns error if the text is not valid base64.
    pub fn from_base64(encoded: &str) -> Result<Self, CredentialError> {
        decode_token(encoded).map(Self::new)
    }
}

impl CredentialProvider for StaticTokenProvider {
    fn create_token(&self) -> Result<Vec<u8>, CredentialError> {
        Ok(self.token.clone())
    }
}

/// Encode a token for configuration files and environment variables.
#[must_use]
pub fn encode_token(token: &[u8]) -> String {
    STANDARD.encode(token)
}

/// Decode a token produced by [`encode_token`].
///
/// # Errors
///
/// Returns error if the text is not valid base64.
pub fn decode_token(encoded: &str) -> Result<Vec<u8>, CredentialError> {
    STANDARD
        .decode(encoded.trim())
        .map_err(|e| CredentialError::InvalidEncoding(e.to_string()))
}

/// Errors raised by credential providers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CredentialError {
    /// Token text is not valid base64
    #[error("invalid token encoding: {0}")]
    InvalidEncoding(String),
    /// Provider could not produce a token
    #[error("credential unavailable: {0}")]
    Unavailable(String),
}
