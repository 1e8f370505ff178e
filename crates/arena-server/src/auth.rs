use async_trait::async_trait;
use serde::Deserialize;
use uuid::Uuid;

/// An authenticated caller, bound to a connection for its lifetime.
/// Room operations always use this identity, never a client-supplied id
/// from a later request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub id: Uuid,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid or expired token")]
    InvalidToken,
    #[error("token does not belong to the claimed identity")]
    IdentityMismatch,
    #[error("auth service unavailable: {0}")]
    Unavailable(String),
}

/// Confirms a bearer token against a claimed identity, once per new
/// connection. The verification itself lives in an external auth
/// service; implementations of this trait only consume it.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str, claimed: Uuid) -> Result<Identity, AuthError>;
}

#[derive(Deserialize)]
struct VerifyResponse {
    user_id: Uuid,
}

/// Verifies tokens against an HTTP auth endpoint. The endpoint takes a
/// bearer token and returns the identity it was issued for; the claimed
/// id must match.
pub struct HttpVerifier {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpVerifier {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl IdentityVerifier for HttpVerifier {
    async fn verify(&self, token: &str, claimed: Uuid) -> Result<Identity, AuthError> {
        let response = self
            .client
            .get(&self.endpoint)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AuthError::InvalidToken);
        }

        let body: VerifyResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;

        if body.user_id != claimed {
            return Err(AuthError::IdentityMismatch);
        }
        Ok(Identity { id: claimed })
    }
}

/// Trusts the claimed identity outright. For local development and
/// tests only.
pub struct InsecureVerifier;

#[async_trait]
impl IdentityVerifier for InsecureVerifier {
    async fn verify(&self, _token: &str, claimed: Uuid) -> Result<Identity, AuthError> {
        Ok(Identity { id: claimed })
    }
}
