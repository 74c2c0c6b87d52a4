//! Bearer credential verification for the upgrade endpoint.

use roomcast_core::AuthError;

/// Turns a bearer token into a verified user identity.
pub trait Authenticator: Send + Sync {
    /// Verify `token` and return the user id it identifies.
    fn verify(&self, token: &str) -> Result<String, AuthError>;
}

/// Development scheme: a token `user:<id>` identifies user `<id>`.
#[derive(Clone, Debug)]
pub struct PrefixTokenAuthenticator {
    prefix: String,
}

impl PrefixTokenAuthenticator {
    /// Accept tokens of the form `<prefix><user id>`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for PrefixTokenAuthenticator {
    fn default() -> Self {
        Self::new("user:")
    }
}

impl Authenticator for PrefixTokenAuthenticator {
    fn verify(&self, token: &str) -> Result<String, AuthError> {
        token
            .strip_prefix(self.prefix.as_str())
            .filter(|user| !user.is_empty())
            .map(str::to_owned)
            .ok_or(AuthError::InvalidToken)
    }
}

/// Verify an optional query-string token. Empty counts as missing.
pub fn authenticate(auth: &dyn Authenticator, token: Option<&str>) -> Result<String, AuthError> {
    let token = token
        .filter(|t| !t.is_empty())
        .ok_or(AuthError::MissingToken)?;
    auth.verify(token)
}
