//! Credential access for REST calls and channel connects.

use std::sync::{Arc, RwLock};

/// Source of the current bearer token.
///
/// Read afresh before every REST request and every channel connect attempt, so
/// a token refreshed by the application is picked up without rebuilding
/// sessions. `None` means the player is not logged in.
pub trait CredentialProvider: Send + Sync + 'static {
    fn current_token(&self) -> Option<String>;
}

impl<T: CredentialProvider + ?Sized> CredentialProvider for Arc<T> {
    fn current_token(&self) -> Option<String> {
        (**self).current_token()
    }
}

/// A fixed token.
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    token: Option<String>,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    /// A provider that never yields a token.
    pub fn anonymous() -> Self {
        Self { token: None }
    }
}

impl CredentialProvider for StaticCredentials {
    fn current_token(&self) -> Option<String> {
        self.token.clone()
    }
}

/// Token store with a login/logout lifecycle, shared by reference.
///
/// ```
/// use rookline_client::credentials::{CredentialProvider, SessionCredentials};
///
/// let creds = SessionCredentials::new();
/// assert_eq!(creds.current_token(), None);
/// creds.login("abc");
/// assert_eq!(creds.current_token().as_deref(), Some("abc"));
/// creds.logout();
/// assert_eq!(creds.current_token(), None);
/// ```
#[derive(Debug, Default)]
pub struct SessionCredentials {
    token: RwLock<Option<String>>,
}

impl SessionCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a freshly issued token, replacing any previous one.
    pub fn login(&self, token: impl Into<String>) {
        let token = token.into();
        match self.token.write() {
            Ok(mut guard) => *guard = Some(token),
            Err(poisoned) => *poisoned.into_inner() = Some(token),
        }
        tracing::debug!("credentials updated");
    }

    /// Forget the token.
    pub fn logout(&self) {
        match self.token.write() {
            Ok(mut guard) => *guard = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
        tracing::debug!("credentials cleared");
    }
}

impl CredentialProvider for SessionCredentials {
    fn current_token(&self) -> Option<String> {
        match self.token.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_credentials() {
        assert_eq!(StaticCredentials::new("t").current_token().as_deref(), Some("t"));
        assert_eq!(StaticCredentials::anonymous().current_token(), None);
    }

    #[test]
    fn shared_session_credentials_see_updates() {
        let creds = Arc::new(SessionCredentials::new());
        let provider: Arc<dyn CredentialProvider> = creds.clone();
        assert_eq!(provider.current_token(), None);
        creds.login("fresh");
        assert_eq!(provider.current_token().as_deref(), Some("fresh"));
    }
}
