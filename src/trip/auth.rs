//! Identity provider seam.

use async_trait::async_trait;
use tokio::sync::watch;

use super::User;

#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("not signed in")]
    NotSignedIn,
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    fn current_user(&self) -> Option<User>;
    async fn sign_in(&self, email: &str, password: &str) -> Result<User, AuthError>;
    async fn sign_out(&self) -> Result<(), AuthError>;
    /// Current user now, and every sign-in/sign-out after.
    fn on_auth_state_change(&self) -> watch::Receiver<Option<User>>;
}

/// A single fixed identity, as used by the CLI.
pub struct StaticAuth {
    account: User,
    password: Option<String>,
    session: watch::Sender<Option<User>>,
}

impl StaticAuth {
    /// Signed out; `sign_in` accepts the account's email with `password`
    /// (any password if none is set).
    pub fn new(account: User, password: Option<String>) -> Self {
        let (session, _) = watch::channel(None);
        Self {
            account,
            password,
            session,
        }
    }

    /// Already signed in as `account`.
    pub fn signed_in(account: User) -> Self {
        let auth = Self::new(account, None);
        auth.session.send_replace(Some(auth.account.clone()));
        auth
    }
}

#[async_trait]
impl AuthProvider for StaticAuth {
    fn current_user(&self) -> Option<User> {
        self.session.borrow().clone()
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<User, AuthError> {
        let email_ok = self.account.email.as_deref() == Some(email);
        let password_ok = self.password.as_deref().map_or(true, |p| p == password);
        if !email_ok || !password_ok {
            tracing::warn!("Sign-in rejected for {}", email);
            return Err(AuthError::InvalidCredentials);
        }
        tracing::info!("Signed in as {}", self.account.id);
        self.session.send_replace(Some(self.account.clone()));
        Ok(self.account.clone())
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        if self.session.borrow().is_none() {
            return Err(AuthError::NotSignedIn);
        }
        self.session.send_replace(None);
        tracing::info!("Signed out");
        Ok(())
    }

    fn on_auth_state_change(&self) -> watch::Receiver<Option<User>> {
        self.session.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> User {
        User {
            email: Some("rider@example.com".into()),
            ..User::new("rider-1")
        }
    }

    #[tokio::test]
    async fn test_sign_in_and_out() {
        let auth = StaticAuth::new(account(), Some("hunter2".into()));
        let mut changes = auth.on_auth_state_change();
        assert!(auth.current_user().is_none());

        assert!(matches!(
            auth.sign_in("rider@example.com", "wrong").await,
            Err(AuthError::InvalidCredentials)
        ));
        let user = auth.sign_in("rider@example.com", "hunter2").await.unwrap();
        assert_eq!(user.id, "rider-1");

        changes.changed().await.unwrap();
        assert_eq!(changes.borrow().as_ref().map(|u| u.id.clone()), Some("rider-1".into()));

        auth.sign_out().await.unwrap();
        assert!(auth.current_user().is_none());
        assert!(matches!(auth.sign_out().await, Err(AuthError::NotSignedIn)));
    }

    #[test]
    fn test_signed_in() {
        let auth = StaticAuth::signed_in(User::new("driver-1"));
        assert_eq!(auth.current_user().unwrap().id, "driver-1");
    }
}
