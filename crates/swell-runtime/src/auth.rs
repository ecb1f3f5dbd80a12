use std::time::SystemTime;

use swell_core::AuthReason;
use thiserror::Error;

/// Authenticated identity attached to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub roles: Vec<String>,
    pub expires_at: Option<SystemTime>,
}

impl Principal {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            roles: Vec::new(),
            expires_at: None,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    pub fn expiring_at(mut self, at: SystemTime) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("not authenticated")]
    Unauthenticated,
    #[error("credentials expired")]
    Expired,
    #[error("forbidden: {0}")]
    Forbidden(String),
}

impl AuthError {
    pub fn reason(&self) -> AuthReason {
        match self {
            AuthError::Unauthenticated => AuthReason::Unauthenticated,
            AuthError::Expired => AuthReason::Expired,
            AuthError::Forbidden(_) => AuthReason::Forbidden,
        }
    }
}

/// Validates the session's principal on each request and on re-auth ticks.
/// `Ok(None)` means the caller is anonymous.
pub trait AuthCheck: Send + Sync {
    fn check(&self, current: Option<&Principal>) -> Result<Option<Principal>, AuthError>;
}

/// Restores the principal of a previously authenticated session on resume.
pub trait ResumeRehydrator: Send + Sync {
    fn rehydrate(&self, user_id: Option<&str>, presented: Option<&Principal>) -> Option<Principal>;
}

/// Accepts a principal until its expiry.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExpiryCheck;

impl AuthCheck for ExpiryCheck {
    fn check(&self, current: Option<&Principal>) -> Result<Option<Principal>, AuthError> {
        match current {
            Some(principal) if principal.is_expired_at(SystemTime::now()) => Err(AuthError::Expired),
            other => Ok(other.cloned()),
        }
    }
}

/// Rehydrates only when the reconnecting client presents the same user.
#[derive(Debug, Default, Clone, Copy)]
pub struct PresentedPrincipal;

impl ResumeRehydrator for PresentedPrincipal {
    fn rehydrate(&self, user_id: Option<&str>, presented: Option<&Principal>) -> Option<Principal> {
        let presented = presented?;
        if presented.is_expired_at(SystemTime::now()) {
            return None;
        }
        match user_id {
            Some(expected) if expected != presented.user_id => None,
            _ => Some(presented.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test_timeout::timeout]
    fn expiry_check_rejects_stale_principals() {
        let past = SystemTime::now() - Duration::from_secs(5);
        let stale = Principal::new("u1").expiring_at(past);
        assert_eq!(ExpiryCheck.check(Some(&stale)), Err(AuthError::Expired));
        assert_eq!(ExpiryCheck.check(None), Ok(None));
        let fresh = Principal::new("u1");
        assert_eq!(ExpiryCheck.check(Some(&fresh)), Ok(Some(fresh.clone())));
    }

    #[test_timeout::timeout]
    fn rehydration_requires_matching_user() {
        let presented = Principal::new("alice");
        assert_eq!(
            PresentedPrincipal.rehydrate(Some("alice"), Some(&presented)),
            Some(presented.clone())
        );
        assert_eq!(PresentedPrincipal.rehydrate(Some("bob"), Some(&presented)), None);
        assert_eq!(PresentedPrincipal.rehydrate(Some("alice"), None), None);
    }

    #[test_timeout::timeout]
    fn errors_map_to_wire_reasons() {
        assert_eq!(AuthError::Expired.reason(), AuthReason::Expired);
        assert_eq!(
            AuthError::Forbidden("admin only".into()).reason(),
            AuthReason::Forbidden
        );
    }
}
