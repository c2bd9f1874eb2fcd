//! Authentication hook.
//!
//! Parlor does not implement authentication — identity storage, password
//! hashing, and token issuance live behind this trait. The hub calls
//! [`Authenticator::authenticate`] once per connection during the
//! handshake; everything downstream trusts the returned identity.

use parlor_protocol::UserId;

use crate::SessionError;

/// An authenticated identity, as the provider resolved it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthedUser {
    pub user_id: UserId,
    pub display_name: String,
}

/// Validates a client's token and returns their identity.
///
/// Implementations range from JWT validation in production to an
/// accept-everyone stub in tests.
pub trait Authenticator: Send + Sync + 'static {
    fn authenticate(
        &self,
        token: &str,
    ) -> impl std::future::Future<Output = Result<AuthedUser, SessionError>> + Send;
}
