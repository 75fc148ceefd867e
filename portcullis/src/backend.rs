//! The contract between this crate and the embedding application.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Credentials submitted through the local login form.
///
/// Both fields are opaque to this crate and may be empty; deciding what
/// constitutes a valid pair is entirely the backend's business. Values are
/// transient: they are handed to [`AuthnBackend::authenticate`] and dropped.
#[derive(Clone, Deserialize)]
pub struct Credentials {
    /// The submitted login name.
    pub login: String,
    /// The submitted password, in the clear as received from the form.
    pub password: String,
}

// Manual `Debug` so the password can't end up in logs.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .field("password", &"[redacted]")
            .finish()
    }
}

/// An identity URL an OpenID provider has vouched for.
///
/// Values of this type are only minted by the relying-party consumer after
/// the provider's assertion has been verified, so a backend receiving one in
/// [`AuthnBackend::authenticate_identity`] may trust that verification
/// already happened. Note this is the canonical identity the provider
/// asserted, which may differ from the identifier the visitor typed.
#[derive(Clone, PartialEq, Eq)]
pub struct VerifiedIdentity(String);

impl VerifiedIdentity {
    pub(crate) fn new(url: String) -> Self {
        Self(url)
    }

    /// The verified identity URL.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for VerifiedIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("VerifiedIdentity").field(&self.0).finish()
    }
}

impl std::fmt::Display for VerifiedIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of a signup submission.
#[derive(Debug, Clone)]
pub enum SignupOutcome<UserId> {
    /// The account was created; the new user is logged in right away.
    Registered(UserId),
    /// The submission was rejected. Messages are ordered, plain text, and
    /// unescaped; the view layer escapes each one exactly once.
    Rejected(Vec<String>),
}

/// A backend which can authenticate users and, optionally, sign them up.
///
/// This is the application-supplied half of the middleware. A backend maps
/// submitted credentials, or a provider-verified identity URL, to an
/// application-level user identifier; the identifier itself is opaque to
/// this crate and is only ever stored in and read back from the session.
///
/// Returning `Ok(None)` from either authentication method is the normal,
/// silent way to reject an attempt: the visitor is redirected back to the
/// login page with no further detail. Returning `Err` signals an
/// application or infrastructure fault and surfaces as a 500.
#[async_trait]
pub trait AuthnBackend: Clone + Send + Sync + 'static {
    /// The identifier stored in the session for a logged-in user.
    type UserId: Clone + Send + Sync + Serialize + DeserializeOwned + 'static;

    /// An error the backend's own storage or verification may produce.
    type Error: std::error::Error + Send + Sync;

    /// Verify local credentials, resolving to a user identifier on success.
    async fn authenticate(
        &self,
        creds: Credentials,
    ) -> Result<Option<Self::UserId>, Self::Error>;

    /// Map a provider-verified identity URL to a user identifier.
    ///
    /// Called only after the OpenID handshake has verified the assertion.
    /// Backends commonly look up (or provision) an account keyed by the
    /// identity URL here.
    async fn authenticate_identity(
        &self,
        identity: VerifiedIdentity,
    ) -> Result<Option<Self::UserId>, Self::Error>;

    /// Whether this backend offers self-registration.
    ///
    /// Signup is opt-in: while this returns `false` the signup routes
    /// answer with [`FlowResponse::NotHandled`](crate::FlowResponse) and
    /// [`signup`](AuthnBackend::signup) is never invoked.
    fn signup_enabled(&self) -> bool {
        false
    }

    /// Process a signup submission.
    ///
    /// Receives the full submitted form as an opaque field map. Only
    /// invoked when [`signup_enabled`](AuthnBackend::signup_enabled)
    /// returns `true`.
    async fn signup(
        &self,
        fields: HashMap<String, String>,
    ) -> Result<SignupOutcome<Self::UserId>, Self::Error> {
        let _ = fields;
        Ok(SignupOutcome::Rejected(Vec::new()))
    }
}
