//! The authenticated-session state carried through each request.

use std::fmt::Debug;

use serde::{Deserialize, Serialize};
use tower_sessions::{session, Session};

use crate::backend::AuthnBackend;
use crate::openid::HandshakeState;

/// An error from the session layer or the application backend.
#[derive(thiserror::Error)]
pub enum Error<Backend: AuthnBackend> {
    /// The session store failed.
    #[error(transparent)]
    Session(session::Error),

    /// The backend failed.
    #[error(transparent)]
    Backend(Backend::Error),
}

impl<Backend: AuthnBackend> Debug for Error<Backend> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Session(err) => write!(f, "{:?}", err)?,
            Error::Backend(err) => write!(f, "{:?}", err)?,
        };

        Ok(())
    }
}

// Everything this middleware keeps in the session, under a single key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Data<UserId> {
    user_id: Option<UserId>,
    return_to: Option<String>,
    openid: Option<HandshakeState>,
}

impl<UserId> Default for Data<UserId> {
    fn default() -> Self {
        Self {
            user_id: None,
            return_to: None,
            openid: None,
        }
    }
}

/// A per-request handle on the visitor's authentication state.
///
/// Obtained as an axum extractor (or from request extensions) once
/// [`AuthManagerLayer`](crate::AuthManagerLayer) is installed. The current
/// user is exposed as an opaque identifier: whatever the backend returned
/// when the session was authorized.
///
/// Writes go straight through to the underlying session store, so state
/// set by one operation is visible to the next request. Two concurrent
/// requests in the same browser session can race those writes; the last
/// writer wins, which is accepted behavior for everything here except
/// nonce claiming (which lives in the association store precisely because
/// it must not race).
#[derive(Clone)]
pub struct AuthSession<Backend: AuthnBackend> {
    /// The identifier of the logged-in user, if any.
    pub user_id: Option<Backend::UserId>,
    /// The application backend, for handlers that need it.
    pub backend: Backend,

    data: Data<Backend::UserId>,
    session: Session,
}

// `UserId` isn't required to implement `Debug`, so only the
// authentication state is shown.
impl<Backend: AuthnBackend> Debug for AuthSession<Backend> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSession")
            .field("authenticated", &self.user_id.is_some())
            .finish_non_exhaustive()
    }
}

impl<Backend: AuthnBackend> AuthSession<Backend> {
    const DATA_KEY: &'static str = "portcullis.data";

    pub(crate) async fn from_session(
        session: Session,
        backend: Backend,
    ) -> Result<Self, Error<Backend>> {
        let data: Data<_> = session
            .get(Self::DATA_KEY)
            .await
            .map_err(Error::Session)?
            .unwrap_or_default();

        Ok(Self {
            user_id: data.user_id.clone(),
            backend,
            data,
            session,
        })
    }

    /// Marks the session as belonging to `user_id`.
    ///
    /// This is the only place the current user is ever set. The session id
    /// is cycled first as a fixation mitigation; the rest of the record
    /// (including any pending `return_to`) carries over.
    pub async fn authorize(&mut self, user_id: Backend::UserId) -> Result<(), Error<Backend>> {
        self.data.user_id = Some(user_id.clone());
        self.user_id = Some(user_id);
        self.session.cycle_id().await.map_err(Error::Session)?;

        self.update_session().await
    }

    /// Logs the current user out, returning their identifier.
    ///
    /// Only the current user is cleared: `return_to` and any in-flight
    /// OpenID handshake survive, so a logout mid-flow does not strand the
    /// visitor.
    pub async fn logout(&mut self) -> Result<Option<Backend::UserId>, Error<Backend>> {
        let user_id = self.data.user_id.take();
        self.user_id = None;
        self.update_session().await?;

        Ok(user_id)
    }

    /// The path a successful login should return the visitor to, if set.
    pub fn return_to(&self) -> Option<&str> {
        self.data.return_to.as_deref()
    }

    /// Records where a successful login should land.
    pub async fn set_return_to(
        &mut self,
        path: impl Into<String>,
    ) -> Result<(), Error<Backend>> {
        self.data.return_to = Some(path.into());
        self.update_session().await
    }

    /// Takes the pending return path, clearing it.
    ///
    /// Return targets are single-use: the first successful login consumes
    /// the value, so a later login from the same session lands on the
    /// default path again.
    pub async fn take_return_to(&mut self) -> Result<Option<String>, Error<Backend>> {
        let return_to = self.data.return_to.take();
        if return_to.is_some() {
            self.update_session().await?;
        }

        Ok(return_to)
    }

    pub(crate) async fn put_handshake(
        &mut self,
        state: HandshakeState,
    ) -> Result<(), Error<Backend>> {
        self.data.openid = Some(state);
        self.update_session().await
    }

    // A handshake gets exactly one completion attempt per session.
    pub(crate) async fn take_handshake(
        &mut self,
    ) -> Result<Option<HandshakeState>, Error<Backend>> {
        let state = self.data.openid.take();
        if state.is_some() {
            self.update_session().await?;
        }

        Ok(state)
    }

    async fn update_session(&self) -> Result<(), Error<Backend>> {
        self.session
            .insert(Self::DATA_KEY, self.data.clone())
            .await
            .map_err(Error::Session)
    }
}
