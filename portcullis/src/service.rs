//! The tower middleware that attaches [`AuthSession`] to requests.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use http::{Request, Response, StatusCode};
use tower::{Layer, Service};
use tower_cookies::CookieManager;
use tower_sessions::service::{CookieController, PlaintextCookie};
use tower_sessions::{Session, SessionManager, SessionManagerLayer, SessionStore};

use crate::backend::AuthnBackend;
use crate::session::AuthSession;

/// A middleware that provides [`AuthSession`] as a request extension.
#[derive(Debug, Clone)]
pub struct AuthManager<S, Backend: AuthnBackend> {
    inner: S,
    backend: Backend,
}

impl<ReqBody, ResBody, S, Backend> Service<Request<ReqBody>> for AuthManager<S, Backend>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Default + Send + 'static,
    Backend: AuthnBackend,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    #[inline]
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        let backend = self.backend.clone();

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move {
            let internal_error = || {
                Ok(Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Default::default())
                    .expect("infallible response construction"))
            };

            let Some(session) = req.extensions().get::<Session>().cloned() else {
                tracing::error!("session not found in request extensions");
                return internal_error();
            };

            let auth_session = match AuthSession::from_session(session, backend).await {
                Ok(auth_session) => auth_session,
                Err(err) => {
                    tracing::error!(%err, "could not load auth session");
                    return internal_error();
                }
            };

            req.extensions_mut().insert(auth_session);

            inner.call(req).await
        })
    }
}

/// A layer for providing [`AuthSession`] as a request extension.
///
/// Wraps the session layer, so installing this installs both: the session
/// manager runs outside and the auth manager inside, exactly the ordering
/// the auth manager needs to find a session on the request.
#[derive(Debug, Clone)]
pub struct AuthManagerLayer<
    Backend: AuthnBackend,
    Sessions: SessionStore,
    C: CookieController = PlaintextCookie,
> {
    backend: Backend,
    session_manager_layer: SessionManagerLayer<Sessions, C>,
}

impl<Backend, Sessions, C> AuthManagerLayer<Backend, Sessions, C>
where
    Backend: AuthnBackend,
    Sessions: SessionStore,
    C: CookieController,
{
    /// Creates a layer from the application backend and a configured
    /// session layer.
    ///
    /// The session layer carries the cookie configuration, including the
    /// signing key when the host uses signed session cookies.
    pub fn new(
        backend: Backend,
        session_manager_layer: SessionManagerLayer<Sessions, C>,
    ) -> Self {
        Self {
            backend,
            session_manager_layer,
        }
    }
}

impl<S, Backend, Sessions, C> Layer<S> for AuthManagerLayer<Backend, Sessions, C>
where
    Backend: AuthnBackend,
    Sessions: SessionStore,
    C: CookieController,
{
    type Service = CookieManager<SessionManager<AuthManager<S, Backend>, Sessions, C>>;

    fn layer(&self, inner: S) -> Self::Service {
        let auth_manager = AuthManager {
            inner,
            backend: self.backend.clone(),
        };

        self.session_manager_layer.layer(auth_manager)
    }
}
