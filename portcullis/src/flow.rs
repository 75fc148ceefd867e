//! The authentication-flow orchestrator: mountable routers for the login,
//! signup, and OpenID operations.

use std::collections::HashMap;

use askama::Template;
use axum::extract::{Query, State};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get as on_get, post as on_post};
use axum::{Form, Router};
use http::{HeaderMap, StatusCode};
use serde::Deserialize;

use crate::backend::{AuthnBackend, Credentials, SignupOutcome};
use crate::openid::{
    AssociationStore, CallbackTarget, Consumer, ProtocolEngine, VerificationResult,
};
use crate::session::AuthSession;
use crate::views::{BuiltinViews, LoginPage, SignupPage, ViewContext, ViewKind, Views};

/// The outcome of an operation this middleware may decline to handle.
///
/// The signup routes yield [`NotHandled`](FlowResponse::NotHandled) when
/// the backend does not offer signup. As a plain axum response that
/// becomes a 404, but a host embedding these handlers directly can match
/// on the variant and fall through to whatever sits behind the middleware
/// instead.
#[derive(Debug)]
pub enum FlowResponse {
    /// The operation produced a response.
    Handled(Response),
    /// The operation is not offered by this configuration.
    NotHandled,
}

impl IntoResponse for FlowResponse {
    fn into_response(self) -> Response {
        match self {
            FlowResponse::Handled(response) => response,
            FlowResponse::NotHandled => StatusCode::NOT_FOUND.into_response(),
        }
    }
}

/// The local login, logout, and signup flows.
///
/// Produces a router serving `GET/POST /login`, `GET /logout`, and
/// `GET/POST /signup`. The backend is picked up from the
/// [`AuthManagerLayer`](crate::AuthManagerLayer) the host installs; the
/// view resolver decides whether custom pages replace the built-ins.
#[derive(Debug, Clone, Default)]
pub struct AuthFlow<V = BuiltinViews> {
    views: V,
}

impl AuthFlow<BuiltinViews> {
    /// A flow that renders the built-in pages.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<V: Views> AuthFlow<V> {
    /// Replaces the view resolver, e.g. with
    /// [`DirectoryViews`](crate::DirectoryViews).
    pub fn with_views<W: Views>(self, views: W) -> AuthFlow<W> {
        AuthFlow { views }
    }

    /// Builds the router for these flows.
    pub fn router<B: AuthnBackend>(self) -> Router<()> {
        Router::new()
            .route(
                "/login",
                on_get(get::login::<V>).post(post::login::<B>),
            )
            .route("/logout", on_get(get::logout::<B>))
            .route(
                "/signup",
                on_get(get::signup::<B, V>).post(post::signup::<B, V>),
            )
            .with_state(self.views)
    }
}

/// The OpenID relying-party flow.
///
/// Produces a router serving `POST /openid/initiate` and
/// `GET /openid/authenticate`. Engine-level failures never escape these
/// routes: federated login is always recoverable by re-showing the login
/// page.
#[derive(Debug, Clone)]
pub struct OpenIdFlow<E, S> {
    consumer: Consumer<E, S>,
}

impl<E, S> OpenIdFlow<E, S>
where
    E: ProtocolEngine,
    S: AssociationStore,
{
    /// Creates the flow from a protocol engine and an association store.
    pub fn new(engine: E, store: S) -> Self {
        Self {
            consumer: Consumer::new(engine, store),
        }
    }

    /// Builds the router for the handshake routes.
    pub fn router<B: AuthnBackend>(self) -> Router<()> {
        Router::new()
            .route(
                "/openid/initiate",
                on_post(post::openid_initiate::<B, E, S>),
            )
            .route(
                "/openid/authenticate",
                on_get(get::openid_authenticate::<B, E, S>),
            )
            .with_state(self.consumer)
    }
}

#[derive(Debug, Deserialize)]
struct InitiateForm {
    openid_identifier: String,
}

async fn page<V: Views>(views: &V, kind: ViewKind, cx: &ViewContext) -> Response {
    match views.render(kind, cx).await {
        Ok(Some(html)) => Html(html).into_response(),
        Ok(None) => builtin_page(kind, cx),
        Err(err) => {
            tracing::error!(%err, view = kind.name(), "could not render custom view");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn builtin_page(kind: ViewKind, cx: &ViewContext) -> Response {
    let rendered = match kind {
        ViewKind::Login => LoginPage.render(),
        ViewKind::Signup => SignupPage { errors: &cx.errors }.render(),
    };

    match rendered {
        Ok(html) => Html(html).into_response(),
        Err(err) => {
            tracing::error!(%err, view = kind.name(), "could not render built-in view");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// The return-or-redirect-to primitive: `return_to` wins over the default
// and is consumed by the trip. Callers invoke this only after a
// successful `authorize`.
async fn redirect_after_login<B: AuthnBackend>(auth_session: &mut AuthSession<B>) -> Response {
    match auth_session.take_return_to().await {
        Ok(Some(path)) => Redirect::to(&path).into_response(),
        Ok(None) => Redirect::to("/").into_response(),
        Err(err) => {
            tracing::error!(%err, "could not consume return path");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

mod get {
    use super::*;

    pub(super) async fn login<V: Views>(State(views): State<V>) -> Response {
        page(&views, ViewKind::Login, &ViewContext::default()).await
    }

    pub(super) async fn logout<B: AuthnBackend>(
        mut auth_session: AuthSession<B>,
    ) -> Response {
        match auth_session.logout().await {
            Ok(_) => Redirect::to("/").into_response(),
            Err(err) => {
                tracing::error!(%err, "could not log out");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }

    pub(super) async fn signup<B: AuthnBackend, V: Views>(
        State(views): State<V>,
        auth_session: AuthSession<B>,
    ) -> FlowResponse {
        if !auth_session.backend.signup_enabled() {
            return FlowResponse::NotHandled;
        }

        FlowResponse::Handled(page(&views, ViewKind::Signup, &ViewContext::default()).await)
    }

    pub(super) async fn openid_authenticate<B, E, S>(
        State(consumer): State<Consumer<E, S>>,
        mut auth_session: AuthSession<B>,
        headers: HeaderMap,
        Query(params): Query<HashMap<String, String>>,
    ) -> Response
    where
        B: AuthnBackend,
        E: ProtocolEngine,
        S: AssociationStore,
    {
        let Some(target) = CallbackTarget::from_headers(&headers) else {
            tracing::debug!("no external host derivable for openid callback");
            return Redirect::to("/login").into_response();
        };

        // The handshake is surrendered up front: whatever happens next,
        // this callback was its one completion attempt.
        let state = match auth_session.take_handshake().await {
            Ok(state) => state,
            Err(err) => {
                tracing::error!(%err, "could not consume handshake state");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };

        let identity = match consumer
            .complete(&params, &target.callback_url(), state)
            .await
        {
            VerificationResult::Success(identity) => identity,
            outcome => {
                tracing::debug!(?outcome, "openid callback did not verify");
                return Redirect::to("/login").into_response();
            }
        };

        // Only now, with verification done, does the application hear
        // about the identity.
        let user_id = match auth_session.backend.authenticate_identity(identity).await {
            Ok(Some(user_id)) => user_id,
            Ok(None) => return Redirect::to("/login").into_response(),
            Err(err) => {
                tracing::error!(%err, "backend could not map verified identity");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };

        if let Err(err) = auth_session.authorize(user_id).await {
            tracing::error!(%err, "could not authorize session");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }

        redirect_after_login(&mut auth_session).await
    }
}

mod post {
    use super::*;

    pub(super) async fn login<B: AuthnBackend>(
        mut auth_session: AuthSession<B>,
        Form(creds): Form<Credentials>,
    ) -> Response {
        let user_id = match auth_session.backend.authenticate(creds).await {
            Ok(Some(user_id)) => user_id,
            // Unknown credentials are a normal, silent outcome: back to
            // the login page with no detail.
            Ok(None) => return Redirect::to("/login").into_response(),
            Err(err) => {
                tracing::error!(%err, "backend could not verify credentials");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };

        if let Err(err) = auth_session.authorize(user_id).await {
            tracing::error!(%err, "could not authorize session");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }

        redirect_after_login(&mut auth_session).await
    }

    pub(super) async fn signup<B: AuthnBackend, V: Views>(
        State(views): State<V>,
        mut auth_session: AuthSession<B>,
        Form(fields): Form<HashMap<String, String>>,
    ) -> FlowResponse {
        if !auth_session.backend.signup_enabled() {
            return FlowResponse::NotHandled;
        }

        let outcome = match auth_session.backend.signup(fields).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(%err, "backend could not process signup");
                return FlowResponse::Handled(
                    StatusCode::INTERNAL_SERVER_ERROR.into_response(),
                );
            }
        };

        FlowResponse::Handled(match outcome {
            SignupOutcome::Registered(user_id) => {
                if let Err(err) = auth_session.authorize(user_id).await {
                    tracing::error!(%err, "could not authorize session");
                    return FlowResponse::Handled(
                        StatusCode::INTERNAL_SERVER_ERROR.into_response(),
                    );
                }

                redirect_after_login(&mut auth_session).await
            }
            SignupOutcome::Rejected(errors) => {
                page(&views, ViewKind::Signup, &ViewContext { errors }).await
            }
        })
    }

    pub(super) async fn openid_initiate<B, E, S>(
        State(consumer): State<Consumer<E, S>>,
        mut auth_session: AuthSession<B>,
        headers: HeaderMap,
        Form(form): Form<InitiateForm>,
    ) -> Response
    where
        B: AuthnBackend,
        E: ProtocolEngine,
        S: AssociationStore,
    {
        let Some(target) = CallbackTarget::from_headers(&headers) else {
            tracing::debug!("no external host derivable for openid initiate");
            return Redirect::to("/login").into_response();
        };

        match consumer.begin(&form.openid_identifier, &target).await {
            Ok(handshake) => {
                if let Err(err) = auth_session.put_handshake(handshake.state).await {
                    tracing::error!(%err, "could not persist handshake state");
                    return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                }

                Redirect::to(&handshake.redirect_url).into_response()
            }
            // Discovery and association failures are recoverable: the
            // visitor just gets the login page back.
            Err(err) => {
                tracing::debug!(%err, "openid initiation failed");
                Redirect::to("/login").into_response()
            }
        }
    }
}
