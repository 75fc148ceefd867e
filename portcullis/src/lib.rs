//! Session-based login flows for Axum.
//!
//! This crate sits in front of an application and decides, per request,
//! whether the visitor carries an authenticated session; when they don't,
//! it drives one of two login paths:
//!
//! 1. Local credentials, checked by an application-supplied backend,
//! 2. Federated identity via the OpenID relying-party handshake.
//!
//! It is middleware, not a framework: the host application owns routing,
//! rendering, and credential storage. The crate contributes a `tower`
//! layer that attaches an [`AuthSession`] to every request, mountable
//! routers for the login/signup/OpenID operations, and minimal built-in
//! pages used only until the host registers custom views.
//!
//! # Backends
//!
//! Applications plug in by implementing [`AuthnBackend`]: map submitted
//! credentials (or a provider-verified identity URL) to an opaque user
//! identifier, and optionally opt into self-signup. A backend returning
//! `Ok(None)` rejects an attempt silently — the visitor is simply shown
//! the login page again, with no detail about what failed.
//!
//! # Sessions
//!
//! Session state rides on [`tower_sessions`]; the host builds the session
//! layer (choosing the store and, typically, a signing key for the
//! cookie) and hands it to [`AuthManagerLayer`]. The middleware keeps
//! three things in the session: the current user, an optional return
//! path consumed by the next successful login, and in-flight OpenID
//! handshake state. Logging out clears only the current user.
//!
//! # OpenID
//!
//! The relying-party consumer drives initiate → redirect → callback →
//! verify. Discovery, association negotiation, and signature checking
//! belong to a protocol engine behind [`openid::ProtocolEngine`];
//! associations and consumed nonces persist in an
//! [`openid::AssociationStore`] (in-memory and filesystem stores are
//! provided). Replayed callbacks and return-URL tampering fail closed and
//! land the visitor back on the login page.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::{collections::HashMap, sync::Arc};
//!
//! use async_trait::async_trait;
//! use axum::{response::IntoResponse, routing::get, Router};
//! use portcullis::{
//!     login_required, AuthFlow, AuthManagerLayer, AuthSession, AuthnBackend, Credentials,
//!     VerifiedIdentity,
//! };
//! use tokio::sync::RwLock;
//! use tower_sessions::{MemoryStore, SessionManagerLayer};
//!
//! #[derive(Clone, Default)]
//! struct Users {
//!     by_login: Arc<RwLock<HashMap<String, String>>>,
//! }
//!
//! #[derive(Debug, thiserror::Error)]
//! #[error("user storage failed")]
//! struct StorageError;
//!
//! #[async_trait]
//! impl AuthnBackend for Users {
//!     type UserId = String;
//!     type Error = StorageError;
//!
//!     async fn authenticate(
//!         &self,
//!         creds: Credentials,
//!     ) -> Result<Option<Self::UserId>, Self::Error> {
//!         let users = self.by_login.read().await;
//!         Ok(users
//!             .get(&creds.login)
//!             .filter(|password| **password == creds.password)
//!             .map(|_| creds.login.clone()))
//!     }
//!
//!     async fn authenticate_identity(
//!         &self,
//!         identity: VerifiedIdentity,
//!     ) -> Result<Option<Self::UserId>, Self::Error> {
//!         // Auto-provision an account keyed by the identity URL.
//!         Ok(Some(identity.as_str().to_owned()))
//!     }
//! }
//!
//! async fn protected(auth_session: AuthSession<Users>) -> impl IntoResponse {
//!     format!("hello, {}", auth_session.user_id.unwrap_or_default())
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let session_layer = SessionManagerLayer::new(MemoryStore::default());
//!     let auth_layer = AuthManagerLayer::new(Users::default(), session_layer);
//!
//!     let app = Router::new()
//!         .route("/", get(protected))
//!         .route_layer(login_required!(Users))
//!         .merge(AuthFlow::new().router::<Users>())
//!         .layer(auth_layer);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

#![warn(
    clippy::all,
    nonstandard_style,
    future_incompatible,
    missing_debug_implementations,
    missing_docs
)]
#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod openid;

mod backend;
mod extract;
mod flow;
mod middleware;
mod service;
mod session;
mod views;

pub use backend::{AuthnBackend, Credentials, SignupOutcome, VerifiedIdentity};
pub use flow::{AuthFlow, FlowResponse, OpenIdFlow};
pub use service::{AuthManager, AuthManagerLayer};
pub use session::{AuthSession, Error};
pub use tower_sessions;
pub use views::{
    BuiltinViews, DirectoryViews, ViewContext, ViewError, ViewKind, Views, ERRORS_MARKER,
};
