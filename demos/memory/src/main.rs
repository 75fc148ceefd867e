use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{routing::get, Router};
use password_auth::{generate_hash, verify_password};
use portcullis::{
    login_required, AuthFlow, AuthManagerLayer, AuthSession, AuthnBackend, Credentials,
    SignupOutcome, VerifiedIdentity,
};
use tokio::sync::RwLock;
use tower_sessions::{MemoryStore, SessionManagerLayer};

#[derive(Clone, Default)]
struct Users {
    by_login: Arc<RwLock<HashMap<String, String>>>,
}

#[async_trait]
impl AuthnBackend for Users {
    type UserId = String;
    type Error = Infallible;

    async fn authenticate(
        &self,
        creds: Credentials,
    ) -> Result<Option<Self::UserId>, Self::Error> {
        let users = self.by_login.read().await;
        Ok(users
            .get(&creds.login)
            // We're using password-based authentication: this works by
            // comparing our form input with an argon2 password hash.
            .filter(|hash| verify_password(&creds.password, hash).is_ok())
            .map(|_| creds.login.clone()))
    }

    async fn authenticate_identity(
        &self,
        identity: VerifiedIdentity,
    ) -> Result<Option<Self::UserId>, Self::Error> {
        // Auto-provision federated visitors under their identity URL.
        Ok(Some(identity.as_str().to_owned()))
    }

    fn signup_enabled(&self) -> bool {
        true
    }

    async fn signup(
        &self,
        fields: HashMap<String, String>,
    ) -> Result<SignupOutcome<Self::UserId>, Self::Error> {
        let login = fields.get("login").cloned().unwrap_or_default();
        let password = fields.get("password").cloned().unwrap_or_default();

        let mut errors = Vec::new();
        if login.is_empty() || password.is_empty() {
            errors.push("login and password are required".to_string());
        }

        let mut users = self.by_login.write().await;
        if users.contains_key(&login) {
            errors.push("login taken".to_string());
        }

        if !errors.is_empty() {
            return Ok(SignupOutcome::Rejected(errors));
        }

        users.insert(login.clone(), generate_hash(&password));
        Ok(SignupOutcome::Registered(login))
    }
}

async fn home(auth_session: AuthSession<Users>) -> String {
    format!(
        "Logged in as {}. Visit /logout to log out.",
        auth_session.user_id.unwrap_or_default()
    )
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let users = Users::default();
    users
        .by_login
        .write()
        .await
        .insert("ferris".to_string(), generate_hash("hunter42"));

    let session_layer = SessionManagerLayer::new(MemoryStore::default()).with_secure(false);
    let auth_layer = AuthManagerLayer::new(users, session_layer);

    let app = Router::new()
        .route("/", get(home))
        .route_layer(login_required!(Users))
        .merge(AuthFlow::new().router::<Users>())
        .layer(auth_layer);

    let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
