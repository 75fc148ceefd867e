//! Route-protection middleware.

/// A middleware that requires a logged-in user.
///
/// Unauthenticated requests have the path they were headed for recorded as
/// the session's return target and are redirected to the login page, so
/// the post-login redirect brings the visitor back. The login URL defaults
/// to `/login`.
///
/// ```rust,ignore
/// let app = Router::new()
///     .route("/protected", get(protected))
///     .route_layer(login_required!(Backend))
///     .merge(AuthFlow::new().router::<Backend>())
///     .layer(auth_layer);
/// ```
#[macro_export]
macro_rules! login_required {
    ($backend_type:ty) => {
        $crate::login_required!($backend_type, login_url = "/login")
    };

    ($backend_type:ty, login_url = $login_url:expr) => {{
        async fn require_login(
            mut auth_session: $crate::AuthSession<$backend_type>,
            req: ::axum::extract::Request,
            next: ::axum::middleware::Next,
        ) -> ::axum::response::Response {
            use ::axum::response::IntoResponse;

            if auth_session.user_id.is_some() {
                return next.run(req).await;
            }

            // Remember where the visitor was headed so a later login can
            // send them back.
            let wanted = req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_owned())
                .unwrap_or_else(|| req.uri().path().to_owned());
            if auth_session.set_return_to(wanted).await.is_err() {
                return ::axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }

            ::axum::response::Redirect::to($login_url).into_response()
        }

        ::axum::middleware::from_fn(require_login)
    }};
}
