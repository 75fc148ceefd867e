//! The OpenID relying-party consumer.
//!
//! [`Consumer`] drives the initiate → redirect → callback → verify
//! handshake: it resolves the visitor's claimed identifier to a provider,
//! reuses or establishes an association, sends the user agent off with a
//! bound return URL, and classifies the provider's callback into a
//! [`VerificationResult`]. Verification fails closed: a missing handshake,
//! a return-URL or endpoint mismatch, an unknown or expired association, a
//! bad signature, a replayed nonce, or a store error all yield
//! [`VerificationResult::Failure`], never success.

use std::collections::HashMap;

use http::{header, HeaderMap};
use serde::{Deserialize, Serialize};
use url::Url;

pub mod engine;
pub mod store;

pub use engine::{Assertion, Association, EngineError, ProtocolEngine, ProviderEndpoint};
pub use store::{AssociationStore, FileAssociationStore, MemoryAssociationStore, StoreError};

use crate::backend::VerifiedIdentity;

const NS: &str = "http://specs.openid.net/auth/2.0";

/// The externally visible `scheme://host` base of this deployment.
///
/// Both the realm sent at initiate and the return URL the provider must
/// echo back are derived from it, so the same derivation has to be used on
/// both legs of the handshake: if a different physical endpoint answers
/// the callback, the recorded and recomputed return URLs disagree and
/// verification fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackTarget {
    base: String,
}

impl CallbackTarget {
    /// The callback route the provider redirects back to.
    pub const CALLBACK_PATH: &'static str = "/openid/authenticate";

    /// Builds a target from an explicit `scheme://host` base.
    pub fn new(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }

    /// Derives the target from request headers.
    ///
    /// A reverse proxy's `X-Forwarded-Proto`/`X-Forwarded-Host` pair takes
    /// precedence; otherwise the `Host` header, over plain `http`, is
    /// used. `None` when no host can be derived at all, in which case the
    /// handshake cannot be bound to an endpoint and must not proceed.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let scheme = headers
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("http");

        let host = headers
            .get("x-forwarded-host")
            .or_else(|| headers.get(header::HOST))
            .and_then(|v| v.to_str().ok())?;

        Some(Self {
            base: format!("{scheme}://{host}"),
        })
    }

    /// The trust realm presented to the provider.
    pub fn realm(&self) -> &str {
        &self.base
    }

    /// The absolute URL the provider must send the visitor back to.
    pub fn callback_url(&self) -> String {
        format!("{}{}", self.base, Self::CALLBACK_PATH)
    }
}

/// Handshake state scoped to one initiate → callback round trip.
///
/// Stored whole in the session between the two legs; nothing outside this
/// module reads its fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeState {
    claimed_id: String,
    endpoint: String,
    assoc_handle: String,
    return_to: String,
}

/// A started handshake: where to send the user agent, and what to remember
/// until the provider calls back.
#[derive(Debug, Clone)]
pub struct Handshake {
    /// The provider URL to redirect the visitor to.
    pub redirect_url: String,
    /// State the caller must persist in the session for the callback leg.
    pub state: HandshakeState,
}

/// An error starting a handshake.
///
/// All of these are recoverable from the visitor's point of view; the
/// orchestrator answers them by re-showing the login page.
#[derive(Debug, thiserror::Error)]
pub enum BeginError {
    /// Discovery or association failed in the protocol engine.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The association store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Discovery produced an endpoint that is not a valid URL.
    #[error("provider endpoint is not a valid URL: {0}")]
    Endpoint(#[from] url::ParseError),

    /// The authentication request could not be encoded.
    #[error("could not encode authentication request: {0}")]
    Encode(#[from] serde_urlencoded::ser::Error),
}

/// Why a callback failed verification.
#[derive(Debug, thiserror::Error)]
pub enum VerificationFailure {
    /// No handshake was in progress in this session.
    #[error("no handshake in progress")]
    MissingHandshake,

    /// The response is not a well-formed positive assertion.
    #[error("malformed provider response")]
    Malformed,

    /// The echoed return URL does not match the one sent at initiate.
    #[error("return URL mismatch")]
    ReturnUrlMismatch,

    /// The asserting endpoint is not the one discovery produced.
    #[error("provider endpoint mismatch")]
    EndpointMismatch,

    /// No live association matches the response's handle.
    #[error("unknown or expired association")]
    UnknownAssociation,

    /// The signature did not verify.
    #[error("invalid signature")]
    BadSignature,

    /// The response nonce was already consumed.
    #[error("response nonce already used")]
    NonceReplayed,

    /// The association store failed; treated as a failure, never retried
    /// into a success.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The classified outcome of a provider callback.
#[derive(Debug)]
pub enum VerificationResult {
    /// The provider vouched for this identity and every check passed.
    Success(VerifiedIdentity),
    /// Verification failed; the visitor is sent back to the login page.
    Failure(VerificationFailure),
    /// The visitor cancelled at the provider.
    Cancelled,
    /// The provider needs the visitor to complete setup first.
    SetupNeeded,
}

// The authentication request embedded into the provider redirect, in wire
// order. `identifier_select` is not used: discovery has already resolved
// the identifier by the time this is built.
#[derive(Serialize)]
struct AuthenticationRequest<'a> {
    #[serde(rename = "openid.ns")]
    ns: &'static str,
    #[serde(rename = "openid.mode")]
    mode: &'static str,
    #[serde(rename = "openid.identity")]
    identity: &'a str,
    #[serde(rename = "openid.claimed_id")]
    claimed_id: &'a str,
    #[serde(rename = "openid.assoc_handle")]
    assoc_handle: &'a str,
    #[serde(rename = "openid.return_to")]
    return_to: &'a str,
    #[serde(rename = "openid.realm")]
    realm: &'a str,
}

/// The relying-party consumer.
///
/// Generic over the protocol engine (discovery, association, signature
/// verification) and the association/nonce store. Clones share the
/// underlying store.
#[derive(Debug, Clone)]
pub struct Consumer<E, S> {
    engine: E,
    store: S,
}

impl<E, S> Consumer<E, S>
where
    E: ProtocolEngine,
    S: AssociationStore,
{
    /// Creates a consumer from an engine and a store.
    pub fn new(engine: E, store: S) -> Self {
        Self { engine, store }
    }

    /// Starts a handshake for a claimed identifier.
    ///
    /// The identifier is untrusted visitor input; it goes straight to the
    /// engine's discovery. A live association for the discovered endpoint
    /// is reused when the store has one, otherwise a fresh association is
    /// negotiated and persisted. The returned state must be stashed in
    /// the session and surrendered to [`complete`](Consumer::complete)
    /// when the provider calls back.
    pub async fn begin(
        &self,
        claimed_id: &str,
        target: &CallbackTarget,
    ) -> Result<Handshake, BeginError> {
        let endpoint = self.engine.discover(claimed_id).await?;

        let association = match self.store.load_association(&endpoint.url).await? {
            Some(association) => association,
            None => {
                let association = self.engine.associate(&endpoint).await?;
                self.store
                    .save_association(&endpoint.url, &association)
                    .await?;
                association
            }
        };

        let identity = endpoint.local_id.as_deref().unwrap_or(claimed_id);
        let return_to = target.callback_url();
        let request = AuthenticationRequest {
            ns: NS,
            mode: "checkid_setup",
            identity,
            claimed_id,
            assoc_handle: &association.handle,
            return_to: &return_to,
            realm: target.realm(),
        };

        let query = serde_urlencoded::to_string(&request)?;
        let mut url = Url::parse(&endpoint.url)?;
        let query = match url.query() {
            Some(existing) if !existing.is_empty() => format!("{existing}&{query}"),
            _ => query,
        };
        url.set_query(Some(&query));

        tracing::debug!(endpoint = %endpoint.url, "openid handshake started");

        Ok(Handshake {
            redirect_url: url.into(),
            state: HandshakeState {
                claimed_id: claimed_id.to_owned(),
                endpoint: endpoint.url,
                assoc_handle: association.handle,
                return_to,
            },
        })
    }

    /// Classifies and verifies a provider callback.
    ///
    /// `params` is the full callback query; `return_to` is the expected
    /// return URL derived from the *current* request; `state` is the
    /// handshake recorded at initiate, surrendered by the session (a
    /// handshake gets exactly one completion attempt).
    pub async fn complete(
        &self,
        params: &HashMap<String, String>,
        return_to: &str,
        state: Option<HandshakeState>,
    ) -> VerificationResult {
        match params.get("openid.mode").map(String::as_str) {
            Some("cancel") => VerificationResult::Cancelled,
            Some("setup_needed") => VerificationResult::SetupNeeded,
            // OpenID 1.1 immediate-mode "go set up first" answer.
            Some("id_res") if params.contains_key("openid.user_setup_url") => {
                VerificationResult::SetupNeeded
            }
            Some("id_res") => match self.verify(params, return_to, state).await {
                Ok(identity) => VerificationResult::Success(identity),
                Err(failure) => {
                    tracing::debug!(%failure, "openid verification failed");
                    VerificationResult::Failure(failure)
                }
            },
            _ => VerificationResult::Failure(VerificationFailure::Malformed),
        }
    }

    async fn verify(
        &self,
        params: &HashMap<String, String>,
        return_to: &str,
        state: Option<HandshakeState>,
    ) -> Result<VerifiedIdentity, VerificationFailure> {
        let state = state.ok_or(VerificationFailure::MissingHandshake)?;
        let assertion =
            Assertion::from_params(params).ok_or(VerificationFailure::Malformed)?;

        // The URL the provider echoes, the one recorded at initiate, and
        // the one this request derives must agree byte for byte. A host
        // that drifted between the two legs fails here.
        if assertion.return_to != return_to || state.return_to != return_to {
            return Err(VerificationFailure::ReturnUrlMismatch);
        }

        if let Some(op_endpoint) = &assertion.op_endpoint {
            if *op_endpoint != state.endpoint {
                return Err(VerificationFailure::EndpointMismatch);
            }
        }

        if assertion.assoc_handle != state.assoc_handle {
            return Err(VerificationFailure::UnknownAssociation);
        }

        let association = self
            .store
            .load_association(&state.endpoint)
            .await?
            .filter(|association| association.handle == assertion.assoc_handle)
            .ok_or(VerificationFailure::UnknownAssociation)?;

        self.engine
            .verify_signature(&assertion, &association)
            .map_err(|_| VerificationFailure::BadSignature)?;

        if !self
            .store
            .claim_nonce(&state.endpoint, &assertion.response_nonce)
            .await?
        {
            return Err(VerificationFailure::NonceReplayed);
        }

        let identity = assertion
            .claimed_id
            .or(assertion.identity)
            .ok_or(VerificationFailure::Malformed)?;

        Ok(VerifiedIdentity::new(identity))
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::engine::unix_now;
    use super::*;

    const ENDPOINT: &str = "https://op.test/auth";

    #[derive(Debug, Clone)]
    struct StubEngine;

    #[async_trait]
    impl ProtocolEngine for StubEngine {
        async fn discover(&self, claimed_id: &str) -> Result<ProviderEndpoint, EngineError> {
            if claimed_id.is_empty() || claimed_id.contains("unreachable") {
                return Err(EngineError::Discovery("no such identifier".into()));
            }
            Ok(ProviderEndpoint {
                url: ENDPOINT.into(),
                local_id: None,
            })
        }

        async fn associate(
            &self,
            _endpoint: &ProviderEndpoint,
        ) -> Result<Association, EngineError> {
            Ok(Association {
                handle: "hs1".into(),
                secret: b"mac key".to_vec(),
                assoc_type: "HMAC-SHA256".into(),
                expires_at: unix_now() + 3600,
            })
        }

        fn verify_signature(
            &self,
            assertion: &Assertion,
            _association: &Association,
        ) -> Result<(), EngineError> {
            if assertion.sig() == "good" {
                Ok(())
            } else {
                Err(EngineError::Signature)
            }
        }
    }

    fn consumer() -> Consumer<StubEngine, MemoryAssociationStore> {
        Consumer::new(StubEngine, MemoryAssociationStore::new())
    }

    fn target() -> CallbackTarget {
        CallbackTarget::new("http://app.test")
    }

    fn callback_params(nonce: &str, sig: &str) -> HashMap<String, String> {
        [
            ("openid.ns", NS),
            ("openid.mode", "id_res"),
            ("openid.claimed_id", "https://id.example/alice"),
            ("openid.identity", "https://id.example/alice"),
            ("openid.op_endpoint", ENDPOINT),
            ("openid.return_to", "http://app.test/openid/authenticate"),
            ("openid.assoc_handle", "hs1"),
            ("openid.response_nonce", nonce),
            ("openid.signed", "op_endpoint,claimed_id,identity,return_to,response_nonce,assoc_handle"),
            ("openid.sig", sig),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[tokio::test]
    async fn begin_builds_a_bound_redirect() {
        let consumer = consumer();
        let handshake = consumer
            .begin("https://id.example/alice", &target())
            .await
            .unwrap();

        assert!(handshake.redirect_url.starts_with(ENDPOINT));
        assert!(handshake.redirect_url.contains("openid.mode=checkid_setup"));
        assert!(handshake
            .redirect_url
            .contains("openid.assoc_handle=hs1"));
        assert!(handshake.redirect_url.contains(
            "openid.return_to=http%3A%2F%2Fapp.test%2Fopenid%2Fauthenticate"
        ));
    }

    #[tokio::test]
    async fn begin_propagates_discovery_failure() {
        let err = consumer()
            .begin("https://unreachable.example/", &target())
            .await
            .unwrap_err();
        assert!(matches!(err, BeginError::Engine(EngineError::Discovery(_))));
    }

    #[tokio::test]
    async fn complete_accepts_a_valid_assertion() {
        let consumer = consumer();
        let handshake = consumer
            .begin("https://id.example/alice", &target())
            .await
            .unwrap();

        let result = consumer
            .complete(
                &callback_params("2026-08-07T00:00:00Zn1", "good"),
                &target().callback_url(),
                Some(handshake.state),
            )
            .await;

        match result {
            VerificationResult::Success(identity) => {
                assert_eq!(identity.as_str(), "https://id.example/alice");
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn replayed_nonce_is_rejected_even_after_a_success() {
        let consumer = consumer();
        let params = callback_params("2026-08-07T00:00:00Zn1", "good");

        let first = consumer
            .begin("https://id.example/alice", &target())
            .await
            .unwrap();
        let result = consumer
            .complete(&params, &target().callback_url(), Some(first.state))
            .await;
        assert!(matches!(result, VerificationResult::Success(_)));

        // A second handshake delivering the same response must fail.
        let second = consumer
            .begin("https://id.example/alice", &target())
            .await
            .unwrap();
        let result = consumer
            .complete(&params, &target().callback_url(), Some(second.state))
            .await;
        assert!(matches!(
            result,
            VerificationResult::Failure(VerificationFailure::NonceReplayed)
        ));
    }

    #[tokio::test]
    async fn return_url_mismatch_is_a_failure() {
        let consumer = consumer();
        let handshake = consumer
            .begin("https://id.example/alice", &target())
            .await
            .unwrap();

        // The callback arrived at a different externally visible host.
        let elsewhere = CallbackTarget::new("http://evil.test");
        let result = consumer
            .complete(
                &callback_params("2026-08-07T00:00:00Zn2", "good"),
                &elsewhere.callback_url(),
                Some(handshake.state),
            )
            .await;
        assert!(matches!(
            result,
            VerificationResult::Failure(VerificationFailure::ReturnUrlMismatch)
        ));
    }

    #[tokio::test]
    async fn missing_handshake_is_a_failure() {
        let result = consumer()
            .complete(
                &callback_params("2026-08-07T00:00:00Zn3", "good"),
                &target().callback_url(),
                None,
            )
            .await;
        assert!(matches!(
            result,
            VerificationResult::Failure(VerificationFailure::MissingHandshake)
        ));
    }

    #[tokio::test]
    async fn bad_signature_is_a_failure_and_keeps_the_nonce_unclaimed() {
        let consumer = consumer();
        let handshake = consumer
            .begin("https://id.example/alice", &target())
            .await
            .unwrap();

        let result = consumer
            .complete(
                &callback_params("2026-08-07T00:00:00Zn4", "forged"),
                &target().callback_url(),
                Some(handshake.state.clone()),
            )
            .await;
        assert!(matches!(
            result,
            VerificationResult::Failure(VerificationFailure::BadSignature)
        ));

        // The forged response must not have burned the nonce.
        let result = consumer
            .complete(
                &callback_params("2026-08-07T00:00:00Zn4", "good"),
                &target().callback_url(),
                Some(handshake.state),
            )
            .await;
        assert!(matches!(result, VerificationResult::Success(_)));
    }

    #[tokio::test]
    async fn unknown_association_is_a_failure() {
        let consumer = consumer();
        let mut handshake = consumer
            .begin("https://id.example/alice", &target())
            .await
            .unwrap();
        handshake.state.assoc_handle = "hs-forgotten".into();

        let result = consumer
            .complete(
                &callback_params("2026-08-07T00:00:00Zn5", "good"),
                &target().callback_url(),
                Some(handshake.state),
            )
            .await;
        assert!(matches!(
            result,
            VerificationResult::Failure(VerificationFailure::UnknownAssociation)
        ));
    }

    #[tokio::test]
    async fn cancel_and_setup_needed_are_classified() {
        let consumer = consumer();
        let mode = |mode: &str| {
            [("openid.mode".to_string(), mode.to_string())]
                .into_iter()
                .collect::<HashMap<_, _>>()
        };

        assert!(matches!(
            consumer
                .complete(&mode("cancel"), &target().callback_url(), None)
                .await,
            VerificationResult::Cancelled
        ));
        assert!(matches!(
            consumer
                .complete(&mode("setup_needed"), &target().callback_url(), None)
                .await,
            VerificationResult::SetupNeeded
        ));
        assert!(matches!(
            consumer
                .complete(&mode("error"), &target().callback_url(), None)
                .await,
            VerificationResult::Failure(VerificationFailure::Malformed)
        ));
    }

    #[test]
    fn callback_target_prefers_forwarded_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "internal:8080".parse().unwrap());
        assert_eq!(
            CallbackTarget::from_headers(&headers),
            Some(CallbackTarget::new("http://internal:8080"))
        );

        headers.insert("x-forwarded-host", "app.example.com".parse().unwrap());
        headers.insert("x-forwarded-proto", "https".parse().unwrap());
        assert_eq!(
            CallbackTarget::from_headers(&headers),
            Some(CallbackTarget::new("https://app.example.com"))
        );

        assert_eq!(CallbackTarget::from_headers(&HeaderMap::new()), None);
    }
}
