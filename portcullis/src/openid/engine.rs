//! The boundary to the OpenID protocol library.
//!
//! Discovery, association establishment, and signature verification are
//! deliberately outside this crate: they involve provider round trips and
//! cryptography that belong to a dedicated protocol implementation. The
//! [`ProtocolEngine`] trait is the narrow surface the relying-party
//! consumer calls through; everything on the near side of it (return-URL
//! binding, association bookkeeping, nonce claiming, result
//! classification) is handled by [`Consumer`](super::Consumer).

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// An error from the underlying protocol implementation.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The claimed identifier could not be resolved to a provider.
    #[error("discovery failed: {0}")]
    Discovery(String),

    /// The association handshake with the provider failed.
    #[error("association failed: {0}")]
    Association(String),

    /// The assertion's signature did not verify.
    #[error("invalid signature")]
    Signature,
}

/// A provider endpoint produced by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEndpoint {
    /// The provider's authentication endpoint URL.
    pub url: String,
    /// The identifier local to this provider, when discovery yielded one
    /// distinct from the claimed identifier.
    pub local_id: Option<String>,
}

/// A shared-secret association with a provider.
///
/// Associations let signed responses be verified without a per-request
/// round trip to the provider. They are persisted in an
/// [`AssociationStore`](super::store::AssociationStore) keyed by endpoint
/// and reused until they expire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Association {
    /// The handle the provider assigned to this association.
    pub handle: String,
    /// The shared MAC key.
    pub secret: Vec<u8>,
    /// The negotiated association type, e.g. `HMAC-SHA256`.
    pub assoc_type: String,
    /// Expiry as seconds since the Unix epoch.
    pub expires_at: u64,
}

impl Association {
    /// Whether this association is past its provider-assigned lifetime.
    pub fn is_expired(&self) -> bool {
        self.expires_at <= unix_now()
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A positive assertion parsed out of the provider's callback parameters.
///
/// The consumer validates structure and binding before an engine ever sees
/// one of these; the engine's only job is the cryptographic check of
/// [`sig`](Assertion::sig) over [`signed_fields`](Assertion::signed_fields).
#[derive(Debug, Clone)]
pub struct Assertion {
    pub(crate) identity: Option<String>,
    pub(crate) claimed_id: Option<String>,
    pub(crate) return_to: String,
    pub(crate) op_endpoint: Option<String>,
    pub(crate) response_nonce: String,
    pub(crate) assoc_handle: String,
    pub(crate) signed: String,
    pub(crate) sig: String,
    fields: HashMap<String, String>,
}

impl Assertion {
    /// Parse an `id_res` response out of the raw callback parameters.
    ///
    /// `None` when a field every positive assertion must carry is absent.
    pub(crate) fn from_params(params: &HashMap<String, String>) -> Option<Self> {
        let field = |name: &str| params.get(name).cloned();

        Some(Self {
            identity: field("openid.identity"),
            claimed_id: field("openid.claimed_id"),
            return_to: field("openid.return_to")?,
            op_endpoint: field("openid.op_endpoint"),
            response_nonce: field("openid.response_nonce")?,
            assoc_handle: field("openid.assoc_handle")?,
            signed: field("openid.signed")?,
            sig: field("openid.sig")?,
            fields: params.clone(),
        })
    }

    /// The base64 signature the provider supplied.
    pub fn sig(&self) -> &str {
        &self.sig
    }

    /// The response nonce, unique per positive assertion.
    pub fn response_nonce(&self) -> &str {
        &self.response_nonce
    }

    /// The association handle the provider signed with.
    pub fn assoc_handle(&self) -> &str {
        &self.assoc_handle
    }

    /// The signed fields in signature order, as `(name, value)` pairs.
    ///
    /// Names come from `openid.signed` and are resolved against the raw
    /// parameter map with their `openid.` prefix restored, which is the
    /// key-value form the signature base string is built from. A name
    /// listed as signed but missing from the response yields an empty
    /// value; engines should treat that as a verification failure.
    pub fn signed_fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.signed.split(',').map(|name| {
            let value = self
                .fields
                .get(&format!("openid.{name}"))
                .map(String::as_str)
                .unwrap_or("");
            (name, value)
        })
    }
}

/// The OpenID protocol operations this crate delegates.
///
/// Implementations wrap a real protocol library (or, in tests, a stub).
/// Inputs to [`discover`](ProtocolEngine::discover) are untrusted visitor
/// strings; the engine owns whatever normalization and fetching discovery
/// requires.
#[async_trait]
pub trait ProtocolEngine: Clone + Send + Sync + 'static {
    /// Resolve a claimed identifier to its provider endpoint.
    async fn discover(&self, claimed_id: &str) -> Result<ProviderEndpoint, EngineError>;

    /// Establish a fresh association with the provider.
    async fn associate(&self, endpoint: &ProviderEndpoint) -> Result<Association, EngineError>;

    /// Verify the assertion's signature against an association.
    fn verify_signature(
        &self,
        assertion: &Assertion,
        association: &Association,
    ) -> Result<(), EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn assertion_requires_mandatory_fields() {
        let mut p = params(&[
            ("openid.return_to", "http://app.test/openid/authenticate"),
            ("openid.response_nonce", "2026-08-07T00:00:00Zabc"),
            ("openid.assoc_handle", "hs1"),
            ("openid.signed", "return_to,response_nonce,assoc_handle"),
            ("openid.sig", "c2ln"),
        ]);
        assert!(Assertion::from_params(&p).is_some());

        p.remove("openid.response_nonce");
        assert!(Assertion::from_params(&p).is_none());
    }

    #[test]
    fn signed_fields_resolve_in_signature_order() {
        let p = params(&[
            ("openid.return_to", "http://app.test/openid/authenticate"),
            ("openid.response_nonce", "n"),
            ("openid.assoc_handle", "hs1"),
            ("openid.identity", "https://id.example/alice"),
            ("openid.signed", "identity,return_to,missing"),
            ("openid.sig", "c2ln"),
        ]);
        let assertion = Assertion::from_params(&p).unwrap();
        let fields: Vec<_> = assertion.signed_fields().collect();
        assert_eq!(
            fields,
            vec![
                ("identity", "https://id.example/alice"),
                ("return_to", "http://app.test/openid/authenticate"),
                ("missing", ""),
            ]
        );
    }

    #[test]
    fn expired_association_reports_itself() {
        let assoc = Association {
            handle: "hs1".into(),
            secret: vec![1, 2, 3],
            assoc_type: "HMAC-SHA256".into(),
            expires_at: 0,
        };
        assert!(assoc.is_expired());

        let assoc = Association {
            expires_at: unix_now() + 3600,
            ..assoc
        };
        assert!(!assoc.is_expired());
    }
}
