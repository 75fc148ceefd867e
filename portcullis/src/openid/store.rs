//! Durable storage for associations and consumed nonces.

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use tokio::sync::Mutex;

use super::engine::Association;

/// An error from the association store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing storage failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A stored entry could not be decoded.
    #[error("corrupt store entry: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Storage the OpenID handshake relies on: associations keyed by provider
/// endpoint, and a consumed-nonce record for replay protection.
///
/// `claim_nonce` is the one place a check-then-act race would be a
/// security bug rather than a correctness nicety, so it is a single
/// atomic primitive: for a given `(endpoint, nonce)` pair it
/// returns `Ok(true)` at most once, store-wide, no matter how many
/// callbacks race on it. Callers treat `Ok(false)` and `Err(_)` alike as
/// verification failure.
#[async_trait]
pub trait AssociationStore: Clone + Send + Sync + 'static {
    /// Load the current association for an endpoint, if any.
    ///
    /// Implementations may drop expired associations here rather than
    /// return them.
    async fn load_association(&self, endpoint: &str)
        -> Result<Option<Association>, StoreError>;

    /// Persist an association for an endpoint, replacing any previous one.
    async fn save_association(
        &self,
        endpoint: &str,
        association: &Association,
    ) -> Result<(), StoreError>;

    /// Atomically claim a response nonce.
    async fn claim_nonce(&self, endpoint: &str, nonce: &str) -> Result<bool, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    associations: HashMap<String, Association>,
    nonces: HashSet<(String, String)>,
}

/// An ephemeral store, useful for testing and demonstration purposes.
///
/// Clones share state. A single lock covers both maps, which makes the
/// nonce claim trivially atomic.
#[derive(Debug, Clone, Default)]
pub struct MemoryAssociationStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryAssociationStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AssociationStore for MemoryAssociationStore {
    async fn load_association(
        &self,
        endpoint: &str,
    ) -> Result<Option<Association>, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.associations.get(endpoint) {
            Some(assoc) if assoc.is_expired() => {
                inner.associations.remove(endpoint);
                Ok(None)
            }
            other => Ok(other.cloned()),
        }
    }

    async fn save_association(
        &self,
        endpoint: &str,
        association: &Association,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .associations
            .insert(endpoint.to_owned(), association.clone());
        Ok(())
    }

    async fn claim_nonce(&self, endpoint: &str, nonce: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.nonces.insert((endpoint.to_owned(), nonce.to_owned())))
    }
}

/// A filesystem-backed store rooted at a directory, `.openid` by
/// convention.
///
/// Associations live as JSON files written via temp-file-and-rename; a
/// consumed nonce is recorded by creating a file with `create_new`, whose
/// create-if-absent exclusivity makes the claim atomic on a local
/// filesystem. Keys are base64-encoded so arbitrary endpoint URLs map to
/// safe file names.
#[derive(Debug, Clone)]
pub struct FileAssociationStore {
    root: PathBuf,
}

impl FileAssociationStore {
    /// Creates a store rooted at `root`. Directories are created lazily on
    /// first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn association_path(&self, endpoint: &str) -> PathBuf {
        self.root
            .join("associations")
            .join(format!("{}.json", URL_SAFE_NO_PAD.encode(endpoint)))
    }

    fn nonce_path(&self, endpoint: &str, nonce: &str) -> PathBuf {
        let key = format!("{endpoint}\n{nonce}");
        self.root.join("nonces").join(URL_SAFE_NO_PAD.encode(key))
    }

    /// Evict nonce records older than `max_age`.
    ///
    /// Replay protection only needs a nonce held for as long as the
    /// provider's clock-skew window, so hosts can run this periodically to
    /// keep abandoned-handshake debris from accumulating. Associations
    /// need no sweep: they are dropped on load once expired.
    pub async fn purge_nonces_older_than(&self, max_age: Duration) -> Result<(), StoreError> {
        let dir = self.root.join("nonces");
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let Ok(modified) = entry.metadata().await.and_then(|m| m.modified()) else {
                continue;
            };
            if modified.elapsed().map(|age| age > max_age).unwrap_or(false) {
                // A concurrent purge may have won the race; that's fine.
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }

        Ok(())
    }

    async fn ensure_dir(path: &Path) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl AssociationStore for FileAssociationStore {
    async fn load_association(
        &self,
        endpoint: &str,
    ) -> Result<Option<Association>, StoreError> {
        let path = self.association_path(endpoint);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let association: Association = serde_json::from_slice(&bytes)?;
        if association.is_expired() {
            let _ = tokio::fs::remove_file(&path).await;
            return Ok(None);
        }

        Ok(Some(association))
    }

    async fn save_association(
        &self,
        endpoint: &str,
        association: &Association,
    ) -> Result<(), StoreError> {
        let path = self.association_path(endpoint);
        Self::ensure_dir(&path).await?;

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(association)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn claim_nonce(&self, endpoint: &str, nonce: &str) -> Result<bool, StoreError> {
        let path = self.nonce_path(endpoint, nonce);
        Self::ensure_dir(&path).await?;

        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openid::engine::unix_now;

    fn association(handle: &str, expires_at: u64) -> Association {
        Association {
            handle: handle.into(),
            secret: b"mac key".to_vec(),
            assoc_type: "HMAC-SHA256".into(),
            expires_at,
        }
    }

    #[tokio::test]
    async fn memory_store_claims_each_nonce_once() {
        let store = MemoryAssociationStore::new();

        assert!(store.claim_nonce("https://op.test", "n1").await.unwrap());
        assert!(!store.claim_nonce("https://op.test", "n1").await.unwrap());

        // Same nonce at a different endpoint is a different claim.
        assert!(store.claim_nonce("https://other.test", "n1").await.unwrap());
    }

    #[tokio::test]
    async fn memory_store_drops_expired_associations() {
        let store = MemoryAssociationStore::new();
        store
            .save_association("https://op.test", &association("hs1", 0))
            .await
            .unwrap();

        assert!(store
            .load_association("https://op.test")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn file_store_round_trips_associations() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileAssociationStore::new(dir.path());

        let assoc = association("hs1", unix_now() + 3600);
        store
            .save_association("https://op.test/endpoint?x=1", &assoc)
            .await
            .unwrap();

        let loaded = store
            .load_association("https://op.test/endpoint?x=1")
            .await
            .unwrap()
            .expect("association should round-trip");
        assert_eq!(loaded.handle, "hs1");
        assert_eq!(loaded.secret, assoc.secret);

        assert!(store
            .load_association("https://elsewhere.test")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn file_store_ignores_expired_associations() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileAssociationStore::new(dir.path());

        store
            .save_association("https://op.test", &association("hs1", 0))
            .await
            .unwrap();
        assert!(store
            .load_association("https://op.test")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn file_store_nonce_claim_is_exclusive_across_clones() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileAssociationStore::new(dir.path());
        let clone = store.clone();

        assert!(store.claim_nonce("https://op.test", "n1").await.unwrap());
        assert!(!clone.claim_nonce("https://op.test", "n1").await.unwrap());
        assert!(clone.claim_nonce("https://op.test", "n2").await.unwrap());
    }

    #[tokio::test]
    async fn purge_drops_old_nonces_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileAssociationStore::new(dir.path());

        assert!(store.claim_nonce("https://op.test", "n1").await.unwrap());

        // Nothing is old enough to purge yet, so the claim must hold.
        store
            .purge_nonces_older_than(Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(!store.claim_nonce("https://op.test", "n1").await.unwrap());

        // With a zero horizon the record goes away and the nonce can be
        // claimed again. The sleep keeps the file's age measurably
        // positive on coarse-grained filesystems.
        std::thread::sleep(Duration::from_millis(20));
        store
            .purge_nonces_older_than(Duration::ZERO)
            .await
            .unwrap();
        assert!(store.claim_nonce("https://op.test", "n1").await.unwrap());
    }
}
