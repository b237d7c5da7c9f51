//! Long-term and session key storage, addressed by role name.
//!
//! Symmetric keys are stored under an ordered `(owner, peer)` pair: the same
//! secret shared by two roles lives under `(a, b)` on one side and `(b, a)`
//! on the other.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rand::Rng;
use scopeguard::ScopeGuard;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, RwLock};

use crate::crypto::{CryptoError, KeyPair, PrivateKey, PublicKey, SymmetricKey};

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("no symmetric key for ({owner}, {peer})")]
    NotFound { owner: String, peer: String },
    #[error("no key pair for role `{0}`")]
    NoKeyPair(String),
    #[error("no public key labelled `{0}`")]
    NoPublicKey(String),
    #[error("role name `{0}` is not usable as a key name")]
    InvalidName(String),
    #[error("stored key `{name}` is unreadable: {source}")]
    Encoding {
        name: String,
        #[source]
        source: CryptoError,
    },
    #[error("key store i/o on `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait KeyStore: Send + Sync + 'static {
    async fn key_pair(&self, role: &str) -> Result<KeyPair, KeyError>;
    async fn put_key_pair(&self, role: &str, pair: &KeyPair) -> Result<(), KeyError>;
    async fn symmetric_key(&self, owner: &str, peer: &str) -> Result<SymmetricKey, KeyError>;
    async fn put_symmetric_key(&self, owner: &str, peer: &str, key: &SymmetricKey) -> Result<(), KeyError>;
    async fn public_key(&self, label: &str) -> Result<PublicKey, KeyError>;
    async fn put_public_key(&self, label: &str, key: &PublicKey) -> Result<(), KeyError>;
}

/// Label under which a peer's public key is kept after a bootstrap offer.
pub fn received_label(peer: &str) -> String {
    format!("{peer}Received")
}

fn check_name(name: &str) -> Result<(), KeyError> {
    let usable = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        && name != "."
        && name != "..";
    if usable {
        Ok(())
    } else {
        Err(KeyError::InvalidName(name.to_string()))
    }
}

/// Process-local store, used by tests and single-process deployments.
#[derive(Default)]
pub struct MemoryKeyStore {
    pairs: RwLock<HashMap<String, KeyPair>>,
    symmetric: RwLock<HashMap<(String, String), SymmetricKey>>,
    public: RwLock<HashMap<String, PublicKey>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn key_pair(&self, role: &str) -> Result<KeyPair, KeyError> {
        self.pairs
            .read()
            .await
            .get(role)
            .cloned()
            .ok_or_else(|| KeyError::NoKeyPair(role.to_string()))
    }

    async fn put_key_pair(&self, role: &str, pair: &KeyPair) -> Result<(), KeyError> {
        check_name(role)?;
        self.pairs.write().await.insert(role.to_string(), pair.clone());
        Ok(())
    }

    async fn symmetric_key(&self, owner: &str, peer: &str) -> Result<SymmetricKey, KeyError> {
        self.symmetric
            .read()
            .await
            .get(&(owner.to_string(), peer.to_string()))
            .cloned()
            .ok_or_else(|| KeyError::NotFound { owner: owner.to_string(), peer: peer.to_string() })
    }

    async fn put_symmetric_key(&self, owner: &str, peer: &str, key: &SymmetricKey) -> Result<(), KeyError> {
        check_name(owner)?;
        check_name(peer)?;
        self.symmetric
            .write()
            .await
            .insert((owner.to_string(), peer.to_string()), key.clone());
        Ok(())
    }

    async fn public_key(&self, label: &str) -> Result<PublicKey, KeyError> {
        self.public
            .read()
            .await
            .get(label)
            .copied()
            .ok_or_else(|| KeyError::NoPublicKey(label.to_string()))
    }

    async fn put_public_key(&self, label: &str, key: &PublicKey) -> Result<(), KeyError> {
        check_name(label)?;
        self.public.write().await.insert(label.to_string(), *key);
        Ok(())
    }
}

/// One Base64 file per key inside a directory.
///
/// Writes go to a temporary sibling and are renamed into place, under a lock
/// per file name, so two writers to the same pair never interleave.
pub struct FileKeyStore {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl FileKeyStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, KeyError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| KeyError::Io { path: dir.clone(), source })?;
        Ok(Self { dir, locks: Mutex::new(HashMap::new()) })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn symmetric_name(owner: &str, peer: &str) -> String {
        format!("Symmetric-{owner}-{peer}.key")
    }

    fn public_name(label: &str) -> String {
        format!("public{label}.key")
    }

    fn private_name(role: &str) -> String {
        format!("private{role}.key")
    }

    fn locks(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
        match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Lock for `name`, dropped from the map again by the last holder.
    fn lock_for<'a>(&'a self, name: &'a str) -> ScopeGuard<Arc<AsyncMutex<()>>, impl FnOnce(Arc<AsyncMutex<()>>) + 'a> {
        let lock = self.locks().entry(name.to_string()).or_default().clone();
        scopeguard::guard(lock, move |lock| self.release(name, lock))
    }

    fn release(&self, name: &str, lock: Arc<AsyncMutex<()>>) {
        let mut locks = self.locks();
        // One reference in the map, one here.
        let last = Arc::strong_count(&lock) == 2;
        drop(lock);
        if last {
            locks.remove(name);
        }
    }

    async fn read(&self, name: &str) -> Result<Option<String>, KeyError> {
        let path = self.dir.join(name);
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(KeyError::Io { path, source }),
        }
    }

    async fn write(&self, name: &str, contents: &str) -> Result<(), KeyError> {
        let path = self.dir.join(name);
        let tmp = self
            .dir
            .join(format!(".{name}.{:08x}.tmp", rand::thread_rng().gen::<u32>()));
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        let tmp_guard = scopeguard::guard(tmp.clone(), |tmp| {
            let _ = std::fs::remove_file(tmp);
        });
        tokio::fs::write(&tmp, contents)
            .await
            .map_err(|source| KeyError::Io { path: tmp.clone(), source })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|source| KeyError::Io { path: path.clone(), source })?;
        ScopeGuard::into_inner(tmp_guard);
        Ok(())
    }
}

fn decoded<T>(name: &str, result: Result<T, CryptoError>) -> Result<T, KeyError> {
    result.map_err(|source| KeyError::Encoding { name: name.to_string(), source })
}

#[async_trait]
impl KeyStore for FileKeyStore {
    async fn key_pair(&self, role: &str) -> Result<KeyPair, KeyError> {
        check_name(role)?;
        let name = Self::private_name(role);
        let text = self
            .read(&name)
            .await?
            .ok_or_else(|| KeyError::NoKeyPair(role.to_string()))?;
        let private = decoded(&name, PrivateKey::from_base64(&text))?;
        Ok(KeyPair { public: private.public_key(), private })
    }

    async fn put_key_pair(&self, role: &str, pair: &KeyPair) -> Result<(), KeyError> {
        check_name(role)?;
        self.write(&Self::private_name(role), &pair.private.to_base64()).await?;
        self.write(&Self::public_name(role), &pair.public.to_base64()).await
    }

    async fn symmetric_key(&self, owner: &str, peer: &str) -> Result<SymmetricKey, KeyError> {
        check_name(owner)?;
        check_name(peer)?;
        let name = Self::symmetric_name(owner, peer);
        let text = self.read(&name).await?.ok_or_else(|| KeyError::NotFound {
            owner: owner.to_string(),
            peer: peer.to_string(),
        })?;
        decoded(&name, SymmetricKey::from_base64(&text))
    }

    async fn put_symmetric_key(&self, owner: &str, peer: &str, key: &SymmetricKey) -> Result<(), KeyError> {
        check_name(owner)?;
        check_name(peer)?;
        self.write(&Self::symmetric_name(owner, peer), &key.to_base64()).await
    }

    async fn public_key(&self, label: &str) -> Result<PublicKey, KeyError> {
        check_name(label)?;
        let name = Self::public_name(label);
        let text = self
            .read(&name)
            .await?
            .ok_or_else(|| KeyError::NoPublicKey(label.to_string()))?;
        decoded(&name, PublicKey::from_base64(&text))
    }

    async fn put_public_key(&self, label: &str, key: &PublicKey) -> Result<(), KeyError> {
        check_name(label)?;
        self.write(&Self::public_name(label), &key.to_base64()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CryptoProvider, SealedBoxProvider};

    async fn exercise(store: &dyn KeyStore) {
        let crypto = SealedBoxProvider::new();
        let key = crypto.generate_symmetric_key();

        assert!(matches!(
            store.symmetric_key("AS", "TGS").await,
            Err(KeyError::NotFound { ref owner, ref peer }) if owner == "AS" && peer == "TGS"
        ));
        store.put_symmetric_key("AS", "TGS", &key).await.unwrap();
        assert_eq!(store.symmetric_key("AS", "TGS").await.unwrap(), key);
        // ordered pair
        assert!(store.symmetric_key("TGS", "AS").await.is_err());

        let pair = crypto.generate_key_pair();
        store.put_key_pair("Client", &pair).await.unwrap();
        let loaded = store.key_pair("Client").await.unwrap();
        assert_eq!(loaded.public, pair.public);

        store.put_public_key(&received_label("Client"), &pair.public).await.unwrap();
        assert_eq!(store.public_key("ClientReceived").await.unwrap(), pair.public);
    }

    #[tokio::test]
    async fn memory_store_contract() {
        exercise(&MemoryKeyStore::new()).await;
    }

    #[tokio::test]
    async fn file_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::open(dir.path()).await.unwrap();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn file_store_uses_stable_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::open(dir.path()).await.unwrap();
        let crypto = SealedBoxProvider::new();
        store.put_symmetric_key("Client", "AS", &crypto.generate_symmetric_key()).await.unwrap();
        store.put_key_pair("TGS", &crypto.generate_key_pair()).await.unwrap();

        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["Symmetric-Client-AS.key", "privateTGS.key", "publicTGS.key"]);
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let key = SealedBoxProvider::new().generate_symmetric_key();
        {
            let store = FileKeyStore::open(dir.path()).await.unwrap();
            store.put_symmetric_key("Server", "TGS", &key).await.unwrap();
        }
        let store = FileKeyStore::open(dir.path()).await.unwrap();
        assert_eq!(store.symmetric_key("Server", "TGS").await.unwrap(), key);
    }

    #[tokio::test]
    async fn concurrent_writers_to_one_pair_leave_a_whole_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileKeyStore::open(dir.path()).await.unwrap());
        let crypto = SealedBoxProvider::new();
        let keys: Vec<SymmetricKey> = (0..16).map(|_| crypto.generate_symmetric_key()).collect();

        let mut tasks = Vec::new();
        for key in keys.clone() {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.put_symmetric_key("AS", "Client", &key).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let stored = store.symmetric_key("AS", "Client").await.unwrap();
        assert!(keys.contains(&stored));
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn file_store_forgets_locks_once_released() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::open(dir.path()).await.unwrap();
        for i in 0..10_000 {
            assert!(store.symmetric_key("AS", &format!("C{i}")).await.is_err());
        }
        assert_eq!(store.locks().len(), 0);

        let store = Arc::new(store);
        let crypto = SealedBoxProvider::new();
        let mut tasks = Vec::new();
        for i in 0..64 {
            let store = store.clone();
            let key = crypto.generate_symmetric_key();
            tasks.push(tokio::spawn(async move {
                store.put_symmetric_key("AS", &format!("C{}", i % 4), &key).await.unwrap();
                store.symmetric_key("AS", &format!("C{}", i % 4)).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(store.locks().len(), 0);
    }

    #[tokio::test]
    async fn corrupted_file_is_an_encoding_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Symmetric-AS-TGS.key"), "not base64!").unwrap();
        let store = FileKeyStore::open(dir.path()).await.unwrap();
        assert!(matches!(store.symmetric_key("AS", "TGS").await, Err(KeyError::Encoding { .. })));
    }

    #[tokio::test]
    async fn path_like_names_are_refused() {
        let store = MemoryKeyStore::new();
        let key = SealedBoxProvider::new().generate_symmetric_key();
        assert!(matches!(
            store.put_symmetric_key("../etc", "AS", &key).await,
            Err(KeyError::InvalidName(_))
        ));
    }
}
