//! Credential store backed by the system keyring.
//!
//! Secrets are persisted as raw bytes and only ever leave the store as
//! standard base64. Nothing else in the crate encodes or decodes them.

use async_lock::Mutex;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::services::config::{DatabaseKind, env};

/// Random bytes in a freshly generated secret.
const SECRET_LEN: usize = 32;

/// Where the raw secret bytes live.
///
/// Calls may block; the store runs them on the blocking pool.
pub trait SecretBackend: Send + Sync {
    /// `Ok(None)` when nothing is stored under `name`.
    fn load(&self, name: &str) -> Result<Option<Vec<u8>>>;

    fn store(&self, name: &str, secret: &[u8]) -> Result<()>;
}

/// System keyring (Keychain, Credential Manager, Secret Service).
#[cfg(feature = "keyring")]
#[derive(Debug, Clone)]
pub struct KeyringBackend {
    service: String,
}

#[cfg(feature = "keyring")]
impl KeyringBackend {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, name: &str) -> Result<keyring::Entry> {
        keyring::Entry::new(&self.service, name)
            .map_err(|e| Error::CredentialStoreUnavailable(e.to_string()))
    }
}

#[cfg(feature = "keyring")]
impl SecretBackend for KeyringBackend {
    fn load(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match self.entry(name)?.get_secret() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(Error::CredentialStoreUnavailable(e.to_string())),
        }
    }

    fn store(&self, name: &str, secret: &[u8]) -> Result<()> {
        self.entry(name)?
            .set_secret(secret)
            .map_err(|e| Error::CredentialStoreUnavailable(e.to_string()))
    }
}

/// Process-local backend. Secrets vanish with the process, so this is only
/// for tests and dry runs; the store never picks it on its own.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    secrets: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored secrets.
    pub fn len(&self) -> usize {
        self.secrets.lock_blocking().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SecretBackend for MemoryBackend {
    fn load(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.secrets.lock_blocking().get(name).cloned())
    }

    fn store(&self, name: &str, secret: &[u8]) -> Result<()> {
        self.secrets
            .lock_blocking()
            .insert(name.to_string(), secret.to_vec());
        Ok(())
    }
}

/// Hands out stable per-name secrets, generating them on first access.
#[derive(Clone)]
pub struct CredentialStore {
    backend: Arc<dyn SecretBackend>,
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore").finish_non_exhaustive()
    }
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn SecretBackend>) -> Self {
        Self {
            backend,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Store backed by the platform keyring.
    #[cfg(feature = "keyring")]
    pub fn system() -> Result<Self> {
        Ok(Self::new(Arc::new(KeyringBackend::new(env::APP_NAME))))
    }

    #[cfg(not(feature = "keyring"))]
    pub fn system() -> Result<Self> {
        Err(Error::CredentialStoreUnavailable(
            "built without keyring support".to_string(),
        ))
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Logical name of the admin secret for a database kind.
    pub fn name_for(kind: DatabaseKind) -> String {
        format!("{}-{}-password", env::APP_NAME, kind.short_name())
    }

    /// Return the base64 secret stored under `name`, creating one if absent.
    pub async fn get_or_generate(&self, name: &str) -> Result<String> {
        let lock = self.name_lock(name).await;
        let _guard = lock.lock().await;

        let backend = self.backend.clone();
        let key = name.to_string();
        let existing = smol::unblock(move || backend.load(&key)).await?;

        if let Some(secret) = existing.filter(|secret| !secret.is_empty()) {
            return Ok(encode_for_egress(&secret));
        }

        let mut secret = [0u8; SECRET_LEN];
        rand::rng().fill(&mut secret);

        let backend = self.backend.clone();
        let key = name.to_string();
        smol::unblock(move || backend.store(&key, &secret)).await?;
        tracing::info!(name, "generated new secret");

        Ok(STANDARD.encode(secret))
    }

    async fn name_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Values already stored as base64 text pass through; raw bytes are encoded.
fn encode_for_egress(secret: &[u8]) -> String {
    match std::str::from_utf8(secret) {
        Ok(text) if is_base64(text) => text.to_string(),
        _ => STANDARD.encode(secret),
    }
}

fn is_base64(text: &str) -> bool {
    !text.is_empty() && text.len() % 4 == 0 && STANDARD.decode(text).is_ok()
}
