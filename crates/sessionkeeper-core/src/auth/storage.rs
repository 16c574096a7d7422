//! Durable backends for the persisted session record.
//!
//! Every backend stores a single [`PersistedSession`] under a fixed
//! namespace. A missing record reads back as `None`.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use keyring::Entry;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::session::PersistedSession;

/// Namespace the session record is stored under
pub const DEFAULT_NAMESPACE: &str = "auth-token";

/// Keychain service name
const SERVICE_NAME: &str = "sessionkeeper";

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const ENVELOPE_VERSION: u8 = 1;

#[async_trait]
pub trait SessionStorage: Send + Sync {
    async fn load(&self) -> Result<Option<PersistedSession>>;
    async fn save(&self, record: &PersistedSession) -> Result<()>;
    /// Removing a record that does not exist is not an error.
    async fn remove(&self) -> Result<()>;
}

// ============================================================================
// Memory
// ============================================================================

/// Process-local storage. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    record: Mutex<Option<PersistedSession>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(record: PersistedSession) -> Self {
        Self {
            record: Mutex::new(Some(record)),
        }
    }

    /// Current stored record, for inspection
    pub fn snapshot(&self) -> Option<PersistedSession> {
        self.record.lock().ok().and_then(|guard| guard.clone())
    }
}

#[async_trait]
impl SessionStorage for MemoryStorage {
    async fn load(&self) -> Result<Option<PersistedSession>> {
        let guard = self
            .record
            .lock()
            .map_err(|_| anyhow!("Memory storage lock poisoned"))?;
        Ok(guard.clone())
    }

    async fn save(&self, record: &PersistedSession) -> Result<()> {
        let mut guard = self
            .record
            .lock()
            .map_err(|_| anyhow!("Memory storage lock poisoned"))?;
        *guard = Some(record.clone());
        Ok(())
    }

    async fn remove(&self) -> Result<()> {
        let mut guard = self
            .record
            .lock()
            .map_err(|_| anyhow!("Memory storage lock poisoned"))?;
        *guard = None;
        Ok(())
    }
}

// ============================================================================
// Plain JSON file
// ============================================================================

/// JSON file `<namespace>.json` inside a directory.
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl AsRef<Path>, namespace: &str) -> Self {
        Self {
            path: dir.as_ref().join(format!("{}.json", namespace)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SessionStorage for FileStorage {
    async fn load(&self) -> Result<Option<PersistedSession>> {
        let Some(contents) = read_if_exists(&self.path).await? else {
            return Ok(None);
        };
        let record = serde_json::from_slice(&contents).context("Failed to parse session file")?;
        Ok(Some(record))
    }

    async fn save(&self, record: &PersistedSession) -> Result<()> {
        let contents = serde_json::to_vec_pretty(record)?;
        write_private(&self.path, &contents).await
    }

    async fn remove(&self) -> Result<()> {
        remove_if_exists(&self.path).await
    }
}

// ============================================================================
// Encrypted file
// ============================================================================

#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u8,
    salt: String,
    nonce: String,
    ciphertext: String,
}

/// Session file sealed with ChaCha20-Poly1305.
///
/// The key is derived from a passphrase with Argon2id and a random salt
/// stored alongside the ciphertext. The derived key is cached per salt so
/// only the first load or save pays for the derivation, which runs on the
/// blocking pool.
pub struct EncryptedFileStorage {
    path: PathBuf,
    passphrase: String,
    params: Params,
    derived: Mutex<Option<([u8; SALT_LEN], [u8; KEY_LEN])>>,
}

impl EncryptedFileStorage {
    pub fn new(dir: impl AsRef<Path>, namespace: &str, passphrase: impl Into<String>) -> Self {
        Self::with_params(dir, namespace, passphrase, Params::default())
    }

    pub fn with_params(
        dir: impl AsRef<Path>,
        namespace: &str,
        passphrase: impl Into<String>,
        params: Params,
    ) -> Self {
        Self {
            path: dir.as_ref().join(format!("{}.enc", namespace)),
            passphrase: passphrase.into(),
            params,
            derived: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn cached_key(&self, salt: &[u8; SALT_LEN]) -> Option<[u8; KEY_LEN]> {
        let guard = self.derived.lock().ok()?;
        match guard.as_ref() {
            Some((cached_salt, key)) if cached_salt == salt => Some(*key),
            _ => None,
        }
    }

    async fn key_for(&self, salt: [u8; SALT_LEN]) -> Result<[u8; KEY_LEN]> {
        if let Some(key) = self.cached_key(&salt) {
            return Ok(key);
        }

        let passphrase = self.passphrase.clone();
        let params = self.params.clone();
        let key = blocking(move || derive_key(&passphrase, params, &salt)).await?;

        if let Ok(mut guard) = self.derived.lock() {
            *guard = Some((salt, key));
        }
        Ok(key)
    }

    /// Reuse the cached salt so repeated saves skip key derivation.
    fn salt_for_write(&self) -> [u8; SALT_LEN] {
        if let Ok(guard) = self.derived.lock() {
            if let Some((salt, _)) = guard.as_ref() {
                return *salt;
            }
        }
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        salt
    }

    async fn seal(&self, plaintext: &[u8]) -> Result<Envelope> {
        let salt = self.salt_for_write();
        let key = self.key_for(salt).await?;
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| anyhow!("Failed to encrypt session: {}", e))?;

        Ok(Envelope {
            version: ENVELOPE_VERSION,
            salt: STANDARD.encode(salt),
            nonce: STANDARD.encode(nonce),
            ciphertext: STANDARD.encode(ciphertext),
        })
    }

    async fn open(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        if envelope.version != ENVELOPE_VERSION {
            return Err(anyhow!(
                "Unsupported session envelope version {}",
                envelope.version
            ));
        }
        let salt: [u8; SALT_LEN] = STANDARD
            .decode(&envelope.salt)
            .context("Invalid salt encoding")?
            .try_into()
            .map_err(|_| anyhow!("Invalid salt length"))?;
        let nonce: [u8; NONCE_LEN] = STANDARD
            .decode(&envelope.nonce)
            .context("Invalid nonce encoding")?
            .try_into()
            .map_err(|_| anyhow!("Invalid nonce length"))?;
        let ciphertext = STANDARD
            .decode(&envelope.ciphertext)
            .context("Invalid ciphertext encoding")?;

        let key = self.key_for(salt).await?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|_| anyhow!("Failed to decrypt session (wrong passphrase or corrupted file)"))
    }
}

fn derive_key(passphrase: &str, params: Params, salt: &[u8; SALT_LEN]) -> Result<[u8; KEY_LEN]> {
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = [0u8; KEY_LEN];
    argon
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|e| anyhow!("Failed to derive session key: {}", e))?;
    Ok(key)
}

#[async_trait]
impl SessionStorage for EncryptedFileStorage {
    async fn load(&self) -> Result<Option<PersistedSession>> {
        let Some(contents) = read_if_exists(&self.path).await? else {
            return Ok(None);
        };
        let envelope: Envelope =
            serde_json::from_slice(&contents).context("Failed to parse encrypted session file")?;
        let plaintext = self.open(&envelope).await?;
        let record = serde_json::from_slice(&plaintext).context("Failed to parse decrypted session")?;
        Ok(Some(record))
    }

    async fn save(&self, record: &PersistedSession) -> Result<()> {
        let plaintext = serde_json::to_vec(record)?;
        let envelope = self.seal(&plaintext).await?;
        let contents = serde_json::to_vec_pretty(&envelope)?;
        write_private(&self.path, &contents).await
    }

    async fn remove(&self) -> Result<()> {
        remove_if_exists(&self.path).await
    }
}

// ============================================================================
// OS keychain
// ============================================================================

/// Session record stored as a JSON secret in the OS keychain.
pub struct KeyringStorage {
    namespace: String,
}

impl KeyringStorage {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    fn entry(&self) -> Result<Entry> {
        Entry::new(SERVICE_NAME, &self.namespace).context("Failed to create keyring entry")
    }
}

/// Keychain calls block on the platform secret service.
#[async_trait]
impl SessionStorage for KeyringStorage {
    async fn load(&self) -> Result<Option<PersistedSession>> {
        let entry = self.entry()?;
        let secret = blocking(move || match entry.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve session from keychain"),
        })
        .await?;

        match secret {
            Some(secret) => {
                let record = serde_json::from_str(&secret).context("Failed to parse keychain session")?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, record: &PersistedSession) -> Result<()> {
        let secret = serde_json::to_string(record)?;
        let entry = self.entry()?;
        blocking(move || {
            entry
                .set_password(&secret)
                .context("Failed to store session in keychain")
        })
        .await
    }

    async fn remove(&self) -> Result<()> {
        let entry = self.entry()?;
        blocking(move || match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete session from keychain"),
        })
        .await
    }
}

// ============================================================================
// File helpers
// ============================================================================

async fn read_if_exists(path: &Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

/// Run blocking storage work off the async runtime.
async fn blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .context("Storage task failed")?
}

/// Write via a temp file and rename so readers never see a torn record.
/// The temp file is created owner-only, so the tokens are never readable
/// by others, not even briefly.
async fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    // A leftover temp file would keep its old permissions
    let tmp = path.with_extension("tmp");
    remove_if_exists(&tmp).await?;

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options
        .open(&tmp)
        .await
        .with_context(|| format!("Failed to create {}", tmp.display()))?;
    file.write_all(contents)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("Failed to flush {}", tmp.display()))?;
    drop(file);

    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to move session file into place at {}", path.display()))?;
    debug!(path = %path.display(), "Session persisted");
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}
