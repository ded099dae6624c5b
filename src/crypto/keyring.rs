//! Keyring persistence.
//!
//! The keyring (all DEKs plus the current-key pointer) is stored as a JSON
//! envelope encrypted with AES-256-GCM under the master key:
//!
//! ```json
//! {"version": 1, "nonce": "<b64>", "ciphertext": "<b64>"}
//! ```
//!
//! The master key itself never touches disk. Writes go through a temp file in
//! the same directory followed by an atomic rename, so readers only ever see
//! a complete keyring.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use super::payload::DEK_LEN;
use crate::error::{AppError, AppResult};

const ENVELOPE_VERSION: u32 = 1;
const GCM_NONCE_LEN: usize = 12;
pub const PBKDF2_ITERATIONS: u32 = 100_000;
const MASTER_KEY_SALT: &[u8] = b"gatekeeper-master-key";

/// Key-encryption key derived from the externally supplied master secret.
#[derive(Clone)]
pub struct MasterKey([u8; 32]);

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey([REDACTED])")
    }
}

impl MasterKey {
    /// PBKDF2-HMAC-SHA256 over the master secret.
    pub fn derive(secret: &str) -> Self {
        let mut key = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(
            secret.as_bytes(),
            MASTER_KEY_SALT,
            PBKDF2_ITERATIONS,
            &mut key,
        );
        Self(key)
    }

    /// Use raw key material as-is.
    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self(key)
    }
}

/// A data encryption key.
#[derive(Clone)]
pub struct DataEncryptionKey {
    pub id: String,
    pub secret: [u8; DEK_LEN],
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for DataEncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataEncryptionKey")
            .field("id", &self.id)
            .field("secret", &"[REDACTED]")
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl DataEncryptionKey {
    pub fn generate(created_at: DateTime<Utc>) -> Self {
        let mut secret = [0u8; DEK_LEN];
        rand::rng().fill_bytes(&mut secret);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            secret,
            created_at,
        }
    }
}

/// All DEKs ever issued plus the one used for new encryptions.
///
/// Append-only: keys are added, never removed.
#[derive(Debug, Clone)]
pub struct Keyring {
    keys: BTreeMap<String, DataEncryptionKey>,
    current: String,
}

impl Keyring {
    /// A keyring holding a single fresh DEK.
    pub fn generate(now: DateTime<Utc>) -> Self {
        let dek = DataEncryptionKey::generate(now);
        let current = dek.id.clone();
        Self {
            keys: BTreeMap::from([(current.clone(), dek)]),
            current,
        }
    }

    pub fn current(&self) -> Option<&DataEncryptionKey> {
        self.keys.get(&self.current)
    }

    pub fn current_id(&self) -> &str {
        &self.current
    }

    pub fn get(&self, kid: &str) -> Option<&DataEncryptionKey> {
        self.keys.get(kid)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DataEncryptionKey> {
        self.keys.values()
    }

    /// Add a new DEK and make it current. Returns its id.
    pub fn rotate(&mut self, now: DateTime<Utc>) -> String {
        let dek = DataEncryptionKey::generate(now);
        let id = dek.id.clone();
        self.keys.insert(id.clone(), dek);
        self.current = id.clone();
        id
    }

    /// Pull in any keys from `other` that this keyring lacks. The current
    /// pointer is unchanged.
    pub fn absorb(&mut self, other: Keyring) -> usize {
        let mut added = 0;
        for (id, dek) in other.keys {
            if let std::collections::btree_map::Entry::Vacant(slot) = self.keys.entry(id) {
                slot.insert(dek);
                added += 1;
            }
        }
        added
    }
}

#[derive(Serialize, Deserialize)]
struct StoredKey {
    key: String,
    created_at: i64,
}

#[derive(Serialize, Deserialize)]
struct StoredKeyring {
    current: String,
    keys: BTreeMap<String, StoredKey>,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u32,
    nonce: String,
    ciphertext: String,
}

impl Keyring {
    fn to_stored(&self) -> StoredKeyring {
        StoredKeyring {
            current: self.current.clone(),
            keys: self
                .keys
                .iter()
                .map(|(id, dek)| {
                    (
                        id.clone(),
                        StoredKey {
                            key: BASE64.encode(dek.secret),
                            created_at: dek.created_at.timestamp(),
                        },
                    )
                })
                .collect(),
        }
    }

    fn from_stored(stored: StoredKeyring) -> AppResult<Self> {
        let mut keys = BTreeMap::new();
        for (id, entry) in stored.keys {
            let secret: [u8; DEK_LEN] = BASE64
                .decode(entry.key.as_bytes())
                .map_err(|e| AppError::KeyringError(format!("key {id}: {e}")))?
                .try_into()
                .map_err(|_| AppError::KeyringError(format!("key {id}: wrong length")))?;
            let created_at = DateTime::from_timestamp(entry.created_at, 0)
                .ok_or_else(|| AppError::KeyringError(format!("key {id}: bad timestamp")))?;
            keys.insert(
                id.clone(),
                DataEncryptionKey {
                    id,
                    secret,
                    created_at,
                },
            );
        }

        if !keys.contains_key(&stored.current) {
            return Err(AppError::KeyringError(
                "current key is not in the keyring".to_string(),
            ));
        }

        Ok(Self {
            keys,
            current: stored.current,
        })
    }

    /// Encrypt this keyring under `master`.
    pub fn seal(&self, master: &MasterKey) -> AppResult<Vec<u8>> {
        let plaintext = serde_json::to_vec(&self.to_stored())?;

        let cipher = Aes256Gcm::new_from_slice(&master.0)
            .map_err(|e| AppError::KeyringError(format!("invalid master key: {e}")))?;
        let mut nonce = [0u8; GCM_NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_ref())
            .map_err(|_| AppError::KeyringError("keyring encryption failed".to_string()))?;

        let envelope = Envelope {
            version: ENVELOPE_VERSION,
            nonce: BASE64.encode(nonce),
            ciphertext: BASE64.encode(ciphertext),
        };
        Ok(serde_json::to_vec_pretty(&envelope)?)
    }

    /// Decrypt a keyring sealed with [`Keyring::seal`].
    pub fn open(bytes: &[u8], master: &MasterKey) -> AppResult<Self> {
        let envelope: Envelope = serde_json::from_slice(bytes)
            .map_err(|e| AppError::KeyringError(format!("unreadable keyring envelope: {e}")))?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(AppError::KeyringError(format!(
                "unsupported keyring version {}",
                envelope.version
            )));
        }

        let nonce = BASE64
            .decode(envelope.nonce.as_bytes())
            .map_err(|e| AppError::KeyringError(format!("bad nonce: {e}")))?;
        if nonce.len() != GCM_NONCE_LEN {
            return Err(AppError::KeyringError("bad nonce length".to_string()));
        }
        let ciphertext = BASE64
            .decode(envelope.ciphertext.as_bytes())
            .map_err(|e| AppError::KeyringError(format!("bad ciphertext: {e}")))?;

        let cipher = Aes256Gcm::new_from_slice(&master.0)
            .map_err(|e| AppError::KeyringError(format!("invalid master key: {e}")))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|_| {
                AppError::KeyringError(
                    "keyring could not be decrypted with the supplied master key".to_string(),
                )
            })?;

        let stored: StoredKeyring = serde_json::from_slice(&plaintext)
            .map_err(|e| AppError::KeyringError(format!("corrupt keyring contents: {e}")))?;
        Self::from_stored(stored)
    }
}

/// Read and decrypt the keyring at `path`. `Ok(None)` if the file is absent.
pub fn read_keyring(path: &Path, master: &MasterKey) -> AppResult<Option<Keyring>> {
    match std::fs::read(path) {
        Ok(bytes) => Keyring::open(&bytes, master).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(AppError::KeyringError(format!(
            "failed to read {}: {e}",
            path.display()
        ))),
    }
}

/// Atomically replace the keyring at `path`: write a temp file in the same
/// directory, fsync, then rename over the target.
pub fn write_keyring(path: &Path, keyring: &Keyring, master: &MasterKey) -> AppResult<()> {
    sealed_temp_file(path, keyring, master)?
        .persist(path)
        .map_err(|e| {
            AppError::KeyringError(format!("failed to replace {}: {}", path.display(), e.error))
        })?;
    Ok(())
}

/// Write the keyring at `path` only if no file exists there yet.
///
/// Returns `false`, leaving the existing file untouched, when another writer
/// got there first.
pub fn create_keyring(path: &Path, keyring: &Keyring, master: &MasterKey) -> AppResult<bool> {
    match sealed_temp_file(path, keyring, master)?.persist_noclobber(path) {
        Ok(_) => Ok(true),
        Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(AppError::KeyringError(format!(
            "failed to create {}: {}",
            path.display(),
            e.error
        ))),
    }
}

fn sealed_temp_file(
    path: &Path,
    keyring: &Keyring,
    master: &MasterKey,
) -> AppResult<tempfile::NamedTempFile> {
    let sealed = keyring.seal(master)?;

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)
        .map_err(|e| AppError::KeyringError(format!("failed to create {}: {e}", dir.display())))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| AppError::KeyringError(format!("failed to create temp file: {e}")))?;
    tmp.write_all(&sealed)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|e| AppError::KeyringError(format!("failed to write keyring: {e}")))?;
    Ok(tmp)
}
