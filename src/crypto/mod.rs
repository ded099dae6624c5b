//! Two-tier payload encryption.
//!
//! Payloads are encrypted under data encryption keys (DEKs). The set of DEKs
//! (the keyring) is stored on disk encrypted under a master key that is
//! supplied at startup and never persisted.
//!
//! Exactly one DEK is current and used for new encryptions. DEKs are never
//! removed, so every payload stays decryptable via the key id it carries.

mod keyring;
mod payload;

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::clock::SharedClock;
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::metrics;

pub use keyring::{
    DataEncryptionKey, Keyring, MasterKey, create_keyring, read_keyring, write_keyring,
};
pub use payload::{DEK_LEN, EncryptedPayload, IV_LEN, TAG_LEN, decode_b64, encode_b64};

/// Public view of one DEK. Never carries key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyInfo {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub current: bool,
}

/// Modification time and length of the keyring file as last read or written.
type FileStamp = (SystemTime, u64);

fn file_stamp(path: &Path) -> Option<FileStamp> {
    let meta = std::fs::metadata(path).ok()?;
    Some((meta.modified().ok()?, meta.len()))
}

/// Owns the keyring and performs payload encryption.
///
/// Reads take a shared lock for the duration of a key lookup only. Rotation
/// is serialized by a separate mutex so the keyring file is written by one
/// rotation at a time. File I/O is blocking; call `rotate` from
/// `spawn_blocking` in async contexts.
pub struct KeyManager {
    path: PathBuf,
    master: MasterKey,
    clock: SharedClock,
    rotation_age: Option<Duration>,
    keyring: RwLock<Keyring>,
    rotation: Mutex<()>,
    /// Guards reloads; the file is only re-read when this changes.
    seen: Mutex<Option<FileStamp>>,
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("path", &self.path)
            .field("current", &self.current_key_id())
            .field("keys", &self.keyring.read().len())
            .field("rotation_age", &self.rotation_age)
            .finish_non_exhaustive()
    }
}

impl KeyManager {
    pub fn from_config(config: &Config, clock: SharedClock) -> AppResult<Self> {
        let master = MasterKey::derive(&config.master_key);
        Self::load_or_init(&config.encryption_keys_file, master, clock)
            .map(|manager| manager.with_rotation_age(config.key_rotation_age()))
    }

    /// Load the keyring at `path`, or create one.
    ///
    /// An absent file gets a fresh single-key keyring. A file that cannot be
    /// decrypted with `master` is moved aside to `<path>.corrupt-<unix ts>`
    /// and replaced, so the old keys can still be recovered by hand.
    ///
    /// Safe to race against other processes doing the same: a fresh keyring
    /// is only created if no file exists, otherwise the one that won is
    /// adopted. A DEK is only ever used once it is on disk, and an existing
    /// file is never replaced by initialisation.
    pub fn load_or_init(path: &Path, master: MasterKey, clock: SharedClock) -> AppResult<Self> {
        let existing = match std::fs::read(path) {
            Ok(bytes) => match Keyring::open(&bytes, &master) {
                Ok(keyring) => Some(keyring),
                Err(e) => {
                    quarantine(path, clock.now_secs())?;
                    tracing::warn!(path = %path.display(), error = %e, "Keyring undecryptable, generating a new one");
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(AppError::KeyringError(format!(
                    "failed to read {}: {e}",
                    path.display()
                )));
            }
        };

        let keyring = match existing {
            Some(keyring) => {
                tracing::info!(
                    path = %path.display(),
                    keys = keyring.len(),
                    current = %keyring.current_id(),
                    "Loaded encryption keyring"
                );
                keyring
            }
            None => {
                let fresh = Keyring::generate(clock.now());
                if create_keyring(path, &fresh, &master)? {
                    tracing::info!(path = %path.display(), current = %fresh.current_id(), "Created encryption keyring");
                    fresh
                } else {
                    let on_disk = read_keyring(path, &master)?.ok_or_else(|| {
                        AppError::KeyringError(format!(
                            "{} disappeared during initialisation",
                            path.display()
                        ))
                    })?;
                    tracing::info!(path = %path.display(), current = %on_disk.current_id(), "Another process initialised the keyring first, adopting it");
                    on_disk
                }
            }
        };

        metrics::set_keyring_size(keyring.len());

        Ok(Self {
            path: path.to_path_buf(),
            master,
            clock,
            rotation_age: None,
            keyring: RwLock::new(keyring),
            rotation: Mutex::new(()),
            seen: Mutex::new(file_stamp(path)),
        })
    }

    /// Age after which the current DEK is due for rotation. `None` disables
    /// age-based rotation.
    pub fn with_rotation_age(mut self, age: Option<Duration>) -> Self {
        self.rotation_age = age;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current_key_id(&self) -> String {
        self.keyring.read().current_id().to_string()
    }

    pub fn list_keys(&self) -> Vec<KeyInfo> {
        let keyring = self.keyring.read();
        let mut keys: Vec<KeyInfo> = keyring
            .keys()
            .map(|dek| KeyInfo {
                id: dek.id.clone(),
                created_at: dek.created_at,
                current: dek.id == keyring.current_id(),
            })
            .collect();
        keys.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        keys
    }

    /// Encrypt under the current DEK with a fresh IV.
    pub fn encrypt(&self, plaintext: &[u8]) -> AppResult<EncryptedPayload> {
        let (kid, secret) = {
            let keyring = self.keyring.read();
            let dek = keyring
                .current()
                .ok_or_else(|| AppError::KeyringError("no current key".to_string()))?;
            (dek.id.clone(), dek.secret)
        };
        payload::seal(&kid, &secret, plaintext)
    }

    /// Authenticate and decrypt `payload` with the DEK it names.
    ///
    /// A key id not in memory triggers a reload from disk, to pick up
    /// rotations done by other processes sharing the keyring file. The file
    /// is only re-read if it changed since it was last seen.
    pub fn decrypt(&self, payload: &EncryptedPayload) -> AppResult<Vec<u8>> {
        let secret = match self.lookup(&payload.kid) {
            Some(secret) => secret,
            None => {
                self.reload_if_changed()?;
                self.lookup(&payload.kid).ok_or_else(|| {
                    tracing::warn!(kid = %payload.kid, "Decryption requested with unknown key id");
                    AppError::UnknownEncryptionKey(payload.kid.clone())
                })?
            }
        };

        payload::open(&secret, payload).inspect_err(|e| {
            tracing::warn!(kid = %payload.kid, error = %e, "Payload rejected");
        })
    }

    fn lookup(&self, kid: &str) -> Option<[u8; DEK_LEN]> {
        self.keyring.read().get(kid).map(|dek| dek.secret)
    }

    /// Merge keys from the file on disk into memory. The current pointer is
    /// not changed.
    pub fn reload(&self) -> AppResult<usize> {
        let stamp = file_stamp(&self.path);
        let added = self.merge_from_disk()?;
        *self.seen.lock() = stamp;
        Ok(added)
    }

    /// [`reload`](Self::reload), skipped when the keyring file's modification
    /// time and length match the last read or write. Returns whether the
    /// file was read.
    pub fn reload_if_changed(&self) -> AppResult<bool> {
        let stamp = file_stamp(&self.path);
        let mut seen = self.seen.lock();
        if stamp.is_some() && *seen == stamp {
            return Ok(false);
        }
        self.merge_from_disk()?;
        *seen = stamp;
        Ok(true)
    }

    fn merge_from_disk(&self) -> AppResult<usize> {
        let Some(on_disk) = read_keyring(&self.path, &self.master)? else {
            return Ok(0);
        };
        let mut keyring = self.keyring.write();
        let added = keyring.absorb(on_disk);
        if added > 0 {
            metrics::set_keyring_size(keyring.len());
            tracing::info!(added, "Picked up keys from keyring file");
        }
        Ok(added)
    }

    /// Generate a new DEK, make it current, and persist the keyring.
    ///
    /// Keys already on disk are merged in before writing, so a concurrent
    /// rotation by another process is not lost. If the write fails the
    /// in-memory keyring is left unchanged.
    pub fn rotate(&self) -> AppResult<String> {
        let _serialized = self.rotation.lock();

        let mut next = self.keyring.read().clone();
        if let Some(on_disk) = read_keyring(&self.path, &self.master)? {
            next.absorb(on_disk);
        }
        let previous = next.current_id().to_string();
        let new_id = next.rotate(self.clock.now());

        write_keyring(&self.path, &next, &self.master)?;
        *self.seen.lock() = file_stamp(&self.path);
        metrics::set_keyring_size(next.len());
        *self.keyring.write() = next;

        metrics::record_key_rotation();
        tracing::info!(previous = %previous, current = %new_id, "Rotated data encryption key");
        Ok(new_id)
    }

    /// Whether the current DEK is older than the rotation age.
    pub fn should_rotate(&self) -> bool {
        let Some(age) = self.rotation_age else {
            return false;
        };
        let Some(created_at) = self.keyring.read().current().map(|dek| dek.created_at) else {
            return true;
        };
        let Ok(age) = chrono::Duration::from_std(age) else {
            return false;
        };
        self.clock.now().signed_duration_since(created_at) >= age
    }

    /// Rotate if [`should_rotate`](Self::should_rotate). Returns the new id.
    pub fn rotate_if_stale(&self) -> AppResult<Option<String>> {
        if self.should_rotate() {
            self.rotate().map(Some)
        } else {
            Ok(None)
        }
    }
}

fn quarantine(path: &Path, now_secs: i64) -> AppResult<()> {
    let mut target = OsString::from(path.as_os_str());
    target.push(format!(".corrupt-{now_secs}"));
    std::fs::rename(path, &target).map_err(|e| {
        AppError::KeyringError(format!("failed to move aside {}: {e}", path.display()))
    })?;
    tracing::warn!(from = %path.display(), to = %PathBuf::from(&target).display(), "Quarantined keyring");
    Ok(())
}
