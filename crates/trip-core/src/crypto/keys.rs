//! Verifier signing key storage and the trusted-identity registry.
//!
//! The verifier holds exactly one long-lived Ed25519 signing key, loaded
//! once at startup. Key files are written with 0600 permissions and read
//! back only when the permissions are still restrictive.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

use ed25519_dalek::SigningKey;
use thiserror::Error;
use zeroize::Zeroizing;

use super::sign::{PUBLIC_KEY_SIZE, SECRET_KEY_SIZE};

/// Errors from key storage operations.
#[derive(Debug, Error)]
pub enum KeyStoreError {
    /// I/O error during key file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Key file content has the wrong length or format.
    #[error("invalid key material in {path}")]
    InvalidKeyMaterial {
        /// Offending file path.
        path: String,
    },

    /// Key file is readable by group or other.
    #[error("insecure permissions on key file: {path}")]
    InsecurePermissions {
        /// Offending file path.
        path: String,
    },

    /// A trusted-registry entry is not valid 64-char hex.
    #[error("invalid registry entry at line {line}")]
    InvalidRegistryEntry {
        /// 1-based line number in the registry file.
        line: usize,
    },
}

/// Loads the verifier signing key from `path`, generating and persisting a
/// fresh key on first start.
///
/// # Errors
///
/// Returns [`KeyStoreError`] on I/O failure, bad key material, or
/// world-readable key files.
pub fn load_or_generate_signing_key(path: impl AsRef<Path>) -> Result<SigningKey, KeyStoreError> {
    let path = path.as_ref();
    if path.exists() {
        return load_signing_key(path);
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))?;
        }
    }

    let key = SigningKey::generate(&mut rand::thread_rng());
    let secret = Zeroizing::new(key.to_bytes());

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(&*secret)?;
    file.sync_all()?;

    let mode = fs::metadata(path)?.permissions().mode();
    if mode & 0o077 != 0 {
        let _ = fs::remove_file(path);
        return Err(KeyStoreError::InsecurePermissions {
            path: path.display().to_string(),
        });
    }

    Ok(key)
}

/// Loads an existing verifier signing key, refusing world-readable files.
///
/// # Errors
///
/// Returns [`KeyStoreError`] on I/O failure, bad key material, or
/// insecure permissions.
pub fn load_signing_key(path: impl AsRef<Path>) -> Result<SigningKey, KeyStoreError> {
    let path = path.as_ref();

    let mode = fs::metadata(path)?.permissions().mode();
    if mode & 0o077 != 0 {
        return Err(KeyStoreError::InsecurePermissions {
            path: path.display().to_string(),
        });
    }

    let mut file = File::open(path)?;
    let mut secret = Zeroizing::new([0u8; SECRET_KEY_SIZE]);
    file.read_exact(&mut *secret)
        .map_err(|_| KeyStoreError::InvalidKeyMaterial {
            path: path.display().to_string(),
        })?;

    // Reject trailing bytes; the file must hold exactly one seed.
    let mut rest = [0u8; 1];
    if file.read(&mut rest)? != 0 {
        return Err(KeyStoreError::InvalidKeyMaterial {
            path: path.display().to_string(),
        });
    }

    Ok(SigningKey::from_bytes(&secret))
}

/// Read-only registry of identity public keys the verifier chooses to
/// serve.
///
/// An empty registry means open policy: every structurally valid identity
/// is served. A non-empty registry restricts service to listed keys.
/// Initialized once at startup; reloads happen only through an explicit
/// administrative transition that constructs a new registry.
#[derive(Debug, Clone, Default)]
pub struct TrustedRegistry {
    keys: BTreeSet<[u8; PUBLIC_KEY_SIZE]>,
}

impl TrustedRegistry {
    /// Creates an open registry that serves every identity.
    #[must_use]
    pub fn open() -> Self {
        Self::default()
    }

    /// Builds a registry from explicit identity keys.
    #[must_use]
    pub fn from_keys(keys: impl IntoIterator<Item = [u8; PUBLIC_KEY_SIZE]>) -> Self {
        Self {
            keys: keys.into_iter().collect(),
        }
    }

    /// Loads a registry from a file of newline-separated 64-char hex keys.
    ///
    /// Blank lines and `#` comments are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError`] on I/O failure or malformed entries.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, KeyStoreError> {
        let content = fs::read_to_string(path)?;
        let mut keys = BTreeSet::new();

        for (i, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let bytes =
                hex::decode(line).map_err(|_| KeyStoreError::InvalidRegistryEntry { line: i + 1 })?;
            let key: [u8; PUBLIC_KEY_SIZE] = bytes
                .try_into()
                .map_err(|_| KeyStoreError::InvalidRegistryEntry { line: i + 1 })?;
            keys.insert(key);
        }

        Ok(Self { keys })
    }

    /// Whether the registry permits serving this identity.
    #[must_use]
    pub fn serves(&self, identity: &[u8; PUBLIC_KEY_SIZE]) -> bool {
        self.keys.is_empty() || self.keys.contains(identity)
    }

    /// Number of explicitly trusted identities (0 for an open registry).
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the registry is open (serves everyone).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
