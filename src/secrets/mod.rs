//! Encrypted secret storage for extensions.
//!
//! Uses Argon2id for key derivation and ChaCha20-Poly1305 for AEAD.
//! Values are stored as `nonce ‖ ciphertext+tag`; rows are keyed by
//! `(extension_id, user, key)` where the no-user case is normalized to a
//! fixed sentinel, because a unique constraint across a nullable column
//! is unreliable. An auth-tag mismatch on read propagates as an error -
//! it indicates tampering or a key mismatch and is never swallowed.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::{HostError, HostResult};
use crate::permissions::validate_secret_key;

/// Sentinel for secrets not scoped to a user.
pub const GLOBAL_SCOPE: &str = "__global__";

/// Fixed application salt for the master key derivation. Changing this
/// invalidates every stored secret.
const KDF_SALT: &[u8; 16] = b"proassist-secret";

const NONCE_LEN: usize = 12;

/// Per-extension, per-user encrypted key/value store.
pub struct SecretsManager {
    conn: Arc<Mutex<Connection>>,
    cipher: ChaCha20Poly1305,
}

impl SecretsManager {
    /// Open the secret database, deriving the encryption key once from
    /// the master secret.
    pub fn open(db_path: &Path, master_secret: &str) -> HostResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| HostError::InvalidInput(format!("cannot create data dir: {e}")))?;
        }
        Self::init(Connection::open(db_path)?, master_secret)
    }

    /// In-memory store for tests.
    pub fn in_memory(master_secret: &str) -> HostResult<Self> {
        Self::init(Connection::open_in_memory()?, master_secret)
    }

    fn init(conn: Connection, master_secret: &str) -> HostResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS secrets (
                extension_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value BLOB NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (extension_id, user_id, key)
            )",
            [],
        )?;

        let key = derive_key(master_secret)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key)),
        })
    }

    /// Store a secret, overwriting any previous value.
    pub fn set(
        &self,
        extension_id: &str,
        user_id: Option<&str>,
        key: &str,
        value: &str,
    ) -> HostResult<()> {
        validate_secret_key(key).map_err(|e| HostError::InvalidInput(e.to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), value.as_bytes())
            .map_err(|e| HostError::Encryption(format!("encryption failed: {e}")))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO secrets (extension_id, user_id, key, value, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (extension_id, user_id, key)
             DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![
                extension_id,
                scope(user_id),
                key,
                blob,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Fetch and decrypt a secret. `None` on miss.
    pub fn get(
        &self,
        extension_id: &str,
        user_id: Option<&str>,
        key: &str,
    ) -> HostResult<Option<String>> {
        validate_secret_key(key).map_err(|e| HostError::InvalidInput(e.to_string()))?;

        let blob: Option<Vec<u8>> = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT value FROM secrets
                 WHERE extension_id = ?1 AND user_id = ?2 AND key = ?3",
            )?;
            let mut rows = stmt.query(params![extension_id, scope(user_id), key])?;
            match rows.next()? {
                Some(row) => Some(row.get(0)?),
                None => None,
            }
        };

        let Some(blob) = blob else {
            return Ok(None);
        };
        if blob.len() <= NONCE_LEN {
            return Err(HostError::Encryption("stored secret is truncated".into()));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| {
                HostError::Encryption("decryption failed: auth tag mismatch or wrong key".into())
            })?;

        String::from_utf8(plaintext)
            .map(Some)
            .map_err(|_| HostError::Encryption("decrypted secret is not valid UTF-8".into()))
    }

    /// Delete a secret; reports whether a row existed.
    pub fn delete(
        &self,
        extension_id: &str,
        user_id: Option<&str>,
        key: &str,
    ) -> HostResult<bool> {
        validate_secret_key(key).map_err(|e| HostError::InvalidInput(e.to_string()))?;
        let conn = self.conn.lock().unwrap();
        let affected = conn.execute(
            "DELETE FROM secrets WHERE extension_id = ?1 AND user_id = ?2 AND key = ?3",
            params![extension_id, scope(user_id), key],
        )?;
        Ok(affected > 0)
    }

    /// List key names only; values never leave the store unencrypted in
    /// bulk.
    pub fn list(&self, extension_id: &str, user_id: Option<&str>) -> HostResult<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT key FROM secrets WHERE extension_id = ?1 AND user_id = ?2 ORDER BY key",
        )?;
        let rows = stmt.query_map(params![extension_id, scope(user_id)], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<String>, _>>()?)
    }
}

fn scope(user_id: Option<&str>) -> &str {
    user_id.unwrap_or(GLOBAL_SCOPE)
}

fn derive_key(master_secret: &str) -> HostResult<[u8; 32]> {
    let mut key = [0u8; 32];
    let params = argon2::Params::new(19456, 2, 1, Some(32))
        .map_err(|e| HostError::Encryption(format!("invalid Argon2 parameters: {e}")))?;
    let argon2 = argon2::Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);
    argon2
        .hash_password_into(master_secret.as_bytes(), KDF_SALT, &mut key)
        .map_err(|e| HostError::Encryption(format!("KDF failed: {e}")))?;
    Ok(key)
}
