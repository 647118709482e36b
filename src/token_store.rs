//! Encrypted on-disk keyed store of OAuth tokens per server identity — spec
//! §3, §4.2.
//!
//! Grounded on `oauth.py::TokenStore` (Fernet-encrypted JSON, key generated on
//! first use, 0600 permissions on both files) and on `chat-cli::security.rs`'s
//! use of explicit Unix file-permission constants for sensitive files. The
//! Python original uses `cryptography.fernet.Fernet`; this project has no
//! equivalent crate in the example pack, so it substitutes `ring`'s AEAD
//! (AES-256-GCM) — already a direct dependency of the teacher crate for its
//! own TLS/crypto needs — noted in DESIGN.md.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use ring::aead::{self, BoundKey, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TokenRecord {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    pub expires_in: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub created_at: u64,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

struct OneShotNonce(Option<[u8; NONCE_LEN]>);

impl NonceSequence for OneShotNonce {
    fn advance(&mut self) -> Result<Nonce, ring::error::Unspecified> {
        let bytes = self.0.take().ok_or(ring::error::Unspecified)?;
        Ok(Nonce::assume_unique_for_key(bytes))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TokenStoreError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// No-such-record is the only externally observable decryption failure mode
/// (spec §4.2): a corrupted or unreadable file is treated identically to "not
/// yet authorized".
pub struct TokenStore {
    token_file: PathBuf,
    key_file: PathBuf,
    key: tokio::sync::Mutex<Option<[u8; KEY_LEN]>>,
}

impl TokenStore {
    pub fn new(token_file: PathBuf, key_file: PathBuf) -> Self {
        Self { token_file, key_file, key: tokio::sync::Mutex::new(None) }
    }

    pub fn at_default_path() -> Self {
        Self::new(crate::util::paths::token_file(), crate::util::paths::key_file())
    }

    async fn encryption_key(&self) -> Result<[u8; KEY_LEN], TokenStoreError> {
        let mut guard = self.key.lock().await;
        if let Some(k) = *guard {
            return Ok(k);
        }

        let key = if self.key_file.exists() {
            let bytes = tokio::fs::read(&self.key_file).await?;
            let mut k = [0u8; KEY_LEN];
            let n = bytes.len().min(KEY_LEN);
            k[..n].copy_from_slice(&bytes[..n]);
            k
        } else {
            let mut k = [0u8; KEY_LEN];
            SystemRandom::new()
                .fill(&mut k)
                .map_err(|_| TokenStoreError::Io(std::io::Error::other("rng failure")))?;
            if let Some(parent) = self.key_file.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            write_private_file(&self.key_file, &k).await?;
            k
        };

        *guard = Some(key);
        Ok(key)
    }

    async fn encrypt(&self, data: &HashMap<String, TokenRecord>) -> Result<Vec<u8>, TokenStoreError> {
        let key_bytes = self.encryption_key().await?;
        let plaintext = serde_json::to_vec(data).expect("token map always serializes");

        let mut nonce_bytes = [0u8; NONCE_LEN];
        SystemRandom::new()
            .fill(&mut nonce_bytes)
            .map_err(|_| TokenStoreError::Io(std::io::Error::other("rng failure")))?;

        let unbound = UnboundKey::new(&aead::AES_256_GCM, &key_bytes)
            .map_err(|_| TokenStoreError::Io(std::io::Error::other("invalid key")))?;
        let mut sealing = SealingKey::new(unbound, OneShotNonce(Some(nonce_bytes)));

        let mut in_out = plaintext;
        sealing
            .seal_in_place_append_tag(aead::Aad::empty(), &mut in_out)
            .map_err(|_| TokenStoreError::Io(std::io::Error::other("encryption failure")))?;

        let mut out = Vec::with_capacity(NONCE_LEN + in_out.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&in_out);
        Ok(out)
    }

    /// Returns `None` on any decryption failure (corrupt file, wrong key,
    /// truncated data) rather than surfacing the error — callers re-authorize.
    async fn decrypt(&self, encrypted: &[u8]) -> Option<HashMap<String, TokenRecord>> {
        if encrypted.len() < NONCE_LEN {
            return None;
        }
        let key_bytes = self.encryption_key().await.ok()?;
        let (nonce_bytes, ciphertext) = encrypted.split_at(NONCE_LEN);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(nonce_bytes);

        let unbound = UnboundKey::new(&aead::AES_256_GCM, &key_bytes).ok()?;
        let mut opening = OpeningKey::new(unbound, OneShotNonce(Some(nonce)));

        let mut buf = ciphertext.to_vec();
        let plaintext = opening.open_in_place(aead::Aad::empty(), &mut buf).ok()?;
        serde_json::from_slice(plaintext).ok()
    }

    async fn load_all(&self) -> HashMap<String, TokenRecord> {
        let Ok(bytes) = tokio::fs::read(&self.token_file).await else {
            return HashMap::new();
        };
        self.decrypt(&bytes).await.unwrap_or_default()
    }

    async fn persist(&self, all: &HashMap<String, TokenRecord>) -> Result<(), TokenStoreError> {
        let encrypted = self.encrypt(all).await?;
        if let Some(parent) = self.token_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        write_private_file(&self.token_file, &encrypted).await
    }

    pub async fn save(&self, server_id: &str, mut record: TokenRecord) -> Result<(), TokenStoreError> {
        let mut all = self.load_all().await;
        if record.created_at == 0 {
            record.created_at = now_unix();
        }
        all.insert(server_id.to_string(), record);
        self.persist(&all).await
    }

    pub async fn get(&self, server_id: &str) -> Option<TokenRecord> {
        self.load_all().await.remove(server_id)
    }

    pub async fn delete(&self, server_id: &str) -> Result<(), TokenStoreError> {
        let mut all = self.load_all().await;
        if all.remove(server_id).is_some() {
            self.persist(&all).await?;
        }
        Ok(())
    }

    pub async fn list(&self) -> Vec<String> {
        self.load_all().await.into_keys().collect()
    }
}

async fn write_private_file(path: &Path, bytes: &[u8]) -> Result<(), TokenStoreError> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode_if_unix(0o600)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    Ok(())
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// `OpenOptionsExt::mode` exists only on Unix; this keeps the call site
/// portable the way `chat-cli`'s platform-conditional file helpers do.
trait OpenOptionsModeExt {
    fn mode_if_unix(&mut self, mode: u32) -> &mut Self;
}

impl OpenOptionsModeExt for tokio::fs::OpenOptions {
    #[cfg(unix)]
    fn mode_if_unix(&mut self, mode: u32) -> &mut Self {
        self.mode(mode)
    }

    #[cfg(not(unix))]
    fn mode_if_unix(&mut self, _mode: u32) -> &mut Self {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_record() -> TokenRecord {
        TokenRecord {
            access_token: "access-secret-abc123".to_string(),
            token_type: "Bearer".to_string(),
            expires_in: 3600,
            refresh_token: Some("refresh-secret-xyz789".to_string()),
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn save_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("tokens.json"), dir.path().join("key"));

        store.save("github", sample_record()).await.unwrap();
        let got = store.get("github").await.unwrap();
        assert_eq!(got.access_token, "access-secret-abc123");
        assert_ne!(got.created_at, 0);
    }

    #[tokio::test]
    async fn missing_record_returns_none() {
        let dir = tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("tokens.json"), dir.path().join("key"));
        assert!(store.get("nope").await.is_none());
    }

    #[tokio::test]
    async fn persisted_file_never_contains_plaintext_tokens() {
        let dir = tempdir().unwrap();
        let token_path = dir.path().join("tokens.json");
        let store = TokenStore::new(token_path.clone(), dir.path().join("key"));

        store.save("github", sample_record()).await.unwrap();

        let raw = tokio::fs::read(&token_path).await.unwrap();
        let raw_str = String::from_utf8_lossy(&raw);
        assert!(!raw_str.contains("access-secret-abc123"));
        assert!(!raw_str.contains("refresh-secret-xyz789"));
    }

    #[tokio::test]
    async fn corrupted_file_is_treated_as_no_record() {
        let dir = tempdir().unwrap();
        let token_path = dir.path().join("tokens.json");
        let store = TokenStore::new(token_path.clone(), dir.path().join("key"));

        store.save("github", sample_record()).await.unwrap();
        tokio::fs::write(&token_path, b"not even close to valid ciphertext").await.unwrap();

        assert!(store.get("github").await.is_none());
    }

    #[tokio::test]
    async fn delete_removes_record() {
        let dir = tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("tokens.json"), dir.path().join("key"));

        store.save("github", sample_record()).await.unwrap();
        store.delete("github").await.unwrap();
        assert!(store.get("github").await.is_none());
    }

    #[tokio::test]
    async fn list_returns_all_server_ids() {
        let dir = tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("tokens.json"), dir.path().join("key"));

        store.save("github", sample_record()).await.unwrap();
        store.save("weather", sample_record()).await.unwrap();

        let mut servers = store.list().await;
        servers.sort();
        assert_eq!(servers, vec!["github".to_string(), "weather".to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn files_are_created_with_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let token_path = dir.path().join("tokens.json");
        let key_path = dir.path().join("key");
        let store = TokenStore::new(token_path.clone(), key_path.clone());

        store.save("github", sample_record()).await.unwrap();

        let token_mode = tokio::fs::metadata(&token_path).await.unwrap().permissions().mode() & 0o777;
        let key_mode = tokio::fs::metadata(&key_path).await.unwrap().permissions().mode() & 0o777;
        assert_eq!(token_mode, 0o600);
        assert_eq!(key_mode, 0o600);
    }
}
