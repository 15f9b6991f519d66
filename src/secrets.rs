use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Opaque key-value store of secrets by scope name.
///
/// Implementations must never log or echo secret values; the only way a
/// secret leaves the store is a direct `retrieve`.
pub trait SecretStore: Send + Sync {
    fn save(&self, scope: &str, secret: &str) -> Result<(), String>;
    fn retrieve(&self, scope: &str) -> Result<Option<String>, String>;
    fn delete(&self, scope: &str) -> Result<(), String>;
    fn exists(&self, scope: &str) -> bool;

    // Admin keys live in a parallel namespace per scope.
    fn save_admin(&self, scope: &str, secret: &str) -> Result<(), String> {
        self.save(&admin_key(scope), secret)
    }
    fn retrieve_admin(&self, scope: &str) -> Result<Option<String>, String> {
        self.retrieve(&admin_key(scope))
    }
    fn delete_admin(&self, scope: &str) -> Result<(), String> {
        self.delete(&admin_key(scope))
    }
    fn exists_admin(&self, scope: &str) -> bool {
        self.exists(&admin_key(scope))
    }
}

pub fn admin_key(scope: &str) -> String {
    format!("{}-admin", scope)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SealedBlob {
    alg: String,
    nonce_b64: String,
    ciphertext_b64: String,
}

const SEAL_ALG: &str = "xchacha20poly1305";

fn seal(key_32: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<SealedBlob, String> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key_32));
    let mut nonce = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| "encrypt failed".to_string())?;
    Ok(SealedBlob {
        alg: SEAL_ALG.to_string(),
        nonce_b64: base64::engine::general_purpose::STANDARD.encode(nonce),
        ciphertext_b64: base64::engine::general_purpose::STANDARD.encode(ciphertext),
    })
}

fn open(key_32: &[u8; 32], blob: &SealedBlob, aad: &[u8]) -> Result<Vec<u8>, String> {
    if blob.alg != SEAL_ALG {
        return Err("unsupported seal alg".to_string());
    }
    let nonce = base64::engine::general_purpose::STANDARD
        .decode(blob.nonce_b64.as_bytes())
        .map_err(|_| "invalid nonce".to_string())?;
    if nonce.len() != 24 {
        return Err("invalid nonce length".to_string());
    }
    let ciphertext = base64::engine::general_purpose::STANDARD
        .decode(blob.ciphertext_b64.as_bytes())
        .map_err(|_| "invalid ciphertext".to_string())?;

    let cipher = XChaCha20Poly1305::new(Key::from_slice(key_32));
    cipher
        .decrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: &ciphertext,
                aad,
            },
        )
        .map_err(|_| "decrypt failed".to_string())
}

/// File-backed store: one sealed blob per key under `<root>/secrets/`, with
/// a random device key persisted at `<root>/device.key` on first use.
///
/// The AAD binds every blob to its key name, so a blob copied onto another
/// scope's path fails to decrypt instead of silently serving the wrong
/// credential.
pub struct FileSecretStore {
    secrets_dir: PathBuf,
    device_key: [u8; 32],
}

impl FileSecretStore {
    pub fn open_under(root: &Path) -> Result<Self, String> {
        let device_key = load_or_create_device_key(&root.join("device.key"))?;
        Ok(Self {
            secrets_dir: root.join("secrets"),
            device_key,
        })
    }

    fn path_for(&self, scope: &str) -> PathBuf {
        self.secrets_dir.join(format!("{}.json", sanitize_key(scope)))
    }
}

impl SecretStore for FileSecretStore {
    fn save(&self, scope: &str, secret: &str) -> Result<(), String> {
        let scope = normalize_key(scope)?;
        std::fs::create_dir_all(&self.secrets_dir).map_err(|e| e.to_string())?;
        let blob = seal(&self.device_key, secret.as_bytes(), scope.as_bytes())?;
        let raw = serde_json::to_string_pretty(&blob).map_err(|e| e.to_string())?;
        write_private(&self.path_for(&scope), raw.as_bytes()).map_err(|e| e.to_string())
    }

    fn retrieve(&self, scope: &str) -> Result<Option<String>, String> {
        let scope = normalize_key(scope)?;
        let path = self.path_for(&scope);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path).map_err(|e| e.to_string())?;
        let blob: SealedBlob = serde_json::from_str(&raw).map_err(|e| e.to_string())?;
        let plaintext = open(&self.device_key, &blob, scope.as_bytes())?;
        let secret =
            String::from_utf8(plaintext).map_err(|_| "secret is not utf8".to_string())?;
        Ok(Some(secret))
    }

    fn delete(&self, scope: &str) -> Result<(), String> {
        let scope = normalize_key(scope)?;
        let path = self.path_for(&scope);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    fn exists(&self, scope: &str) -> bool {
        match normalize_key(scope) {
            Ok(scope) => self.path_for(&scope).exists(),
            Err(_) => false,
        }
    }
}

fn normalize_key(scope: &str) -> Result<String, String> {
    let trimmed = scope.trim();
    if trimmed.is_empty() {
        return Err("secret scope is required".to_string());
    }
    Ok(trimmed.to_string())
}

fn sanitize_key(scope: &str) -> String {
    scope
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn load_or_create_device_key(path: &Path) -> Result<[u8; 32], String> {
    if path.exists() {
        let raw = std::fs::read(path).map_err(|e| e.to_string())?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(raw.trim_ascii())
            .map_err(|_| "invalid device key encoding".to_string())?;
        let key: [u8; 32] = decoded
            .try_into()
            .map_err(|_| "invalid device key length".to_string())?;
        return Ok(key);
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    let encoded = base64::engine::general_purpose::STANDARD.encode(key);
    write_private(path, encoded.as_bytes()).map_err(|e| e.to_string())?;
    Ok(key)
}

// The file is born 0o600; there is never a window with looser permissions.
#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut f = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    f.write_all(contents)
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)
}

/// In-memory store for unit tests.
#[derive(Default)]
pub struct MemorySecretStore {
    inner: Mutex<HashMap<String, String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemorySecretStore {
    fn save(&self, scope: &str, secret: &str) -> Result<(), String> {
        let scope = normalize_key(scope)?;
        self.inner
            .lock()
            .map_err(|_| "secret store lock poisoned".to_string())?
            .insert(scope, secret.to_string());
        Ok(())
    }

    fn retrieve(&self, scope: &str) -> Result<Option<String>, String> {
        let scope = normalize_key(scope)?;
        Ok(self
            .inner
            .lock()
            .map_err(|_| "secret store lock poisoned".to_string())?
            .get(&scope)
            .cloned())
    }

    fn delete(&self, scope: &str) -> Result<(), String> {
        let scope = normalize_key(scope)?;
        self.inner
            .lock()
            .map_err(|_| "secret store lock poisoned".to_string())?
            .remove(&scope);
        Ok(())
    }

    fn exists(&self, scope: &str) -> bool {
        self.inner
            .lock()
            .ok()
            .is_some_and(|map| map.contains_key(scope.trim()))
    }
}
