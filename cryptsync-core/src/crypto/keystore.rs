//! Pluggable private key storage.
//!
//! Private keys never leave the crypto controller as anything but PKCS#8
//! blobs handed to a [`KeyStore`]. Stores are created through providers
//! registered in an explicit [`KeyStoreRegistry`] that is built at setup
//! time and passed by reference.

use crate::crypto::{CryptoError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Opaque vault for private key blobs, addressed by string labels such as
/// `device/{uuid}/sign-key`.
pub trait KeyStore: Send {
    /// Open the backing store. Must be called before any other operation.
    fn open(&mut self) -> Result<()>;

    /// Close the backing store, flushing any state.
    fn close(&mut self);

    fn contains(&self, label: &str) -> Result<bool>;

    fn load_private_key(&self, label: &str) -> Result<Zeroizing<Vec<u8>>>;

    fn store_private_key(&mut self, label: &str, der: &[u8]) -> Result<()>;

    fn remove_private_key(&mut self, label: &str) -> Result<()>;

    /// All labels currently present under the given prefix.
    fn labels_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Factory for a named key store backend.
pub trait KeyStoreProvider: Send + Sync {
    fn name(&self) -> &str;

    fn create(&self) -> Box<dyn KeyStore>;
}

/// Explicit provider registry, replacing a process-wide plugin singleton.
#[derive(Default)]
pub struct KeyStoreRegistry {
    providers: HashMap<String, Box<dyn KeyStoreProvider>>,
}

impl KeyStoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Box<dyn KeyStoreProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }

    /// Create a store from the named provider.
    pub fn create(&self, provider: &str) -> Result<Box<dyn KeyStore>> {
        self.providers
            .get(provider)
            .map(|p| p.create())
            .ok_or_else(|| CryptoError::KeyStoreUnavailable(format!("no provider named {provider}")))
    }
}

/// In-memory key store, mainly for tests.
#[derive(Default)]
pub struct MemoryKeyStore {
    open: bool,
    keys: HashMap<String, Zeroizing<Vec<u8>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(CryptoError::KeyStoreUnavailable("store not open".to_string()))
        }
    }
}

impl KeyStore for MemoryKeyStore {
    fn open(&mut self) -> Result<()> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn contains(&self, label: &str) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.keys.contains_key(label))
    }

    fn load_private_key(&self, label: &str) -> Result<Zeroizing<Vec<u8>>> {
        self.ensure_open()?;
        self.keys
            .get(label)
            .cloned()
            .ok_or_else(|| CryptoError::KeyStoreMissing(label.to_string()))
    }

    fn store_private_key(&mut self, label: &str, der: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.keys
            .insert(label.to_string(), Zeroizing::new(der.to_vec()));
        Ok(())
    }

    fn remove_private_key(&mut self, label: &str) -> Result<()> {
        self.ensure_open()?;
        self.keys.remove(label);
        Ok(())
    }

    fn labels_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.ensure_open()?;
        let mut labels: Vec<String> = self
            .keys
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        labels.sort();
        Ok(labels)
    }
}

/// Provider for [`MemoryKeyStore`].
pub struct MemoryKeyStoreProvider;

impl KeyStoreProvider for MemoryKeyStoreProvider {
    fn name(&self) -> &str {
        "memory"
    }

    fn create(&self) -> Box<dyn KeyStore> {
        Box::new(MemoryKeyStore::new())
    }
}

/// File-backed key store: one DER file per label under a root directory.
/// Labels map to relative paths; files are created with owner-only
/// permissions on unix.
pub struct FileKeyStore {
    root: PathBuf,
    open: bool,
}

impl FileKeyStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            open: false,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(CryptoError::KeyStoreUnavailable("store not open".to_string()))
        }
    }

    fn path_for(&self, label: &str) -> Result<PathBuf> {
        // Labels are slash-separated identifiers; refuse anything that could
        // escape the root.
        if label.is_empty() || label.split('/').any(|part| part.is_empty() || part == ".." || part == ".") {
            return Err(CryptoError::KeyStoreUnavailable(format!(
                "invalid key label: {label}"
            )));
        }
        Ok(self.root.join(label).with_extension("der"))
    }

    fn collect_labels(dir: &Path, base: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                Self::collect_labels(&path, base, out)?;
            } else if path.extension().is_some_and(|e| e == "der") {
                if let Ok(rel) = path.with_extension("").strip_prefix(base) {
                    out.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        Ok(())
    }
}

impl KeyStore for FileKeyStore {
    fn open(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.root)
            .map_err(|e| CryptoError::KeyStoreUnavailable(e.to_string()))?;
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn contains(&self, label: &str) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.path_for(label)?.exists())
    }

    fn load_private_key(&self, label: &str) -> Result<Zeroizing<Vec<u8>>> {
        self.ensure_open()?;
        let path = self.path_for(label)?;
        if !path.exists() {
            return Err(CryptoError::KeyStoreMissing(label.to_string()));
        }
        Ok(Zeroizing::new(std::fs::read(path)?))
    }

    fn store_private_key(&mut self, label: &str, der: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let path = self.path_for(label)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, der)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    fn remove_private_key(&mut self, label: &str) -> Result<()> {
        self.ensure_open()?;
        let path = self.path_for(label)?;
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    fn labels_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.ensure_open()?;
        let mut labels = Vec::new();
        if self.root.exists() {
            Self::collect_labels(&self.root, &self.root, &mut labels)?;
        }
        labels.retain(|l| l.starts_with(prefix));
        labels.sort();
        Ok(labels)
    }
}

/// Provider for [`FileKeyStore`] rooted at a fixed directory.
pub struct FileKeyStoreProvider {
    root: PathBuf,
}

impl FileKeyStoreProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl KeyStoreProvider for FileKeyStoreProvider {
    fn name(&self) -> &str {
        "file"
    }

    fn create(&self) -> Box<dyn KeyStore> {
        Box::new(FileKeyStore::new(self.root.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_roundtrip() {
        let mut store = MemoryKeyStore::new();
        store.open().unwrap();

        store
            .store_private_key("device/abc/sign-key", b"blob")
            .unwrap();
        assert!(store.contains("device/abc/sign-key").unwrap());
        assert_eq!(
            store.load_private_key("device/abc/sign-key").unwrap().as_slice(),
            b"blob"
        );

        store.remove_private_key("device/abc/sign-key").unwrap();
        assert!(!store.contains("device/abc/sign-key").unwrap());
    }

    #[test]
    fn missing_key_is_distinct_error() {
        let mut store = MemoryKeyStore::new();
        store.open().unwrap();
        match store.load_private_key("device/abc/sign-key") {
            Err(CryptoError::KeyStoreMissing(label)) => assert_eq!(label, "device/abc/sign-key"),
            other => panic!("expected KeyStoreMissing, got {other:?}"),
        }
    }

    #[test]
    fn closed_store_rejects_access() {
        let store = MemoryKeyStore::new();
        assert!(store.contains("anything").is_err());
    }

    #[test]
    fn registry_creates_by_name() {
        let mut registry = KeyStoreRegistry::new();
        registry.register(Box::new(MemoryKeyStoreProvider));

        assert!(registry.create("memory").is_ok());
        assert!(registry.create("keychain").is_err());
    }

    #[test]
    fn file_store_roundtrip() {
        let root = std::env::temp_dir().join(format!("cryptsync-keystore-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&root);

        let mut store = FileKeyStore::new(&root);
        store.open().unwrap();

        store
            .store_private_key("device/abc/crypt-key", b"der bytes")
            .unwrap();
        assert_eq!(
            store.load_private_key("device/abc/crypt-key").unwrap().as_slice(),
            b"der bytes"
        );
        assert_eq!(
            store.labels_with_prefix("device/abc/").unwrap(),
            vec!["device/abc/crypt-key".to_string()]
        );

        store.remove_private_key("device/abc/crypt-key").unwrap();
        assert!(!store.contains("device/abc/crypt-key").unwrap());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn file_store_rejects_escaping_labels() {
        let mut store = FileKeyStore::new(std::env::temp_dir());
        store.open().unwrap();
        assert!(store.store_private_key("../outside", b"x").is_err());
        assert!(store.load_private_key("a//b").is_err());
    }
}
