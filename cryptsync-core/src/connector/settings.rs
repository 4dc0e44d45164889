//! Typed settings facade over an injected flat key/value store.
//!
//! The recognized option keys are fixed; everything else the connector
//! persists goes through these accessors. Binary values are base64 encoded,
//! the backend only ever sees strings.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

/// Recognized option keys.
pub mod keys {
    pub const ENABLED: &str = "enabled";
    pub const REMOTE_GROUP: &str = "remote/";
    pub const REMOTE_URL: &str = "remote/url";
    pub const ACCESS_KEY: &str = "remote/accessKey";
    pub const HEADERS_GROUP: &str = "remote/headers/";
    pub const KEEPALIVE_TIMEOUT: &str = "remote/keepaliveTimeout";
    pub const DEVICE_ID: &str = "deviceId";
    pub const DEVICE_NAME: &str = "deviceName";
    pub const SIGN_SCHEME: &str = "scheme/signing";
    pub const CRYPT_SCHEME: &str = "scheme/encryption";
    pub const SEND_CMAC: &str = "sendCmac";
    pub const IMPORT_GROUP: &str = "import/";
    pub const IMPORT_NONCE: &str = "import/nonce";
    pub const IMPORT_PARTNER: &str = "import/partner";
    pub const IMPORT_SCHEME: &str = "import/scheme";
    pub const IMPORT_CMAC: &str = "import/cmac";
    pub const IMPORT_KEY: &str = "import/key";
}

/// Flat key/value persistence, injected by the embedding application.
pub trait SettingsBackend: Send {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&mut self, key: &str, value: &str);

    fn remove(&mut self, key: &str);

    /// Remove every key under the given prefix.
    fn remove_group(&mut self, prefix: &str);

    /// All keys under the given prefix.
    fn keys_in_group(&self, prefix: &str) -> Vec<String>;
}

/// In-memory backend, mainly for tests.
#[derive(Default)]
pub struct MemorySettings {
    values: BTreeMap<String, String>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsBackend for MemorySettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    fn remove(&mut self, key: &str) {
        self.values.remove(key);
    }

    fn remove_group(&mut self, prefix: &str) {
        self.values.retain(|k, _| !k.starts_with(prefix));
    }

    fn keys_in_group(&self, prefix: &str) -> Vec<String> {
        self.values
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }
}

/// Backend persisting the flat map as a single JSON object file. Writes go
/// straight to disk; the file is created on first write.
pub struct JsonFileSettings {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl JsonFileSettings {
    pub fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let values = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e),
        };
        Ok(Self { path, values })
    }

    fn flush(&self) {
        let result = serde_json::to_vec_pretty(&self.values)
            .map_err(std::io::Error::other)
            .and_then(|bytes| {
                if let Some(parent) = self.path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&self.path, bytes)
            });
        if let Err(e) = result {
            tracing::error!(path = %self.path.display(), "failed to persist settings: {e}");
        }
    }
}

impl SettingsBackend for JsonFileSettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
        self.flush();
    }

    fn remove(&mut self, key: &str) {
        if self.values.remove(key).is_some() {
            self.flush();
        }
    }

    fn remove_group(&mut self, prefix: &str) {
        let before = self.values.len();
        self.values.retain(|k, _| !k.starts_with(prefix));
        if self.values.len() != before {
            self.flush();
        }
    }

    fn keys_in_group(&self, prefix: &str) -> Vec<String> {
        self.values
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }
}

/// Typed accessors over a settings backend.
pub struct Settings {
    backend: Box<dyn SettingsBackend>,
}

impl Settings {
    pub fn new(backend: Box<dyn SettingsBackend>) -> Self {
        Self { backend }
    }

    // -- remote configuration ------------------------------------------------

    pub fn enabled(&self) -> bool {
        match self.backend.get(keys::ENABLED).as_deref() {
            Some("false") => false,
            Some(_) => true,
            None => true,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.backend
            .set(keys::ENABLED, if enabled { "true" } else { "false" });
    }

    pub fn remote_url(&self) -> Option<String> {
        self.backend.get(keys::REMOTE_URL)
    }

    pub fn set_remote_url(&mut self, url: &str) {
        self.backend.set(keys::REMOTE_URL, url);
    }

    pub fn access_key(&self) -> String {
        self.backend.get(keys::ACCESS_KEY).unwrap_or_default()
    }

    pub fn set_access_key(&mut self, key: &str) {
        self.backend.set(keys::ACCESS_KEY, key);
    }

    pub fn headers(&self) -> Vec<(String, Vec<u8>)> {
        self.backend
            .keys_in_group(keys::HEADERS_GROUP)
            .into_iter()
            .filter_map(|key| {
                let value = self.backend.get(&key)?;
                let decoded = BASE64.decode(value).ok()?;
                Some((key[keys::HEADERS_GROUP.len()..].to_string(), decoded))
            })
            .collect()
    }

    pub fn set_header(&mut self, name: &str, value: &[u8]) {
        self.backend.set(
            &format!("{}{name}", keys::HEADERS_GROUP),
            &BASE64.encode(value),
        );
    }

    /// Keepalive interval in minutes; 0 disables the timer.
    pub fn keepalive_timeout(&self) -> u32 {
        self.backend
            .get(keys::KEEPALIVE_TIMEOUT)
            .and_then(|v| v.parse().ok())
            .unwrap_or(1)
    }

    pub fn set_keepalive_timeout(&mut self, minutes: u32) {
        self.backend
            .set(keys::KEEPALIVE_TIMEOUT, &minutes.to_string());
    }

    pub fn remove_remote_config(&mut self) {
        self.backend.remove_group(keys::REMOTE_GROUP);
    }

    // -- device identity -----------------------------------------------------

    pub fn device_id(&self) -> Option<Uuid> {
        self.backend
            .get(keys::DEVICE_ID)
            .and_then(|v| Uuid::parse_str(&v).ok())
    }

    pub fn set_device_id(&mut self, device_id: Uuid) {
        self.backend.set(keys::DEVICE_ID, &device_id.to_string());
    }

    pub fn remove_device_id(&mut self) {
        self.backend.remove(keys::DEVICE_ID);
    }

    pub fn device_name(&self) -> String {
        self.backend
            .get(keys::DEVICE_NAME)
            .or_else(|| std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()))
            .unwrap_or_else(|| "unknown-host".to_string())
    }

    pub fn set_device_name(&mut self, name: &str) {
        self.backend.set(keys::DEVICE_NAME, name);
    }

    pub fn sign_scheme(&self) -> Option<String> {
        self.backend.get(keys::SIGN_SCHEME)
    }

    pub fn crypt_scheme(&self) -> Option<String> {
        self.backend.get(keys::CRYPT_SCHEME)
    }

    pub fn set_schemes(&mut self, sign_scheme: &str, crypt_scheme: &str) {
        self.backend.set(keys::SIGN_SCHEME, sign_scheme);
        self.backend.set(keys::CRYPT_SCHEME, crypt_scheme);
    }

    pub fn send_cmac(&self) -> bool {
        matches!(self.backend.get(keys::SEND_CMAC).as_deref(), Some("true"))
    }

    pub fn set_send_cmac(&mut self, value: bool) {
        if value {
            self.backend.set(keys::SEND_CMAC, "true");
        } else {
            self.backend.remove(keys::SEND_CMAC);
        }
    }

    // -- pending import ------------------------------------------------------

    pub fn import_nonce(&self) -> Option<Vec<u8>> {
        self.backend
            .get(keys::IMPORT_NONCE)
            .and_then(|v| BASE64.decode(v).ok())
    }

    pub fn import_partner(&self) -> Option<Uuid> {
        self.backend
            .get(keys::IMPORT_PARTNER)
            .and_then(|v| Uuid::parse_str(&v).ok())
    }

    pub fn import_scheme(&self) -> Option<String> {
        self.backend.get(keys::IMPORT_SCHEME)
    }

    pub fn import_cmac(&self) -> Option<Vec<u8>> {
        self.backend
            .get(keys::IMPORT_CMAC)
            .and_then(|v| BASE64.decode(v).ok())
    }

    pub fn import_key(&self) -> Option<Vec<u8>> {
        self.backend
            .get(keys::IMPORT_KEY)
            .and_then(|v| BASE64.decode(v).ok())
    }

    pub fn set_import(
        &mut self,
        nonce: &[u8],
        partner: Uuid,
        scheme: &str,
        cmac: &[u8],
        key: Option<&[u8]>,
    ) {
        self.backend.set(keys::IMPORT_NONCE, &BASE64.encode(nonce));
        self.backend.set(keys::IMPORT_PARTNER, &partner.to_string());
        self.backend.set(keys::IMPORT_SCHEME, scheme);
        self.backend.set(keys::IMPORT_CMAC, &BASE64.encode(cmac));
        match key {
            Some(key) => self.backend.set(keys::IMPORT_KEY, &BASE64.encode(key)),
            None => self.backend.remove(keys::IMPORT_KEY),
        }
    }

    pub fn clear_import(&mut self) {
        self.backend.remove_group(keys::IMPORT_GROUP);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings::new(Box::new(MemorySettings::new()))
    }

    #[test]
    fn defaults_match_contract() {
        let s = settings();
        assert!(s.enabled());
        assert_eq!(s.keepalive_timeout(), 1);
        assert!(!s.send_cmac());
        assert!(s.device_id().is_none());
        assert!(s.remote_url().is_none());
        assert_eq!(s.access_key(), "");
        assert!(!s.device_name().is_empty());
    }

    #[test]
    fn device_id_roundtrip() {
        let mut s = settings();
        let id = Uuid::new_v4();
        s.set_device_id(id);
        assert_eq!(s.device_id(), Some(id));
        s.remove_device_id();
        assert!(s.device_id().is_none());
    }

    #[test]
    fn headers_encode_as_base64() {
        let mut s = settings();
        s.set_header("X-Auth", b"\x00\x01binary");
        s.set_header("X-Other", b"text");

        let mut headers = s.headers();
        headers.sort();
        assert_eq!(
            headers,
            vec![
                ("X-Auth".to_string(), b"\x00\x01binary".to_vec()),
                ("X-Other".to_string(), b"text".to_vec()),
            ]
        );
    }

    #[test]
    fn import_group_roundtrip_and_clear() {
        let mut s = settings();
        let partner = Uuid::new_v4();
        s.set_import(b"nonce", partner, "CMAC/AES-256", b"cmac", Some(b"key"));

        assert_eq!(s.import_nonce().unwrap(), b"nonce");
        assert_eq!(s.import_partner(), Some(partner));
        assert_eq!(s.import_scheme().unwrap(), "CMAC/AES-256");
        assert_eq!(s.import_cmac().unwrap(), b"cmac");
        assert_eq!(s.import_key().unwrap(), b"key");

        s.clear_import();
        assert!(s.import_nonce().is_none());
        assert!(s.import_key().is_none());
    }

    #[test]
    fn untrusted_import_has_no_key() {
        let mut s = settings();
        s.set_import(b"n", Uuid::new_v4(), "CMAC/AES-256", b"c", Some(b"stale"));
        s.set_import(b"n", Uuid::new_v4(), "CMAC/AES-256", b"c", None);
        assert!(s.import_key().is_none());
    }

    #[test]
    fn remove_remote_config_keeps_device_identity() {
        let mut s = settings();
        let id = Uuid::new_v4();
        s.set_device_id(id);
        s.set_remote_url("wss://sync.example.org");
        s.set_access_key("secret");
        s.set_keepalive_timeout(5);

        s.remove_remote_config();
        assert!(s.remote_url().is_none());
        assert_eq!(s.access_key(), "");
        assert_eq!(s.keepalive_timeout(), 1);
        assert_eq!(s.device_id(), Some(id));
    }

    #[test]
    fn json_file_backend_persists() {
        let path = std::env::temp_dir().join(format!("cryptsync-settings-{}.json", std::process::id()));
        let _ = std::fs::remove_file(&path);

        {
            let mut backend = JsonFileSettings::open(&path).unwrap();
            backend.set("deviceName", "host-1");
            backend.set("remote/url", "wss://sync.example.org");
        }
        {
            let backend = JsonFileSettings::open(&path).unwrap();
            assert_eq!(backend.get("deviceName").unwrap(), "host-1");
            assert_eq!(backend.get("remote/url").unwrap(), "wss://sync.example.org");
        }

        let _ = std::fs::remove_file(&path);
    }
}
