//! The crypto controller owns and guards all key material for one device:
//! the asymmetric identity keypairs, the versioned symmetric secrets, and
//! the RNG. Key bytes never leave this module except as PKCS#8 blobs handed
//! to the key store or ciphertexts produced for peers.

use crate::crypto::keystore::{KeyStore, KeyStoreRegistry};
use crate::crypto::primitives::{
    self, encrypt_for, verify_signature, EncryptionKeyPair, EncryptionScheme, KeyParams,
    SecretKey, SeededRng, SignatureScheme, SigningKeyPair, MAC_SCHEME_AES_CMAC,
};
use crate::crypto::{CryptoError, Result};
use crate::protocol::messages::{encode_signed, Message};
use hkdf::Hkdf;
use rand::RngCore;
use sha3::Sha3_256;
use std::collections::HashMap;
use uuid::Uuid;

/// Wire name of the symmetric cipher suite used for dataset payloads.
pub const SYM_SCHEME: &str = "AES-256-GCM";

fn sign_key_label(device_id: Uuid) -> String {
    format!("device/{device_id}/sign-key")
}

fn crypt_key_label(device_id: Uuid) -> String {
    format!("device/{device_id}/crypt-key")
}

fn sym_key_label(device_id: Uuid, index: u32) -> String {
    format!("device/{device_id}/key/{index}")
}

/// Owns device key material, the current and staged symmetric secrets, and
/// the controller RNG.
pub struct CryptoController {
    store: Option<Box<dyn KeyStore>>,
    rng: SeededRng,
    key_params: KeyParams,
    sign_pair: Option<SigningKeyPair>,
    crypt_pair: Option<EncryptionKeyPair>,
    secrets: HashMap<u32, SecretKey>,
    current: u32,
    next: Option<(u32, SecretKey)>,
    fingerprint: Option<Vec<u8>>,
}

impl CryptoController {
    pub fn new() -> Self {
        Self {
            store: None,
            rng: SeededRng::new(),
            key_params: KeyParams::default(),
            sign_pair: None,
            crypt_pair: None,
            secrets: HashMap::new(),
            current: 0,
            next: None,
            fingerprint: None,
        }
    }

    pub fn with_key_params(mut self, params: KeyParams) -> Self {
        self.key_params = params;
        self
    }

    /// Acquire the key store from the registry and open it.
    pub fn initialize(&mut self, registry: &KeyStoreRegistry, provider: &str) -> Result<()> {
        let mut store = registry.create(provider)?;
        store.open()?;
        self.store = Some(store);
        Ok(())
    }

    /// Release the key store and wipe in-memory key material.
    pub fn finalize(&mut self) {
        if let Some(store) = self.store.as_mut() {
            store.close();
        }
        self.store = None;
        self.clear_key_material();
    }

    fn store_mut(&mut self) -> Result<&mut Box<dyn KeyStore>> {
        self.store
            .as_mut()
            .ok_or_else(|| CryptoError::KeyStoreUnavailable("no key store acquired".to_string()))
    }

    fn store_ref(&self) -> Result<&dyn KeyStore> {
        self.store
            .as_deref()
            .ok_or_else(|| CryptoError::KeyStoreUnavailable("no key store acquired".to_string()))
    }

    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    pub fn has_key_material(&self) -> bool {
        self.sign_pair.is_some() && self.crypt_pair.is_some()
    }

    fn sign_pair(&self) -> Result<&SigningKeyPair> {
        self.sign_pair.as_ref().ok_or(CryptoError::NoKeyMaterial)
    }

    fn crypt_pair(&self) -> Result<&EncryptionKeyPair> {
        self.crypt_pair.as_ref().ok_or(CryptoError::NoKeyMaterial)
    }

    fn secret(&self, index: u32) -> Result<&SecretKey> {
        self.secrets
            .get(&index)
            .ok_or(CryptoError::UnknownKeyIndex(index))
    }

    /// Index of the current symmetric secret.
    pub fn key_index(&self) -> Result<u32> {
        if self.secrets.is_empty() {
            Err(CryptoError::NoKeyMaterial)
        } else {
            Ok(self.current)
        }
    }

    /// Drop all in-memory key material. The key store is untouched.
    pub fn clear_key_material(&mut self) {
        self.sign_pair = None;
        self.crypt_pair = None;
        self.secrets.clear();
        self.current = 0;
        self.next = None;
        self.fingerprint = None;
    }

    /// Load private keys and symmetric secrets for a registered device.
    pub fn load_key_material(
        &mut self,
        device_id: Uuid,
        sign_scheme: &str,
        crypt_scheme: &str,
    ) -> Result<()> {
        self.clear_key_material();

        let sign_scheme = SignatureScheme::from_name(sign_scheme)?;
        let crypt_scheme = EncryptionScheme::from_name(crypt_scheme)?;

        let sign_der = self.store_ref()?.load_private_key(&sign_key_label(device_id))?;
        let crypt_der = self
            .store_ref()?
            .load_private_key(&crypt_key_label(device_id))?;

        self.sign_pair = Some(SigningKeyPair::from_pkcs8_der(sign_scheme, &sign_der)?);
        self.crypt_pair = Some(EncryptionKeyPair::from_pkcs8_der(crypt_scheme, &crypt_der)?);

        // Symmetric secrets are stored one label per index; the highest
        // index is the current key.
        let prefix = format!("device/{device_id}/key/");
        for label in self.store_ref()?.labels_with_prefix(&prefix)? {
            let index: u32 = label[prefix.len()..]
                .parse()
                .map_err(|_| CryptoError::KeyValidationFailed(format!("bad key label {label}")))?;
            let bytes = self.store_ref()?.load_private_key(&label)?;
            self.secrets.insert(index, SecretKey::from_bytes(&bytes)?);
            self.current = self.current.max(index);
        }
        if self.secrets.is_empty() {
            return Err(CryptoError::KeyStoreMissing(sym_key_label(device_id, 0)));
        }

        tracing::debug!(%device_id, key_index = self.current, "loaded private keys");
        Ok(())
    }

    /// Generate fresh device keypairs and the initial symmetric secret,
    /// seeding the RNG with the server nonce first.
    pub fn create_private_keys(
        &mut self,
        nonce: &[u8],
        sign_scheme: SignatureScheme,
        crypt_scheme: EncryptionScheme,
    ) -> Result<()> {
        self.clear_key_material();
        self.rng.incorporate(nonce);

        self.sign_pair = Some(SigningKeyPair::generate(
            sign_scheme,
            self.key_params,
            &mut self.rng,
        )?);
        self.crypt_pair = Some(EncryptionKeyPair::generate(
            crypt_scheme,
            self.key_params,
            &mut self.rng,
        )?);

        self.secrets
            .insert(0, SecretKey::generate(&mut self.rng));
        self.current = 0;

        tracing::debug!("generated new private keys");
        Ok(())
    }

    /// Persist private keys and symmetric secrets for the given device id.
    /// Returns the scheme names for the caller to persist in settings.
    pub fn store_private_keys(&mut self, device_id: Uuid) -> Result<(String, String)> {
        let sign_scheme = self.sign_pair()?.scheme().name().to_string();
        let crypt_scheme = self.crypt_pair()?.scheme().name().to_string();
        let sign_der = self.sign_pair()?.to_pkcs8_der()?;
        let crypt_der = self.crypt_pair()?.to_pkcs8_der()?;

        let store = self.store_mut()?;
        store.store_private_key(&sign_key_label(device_id), &sign_der)?;
        store.store_private_key(&crypt_key_label(device_id), &crypt_der)?;

        self.store_symmetric_keys(device_id)?;
        tracing::debug!(%device_id, "stored private keys");
        Ok((sign_scheme, crypt_scheme))
    }

    /// Persist all symmetric secrets (one label per index).
    pub fn store_symmetric_keys(&mut self, device_id: Uuid) -> Result<()> {
        let entries: Vec<(u32, SecretKey)> = self
            .secrets
            .iter()
            .map(|(i, k)| (*i, k.clone()))
            .collect();
        let store = self.store_mut()?;
        for (index, key) in entries {
            store.store_private_key(&sym_key_label(device_id, index), key.as_bytes())?;
        }
        Ok(())
    }

    /// Remove every stored key for the device and wipe memory.
    pub fn delete_key_material(&mut self, device_id: Uuid) -> Result<()> {
        let prefix = format!("device/{device_id}/");
        let labels = self.store_ref()?.labels_with_prefix(&prefix)?;
        let store = self.store_mut()?;
        for label in labels {
            store.remove_private_key(&label)?;
        }
        self.clear_key_material();
        tracing::info!(%device_id, "deleted key material");
        Ok(())
    }

    /// Cached SHA3-256 fingerprint over scheme names and public key material.
    pub fn fingerprint(&mut self) -> Result<Vec<u8>> {
        if let Some(fp) = &self.fingerprint {
            return Ok(fp.clone());
        }
        let fp = primitives::fingerprint(
            self.sign_pair()?.scheme().name(),
            &self.sign_pair()?.public_spki_der()?,
            self.crypt_pair()?.scheme().name(),
            &self.crypt_pair()?.public_spki_der()?,
        );
        self.fingerprint = Some(fp.clone());
        Ok(fp)
    }

    pub fn sign_scheme(&self) -> Result<&'static str> {
        Ok(self.sign_pair()?.scheme().name())
    }

    pub fn crypt_scheme(&self) -> Result<&'static str> {
        Ok(self.crypt_pair()?.scheme().name())
    }

    pub fn sign_key_spki(&self) -> Result<Vec<u8>> {
        self.sign_pair()?.public_spki_der()
    }

    pub fn crypt_key_spki(&self) -> Result<Vec<u8>> {
        self.crypt_pair()?.public_spki_der()
    }

    /// Draw random bytes from the controller RNG.
    pub fn random_bytes(&mut self, count: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; count];
        self.rng.fill_bytes(&mut bytes);
        bytes
    }

    /// Serialize a message into a signed envelope.
    pub fn serialize_signed_message(&mut self, message: &Message) -> Result<Vec<u8>> {
        let body = message.encode();
        let pair = self.sign_pair.as_ref().ok_or(CryptoError::NoKeyMaterial)?;
        let signature = pair.sign(&mut self.rng, &body)?;
        Ok(encode_signed(body, &signature))
    }

    /// Proof of possession of a symmetric secret: a cmac over this device's
    /// encoded public signing key under the key at `index` (current if None).
    pub fn generate_encryption_key_cmac(&self, index: Option<u32>) -> Result<Vec<u8>> {
        let index = match index {
            Some(i) => i,
            None => self.key_index()?,
        };
        let key = match &self.next {
            Some((staged, staged_key)) if *staged == index => staged_key,
            _ => self.secret(index)?,
        };
        let sign_key = self.sign_pair()?.public_spki_der()?;
        Ok(primitives::compute_cmac(key, &sign_key))
    }

    /// Verify a peer's possession proof of the key at `index` against the
    /// peer's encoded public signing key.
    pub fn verify_peer_key_cmac(&self, index: u32, peer_sign_key: &[u8], cmac: &[u8]) -> Result<()> {
        primitives::verify_cmac(self.secret(index)?, peer_sign_key, cmac)
    }

    /// Compute a cmac over arbitrary data with the key at `index`.
    pub fn create_cmac(&self, index: u32, data: &[u8]) -> Result<Vec<u8>> {
        Ok(primitives::compute_cmac(self.secret(index)?, data))
    }

    /// Verify a cmac over arbitrary data with the key at `index`.
    pub fn verify_cmac(&self, index: u32, data: &[u8], cmac: &[u8]) -> Result<()> {
        primitives::verify_cmac(self.secret(index)?, data, cmac)
    }

    /// Encrypt a payload under the current symmetric secret.
    pub fn encrypt_data(&self, plaintext: &[u8]) -> Result<(u32, Vec<u8>, Vec<u8>)> {
        let index = self.key_index()?;
        let (salt, ciphertext) = primitives::encrypt_payload(self.secret(index)?, plaintext)?;
        Ok((index, salt, ciphertext))
    }

    /// Decrypt a payload under the secret the sender used.
    pub fn decrypt_data(&self, key_index: u32, salt: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        primitives::decrypt_payload(self.secret(key_index)?, salt, ciphertext)
    }

    /// Stage the next symmetric secret. Idempotent while a stage exists.
    pub fn generate_next_key(&mut self) -> Result<(u32, &'static str)> {
        if let Some((index, _)) = &self.next {
            return Ok((*index, SYM_SCHEME));
        }
        let index = self.key_index()? + 1;
        let key = SecretKey::generate(&mut self.rng);
        self.next = Some((index, key));
        Ok((index, SYM_SCHEME))
    }

    /// Promote the staged secret to current. The index must match the stage.
    pub fn activate_next_key(&mut self, index: u32) -> Result<()> {
        match self.next.take() {
            Some((staged, key)) if staged == index => {
                self.secrets.insert(index, key);
                self.current = index;
                tracing::debug!(key_index = index, "activated next key");
                Ok(())
            }
            Some((staged, key)) => {
                self.next = Some((staged, key));
                Err(CryptoError::KeyIndexMismatch {
                    expected: staged,
                    got: index,
                })
            }
            None => Err(CryptoError::UnknownKeyIndex(index)),
        }
    }

    /// Encrypt the secret at `index` (staged or installed) for a peer.
    pub fn encrypt_secret_key(
        &mut self,
        index: u32,
        peer_scheme: &str,
        peer_crypt_key: &[u8],
    ) -> Result<Vec<u8>> {
        let scheme = EncryptionScheme::from_name(peer_scheme)?;
        let key = match &self.next {
            Some((staged, staged_key)) if *staged == index => staged_key.clone(),
            _ => self.secret(index)?.clone(),
        };
        encrypt_for(scheme, peer_crypt_key, &mut self.rng, key.as_bytes())
    }

    /// Install a secret received from a peer, decrypting it with our
    /// encryption key. Activates it only if strictly newer and requested.
    pub fn decrypt_secret_key(
        &mut self,
        index: u32,
        scheme: &str,
        ciphertext: &[u8],
        activate_if_newer: bool,
    ) -> Result<()> {
        if scheme != SYM_SCHEME {
            return Err(CryptoError::UnsupportedScheme(scheme.to_string()));
        }
        let plain = self.crypt_pair()?.decrypt(ciphertext)?;
        let key = SecretKey::from_bytes(&plain)?;
        self.secrets.insert(index, key);
        if activate_if_newer && index >= self.current {
            self.current = index;
        }
        Ok(())
    }

    /// Promote the installed key at `index` to current if it is newer.
    pub fn activate_installed_key(&mut self, index: u32) -> Result<()> {
        self.secret(index)?;
        if index >= self.current {
            self.current = index;
        }
        Ok(())
    }

    /// Derive (trusted, from a password) or generate (untrusted) an export
    /// key. Returns the mac scheme name, the salt, and the key.
    pub fn generate_export_key(&mut self, password: Option<&str>) -> Result<(String, Vec<u8>, SecretKey)> {
        let mut salt = vec![0u8; 16];
        self.rng.fill_bytes(&mut salt);
        let key = match password {
            Some(password) => derive_export_key(password, &salt)?,
            None => SecretKey::generate(&mut self.rng),
        };
        Ok((MAC_SCHEME_AES_CMAC.to_string(), salt, key))
    }

    /// Cmac over export sign data with the export key.
    pub fn create_export_cmac(&self, scheme: &str, key: &SecretKey, data: &[u8]) -> Result<Vec<u8>> {
        if scheme != MAC_SCHEME_AES_CMAC {
            return Err(CryptoError::UnsupportedScheme(scheme.to_string()));
        }
        Ok(primitives::compute_cmac(key, data))
    }

    /// Verify an import cmac against the export key.
    pub fn verify_import_cmac(
        &self,
        scheme: &str,
        key: &SecretKey,
        data: &[u8],
        cmac: &[u8],
    ) -> Result<()> {
        if scheme != MAC_SCHEME_AES_CMAC {
            return Err(CryptoError::UnsupportedScheme(scheme.to_string()));
        }
        primitives::verify_cmac(key, data, cmac)
    }

    /// Trustmac over this device's own public key material (import side).
    pub fn create_trust_cmac(&self, scheme: &str, key: &SecretKey) -> Result<Vec<u8>> {
        let data = trust_mac_data(
            self.sign_pair()?.scheme().name(),
            &self.sign_pair()?.public_spki_der()?,
            self.crypt_pair()?.scheme().name(),
            &self.crypt_pair()?.public_spki_der()?,
        );
        self.create_export_cmac(scheme, key, &data)
    }

    /// Verify a trustmac over a peer's public key material (export side).
    #[allow(clippy::too_many_arguments)]
    pub fn verify_trust_cmac(
        &self,
        scheme: &str,
        key: &SecretKey,
        peer_sign_scheme: &str,
        peer_sign_key: &[u8],
        peer_crypt_scheme: &str,
        peer_crypt_key: &[u8],
        cmac: &[u8],
    ) -> Result<()> {
        let data = trust_mac_data(peer_sign_scheme, peer_sign_key, peer_crypt_scheme, peer_crypt_key);
        self.verify_import_cmac(scheme, key, &data, cmac)
    }

    /// Verify a peer's signed envelope (used by tests and the server).
    pub fn verify_peer_signature(
        scheme: &str,
        spki_der: &[u8],
        message: &[u8],
        signature: &[u8],
    ) -> Result<()> {
        verify_signature(SignatureScheme::from_name(scheme)?, spki_der, message, signature)
    }
}

impl Default for CryptoController {
    fn default() -> Self {
        Self::new()
    }
}

/// Derive the trusted export key from a password and salt. The importing
/// device runs the same derivation from the user-entered password.
pub fn derive_export_key(password: &str, salt: &[u8]) -> Result<SecretKey> {
    let hkdf = Hkdf::<Sha3_256>::new(Some(salt), password.as_bytes());
    let mut bytes = [0u8; 32];
    hkdf.expand(b"cryptsync-export-v1", &mut bytes)
        .map_err(|e| CryptoError::operation("derive export key", e))?;
    SecretKey::from_bytes(&bytes)
}

fn trust_mac_data(
    sign_scheme: &str,
    sign_key: &[u8],
    crypt_scheme: &str,
    crypt_key: &[u8],
) -> Vec<u8> {
    let mut data =
        Vec::with_capacity(sign_scheme.len() + sign_key.len() + crypt_scheme.len() + crypt_key.len());
    data.extend_from_slice(sign_scheme.as_bytes());
    data.extend_from_slice(sign_key);
    data.extend_from_slice(crypt_scheme.as_bytes());
    data.extend_from_slice(crypt_key);
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keystore::MemoryKeyStoreProvider;
    use crate::protocol::messages::{decode_signed, LoginMessage};

    fn registry() -> KeyStoreRegistry {
        let mut registry = KeyStoreRegistry::new();
        registry.register(Box::new(MemoryKeyStoreProvider));
        registry
    }

    fn controller_with_keys() -> CryptoController {
        let registry = registry();
        let mut controller = CryptoController::new();
        controller.initialize(&registry, "memory").unwrap();
        controller
            .create_private_keys(
                &[0x42; 32],
                SignatureScheme::EcdsaP256Sha3_512,
                EncryptionScheme::RsaOaepSha3_512,
            )
            .unwrap();
        controller
    }

    #[test]
    fn fresh_keys_start_at_index_zero() {
        let controller = controller_with_keys();
        assert_eq!(controller.key_index().unwrap(), 0);
    }

    #[test]
    fn fingerprint_is_cached_and_stable() {
        let mut controller = controller_with_keys();
        let first = controller.fingerprint().unwrap();
        let second = controller.fingerprint().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 32);
    }

    #[test]
    fn store_and_load_roundtrip() {
        // A single registry-provider pair cannot hand the same memory store
        // to two controllers, so store and reload through one controller.
        let registry = registry();
        let mut controller = CryptoController::new();
        controller.initialize(&registry, "memory").unwrap();
        controller
            .create_private_keys(
                &[1; 32],
                SignatureScheme::EcdsaP256Sha3_512,
                EncryptionScheme::RsaOaepSha3_512,
            )
            .unwrap();

        let device_id = Uuid::new_v4();
        let (sign_scheme, crypt_scheme) = controller.store_private_keys(device_id).unwrap();
        let fingerprint = controller.fingerprint().unwrap();

        controller.clear_key_material();
        assert!(!controller.has_key_material());

        controller
            .load_key_material(device_id, &sign_scheme, &crypt_scheme)
            .unwrap();
        assert_eq!(controller.fingerprint().unwrap(), fingerprint);
        assert_eq!(controller.key_index().unwrap(), 0);
    }

    #[test]
    fn missing_key_material_reports_key_store_missing() {
        let registry = registry();
        let mut controller = CryptoController::new();
        controller.initialize(&registry, "memory").unwrap();

        let result = controller.load_key_material(
            Uuid::new_v4(),
            primitives::SIGN_SCHEME_ECDSA_P256,
            primitives::CRYPT_SCHEME_RSA_OAEP,
        );
        assert!(matches!(result, Err(CryptoError::KeyStoreMissing(_))));
    }

    #[test]
    fn encrypt_decrypt_data_roundtrip() {
        let controller = controller_with_keys();
        let (index, salt, ciphertext) = controller.encrypt_data(b"payload bytes").unwrap();
        assert_eq!(index, 0);
        let plain = controller.decrypt_data(index, &salt, &ciphertext).unwrap();
        assert_eq!(plain, b"payload bytes");
    }

    #[test]
    fn decrypt_unknown_index_fails() {
        let controller = controller_with_keys();
        let (_, salt, ciphertext) = controller.encrypt_data(b"payload").unwrap();
        assert!(matches!(
            controller.decrypt_data(7, &salt, &ciphertext),
            Err(CryptoError::UnknownKeyIndex(7))
        ));
    }

    #[test]
    fn next_key_staging_and_activation() {
        let mut controller = controller_with_keys();

        let (index, scheme) = controller.generate_next_key().unwrap();
        assert_eq!(index, 1);
        assert_eq!(scheme, SYM_SCHEME);

        // Staging again returns the same index.
        assert_eq!(controller.generate_next_key().unwrap().0, 1);

        // Wrong index does not activate.
        assert!(controller.activate_next_key(2).is_err());
        assert_eq!(controller.key_index().unwrap(), 0);

        controller.activate_next_key(1).unwrap();
        assert_eq!(controller.key_index().unwrap(), 1);

        // The superseded key still decrypts old ciphertexts.
        let plain = b"old data";
        let (salt, ciphertext) = primitives::encrypt_payload(controller.secret(0).unwrap(), plain).unwrap();
        assert_eq!(controller.decrypt_data(0, &salt, &ciphertext).unwrap(), plain);
    }

    #[test]
    fn secret_key_exchange_between_devices() {
        let mut a = controller_with_keys();
        let mut b = controller_with_keys();

        // A stages key 1 and encrypts it for B.
        let (index, scheme) = a.generate_next_key().unwrap();
        let cipher = a
            .encrypt_secret_key(index, b.crypt_scheme().unwrap(), &b.crypt_key_spki().unwrap())
            .unwrap();

        // B installs and activates it.
        b.decrypt_secret_key(index, scheme, &cipher, true).unwrap();
        a.activate_next_key(index).unwrap();
        assert_eq!(b.key_index().unwrap(), index);

        // Payloads now roundtrip across devices.
        let (key_index, salt, ciphertext) = a.encrypt_data(b"shared payload").unwrap();
        assert_eq!(b.decrypt_data(key_index, &salt, &ciphertext).unwrap(), b"shared payload");
    }

    #[test]
    fn key_cmac_proof_verifies_across_devices() {
        let mut a = controller_with_keys();
        let mut b = controller_with_keys();

        // Share key 1 so both controllers hold the same secret.
        let (index, scheme) = a.generate_next_key().unwrap();
        let cipher = a
            .encrypt_secret_key(index, b.crypt_scheme().unwrap(), &b.crypt_key_spki().unwrap())
            .unwrap();
        b.decrypt_secret_key(index, scheme, &cipher, true).unwrap();
        a.activate_next_key(index).unwrap();

        // B proves possession; A verifies against B's public signing key.
        let proof = b.generate_encryption_key_cmac(None).unwrap();
        a.verify_peer_key_cmac(index, &b.sign_key_spki().unwrap(), &proof)
            .unwrap();

        // A cannot verify with its own signing key as mac data.
        assert!(a
            .verify_peer_key_cmac(index, &a.sign_key_spki().unwrap(), &proof)
            .is_err());
    }

    #[test]
    fn signed_message_envelope_verifies() {
        let mut controller = controller_with_keys();
        let message = Message::Login(LoginMessage {
            device_id: Uuid::new_v4(),
            device_name: "host-1".to_string(),
            nonce: vec![7; 32],
        });

        let framed = controller.serialize_signed_message(&message).unwrap();
        let signed = decode_signed(&framed).unwrap();
        assert_eq!(signed.message, message);

        CryptoController::verify_peer_signature(
            controller.sign_scheme().unwrap(),
            &controller.sign_key_spki().unwrap(),
            &framed[..signed.signed_len],
            &signed.signature,
        )
        .unwrap();
    }

    #[test]
    fn export_cmac_trusted_derivation_is_deterministic() {
        let mut controller = controller_with_keys();
        let (scheme, salt, key) = controller.generate_export_key(Some("passphrase")).unwrap();

        // Same password and salt derive the same key.
        let derived = derive_export_key("passphrase", &salt).unwrap();
        assert_eq!(key.as_bytes(), derived.as_bytes());

        let data = b"export sign data";
        let cmac = controller.create_export_cmac(&scheme, &key, data).unwrap();
        controller
            .verify_import_cmac(&scheme, &key, data, &cmac)
            .unwrap();
        assert!(controller
            .verify_import_cmac(&scheme, &key, b"other data", &cmac)
            .is_err());
    }

    #[test]
    fn trust_cmac_roundtrip() {
        let mut importer = controller_with_keys();
        let exporter = controller_with_keys();
        let (scheme, _salt, key) = importer.generate_export_key(None).unwrap();

        let trustmac = importer.create_trust_cmac(&scheme, &key).unwrap();
        exporter
            .verify_trust_cmac(
                &scheme,
                &key,
                importer.sign_scheme().unwrap(),
                &importer.sign_key_spki().unwrap(),
                importer.crypt_scheme().unwrap(),
                &importer.crypt_key_spki().unwrap(),
                &trustmac,
            )
            .unwrap();
    }
}
