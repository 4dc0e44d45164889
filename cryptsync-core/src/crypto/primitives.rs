//! Scheme registry and primitive operations: signing, asymmetric encryption,
//! key-possession CMACs, payload encryption, and the seedable controller RNG.
//!
//! Private keys are handled as PKCS#8 DER blobs, public keys as X.509 SPKI
//! DER blobs. All signatures and OAEP labels use SHA3-512; fingerprints use
//! SHA3-256.

use crate::crypto::{CryptoError, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use cmac::{Cmac, Mac};
use rand::rngs::{OsRng, StdRng};
use rand::{CryptoRng, RngCore, SeedableRng};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use sha3::{Digest, Sha3_256, Sha3_512};
use zeroize::{Zeroize, Zeroizing};

/// Wire name of the RSASSA-PSS/SHA3-512 signature scheme.
pub const SIGN_SCHEME_RSA_PSS: &str = "RSASSA-PSS/SHA3-512";
/// Wire name of the ECDSA P-256/SHA3-512 signature scheme.
pub const SIGN_SCHEME_ECDSA_P256: &str = "ECDSA_ECP_SHA3_512";
/// Wire name of the RSAES-OAEP/SHA3-512 encryption scheme.
pub const CRYPT_SCHEME_RSA_OAEP: &str = "RSAES-OAEP/SHA3-512";
/// Wire name of the AES-256-CMAC mac scheme.
pub const MAC_SCHEME_AES_CMAC: &str = "CMAC/AES-256";

/// Size of a symmetric secret in bytes.
pub const SECRET_KEY_SIZE: usize = 32;
/// Size of the AES-GCM salt (nonce) in bytes.
pub const SALT_SIZE: usize = 12;

/// Supported signature schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureScheme {
    RsaPssSha3_512,
    EcdsaP256Sha3_512,
}

impl SignatureScheme {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RsaPssSha3_512 => SIGN_SCHEME_RSA_PSS,
            Self::EcdsaP256Sha3_512 => SIGN_SCHEME_ECDSA_P256,
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            SIGN_SCHEME_RSA_PSS => Ok(Self::RsaPssSha3_512),
            SIGN_SCHEME_ECDSA_P256 => Ok(Self::EcdsaP256Sha3_512),
            other => Err(CryptoError::UnsupportedScheme(other.to_string())),
        }
    }
}

/// Supported asymmetric encryption schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionScheme {
    RsaOaepSha3_512,
}

impl EncryptionScheme {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RsaOaepSha3_512 => CRYPT_SCHEME_RSA_OAEP,
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            CRYPT_SCHEME_RSA_OAEP => Ok(Self::RsaOaepSha3_512),
            other => Err(CryptoError::UnsupportedScheme(other.to_string())),
        }
    }
}

/// Key generation parameters.
#[derive(Debug, Clone, Copy)]
pub struct KeyParams {
    /// Modulus size for RSA keypairs.
    pub rsa_bits: usize,
}

impl Default for KeyParams {
    fn default() -> Self {
        Self { rsa_bits: 2048 }
    }
}

/// RNG owned by the crypto controller. Seedable from OS entropy and able to
/// incorporate additional entropy (e.g. a server nonce) before key creation.
pub struct SeededRng {
    inner: StdRng,
}

impl SeededRng {
    pub fn new() -> Self {
        Self {
            inner: StdRng::from_entropy(),
        }
    }

    /// Fold extra entropy into the generator state.
    pub fn incorporate(&mut self, entropy: &[u8]) {
        let mut state = [0u8; 32];
        self.inner.fill_bytes(&mut state);
        let mut hasher = Sha3_256::new();
        hasher.update(state);
        hasher.update(entropy);
        let seed: [u8; 32] = hasher.finalize().into();
        state.zeroize();
        self.inner = StdRng::from_seed(seed);
    }
}

impl Default for SeededRng {
    fn default() -> Self {
        Self::new()
    }
}

impl RngCore for SeededRng {
    fn next_u32(&mut self) -> u32 {
        self.inner.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.inner.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.inner.fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> std::result::Result<(), rand::Error> {
        self.inner.try_fill_bytes(dest)
    }
}

impl CryptoRng for SeededRng {}

enum SignKey {
    RsaPss(rsa::RsaPrivateKey),
    EcdsaP256(p256::SecretKey),
}

/// A device signing keypair under one of the supported schemes.
pub struct SigningKeyPair {
    scheme: SignatureScheme,
    key: SignKey,
}

impl SigningKeyPair {
    /// Generate a fresh keypair from the given RNG.
    pub fn generate(scheme: SignatureScheme, params: KeyParams, rng: &mut SeededRng) -> Result<Self> {
        let key = match scheme {
            SignatureScheme::RsaPssSha3_512 => SignKey::RsaPss(
                rsa::RsaPrivateKey::new(rng, params.rsa_bits)
                    .map_err(|e| CryptoError::operation("generate signing key", e))?,
            ),
            SignatureScheme::EcdsaP256Sha3_512 => SignKey::EcdsaP256(p256::SecretKey::random(rng)),
        };
        let pair = Self { scheme, key };
        pair.validate()?;
        Ok(pair)
    }

    /// Decode a PKCS#8 private key blob.
    pub fn from_pkcs8_der(scheme: SignatureScheme, der: &[u8]) -> Result<Self> {
        let key = match scheme {
            SignatureScheme::RsaPssSha3_512 => SignKey::RsaPss(
                rsa::RsaPrivateKey::from_pkcs8_der(der)
                    .map_err(|e| CryptoError::KeyValidationFailed(e.to_string()))?,
            ),
            SignatureScheme::EcdsaP256Sha3_512 => SignKey::EcdsaP256(
                p256::SecretKey::from_pkcs8_der(der)
                    .map_err(|e| CryptoError::KeyValidationFailed(e.to_string()))?,
            ),
        };
        let pair = Self { scheme, key };
        pair.validate()?;
        Ok(pair)
    }

    fn validate(&self) -> Result<()> {
        if let SignKey::RsaPss(key) = &self.key {
            if rsa::traits::PublicKeyParts::size(key) * 8 < 2048 {
                return Err(CryptoError::KeyValidationFailed(
                    "RSA signing key below 2048 bits".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn scheme(&self) -> SignatureScheme {
        self.scheme
    }

    /// Encode the private key as a PKCS#8 DER blob.
    pub fn to_pkcs8_der(&self) -> Result<Zeroizing<Vec<u8>>> {
        let doc = match &self.key {
            SignKey::RsaPss(key) => key
                .to_pkcs8_der()
                .map_err(|e| CryptoError::operation("encode signing key", e))?,
            SignKey::EcdsaP256(key) => key
                .to_pkcs8_der()
                .map_err(|e| CryptoError::operation("encode signing key", e))?,
        };
        Ok(Zeroizing::new(doc.as_bytes().to_vec()))
    }

    /// Encode the public half as an X.509 SPKI DER blob.
    pub fn public_spki_der(&self) -> Result<Vec<u8>> {
        let doc = match &self.key {
            SignKey::RsaPss(key) => rsa::RsaPublicKey::from(key)
                .to_public_key_der()
                .map_err(|e| CryptoError::operation("encode public signing key", e))?,
            SignKey::EcdsaP256(key) => key
                .public_key()
                .to_public_key_der()
                .map_err(|e| CryptoError::operation("encode public signing key", e))?,
        };
        Ok(doc.as_bytes().to_vec())
    }

    /// Sign a message; the message is hashed with SHA3-512 internally.
    pub fn sign(&self, rng: &mut SeededRng, message: &[u8]) -> Result<Vec<u8>> {
        match &self.key {
            SignKey::RsaPss(key) => {
                let signer = rsa::pss::BlindedSigningKey::<Sha3_512>::new(key.clone());
                Ok(signer.sign_with_rng(rng, message).to_vec())
            }
            SignKey::EcdsaP256(key) => {
                let digest = Sha3_512::digest(message);
                let signer = p256::ecdsa::SigningKey::from(key);
                let signature: p256::ecdsa::Signature = signer
                    .sign_prehash(&digest)
                    .map_err(|e| CryptoError::operation("sign message", e))?;
                Ok(signature.to_der().as_bytes().to_vec())
            }
        }
    }
}

/// Verify a detached signature against an encoded public key.
pub fn verify_signature(
    scheme: SignatureScheme,
    spki_der: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<()> {
    match scheme {
        SignatureScheme::RsaPssSha3_512 => {
            let key = rsa::RsaPublicKey::from_public_key_der(spki_der)
                .map_err(|e| CryptoError::KeyValidationFailed(e.to_string()))?;
            let verifier = rsa::pss::VerifyingKey::<Sha3_512>::new(key);
            let signature = rsa::pss::Signature::try_from(signature)
                .map_err(|_| CryptoError::MacVerificationFailed)?;
            verifier
                .verify(message, &signature)
                .map_err(|_| CryptoError::MacVerificationFailed)
        }
        SignatureScheme::EcdsaP256Sha3_512 => {
            let key = p256::PublicKey::from_public_key_der(spki_der)
                .map_err(|e| CryptoError::KeyValidationFailed(e.to_string()))?;
            let verifier = p256::ecdsa::VerifyingKey::from(&key);
            let signature = p256::ecdsa::Signature::from_der(signature)
                .map_err(|_| CryptoError::MacVerificationFailed)?;
            let digest = Sha3_512::digest(message);
            verifier
                .verify_prehash(&digest, &signature)
                .map_err(|_| CryptoError::MacVerificationFailed)
        }
    }
}

enum CryptKey {
    RsaOaep(rsa::RsaPrivateKey),
}

/// A device encryption keypair.
pub struct EncryptionKeyPair {
    scheme: EncryptionScheme,
    key: CryptKey,
}

impl EncryptionKeyPair {
    pub fn generate(
        scheme: EncryptionScheme,
        params: KeyParams,
        rng: &mut SeededRng,
    ) -> Result<Self> {
        let key = match scheme {
            EncryptionScheme::RsaOaepSha3_512 => CryptKey::RsaOaep(
                rsa::RsaPrivateKey::new(rng, params.rsa_bits)
                    .map_err(|e| CryptoError::operation("generate encryption key", e))?,
            ),
        };
        Ok(Self { scheme, key })
    }

    pub fn from_pkcs8_der(scheme: EncryptionScheme, der: &[u8]) -> Result<Self> {
        let key = match scheme {
            EncryptionScheme::RsaOaepSha3_512 => CryptKey::RsaOaep(
                rsa::RsaPrivateKey::from_pkcs8_der(der)
                    .map_err(|e| CryptoError::KeyValidationFailed(e.to_string()))?,
            ),
        };
        Ok(Self { scheme, key })
    }

    pub fn scheme(&self) -> EncryptionScheme {
        self.scheme
    }

    pub fn to_pkcs8_der(&self) -> Result<Zeroizing<Vec<u8>>> {
        let CryptKey::RsaOaep(key) = &self.key;
        let doc = key
            .to_pkcs8_der()
            .map_err(|e| CryptoError::operation("encode encryption key", e))?;
        Ok(Zeroizing::new(doc.as_bytes().to_vec()))
    }

    pub fn public_spki_der(&self) -> Result<Vec<u8>> {
        let CryptKey::RsaOaep(key) = &self.key;
        let doc = rsa::RsaPublicKey::from(key)
            .to_public_key_der()
            .map_err(|e| CryptoError::operation("encode public encryption key", e))?;
        Ok(doc.as_bytes().to_vec())
    }

    /// Decrypt a message addressed to this device.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let CryptKey::RsaOaep(key) = &self.key;
        key.decrypt(rsa::Oaep::new::<Sha3_512>(), ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

/// Encrypt a message for a peer identified by its encoded public key.
pub fn encrypt_for(
    scheme: EncryptionScheme,
    spki_der: &[u8],
    rng: &mut SeededRng,
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    match scheme {
        EncryptionScheme::RsaOaepSha3_512 => {
            let key = rsa::RsaPublicKey::from_public_key_der(spki_der)
                .map_err(|e| CryptoError::KeyValidationFailed(e.to_string()))?;
            key.encrypt(rng, rsa::Oaep::new::<Sha3_512>(), plaintext)
                .map_err(|e| CryptoError::operation("encrypt for peer", e))
        }
    }
}

/// A 256-bit symmetric secret. Zeroized on drop.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct SecretKey([u8; SECRET_KEY_SIZE]);

impl SecretKey {
    pub fn generate(rng: &mut SeededRng) -> Self {
        let mut bytes = [0u8; SECRET_KEY_SIZE];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let array: [u8; SECRET_KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::KeyValidationFailed("secret key must be 32 bytes".to_string()))?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_KEY_SIZE] {
        &self.0
    }
}

/// Compute an AES-256-CMAC tag.
pub fn compute_cmac(key: &SecretKey, data: &[u8]) -> Vec<u8> {
    let mut mac = <Cmac<aes::Aes256> as Mac>::new(key.as_bytes().into());
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Verify an AES-256-CMAC tag in constant time.
pub fn verify_cmac(key: &SecretKey, data: &[u8], tag: &[u8]) -> Result<()> {
    let mut mac = <Cmac<aes::Aes256> as Mac>::new(key.as_bytes().into());
    mac.update(data);
    mac.verify_slice(tag)
        .map_err(|_| CryptoError::MacVerificationFailed)
}

/// Encrypt a payload under a symmetric secret.
///
/// Returns `(salt, ciphertext)`; the salt is a fresh random 12-byte GCM
/// nonce and the ciphertext carries the appended auth tag.
pub fn encrypt_payload(key: &SecretKey, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&salt), plaintext)
        .map_err(|e| CryptoError::operation("encrypt payload", e))?;
    Ok((salt.to_vec(), ciphertext))
}

/// Decrypt a payload under a symmetric secret.
pub fn decrypt_payload(key: &SecretKey, salt: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if salt.len() != SALT_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }
    let cipher = Aes256Gcm::new(key.as_bytes().into());
    cipher
        .decrypt(Nonce::from_slice(salt), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Compute the device fingerprint: SHA3-256 over the concatenated scheme
/// names and encoded public keys.
pub fn fingerprint(
    sign_scheme: &str,
    sign_key: &[u8],
    crypt_scheme: &str,
    crypt_key: &[u8],
) -> Vec<u8> {
    let mut hasher = Sha3_256::new();
    hasher.update(sign_scheme.as_bytes());
    hasher.update(sign_key);
    hasher.update(crypt_scheme.as_bytes());
    hasher.update(crypt_key);
    hasher.finalize().to_vec()
}
