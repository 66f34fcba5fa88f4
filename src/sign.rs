use ed25519_dalek::{SigningKey, VerifyingKey, SECRET_KEY_LENGTH};
use std::fs;
use std::path::{Path, PathBuf};

use crate::descriptor::FsVerityDescriptor;
use crate::error::{Error, Result};

/// A signing backend: gets the bytes to sign, returns an opaque signature blob.
pub trait Signer {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>>;

    /// Short name for log messages.
    fn backend_name(&self) -> &'static str;
}

impl<S: Signer + ?Sized> Signer for Box<S> {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        (**self).sign(message)
    }

    fn backend_name(&self) -> &'static str {
        (**self).backend_name()
    }
}

/// Ed25519 key read from a local file.
///
/// The key file holds the 32-byte secret seed, either raw or as 64 hex characters. The optional
/// certificate file holds the matching public key in the same encodings; it is checked against
/// the key when the signer is constructed.
pub struct KeyFileSigner {
    key: SigningKey,
}

fn read_key_material(path: &Path, what: &str) -> Result<[u8; SECRET_KEY_LENGTH]> {
    let raw = fs::read(path)?;
    let bytes = if raw.len() == SECRET_KEY_LENGTH {
        raw
    } else {
        let text = std::str::from_utf8(&raw)
            .map_err(|_| Error::InvalidArgument(format!("{} file {} is neither raw nor hex", what, path.display())))?;
        hex::decode(text.trim())
            .map_err(|e| Error::InvalidArgument(format!("{} file {}: {}", what, path.display(), e)))?
    };
    <[u8; SECRET_KEY_LENGTH]>::try_from(bytes.as_slice()).map_err(|_| {
        Error::InvalidArgument(format!("{} file {} must hold {} bytes", what, path.display(), SECRET_KEY_LENGTH))
    })
}

impl KeyFileSigner {
    pub fn from_bytes(secret: &[u8; SECRET_KEY_LENGTH]) -> Self {
        Self { key: SigningKey::from_bytes(secret) }
    }

    pub fn open(key_path: &Path, cert_path: Option<&Path>) -> Result<Self> {
        let signer = Self::from_bytes(&read_key_material(key_path, "key")?);
        if let Some(cert_path) = cert_path {
            let public = read_key_material(cert_path, "certificate")?;
            if public != signer.verifying_key().to_bytes() {
                return Err(Error::InvalidArgument(format!(
                    "certificate {} does not match key {}",
                    cert_path.display(),
                    key_path.display()
                )));
            }
        }
        Ok(signer)
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }
}

impl Signer for KeyFileSigner {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        use ed25519_dalek::Signer as _;
        Ok(self.key.sign(message).to_bytes().to_vec())
    }

    fn backend_name(&self) -> &'static str {
        "key-file"
    }
}

/// Key held in a PKCS#11 token, addressed through an engine/module pair and an optional key id.
///
/// This build carries no token bridge: the parameters are validated and kept, but signing
/// always reports a backend error.
#[derive(Clone, Debug)]
pub struct Pkcs11Signer {
    pub engine: String,
    pub module: String,
    pub keyid: Option<String>,
}

impl Signer for Pkcs11Signer {
    fn sign(&self, _message: &[u8]) -> Result<Vec<u8>> {
        Err(Error::SigningBackend(format!(
            "no PKCS#11 bridge available for engine {} module {}",
            self.engine, self.module
        )))
    }

    fn backend_name(&self) -> &'static str {
        "pkcs11"
    }
}

/// Signing options as given on the command line.
#[derive(Clone, Debug, Default)]
pub struct SigningParams {
    pub key: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub pkcs11_engine: Option<String>,
    pub pkcs11_module: Option<String>,
    pub pkcs11_keyid: Option<String>,
}

impl SigningParams {
    /// Picks the backend. A key file and PKCS#11 options are mutually exclusive, and one of them is required.
    pub fn into_signer(self) -> Result<Box<dyn Signer>> {
        let wants_pkcs11 = self.pkcs11_engine.is_some() || self.pkcs11_module.is_some() || self.pkcs11_keyid.is_some();
        match (self.key, wants_pkcs11) {
            (Some(_), true) => Err(Error::InvalidArgument("--key cannot be combined with PKCS#11 options".into())),
            (Some(key), false) => Ok(Box::new(KeyFileSigner::open(&key, self.cert.as_deref())?)),
            (None, true) => match (self.pkcs11_engine, self.pkcs11_module) {
                (Some(engine), Some(module)) => Ok(Box::new(Pkcs11Signer { engine, module, keyid: self.pkcs11_keyid })),
                _ => Err(Error::InvalidArgument("PKCS#11 signing needs both --pkcs11-engine and --pkcs11-module".into())),
            },
            (None, false) => Err(Error::InvalidArgument("one of --key or the PKCS#11 options is required".into())),
        }
    }
}

/// Signs descriptors with one backend, chosen when it is constructed. Calls are one-shot and never retried.
pub struct DigestSigner<S: Signer> {
    signer: S,
}

impl<S: Signer> DigestSigner<S> {
    pub fn new(signer: S) -> Self {
        Self { signer }
    }

    /// Hands exactly the 256 canonical descriptor bytes to the backend.
    pub fn sign(&self, descriptor: &FsVerityDescriptor) -> Result<Vec<u8>> {
        log::debug!(
            "signing descriptor for {} using {}",
            descriptor.measurement(),
            self.signer.backend_name()
        );
        self.signer.sign(&descriptor.canonical_bytes())
    }
}
