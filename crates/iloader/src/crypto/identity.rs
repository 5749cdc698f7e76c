//! Signing identities: a certificate plus the private key that matches it.
//!
//! An identity comes either from a PKCS#12 container supplied by the user or
//! from the Apple ID path, where the certificate is downloaded from developer
//! services and the key is held locally. The key never leaves this struct.
//!
//! # Examples
//!
//! ```no_run
//! use iloader::crypto::SigningIdentity;
//! use secrecy::SecretString;
//!
//! let p12 = std::fs::read("certificate.p12")?;
//! let identity = SigningIdentity::from_p12(&p12, &SecretString::new("password".into()))?;
//! println!("team {:?}", identity.team_id());
//! # Ok::<(), iloader::Error>(())
//! ```

use std::fmt;

use pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use secrecy::{ExposeSecret, SecretString};
use x509_certificate::{
    CapturedX509Certificate, InMemorySigningKeyPair, Sign, X509CertificateBuilder,
};
use zeroize::Zeroizing;

use crate::{Error, Result};

/// RSA modulus size for keys generated for new development certificates.
const GENERATED_KEY_BITS: usize = 2048;

/// Certificate, private key and chain used for one signing operation.
pub struct SigningIdentity {
    certificate: CapturedX509Certificate,
    key: InMemorySigningKeyPair,
    chain: Vec<CapturedX509Certificate>,
    common_name: Option<String>,
    team_id: Option<String>,
}

impl fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("common_name", &self.common_name)
            .field("team_id", &self.team_id)
            .field("chain", &self.chain.len())
            .finish_non_exhaustive()
    }
}

impl SigningIdentity {
    /// Pair a DER certificate with a PKCS#8 DER private key.
    ///
    /// Fails with [`Error::Certificate`] when the key does not belong to the
    /// certificate.
    pub fn from_der(certificate_der: &[u8], pkcs8_key_der: &[u8]) -> Result<Self> {
        let certificate = CapturedX509Certificate::from_der(certificate_der.to_vec())
            .map_err(|e| Error::Certificate(format!("failed to parse certificate: {e}")))?;
        let key = InMemorySigningKeyPair::from_pkcs8_der(pkcs8_key_der)
            .map_err(|e| Error::Certificate(format!("failed to parse private key: {e}")))?;
        Self::new(certificate, key, Vec::new())
    }

    /// Load the first certificate and key from a PKCS#12 container.
    ///
    /// Remaining certificates in the container become the chain.
    pub fn from_p12(data: &[u8], passphrase: &SecretString) -> Result<Self> {
        let password = passphrase.expose_secret();
        let pfx = p12::PFX::parse(data)
            .map_err(|e| Error::Certificate(format!("failed to parse PKCS#12: {e:?}")))?;
        let keys = pfx
            .key_bags(password)
            .map_err(|e| Error::Certificate(format!("failed to decrypt PKCS#12 keys: {e:?}")))?;
        let certs = pfx
            .cert_x509_bags(password)
            .map_err(|e| Error::Certificate(format!("failed to decrypt PKCS#12 certs: {e:?}")))?;

        let key_der = keys
            .first()
            .map(|k| Zeroizing::new(k.clone()))
            .ok_or(Error::CertificateNotFound)?;
        let key = InMemorySigningKeyPair::from_pkcs8_der(key_der.as_slice())
            .map_err(|e| Error::Certificate(format!("failed to parse private key: {e}")))?;

        let mut parsed = certs
            .into_iter()
            .map(|der| {
                CapturedX509Certificate::from_der(der)
                    .map_err(|e| Error::Certificate(format!("failed to parse certificate: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        if parsed.is_empty() {
            return Err(Error::CertificateNotFound);
        }

        // The leaf is the certificate whose public key matches the private key
        let leaf_index = parsed
            .iter()
            .position(|c| c.public_key_data() == key.public_key_data())
            .unwrap_or(0);
        let certificate = parsed.remove(leaf_index);
        Self::new(certificate, key, parsed)
    }

    pub fn new(
        certificate: CapturedX509Certificate,
        key: InMemorySigningKeyPair,
        chain: Vec<CapturedX509Certificate>,
    ) -> Result<Self> {
        if certificate.public_key_data() != key.public_key_data() {
            return Err(Error::Certificate(
                "private key does not match certificate".into(),
            ));
        }
        let common_name = certificate.subject_common_name();
        let team_id = certificate
            .subject_name()
            .iter_organizational_unit()
            .find_map(|atav| atav.to_string().ok());

        Ok(Self {
            certificate,
            key,
            chain,
            common_name,
            team_id,
        })
    }

    pub fn certificate(&self) -> &CapturedX509Certificate {
        &self.certificate
    }

    pub fn key(&self) -> &InMemorySigningKeyPair {
        &self.key
    }

    pub fn chain(&self) -> &[CapturedX509Certificate] {
        &self.chain
    }

    /// Subject common name, used in the designated requirement.
    pub fn common_name(&self) -> Option<&str> {
        self.common_name.as_deref()
    }

    /// Team identifier from the subject organizational unit.
    pub fn team_id(&self) -> Option<&str> {
        self.team_id.as_deref()
    }

    /// Total DER size of every certificate the CMS blob will embed.
    pub(crate) fn certificates_len(&self) -> usize {
        self.certificate.constructed_data().len()
            + self.chain.iter().map(|c| c.constructed_data().len()).sum::<usize>()
    }
}

/// A freshly generated key with its certificate signing request.
pub struct PendingKey {
    /// PKCS#8 DER of the private key
    pub pkcs8_der: Zeroizing<Vec<u8>>,
    pub csr_pem: String,
}

/// Generate an RSA key and a CSR for a new development certificate.
pub fn generate_csr(common_name: &str) -> Result<PendingKey> {
    let mut rng = rand::thread_rng();
    let rsa = RsaPrivateKey::new(&mut rng, GENERATED_KEY_BITS)
        .map_err(|e| Error::Certificate(format!("failed to generate key: {e}")))?;
    let document = rsa
        .to_pkcs8_der()
        .map_err(|e| Error::Certificate(format!("failed to encode key: {e}")))?;
    let pkcs8_der = Zeroizing::new(document.as_bytes().to_vec());

    let key = InMemorySigningKeyPair::from_pkcs8_der(pkcs8_der.as_slice())
        .map_err(|e| Error::Certificate(format!("failed to load generated key: {e}")))?;

    let mut builder = X509CertificateBuilder::default();
    builder
        .subject()
        .append_common_name_utf8_string(common_name)
        .map_err(|e| Error::Certificate(format!("invalid common name: {e:?}")))?;
    let csr_pem = builder
        .create_certificate_signing_request(&key)
        .map_err(|e| Error::Certificate(format!("failed to create CSR: {e}")))?
        .encode_pem()
        .map_err(|e| Error::Certificate(format!("failed to encode CSR: {e}")))?;

    Ok(PendingKey { pkcs8_der, csr_pem })
}
