//! CMS signing with Apple CDHash attributes.
//!
//! The signature covers the primary (slot 0) CodeDirectory as detached
//! content and carries two signed attributes binding every CodeDirectory:
//! a plist of truncated cdhashes and a `SEQUENCE { sha256, hash }`.

use bcder::{encode::Values, Captured, Mode, OctetString, Oid};
use cryptographic_message_syntax::{Bytes, SignedDataBuilder, SignerBuilder};
use plist::{Dictionary, Value};
use x509_certificate::rfc5652::AttributeValue;

use super::identity::SigningIdentity;
use crate::{Error, Result};

/// 1.2.840.113635.100.9.1: plist of cdhashes
pub const APPLE_CDHASH_OID: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x63, 0x64, 0x09, 0x01];

/// 1.2.840.113635.100.9.2: SEQUENCE { digest OID, OCTET STRING }
pub const APPLE_CDHASH_V2_OID: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x63, 0x64, 0x09, 0x02];

/// 2.16.840.1.101.3.4.2.1
const SHA256_OID: &[u8] = &[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01];

/// Length a cdhash is truncated to inside the plist attribute.
const CDHASH_LEN: usize = 20;

/// Extra room reserved for the CMS structure beyond the embedded certificates.
pub const CMS_RESERVE: usize = 4096;

/// Sign `code_directory` (the slot 0 blob) with `identity`.
///
/// `cdhashes` lists the full digest of every CodeDirectory in slot order;
/// `cdhash_sha256` is the SHA-256 digest of the SHA-256 CodeDirectory.
pub fn sign_code_directory(
    code_directory: &[u8],
    identity: &SigningIdentity,
    cdhashes: &[Vec<u8>],
    cdhash_sha256: &[u8],
) -> Result<Vec<u8>> {
    let plist = build_cdhash_plist(cdhashes)?;
    let v2 = build_cdhash_v2_attribute(cdhash_sha256);

    let v1_attr = AttributeValue::new(Captured::from_values(
        Mode::Der,
        OctetString::encode_slice(&plist),
    ));
    let v2_attr = AttributeValue::new(Captured::from_values(Mode::Der, RawDer(&v2)));

    let signer = SignerBuilder::new(identity.key(), identity.certificate().clone())
        .signed_attribute(Oid(Bytes::copy_from_slice(APPLE_CDHASH_OID)), vec![v1_attr])
        .signed_attribute(Oid(Bytes::copy_from_slice(APPLE_CDHASH_V2_OID)), vec![v2_attr]);

    let mut builder = SignedDataBuilder::default()
        .content_external(code_directory.to_vec())
        .signer(signer)
        .certificate(identity.certificate().clone());
    for cert in identity.chain() {
        builder = builder.certificate(cert.clone());
    }

    builder
        .build_der()
        .map_err(|e| Error::Signing(format!("failed to build CMS signature: {e}")))
}

/// XML plist `{cdhashes: [data...]}` with every hash truncated to 20 bytes.
pub fn build_cdhash_plist(cdhashes: &[Vec<u8>]) -> Result<Vec<u8>> {
    let mut dict = Dictionary::new();
    dict.insert(
        "cdhashes".to_string(),
        Value::Array(
            cdhashes
                .iter()
                .map(|h| Value::Data(h[..h.len().min(CDHASH_LEN)].to_vec()))
                .collect(),
        ),
    );

    let mut buf = Vec::new();
    plist::to_writer_xml(&mut buf, &Value::Dictionary(dict))?;
    buf.push(b'\n');
    Ok(buf)
}

fn build_cdhash_v2_attribute(cdhash_sha256: &[u8]) -> Vec<u8> {
    let mut content = vec![0x06, SHA256_OID.len() as u8];
    content.extend_from_slice(SHA256_OID);
    content.push(0x04);
    content.push(cdhash_sha256.len() as u8);
    content.extend_from_slice(cdhash_sha256);

    let mut out = vec![0x30, content.len() as u8];
    out.extend(content);
    out
}

/// Pre-encoded DER written through bcder unchanged.
struct RawDer<'a>(&'a [u8]);

impl Values for RawDer<'_> {
    fn encoded_len(&self, _mode: Mode) -> usize {
        self.0.len()
    }

    fn write_encoded<W: std::io::Write>(&self, _mode: Mode, target: &mut W) -> std::io::Result<()> {
        target.write_all(self.0)
    }
}
