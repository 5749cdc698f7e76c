//! SuperBlob assembly and parsing.
//!
//! The SuperBlob is the container written at `LC_CODE_SIGNATURE`:
//!
//! ```text
//! magic 0xfade0cc0 | length | count
//! (slot, offset) * count
//! blob data...
//! ```
//!
//! Every contained blob starts with its own `magic | length` header.

use super::code_directory::be_u32;
use super::constants::*;
use crate::{Error, Result};

const SUPERBLOB_HEADER_SIZE: u32 = 12;
const INDEX_ENTRY_SIZE: u32 = 8;

/// One component of a signature, keyed by its SuperBlob slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEntry {
    pub slot: u32,
    /// Blob bytes including their own magic and length
    pub data: Vec<u8>,
}

impl BlobEntry {
    pub fn new(slot: u32, data: Vec<u8>) -> Self {
        Self { slot, data }
    }
}

/// Serialize `entries` into a SuperBlob, in the order given.
pub fn build_superblob(entries: &[BlobEntry]) -> Vec<u8> {
    let count = entries.len() as u32;
    let header_size = SUPERBLOB_HEADER_SIZE + count * INDEX_ENTRY_SIZE;
    let total_len = header_size + entries.iter().map(|e| e.data.len() as u32).sum::<u32>();

    let mut buf = Vec::with_capacity(total_len as usize);
    buf.extend(CSMAGIC_EMBEDDED_SIGNATURE.to_be_bytes());
    buf.extend(total_len.to_be_bytes());
    buf.extend(count.to_be_bytes());

    let mut offset = header_size;
    for entry in entries {
        buf.extend(entry.slot.to_be_bytes());
        buf.extend(offset.to_be_bytes());
        offset += entry.data.len() as u32;
    }
    for entry in entries {
        buf.extend(&entry.data);
    }
    buf
}

/// Wrap `payload` in a generic `magic | length` blob header.
pub fn wrap_blob(magic: u32, payload: &[u8]) -> Vec<u8> {
    let total_len = 8 + payload.len() as u32;
    let mut buf = Vec::with_capacity(total_len as usize);
    buf.extend(magic.to_be_bytes());
    buf.extend(total_len.to_be_bytes());
    buf.extend(payload);
    buf
}

pub fn build_entitlements_blob(plist_xml: &[u8]) -> Vec<u8> {
    wrap_blob(CSMAGIC_EMBEDDED_ENTITLEMENTS, plist_xml)
}

pub fn build_der_entitlements_blob(der: &[u8]) -> Vec<u8> {
    wrap_blob(CSMAGIC_EMBEDDED_DER_ENTITLEMENTS, der)
}

pub fn build_signature_blob(cms_der: &[u8]) -> Vec<u8> {
    wrap_blob(CSMAGIC_BLOBWRAPPER, cms_der)
}

/// A parsed SuperBlob borrowing from the signed binary.
#[derive(Debug)]
pub struct SuperBlob<'a> {
    pub entries: Vec<(u32, &'a [u8])>,
}

impl<'a> SuperBlob<'a> {
    /// Parse an embedded signature.
    ///
    /// Trailing padding after the declared length is ignored.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let malformed = |what: &str| Error::Signing(format!("malformed SuperBlob: {what}"));

        if be_u32(data, 0) != Some(CSMAGIC_EMBEDDED_SIGNATURE) {
            return Err(malformed("bad magic"));
        }
        let length = be_u32(data, 4).ok_or_else(|| malformed("truncated header"))? as usize;
        let count = be_u32(data, 8).ok_or_else(|| malformed("truncated header"))? as usize;
        let data = data.get(..length).ok_or_else(|| malformed("length past end"))?;

        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let at = SUPERBLOB_HEADER_SIZE as usize + i * INDEX_ENTRY_SIZE as usize;
            let slot = be_u32(data, at).ok_or_else(|| malformed("truncated index"))?;
            let offset = be_u32(data, at + 4).ok_or_else(|| malformed("truncated index"))? as usize;
            let blob_len = be_u32(data, offset + 4).ok_or_else(|| malformed("blob past end"))? as usize;
            let blob = data
                .get(offset..offset + blob_len)
                .ok_or_else(|| malformed("blob past end"))?;
            entries.push((slot, blob));
        }
        Ok(Self { entries })
    }

    pub fn get(&self, slot: u32) -> Option<&'a [u8]> {
        self.entries.iter().find(|(s, _)| *s == slot).map(|(_, b)| *b)
    }

    pub fn slots(&self) -> Vec<u32> {
        self.entries.iter().map(|(s, _)| *s).collect()
    }
}
