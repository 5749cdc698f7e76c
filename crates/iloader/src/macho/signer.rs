//! Embedded code signatures for Mach-O binaries.
//!
//! Each architecture slice is signed independently: signature space is
//! reserved first, then both CodeDirectories are built over the rewritten
//! bytes, the slot 0 directory is CMS-signed, and the SuperBlob is padded to
//! the reserved size and appended.

use std::path::Path;

use plist::{Dictionary, Value};
use tracing::debug;

use crate::codesign::constants::*;
use crate::codesign::der::entitlements_to_der;
use crate::codesign::requirements::build_designated_requirements;
use crate::codesign::superblob::{
    build_der_entitlements_blob, build_entitlements_blob, build_signature_blob, build_superblob,
    BlobEntry,
};
use crate::codesign::{CodeDirectoryBuilder, HashKind};
use crate::crypto::cms::{sign_code_directory, CMS_RESERVE};
use crate::crypto::SigningIdentity;
use crate::{Error, Result};

use super::parser::{MachOFile, SliceLayout};
use super::writer::{align_to, assemble_fat, prepare_slice};

/// What to sign a binary as.
#[derive(Debug, Clone, Copy)]
pub struct SignOptions<'a> {
    /// Code identifier, the bundle identifier for bundle executables
    pub identifier: &'a str,
    pub identity: &'a SigningIdentity,
    /// Entitlements to embed; nested code passes an empty dictionary
    pub entitlements: &'a Dictionary,
    pub info_plist: Option<&'a [u8]>,
    /// `_CodeSignature/CodeResources` of the enclosing bundle, if already built
    pub resources: Option<&'a [u8]>,
    /// Main executables get DER entitlements and seven special slots
    pub main_executable: bool,
}

/// Sign the binary at `path` in place.
pub fn sign_file(path: &Path, options: &SignOptions<'_>) -> Result<()> {
    let data = std::fs::read(path)?;
    let signed = sign_macho(data, options)?;
    std::fs::write(path, signed)?;
    debug!(path = %path.display(), identifier = options.identifier, "signed binary");
    Ok(())
}

/// Sign every slice of a thin or universal binary.
pub fn sign_macho(data: Vec<u8>, options: &SignOptions<'_>) -> Result<Vec<u8>> {
    let file = MachOFile::parse(data)?;
    if !file.is_fat() {
        let slice = &file.slices()[0];
        return sign_slice(file.slice_bytes(slice), &slice.layout, options);
    }

    let signed = file
        .slices()
        .iter()
        .map(|slice| sign_slice(file.slice_bytes(slice), &slice.layout, options))
        .collect::<Result<Vec<_>>>()?;
    assemble_fat(file.slices(), &signed)
}

fn entitlements_xml(entitlements: &Dictionary) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    plist::to_writer_xml(&mut buf, &Value::Dictionary(entitlements.clone()))?;
    Ok(buf)
}

struct SignatureBlobs {
    requirements: Vec<u8>,
    entitlements: Vec<u8>,
    der_entitlements: Option<Vec<u8>>,
}

fn directory_builder<'a>(
    code: &'a [u8],
    options: &SignOptions<'a>,
    layout: &SliceLayout,
    blobs: &'a SignatureBlobs,
) -> CodeDirectoryBuilder<'a> {
    let mut builder = CodeDirectoryBuilder::new(options.identifier, code)
        .requirements(&blobs.requirements)
        .entitlements(&blobs.entitlements)
        .main_executable(options.main_executable);
    if let Some(team) = options.identity.team_id() {
        builder = builder.team_id(team);
    }
    if let Some(info) = options.info_plist {
        builder = builder.info_plist(info);
    }
    if let Some(resources) = options.resources {
        builder = builder.resources(resources);
    }
    if let Some(der) = &blobs.der_entitlements {
        builder = builder.der_entitlements(der);
    }
    if let Some(text) = layout.text {
        builder = builder.exec_seg_base(text.fileoff).exec_seg_limit(text.filesize);
    }
    builder
}

/// Sign one thin slice and return the slice with its signature appended.
pub fn sign_slice(data: &[u8], layout: &SliceLayout, options: &SignOptions<'_>) -> Result<Vec<u8>> {
    let identity = options.identity;
    let blobs = SignatureBlobs {
        requirements: build_designated_requirements(options.identifier, identity.common_name()),
        entitlements: build_entitlements_blob(&entitlements_xml(options.entitlements)?),
        der_entitlements: if options.main_executable {
            Some(build_der_entitlements_blob(&entitlements_to_der(options.entitlements)?))
        } else {
            None
        },
    };

    // Phase 1: size the signature and rewrite the headers around it
    let sig_offset = align_to(layout.code_end(data.len()), SIGNATURE_ALIGN);
    let estimate = directory_builder(&[], options, layout, &blobs);
    let blob_count = 5 + usize::from(blobs.der_entitlements.is_some());
    let reserve = align_to(
        12 + 8 * blob_count
            + estimate.encoded_len_for(HashKind::Sha1, sig_offset)
            + estimate.encoded_len_for(HashKind::Sha256, sig_offset)
            + blobs.requirements.len()
            + blobs.entitlements.len()
            + blobs.der_entitlements.as_ref().map_or(0, Vec::len)
            + 8
            + CMS_RESERVE
            + identity.certificates_len(),
        SIGNATURE_ALIGN,
    );
    let prepared = prepare_slice(data, layout, reserve)?;

    // Phase 2: hash the final bytes and sign
    let builder = directory_builder(&prepared.code, options, layout, &blobs);
    let cd_sha1 = builder.build(HashKind::Sha1);
    let cd_sha256 = builder.build(HashKind::Sha256);
    let cdhash_sha256 = HashKind::Sha256.digest(&cd_sha256);
    let cdhashes = vec![HashKind::Sha1.digest(&cd_sha1), cdhash_sha256.clone()];
    let cms = sign_code_directory(&cd_sha1, identity, &cdhashes, &cdhash_sha256)?;

    let mut entries = vec![
        BlobEntry::new(HashKind::Sha1.slot(), cd_sha1),
        BlobEntry::new(CSSLOT_REQUIREMENTS, blobs.requirements.clone()),
        BlobEntry::new(CSSLOT_ENTITLEMENTS, blobs.entitlements.clone()),
    ];
    if let Some(der) = &blobs.der_entitlements {
        entries.push(BlobEntry::new(CSSLOT_DER_ENTITLEMENTS, der.clone()));
    }
    entries.push(BlobEntry::new(HashKind::Sha256.slot(), cd_sha256));
    entries.push(BlobEntry::new(CSSLOT_SIGNATURESLOT, build_signature_blob(&cms)));

    let mut superblob = build_superblob(&entries);
    if superblob.len() > prepared.reserve {
        return Err(Error::Signing(format!(
            "signature of {} bytes exceeds reserved {} bytes",
            superblob.len(),
            prepared.reserve
        )));
    }
    superblob.resize(prepared.reserve, 0);

    let mut output = prepared.code;
    output.extend(superblob);
    Ok(output)
}

/// Locate the embedded SuperBlob of a thin slice.
pub fn embedded_signature(data: &[u8]) -> Result<&[u8]> {
    let layout = SliceLayout::inspect(data)?;
    let cs = layout
        .code_signature
        .ok_or_else(|| Error::Signing("binary has no LC_CODE_SIGNATURE".into()))?;
    let start = cs.dataoff as usize;
    data.get(start..start + cs.datasize as usize)
        .ok_or_else(|| Error::Signing("code signature past end of file".into()))
}
