//! CodeDirectory blob builder.
//!
//! A CodeDirectory carries the page hashes of a Mach-O slice plus the hashes
//! of the special slots (Info.plist, requirements, resources, entitlements).
//! Every signature we emit holds two of them: SHA-1 in the primary slot and
//! SHA-256 in the first alternate slot.

use rayon::prelude::*;
use sha1::{Digest, Sha1};
use sha2::Sha256;

use super::constants::*;

/// Hash algorithm of one CodeDirectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    Sha1,
    Sha256,
}

impl HashKind {
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            HashKind::Sha1 => Sha1::digest(data).to_vec(),
            HashKind::Sha256 => Sha256::digest(data).to_vec(),
        }
    }

    pub fn digest_len(self) -> usize {
        match self {
            HashKind::Sha1 => CS_SHA1_LEN,
            HashKind::Sha256 => CS_SHA256_LEN,
        }
    }

    /// Value of the `hashType` header field.
    pub fn code(self) -> u8 {
        match self {
            HashKind::Sha1 => CS_HASHTYPE_SHA1,
            HashKind::Sha256 => CS_HASHTYPE_SHA256,
        }
    }

    /// SuperBlob slot holding a CodeDirectory of this kind.
    pub fn slot(self) -> u32 {
        match self {
            HashKind::Sha1 => CSSLOT_CODEDIRECTORY,
            HashKind::Sha256 => CSSLOT_ALTERNATE_CODEDIRECTORIES,
        }
    }
}

/// Builder for CodeDirectory blobs.
///
/// Special slot contents are supplied as raw bytes and hashed with the
/// requested [`HashKind`] at build time, so one builder produces both the
/// SHA-1 and SHA-256 directories.
///
/// # Example
///
/// ```ignore
/// let cd = CodeDirectoryBuilder::new("com.example.app", &code)
///     .team_id("TEAMID1234")
///     .main_executable(true)
///     .exec_seg_limit(0x4000)
///     .entitlements(&entitlements_blob)
///     .build(HashKind::Sha256);
/// ```
#[derive(Debug, Clone)]
pub struct CodeDirectoryBuilder<'a> {
    identifier: String,
    team_id: Option<String>,
    /// Slice bytes up to the signature offset
    code: &'a [u8],
    info_plist: Option<&'a [u8]>,
    requirements: Option<&'a [u8]>,
    resources: Option<&'a [u8]>,
    entitlements: Option<&'a [u8]>,
    der_entitlements: Option<&'a [u8]>,
    exec_seg_base: u64,
    exec_seg_limit: u64,
    main_executable: bool,
}

impl<'a> CodeDirectoryBuilder<'a> {
    pub fn new(identifier: impl Into<String>, code: &'a [u8]) -> Self {
        Self {
            identifier: identifier.into(),
            team_id: None,
            code,
            info_plist: None,
            requirements: None,
            resources: None,
            entitlements: None,
            der_entitlements: None,
            exec_seg_base: 0,
            exec_seg_limit: 0,
            main_executable: false,
        }
    }

    pub fn team_id(mut self, team_id: impl Into<String>) -> Self {
        self.team_id = Some(team_id.into());
        self
    }

    /// Raw `Info.plist` bytes (special slot -1).
    pub fn info_plist(mut self, data: &'a [u8]) -> Self {
        self.info_plist = Some(data);
        self
    }

    /// Requirements blob (special slot -2).
    pub fn requirements(mut self, blob: &'a [u8]) -> Self {
        self.requirements = Some(blob);
        self
    }

    /// `_CodeSignature/CodeResources` bytes (special slot -3).
    pub fn resources(mut self, data: &'a [u8]) -> Self {
        self.resources = Some(data);
        self
    }

    /// XML entitlements blob (special slot -5).
    pub fn entitlements(mut self, blob: &'a [u8]) -> Self {
        self.entitlements = Some(blob);
        self
    }

    /// DER entitlements blob (special slot -7, main executable only).
    pub fn der_entitlements(mut self, blob: &'a [u8]) -> Self {
        self.der_entitlements = Some(blob);
        self
    }

    pub fn exec_seg_base(mut self, base: u64) -> Self {
        self.exec_seg_base = base;
        self
    }

    /// Size of the `__TEXT` segment in the file.
    pub fn exec_seg_limit(mut self, limit: u64) -> Self {
        self.exec_seg_limit = limit;
        self
    }

    /// Marks the slice as the bundle's main executable.
    ///
    /// Main executables get seven special slots and `CS_EXECSEG_MAIN_BINARY`;
    /// nested code gets five.
    pub fn main_executable(mut self, main: bool) -> Self {
        self.main_executable = main;
        self
    }

    fn special_slot_count(&self) -> u32 {
        if self.main_executable {
            MAIN_SPECIAL_SLOTS
        } else {
            NESTED_SPECIAL_SLOTS
        }
    }

    /// Content of special slot `-index`, if any.
    fn special_slot(&self, index: i32) -> Option<&'a [u8]> {
        match index {
            CSSLOT_SPECIAL_INFOSLOT => self.info_plist,
            CSSLOT_SPECIAL_REQUIREMENTS => self.requirements,
            CSSLOT_SPECIAL_RESOURCEDIR => self.resources,
            CSSLOT_SPECIAL_ENTITLEMENTS => self.entitlements,
            CSSLOT_SPECIAL_DER_ENTITLEMENTS => self.der_entitlements,
            _ => None,
        }
    }

    /// Size in bytes of the blob [`build`](Self::build) will produce.
    pub fn encoded_len(&self, kind: HashKind) -> usize {
        self.encoded_len_for(kind, self.code.len())
    }

    /// Size of the blob for `code_len` bytes of code with the current settings.
    pub fn encoded_len_for(&self, kind: HashKind, code_len: usize) -> usize {
        let strings = self.identifier.len() + 1 + self.team_id.as_ref().map_or(0, |t| t.len() + 1);
        let slots = self.special_slot_count() as usize + code_len.div_ceil(PAGE_SIZE);
        CODEDIRECTORY_HEADER_SIZE + strings + slots * kind.digest_len()
    }

    pub fn build(&self, kind: HashKind) -> Vec<u8> {
        let hash_size = kind.digest_len();
        let n_special = self.special_slot_count();
        let n_code = self.code.len().div_ceil(PAGE_SIZE) as u32;

        let ident_offset = CODEDIRECTORY_HEADER_SIZE as u32;
        let ident_len = self.identifier.len() as u32 + 1;
        let team_len = self.team_id.as_ref().map_or(0, |t| t.len() as u32 + 1);
        let team_offset = if self.team_id.is_some() {
            ident_offset + ident_len
        } else {
            0
        };
        // hashOffset points at slot 0; special slots sit directly before it
        let hash_offset = ident_offset + ident_len + team_len + n_special * hash_size as u32;
        let total_len = self.encoded_len(kind) as u32;
        let exec_seg_flags = if self.main_executable {
            CS_EXECSEG_MAIN_BINARY
        } else {
            0
        };

        let mut buf = Vec::with_capacity(total_len as usize);
        buf.extend(CSMAGIC_CODEDIRECTORY.to_be_bytes());
        buf.extend(total_len.to_be_bytes());
        buf.extend(CODEDIRECTORY_VERSION.to_be_bytes());
        buf.extend(0u32.to_be_bytes()); // flags
        buf.extend(hash_offset.to_be_bytes());
        buf.extend(ident_offset.to_be_bytes());
        buf.extend(n_special.to_be_bytes());
        buf.extend(n_code.to_be_bytes());
        buf.extend((self.code.len() as u32).to_be_bytes()); // codeLimit
        buf.push(hash_size as u8);
        buf.push(kind.code());
        buf.push(0); // platform
        buf.push(PAGE_SIZE_LOG2);
        buf.extend(0u32.to_be_bytes()); // spare2
        buf.extend(0u32.to_be_bytes()); // scatterOffset
        buf.extend(team_offset.to_be_bytes());
        buf.extend(0u32.to_be_bytes()); // spare3
        buf.extend(0u64.to_be_bytes()); // codeLimit64
        buf.extend(self.exec_seg_base.to_be_bytes());
        buf.extend(self.exec_seg_limit.to_be_bytes());
        buf.extend(exec_seg_flags.to_be_bytes());

        buf.extend(self.identifier.as_bytes());
        buf.push(0);
        if let Some(team) = &self.team_id {
            buf.extend(team.as_bytes());
            buf.push(0);
        }

        // Special slots run from -n up to -1
        for index in (1..=n_special as i32).rev() {
            match self.special_slot(-index) {
                Some(data) => buf.extend(kind.digest(data)),
                None => buf.extend(std::iter::repeat(0u8).take(hash_size)),
            }
        }

        let pages: Vec<Vec<u8>> = self
            .code
            .par_chunks(PAGE_SIZE)
            .map(|page| kind.digest(page))
            .collect();
        for hash in pages {
            buf.extend(hash);
        }

        buf
    }
}

/// Read a big-endian `u32` at `offset`, if in bounds.
pub(crate) fn be_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
