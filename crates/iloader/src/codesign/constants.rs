//! Apple code signing and Mach-O constants used by the embedded signer.

// =============================================================================
// Blob magic numbers
// =============================================================================

/// SuperBlob containing all signature components
pub const CSMAGIC_EMBEDDED_SIGNATURE: u32 = 0xfade0cc0;

pub const CSMAGIC_CODEDIRECTORY: u32 = 0xfade0c02;

/// Requirements set (vector of typed requirements)
pub const CSMAGIC_REQUIREMENTS: u32 = 0xfade0c01;

/// Single compiled requirement expression
pub const CSMAGIC_REQUIREMENT: u32 = 0xfade0c00;

/// Entitlements as XML plist
pub const CSMAGIC_EMBEDDED_ENTITLEMENTS: u32 = 0xfade7171;

/// Entitlements as ASN.1 DER
pub const CSMAGIC_EMBEDDED_DER_ENTITLEMENTS: u32 = 0xfade7172;

/// CMS signature wrapper
pub const CSMAGIC_BLOBWRAPPER: u32 = 0xfade0b01;

// =============================================================================
// SuperBlob index slots
// =============================================================================

pub const CSSLOT_CODEDIRECTORY: u32 = 0x0000;
pub const CSSLOT_REQUIREMENTS: u32 = 0x0002;
pub const CSSLOT_ENTITLEMENTS: u32 = 0x0005;
pub const CSSLOT_DER_ENTITLEMENTS: u32 = 0x0007;

/// First alternate code directory (SHA-256)
pub const CSSLOT_ALTERNATE_CODEDIRECTORIES: u32 = 0x1000;

pub const CSSLOT_SIGNATURESLOT: u32 = 0x10000;

// =============================================================================
// Special slot indices (negative, inside a CodeDirectory)
// =============================================================================

pub const CSSLOT_SPECIAL_INFOSLOT: i32 = -1;
pub const CSSLOT_SPECIAL_REQUIREMENTS: i32 = -2;
pub const CSSLOT_SPECIAL_RESOURCEDIR: i32 = -3;
pub const CSSLOT_SPECIAL_ENTITLEMENTS: i32 = -5;
pub const CSSLOT_SPECIAL_DER_ENTITLEMENTS: i32 = -7;

/// Number of special slots written for a main executable
pub const MAIN_SPECIAL_SLOTS: u32 = 7;

/// Number of special slots written for a framework or dylib
pub const NESTED_SPECIAL_SLOTS: u32 = 5;

// =============================================================================
// Hash types
// =============================================================================

pub const CS_HASHTYPE_SHA1: u8 = 1;
pub const CS_HASHTYPE_SHA256: u8 = 2;

pub const CS_SHA1_LEN: usize = 20;
pub const CS_SHA256_LEN: usize = 32;

// =============================================================================
// CodeDirectory layout
// =============================================================================

/// Executable segment belongs to the main binary
pub const CS_EXECSEG_MAIN_BINARY: u64 = 0x0001;

/// Version with exec segment fields; the header is 88 bytes
pub const CODEDIRECTORY_VERSION: u32 = 0x20400;

pub const CODEDIRECTORY_HEADER_SIZE: usize = 88;

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SIZE_LOG2: u8 = 12;

// =============================================================================
// Requirement language opcodes
// =============================================================================

pub const OP_IDENT: u32 = 2;
pub const OP_AND: u32 = 6;
pub const OP_CERT_FIELD: u32 = 11;
pub const OP_CERT_GENERIC: u32 = 14;
pub const OP_APPLE_GENERIC_ANCHOR: u32 = 15;

/// Requirement type: designated
pub const CSREQ_DESIGNATED: u32 = 0x0003;

pub const MATCH_EXISTS: u32 = 0;
pub const MATCH_EQUAL: u32 = 1;

/// Certificate index of the leaf in a requirement
pub const CERT_INDEX_LEAF: i32 = 0;

/// Certificate index one above the leaf (the issuing WWDR intermediate)
pub const CERT_INDEX_INTERMEDIATE: i32 = 1;

/// Apple iPhone developer intermediate marker extension
pub const WWDR_INTERMEDIATE_OID: &str = "1.2.840.113635.100.6.2.1";

// =============================================================================
// Mach-O
// =============================================================================

pub const MH_MAGIC: u32 = 0xfeedface;
pub const MH_MAGIC_64: u32 = 0xfeedfacf;
pub const FAT_MAGIC: u32 = 0xcafebabe;

pub const MH_HEADER_SIZE_32: usize = 28;
pub const MH_HEADER_SIZE_64: usize = 32;

pub const LC_SEGMENT: u32 = 0x1;
pub const LC_SEGMENT_64: u32 = 0x19;
pub const LC_CODE_SIGNATURE: u32 = 0x1d;
pub const LINKEDIT_DATA_COMMAND_SIZE: u32 = 16;

/// Alignment of `__LINKEDIT` vmsize after growth
pub const SEGMENT_ALIGN: u64 = 0x4000;

/// Alignment of the signature offset inside a slice
pub const SIGNATURE_ALIGN: usize = 16;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size() {
        assert_eq!(1 << PAGE_SIZE_LOG2, PAGE_SIZE);
    }

    #[test]
    fn test_slot_layout() {
        assert_eq!(-CSSLOT_SPECIAL_DER_ENTITLEMENTS as u32, MAIN_SPECIAL_SLOTS);
        assert_eq!(-CSSLOT_SPECIAL_ENTITLEMENTS as u32, NESTED_SPECIAL_SLOTS);
    }
}
