//! Code signature blobs for Mach-O binaries.
//!
//! [`CodeDirectoryBuilder`] hashes a slice, [`requirements`] compiles the
//! designated requirement, [`der`] encodes entitlements and [`superblob`]
//! packs everything into the blob referenced by `LC_CODE_SIGNATURE`.

pub mod code_directory;
pub mod constants;
pub mod der;
pub mod requirements;
pub mod superblob;

pub use code_directory::{CodeDirectoryBuilder, HashKind};
pub use superblob::{BlobEntry, SuperBlob};
