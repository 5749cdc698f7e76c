//! Mach-O parsing, signing and signature embedding.

pub mod parser;
pub mod signer;
pub mod writer;

pub use parser::{is_macho, MachOFile};
pub use signer::{embedded_signature, sign_file, sign_macho, SignOptions};
