//! Application bundle resources.
//!
//! Every signed bundle carries `_CodeSignature/CodeResources`, a plist with
//! the digests of all its files:
//!
//! | Key | Contents |
//! |-----|----------|
//! | `files` | SHA-1 digests, for older verifiers |
//! | `files2` | SHA-1 and SHA-256 digests, symlink targets |
//! | `rules` | Legacy inclusion and exclusion patterns |
//! | `rules2` | Current inclusion and exclusion patterns |
//!
//! [`BundleManifest`] builds the file from scratch and can check a bundle
//! against a previously written one.

pub mod code_resources;

pub use code_resources::{BundleManifest, ManifestMismatch, CODE_RESOURCES_PATH};
