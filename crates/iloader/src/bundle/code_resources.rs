//! `_CodeSignature/CodeResources` generation and verification.
//!
//! The manifest maps every file of a bundle to its SHA-1 and SHA-256
//! digests. It is always rebuilt from scratch, and only after every binary
//! in the bundle has been signed, so the digests describe the final bytes.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use plist::{Dictionary, Value};
use rayon::prelude::*;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::{Error, Result};

/// Directory holding the manifest, relative to the bundle root.
pub const CODE_SIGNATURE_DIR: &str = "_CodeSignature";
/// Manifest path relative to the bundle root.
pub const CODE_RESOURCES_PATH: &str = "_CodeSignature/CodeResources";

/// Digest of one bundle entry.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FileEntry {
    sha1: [u8; 20],
    sha256: [u8; 32],
    /// Target of a symbolic link; digests then cover the target path
    symlink: Option<String>,
}

impl FileEntry {
    fn from_bytes(data: &[u8], symlink: Option<String>) -> Self {
        let mut sha1 = [0u8; 20];
        let mut sha256 = [0u8; 32];
        sha1.copy_from_slice(&Sha1::digest(data));
        sha256.copy_from_slice(&Sha256::digest(data));
        Self {
            sha1,
            sha256,
            symlink,
        }
    }
}

/// A difference between a bundle on disk and its recorded manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestMismatch {
    /// Present in both, digests differ
    Modified(String),
    /// Recorded in the manifest but absent on disk
    Missing(String),
    /// On disk but not recorded
    Added(String),
}

/// Resource manifest of an application or framework bundle.
///
/// # Examples
///
/// ```no_run
/// use iloader::bundle::BundleManifest;
///
/// let manifest = BundleManifest::scan("Payload/App.app", &[])?;
/// manifest.write()?;
/// assert!(BundleManifest::verify("Payload/App.app", &[])?.is_empty());
/// # Ok::<(), iloader::Error>(())
/// ```
#[derive(Debug)]
pub struct BundleManifest {
    bundle_path: PathBuf,
    files: BTreeMap<String, FileEntry>,
}

impl BundleManifest {
    /// Hash every file of the bundle except the top-level `_CodeSignature/`
    /// and the relative paths in `exclude`.
    pub fn scan(bundle_path: impl AsRef<Path>, exclude: &[&str]) -> Result<Self> {
        let bundle_path = bundle_path.as_ref().to_path_buf();

        // WalkDir is not Send, so collect before hashing in parallel
        let entries: Vec<_> = WalkDir::new(&bundle_path)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Io(e.into()))?;

        let hashed = entries
            .par_iter()
            .filter_map(|entry| {
                let file_type = entry.file_type();
                if file_type.is_dir() {
                    return None;
                }
                let relative = relative_path(&bundle_path, entry.path())?;
                if is_code_signature(&relative) || exclude.contains(&relative.as_str()) {
                    return None;
                }
                Some(hash_entry(entry.path(), file_type.is_symlink()).map(|e| (relative, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(bundle = %bundle_path.display(), files = hashed.len(), "scanned bundle");
        Ok(Self {
            bundle_path,
            files: hashed.into_iter().collect(),
        })
    }

    /// Number of recorded entries.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Recorded relative paths, sorted.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    /// SHA-256 digest recorded for `path`.
    pub fn sha256(&self, path: &str) -> Option<&[u8; 32]> {
        self.files.get(path).map(|e| &e.sha256)
    }

    /// Serialize as an XML plist with `files`, `files2`, `rules` and `rules2`.
    pub fn to_plist(&self) -> Result<Vec<u8>> {
        let mut files = Dictionary::new();
        let mut files2 = Dictionary::new();

        for (path, entry) in &self.files {
            let optional = path.contains(".lproj/");

            // The legacy dictionary predates symlink entries
            if entry.symlink.is_none() {
                let value = if optional {
                    let mut dict = Dictionary::new();
                    dict.insert("hash".into(), Value::Data(entry.sha1.to_vec()));
                    dict.insert("optional".into(), Value::Boolean(true));
                    Value::Dictionary(dict)
                } else {
                    Value::Data(entry.sha1.to_vec())
                };
                files.insert(path.clone(), value);
            }

            if omitted_from_files2(path) {
                continue;
            }
            let mut dict = Dictionary::new();
            match &entry.symlink {
                Some(target) => {
                    dict.insert("symlink".into(), Value::String(target.clone()));
                }
                None => {
                    dict.insert("hash".into(), Value::Data(entry.sha1.to_vec()));
                    dict.insert("hash2".into(), Value::Data(entry.sha256.to_vec()));
                }
            }
            if optional {
                dict.insert("optional".into(), Value::Boolean(true));
            }
            files2.insert(path.clone(), Value::Dictionary(dict));
        }

        let mut root = Dictionary::new();
        root.insert("files".into(), Value::Dictionary(files));
        root.insert("files2".into(), Value::Dictionary(files2));
        root.insert("rules".into(), Value::Dictionary(rules()));
        root.insert("rules2".into(), Value::Dictionary(rules2()));

        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, &Value::Dictionary(root))?;
        Ok(buf)
    }

    /// Write `_CodeSignature/CodeResources`, replacing any previous one.
    ///
    /// Returns the written bytes; their digest goes into special slot -3 of
    /// the bundle executable when that executable is signed afterwards.
    pub fn write(&self) -> Result<Vec<u8>> {
        let data = self.to_plist()?;
        fs::create_dir_all(self.bundle_path.join(CODE_SIGNATURE_DIR))?;
        fs::write(self.bundle_path.join(CODE_RESOURCES_PATH), &data)?;
        debug!(bundle = %self.bundle_path.display(), "wrote CodeResources");
        Ok(data)
    }

    /// Recompute the digests of a signed bundle and compare them with its
    /// recorded manifest.
    ///
    /// `exclude` must match what the manifest was built with. An empty
    /// result means the bundle is intact.
    pub fn verify(bundle_path: impl AsRef<Path>, exclude: &[&str]) -> Result<Vec<ManifestMismatch>> {
        let bundle_path = bundle_path.as_ref();
        let recorded = read_recorded(&bundle_path.join(CODE_RESOURCES_PATH))?;
        let recorded_paths: BTreeSet<&String> = recorded.keys().collect();

        let current = Self::scan(bundle_path, exclude)?;
        let mut mismatches = Vec::new();
        for (path, entry) in &current.files {
            match recorded.get(path) {
                Some(expected) if expected.matches(entry) => {}
                Some(_) => mismatches.push(ManifestMismatch::Modified(path.clone())),
                None => mismatches.push(ManifestMismatch::Added(path.clone())),
            }
        }
        for path in recorded_paths {
            if !current.files.contains_key(path) {
                mismatches.push(ManifestMismatch::Missing(path.clone()));
            }
        }

        if !mismatches.is_empty() {
            warn!(bundle = %bundle_path.display(), count = mismatches.len(), "manifest mismatch");
        }
        Ok(mismatches)
    }
}

/// Digest recorded in an existing manifest.
enum Recorded {
    Sha256(Vec<u8>),
    Sha1(Vec<u8>),
    Symlink(String),
}

impl Recorded {
    fn matches(&self, entry: &FileEntry) -> bool {
        match self {
            Recorded::Sha256(hash) => entry.symlink.is_none() && hash.as_slice() == entry.sha256,
            Recorded::Sha1(hash) => hash.as_slice() == entry.sha1,
            Recorded::Symlink(target) => entry.symlink.as_deref() == Some(target.as_str()),
        }
    }
}

fn read_recorded(path: &Path) -> Result<BTreeMap<String, Recorded>> {
    let root = Value::from_file(path)?
        .into_dictionary()
        .ok_or_else(|| Error::Signing("CodeResources is not a dictionary".into()))?;

    let mut recorded = BTreeMap::new();
    if let Some(files) = root.get("files").and_then(Value::as_dictionary) {
        for (path, value) in files {
            let hash = match value {
                Value::Data(hash) => Some(hash.clone()),
                Value::Dictionary(dict) => dict.get("hash").and_then(Value::as_data).map(<[u8]>::to_vec),
                _ => None,
            };
            if let Some(hash) = hash {
                recorded.insert(path.clone(), Recorded::Sha1(hash));
            }
        }
    }
    // files2 takes precedence: it carries SHA-256 and symlinks
    if let Some(files2) = root.get("files2").and_then(Value::as_dictionary) {
        for (path, value) in files2 {
            let Some(dict) = value.as_dictionary() else {
                continue;
            };
            if let Some(target) = dict.get("symlink").and_then(Value::as_string) {
                recorded.insert(path.clone(), Recorded::Symlink(target.to_string()));
            } else if let Some(hash) = dict.get("hash2").and_then(Value::as_data) {
                recorded.insert(path.clone(), Recorded::Sha256(hash.to_vec()));
            }
        }
    }
    Ok(recorded)
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut out = String::new();
    for component in relative.components() {
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(&component.as_os_str().to_string_lossy());
    }
    (!out.is_empty()).then_some(out)
}

fn is_code_signature(relative: &str) -> bool {
    relative == CODE_SIGNATURE_DIR || relative.starts_with("_CodeSignature/")
}

fn omitted_from_files2(path: &str) -> bool {
    path == "Info.plist" || path == "PkgInfo" || path.ends_with(".DS_Store")
}

fn hash_entry(path: &Path, is_symlink: bool) -> Result<FileEntry> {
    if is_symlink {
        let target = fs::read_link(path)?.to_string_lossy().into_owned();
        Ok(FileEntry::from_bytes(target.as_bytes(), Some(target.clone())))
    } else {
        Ok(FileEntry::from_bytes(&fs::read(path)?, None))
    }
}

fn rule(optional: bool, omit: bool, weight: f64) -> Value {
    let mut dict = Dictionary::new();
    if optional {
        dict.insert("optional".into(), Value::Boolean(true));
    }
    if omit {
        dict.insert("omit".into(), Value::Boolean(true));
    }
    dict.insert("weight".into(), Value::Real(weight));
    Value::Dictionary(dict)
}

fn rules() -> Dictionary {
    let mut rules = Dictionary::new();
    rules.insert("^.*".into(), Value::Boolean(true));
    rules.insert("^.*\\.lproj/".into(), rule(true, false, 1000.0));
    rules.insert("^.*\\.lproj/locversion.plist$".into(), rule(false, true, 1100.0));
    rules.insert("^Base\\.lproj/".into(), rule(false, false, 1010.0));
    rules.insert("^version.plist$".into(), Value::Boolean(true));
    rules
}

fn rules2() -> Dictionary {
    let mut rules = Dictionary::new();
    rules.insert(".*\\.dSYM($|/)".into(), rule(false, false, 11.0));
    rules.insert("^(.*/)?\\.DS_Store$".into(), rule(false, true, 2000.0));
    rules.insert("^.*".into(), Value::Boolean(true));
    rules.insert("^.*\\.lproj/".into(), rule(true, false, 1000.0));
    rules.insert("^.*\\.lproj/locversion.plist$".into(), rule(false, true, 1100.0));
    rules.insert("^Base\\.lproj/".into(), rule(false, false, 1010.0));
    rules.insert("^Info\\.plist$".into(), rule(false, true, 20.0));
    rules.insert("^PkgInfo$".into(), rule(false, true, 20.0));
    rules.insert("^embedded\\.provisionprofile$".into(), rule(false, false, 20.0));
    rules.insert("^version\\.plist$".into(), rule(false, false, 20.0));
    rules
}
