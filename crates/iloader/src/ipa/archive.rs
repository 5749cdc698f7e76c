//! IPA repackaging.
//!
//! Writes a signed `.app` bundle back into a `Payload/` archive. Unix modes
//! and symbolic links are kept so framework version links survive.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use tracing::debug;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::{Error, Result};

/// ZIP compression level for repackaged IPAs.
///
/// # Examples
///
/// ```
/// use iloader::ipa::CompressionLevel;
///
/// assert_eq!(CompressionLevel::new(15).level(), 9);
/// assert_eq!(CompressionLevel::default().level(), 6);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionLevel(u32);

impl CompressionLevel {
    /// Stored entries, no deflate.
    pub const NONE: CompressionLevel = CompressionLevel(0);
    pub const DEFAULT: CompressionLevel = CompressionLevel(6);
    pub const MAX: CompressionLevel = CompressionLevel(9);

    /// Clamp `level` to 0-9.
    #[must_use]
    pub fn new(level: u32) -> Self {
        CompressionLevel(level.min(9))
    }

    #[must_use]
    pub fn level(&self) -> u32 {
        self.0
    }

    fn options(self) -> SimpleFileOptions {
        if self.0 == 0 {
            SimpleFileOptions::default().compression_method(CompressionMethod::Stored)
        } else {
            SimpleFileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .compression_level(Some(i64::from(self.0)))
        }
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl From<u32> for CompressionLevel {
    fn from(level: u32) -> Self {
        CompressionLevel::new(level)
    }
}

/// Archive `app_bundle_path` as `Payload/<Name>.app` into `output_path`.
///
/// Fails with [`Error::RepackageFailed`] when the bundle is missing, is not
/// a directory or contains no files.
pub fn create_ipa(
    app_bundle_path: impl AsRef<Path>,
    output_path: impl AsRef<Path>,
    compression_level: CompressionLevel,
) -> Result<()> {
    let app_bundle_path = app_bundle_path.as_ref();
    let output_path = output_path.as_ref();

    if !app_bundle_path.is_dir() {
        return Err(Error::RepackageFailed("application bundle is missing".into()));
    }
    let app_name = app_bundle_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| Error::RepackageFailed("application bundle has no name".into()))?;

    let entries = WalkDir::new(app_bundle_path)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Io(e.into()))?;
    if !entries.iter().any(|e| !e.file_type().is_dir()) {
        return Err(Error::RepackageFailed("application bundle is empty".into()));
    }

    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let options = compression_level.options();
    let mut zip = ZipWriter::new(File::create(output_path)?);
    zip.add_directory("Payload/", options)?;

    for entry in &entries {
        let relative = entry
            .path()
            .strip_prefix(app_bundle_path)
            .map_err(|_| Error::RepackageFailed("entry outside bundle".into()))?;
        let mut archive_path = format!("Payload/{app_name}");
        for component in relative.components() {
            archive_path.push('/');
            archive_path.push_str(&component.as_os_str().to_string_lossy());
        }

        let file_type = entry.file_type();
        if file_type.is_dir() {
            zip.add_directory(format!("{archive_path}/"), options)?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            zip.add_symlink(archive_path, target.to_string_lossy(), options)?;
        } else {
            zip.start_file(archive_path, with_mode(options, entry.path())?)?;
            io::copy(&mut File::open(entry.path())?, &mut zip)?;
        }
    }

    zip.finish()?.flush()?;
    debug!(output = %output_path.display(), entries = entries.len(), "repackaged IPA");
    Ok(())
}

#[cfg(unix)]
fn with_mode(options: SimpleFileOptions, path: &Path) -> Result<SimpleFileOptions> {
    use std::os::unix::fs::PermissionsExt;
    let mode = fs::metadata(path)?.permissions().mode();
    Ok(options.unix_permissions(mode))
}

#[cfg(not(unix))]
fn with_mode(options: SimpleFileOptions, _path: &Path) -> Result<SimpleFileOptions> {
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;
    use zip::ZipArchive;

    fn app_bundle(dir: &Path) -> PathBuf {
        let app = dir.join("Test.app");
        fs::create_dir_all(app.join("_CodeSignature")).unwrap();
        fs::write(app.join("Info.plist"), b"<plist/>").unwrap();
        fs::write(app.join("Test"), b"binary").unwrap();
        fs::write(app.join("_CodeSignature/CodeResources"), b"<plist/>").unwrap();
        app
    }

    fn names(ipa: &Path) -> Vec<String> {
        let mut archive = ZipArchive::new(File::open(ipa).unwrap()).unwrap();
        (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect()
    }

    #[test]
    fn test_create_ipa_layout() {
        let dir = TempDir::new().unwrap();
        let app = app_bundle(dir.path());
        let ipa = dir.path().join("out/signed.ipa");
        create_ipa(&app, &ipa, CompressionLevel::DEFAULT).unwrap();

        let names = names(&ipa);
        assert!(names.contains(&"Payload/".to_string()));
        assert!(names.contains(&"Payload/Test.app/Test".to_string()));
        assert!(names.contains(&"Payload/Test.app/_CodeSignature/CodeResources".to_string()));
    }

    #[test]
    fn test_stored_and_deflated_round_trip_contents() {
        let dir = TempDir::new().unwrap();
        let app = app_bundle(dir.path());
        for level in [CompressionLevel::NONE, CompressionLevel::MAX] {
            let ipa = dir.path().join(format!("out-{}.ipa", level.level()));
            create_ipa(&app, &ipa, level).unwrap();
            let mut archive = ZipArchive::new(File::open(&ipa).unwrap()).unwrap();
            let mut file = archive.by_name("Payload/Test.app/Test").unwrap();
            let mut data = Vec::new();
            io::Read::read_to_end(&mut file, &mut data).unwrap();
            assert_eq!(data, b"binary");
        }
    }

    #[test]
    fn test_missing_or_empty_bundle_fails() {
        let dir = TempDir::new().unwrap();
        let ipa = dir.path().join("out.ipa");
        assert!(matches!(
            create_ipa(dir.path().join("Missing.app"), &ipa, CompressionLevel::DEFAULT),
            Err(Error::RepackageFailed(_))
        ));

        let empty = dir.path().join("Empty.app");
        fs::create_dir_all(empty.join("Sub")).unwrap();
        assert!(matches!(
            create_ipa(&empty, &ipa, CompressionLevel::DEFAULT),
            Err(Error::RepackageFailed(_))
        ));
        assert!(!ipa.exists());
    }

    #[test]
    fn test_compression_level_clamps() {
        assert_eq!(CompressionLevel::NONE.level(), 0);
        assert_eq!(CompressionLevel::from(5).level(), 5);
        assert_eq!(CompressionLevel::new(42), CompressionLevel::MAX);
    }

    #[test]
    #[cfg(unix)]
    fn test_symlinks_are_preserved() {
        use std::os::unix::fs::symlink;

        let dir = TempDir::new().unwrap();
        let app = app_bundle(dir.path());
        let versions = app.join("Frameworks/Kit.framework/Versions");
        fs::create_dir_all(versions.join("A")).unwrap();
        fs::write(versions.join("A/Kit"), b"kit").unwrap();
        symlink("A", versions.join("Current")).unwrap();

        let ipa = dir.path().join("out.ipa");
        create_ipa(&app, &ipa, CompressionLevel::DEFAULT).unwrap();

        let mut archive = ZipArchive::new(File::open(&ipa).unwrap()).unwrap();
        let entry = archive
            .by_name("Payload/Test.app/Frameworks/Kit.framework/Versions/Current")
            .unwrap();
        assert_eq!(entry.unix_mode().map(|m| m & 0o170000), Some(0o120000));
    }
}
