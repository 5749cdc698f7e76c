//! IPA extraction.
//!
//! An IPA is a ZIP archive with exactly one `Payload/<Name>.app` bundle.
//! Entries are inflated in parallel from a memory map of the archive.

use std::fs::{self, File};
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use rayon::prelude::*;
use tracing::debug;
use zip::ZipArchive;

use crate::{Error, Result};

/// Unix file type bits of a symbolic link.
const S_IFLNK: u32 = 0o120000;
const S_IFMT: u32 = 0o170000;

struct ExtractEntry {
    index: usize,
    outpath: PathBuf,
    is_symlink: bool,
    unix_mode: Option<u32>,
}

/// Check that `ipa_path` exists and starts with a ZIP local header.
pub fn validate_ipa(ipa_path: impl AsRef<Path>) -> Result<()> {
    let ipa_path = ipa_path.as_ref();
    let mut file = File::open(ipa_path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => Error::ExtractionFailed("IPA file not found".into()),
        _ => e.into(),
    })?;

    let mut magic = [0u8; 4];
    if file.read_exact(&mut magic).is_err() || magic != *b"PK\x03\x04" {
        return Err(Error::ExtractionFailed("not a ZIP archive".into()));
    }
    Ok(())
}

/// Unpack `ipa_path` into `dest_dir` and return the single `.app` bundle.
///
/// Fails with [`Error::ExtractionFailed`] when the archive is not a ZIP or
/// `Payload/` holds zero or several application bundles.
pub fn extract_ipa(ipa_path: impl AsRef<Path>, dest_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let ipa_path = ipa_path.as_ref();
    let dest_dir = dest_dir.as_ref();
    validate_ipa(ipa_path)?;

    let file = File::open(ipa_path)?;
    // SAFETY: the archive is opened read-only and lives in a scratch copy
    // or a caller-owned file that is not modified while signing
    let mmap = unsafe { Mmap::map(&file)? };
    let mut archive = ZipArchive::new(Cursor::new(&mmap[..]))
        .map_err(|e| Error::ExtractionFailed(format!("unreadable archive: {e}")))?;

    fs::create_dir_all(dest_dir)?;
    let mut entries = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let entry = archive.by_index(index)?;
        // Entries escaping the destination are skipped
        let Some(name) = entry.enclosed_name() else {
            continue;
        };
        let outpath = dest_dir.join(name);
        if entry.is_dir() {
            fs::create_dir_all(&outpath)?;
            continue;
        }
        if let Some(parent) = outpath.parent() {
            fs::create_dir_all(parent)?;
        }
        let unix_mode = entry.unix_mode();
        entries.push(ExtractEntry {
            index,
            outpath,
            is_symlink: unix_mode.is_some_and(|mode| mode & S_IFMT == S_IFLNK),
            unix_mode,
        });
    }

    entries.par_iter().try_for_each(|entry| -> Result<()> {
        // ZipArchive is not Sync; each worker opens its own view of the map
        let mut archive = ZipArchive::new(Cursor::new(&mmap[..]))?;
        let mut file = archive.by_index(entry.index)?;
        if entry.is_symlink {
            let mut target = String::new();
            file.read_to_string(&mut target)?;
            return write_symlink(&target, &entry.outpath);
        }

        let mut outfile = File::create(&entry.outpath)?;
        io::copy(&mut file, &mut outfile)?;
        set_mode(&entry.outpath, entry.unix_mode)?;
        Ok(())
    })?;

    debug!(entries = entries.len(), dest = %dest_dir.display(), "extracted IPA");
    find_app_bundle(dest_dir)
}

/// What an IPA holds, read from its central directory without unpacking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpaInfo {
    /// Bundle directory name, such as `Example.app`
    pub app_name: String,
    pub bundle_id: Option<String>,
    pub display_name: Option<String>,
}

/// Read the bundle name and `Info.plist` identifiers of `ipa_path`.
///
/// Applies the same exactly-one-bundle rule as [`extract_ipa`].
pub fn inspect_ipa(ipa_path: impl AsRef<Path>) -> Result<IpaInfo> {
    let ipa_path = ipa_path.as_ref();
    validate_ipa(ipa_path)?;
    let mut archive = ZipArchive::new(File::open(ipa_path)?)
        .map_err(|e| Error::ExtractionFailed(format!("unreadable archive: {e}")))?;

    let mut apps: Vec<String> = archive
        .file_names()
        .filter_map(|name| name.strip_prefix("Payload/"))
        .filter_map(|rest| rest.split('/').next())
        .filter(|first| first.ends_with(".app"))
        .map(str::to_string)
        .collect();
    apps.sort();
    apps.dedup();
    let app_name = match apps.len() {
        1 => apps.remove(0),
        0 => return Err(Error::ExtractionFailed("no application bundle in Payload".into())),
        n => {
            return Err(Error::ExtractionFailed(format!(
                "expected one application bundle in Payload, found {n}"
            )))
        }
    };

    let info = match archive.by_name(&format!("Payload/{app_name}/Info.plist")) {
        Ok(mut file) => {
            let mut data = Vec::new();
            file.read_to_end(&mut data)?;
            plist::from_bytes::<plist::Value>(&data)
                .ok()
                .and_then(plist::Value::into_dictionary)
        }
        Err(_) => None,
    };
    let field = |key: &str| {
        info.as_ref()
            .and_then(|d| d.get(key))
            .and_then(plist::Value::as_string)
            .map(str::to_string)
    };

    Ok(IpaInfo {
        bundle_id: field("CFBundleIdentifier"),
        display_name: field("CFBundleDisplayName").or_else(|| field("CFBundleName")),
        app_name,
    })
}

#[cfg(unix)]
fn write_symlink(target: &str, link: &Path) -> Result<()> {
    if link.symlink_metadata().is_ok() {
        fs::remove_file(link)?;
    }
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_symlink(target: &str, link: &Path) -> Result<()> {
    fs::write(link, target)?;
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: Option<u32>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if let Some(mode) = mode {
        fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: Option<u32>) -> Result<()> {
    Ok(())
}

/// The one `.app` directory under `Payload/`.
pub(crate) fn find_app_bundle(dest_dir: &Path) -> Result<PathBuf> {
    let payload = dest_dir.join("Payload");
    if !payload.is_dir() {
        return Err(Error::ExtractionFailed("archive has no Payload directory".into()));
    }

    let mut apps = Vec::new();
    for entry in fs::read_dir(&payload)? {
        let path = entry?.path();
        if path.is_dir() && path.extension().is_some_and(|ext| ext == "app") {
            apps.push(path);
        }
    }

    match apps.len() {
        1 => Ok(apps.remove(0)),
        0 => Err(Error::ExtractionFailed("no application bundle in Payload".into())),
        n => Err(Error::ExtractionFailed(format!(
            "expected one application bundle in Payload, found {n}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn write_ipa(dir: &Path, apps: &[&str]) -> PathBuf {
        let path = dir.join("test.ipa");
        let mut zip = ZipWriter::new(File::create(&path).unwrap());
        let options = SimpleFileOptions::default();
        zip.add_directory("Payload/", options).unwrap();
        for app in apps {
            zip.add_directory(format!("Payload/{app}/"), options).unwrap();
            zip.start_file(format!("Payload/{app}/Info.plist"), options)
                .unwrap();
            zip.write_all(b"<plist/>").unwrap();
            zip.start_file(
                format!("Payload/{app}/Exec"),
                options.unix_permissions(0o755),
            )
            .unwrap();
            zip.write_all(b"binary").unwrap();
        }
        zip.finish().unwrap();
        path
    }

    #[test]
    fn test_validate_rejects_non_zip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.ipa");
        fs::write(&path, b"not a zip").unwrap();
        assert!(matches!(validate_ipa(&path), Err(Error::ExtractionFailed(_))));
        assert!(matches!(
            validate_ipa(dir.path().join("missing.ipa")),
            Err(Error::ExtractionFailed(_))
        ));
    }

    #[test]
    fn test_extract_single_app() {
        let dir = TempDir::new().unwrap();
        let ipa = write_ipa(dir.path(), &["Test.app"]);
        let out = dir.path().join("out");
        let app = extract_ipa(&ipa, &out).unwrap();
        assert_eq!(app, out.join("Payload/Test.app"));
        assert_eq!(fs::read(app.join("Exec")).unwrap(), b"binary");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(app.join("Exec")).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[test]
    fn test_extract_requires_exactly_one_app() {
        let dir = TempDir::new().unwrap();
        let none = write_ipa(dir.path(), &[]);
        assert!(matches!(
            extract_ipa(&none, dir.path().join("none")),
            Err(Error::ExtractionFailed(_))
        ));

        let two = write_ipa(dir.path(), &["A.app", "B.app"]);
        let err = extract_ipa(&two, dir.path().join("two")).unwrap_err();
        assert!(matches!(err, Error::ExtractionFailed(msg) if msg.contains("found 2")));
    }

    #[test]
    fn test_inspect_without_extracting() {
        let dir = TempDir::new().unwrap();
        let ipa = write_ipa(dir.path(), &["Test.app"]);
        let info = inspect_ipa(&ipa).unwrap();
        assert_eq!(info.app_name, "Test.app");
        // `<plist/>` has no dictionary
        assert_eq!(info.bundle_id, None);

        let two = write_ipa(dir.path(), &["A.app", "B.app"]);
        assert!(matches!(inspect_ipa(&two), Err(Error::ExtractionFailed(_))));
    }

    #[test]
    #[cfg(unix)]
    fn test_extract_restores_symlinks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("links.ipa");
        let mut zip = ZipWriter::new(File::create(&path).unwrap());
        let options = SimpleFileOptions::default();
        zip.add_directory("Payload/Test.app/", options).unwrap();
        zip.start_file("Payload/Test.app/Real", options).unwrap();
        zip.write_all(b"content").unwrap();
        zip.add_symlink("Payload/Test.app/Link", "Real", options).unwrap();
        zip.finish().unwrap();

        let app = extract_ipa(&path, dir.path().join("out")).unwrap();
        let link = app.join("Link");
        assert!(link.symlink_metadata().unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("Real"));
    }
}
