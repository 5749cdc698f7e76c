//! IPA signing.
//!
//! [`SigningEngine`] takes an IPA, an identity and a provisioning profile and
//! produces a signed IPA. The stages run strictly in order:
//!
//! 1. extract the archive and locate the single `.app` bundle
//! 2. resolve the signing identity
//! 3. install the profile and apply the target bundle identifier
//! 4. sign `Frameworks/` (frameworks get their own manifest first)
//! 5. sign the main executable with the profile's entitlements
//! 6. write `_CodeSignature/CodeResources` over the final bundle
//! 7. repackage into a scratch IPA
//! 8. atomically replace the output file
//!
//! Every stage works inside one scratch directory that is removed on every
//! exit path, so a failed run leaves nothing at the output path.

pub mod archive;
pub mod extract;

pub use archive::{create_ipa, CompressionLevel};
pub use extract::{extract_ipa, inspect_ipa, validate_ipa, IpaInfo};

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use plist::{Dictionary, Value};
use secrecy::SecretString;
use tempfile::{NamedTempFile, TempDir};
use tracing::{debug, info, warn};

use crate::bundle::BundleManifest;
use crate::crypto::{ProvisioningProfile, SigningIdentity};
use crate::macho::{is_macho, sign_file, SignOptions};
use crate::{Error, Result};

/// File name of the installed provisioning profile.
pub const EMBEDDED_PROFILE: &str = "embedded.mobileprovision";

/// Where the signing identity comes from.
pub enum IdentitySource {
    /// A PKCS#12 container and its passphrase
    Pkcs12 {
        data: Vec<u8>,
        passphrase: SecretString,
    },
    /// An identity assembled by the caller, e.g. from developer services
    Resolved(SigningIdentity),
}

impl fmt::Debug for IdentitySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentitySource::Pkcs12 { data, .. } => {
                f.debug_struct("Pkcs12").field("len", &data.len()).finish_non_exhaustive()
            }
            IdentitySource::Resolved(identity) => f.debug_tuple("Resolved").field(identity).finish(),
        }
    }
}

/// Inputs of one signing run.
#[derive(Debug)]
pub struct SignRequest {
    pub ipa_path: PathBuf,
    pub output_path: PathBuf,
    pub identity: IdentitySource,
    pub profile: ProvisioningProfile,
    /// Bundle identifier to sign as; defaults to the profile's
    pub bundle_id: Option<String>,
}

/// Progress report emitted after each stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    /// Fraction of the run completed, in `[0, 1]`
    pub fraction: f64,
    pub label: &'static str,
    pub complete: bool,
}

/// Stage labels and the fraction reached once each finishes.
const STAGES: [(f64, &str); 8] = [
    (0.1, "Extracting IPA"),
    (0.2, "Loading certificate"),
    (0.3, "Installing profile"),
    (0.4, "Signing frameworks"),
    (0.6, "Signing main binary"),
    (0.8, "Generating code signature"),
    (0.9, "Repackaging IPA"),
    (1.0, "Complete"),
];

/// Re-signs IPAs.
///
/// # Examples
///
/// ```no_run
/// use iloader::crypto::ProvisioningProfile;
/// use iloader::ipa::{IdentitySource, SignRequest, SigningEngine};
/// use secrecy::SecretString;
///
/// # async fn demo() -> iloader::Result<()> {
/// let request = SignRequest {
///     ipa_path: "App.ipa".into(),
///     output_path: "App-signed.ipa".into(),
///     identity: IdentitySource::Pkcs12 {
///         data: std::fs::read("dev.p12")?,
///         passphrase: SecretString::new("password".into()),
///     },
///     profile: ProvisioningProfile::parse(std::fs::read("dev.mobileprovision")?)?,
///     bundle_id: None,
/// };
/// let output = SigningEngine::default()
///     .sign(request, |p| println!("{:>3.0}% {}", p.fraction * 100.0, p.label))
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct SigningEngine {
    compression_level: CompressionLevel,
}

impl SigningEngine {
    pub fn new(compression_level: CompressionLevel) -> Self {
        Self { compression_level }
    }

    /// Run the signing pipeline on the blocking thread pool.
    pub async fn sign<F>(&self, request: SignRequest, progress: F) -> Result<PathBuf>
    where
        F: FnMut(Progress) + Send + 'static,
    {
        let engine = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut progress = progress;
            engine.sign_blocking(request, &mut progress)
        })
        .await
        .map_err(|e| Error::Signing(format!("signing task failed: {e}")))?
    }

    /// Run the signing pipeline on the current thread.
    pub fn sign_blocking(
        &self,
        request: SignRequest,
        progress: &mut dyn FnMut(Progress),
    ) -> Result<PathBuf> {
        let mut stages = STAGES.iter();
        let mut report = |complete: bool| {
            if let Some(&(fraction, label)) = stages.next() {
                debug!(label, fraction, "signing stage finished");
                progress(Progress {
                    fraction,
                    label,
                    complete,
                });
            }
        };

        let scratch = TempDir::new()?;
        let app = extract_ipa(&request.ipa_path, scratch.path().join("extracted"))?;
        report(false);

        let identity = resolve_identity(request.identity)?;
        if let (Some(cert_team), Some(profile_team)) = (identity.team_id(), request.profile.team_id()) {
            if cert_team != profile_team {
                warn!(cert_team, profile_team, "certificate and profile belong to different teams");
            }
        }
        report(false);

        let bundle_id = install_profile(&app, &request.profile, request.bundle_id.as_deref())?;
        report(false);

        sign_frameworks(&app, &identity)?;
        report(false);

        let entitlements = request.profile.entitlements();
        sign_main_executable(&app, &bundle_id, &identity, &entitlements)?;
        report(false);

        BundleManifest::scan(&app, &[])?.write()?;
        report(false);

        let signed_ipa = scratch.path().join("signed.ipa");
        create_ipa(&app, &signed_ipa, self.compression_level)?;
        if fs::metadata(&signed_ipa).map(|m| m.len()).unwrap_or(0) == 0 {
            return Err(Error::RepackageFailed("repackaged IPA is empty".into()));
        }
        report(false);

        publish(&signed_ipa, &request.output_path)?;
        info!(output = %request.output_path.display(), bundle_id = %bundle_id, "signed IPA");
        report(true);
        Ok(request.output_path)
    }
}

fn resolve_identity(source: IdentitySource) -> Result<SigningIdentity> {
    match source {
        IdentitySource::Resolved(identity) => Ok(identity),
        IdentitySource::Pkcs12 { data, passphrase } => {
            if data.is_empty() {
                return Err(Error::CertificateNotFound);
            }
            SigningIdentity::from_p12(&data, &passphrase).map_err(|e| {
                warn!(error = %e, "PKCS#12 container unusable");
                match e {
                    Error::Certificate(_) => Error::CertificateNotFound,
                    other => other,
                }
            })
        }
    }
}

/// `Info.plist` of a bundle, kept with its on-disk format.
struct InfoPlist {
    path: PathBuf,
    dict: Dictionary,
    binary: bool,
}

impl InfoPlist {
    fn read(bundle: &Path) -> Result<Self> {
        let path = bundle.join("Info.plist");
        let data = fs::read(&path)?;
        let dict = plist::from_bytes::<Value>(&data)?
            .into_dictionary()
            .ok_or_else(|| Error::Signing("Info.plist is not a dictionary".into()))?;
        Ok(Self {
            path,
            dict,
            binary: data.starts_with(b"bplist00"),
        })
    }

    fn string(&self, key: &str) -> Option<&str> {
        self.dict.get(key).and_then(Value::as_string)
    }

    fn executable(&self, bundle: &Path) -> PathBuf {
        let name = self.string("CFBundleExecutable").map(str::to_string).unwrap_or_else(|| {
            bundle
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default()
        });
        bundle.join(name)
    }

    fn write(&self) -> Result<()> {
        let value = Value::Dictionary(self.dict.clone());
        if self.binary {
            value.to_file_binary(&self.path)?;
        } else {
            value.to_file_xml(&self.path)?;
        }
        Ok(())
    }
}

/// Install the profile and settle the bundle identifier to sign as.
fn install_profile(
    app: &Path,
    profile: &ProvisioningProfile,
    requested: Option<&str>,
) -> Result<String> {
    fs::write(app.join(EMBEDDED_PROFILE), profile.data())?;

    let mut info = InfoPlist::read(app)?;
    let current = info.string("CFBundleIdentifier").map(str::to_string);
    let target = requested
        .or_else(|| profile.bundle_id())
        .map(str::to_string)
        .or(current.clone())
        .ok_or_else(|| Error::Signing("bundle has no CFBundleIdentifier".into()))?;

    if current.as_deref() != Some(target.as_str()) {
        debug!(from = ?current, to = %target, "rewriting bundle identifier");
        info.dict.insert("CFBundleIdentifier".into(), Value::String(target.clone()));
        info.write()?;
    }
    Ok(target)
}

fn sign_frameworks(app: &Path, identity: &SigningIdentity) -> Result<()> {
    let frameworks = app.join("Frameworks");
    if !frameworks.is_dir() {
        return Ok(());
    }

    let mut entries = fs::read_dir(&frameworks)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort();

    let empty = Dictionary::new();
    for path in entries {
        let extension = path.extension().and_then(|e| e.to_str());
        if path.is_dir() && extension == Some("framework") {
            sign_framework(&path, identity, &empty)?;
        } else if path.is_file() && extension == Some("dylib") {
            if !is_macho(&fs::read(&path)?) {
                warn!(path = %path.display(), "skipping non Mach-O dylib");
                continue;
            }
            let identifier = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            sign_file(
                &path,
                &SignOptions {
                    identifier: &identifier,
                    identity,
                    entitlements: &empty,
                    info_plist: None,
                    resources: None,
                    main_executable: false,
                },
            )?;
        }
    }
    Ok(())
}

/// Manifest first, then the executable with the manifest digest in slot -3.
fn sign_framework(framework: &Path, identity: &SigningIdentity, empty: &Dictionary) -> Result<()> {
    let info = InfoPlist::read(framework)?;
    let executable = info.executable(framework);
    let executable_name = executable
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let identifier = info
        .string("CFBundleIdentifier")
        .map(str::to_string)
        .unwrap_or_else(|| executable_name.clone());

    let resources = BundleManifest::scan(framework, &[executable_name.as_str()])?.write()?;
    if !executable.is_file() {
        warn!(framework = %framework.display(), "framework has no executable");
        return Ok(());
    }

    let info_bytes = fs::read(framework.join("Info.plist"))?;
    sign_file(
        &executable,
        &SignOptions {
            identifier: &identifier,
            identity,
            entitlements: empty,
            info_plist: Some(&info_bytes),
            resources: Some(&resources),
            main_executable: false,
        },
    )
}

fn sign_main_executable(
    app: &Path,
    bundle_id: &str,
    identity: &SigningIdentity,
    entitlements: &Dictionary,
) -> Result<()> {
    let info = InfoPlist::read(app)?;
    let executable = info.executable(app);
    if !executable.is_file() {
        return Err(Error::Signing("main executable not found".into()));
    }
    let info_bytes = fs::read(&info.path)?;
    sign_file(
        &executable,
        &SignOptions {
            identifier: bundle_id,
            identity,
            entitlements,
            info_plist: Some(&info_bytes),
            resources: None,
            main_executable: true,
        },
    )
}

/// Copy `source` next to `output` and rename it into place.
fn publish(source: &Path, output: &Path) -> Result<()> {
    let parent = output
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let mut staged = NamedTempFile::new_in(parent)?;
    std::io::copy(&mut fs::File::open(source)?, staged.as_file_mut())?;
    staged.as_file().sync_all()?;
    staged.persist(output).map_err(|e| Error::from(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::CODE_RESOURCES_PATH;
    use crate::codesign::constants::CSSLOT_CODEDIRECTORY;
    use crate::codesign::SuperBlob;
    use crate::crypto::identity::tests::test_identity;
    use crate::crypto::profile::tests::test_profile;
    use crate::macho::embedded_signature;
    use crate::macho::test_support::minimal_macho;
    use std::io::Write;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn write_ipa(path: &Path, frameworks: bool) {
        let mut info = Dictionary::new();
        info.insert("CFBundleIdentifier".into(), Value::String("com.original.app".into()));
        info.insert("CFBundleExecutable".into(), Value::String("App".into()));
        let mut info_xml = Vec::new();
        plist::to_writer_xml(&mut info_xml, &Value::Dictionary(info)).unwrap();

        let mut zip = ZipWriter::new(fs::File::create(path).unwrap());
        let options = SimpleFileOptions::default();
        zip.start_file("Payload/App.app/Info.plist", options).unwrap();
        zip.write_all(&info_xml).unwrap();
        zip.start_file("Payload/App.app/App", options.unix_permissions(0o755))
            .unwrap();
        zip.write_all(&minimal_macho(true)).unwrap();
        if frameworks {
            zip.start_file("Payload/App.app/Frameworks/libswift.dylib", options)
                .unwrap();
            zip.write_all(&minimal_macho(false)).unwrap();
        }
        zip.finish().unwrap();
    }

    fn request(dir: &Path, frameworks: bool) -> SignRequest {
        let ipa = dir.join("in.ipa");
        write_ipa(&ipa, frameworks);
        SignRequest {
            ipa_path: ipa,
            output_path: dir.join("out/signed.ipa"),
            identity: IdentitySource::Resolved(test_identity("Apple Development: t", "TEAM123456")),
            profile: ProvisioningProfile::parse(test_profile("TEAM123456", "com.example.app")).unwrap(),
            bundle_id: None,
        }
    }

    #[test]
    fn test_sign_produces_signed_bundle() {
        let dir = TempDir::new().unwrap();
        let mut reports = Vec::new();
        let output = SigningEngine::default()
            .sign_blocking(request(dir.path(), true), &mut |p| reports.push(p))
            .unwrap();

        let unpacked = dir.path().join("check");
        let app = extract_ipa(&output, &unpacked).unwrap();
        assert!(app.join(EMBEDDED_PROFILE).is_file());
        assert!(app.join(CODE_RESOURCES_PATH).is_file());
        assert!(BundleManifest::verify(&app, &[]).unwrap().is_empty());

        let info = InfoPlist::read(&app).unwrap();
        assert_eq!(info.string("CFBundleIdentifier"), Some("com.example.app"));

        for binary in ["App", "Frameworks/libswift.dylib"] {
            let data = fs::read(app.join(binary)).unwrap();
            let blob = SuperBlob::parse(embedded_signature(&data).unwrap()).unwrap();
            assert!(blob.get(CSSLOT_CODEDIRECTORY).is_some());
        }

        let labels: Vec<_> = reports.iter().map(|p| p.label).collect();
        assert_eq!(labels, STAGES.iter().map(|s| s.1).collect::<Vec<_>>());
        assert!(reports.windows(2).all(|w| w[0].fraction < w[1].fraction));
        assert!(reports.last().unwrap().complete);
        assert!(reports[..reports.len() - 1].iter().all(|p| !p.complete));
    }

    #[test]
    fn test_explicit_bundle_id_wins() {
        let dir = TempDir::new().unwrap();
        let mut req = request(dir.path(), false);
        req.bundle_id = Some("com.example.other".into());
        let output = SigningEngine::default().sign_blocking(req, &mut |_| {}).unwrap();
        let app = extract_ipa(&output, dir.path().join("check")).unwrap();
        let info = InfoPlist::read(&app).unwrap();
        assert_eq!(info.string("CFBundleIdentifier"), Some("com.example.other"));
    }

    #[test]
    fn test_unusable_p12_reports_missing_certificate() {
        let dir = TempDir::new().unwrap();
        let mut req = request(dir.path(), false);
        req.identity = IdentitySource::Pkcs12 {
            data: b"garbage".to_vec(),
            passphrase: SecretString::new("pw".into()),
        };
        let output = req.output_path.clone();
        let err = SigningEngine::default().sign_blocking(req, &mut |_| {}).unwrap_err();
        assert!(matches!(err, Error::CertificateNotFound));
        assert!(!output.exists());
    }

    #[test]
    fn test_publish_replaces_existing_output() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source");
        let output = dir.path().join("out/target.ipa");
        fs::write(&source, b"new").unwrap();
        fs::create_dir_all(output.parent().unwrap()).unwrap();
        fs::write(&output, b"old").unwrap();
        publish(&source, &output).unwrap();
        assert_eq!(fs::read(&output).unwrap(), b"new");
        assert_eq!(fs::read_dir(output.parent().unwrap()).unwrap().count(), 1);
    }
}
