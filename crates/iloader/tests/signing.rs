mod common;

use std::fs;
use std::path::Path;

use iloader::bundle::CODE_RESOURCES_PATH;
use iloader::codesign::SuperBlob;
use iloader::crypto::{ProvisioningProfile, SigningIdentity};
use iloader::macho::embedded_signature;
use iloader::{extract_ipa, BundleManifest, Error, IdentitySource, SignRequest, SigningEngine};
use tempfile::TempDir;

const BUNDLE_ID: &str = "com.example.app";

fn request(dir: &Path, apps: &[&str]) -> SignRequest {
    let ipa = dir.join("in.ipa");
    common::write_ipa(&ipa, apps, "com.original.app");
    let credentials = common::test_credentials();
    SignRequest {
        ipa_path: ipa,
        output_path: dir.join("out/signed.ipa"),
        identity: IdentitySource::Resolved(
            SigningIdentity::from_der(&credentials.certificate_der, &credentials.pkcs8_der).unwrap(),
        ),
        profile: ProvisioningProfile::parse(common::test_profile(common::TEAM_ID, BUNDLE_ID))
            .unwrap(),
        bundle_id: Some(BUNDLE_ID.into()),
    }
}

#[tokio::test]
async fn test_minimal_ipa_is_signed() {
    let dir = TempDir::new().unwrap();
    let output = SigningEngine::default()
        .sign(request(dir.path(), &["Mock"]), |_| {})
        .await
        .unwrap();
    assert_eq!(output, dir.path().join("out/signed.ipa"));

    let app = extract_ipa(&output, dir.path().join("check")).unwrap();
    assert!(app.join("embedded.mobileprovision").is_file());
    assert!(app.join(CODE_RESOURCES_PATH).is_file());
    assert!(!app.join("Frameworks").exists());

    let manifest = BundleManifest::scan(&app, &[]).unwrap();
    let paths: Vec<&str> = manifest.paths().collect();
    assert!(paths.contains(&"App"));
    assert!(!paths.iter().any(|p| p.starts_with("Frameworks/")));
    assert!(BundleManifest::verify(&app, &[]).unwrap().is_empty());

    let executable = fs::read(app.join("App")).unwrap();
    let blob = SuperBlob::parse(embedded_signature(&executable).unwrap()).unwrap();
    assert!(!blob.slots().is_empty());
}

#[tokio::test]
async fn test_ipa_without_app_fails_cleanly() {
    let dir = TempDir::new().unwrap();
    let req = request(dir.path(), &[]);
    let output = req.output_path.clone();
    let err = SigningEngine::default().sign(req, |_| {}).await.unwrap_err();
    assert!(matches!(err, Error::ExtractionFailed(_)));
    assert!(!output.exists());
}

#[tokio::test]
async fn test_ipa_with_two_apps_fails_cleanly() {
    let dir = TempDir::new().unwrap();
    let req = request(dir.path(), &["One", "Two"]);
    let output = req.output_path.clone();
    let err = SigningEngine::default().sign(req, |_| {}).await.unwrap_err();
    assert!(matches!(err, Error::ExtractionFailed(_)));
    assert!(!output.exists());
}
