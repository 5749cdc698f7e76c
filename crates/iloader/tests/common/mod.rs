//! Shared fixtures: a scripted Apple backend, synthetic IPAs and test
//! identities.

#![allow(dead_code)]

use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aes::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use iloader::auth::srp::{derive_password_key, PasswordProtocol, N_BYTES};
use iloader::{AnisetteHeaders, Config, HttpRequest, HttpResponse, HttpTransport, TransportError};
use num_bigint::BigUint;
use parking_lot::Mutex;
use plist::{Dictionary, Value};
use sha2::{Digest, Sha256};
use x509_certificate::{InMemorySigningKeyPair, X509CertificateBuilder};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

pub const ANISETTE: &str = "https://ani.test";
pub const GSA: &str = "https://gsa.test/grandslam/GsService2";
pub const DEVELOPER: &str = "https://developer.test/services/v1";
pub const TEAM_ID: &str = "TEAM123456";
pub const SERIAL: &str = "SERIAL0001";
pub const IDMS_TOKEN: &str = "idms-token-0001";

/// Configuration pointing every service at the mock.
pub fn config(dir: &Path) -> Config {
    Config {
        anisette_server: ANISETTE.into(),
        gsa_url: GSA.into(),
        developer_services_url: DEVELOPER.into(),
        data_dir: dir.join("data"),
        output_dir: dir.join("out"),
        ..Config::default()
    }
}

pub fn anisette_json() -> String {
    let pairs: Vec<String> = AnisetteHeaders::NAMES
        .iter()
        .map(|name| format!("\"{name}\": \"mock-{name}\""))
        .collect();
    format!("{{{}}}", pairs.join(", "))
}

fn hash(parts: &[&[u8]]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().to_vec()
}

fn pad(value: &BigUint) -> Vec<u8> {
    let bytes = value.to_bytes_be();
    let mut out = vec![0u8; N_BYTES.len() - bytes.len()];
    out.extend_from_slice(&bytes);
    out
}

/// Server half of the GSA SRP exchange for one account.
pub struct SrpServer {
    salt: Vec<u8>,
    iterations: u32,
    verifier: BigUint,
    private: BigUint,
    public: BigUint,
}

impl SrpServer {
    pub fn new(password: &str) -> Self {
        let n = BigUint::from_bytes_be(&N_BYTES);
        let g = BigUint::from(2u32);
        let salt = b"mock-salt-000001".to_vec();
        let iterations = 1000;
        let key = derive_password_key(password, &salt, iterations, PasswordProtocol::S2k);
        let x = BigUint::from_bytes_be(&hash(&[&salt, &hash(&[b":", &key])]));
        let verifier = g.modpow(&x, &n);
        let private = BigUint::from_bytes_be(&[0x3c; 32]);
        let k = BigUint::from_bytes_be(&hash(&[&N_BYTES, &pad(&g)]));
        let public = (k * &verifier + g.modpow(&private, &n)) % &n;
        Self {
            salt,
            iterations,
            verifier,
            private,
            public,
        }
    }

    fn session_key(&self, client_public: &[u8]) -> Vec<u8> {
        let n = BigUint::from_bytes_be(&N_BYTES);
        let a = BigUint::from_bytes_be(client_public);
        let u = BigUint::from_bytes_be(&hash(&[&pad(&a), &pad(&self.public)]));
        let premaster = (a * self.verifier.modpow(&u, &n)).modpow(&self.private, &n);
        hash(&[&premaster.to_bytes_be()])
    }

    /// M1 the client must send when it knows the password.
    fn expected_proof(&self, username: &str, client_public: &[u8]) -> Vec<u8> {
        let g = BigUint::from(2u32);
        let hn = hash(&[&N_BYTES]);
        let hg = hash(&[&pad(&g)]);
        let xor: Vec<u8> = hn.iter().zip(&hg).map(|(a, b)| a ^ b).collect();
        let a = BigUint::from_bytes_be(client_public);
        hash(&[
            &xor,
            &hash(&[username.as_bytes()]),
            &self.salt,
            &pad(&a),
            &pad(&self.public),
            &self.session_key(client_public),
        ])
    }
}

fn encrypt_spd(session_key: &[u8], token: &str) -> Vec<u8> {
    let derive = |label: &[u8]| {
        let mut mac = Hmac::<Sha256>::new_from_slice(session_key).unwrap();
        mac.update(label);
        mac.finalize().into_bytes().to_vec()
    };
    let mut dict = Dictionary::new();
    dict.insert("GsIdmsToken".into(), Value::String(token.into()));
    dict.insert("adsid".into(), Value::String("000999-00-mock".into()));
    let mut plaintext = Vec::new();
    plist::to_writer_xml(&mut plaintext, &Value::Dictionary(dict)).unwrap();

    let key = derive(b"extra data key:");
    let iv = derive(b"extra data iv:");
    cbc::Encryptor::<aes::Aes256>::new_from_slices(&key, &iv[..16])
        .unwrap()
        .encrypt_padded_vec_mut::<Pkcs7>(&plaintext)
}

fn status(ec: i64, em: &str, au: Option<&str>) -> Dictionary {
    let mut status = Dictionary::new();
    status.insert("ec".into(), Value::Integer(ec.into()));
    status.insert("em".into(), Value::String(em.into()));
    if let Some(au) = au {
        status.insert("au".into(), Value::String(au.into()));
    }
    let mut dict = Dictionary::new();
    dict.insert("Status".into(), Value::Dictionary(status));
    dict
}

fn plist_body(dict: Dictionary) -> Vec<u8> {
    let mut body = Vec::new();
    plist::to_writer_xml(&mut body, &Value::Dictionary(dict)).unwrap();
    body
}

/// How the mock GSA answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GsaScript {
    /// `ec = 0` and a plain `spd` straight after `init`
    PlainToken,
    /// Full SRP exchange; `complete` fails with -20101 on a wrong password
    Srp,
    /// SRP, then a second factor before the token is released
    SecondFactor,
}

/// In-memory Anisette, GSA and developer services.
pub struct MockTransport {
    script: GsaScript,
    srp: SrpServer,
    client_public: Mutex<Option<(String, Vec<u8>)>>,
    gsa_delay: Duration,
    pub gsa_requests: AtomicUsize,
    /// Developer services actions in call order
    pub actions: Mutex<Vec<String>>,
    certificates: Mutex<Vec<Dictionary>>,
    app_ids: Mutex<Vec<Dictionary>>,
}

impl MockTransport {
    pub fn new(script: GsaScript) -> Arc<Self> {
        Self::build(script, Duration::ZERO)
    }

    /// GSA replies arrive after `delay`.
    pub fn slow(script: GsaScript, delay: Duration) -> Arc<Self> {
        Self::build(script, delay)
    }

    fn build(script: GsaScript, gsa_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            script,
            srp: SrpServer::new("hunter2"),
            client_public: Mutex::new(None),
            gsa_delay,
            gsa_requests: AtomicUsize::new(0),
            actions: Mutex::new(Vec::new()),
            certificates: Mutex::new(Vec::new()),
            app_ids: Mutex::new(Vec::new()),
        })
    }

    /// List a development certificate with `serial` and DER `content`.
    pub fn add_certificate(&self, serial: &str, content: &[u8]) {
        let mut cert = Dictionary::new();
        cert.insert("certificateId".into(), Value::String(format!("CERT-{serial}")));
        cert.insert("name".into(), Value::String("iOS Development: user@example.com".into()));
        cert.insert("serialNumber".into(), Value::String(serial.into()));
        cert.insert("machineName".into(), Value::String("iloader".into()));
        cert.insert("certContent".into(), Value::Data(content.to_vec()));
        self.certificates.lock().push(cert);
    }

    pub fn app_id_identifiers(&self) -> Vec<String> {
        self.app_ids
            .lock()
            .iter()
            .filter_map(|d| d.get("identifier").and_then(Value::as_string).map(str::to_string))
            .collect()
    }

    fn gsa(&self, request: &Dictionary) -> Dictionary {
        let op = request.get("o").and_then(Value::as_string).unwrap_or_default();
        if let Some(code) = request.get("security_code").and_then(Value::as_string) {
            if code != "123456" {
                return status(-21669, "Incorrect verification code.", None);
            }
            let (_, a) = self.client_public.lock().clone().unwrap();
            let mut dict = status(0, "", None);
            let key = self.srp.session_key(&a);
            dict.insert("spd".into(), Value::Data(encrypt_spd(&key, IDMS_TOKEN)));
            return dict;
        }

        match (op, self.script) {
            ("init", GsaScript::PlainToken) => {
                let mut dict = status(0, "", None);
                dict.insert("spd".into(), Value::String(IDMS_TOKEN.into()));
                dict
            }
            ("init", _) => {
                let user = request.get("u").and_then(Value::as_string).unwrap().to_string();
                let a = request.get("A2k").and_then(Value::as_data).unwrap().to_vec();
                *self.client_public.lock() = Some((user, a));
                let mut dict = status(0, "", None);
                dict.insert("s".into(), Value::Data(self.srp.salt.clone()));
                dict.insert("i".into(), Value::Integer(i64::from(self.srp.iterations).into()));
                dict.insert("B".into(), Value::Data(self.srp.public.to_bytes_be()));
                dict.insert("c".into(), Value::String("mock-cookie".into()));
                dict.insert("sp".into(), Value::String("s2k".into()));
                dict
            }
            ("complete", _) => {
                let (user, a) = self.client_public.lock().clone().unwrap();
                let m1 = request.get("M1").and_then(Value::as_data).unwrap();
                if m1 != self.srp.expected_proof(&user, &a).as_slice() {
                    return status(-20101, "Your Apple ID or password was entered incorrectly.", None);
                }
                if self.script == GsaScript::SecondFactor {
                    return status(0, "", Some("trustedDeviceSecondaryAuth"));
                }
                let key = self.srp.session_key(&a);
                let mut dict = status(0, "", None);
                dict.insert("M2".into(), Value::Data(hash(&[&pad(&BigUint::from_bytes_be(&a)), m1, &key])));
                dict.insert("spd".into(), Value::Data(encrypt_spd(&key, IDMS_TOKEN)));
                dict
            }
            _ => status(-1, "unexpected request", None),
        }
    }

    fn developer(&self, action: &str, params: &Dictionary) -> Dictionary {
        assert_eq!(
            params.get("myacinfo").and_then(Value::as_string),
            Some(IDMS_TOKEN),
            "developer services called without the session token"
        );
        let mut reply = Dictionary::new();
        reply.insert("resultCode".into(), Value::Integer(0i64.into()));
        match action {
            "listTeams" => {
                let mut team = Dictionary::new();
                team.insert("teamId".into(), Value::String(TEAM_ID.into()));
                team.insert("name".into(), Value::String("User Name".into()));
                team.insert("type".into(), Value::String("Individual".into()));
                reply.insert("teams".into(), Value::Array(vec![Value::Dictionary(team)]));
            }
            "ios/listAllDevelopmentCerts" => {
                let certs = self.certificates.lock().iter().cloned().map(Value::Dictionary).collect();
                reply.insert("developerCertificates".into(), Value::Array(certs));
            }
            "ios/revokeDevelopmentCert" => {
                let serial = params.get("serialNumber").and_then(Value::as_string).unwrap();
                self.certificates
                    .lock()
                    .retain(|c| c.get("serialNumber").and_then(Value::as_string) != Some(serial));
            }
            "ios/listAppIds" => {
                let ids = self.app_ids.lock().iter().cloned().map(Value::Dictionary).collect();
                reply.insert("appIds".into(), Value::Array(ids));
                reply.insert("maxQuantity".into(), Value::Integer(10i64.into()));
                let available = 10 - self.app_ids.lock().len() as u64;
                reply.insert("availableQuantity".into(), Value::Integer(available.into()));
            }
            "ios/addAppId" => {
                let mut app_id = Dictionary::new();
                let mut app_ids = self.app_ids.lock();
                app_id.insert("appIdId".into(), Value::String(format!("APPID{}", app_ids.len() + 1)));
                for key in ["identifier", "name"] {
                    app_id.insert(key.into(), params.get(key).cloned().unwrap());
                }
                app_ids.push(app_id.clone());
                reply.insert("appId".into(), Value::Dictionary(app_id));
            }
            "ios/deleteAppId" => {
                let id = params.get("appIdId").and_then(Value::as_string).unwrap();
                self.app_ids
                    .lock()
                    .retain(|a| a.get("appIdId").and_then(Value::as_string) != Some(id));
            }
            "ios/downloadTeamProvisioningProfile" => {
                let id = params.get("appIdId").and_then(Value::as_string).unwrap();
                let bundle_id = self
                    .app_ids
                    .lock()
                    .iter()
                    .find(|a| a.get("appIdId").and_then(Value::as_string) == Some(id))
                    .and_then(|a| a.get("identifier").and_then(Value::as_string).map(str::to_string))
                    .unwrap();
                let mut profile = Dictionary::new();
                profile.insert("encodedProfile".into(), Value::Data(test_profile(TEAM_ID, &bundle_id)));
                reply.insert("provisioningProfile".into(), Value::Dictionary(profile));
            }
            other => {
                reply.insert("resultCode".into(), Value::Integer(9999i64.into()));
                reply.insert("userString".into(), Value::String(format!("unsupported {other}")));
            }
        }
        reply
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        if request.url.starts_with(ANISETTE) {
            return Ok(HttpResponse::new(200, anisette_json()));
        }
        assert_eq!(request.header_value("X-Apple-I-MD-M"), Some("mock-X-Apple-I-MD-M"));

        if request.url == GSA {
            self.gsa_requests.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.gsa_delay).await;
            let envelope: Value = plist::from_bytes(&request.body).unwrap();
            let body = envelope
                .as_dictionary()
                .and_then(|d| d.get("Request"))
                .and_then(Value::as_dictionary)
                .unwrap();
            let mut outer = Dictionary::new();
            outer.insert("Response".into(), Value::Dictionary(self.gsa(body)));
            return Ok(HttpResponse::new(200, plist_body(outer)));
        }

        if let Some(action) = request.url.strip_prefix(&format!("{DEVELOPER}/")) {
            self.actions.lock().push(action.to_string());
            let params: Dictionary = plist::from_bytes(&request.body).unwrap();
            return Ok(HttpResponse::new(200, plist_body(self.developer(action, &params))));
        }

        Err(TransportError::Network(format!("no route to {}", request.url)))
    }
}

/// Unsigned provisioning profile plist between CMS-like framing bytes.
pub fn test_profile(team_id: &str, bundle_id: &str) -> Vec<u8> {
    let mut entitlements = Dictionary::new();
    entitlements.insert(
        "application-identifier".into(),
        Value::String(format!("{team_id}.{bundle_id}")),
    );
    entitlements.insert(
        "com.apple.developer.team-identifier".into(),
        Value::String(team_id.into()),
    );
    entitlements.insert("get-task-allow".into(), Value::Boolean(true));

    let mut root = Dictionary::new();
    root.insert("Name".into(), Value::String(format!("iloader {bundle_id}")));
    root.insert("UUID".into(), Value::String("00000000-0000-0000-0000-00000000beef".into()));
    root.insert("TeamIdentifier".into(), Value::Array(vec![Value::String(team_id.into())]));
    root.insert("Entitlements".into(), Value::Dictionary(entitlements));

    let mut buf = b"\x30\x80mock".to_vec();
    plist::to_writer_xml(&mut buf, &Value::Dictionary(root)).unwrap();
    buf.extend_from_slice(b"\0\0");
    buf
}

/// A P-256 key with a self-signed development certificate.
pub struct TestCredentials {
    pub certificate_der: Vec<u8>,
    pub pkcs8_der: Vec<u8>,
}

pub fn test_credentials() -> TestCredentials {
    use p256::pkcs8::EncodePrivateKey;

    let secret = p256::SecretKey::random(&mut rand::thread_rng());
    let pkcs8_der = secret.to_pkcs8_der().unwrap().as_bytes().to_vec();
    let key = InMemorySigningKeyPair::from_pkcs8_der(&pkcs8_der).unwrap();

    let mut builder = X509CertificateBuilder::default();
    builder
        .subject()
        .append_common_name_utf8_string("Apple Development: user@example.com (MOCK000001)")
        .unwrap();
    builder
        .subject()
        .append_organizational_unit_utf8_string(TEAM_ID)
        .unwrap();
    let certificate = builder.create_with_key_pair(&key).unwrap();
    TestCredentials {
        certificate_der: certificate.constructed_data().to_vec(),
        pkcs8_der,
    }
}

/// Smallest arm64 image the signer accepts: `__TEXT` with one section and
/// an empty-ish `__LINKEDIT`.
pub fn minimal_macho(executable: bool) -> Vec<u8> {
    fn name16(name: &str) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..name.len()].copy_from_slice(name.as_bytes());
        out
    }

    let text_cmd_size = 72 + 80;
    let linkedit_cmd_size = 72;
    let mut buf = Vec::new();

    buf.extend(0xfeedfacfu32.to_le_bytes());
    buf.extend(0x0100000cu32.to_le_bytes());
    buf.extend(0u32.to_le_bytes());
    buf.extend((if executable { 2u32 } else { 6u32 }).to_le_bytes());
    buf.extend(2u32.to_le_bytes());
    buf.extend(((text_cmd_size + linkedit_cmd_size) as u32).to_le_bytes());
    buf.extend(0u32.to_le_bytes());
    buf.extend(0u32.to_le_bytes());

    buf.extend(0x19u32.to_le_bytes());
    buf.extend((text_cmd_size as u32).to_le_bytes());
    buf.extend(name16("__TEXT"));
    buf.extend(0x1_0000_0000u64.to_le_bytes());
    buf.extend(0x4000u64.to_le_bytes());
    buf.extend(0u64.to_le_bytes());
    buf.extend(0x4000u64.to_le_bytes());
    buf.extend(5u32.to_le_bytes());
    buf.extend(5u32.to_le_bytes());
    buf.extend(1u32.to_le_bytes());
    buf.extend(0u32.to_le_bytes());

    buf.extend(name16("__text"));
    buf.extend(name16("__TEXT"));
    buf.extend(0x1_0000_1000u64.to_le_bytes());
    buf.extend(0x100u64.to_le_bytes());
    buf.extend(0x1000u32.to_le_bytes());
    buf.extend(2u32.to_le_bytes());
    buf.extend(0u32.to_le_bytes());
    buf.extend(0u32.to_le_bytes());
    buf.extend(0x8000_0400u32.to_le_bytes());
    buf.extend([0u8; 12]);

    buf.extend(0x19u32.to_le_bytes());
    buf.extend((linkedit_cmd_size as u32).to_le_bytes());
    buf.extend(name16("__LINKEDIT"));
    buf.extend(0x1_0000_4000u64.to_le_bytes());
    buf.extend(0x4000u64.to_le_bytes());
    buf.extend(0x4000u64.to_le_bytes());
    buf.extend(0x100u64.to_le_bytes());
    buf.extend(1u32.to_le_bytes());
    buf.extend(1u32.to_le_bytes());
    buf.extend(0u32.to_le_bytes());
    buf.extend(0u32.to_le_bytes());

    buf.resize(0x1000, 0);
    buf.extend((0..0x3000u32).map(|i| (i % 251) as u8));
    buf.extend([0xaau8; 0x100]);
    buf
}

/// Write an IPA holding one `<name>.app` per entry of `apps`, each with an
/// `Info.plist` and an executable named `App`.
pub fn write_ipa(path: &Path, apps: &[&str], bundle_id: &str) {
    let mut info = Dictionary::new();
    info.insert("CFBundleIdentifier".into(), Value::String(bundle_id.into()));
    info.insert("CFBundleExecutable".into(), Value::String("App".into()));
    info.insert("CFBundleName".into(), Value::String("Mock App".into()));
    let mut info_xml = Vec::new();
    plist::to_writer_xml(&mut info_xml, &Value::Dictionary(info)).unwrap();

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    let mut zip = ZipWriter::new(fs::File::create(path).unwrap());
    let options = SimpleFileOptions::default();
    zip.add_directory("Payload/", options).unwrap();
    for app in apps {
        zip.start_file(format!("Payload/{app}.app/Info.plist"), options)
            .unwrap();
        zip.write_all(&info_xml).unwrap();
        zip.start_file(format!("Payload/{app}.app/App"), options.unix_permissions(0o755))
            .unwrap();
        zip.write_all(&minimal_macho(true)).unwrap();
    }
    zip.finish().unwrap();
}
