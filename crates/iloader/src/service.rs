//! The `Iloader` command surface.
//!
//! [`Iloader`] wires every component together once, from a [`Config`] plus
//! the injected transport, vault and device installer, and exposes the
//! account, developer-services and signing commands.
//!
//! # Examples
//!
//! ```no_run
//! use iloader::{Config, Iloader, LoginOutcome};
//! use secrecy::SecretString;
//!
//! # async fn demo() -> iloader::Result<()> {
//! let iloader = Iloader::builder(Config::load_default()?).build()?;
//! match iloader
//!     .start_login("user@example.com", SecretString::new("hunter2".into()), None)
//!     .await?
//! {
//!     LoginOutcome::Authenticated(session) => println!("signed in as {}", session.identifier),
//!     LoginOutcome::SecondFactorRequired(handle) => {
//!         let account = iloader.complete_two_factor(handle, "123456").await?;
//!         println!("signed in as {}", account.identifier);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::account::{Account, AccountStore};
use crate::anisette::AnisetteProvider;
use crate::auth::{LoginOutcome, SessionHandle, SrpAuthenticator};
use crate::config::Config;
use crate::crypto::{generate_csr, ProvisioningProfile, SigningIdentity};
use crate::developer::{AppIdList, Certificate, DeveloperContext, DeveloperServicesClient};
use crate::http::{HttpTransport, ReqwestTransport};
use crate::ipa::{inspect_ipa, validate_ipa, IdentitySource, Progress, SignRequest, SigningEngine};
use crate::orchestrator::{
    DeviceInstaller, OperationHandle, OperationKind, OperationOrchestrator, StepSpec,
};
use crate::vault::{SecretKind, SecretVault};
use crate::{Error, Result};

/// Common name and machine name used for certificates this tool requests.
const MACHINE_NAME: &str = "iloader";

/// Inputs of [`Iloader::sign_and_install`].
#[derive(Debug, Clone, Default)]
pub struct SignAndInstallRequest {
    pub ipa_path: PathBuf,
    /// Sign as this identifier instead of the IPA's own
    pub bundle_id: Option<String>,
    /// Serial number or id of the certificate to sign with
    pub certificate_id: Option<String>,
    /// Send the signed IPA to the attached device
    pub install: bool,
    /// Defaults to `<output_dir>/<name>-signed.ipa`
    pub output_path: Option<PathBuf>,
}

/// Inputs of [`Iloader::start_operation`].
#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub kind: OperationKind,
    pub ipa_path: PathBuf,
    pub bundle_id: Option<String>,
}

/// Identity, profile and identifier for one Apple ID signing run.
struct PreparedSigning {
    identity: SigningIdentity,
    profile: ProvisioningProfile,
    bundle_id: String,
}

/// Builder for [`Iloader`].
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use iloader::{Config, Iloader, SecretVault};
///
/// let iloader = Iloader::builder(Config::default())
///     .vault(Arc::new(SecretVault::in_memory()))
///     .build()?;
/// # Ok::<(), iloader::Error>(())
/// ```
pub struct IloaderBuilder {
    config: Config,
    transport: Option<Arc<dyn HttpTransport>>,
    vault: Option<Arc<SecretVault>>,
    installer: Option<Arc<dyn DeviceInstaller>>,
    in_memory_accounts: bool,
}

impl IloaderBuilder {
    /// Send every request through `transport` instead of a reqwest client.
    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use `vault` instead of `vault.json` in the data directory.
    pub fn vault(mut self, vault: Arc<SecretVault>) -> Self {
        self.vault = Some(vault);
        self
    }

    /// Attach a device for installation.
    pub fn installer(mut self, installer: Arc<dyn DeviceInstaller>) -> Self {
        self.installer = Some(installer);
        self
    }

    /// Keep account metadata in memory only.
    pub fn in_memory_accounts(mut self) -> Self {
        self.in_memory_accounts = true;
        self
    }

    pub fn build(self) -> Result<Iloader> {
        let config = self.config;
        let transport: Arc<dyn HttpTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new()?),
        };
        let vault = match self.vault {
            Some(vault) => vault,
            None => Arc::new(SecretVault::open(&config.data_dir)?),
        };
        let accounts = if self.in_memory_accounts {
            AccountStore::detached(vault)
        } else {
            AccountStore::open(&config.data_dir, vault)?
        };

        let timeouts = config.timeouts;
        let anisette = Arc::new(AnisetteProvider::new(transport.clone(), timeouts.anisette()));
        let auth = SrpAuthenticator::new(
            transport.clone(),
            anisette.clone(),
            config.gsa_url.clone(),
            timeouts.gsa(),
        );
        let developer = DeveloperServicesClient::new(
            transport,
            anisette.clone(),
            config.developer_services_url.clone(),
            timeouts.developer_services(),
        );
        debug!(data_dir = %config.data_dir.display(), "iloader ready");

        Ok(Iloader {
            inner: Arc::new(Inner {
                engine: SigningEngine::new(config.compression()),
                config,
                anisette,
                auth,
                accounts,
                developer,
                orchestrator: OperationOrchestrator::new(),
                installer: self.installer,
                certificates: Mutex::new(HashMap::new()),
                teams: Mutex::new(HashMap::new()),
            }),
        })
    }
}

struct Inner {
    config: Config,
    anisette: Arc<AnisetteProvider>,
    auth: SrpAuthenticator,
    accounts: AccountStore,
    developer: DeveloperServicesClient,
    engine: SigningEngine,
    orchestrator: OperationOrchestrator,
    installer: Option<Arc<dyn DeviceInstaller>>,
    /// Last listing per account; revocation removes entries
    certificates: Mutex<HashMap<String, Vec<Certificate>>>,
    teams: Mutex<HashMap<String, Option<String>>>,
}

/// Sign-in, developer services and signing behind one handle.
///
/// Cloning is cheap; clones share every component.
#[derive(Clone)]
pub struct Iloader {
    inner: Arc<Inner>,
}

impl Iloader {
    pub fn builder(config: Config) -> IloaderBuilder {
        IloaderBuilder {
            config,
            transport: None,
            vault: None,
            installer: None,
            in_memory_accounts: false,
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn signing_engine(&self) -> &SigningEngine {
        &self.inner.engine
    }

    /// Drop cached Anisette headers so the next call fetches fresh ones.
    pub fn refresh_anisette(&self) {
        self.inner.anisette.invalidate();
    }

    /// Sign in `identifier`. `anisette_server` defaults to the configured
    /// one.
    ///
    /// A completed sign-in is stored and becomes the active account.
    pub async fn start_login(
        &self,
        identifier: &str,
        secret: SecretString,
        anisette_server: Option<&str>,
    ) -> Result<LoginOutcome> {
        let server = anisette_server.unwrap_or(&self.inner.config.anisette_server);
        let outcome = self.inner.auth.begin(identifier, secret, server).await?;
        if let LoginOutcome::Authenticated(session) = &outcome {
            self.store_session(&session.identifier, &session.token, &session.password)?;
        }
        Ok(outcome)
    }

    /// Finish a sign-in that needed a second factor.
    pub async fn complete_two_factor(&self, handle: SessionHandle, code: &str) -> Result<Account> {
        let session = self.inner.auth.complete_second_factor(handle, code).await?;
        self.store_session(&session.identifier, &session.token, &session.password)
    }

    /// Abandon a sign-in waiting for its second factor.
    pub fn cancel_login(&self, handle: SessionHandle) -> bool {
        self.inner.auth.cancel(handle)
    }

    fn store_session(
        &self,
        identifier: &str,
        token: &crate::auth::SessionToken,
        password: &SecretString,
    ) -> Result<Account> {
        let account = Account::new(identifier, token.clone());
        self.inner.accounts.add(account.clone())?;
        let vault = self.inner.accounts.vault();
        if self.inner.config.remember_password {
            vault.put(identifier, &SecretKind::Password, password.expose_secret().as_bytes())?;
        } else {
            vault.delete(identifier, &SecretKind::Password)?;
        }
        self.inner.teams.lock().remove(identifier);
        self.inner.certificates.lock().remove(identifier);
        Ok(account)
    }

    pub fn list_accounts(&self) -> Vec<Account> {
        self.inner.accounts.list()
    }

    pub fn active_account(&self) -> Option<Account> {
        self.inner.accounts.active()
    }

    pub fn switch_account(&self, identifier: &str) -> Result<()> {
        self.inner.accounts.switch(identifier)
    }

    pub fn remove_account(&self, identifier: &str) -> Result<()> {
        self.inner.accounts.remove(identifier)?;
        self.inner.certificates.lock().remove(identifier);
        self.inner.teams.lock().remove(identifier);
        Ok(())
    }

    fn require_active(&self) -> Result<Account> {
        self.inner.accounts.active().ok_or(Error::NoActiveAccount)
    }

    /// Developer services context for `account`, with its first team.
    async fn context(&self, account: &Account) -> Result<DeveloperContext> {
        let ctx = DeveloperContext::new(
            account.session_token.clone(),
            self.inner.config.anisette_server.clone(),
        );
        let cached = self.inner.teams.lock().get(&account.identifier).cloned();
        let team = match cached {
            Some(team) => team,
            None => {
                let team = self
                    .inner
                    .developer
                    .list_teams(&ctx)
                    .await?
                    .into_iter()
                    .next()
                    .map(|t| t.id);
                self.inner
                    .teams
                    .lock()
                    .insert(account.identifier.clone(), team.clone());
                team
            }
        };
        Ok(match team {
            Some(team) => ctx.with_team(team),
            None => ctx,
        })
    }

    pub async fn list_certificates(&self) -> Result<Vec<Certificate>> {
        let account = self.require_active()?;
        let ctx = self.context(&account).await?;
        let certificates = self.inner.developer.list_certificates(&ctx).await?;
        self.inner
            .certificates
            .lock()
            .insert(account.identifier.clone(), certificates.clone());
        Ok(certificates)
    }

    /// Revoke a certificate and forget its locally held key.
    pub async fn revoke_certificate(&self, serial_number: &str) -> Result<()> {
        let account = self.require_active()?;
        let ctx = self.context(&account).await?;
        self.inner.developer.revoke_certificate(&ctx, serial_number).await?;
        if let Some(list) = self.inner.certificates.lock().get_mut(&account.identifier) {
            list.retain(|c| c.serial_number != serial_number);
        }
        self.inner.accounts.vault().delete(
            &account.identifier,
            &SecretKind::CertificateKey(serial_number.to_string()),
        )?;
        Ok(())
    }

    pub async fn list_app_ids(&self) -> Result<AppIdList> {
        let account = self.require_active()?;
        let ctx = self.context(&account).await?;
        self.inner.developer.list_app_ids(&ctx).await
    }

    /// Delete an App ID when `allow_app_id_deletion` is set.
    pub async fn delete_app_id(&self, app_id_id: &str) -> Result<()> {
        if !self.inner.config.allow_app_id_deletion {
            return Err(Error::PermissionDenied("App ID deletion is disabled".into()));
        }
        let account = self.require_active()?;
        let ctx = self.context(&account).await?;
        self.inner.developer.delete_app_id(&ctx, app_id_id).await
    }

    /// Sign an IPA with the active account's credentials, optionally
    /// installing it on the attached device.
    pub async fn sign_and_install<F>(
        &self,
        request: SignAndInstallRequest,
        progress: F,
    ) -> Result<PathBuf>
    where
        F: FnMut(Progress) + Send + 'static,
    {
        let account = self.require_active()?;
        if self.inner.orchestrator.is_busy(&account.identifier) {
            return Err(Error::SessionInProgress);
        }
        let output = match request.output_path {
            Some(path) => path,
            None => self.default_output(&request.ipa_path),
        };

        let prepared = self
            .prepare_signing(
                &account,
                &request.ipa_path,
                request.bundle_id.as_deref(),
                request.certificate_id.as_deref(),
            )
            .await?;
        let bundle_id = prepared.bundle_id.clone();
        let signed = self
            .sign_prepared(prepared, &request.ipa_path, &output, progress)
            .await?;

        if request.install {
            self.install(&signed, &bundle_id).await?;
        }
        Ok(signed)
    }

    /// Start a named operation for the active account.
    pub fn start_operation(&self, request: OperationRequest) -> Result<OperationHandle> {
        let account = self.require_active()?;
        let file_name = request
            .ipa_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "app".into());
        let job = Arc::new(tokio::sync::Mutex::new(Job::new(request.bundle_id.clone())?));
        let titles = request.kind.step_titles(&file_name);

        let steps = match request.kind {
            OperationKind::InstallCustomIpa => {
                let ipa = request.ipa_path.clone();
                let inspect_ipa_path = request.ipa_path.clone();
                let inspect_job = job.clone();
                vec![
                    StepSpec::new(&titles[0], move || async move { validate_ipa(&ipa) }),
                    StepSpec::new(&titles[1], move || async move {
                        let info = tokio::task::spawn_blocking(move || inspect_ipa(&inspect_ipa_path))
                            .await
                            .map_err(|e| Error::ExtractionFailed(e.to_string()))??;
                        let mut job = inspect_job.lock().await;
                        if job.bundle_id.is_none() {
                            job.bundle_id = info.bundle_id;
                        }
                        Ok(())
                    }),
                    self.sign_step(&titles[2], &account, &request.ipa_path, &file_name, &job),
                    self.upload_step(&titles[3], &job),
                    self.install_step(&titles[4], &job),
                ]
            }
            _ => {
                let this = self.clone();
                let verify_account = account.clone();
                let ipa = request.ipa_path.clone();
                let verify_job = job.clone();
                let sign_job = job.clone();
                let install_job = job.clone();
                let installer = self.inner.installer.clone();
                vec![
                    StepSpec::new(&titles[0], move || async move {
                        let requested = verify_job.lock().await.bundle_id.clone();
                        let prepared = this
                            .prepare_signing(&verify_account, &ipa, requested.as_deref(), None)
                            .await?;
                        verify_job.lock().await.prepared = Some(prepared);
                        Ok(())
                    }),
                    self.sign_existing_step(&titles[1], &request.ipa_path, &file_name, sign_job),
                    StepSpec::new(&titles[2], move || async move {
                        let installer = installer.ok_or(Error::DeviceUnavailable)?;
                        let job = install_job.lock().await;
                        let (Some(signed), Some(bundle_id)) = (&job.signed, &job.bundle_id) else {
                            return Err(Error::Signing("nothing was signed".into()));
                        };
                        installer.upload(signed).await?;
                        installer.install(bundle_id).await
                    }),
                ]
            }
        };

        self.inner
            .orchestrator
            .start(request.kind, &account.identifier, steps)
    }

    fn sign_step(
        &self,
        title: &str,
        account: &Account,
        ipa: &Path,
        file_name: &str,
        job: &Arc<tokio::sync::Mutex<Job>>,
    ) -> StepSpec {
        let this = self.clone();
        let account = account.clone();
        let ipa = ipa.to_path_buf();
        let file_name = file_name.to_string();
        let job = job.clone();
        StepSpec::new(title, move || async move {
            let requested = job.lock().await.bundle_id.clone();
            let prepared = this
                .prepare_signing(&account, &ipa, requested.as_deref(), None)
                .await?;
            let mut job = job.lock().await;
            let output = job.scratch.path().join(&file_name);
            job.bundle_id = Some(prepared.bundle_id.clone());
            let signed = this.sign_prepared(prepared, &ipa, &output, |_| {}).await?;
            job.signed = Some(signed);
            Ok(())
        })
    }

    fn sign_existing_step(
        &self,
        title: &str,
        ipa: &Path,
        file_name: &str,
        job: Arc<tokio::sync::Mutex<Job>>,
    ) -> StepSpec {
        let this = self.clone();
        let ipa = ipa.to_path_buf();
        let file_name = file_name.to_string();
        StepSpec::new(title, move || async move {
            let mut job = job.lock().await;
            let prepared = job.prepared.take().ok_or(Error::CertificateNotFound)?;
            let output = job.scratch.path().join(&file_name);
            job.bundle_id = Some(prepared.bundle_id.clone());
            let signed = this.sign_prepared(prepared, &ipa, &output, |_| {}).await?;
            job.signed = Some(signed);
            Ok(())
        })
    }

    fn upload_step(&self, title: &str, job: &Arc<tokio::sync::Mutex<Job>>) -> StepSpec {
        let installer = self.inner.installer.clone();
        let job = job.clone();
        StepSpec::new(title, move || async move {
            let installer = installer.ok_or(Error::DeviceUnavailable)?;
            let job = job.lock().await;
            let signed = job
                .signed
                .as_deref()
                .ok_or_else(|| Error::Signing("nothing was signed".into()))?;
            installer.upload(signed).await
        })
    }

    fn install_step(&self, title: &str, job: &Arc<tokio::sync::Mutex<Job>>) -> StepSpec {
        let installer = self.inner.installer.clone();
        let job = job.clone();
        StepSpec::new(title, move || async move {
            let installer = installer.ok_or(Error::DeviceUnavailable)?;
            let bundle_id = job
                .lock()
                .await
                .bundle_id
                .clone()
                .ok_or_else(|| Error::Signing("bundle identifier unknown".into()))?;
            installer.install(&bundle_id).await
        })
    }

    fn default_output(&self, ipa_path: &Path) -> PathBuf {
        let stem = ipa_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "app".into());
        self.inner
            .config
            .output_dir
            .join(format!("{stem}-signed.ipa"))
    }

    async fn install(&self, signed: &Path, bundle_id: &str) -> Result<()> {
        let installer = self.inner.installer.as_ref().ok_or(Error::DeviceUnavailable)?;
        installer.upload(signed).await?;
        installer.install(bundle_id).await?;
        info!(bundle_id, "installed on device");
        Ok(())
    }

    async fn sign_prepared<F>(
        &self,
        prepared: PreparedSigning,
        ipa_path: &Path,
        output: &Path,
        progress: F,
    ) -> Result<PathBuf>
    where
        F: FnMut(Progress) + Send + 'static,
    {
        let request = SignRequest {
            ipa_path: ipa_path.to_path_buf(),
            output_path: output.to_path_buf(),
            identity: IdentitySource::Resolved(prepared.identity),
            profile: prepared.profile,
            bundle_id: Some(prepared.bundle_id),
        };
        self.inner.engine.sign(request, progress).await
    }

    /// Certificate, key, App ID and profile for signing `ipa_path`.
    async fn prepare_signing(
        &self,
        account: &Account,
        ipa_path: &Path,
        bundle_id: Option<&str>,
        certificate_id: Option<&str>,
    ) -> Result<PreparedSigning> {
        let ipa = ipa_path.to_path_buf();
        let info = tokio::task::spawn_blocking(move || inspect_ipa(&ipa))
            .await
            .map_err(|e| Error::ExtractionFailed(e.to_string()))??;
        let bundle_id = match bundle_id.map(str::to_string).or(info.bundle_id) {
            Some(id) => id,
            None => {
                return Err(Error::ExtractionFailed(
                    "Info.plist has no CFBundleIdentifier".into(),
                ))
            }
        };

        let ctx = self.context(account).await?;
        let (certificate, identity) = self.resolve_identity(account, &ctx, certificate_id).await?;

        let developer = &self.inner.developer;
        let app_ids = developer.list_app_ids(&ctx).await?;
        let app_id = match app_ids.app_ids.into_iter().find(|a| a.identifier == bundle_id) {
            Some(app_id) => app_id,
            None => {
                let name = info
                    .display_name
                    .unwrap_or_else(|| info.app_name.trim_end_matches(".app").to_string());
                developer.create_app_id(&ctx, &bundle_id, &name).await?
            }
        };
        let profile = developer
            .download_provisioning_profile(&ctx, &app_id.id, Some(&certificate.id))
            .await?;
        info!(bundle_id = %bundle_id, certificate = %certificate.serial_number, "prepared signing");

        Ok(PreparedSigning {
            identity,
            profile,
            bundle_id,
        })
    }

    /// Pick a certificate whose key this machine holds, or request one.
    async fn resolve_identity(
        &self,
        account: &Account,
        ctx: &DeveloperContext,
        certificate_id: Option<&str>,
    ) -> Result<(Certificate, SigningIdentity)> {
        let developer = &self.inner.developer;
        let vault = self.inner.accounts.vault();
        let certificates = developer.list_certificates(ctx).await?;
        let key_for = |cert: &Certificate| {
            vault.get(
                &account.identifier,
                &SecretKind::CertificateKey(cert.serial_number.clone()),
            )
        };

        let chosen = match certificate_id {
            Some(wanted) => {
                let cert = certificates
                    .iter()
                    .find(|c| c.serial_number == wanted || c.id == wanted)
                    .ok_or(Error::CertificateNotFound)?;
                let key = key_for(cert).ok_or(Error::CertificateNotFound)?;
                Some((cert.clone(), key))
            }
            None => certificates
                .iter()
                .find_map(|c| key_for(c).map(|key| (c.clone(), key))),
        };

        let (certificate, key) = match chosen {
            Some(found) => found,
            None => {
                info!(account = %account.identifier, "requesting a new development certificate");
                let pending = generate_csr(MACHINE_NAME)?;
                let certificate = developer.submit_csr(ctx, &pending.csr_pem, MACHINE_NAME).await?;
                vault.put(
                    &account.identifier,
                    &SecretKind::CertificateKey(certificate.serial_number.clone()),
                    &pending.pkcs8_der,
                )?;
                (certificate, pending.pkcs8_der)
            }
        };

        let der = match &certificate.content {
            Some(der) => der.clone(),
            None => developer.download_certificate(ctx, &certificate.serial_number).await?,
        };
        let identity = SigningIdentity::from_der(&der, &key).map_err(|e| {
            warn!(error = %e, serial = %certificate.serial_number, "stored key does not match certificate");
            Error::CertificateNotFound
        })?;
        Ok((certificate, identity))
    }
}

/// State shared by the steps of one operation.
struct Job {
    /// Holds the signed IPA until the operation ends
    scratch: tempfile::TempDir,
    bundle_id: Option<String>,
    prepared: Option<PreparedSigning>,
    signed: Option<PathBuf>,
}

impl Job {
    fn new(bundle_id: Option<String>) -> Result<Self> {
        Ok(Self {
            scratch: tempfile::TempDir::new()?,
            bundle_id,
            prepared: None,
            signed: None,
        })
    }
}
