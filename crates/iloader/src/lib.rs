pub mod account;
pub mod anisette;
pub mod auth;
pub mod bundle;
pub mod codesign;
pub mod config;
pub mod crypto;
pub mod developer;
pub mod error;
pub mod http;
pub mod ipa;
pub mod macho;
pub mod orchestrator;
pub mod service;
pub mod vault;

pub use account::{Account, AccountStore};
pub use anisette::{AnisetteHeaders, AnisetteProvider};
pub use auth::{AuthenticatedSession, LoginOutcome, SessionHandle, SessionToken, SrpAuthenticator};
pub use bundle::BundleManifest;
pub use config::Config;
pub use developer::{AppId, AppIdList, Certificate, DeveloperContext, DeveloperServicesClient, Team};
pub use error::{Error, Stage};
pub use http::{HttpRequest, HttpResponse, HttpTransport, Method, ReqwestTransport, TransportError};
pub use ipa::{
    create_ipa, extract_ipa, inspect_ipa, validate_ipa, CompressionLevel, IdentitySource, Progress,
    SignRequest, SigningEngine,
};
pub use orchestrator::{
    DeviceInstaller, OperationHandle, OperationKind, OperationOrchestrator, OperationSnapshot,
    OperationStatus, StepState,
};
pub use service::{Iloader, IloaderBuilder, OperationRequest, SignAndInstallRequest};
pub use vault::{SecretKind, SecretVault};

pub type Result<T> = std::result::Result<T, Error>;
