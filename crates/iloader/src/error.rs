//! Error types for iloader operations.
//!
//! This module defines the [`enum@Error`] enum covering every failure the
//! sign-in, developer-services, signing and orchestration layers can report.
//! Variants that originate in network code carry a [`Stage`] naming the
//! component that failed.
//!
//! # See Also
//!
//! - [`crate::Result`] - Convenience type alias using this error

use std::fmt;

use thiserror::Error;

/// Component that produced a network-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Anisette,
    Authentication,
    SecondFactor,
    DeveloperServices,
    Signing,
    Orchestration,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Anisette => "anisette",
            Stage::Authentication => "authentication",
            Stage::SecondFactor => "two-factor",
            Stage::DeveloperServices => "developer services",
            Stage::Signing => "signing",
            Stage::Orchestration => "orchestration",
        };
        f.write_str(name)
    }
}

/// Error type for iloader operations.
///
/// All public functions in this crate return [`crate::Result<T>`], which uses
/// this error type. Match on variants to handle specific failure cases.
///
/// # Examples
///
/// ```no_run
/// # async fn demo(service: &iloader::Iloader) {
/// use iloader::Error;
///
/// match service.list_certificates().await {
///     Ok(certs) => println!("{} certificates", certs.len()),
///     Err(Error::NoActiveAccount) => eprintln!("sign in first"),
///     Err(e) if e.is_retryable() => eprintln!("try again: {}", e.user_message()),
///     Err(e) => eprintln!("{}", e.user_message()),
/// }
/// # }
/// ```
#[derive(Debug, Error)]
pub enum Error {
    /// Transport-level failure other than a timeout.
    #[error("{stage} network error: {message}")]
    Network { stage: Stage, message: String },

    /// A request exceeded its deadline.
    #[error("{stage} request timed out")]
    Timeout { stage: Stage },

    /// GSA rejected the request with a status code.
    #[error("server error {code}: {message}")]
    Server { code: i64, message: String },

    /// GSA reported wrong account name or password (`-20101`).
    #[error("invalid Apple ID or password")]
    InvalidCredentials,

    /// Another login or operation for the same account is already running.
    #[error("another session is already in progress for this account")]
    SessionInProgress,

    /// No usable signing identity could be produced.
    #[error("signing certificate not found")]
    CertificateNotFound,

    /// The IPA did not unpack to exactly one application bundle.
    #[error("IPA extraction failed: {0}")]
    ExtractionFailed(String),

    /// The signed bundle could not be written back into an archive.
    #[error("IPA repackaging failed: {0}")]
    RepackageFailed(String),

    /// The provisioning profile is missing or unusable.
    #[error("provisioning profile unavailable: {0}")]
    ProfileGenerationFailed(String),

    /// The file system or configured policy refused the action.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Developer services returned a non-success result.
    #[error("developer services error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// No Anisette endpoint answered with HTTP 200.
    #[error("anisette server unreachable: {0}")]
    AnisetteUnreachable(String),

    /// An Anisette endpoint answered but no header set could be parsed.
    #[error("anisette server returned malformed headers")]
    AnisetteMalformed,

    /// The identifier is not a stored account.
    #[error("unknown account: {0}")]
    UnknownAccount(String),

    /// The action needs an active account and none is selected.
    #[error("no active account")]
    NoActiveAccount,

    /// The two-factor handle does not name a pending session.
    #[error("unknown or expired login session")]
    UnknownSession,

    /// The operation was cancelled between steps.
    #[error("operation cancelled")]
    Cancelled,

    /// Installation was requested but no device installer is attached.
    #[error("no device available for installation")]
    DeviceUnavailable,

    /// I/O operation failed.
    ///
    /// Occurs when reading input files, writing output files, or accessing
    /// the data directory.
    #[error("IO error: {0}")]
    Io(std::io::Error),

    /// Invalid or unsupported Mach-O binary format.
    #[error("Invalid Mach-O: {0}")]
    MachO(String),

    /// Code signature generation or embedding failed.
    #[error("Signing failed: {0}")]
    Signing(String),

    /// Invalid or malformed certificate or private key.
    #[error("Invalid certificate: {0}")]
    Certificate(String),

    /// Invalid configuration file or value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Property list parsing failed.
    ///
    /// Failed to parse `Info.plist`, entitlements, or a service response.
    #[error("Plist error: {0}")]
    Plist(#[from] plist::Error),

    /// ZIP archive operation failed.
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            Error::PermissionDenied(err.to_string())
        } else {
            Error::Io(err)
        }
    }
}

impl Error {
    pub(crate) fn network(stage: Stage, message: impl Into<String>) -> Self {
        Error::Network {
            stage,
            message: message.into(),
        }
    }

    /// True for transport failures a caller may reasonably retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network { .. } | Error::Timeout { .. })
    }

    /// Message suitable for showing to a user.
    ///
    /// Never contains file paths, tokens or raw server bodies.
    pub fn user_message(&self) -> String {
        match self {
            Error::Network { stage, .. } => format!("Could not reach the {stage} service."),
            Error::Timeout { stage } => format!("The {stage} service did not respond in time."),
            Error::Server { code, message } if !message.is_empty() => {
                format!("Apple returned an error ({code}): {message}")
            }
            Error::Server { code, .. } => format!("Apple returned an error ({code})."),
            Error::InvalidCredentials => "Incorrect Apple ID or password.".into(),
            Error::SessionInProgress => {
                "Another sign-in or operation is already running for this account.".into()
            }
            Error::CertificateNotFound => "No signing certificate is available.".into(),
            Error::ExtractionFailed(_) => "The IPA could not be unpacked.".into(),
            Error::RepackageFailed(_) => "The signed IPA could not be written.".into(),
            Error::ProfileGenerationFailed(_) => {
                "A provisioning profile could not be obtained.".into()
            }
            Error::PermissionDenied(_) => "Permission denied.".into(),
            Error::Api { message, .. } => format!("Developer services error: {message}"),
            Error::AnisetteUnreachable(_) => "The anisette server could not be reached.".into(),
            Error::AnisetteMalformed => "The anisette server returned invalid data.".into(),
            Error::UnknownAccount(id) => format!("No account named {id}."),
            Error::NoActiveAccount => "Sign in to an account first.".into(),
            Error::UnknownSession => "The sign-in session has expired. Start again.".into(),
            Error::Cancelled => "The operation was cancelled.".into(),
            Error::DeviceUnavailable => "Connect and pair a device first.".into(),
            Error::Io(_) => "A file could not be read or written.".into(),
            Error::MachO(_) | Error::Signing(_) => "The app could not be signed.".into(),
            Error::Certificate(_) => "The signing certificate is invalid.".into(),
            Error::Config(_) => "The configuration file is invalid.".into(),
            Error::Plist(_) => "A property list could not be parsed.".into(),
            Error::Zip(_) => "The archive is damaged.".into(),
        }
    }
}
