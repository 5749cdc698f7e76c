//! Command-line interface for iloader.
//!
//! Signs in to Apple IDs, manages development certificates and App IDs, and
//! re-signs IPA files either with a PKCS#12 identity or through the active
//! account.

use std::io::{BufRead, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use iloader::crypto::ProvisioningProfile;
use iloader::{
    Config, IdentitySource, Iloader, LoginOutcome, Progress, SignAndInstallRequest, SignRequest,
};
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "iloader")]
#[command(about = "Apple ID sign-in and iOS app re-signing")]
struct Cli {
    /// Configuration file (default: <config dir>/iloader/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Anisette server to use instead of the configured one
    #[arg(long, global = true)]
    anisette_server: Option<String>,

    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sign in to an Apple ID
    Login {
        apple_id: String,
        /// Password (prompted for when omitted)
        #[arg(long)]
        password: Option<String>,
        /// Two-factor code, if one will be requested
        #[arg(long)]
        code: Option<String>,
    },
    /// Manage stored accounts
    Accounts {
        #[command(subcommand)]
        action: AccountAction,
    },
    /// Development certificates of the active account
    Certs {
        #[command(subcommand)]
        action: CertAction,
    },
    /// App IDs of the active account
    AppIds {
        #[command(subcommand)]
        action: AppIdAction,
    },
    /// Re-sign an IPA
    Sign {
        input: PathBuf,

        /// Output file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// PKCS#12 file (.p12); signs through the active account when omitted
        #[arg(short = 'p', long, requires = "profile")]
        pkcs12: Option<PathBuf>,

        /// Provisioning profile to embed with --pkcs12
        #[arg(short = 'm', long)]
        profile: Option<PathBuf>,

        /// Password for the PKCS#12 file
        #[arg(long)]
        password: Option<String>,

        /// Bundle identifier to sign as
        #[arg(short, long)]
        bundle_id: Option<String>,

        /// Certificate serial number (Apple ID signing only)
        #[arg(long)]
        certificate: Option<String>,
    },
}

#[derive(Subcommand)]
enum AccountAction {
    List,
    Switch { apple_id: String },
    Remove { apple_id: String },
}

#[derive(Subcommand)]
enum CertAction {
    List,
    Revoke { serial_number: String },
}

#[derive(Subcommand)]
enum AppIdAction {
    List,
    Delete { app_id_id: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        match e.downcast_ref::<iloader::Error>() {
            Some(err) => {
                tracing::debug!(error = %err, "command failed");
                eprintln!("error: {}", err.user_message());
            }
            None => eprintln!("error: {e}"),
        }
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "iloader=debug" } else { "iloader=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    if let Some(server) = cli.anisette_server {
        config.anisette_server = server;
    }
    let iloader = Iloader::builder(config).build()?;

    match cli.command {
        Command::Login {
            apple_id,
            password,
            code,
        } => {
            let password = match password {
                Some(p) => p,
                None => prompt(&format!("Password for {apple_id}: "))?,
            };
            match iloader
                .start_login(&apple_id, SecretString::new(password), None)
                .await?
            {
                LoginOutcome::Authenticated(session) => {
                    println!("Signed in as {}", session.identifier);
                }
                LoginOutcome::SecondFactorRequired(handle) => {
                    let code = match code {
                        Some(c) => c,
                        None => prompt("Two-factor code: ")?,
                    };
                    let account = iloader.complete_two_factor(handle, &code).await?;
                    println!("Signed in as {}", account.identifier);
                }
            }
        }
        Command::Accounts { action } => match action {
            AccountAction::List => {
                let active = iloader.active_account().map(|a| a.identifier);
                for account in iloader.list_accounts() {
                    let marker = if active.as_deref() == Some(account.identifier.as_str()) {
                        "*"
                    } else {
                        " "
                    };
                    println!(
                        "{marker} {}  (added {})",
                        account.identifier,
                        account.created_at.format("%Y-%m-%d")
                    );
                }
            }
            AccountAction::Switch { apple_id } => {
                iloader.switch_account(&apple_id)?;
                println!("Active account: {apple_id}");
            }
            AccountAction::Remove { apple_id } => {
                iloader.remove_account(&apple_id)?;
                println!("Removed {apple_id}");
            }
        },
        Command::Certs { action } => match action {
            CertAction::List => {
                for cert in iloader.list_certificates().await? {
                    let expires = cert
                        .expiration
                        .map(|d| d.format("%Y-%m-%d").to_string())
                        .unwrap_or_else(|| "-".into());
                    println!(
                        "{}  {}  {}  expires {}",
                        cert.serial_number,
                        cert.name,
                        cert.machine_name.as_deref().unwrap_or("-"),
                        expires
                    );
                }
            }
            CertAction::Revoke { serial_number } => {
                iloader.revoke_certificate(&serial_number).await?;
                println!("Revoked {serial_number}");
            }
        },
        Command::AppIds { action } => match action {
            AppIdAction::List => {
                let list = iloader.list_app_ids().await?;
                for app_id in &list.app_ids {
                    println!("{}  {}  {}", app_id.id, app_id.identifier, app_id.name);
                }
                if let Some(available) = list.available_quantity {
                    println!("{available} App IDs available");
                }
            }
            AppIdAction::Delete { app_id_id } => {
                iloader.delete_app_id(&app_id_id).await?;
                println!("Deleted {app_id_id}");
            }
        },
        Command::Sign {
            input,
            output,
            pkcs12,
            profile,
            password,
            bundle_id,
            certificate,
        } => {
            let output = match pkcs12 {
                Some(p12_path) => {
                    let profile_path = profile.ok_or("--pkcs12 needs --profile")?;
                    let output = output.unwrap_or_else(|| {
                        let mut out = input.clone();
                        out.set_extension("signed.ipa");
                        out
                    });
                    let request = SignRequest {
                        ipa_path: input,
                        output_path: output,
                        identity: IdentitySource::Pkcs12 {
                            data: std::fs::read(p12_path)?,
                            passphrase: SecretString::new(password.unwrap_or_default()),
                        },
                        profile: ProvisioningProfile::parse(std::fs::read(profile_path)?)?,
                        bundle_id,
                    };
                    iloader.signing_engine().sign(request, report).await?
                }
                None => {
                    let request = SignAndInstallRequest {
                        ipa_path: input,
                        bundle_id,
                        certificate_id: certificate,
                        install: false,
                        output_path: output,
                    };
                    iloader.sign_and_install(request, report).await?
                }
            };
            println!("Signed: {}", output.display());
        }
    }
    Ok(())
}

fn report(progress: Progress) {
    eprintln!("[{:>3.0}%] {}", progress.fraction * 100.0, progress.label);
}

fn prompt(label: &str) -> std::io::Result<String> {
    let mut stderr = std::io::stderr();
    stderr.write_all(label.as_bytes())?;
    stderr.flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
