use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use raitha_digilocker::prelude::*;
use raitha_digilocker::pkce::{generate_code_challenge, generate_code_verifier};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const APP_NAME: &str = "raitha-digilocker";

#[derive(Parser, Debug)]
#[command(name = "raitha-digilocker")]
#[command(about = "DigiLocker OAuth 2.0 with PKCE for the land-registration portal")]
#[command(version)]
struct Args {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a fresh PKCE pair as JSON
    Pkce {
        /// Verifier length (43-128); drawn at random when omitted
        #[arg(short, long)]
        length: Option<usize>,
    },
    /// Print the S256 challenge for a verifier
    Challenge { verifier: String },
    /// Start a flow and print the DigiLocker authorization URL
    AuthorizeUrl {
        /// JSON settings file, overlaid with DIGILOCKER_* variables
        #[arg(short, long, env = "RAITHA_DIGILOCKER_CONFIG")]
        config: Option<PathBuf>,
        /// Phone number to carry through the flow
        #[arg(long)]
        phone: Option<String>,
    },
    /// Log in through the browser with a loopback callback
    Login {
        #[arg(short, long, env = "RAITHA_DIGILOCKER_CONFIG")]
        config: Option<PathBuf>,
        #[arg(long)]
        phone: Option<String>,
        /// Seconds to wait for the callback
        #[arg(long, default_value_t = 300)]
        timeout: u64,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match args.command {
        Command::Pkce { length } => print_pkce(length),
        Command::Challenge { verifier } => {
            let pkce = Pkce::from_verifier(verifier).context("invalid code verifier")?;
            println!("{}", pkce.code_challenge());
            Ok(())
        }
        Command::AuthorizeUrl { config, phone } => {
            let client = build_client(config, None)?;
            let flow = client.start_auth_flow(phone.as_deref())?;
            println!("{}", serde_json::json!({ "url": flow.url, "state": flow.state }));
            Ok(())
        }
        Command::Login {
            config,
            phone,
            timeout,
        } => login(config, phone, Duration::from_secs(timeout)),
    }
}

fn print_pkce(length: Option<usize>) -> Result<()> {
    let pair = match length {
        Some(length) => {
            let code_verifier = generate_code_verifier(length)?;
            let code_challenge = generate_code_challenge(&code_verifier);
            PkcePair {
                code_verifier,
                code_challenge,
            }
        }
        None => generate_pkce_pair()?,
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "code_verifier": pair.code_verifier,
            "code_challenge": pair.code_challenge,
            "code_challenge_method": Pkce::code_challenge_method(),
        }))?
    );
    Ok(())
}

fn build_client(
    config_path: Option<PathBuf>,
    redirect_uri: Option<String>,
) -> Result<OAuthClient<FileStorage>> {
    let mut settings =
        Settings::load(config_path.as_deref()).context("failed to load settings")?;
    if redirect_uri.is_some() {
        settings.redirect_uri = redirect_uri;
    }

    let config = settings.into_oauth_config()?;
    let storage = Arc::new(FileStorage::new(APP_NAME)?);
    Ok(OAuthClient::new(config, storage))
}

fn login(config_path: Option<PathBuf>, phone: Option<String>, timeout: Duration) -> Result<()> {
    let server = CallbackServer::new()?;
    let client = build_client(config_path, Some(server.redirect_uri()))?;
    let flow = client.start_auth_flow(phone.as_deref())?;

    if let Err(e) = webbrowser::open(&flow.url) {
        warn!(error = %e, "failed to open browser automatically");
    }
    eprintln!("Open this URL to continue in DigiLocker:\n\n  {}\n", flow.url);

    let callback = server.wait_for_callback(timeout)?;
    let outcome = client.complete_auth_flow(&callback)?;

    let key = format!(
        "digilocker:{}",
        outcome.phone_number.as_deref().unwrap_or("default")
    );
    client.save_token(&key, outcome.token)?;
    info!(%key, "stored DigiLocker token");

    Ok(())
}
