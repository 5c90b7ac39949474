//! Command-line front end for setlist sessions
//!
//! Set your client ID before logging in: export SETLIST_CLIENT_ID="your_client_id"
//! The redirect URI registered with the provider must match SETLIST_REDIRECT_URI
//! (default http://127.0.0.1:8888/callback).
use clap::{Parser, Subcommand};
use setlist::prelude::*;
use setlist::session::SESSION_KEY;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing_subscriber::EnvFilter;

const APP_NAME: &str = "setlist";

#[derive(Parser, Debug)]
#[command(name = "setlist", version, about = "Log in to a music service with OAuth 2.0 PKCE")]
struct Args {
    /// Keep the session in a plain file instead of the OS keyring
    #[arg(long, global = true)]
    file_storage: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open the browser and log in
    Login {
        /// Seconds to wait for the browser redirect
        #[arg(long, default_value_t = 300)]
        timeout: u64,
    },
    /// Show whether a session is stored and when it expires
    Status,
    /// Print a valid access token, refreshing it if needed
    Token,
    /// Print the logged-in user's profile
    Whoami,
    /// Forget the stored session
    Logout,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let result = ProviderConfig::from_env().and_then(|config| {
        let lock_manager = RefreshLockManager::for_app(APP_NAME)?;
        if args.file_storage {
            let storage = Arc::new(FileStore::new(APP_NAME)?);
            let manager = SessionManager::new(config, storage)?.with_refresh_lock(lock_manager);
            run(&manager, &args.command)
        } else {
            let storage = Arc::new(SecureStore::new(APP_NAME, &[SESSION_KEY])?);
            let manager = SessionManager::new(config, storage)?.with_refresh_lock(lock_manager);
            run(&manager, &args.command)
        }
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("✗ {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run<S: KeyValueStore>(manager: &SessionManager<S>, command: &Command) -> Result<()> {
    match command {
        Command::Login { timeout } => {
            println!("Opening the browser to log in...");
            let tokens = manager.authorize_with_loopback(Duration::from_secs(*timeout))?;
            println!("✓ Logged in (token valid for {} seconds)", tokens.expires_in);
        }
        Command::Status => {
            let session = manager.session();
            match session.expires_at {
                Some(expires_at) => {
                    let now = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_millis() as u64)
                        .unwrap_or(0);
                    if expires_at > now {
                        println!("Logged in, access token expires in {}s", (expires_at - now) / 1000);
                    } else {
                        println!("Logged in, access token expired");
                    }
                    let refresh = if session.refresh_token.is_some() { "yes" } else { "no" };
                    println!("Refresh token: {}", refresh);
                }
                None => println!("Not logged in"),
            }
        }
        Command::Token => {
            let token = manager.access_token().ok_or(AuthError::NotAuthenticated)?;
            println!("{}", token);
        }
        Command::Whoami => {
            let profile = manager.user_profile()?;
            println!("{}", profile.display_name.as_deref().unwrap_or(&profile.id));
            if let Some(email) = &profile.email {
                println!("  Email: {}", email);
            }
            if let Some(product) = &profile.product {
                println!("  Plan: {}", product);
            }
        }
        Command::Logout => {
            manager.logout();
            println!("✓ Logged out");
        }
    }
    Ok(())
}
