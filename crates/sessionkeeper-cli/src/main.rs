//! Sessionkeeper - command line client for a bearer-token API session.
//!
//! Signs in against the API's `/auth/*` endpoints, keeps the session on
//! disk between runs, and refreshes the access token when it nears expiry.

use std::io::{self, BufRead, Write};

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sessionkeeper_core::api::Credentials;
use sessionkeeper_core::config::{Config, APP_NAME};
use sessionkeeper_core::RequestAuthorizer;

const LOG_FILE: &str = "sessionkeeper.log";

const USAGE: &str = "\
Usage: sessionkeeper [--verbose] <command>

Commands:
  login [email]         Sign in with email and password
  register [email]      Create an account and sign in
  google <code> <state> Complete a Google sign-in
  status [--json]       Show the current session
  me                    Fetch the signed-in user's profile
  refresh               Refresh the access token now
  logout                Sign out and forget the stored session
";

/// Initialize the tracing subscriber for logging
///
/// Logs always go to a file in the cache directory; `--verbose` mirrors them
/// to stderr. Use RUST_LOG to control the level (e.g., RUST_LOG=debug).
fn init_tracing(verbose: bool) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match Config::cache_dir() {
        Ok(dir) if std::fs::create_dir_all(&dir).is_ok() => {
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, LOG_FILE));
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        _ => (None, None),
    };
    let stderr_layer = verbose.then(|| fmt::layer().with_writer(io::stderr));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let verbose = take_flag(&mut args, "--verbose") | take_flag(&mut args, "-v");
    let _guard = init_tracing(verbose);

    if args.is_empty() || take_flag(&mut args, "--help") || take_flag(&mut args, "-h") {
        print!("{}", USAGE);
        return Ok(());
    }

    let config = Config::load()?;
    info!(base_url = %config.base_url, "{} starting", APP_NAME);
    let authorizer = config.connect().await?;

    let result = run(&authorizer, &args).await;
    authorizer.session().dispose().await;
    result
}

async fn run(authorizer: &RequestAuthorizer, args: &[String]) -> Result<()> {
    let session = authorizer.session();
    let command = args[0].as_str();
    let rest = &args[1..];

    match command {
        "login" => {
            let credentials = prompt_credentials(rest.first())?;
            session.sign_in(&credentials).await.context("Login failed")?;
            println!("{}", session.status().await.display_message());
        }
        "register" => {
            let credentials = prompt_credentials(rest.first())?;
            session.register(&credentials).await.context("Registration failed")?;
            println!("Account created. {}", session.status().await.display_message());
        }
        "google" => {
            let (Some(code), Some(state)) = (rest.first(), rest.get(1)) else {
                bail!("google requires <code> and <state>\n\n{}", USAGE);
            };
            session
                .sign_in_with_google(code, state)
                .await
                .context("Google sign-in failed")?;
            println!("{}", session.status().await.display_message());
        }
        "status" => {
            let status = session.status().await;
            if rest.iter().any(|a| a == "--json") {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("{}", status.display_message());
            }
        }
        "me" => {
            let profile: serde_json::Value = authorizer
                .send_json(authorizer.post("/auth/me"))
                .await
                .context("Failed to fetch profile")?;
            println!("{}", serde_json::to_string_pretty(&profile)?);
        }
        "refresh" => {
            if !session.status().await.is_active() {
                bail!("Not signed in. Run `sessionkeeper login` first.");
            }
            session.refresh_now().await.context("Refresh failed")?;
            println!("{}", session.status().await.display_message());
        }
        "logout" => {
            session.sign_out().await;
            println!("Signed out");
        }
        other => bail!("Unknown command '{}'\n\n{}", other, USAGE),
    }

    Ok(())
}

fn take_flag(args: &mut Vec<String>, flag: &str) -> bool {
    let before = args.len();
    args.retain(|a| a != flag);
    args.len() != before
}

fn prompt_credentials(email: Option<&String>) -> Result<Credentials> {
    let email = match email {
        Some(email) => email.clone(),
        None => {
            print!("Email: ");
            io::stdout().flush()?;
            let mut line = String::new();
            io::stdin().lock().read_line(&mut line)?;
            line.trim().to_string()
        }
    };
    if email.is_empty() {
        bail!("Email is required");
    }

    let password = rpassword::prompt_password("Password: ").context("Failed to read password")?;
    if password.is_empty() {
        bail!("Password is required");
    }

    Ok(Credentials::new(email, password))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_take_flag_removes_every_occurrence() {
        let mut a = args(&["--verbose", "status", "--verbose"]);
        assert!(take_flag(&mut a, "--verbose"));
        assert_eq!(a, args(&["status"]));
        assert!(!take_flag(&mut a, "--verbose"));
    }

    #[test]
    fn test_usage_lists_every_command() {
        for command in ["login", "register", "google", "status", "me", "refresh", "logout"] {
            assert!(USAGE.contains(command), "missing {}", command);
        }
    }
}
