//! sessionguard - send requests to an API through the authenticated pipeline.
//!
//! The stored session is shared between runs; tokens are refreshed as needed
//! and transient failures are retried before anything is reported.

mod format;

use std::io;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use sessionguard_core::auth::{token, EndReason, SessionEvent};
use sessionguard_core::{ClientConfig, CredentialRecord, RequestPipeline, RequestSpec, Token, UserProfile};
use tokio::sync::broadcast;
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use format::{format_expiry, pretty_body};

#[derive(Parser)]
#[command(name = "sessionguard", version, about)]
struct Cli {
    /// API base URL (overrides the config file)
    #[arg(long, env = "SESSIONGUARD_BASE_URL", global = true)]
    base_url: Option<String>,

    /// Also write logs to a daily file in the cache directory
    #[arg(long, global = true)]
    log_file: bool,

    /// Extra request header as `Name: value` (repeatable)
    #[arg(short = 'H', long = "header", global = true, value_parser = parse_header)]
    headers: Vec<(String, String)>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// GET a path and print the response body
    Get { path: String },
    /// POST a JSON body to a path and print the response body
    Post {
        path: String,
        #[arg(long, default_value = "{}")]
        body: String,
    },
    /// PUT a JSON body to a path and print the response body
    Put {
        path: String,
        #[arg(long, default_value = "{}")]
        body: String,
    },
    /// DELETE a path and print the response body
    Delete { path: String },
    /// Check that the API is reachable (no credentials needed)
    Health,
    /// Show the stored session and when its token expires
    Status,
    /// Store a token obtained elsewhere as the current session
    Import {
        token: String,
        /// User record as JSON
        #[arg(long)]
        user: Option<String>,
    },
    /// Sign out, clearing the local session whatever the server says
    Logout,
}

/// Initialize the tracing subscriber for logging
fn init_tracing(config: &ClientConfig, log_file: bool) -> Result<Option<WorkerGuard>> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let stderr_layer = fmt::layer().with_writer(io::stderr);

    if log_file {
        let appender = tracing_appender::rolling::daily(config.cache_dir()?, "sessionguard.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::registry()
            .with(stderr_layer)
            .with(fmt::layer().with_ansi(false).with_writer(writer))
            .with(filter)
            .init();
        Ok(Some(guard))
    } else {
        tracing_subscriber::registry()
            .with(stderr_layer)
            .with(filter)
            .init();
        Ok(None)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let mut config = ClientConfig::load()?;
    if let Some(base_url) = cli.base_url.clone() {
        config.base_url = base_url;
    }

    let _log_guard = init_tracing(&config, cli.log_file)?;
    info!(base_url = %config.base_url, "sessionguard starting");

    let pipeline = RequestPipeline::from_config(config)?;
    let mut events = pipeline.subscribe();

    let result = run(&pipeline, cli.command, cli.headers).await;
    report_session_events(&mut events);
    result
}

async fn run(pipeline: &RequestPipeline, command: Command, headers: Vec<(String, String)>) -> Result<()> {
    let with_headers = |spec: RequestSpec| {
        headers
            .iter()
            .fold(spec, |spec, (name, value)| spec.with_header(name.as_str(), value.as_str()))
    };

    match command {
        Command::Get { path } => {
            let response = pipeline.send(with_headers(RequestSpec::get(path))).await?;
            debug!(attempts = response.attempts, elapsed_ms = response.elapsed.as_millis() as u64, "Done");
            println!("{}", pretty_body(&response.body));
        }
        Command::Post { path, body } => {
            let body = serde_json::from_str(&body).context("--body is not valid JSON")?;
            let response = pipeline.send(with_headers(RequestSpec::post(path, body))).await?;
            println!("{}", pretty_body(&response.body));
        }
        Command::Put { path, body } => {
            let body = serde_json::from_str(&body).context("--body is not valid JSON")?;
            let response = pipeline.send(with_headers(RequestSpec::put(path, body))).await?;
            println!("{}", pretty_body(&response.body));
        }
        Command::Delete { path } => {
            let response = pipeline.send(with_headers(RequestSpec::delete(path))).await?;
            println!("{}", pretty_body(&response.body));
        }
        Command::Health => {
            let response = pipeline.health().await?;
            println!("ok ({} ms)", response.elapsed.as_millis());
        }
        Command::Status => print_status(pipeline),
        Command::Import { token, user } => {
            let user: UserProfile = match user {
                Some(raw) => serde_json::from_str(&raw).context("--user is not valid JSON")?,
                None => UserProfile::default(),
            };
            let token = Token::new(token);
            if let Err(e) = token.claims() {
                eprintln!("Warning: token claims could not be read ({}); it will be refreshed before use", e);
            }
            pipeline.establish(CredentialRecord::new(token, user))?;
            println!("Session stored");
        }
        Command::Logout => {
            pipeline.logout().await?;
            println!("Signed out");
        }
    }
    Ok(())
}

fn print_status(pipeline: &RequestPipeline) {
    let Some(record) = pipeline.credentials().record() else {
        println!("Not signed in");
        return;
    };

    if let Some(ref name) = record.user.username {
        println!("User:    {}", name);
    }
    match record.token.claims() {
        Ok(claims) => {
            let now = Utc::now();
            if let Some(ref subject) = claims.subject {
                println!("Subject: {}", subject);
            }
            if let Some(ref role) = claims.role {
                println!("Role:    {}", role);
            }
            if let Some(issued_at) = claims.issued_at_utc() {
                println!("Issued:  {}", issued_at.to_rfc3339());
            }
            if let Some(expires_at) = claims.expires_at_utc() {
                println!("Expires: {} ({})", expires_at.to_rfc3339(), format_expiry(expires_at - now));
            }
            if token::is_expired(&record.token, now) {
                println!("Token is expired and will be refreshed on the next request");
            } else if token::needs_refresh(&record.token, now) {
                println!("Token expires soon and will be refreshed on the next request");
            }
        }
        Err(e) => println!("Token claims unreadable: {}", e),
    }
}

/// Split a `Name: value` header argument.
fn parse_header(raw: &str) -> Result<(String, String), String> {
    match raw.split_once(':') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected `Name: value`, got `{}`", raw)),
    }
}

/// Tell the user about session changes that happened during the command.
fn report_session_events(events: &mut broadcast::Receiver<SessionEvent>) {
    while let Ok(event) = events.try_recv() {
        match event {
            SessionEvent::Refreshed => debug!("Session token was refreshed"),
            SessionEvent::Ended(EndReason::Unauthenticated) => {
                eprintln!("Not signed in. Import a token with `sessionguard import <token>`.")
            }
            SessionEvent::Ended(_) => {
                eprintln!("Session expired. Sign in again and import the new token.")
            }
            SessionEvent::LoggedOut => debug!("Local session cleared"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header() {
        assert_eq!(
            parse_header("X-Tenant: acme"),
            Ok(("X-Tenant".to_string(), "acme".to_string()))
        );
        assert_eq!(
            parse_header("Accept:application/json"),
            Ok(("Accept".to_string(), "application/json".to_string()))
        );
        assert!(parse_header("no-colon").is_err());
        assert!(parse_header(": value").is_err());
    }

    #[test]
    fn test_cli_collects_repeated_headers() {
        let cli = Cli::try_parse_from([
            "sessionguard",
            "delete",
            "/items/1",
            "-H",
            "X-Tenant: acme",
            "--header",
            "X-Trace: 1",
        ])
        .unwrap();
        assert!(matches!(cli.command, Command::Delete { ref path } if path == "/items/1"));
        assert_eq!(cli.headers.len(), 2);
        assert_eq!(cli.headers[1], ("X-Trace".to_string(), "1".to_string()));
    }
}
