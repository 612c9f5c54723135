//! flux-proxy CLI
//!
//! Runs commands and one-off requests through short-lived flux proxy sessions.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use flux_proxy::{HttpConnector, ProxyConfig, SessionDefaults, SessionManager, SessionSettings};

mod display;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (defaults to <config dir>/flux-proxy/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a command with its HTTP(S) traffic routed through a new session
    Exec {
        #[command(flatten)]
        session: SessionArgs,

        /// Command and arguments to run
        #[arg(required = true, last = true)]
        command: Vec<String>,
    },

    /// Send one GET request through a new session and print the body
    Get {
        url: String,

        #[command(flatten)]
        session: SessionArgs,
    },

    /// End a session by id
    End { session_id: String },
}

#[derive(clap::Args, Debug)]
struct SessionArgs {
    /// Credential to attach upstream (repeatable)
    #[arg(long = "credential-id")]
    credential_ids: Vec<String>,

    /// Host the session may reach (repeatable; none allows every host)
    #[arg(long = "allow-host")]
    allow_hosts: Vec<String>,

    /// Header the proxy adds to every request, as NAME=VALUE (repeatable)
    #[arg(long = "header", value_parser = parse_header)]
    headers: Vec<(String, String)>,

    /// Session lifetime in seconds (defaults to the configured duration)
    #[arg(long)]
    duration_secs: Option<u64>,
}

impl SessionArgs {
    fn into_settings(self, defaults: &SessionDefaults) -> SessionSettings {
        let duration = self
            .duration_secs
            .map_or_else(|| defaults.duration(), Duration::from_secs);

        self.headers.into_iter().fold(
            SessionSettings::builder()
                .allow_hosts(self.allow_hosts)
                .credential_ids(self.credential_ids)
                .duration(duration)
                .build(),
            |settings, (name, value)| settings.with_header(name, value),
        )
    }
}

fn parse_header(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .filter(|(name, _)| !name.is_empty())
        .ok_or_else(|| format!("expected NAME=VALUE, got '{raw}'"))
}

/// Initializes structured logging with tracing.
///
/// `FLUX_PROXY_LOG_FORMAT=json` switches to machine-readable output; the
/// default is human-readable. Levels come from `RUST_LOG`.
fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let format = std::env::var("FLUX_PROXY_LOG_FORMAT")
        .unwrap_or_else(|_| "pretty".to_string())
        .to_lowercase();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("flux_proxy=warn,flux_proxy_cli=info"));

    match format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .init();
        }
        _ => {
            fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .init();
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<ProxyConfig> {
    let config = match path {
        Some(path) => ProxyConfig::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ProxyConfig::load().context("Failed to load config")?,
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let config = load_config(args.config.as_deref())?;
    debug!(control_plane_addr = %config.control_plane_addr, "loaded configuration");
    let manager = SessionManager::from_config(config.clone())?;

    match args.command {
        Command::Exec { session, command } => {
            let settings = session.into_settings(&config.session);
            let code = exec(&manager, settings, &command).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Command::Get { url, session } => {
            let settings = session.into_settings(&config.session);
            get(&manager, settings, &url).await?;
        }
        Command::End { session_id } => {
            manager
                .end_session(&session_id)
                .await
                .with_context(|| format!("Failed to end session {session_id}"))?;
            display::session_ended(&session_id);
        }
    }

    Ok(())
}

/// Runs `command` with proxy and CA environment pointing at a new session.
///
/// Returns the child's exit code. The session is closed once the child exits.
async fn exec(manager: &SessionManager, settings: SessionSettings, command: &[String]) -> Result<i32> {
    let (program, program_args) = command.split_first().context("No command given")?;

    let session = manager
        .start_session(settings)
        .await
        .context("Failed to start proxy session")?;
    display::session_started(&session);

    let (http_proxy, https_proxy) = session.proxy_urls()?;

    let mut ca_file = tempfile::Builder::new()
        .prefix("flux-proxy-ca-")
        .suffix(".pem")
        .tempfile()
        .context("Failed to create CA bundle file")?;
    ca_file
        .write_all(session.trust().pem_bundle().as_bytes())
        .and_then(|()| ca_file.flush())
        .context("Failed to write CA bundle file")?;

    info!(program = %program, "running command through flux proxy");
    let status = tokio::process::Command::new(program)
        .args(program_args)
        .env("HTTP_PROXY", http_proxy.as_str())
        .env("http_proxy", http_proxy.as_str())
        .env("HTTPS_PROXY", https_proxy.as_str())
        .env("https_proxy", https_proxy.as_str())
        .env("SSL_CERT_FILE", ca_file.path())
        .env("REQUESTS_CA_BUNDLE", ca_file.path())
        .status()
        .await;

    session.close().await;
    display::session_ended(&session.session_id());

    let status = status.with_context(|| format!("Failed to run {program}"))?;
    display::child_exited(program, status.code());
    Ok(status.code().unwrap_or(1))
}

/// Sends one GET through a new session, streaming the body to stdout.
async fn get(manager: &SessionManager, settings: SessionSettings, url: &str) -> Result<()> {
    let session = manager
        .start_session(settings)
        .await
        .context("Failed to start proxy session")?;
    display::session_started(&session);

    let connector = HttpConnector::new(session);
    let result = fetch(&connector, url).await;
    connector.close().await;
    result
}

async fn fetch(connector: &HttpConnector, url: &str) -> Result<()> {
    let response = connector
        .get(url)
        .await
        .with_context(|| format!("GET {url} failed"))?;
    display::response_status(response.status());

    let mut stdout = tokio::io::stdout();
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        stdout.write_all(&chunk.context("Failed to read response body")?).await?;
    }
    stdout.flush().await?;
    Ok(())
}
