//! Plex Resolver CLI
//!
//! # Usage
//! ```bash
//! # Run the HTTP API
//! plex-resolver serve --listen 0.0.0.0:8080
//!
//! # Sign in from the terminal and save the first working server
//! plex-resolver login
//!
//! # Verify the saved credential
//! plex-resolver check
//!
//! # Dump every endpoint for another url/token pair
//! plex-resolver check --url https://10.0.0.5:32400 --token ABC123 --no-verify-tls
//!
//! # Run a playlist script
//! plex-resolver run sync_playlists.py 12345
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use plex_resolver::check::DiagnoseOptions;
use plex_resolver::coordinator::{Coordinator, PollOutcome, SaveRequest};
use plex_resolver::scripts::ScriptRunner;
use plex_resolver::server::{self, AppState};
use plex_resolver::{EngineConfig, ResolveError, SessionContext, SessionRegistry};

const POLL_INTERVAL: Duration = Duration::from_millis(1500);
/// Give up when plex.tv did not report a PIN expiry
const LOGIN_TIMEOUT: Duration = Duration::from_secs(600);

// ============================================================
// CLI Definition
// ============================================================

#[derive(Parser)]
#[command(name = "plex-resolver")]
#[command(about = "Plex server & credential resolution engine", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(flatten)]
    config: EngineConfig,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API
    Serve {
        /// Address to bind
        #[arg(long, env = "PLEX_LISTEN", default_value = "0.0.0.0:8080")]
        listen: SocketAddr,
    },

    /// Sign in with a PIN and save a working server
    Login {
        /// Server url to save (default: first discovered server)
        #[arg(long)]
        server_url: Option<String>,

        /// Expected machineIdentifier of the server
        #[arg(long)]
        server_id: Option<String>,

        /// Skip TLS certificate verification
        #[arg(long)]
        no_verify_tls: bool,

        /// Save the first pair even if no probe succeeds
        #[arg(long)]
        force: bool,
    },

    /// Verify the saved credential
    Check {
        /// Dump every endpoint instead of the short check
        #[arg(long)]
        full: bool,

        /// Url to test instead of the saved one (implies --full)
        #[arg(long)]
        url: Option<String>,

        /// Token to test instead of the saved one (implies --full)
        #[arg(long)]
        token: Option<String>,

        /// Url with an X-Plex-Token to compare against the token in use (implies --full)
        #[arg(long)]
        compare_url: Option<String>,

        /// Keep localhost urls as written (implies --full)
        #[arg(long)]
        no_remap: bool,

        /// Skip TLS certificate verification (implies --full)
        #[arg(long)]
        no_verify_tls: bool,
    },

    /// Run an external script from the scripts directory
    Run {
        /// Script file name
        script: String,

        /// Optional id argument passed to the script
        id: Option<String>,
    },
}

// ============================================================
// Main Entry Point
// ============================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs)?;

    match cli.command {
        Commands::Serve { listen } => {
            let coordinator =
                Coordinator::from_config(&cli.config).context("Failed to build HTTP clients")?;
            let state = AppState::new(coordinator, SessionRegistry::new(cli.config.session_ttl()));

            let listener = tokio::net::TcpListener::bind(listen)
                .await
                .with_context(|| format!("Failed to bind {}", listen))?;
            server::serve(listener, state).await?;
        }

        Commands::Login {
            server_url,
            server_id,
            no_verify_tls,
            force,
        } => {
            let coordinator =
                Coordinator::from_config(&cli.config).context("Failed to build HTTP clients")?;
            login(&coordinator, server_url, server_id, !no_verify_tls, force).await?;
        }

        Commands::Check {
            full,
            url,
            token,
            compare_url,
            no_remap,
            no_verify_tls,
        } => {
            let coordinator =
                Coordinator::from_config(&cli.config).context("Failed to build HTTP clients")?;

            let full = full
                || url.is_some()
                || token.is_some()
                || compare_url.is_some()
                || no_remap
                || no_verify_tls;
            if full {
                let options = DiagnoseOptions {
                    url,
                    token,
                    verify_tls: no_verify_tls.then_some(false),
                    compare_url,
                    no_remap,
                };
                let report = coordinator.diagnose(&options).await;
                println!("{}", serde_json::to_string_pretty(&report)?);
                if let Some(error) = report.error {
                    bail!("Diagnostics could not run: {}", error);
                }
                return Ok(());
            }

            let report = coordinator.check_connection().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.ok {
                bail!(
                    "Connection check failed: {}",
                    report.error.unwrap_or_default()
                );
            }
        }

        Commands::Run { script, id } => {
            let runner = ScriptRunner::new(&cli.config.interpreter, &cli.config.scripts_dir);
            let output = runner.run(&script, id.as_deref()).await?;
            print!("{}", output.stdout);
            eprint!("{}", output.stderr);
            if !output.success() {
                bail!("{} exited with code {}", script, output.exit_code);
            }
        }
    }

    Ok(())
}

fn init_logging(verbose: bool, json: bool) -> Result<()> {
    let level = if verbose { LevelFilter::DEBUG } else { LevelFilter::INFO };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false);
    if json {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }
    Ok(())
}

/// Terminal sign-in: start, wait for approval, save
async fn login(
    coordinator: &Coordinator,
    server_url: Option<String>,
    server_id: Option<String>,
    verify_tls: bool,
    force: bool,
) -> Result<()> {
    let mut session = SessionContext::new();
    let started = coordinator.start(&mut session).await?;

    println!("\nEnter code {} at plex.tv/link, or open:\n  {}\n", started.code, started.deeplink);
    info!(pin_id = started.pin_id, "Waiting for approval");

    let deadline = tokio::time::Instant::now() + LOGIN_TIMEOUT;
    let servers = loop {
        tokio::time::sleep(POLL_INTERVAL).await;
        if tokio::time::Instant::now() >= deadline {
            bail!("Timed out waiting for PIN approval");
        }

        match coordinator.poll(&mut session, started.pin_id).await {
            Ok(PollOutcome::Pending) => continue,
            Ok(PollOutcome::ServersReady(servers)) => break servers,
            Err(ResolveError::UnknownExchange) => bail!("PIN expired before it was approved"),
            Err(e @ (ResolveError::ProviderUnreachable(_) | ResolveError::ProviderRejected(_))) => {
                warn!(error = %e, "Poll failed, retrying");
            }
            Err(e) => return Err(e.into()),
        }
    };

    println!("{:<32} {:<40} {:<6} TOKENS", "NAME", "URL", "LOCAL");
    println!("{}", "-".repeat(90));
    for s in &servers {
        println!("{:<32} {:<40} {:<6} {}", s.name, s.uri, s.local, s.tokens.len());
    }

    let chosen = match server_url {
        Some(url) => url,
        None => servers
            .first()
            .map(|s| s.uri.clone())
            .context("No servers discovered")?,
    };
    let server_id = server_id.or_else(|| {
        servers
            .iter()
            .find(|s| s.uri == chosen)
            .and_then(|s| s.id.clone())
    });

    let request = SaveRequest {
        server_url: chosen,
        server_id,
        verify_tls,
        force,
    };
    match coordinator.save(&mut session, &request).await {
        Ok(saved) => {
            println!(
                "\nSaved {} (server {}, {} token{})",
                saved.chosen_url,
                if saved.server_id.is_empty() { "unknown" } else { &saved.server_id },
                saved.token_source,
                if saved.forced { ", unverified" } else { "" }
            );
            Ok(())
        }
        Err(e) => {
            if let Some(probes) = e.probes() {
                for p in probes {
                    println!(
                        "  {} [{} {}] -> {} {}",
                        p.candidate_url,
                        p.token_source,
                        p.token_preview,
                        p.http_code,
                        p.error.as_deref().unwrap_or("")
                    );
                }
            }
            Err(e.into())
        }
    }
}
