//! switchyard: inspect the tool-orchestration runtime from the command line.
//!
//! Subcommands:
//! - `catalog`: start enabled providers and print the canonical tool catalog
//! - `status`: start enabled providers and print provider + rate-limit state
//! - `probe`: run the package-registry mirror speed test

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use switchyard_core::{load_dotenv, RuntimeConfig};
use switchyard_orchestrator::Orchestrator;

// ── CLI ─────────────────────────────────────────────────────────────

/// Tool-orchestration runtime for conversational agents.
#[derive(Parser, Debug)]
#[command(name = "switchyard", version, about)]
struct Cli {
    /// Path to switchyard.toml config file.
    #[arg(long, env = "SWITCHYARD_CONFIG", default_value = "config/switchyard.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the canonical tool catalog across all enabled providers.
    Catalog {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Print provider connection state and rate-limit status.
    Status,
    /// Probe registry mirrors and print the winner.
    Probe {
        /// Ignore a cached winner.
        #[arg(long)]
        refresh: bool,
    },
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match RuntimeConfig::from_file(&cli.config) {
        Ok(cfg) => {
            info!(path = %cli.config, "loaded switchyard config");
            cfg
        }
        Err(e) => {
            warn!(
                error = %e,
                path = %cli.config,
                "failed to load config, using defaults"
            );
            let mut cfg = RuntimeConfig::default();
            cfg.apply_env_overrides();
            cfg
        }
    };
    config.log_summary();

    let orchestrator = Orchestrator::new(config);

    match cli.command {
        Command::Catalog { json } => {
            for (provider, error) in orchestrator.start_providers().await {
                eprintln!("provider {provider} failed to start: {error}");
            }
            let catalog = orchestrator.tool_catalog().await;
            if json {
                println!("{}", serde_json::to_string_pretty(catalog.tools())?);
            } else {
                for tool in catalog.tools() {
                    let origin = if tool.renamed {
                        format!("{}:{}", tool.provider, tool.original_name)
                    } else {
                        tool.provider.clone()
                    };
                    println!("{:<40} {:<24} {}", tool.canonical_name, origin, tool.description);
                }
                for failure in catalog.failures() {
                    eprintln!("skipped {}: {}", failure.provider, failure.error);
                }
            }
            orchestrator.shutdown().await;
        }
        Command::Status => {
            for (provider, error) in orchestrator.start_providers().await {
                eprintln!("provider {provider} failed to start: {error}");
            }
            println!("{}", serde_json::to_string_pretty(&orchestrator.provider_status())?);
            println!("{}", serde_json::to_string_pretty(&orchestrator.rate_limit_status(None))?);
            orchestrator.shutdown().await;
        }
        Command::Probe { refresh } => {
            let mirror = orchestrator.registry().mirror();
            for result in mirror.probe_all().await {
                match (result.latency_ms, result.error) {
                    (Some(ms), _) => println!("{:<48} {ms}ms", result.registry),
                    (None, Some(error)) => println!("{:<48} failed: {error}", result.registry),
                    (None, None) => println!("{:<48} failed", result.registry),
                }
            }
            let choice = mirror.select(refresh).await;
            println!("selected: {}{}", choice.registry, if choice.fallback { " (fallback)" } else { "" });
        }
    }

    Ok(())
}
