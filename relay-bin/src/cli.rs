use clap::{Parser, Subcommand};
use relay_config::{ConfigLoader, RelayConfig};
use relay_core::{RelayError, Result};
use std::path::PathBuf;

use crate::demo;

/// Relay: run agent workflows under an observable lifecycle pipeline
#[derive(Parser)]
#[command(name = "relay", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to relay.toml config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (e.g. debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all log output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the demonstration agent on one input
    Run {
        /// Text handed to the agent
        input: String,
        /// Stream the final model response frame by frame
        #[arg(long)]
        stream: bool,
        /// Print the final run state as JSON after the answer
        #[arg(long)]
        state: bool,
    },
    /// Show current configuration
    Config {
        /// Output as JSON instead of TOML
        #[arg(long)]
        json: bool,
    },
    /// Show version and build info
    Version,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let config_loader = ConfigLoader::load(self.config.as_deref())?;
        let config = config_loader.get();

        // --verbose > --quiet > --log-level > config
        let log_level = if self.verbose {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            self.log_level.as_deref().unwrap_or(&config.logging.level)
        };
        init_logging(log_level, &config.logging.format);

        match self.command {
            Commands::Run {
                input,
                stream,
                state,
            } => Self::cmd_run(config, input, stream, state).await,
            Commands::Config { json } => Self::cmd_config(config, json),
            Commands::Version => Self::cmd_version(),
        }
    }

    async fn cmd_run(config: RelayConfig, input: String, stream: bool, state: bool) -> Result<()> {
        let agent = demo::build_agent(&config, &input, stream)?;
        let answer = agent.run(input).await?;
        println!("{answer}");
        if state {
            println!("{}", serde_json::to_string_pretty(&agent.last_run_state())?);
        }
        Ok(())
    }

    fn cmd_config(config: RelayConfig, json: bool) -> Result<()> {
        if json {
            println!("{}", serde_json::to_string_pretty(&config)?);
        } else {
            println!(
                "{}",
                toml::to_string_pretty(&config).map_err(|e| RelayError::Config(e.to_string()))?
            );
        }
        Ok(())
    }

    fn cmd_version() -> Result<()> {
        println!("relay v{}", env!("CARGO_PKG_VERSION"));
        println!("   Target: {}", std::env::consts::ARCH);
        println!("   OS: {}", std::env::consts::OS);
        #[cfg(debug_assertions)]
        println!("   Build: debug");
        #[cfg(not(debug_assertions))]
        println!("   Build: release");
        Ok(())
    }
}

fn init_logging(level: &str, format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    if format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}
