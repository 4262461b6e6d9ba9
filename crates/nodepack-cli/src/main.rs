//! nodepack — plan and simulate node provisioning from a scenario file.
//!
//! ```text
//! nodepack pack --scenario pending.toml --format json
//! nodepack provision --scenario pending.toml --config nodepack.toml
//! nodepack validate --scenario pending.toml
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;
mod scenario;

use commands::OutputFormat;

#[derive(Parser)]
#[command(
    name = "nodepack",
    about = "nodepack — bin-pack pending pods onto new nodes",
    version,
    propagate_version = true
)]
struct Cli {
    /// Log line format on stderr.
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: OutputFormat,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute node packings for the scenario's pods.
    Pack {
        /// Scenario file (TOML, or JSON with a .json extension).
        #[arg(short, long)]
        scenario: PathBuf,
        /// nodepack.toml with packing, overhead and cache settings.
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Launch nodes against the scenario's simulated cloud.
    Provision {
        #[arg(short, long)]
        scenario: PathBuf,
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Check the scenario's constraints against what the provider supports.
    Validate {
        #[arg(short, long)]
        scenario: PathBuf,
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let logs = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,nodepack=debug")),
        )
        .with_writer(std::io::stderr);
    match cli.log_format {
        OutputFormat::Json => logs.json().init(),
        OutputFormat::Text => logs.init(),
    }

    match cli.command {
        Commands::Pack {
            scenario,
            config,
            format,
        } => commands::pack::pack(&scenario, config.as_deref(), format),
        Commands::Provision {
            scenario,
            config,
            format,
        } => commands::provision::provision(&scenario, config.as_deref(), format).await,
        Commands::Validate { scenario, config } => {
            commands::validate::validate(&scenario, config.as_deref()).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_pack_arguments() {
        let cli = Cli::try_parse_from(["nodepack", "pack", "-s", "pending.toml", "--format", "json"]).unwrap();
        assert_eq!(cli.log_format, OutputFormat::Text);
        match cli.command {
            Commands::Pack {
                scenario,
                config,
                format,
            } => {
                assert_eq!(scenario, PathBuf::from("pending.toml"));
                assert!(config.is_none());
                assert_eq!(format, OutputFormat::Json);
            }
            _ => panic!("expected pack"),
        }
    }

    #[test]
    fn log_format_is_global() {
        let cli = Cli::try_parse_from(["nodepack", "validate", "-s", "x.toml", "--log-format", "json"]).unwrap();
        assert_eq!(cli.log_format, OutputFormat::Json);
    }
}
