//! Medfield droidboot daemon.
//!
//! `boot` runs the full start-up sequence. The other subcommands expose one
//! stage at a time for bring-up and bench work.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand};
use droidboot_core::ota::InstallResult;
use log::{LevelFilter, error, info};

mod config;
mod error;
mod hw;
mod progress;
mod runtime;
mod status;
mod usb;

use config::{DEFAULT_CONFIG_PATH, DaemonConfig};
use error::DaemonError;
use runtime::ChargeMode;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// Daemon configuration file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Raise log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Pick the boot stage from the power-on reason and battery (default).
    Boot,
    /// Serve fastboot on the USB gadget without power supervision.
    Fastboot,
    /// Run the persisted OTA job once.
    Ota,
    /// Run a charge loop under the power governor.
    Charge {
        #[arg(long, value_enum, default_value_t = ChargeMode::Cos)]
        mode: ChargeMode,
    },
    /// Print firmware revisions and product line.
    Info,
    /// Stage a DnX and IFWI image pair.
    Ifwi { dnx: String, ifwi: String },
}

fn init_logging(config: &DaemonConfig, verbose: u8) {
    let mut builder = env_logger::Builder::new();
    builder.parse_filters(&config.log_level);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    match verbose {
        0 => {}
        1 => {
            builder.filter_level(LevelFilter::Debug);
        }
        _ => {
            builder.filter_level(LevelFilter::Trace);
        }
    }
    builder.init();
}

fn run(cli: Cli) -> Result<(), DaemonError> {
    let config = DaemonConfig::load(&cli.config)?;
    init_logging(&config, cli.verbose);
    info!("droidboot {} ({})", env!("CARGO_PKG_VERSION"), cli.config.display());

    match cli.command.unwrap_or(Command::Boot) {
        Command::Boot => runtime::boot(&config),
        Command::Fastboot => runtime::fastboot(&config),
        Command::Ota => {
            let result = runtime::ota(&config)?;
            println!("{result:?}");
            match result {
                InstallResult::Success | InstallResult::Interrupt | InstallResult::Abort => Ok(()),
                InstallResult::Error | InstallResult::Corrupt => Err(DaemonError::Ota(result)),
            }
        }
        Command::Charge { mode } => runtime::charge(&config, mode),
        Command::Info => {
            for line in runtime::info(&config) {
                println!("{line}");
            }
            Ok(())
        }
        Command::Ifwi { dnx, ifwi } => {
            let outcome = runtime::ifwi(&config, &dnx, &ifwi)?;
            println!("{outcome:?}");
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            eprintln!("droidboot: {err}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn charge_mode_parses_from_flag() {
        let cli = Cli::try_parse_from(["droidboot", "charge", "--mode", "pos"]).expect("parse");
        assert!(matches!(
            cli.command,
            Some(Command::Charge {
                mode: ChargeMode::Pos
            })
        ));
    }

    #[test]
    fn subcommand_defaults_to_boot() {
        let cli = Cli::try_parse_from(["droidboot", "-vv"]).expect("parse");
        assert!(cli.command.is_none());
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
    }
}
