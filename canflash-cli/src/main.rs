//! canflash CLI - Command-line tool for upgrading board firmware over CAN bus.
//!
//! ## Features
//!
//! - Flash firmware images through the board bootloader
//! - Query the bootloader version and reboot the board
//! - List transport plugins and their channels
//! - Shell completion generation
//! - Environment variable support

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;

use commands::board::{cmd_reboot, cmd_version};
use commands::channels::{cmd_list_channels, cmd_list_plugins};
use commands::completions::{cmd_completions, cmd_completions_install};
use commands::flash::cmd_flash;
use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether the user pressed Ctrl-C.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// canflash - Upgrade board firmware over CAN bus.
///
/// Environment variables:
///   CANFLASH_INTERFACE         - Transport plugin (socketcan, virtual)
///   CANFLASH_CHANNEL           - CAN channel (e.g., can0)
///   CANFLASH_BITRATE           - Bus bitrate in kbit/s
///   CANFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "canflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Transport plugin to use (default: socketcan).
    #[arg(short, long, global = true, env = "CANFLASH_INTERFACE")]
    interface: Option<String>,

    /// CAN channel on the plugin (default: can0).
    #[arg(short, long, global = true, env = "CANFLASH_CHANNEL")]
    channel: Option<String>,

    /// Bus bitrate in kbit/s (default: 250).
    #[arg(short, long, global = true, env = "CANFLASH_BITRATE")]
    bitrate: Option<u32>,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "CANFLASH_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// List the CAN transport plugins compiled into this build.
    ListPlugins {
        /// Output plugin list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List channels of a transport plugin.
    ListChannels {
        /// Plugin to inspect (defaults to the configured interface).
        plugin: Option<String>,

        /// Output channel list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Erase, upload and confirm a firmware image.
    Flash {
        /// Path to the raw firmware image.
        firmware: PathBuf,

        /// Confirm the image in test mode.
        #[arg(long)]
        test_mode: bool,

        /// Bytes per acknowledged chunk (multiple of 64).
        #[arg(long, value_name = "BYTES")]
        chunk_size: Option<usize>,

        /// Reboot the board after a successful upgrade.
        #[arg(long)]
        reboot: bool,
    },

    /// Query the bootloader version.
    Version {
        /// Output the version as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Reboot the board.
    Reboot {
        /// Skip the confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions (auto-detected if not specified with --install).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Automatically install completions to your shell configuration.
        #[arg(long)]
        install: bool,
    },
}

/// Errors with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation (exit code 2).
    #[error("{0}")]
    Usage(String),
    /// Invalid configuration (exit code 3).
    #[error("{0}")]
    Config(String),
    /// CAN device or link failure (exit code 4).
    #[error("{0}")]
    Device(String),
    /// Interrupted by the user (exit code 130).
    #[error("{0}")]
    Cancelled(String),
}

/// Map an error to the process exit code.
fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => 2,
            CliError::Config(_) => 3,
            CliError::Device(_) => 4,
            CliError::Cancelled(_) => 130,
        };
    }
    match err.downcast_ref::<canflash::Error>() {
        Some(canflash::Error::Unsupported(_)) => 2,
        Some(canflash::Error::InvalidConfig(_)) => 3,
        Some(canflash::Error::DeviceCreate(_) | canflash::Error::Connect(_)) => 4,
        _ => 1,
    }
}

fn main() {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "canflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        debug!("Could not install Ctrl-C handler: {e}");
    }
    canflash::set_interrupt_checker(was_interrupted);

    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    if let Err(err) = run(&cli, &config) {
        eprintln!("{} {err:#}", style("Error:").red().bold());
        std::process::exit(exit_code(&err));
    }
}

fn run(cli: &Cli, config: &Config) -> Result<()> {
    match &cli.command {
        Commands::ListPlugins { json } => cmd_list_plugins(*json),
        Commands::ListChannels { plugin, json } => {
            let plugin = plugin
                .clone()
                .unwrap_or_else(|| cli_link_params(cli, config).interface);
            cmd_list_channels(&plugin, *json)
        },
        Commands::Flash {
            firmware,
            test_mode,
            chunk_size,
            reboot,
        } => cmd_flash(
            cli,
            config,
            firmware,
            *test_mode || config.flash.test_mode,
            *chunk_size,
            *reboot,
        ),
        Commands::Version { json } => cmd_version(cli, config, *json),
        Commands::Reboot { yes } => cmd_reboot(cli, config, *yes),
        Commands::Completions { shell, install } => {
            if *install {
                cmd_completions_install(*shell)
            } else {
                let shell = shell.ok_or_else(|| {
                    CliError::Usage(
                        "specify a shell type, e.g.: canflash completions bash \
                         (or use canflash completions --install)"
                            .to_string(),
                    )
                })?;
                cmd_completions(shell);
                Ok(())
            }
        },
    }
}

/// Link parameters with command-line overrides applied.
fn cli_link_params(cli: &Cli, config: &Config) -> canflash::LinkParams {
    config.link_params(cli.interface.as_deref(), cli.channel.as_deref(), cli.bitrate)
}

#[cfg(test)]
mod cli_tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_flash() {
        let cli = Cli::try_parse_from([
            "canflash",
            "--interface",
            "virtual",
            "--channel",
            "vcan0",
            "--bitrate",
            "500",
            "flash",
            "firmware.bin",
        ])
        .unwrap();
        assert_eq!(cli.interface.as_deref(), Some("virtual"));
        assert_eq!(cli.channel.as_deref(), Some("vcan0"));
        assert_eq!(cli.bitrate, Some(500));
        assert!(matches!(cli.command, Commands::Flash { .. }));
    }

    #[test]
    fn test_cli_parse_flash_with_all_options() {
        let cli = Cli::try_parse_from([
            "canflash",
            "flash",
            "fw.bin",
            "--test-mode",
            "--chunk-size",
            "256",
            "--reboot",
        ])
        .unwrap();
        if let Commands::Flash {
            firmware,
            test_mode,
            chunk_size,
            reboot,
        } = cli.command
        {
            assert_eq!(firmware, PathBuf::from("fw.bin"));
            assert!(test_mode);
            assert_eq!(chunk_size, Some(256));
            assert!(reboot);
        } else {
            panic!("expected flash command");
        }
    }

    #[test]
    fn test_cli_parse_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["canflash", "version", "--json", "-vv", "-c", "can1"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.channel.as_deref(), Some("can1"));
        assert!(matches!(cli.command, Commands::Version { json: true }));
    }

    #[test]
    fn test_cli_parse_list_channels() {
        let cli = Cli::try_parse_from(["canflash", "list-channels", "virtual", "--json"]).unwrap();
        if let Commands::ListChannels { plugin, json } = cli.command {
            assert_eq!(plugin.as_deref(), Some("virtual"));
            assert!(json);
        } else {
            panic!("expected list-channels command");
        }
    }

    #[test]
    fn test_cli_parse_reboot_yes() {
        let cli = Cli::try_parse_from(["canflash", "reboot", "-y"]).unwrap();
        assert!(matches!(cli.command, Commands::Reboot { yes: true }));
    }

    #[test]
    fn test_cli_flash_requires_firmware() {
        assert!(Cli::try_parse_from(["canflash", "flash"]).is_err());
    }

    #[test]
    fn test_cli_rejects_bad_bitrate() {
        assert!(Cli::try_parse_from(["canflash", "--bitrate", "fast", "version"]).is_err());
    }

    #[test]
    fn test_exit_code_mapping() {
        let code = |e: CliError| exit_code(&anyhow::Error::new(e));
        assert_eq!(code(CliError::Usage(String::new())), 2);
        assert_eq!(code(CliError::Config(String::new())), 3);
        assert_eq!(code(CliError::Device(String::new())), 4);
        assert_eq!(code(CliError::Cancelled(String::new())), 130);

        let lib = |e: canflash::Error| exit_code(&anyhow::Error::new(e));
        assert_eq!(lib(canflash::Error::Unsupported("x".into())), 2);
        assert_eq!(lib(canflash::Error::InvalidConfig("x".into())), 3);
        assert_eq!(lib(canflash::Error::DeviceCreate("x".into())), 4);
        assert_eq!(exit_code(&anyhow::anyhow!("boom")), 1);
    }

    #[test]
    fn test_cli_link_params_override_config() {
        let mut config = Config::default();
        config.connection.channel = Some("can7".into());
        let cli = Cli::try_parse_from(["canflash", "-i", "virtual", "version"]).unwrap();
        let params = cli_link_params(&cli, &config);
        assert_eq!(params.interface, "virtual");
        assert_eq!(params.channel, "can7");
    }
}
