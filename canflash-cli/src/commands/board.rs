//! Version query and reboot.

use anyhow::Result;
use canflash::{BoardVersion, Event, Request, UpgradeConfig};
use console::style;
use dialoguer::Confirm;
use serde::Serialize;

use super::{connect, disconnect, finish};
use crate::config::Config;
use crate::{Cli, CliError};

/// JSON shape of `version --json`.
#[derive(Serialize)]
struct VersionReport {
    version: String,
    #[serde(flatten)]
    parts: BoardVersion,
    raw: u32,
}

/// Version command implementation.
pub(crate) fn cmd_version(cli: &Cli, config: &Config, json: bool) -> Result<()> {
    let upgrade = UpgradeConfig::default().with_timeouts(config.timeout_policy());
    let mut session = connect(cli, config, upgrade)?;
    let outcome = finish(session.execute(Request::GetVersion, |_| {}));
    disconnect(&mut session);

    let Event::VersionReceived { version } = outcome? else {
        return Err(anyhow::anyhow!("Unexpected reply to version query"));
    };

    if json {
        let report = VersionReport {
            version: version.to_string(),
            parts: version,
            raw: u32::from(version),
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&report).unwrap_or_default()
        );
    } else {
        println!("{version}");
    }
    Ok(())
}

/// Reboot command implementation.
pub(crate) fn cmd_reboot(cli: &Cli, config: &Config, yes: bool) -> Result<()> {
    if !yes {
        if cli.non_interactive || !console::Term::stderr().is_term() {
            return Err(CliError::Usage(
                "reboot needs confirmation; pass --yes in non-interactive mode".to_string(),
            )
            .into());
        }
        let proceed = Confirm::new()
            .with_prompt("Reboot the board now?")
            .default(false)
            .interact()
            .map_err(|e| CliError::Cancelled(format!("Prompt aborted: {e}")))?;
        if !proceed {
            return Err(CliError::Cancelled("Reboot cancelled".to_string()).into());
        }
    }

    let upgrade = UpgradeConfig::default().with_timeouts(config.timeout_policy());
    let mut session = connect(cli, config, upgrade)?;
    let outcome = finish(session.execute(Request::Reboot, |_| {}));
    disconnect(&mut session);
    outcome?;

    if !cli.quiet {
        eprintln!("{} Reboot command sent", style("✓").green());
    }
    Ok(())
}
