//! Flash command implementation.

use anyhow::{Context, Result};
use canflash::{Event, FirmwareImage, Request};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;

use super::{connect, disconnect, finish};
use crate::config::Config;
use crate::{Cli, CliError, use_fancy_output, was_interrupted};

fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("Interrupted".to_string()).into())
    } else {
        Ok(())
    }
}

fn progress_bar(cli: &Cli) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(0);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] \
                 {bytes}/{total_bytes} {msg}",
            )
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

/// Flash command implementation.
pub(crate) fn cmd_flash(
    cli: &Cli,
    config: &Config,
    firmware: &Path,
    test_mode: bool,
    chunk_size: Option<usize>,
    reboot: bool,
) -> Result<()> {
    let image = FirmwareImage::from_file(firmware)
        .with_context(|| format!("Failed to read firmware {}", firmware.display()))?;
    if !cli.quiet {
        eprintln!(
            "{} Loaded {} ({} bytes)",
            style("📦").cyan(),
            firmware.display(),
            image.len()
        );
    }

    let upgrade = config.upgrade_config(chunk_size);
    upgrade.validate().map_err(|e| {
        // Blame whichever source supplied the chunk size.
        if chunk_size.is_some() {
            CliError::Usage(e.to_string())
        } else {
            CliError::Config(format!("[flash] chunk_size: {e}"))
        }
    })?;

    ensure_not_interrupted()?;
    let mut session = connect(cli, config, upgrade)?;

    let pb = progress_bar(cli);
    let done = session.execute(Request::Flash { image, test_mode }, |event| match event {
        Event::EraseStarted { .. } => pb.set_message("Erasing"),
        Event::UploadStarted { total } => {
            pb.set_length(u64::from(*total));
            pb.set_message("Uploading");
        },
        Event::UploadProgress { offset, .. } => pb.set_position(u64::from(*offset)),
        Event::ConfirmStarted { test_mode } => {
            pb.set_message(if *test_mode {
                "Confirming (test mode)"
            } else {
                "Confirming"
            });
        },
        _ => {},
    });

    let outcome = finish(done);
    match &outcome {
        Ok(_) => pb.finish_with_message("Complete"),
        Err(_) => pb.abandon(),
    }

    let result = outcome.and_then(|_| {
        if !cli.quiet {
            eprintln!(
                "\n{} Upgrade completed{}",
                style("🎉").green().bold(),
                if test_mode { " (test mode)" } else { "" }
            );
        }
        if reboot {
            if !cli.quiet {
                eprintln!("{} Rebooting board", style("🔄").cyan());
            }
            finish(session.execute(Request::Reboot, |_| {}))?;
        } else if !cli.quiet {
            eprintln!(
                "Reboot the board to complete the upgrade: {}",
                style("canflash reboot").cyan()
            );
        }
        Ok(())
    });

    disconnect(&mut session);
    result
}
