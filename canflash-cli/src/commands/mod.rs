//! Command implementations.
//!
//! Each subcommand is implemented in its own module for clean separation.
//! This module holds the link handling they share.

pub(crate) mod board;
pub(crate) mod channels;
pub(crate) mod completions;
pub(crate) mod flash;

use anyhow::{Context, Result};
use canflash::{ErrorKind, Event, LinkParams, Request, Runner, Transport, UpgradeConfig};
use console::style;
use log::debug;

use crate::config::Config;
use crate::{Cli, CliError, cli_link_params};

/// A runner over whichever plugin the user selected.
pub(crate) type Session = Runner<Box<dyn Transport>>;

/// Create the transport for the configured interface and connect.
pub(crate) fn connect(cli: &Cli, config: &Config, upgrade: UpgradeConfig) -> Result<Session> {
    let params = cli_link_params(cli, config);
    let transport = canflash::transport::create_transport(&params.interface)?;
    let mut session = Runner::new(transport, upgrade).context("Invalid upgrade settings")?;

    if !cli.quiet {
        eprintln!("{} Connecting to {}", style("🔌").cyan(), style(&params).cyan());
    }
    let connected = session.execute(Request::Connect(params.clone()), |event| {
        debug!("{event:?}");
    });
    finish(connected).with_context(|| format!("Could not open {}", describe(&params)))?;
    if !cli.quiet {
        eprintln!("{} Connected", style("✓").green());
    }
    Ok(session)
}

/// Close the link, ignoring the outcome.
pub(crate) fn disconnect(session: &mut Session) {
    let event = session.execute(Request::Disconnect, |_| {});
    debug!("Link closed: {event:?}");
}

/// Turn a terminal event into a result, classifying failures for the exit code.
pub(crate) fn finish(event: Event) -> Result<Event> {
    let Some(record) = event.error() else {
        return Ok(event);
    };
    let message = record.to_string();
    let err: anyhow::Error = match record.kind {
        ErrorKind::Cancelled => CliError::Cancelled(message).into(),
        ErrorKind::DeviceCreateFailure
        | ErrorKind::ConnectFailure
        | ErrorKind::NotConnected
        | ErrorKind::CanError { .. } => CliError::Device(message).into(),
        _ => anyhow::anyhow!(message),
    };
    Err(err)
}

fn describe(params: &LinkParams) -> String {
    format!("{}:{}", params.interface, params.channel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use canflash::{ErrorRecord, Operation};

    fn failed(kind: ErrorKind) -> Event {
        Event::Failed(ErrorRecord::new(Operation::Flash, kind))
    }

    #[test]
    fn test_finish_passes_success_through() {
        assert_eq!(finish(Event::RebootSent).unwrap(), Event::RebootSent);
    }

    #[test]
    fn test_finish_classifies_failures() {
        let err = finish(failed(ErrorKind::Cancelled)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::Cancelled(_))
        ));

        let err = finish(failed(ErrorKind::ConnectFailure)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::Device(_))
        ));

        let err = finish(failed(ErrorKind::FlashEraseTimeout)).unwrap_err();
        assert!(err.downcast_ref::<CliError>().is_none());
        assert_eq!(err.to_string(), "flash failed: flash erase: timeout");
    }

    #[test]
    fn test_finish_rejects_busy() {
        let event = Event::Rejected(ErrorRecord::new(Operation::GetVersion, ErrorKind::Busy));
        assert!(finish(event).is_err());
    }
}
