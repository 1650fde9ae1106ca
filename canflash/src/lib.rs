//! # canflash
//!
//! A library for upgrading board firmware over a CAN bus.
//!
//! The board runs a small bootloader that listens on three standard CAN
//! identifiers. This crate provides:
//!
//! - the frame codec for commands, responses and raw data frames
//! - an event-driven upgrade engine (connect, erase, upload, confirm,
//!   version query, reboot) with per-phase timeouts
//! - a single-threaded control loop that turns deadlines into timer inputs
//! - transports: Linux SocketCAN and an in-process virtual board
//!
//! ## Features
//!
//! - `socketcan` (default): Linux SocketCAN transport
//! - `serde`: Serialization support for events and error records
//!
//! ## Example
//!
//! ```rust,no_run
//! use canflash::{Event, FirmwareImage, LinkParams, Request, Runner, UpgradeConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = canflash::transport::create_transport("socketcan")?;
//!     let mut runner = Runner::new(transport, UpgradeConfig::default())?;
//!
//!     runner.execute(Request::Connect(LinkParams::default()), |_| {});
//!
//!     let image = FirmwareImage::from_file("firmware.bin")?;
//!     let done = runner.execute(Request::Flash { image, test_mode: false }, |event| {
//!         if let Event::UploadProgress { offset, total } = event {
//!             println!("{offset}/{total}");
//!         }
//!     });
//!     if let Some(record) = done.error() {
//!         eprintln!("{record}");
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod engine;
pub mod error;
pub mod event;
pub mod protocol;
pub mod runner;
pub mod transport;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker polled by [`Runner::execute`].
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications). Only the first
/// registration takes effect.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

pub use {
    engine::{
        ArmedTimer, Engine, FirmwareImage, LinkState, Phase, TimeoutPolicy, TimerPurpose,
        TimerToken, UpgradeConfig,
    },
    error::{Error, ErrorKind, ErrorRecord, Operation, Result},
    event::{Event, Input, InputSender, Request},
    protocol::{BoardVersion, CanFrame},
    runner::Runner,
    transport::{LinkParams, OpenStatus, Transport, VirtualBoard},
};

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub use transport::SocketCanTransport;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_checker_unset_is_false() {
        // No unit test registers a checker; see tests/ for the CLI path.
        assert!(!is_interrupted_requested());
    }
}
