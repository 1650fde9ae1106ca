//! Engine inputs and outputs.
//!
//! Everything that can change the engine's state arrives as an [`Input`]
//! through one queue, and everything the engine has to say leaves as an
//! [`Event`]. Transport adapters get an [`InputSender`] and push from
//! whatever thread their driver runs on; the control loop drains the queue
//! on a single thread.

use {
    crate::{
        engine::{FirmwareImage, TimerToken},
        error::{ErrorKind, ErrorRecord, Operation},
        protocol::{BoardVersion, CanFrame},
        transport::LinkParams,
    },
    std::sync::mpsc,
};

/// Commands accepted by the engine.
#[derive(Debug, Clone)]
pub enum Request {
    /// Open the CAN link.
    Connect(LinkParams),
    /// Close the CAN link, cancelling whatever is in flight.
    Disconnect,
    /// Erase, upload and confirm an image.
    Flash {
        /// Image to write.
        image: FirmwareImage,
        /// Ask the board to keep the image only until the next reboot.
        test_mode: bool,
    },
    /// Query the bootloader version.
    GetVersion,
    /// Reboot the board.
    Reboot,
}

impl Request {
    /// Operation this request starts.
    pub fn operation(&self) -> Operation {
        match self {
            Self::Connect(_) => Operation::Connect,
            Self::Disconnect => Operation::Disconnect,
            Self::Flash { .. } => Operation::Flash,
            Self::GetVersion => Operation::GetVersion,
            Self::Reboot => Operation::Reboot,
        }
    }
}

/// Tagged inputs processed by the engine, one at a time.
#[derive(Debug, Clone)]
pub enum Input {
    /// A command from the caller.
    Request(Request),
    /// A frame received by the transport.
    FrameReceived(CanFrame),
    /// The transport finished bringing the link up.
    LinkUp,
    /// The transport reported a link-level error.
    LinkError(String),
    /// A timer armed by the engine expired.
    TimerExpired(TimerToken),
}

/// Cloneable handle for pushing inputs into the control loop queue.
#[derive(Debug, Clone)]
pub struct InputSender {
    tx: mpsc::Sender<Input>,
}

impl InputSender {
    /// Wrap the sending half of the control loop queue.
    pub fn new(tx: mpsc::Sender<Input>) -> Self {
        Self { tx }
    }

    /// Create a connected sender/receiver pair.
    pub fn channel() -> (Self, mpsc::Receiver<Input>) {
        let (tx, rx) = mpsc::channel();
        (Self::new(tx), rx)
    }

    /// Deliver a received frame. Returns `false` once the loop is gone.
    pub fn frame_received(&self, frame: CanFrame) -> bool {
        self.push(Input::FrameReceived(frame))
    }

    /// Report that a pending link came up.
    pub fn link_up(&self) -> bool {
        self.push(Input::LinkUp)
    }

    /// Report a link-level error.
    pub fn link_error(&self, detail: impl Into<String>) -> bool {
        self.push(Input::LinkError(detail.into()))
    }

    /// Queue a command.
    pub fn submit(&self, request: Request) -> bool {
        self.push(Input::Request(request))
    }

    /// Queue an arbitrary input.
    pub fn push(&self, input: Input) -> bool {
        self.tx.send(input).is_ok()
    }
}

/// Notifications emitted by the engine, one per transition.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(tag = "event", rename_all = "snake_case"))]
pub enum Event {
    /// The link is up.
    Connected {
        /// Parameters the link was opened with.
        params: LinkParams,
    },
    /// The link was closed on request.
    Disconnected,
    /// The link went down on its own.
    ConnectionLost {
        /// Reason reported by the transport.
        error: ErrorKind,
    },
    /// Erase request sent.
    EraseStarted {
        /// Image size in bytes.
        total: u32,
        /// Test mode requested.
        test_mode: bool,
    },
    /// Erase acknowledged, data transfer begins.
    UploadStarted {
        /// Image size in bytes.
        total: u32,
    },
    /// A chunk was acknowledged.
    UploadProgress {
        /// Bytes confirmed written.
        offset: u32,
        /// Image size in bytes.
        total: u32,
    },
    /// Confirm request sent.
    ConfirmStarted {
        /// Test mode requested.
        test_mode: bool,
    },
    /// The board accepted the image.
    UpgradeCompleted {
        /// Image size in bytes.
        total: u32,
        /// Image is temporary.
        test_mode: bool,
    },
    /// Bootloader version received.
    VersionReceived {
        /// Reported version.
        version: BoardVersion,
    },
    /// Reboot command transmitted.
    RebootSent,
    /// An operation ended with an error.
    Failed(ErrorRecord),
    /// A command was refused without side effects.
    Rejected(ErrorRecord),
}

impl Event {
    /// Operation this event terminates, if it is a terminal event.
    pub fn terminal_operation(&self) -> Option<Operation> {
        match self {
            Self::Connected { .. } => Some(Operation::Connect),
            Self::Disconnected => Some(Operation::Disconnect),
            Self::UpgradeCompleted { .. } => Some(Operation::Flash),
            Self::VersionReceived { .. } => Some(Operation::GetVersion),
            Self::RebootSent => Some(Operation::Reboot),
            Self::Failed(record) | Self::Rejected(record) => Some(record.operation),
            _ => None,
        }
    }

    /// Failure carried by this event, if any.
    pub fn error(&self) -> Option<&ErrorRecord> {
        match self {
            Self::Failed(record) | Self::Rejected(record) => Some(record),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_is_not_terminal() {
        let event = Event::UploadProgress {
            offset: 64,
            total: 128,
        };
        assert_eq!(event.terminal_operation(), None);
        assert!(event.error().is_none());
    }

    #[test]
    fn test_failure_terminates_its_operation() {
        let event = Event::Failed(ErrorRecord::new(
            Operation::Flash,
            ErrorKind::FirmwareUploadTimeout,
        ));
        assert_eq!(event.terminal_operation(), Some(Operation::Flash));
        assert_eq!(
            event.error().map(|r| r.kind.clone()),
            Some(ErrorKind::FirmwareUploadTimeout)
        );
    }

    #[test]
    fn test_sender_reports_closed_queue() {
        let (sender, rx) = InputSender::channel();
        assert!(sender.link_up());
        assert!(matches!(rx.try_recv(), Ok(Input::LinkUp)));
        drop(rx);
        assert!(!sender.link_error("bus off"));
    }

    #[test]
    fn test_request_operation() {
        assert_eq!(Request::GetVersion.operation(), Operation::GetVersion);
        assert_eq!(Request::Disconnect.operation(), Operation::Disconnect);
    }
}
