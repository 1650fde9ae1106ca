//! The upgrade state machine.
//!
//! [`Engine`] owns the link state, the flash session and the single timer.
//! It is driven exclusively through [`Engine::handle`]: every command,
//! received frame, link notification and timer expiry is one [`Input`],
//! processed to completion before the next. Nothing in here blocks or
//! sleeps; outgoing frames go straight to the [`Transport`] and everything
//! observable is queued as an [`Event`] for [`Engine::drain_events`].
//!
//! ## Flash sequence
//!
//! ```text
//!  Idle --flash--> Erasing --ack(0,0)--> Uploading --ack(end == total)--> Confirming
//!                     |                    |    ^                            |
//!                     |                    +----+ ack(end < total)           +--(3, magic)--> Completed
//!                     +-- error/timeout ---+-- error/timeout ----------------+-- otherwise --> Failed
//! ```
//!
//! Only one operation is in flight at a time. A command arriving while
//! another is pending is answered with [`Event::Rejected`] and changes
//! nothing.

mod session;
mod timer;

use {
    crate::{
        error::{Error, ErrorKind, ErrorRecord, Operation, Result},
        event::{Event, Input, InputSender, Request},
        protocol::{
            BoardVersion, CanFrame, Response,
            codec::{self, BOARD_WRITE_WINDOW, CONFIRM_MAGIC, RESPONSE_ID, code},
        },
        transport::{LinkParams, OpenStatus, Transport},
    },
    log::{debug, info, trace, warn},
    std::{collections::VecDeque, time::Instant},
};

pub use {
    session::{FirmwareImage, Phase},
    timer::{ArmedTimer, TimeoutPolicy, TimerPurpose, TimerToken},
};

use {session::UploadSession, timer::TimerSlot};

/// Default number of image bytes per acknowledged chunk.
pub const DEFAULT_CHUNK_SIZE: usize = BOARD_WRITE_WINDOW;

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeConfig {
    /// Per-phase timeouts.
    pub timeouts: TimeoutPolicy,
    /// Bytes per acknowledged chunk; a non-zero multiple of the board's
    /// 64-byte write window.
    pub chunk_size: usize,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            timeouts: TimeoutPolicy::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl UpgradeConfig {
    /// Set the chunk size.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Set the timeouts.
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: TimeoutPolicy) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Check the configuration.
    ///
    /// The board acknowledges whole write windows only, so a chunk that is
    /// not window-aligned would never see its own acknowledgement.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size % BOARD_WRITE_WINDOW != 0 {
            return Err(Error::InvalidConfig(format!(
                "chunk size {} is not a non-zero multiple of {BOARD_WRITE_WINDOW}",
                self.chunk_size
            )));
        }
        if u32::try_from(self.chunk_size).is_err() {
            return Err(Error::InvalidConfig(format!(
                "chunk size {} does not fit 32 bits",
                self.chunk_size
            )));
        }
        Ok(())
    }
}

/// CAN link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum LinkState {
    /// No link.
    #[default]
    Disconnected,
    /// Opening.
    Connecting,
    /// Usable.
    Connected,
}

/// The operation currently in flight.
#[derive(Debug, Default)]
enum Pending {
    #[default]
    None,
    Connect(LinkParams),
    Flash(UploadSession),
    Version,
}

impl Pending {
    fn operation(&self) -> Option<Operation> {
        match self {
            Self::None => None,
            Self::Connect(_) => Some(Operation::Connect),
            Self::Flash(_) => Some(Operation::Flash),
            Self::Version => Some(Operation::GetVersion),
        }
    }
}

/// What a response did to the flash session.
enum Step {
    Ignore,
    NextChunk,
    Confirm,
    Complete { total: u32, test_mode: bool },
    Fail(ErrorKind),
}

/// Upgrade protocol engine.
pub struct Engine<T: Transport> {
    transport: T,
    sink: InputSender,
    config: UpgradeConfig,
    link: LinkState,
    params: Option<LinkParams>,
    phase: Phase,
    pending: Pending,
    timer: TimerSlot,
    outbox: VecDeque<Event>,
}

impl<T: Transport> Engine<T> {
    /// Create an engine.
    ///
    /// `sink` feeds the control loop queue; the engine hands it to the
    /// transport when the link is opened.
    pub fn new(transport: T, sink: InputSender, config: UpgradeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            transport,
            sink,
            config,
            link: LinkState::Disconnected,
            params: None,
            phase: Phase::Idle,
            pending: Pending::None,
            timer: TimerSlot::default(),
            outbox: VecDeque::new(),
        })
    }

    /// Process one input to completion.
    pub fn handle(&mut self, input: Input) {
        match input {
            Input::Request(request) => self.request(request),
            Input::FrameReceived(frame) => self.on_frame(&frame),
            Input::LinkUp => self.on_link_up(),
            Input::LinkError(detail) => self.on_link_error(detail),
            Input::TimerExpired(token) => self.on_timer(token),
        }
    }

    /// Open the CAN link.
    pub fn connect(&mut self, params: LinkParams) {
        self.handle(Input::Request(Request::Connect(params)));
    }

    /// Close the CAN link.
    pub fn disconnect(&mut self) {
        self.handle(Input::Request(Request::Disconnect));
    }

    /// Start flashing `image`.
    pub fn flash(&mut self, image: impl Into<FirmwareImage>, test_mode: bool) {
        self.handle(Input::Request(Request::Flash {
            image: image.into(),
            test_mode,
        }));
    }

    /// Query the bootloader version.
    pub fn get_version(&mut self) {
        self.handle(Input::Request(Request::GetVersion));
    }

    /// Reboot the board.
    pub fn reboot(&mut self) {
        self.handle(Input::Request(Request::Reboot));
    }

    /// Take all queued events, oldest first.
    pub fn drain_events(&mut self) -> impl Iterator<Item = Event> + '_ {
        self.outbox.drain(..)
    }

    /// Take the oldest queued event.
    pub fn poll_event(&mut self) -> Option<Event> {
        self.outbox.pop_front()
    }

    /// Link state.
    pub fn link(&self) -> LinkState {
        self.link
    }

    /// Parameters of the open link.
    pub fn params(&self) -> Option<&LinkParams> {
        self.params.as_ref()
    }

    /// Flash phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Confirmed upload progress as `(offset, total)`, while flashing.
    pub fn progress(&self) -> Option<(u32, u32)> {
        match &self.pending {
            Pending::Flash(session) => Some((session.offset(), session.total())),
            _ => None,
        }
    }

    /// Chunks transmitted in the current flash.
    pub fn chunks_sent(&self) -> Option<u32> {
        match &self.pending {
            Pending::Flash(session) => Some(session.chunks_sent()),
            _ => None,
        }
    }

    /// Operation in flight.
    pub fn pending_operation(&self) -> Option<Operation> {
        self.pending.operation()
    }

    /// Whether an operation is in flight.
    pub fn is_busy(&self) -> bool {
        self.pending
            .operation()
            .is_some()
    }

    /// The armed timer, if any.
    pub fn armed_timer(&self) -> Option<&ArmedTimer> {
        self.timer.armed()
    }

    /// When the armed timer fires.
    pub fn deadline(&self) -> Option<Instant> {
        self.timer
            .armed()
            .map(|t| t.deadline)
    }

    /// Engine configuration.
    pub fn config(&self) -> &UpgradeConfig {
        &self.config
    }

    /// Borrow the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutably borrow the transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    fn emit(&mut self, event: Event) {
        trace!("event: {event:?}");
        self.outbox.push_back(event);
    }

    fn arm(&mut self, purpose: TimerPurpose) {
        let timeout = self
            .config
            .timeouts
            .for_purpose(purpose);
        let timer = self.timer.arm(purpose, timeout);
        trace!("timer {} armed for {purpose:?} ({timeout:?})", timer.token);
    }

    fn reject(&mut self, operation: Operation, kind: ErrorKind) {
        debug!("{operation} rejected: {kind}");
        self.emit(Event::Rejected(ErrorRecord::new(operation, kind)));
    }

    /// End the pending operation with `kind`.
    fn fail(&mut self, operation: Operation, kind: ErrorKind) {
        warn!("{operation} failed: {kind}");
        self.timer.cancel();
        self.pending = Pending::None;
        if operation == Operation::Flash {
            self.phase = Phase::Failed;
        }
        if kind.is_link_level() {
            self.transport.close();
            self.link = LinkState::Disconnected;
            self.params = None;
        }
        self.emit(Event::Failed(ErrorRecord::new(operation, kind)));
    }

    /// Transmit `frame`, failing `operation` when the transport refuses.
    fn transmit(&mut self, operation: Operation, frame: &CanFrame) -> bool {
        match self.transport.send(frame) {
            Ok(()) => true,
            Err(e) => {
                warn!("send {frame} failed: {e}");
                self.fail(operation, ErrorKind::SendFailure);
                false
            },
        }
    }

    /// Rejection for a command that needs an idle, connected engine.
    fn precondition(&self) -> Option<ErrorKind> {
        if self.is_busy() {
            Some(ErrorKind::Busy)
        } else if self.link != LinkState::Connected {
            Some(ErrorKind::NotConnected)
        } else {
            None
        }
    }

    fn request(&mut self, request: Request) {
        let operation = request.operation();
        match request {
            Request::Connect(params) => self.start_connect(params),
            Request::Disconnect => self.start_disconnect(),
            Request::Flash { image, test_mode } => {
                if let Some(kind) = self.precondition() {
                    return self.reject(operation, kind);
                }
                self.start_flash(image, test_mode);
            },
            Request::GetVersion => {
                if let Some(kind) = self.precondition() {
                    return self.reject(operation, kind);
                }
                if self.transmit(operation, &codec::encode_version_request()) {
                    self.pending = Pending::Version;
                    self.arm(TimerPurpose::Version);
                }
            },
            Request::Reboot => {
                if let Some(kind) = self.precondition() {
                    return self.reject(operation, kind);
                }
                if self.transmit(operation, &codec::encode_reboot_request()) {
                    info!("Reboot command sent");
                    self.emit(Event::RebootSent);
                }
            },
        }
    }

    fn start_connect(&mut self, params: LinkParams) {
        if self.is_busy() {
            return self.reject(Operation::Connect, ErrorKind::Busy);
        }
        if self.link == LinkState::Connected {
            debug!("Reconnecting, closing {}", self.transport.name());
            self.transport.close();
            self.link = LinkState::Disconnected;
            self.params = None;
            self.emit(Event::Disconnected);
        }

        info!("Connecting to {params}");
        self.phase = Phase::Idle;
        self.link = LinkState::Connecting;
        match self
            .transport
            .open(&params, self.sink.clone())
        {
            Ok(OpenStatus::Up) => self.link_established(params),
            Ok(OpenStatus::Pending) => {
                debug!("Waiting for {params} to come up");
                self.pending = Pending::Connect(params);
                self.arm(TimerPurpose::Connect);
            },
            Err(e) => {
                warn!("Cannot open {params}: {e}");
                let kind = match e {
                    Error::DeviceCreate(_) => ErrorKind::DeviceCreateFailure,
                    _ => ErrorKind::ConnectFailure,
                };
                self.fail(Operation::Connect, kind);
            },
        }
    }

    fn link_established(&mut self, params: LinkParams) {
        info!("Connected to {params}");
        self.link = LinkState::Connected;
        self.params = Some(params.clone());
        self.emit(Event::Connected { params });
    }

    fn start_disconnect(&mut self) {
        if let Some(operation) = self.pending.operation() {
            self.timer.cancel();
            if operation == Operation::Flash {
                self.phase = Phase::Idle;
            }
            self.pending = Pending::None;
            warn!("{operation} cancelled by disconnect");
            self.emit(Event::Failed(ErrorRecord::new(
                operation,
                ErrorKind::Cancelled,
            )));
        }
        if self.link != LinkState::Disconnected {
            info!("Disconnecting {}", self.transport.name());
            self.transport.close();
            self.link = LinkState::Disconnected;
            self.params = None;
        }
        self.emit(Event::Disconnected);
    }

    fn start_flash(&mut self, image: FirmwareImage, test_mode: bool) {
        let Ok(total) = u32::try_from(image.len()) else {
            return self.fail(
                Operation::Flash,
                ErrorKind::ImageTooLarge { size: image.len() },
            );
        };
        // validate() guarantees the chunk size fits.
        let chunk_size = u32::try_from(self.config.chunk_size).unwrap_or(u32::MAX);

        info!(
            "Flashing {total} bytes in {chunk_size}-byte chunks{}",
            if test_mode { " (test mode)" } else { "" }
        );
        self.phase = Phase::Erasing;
        self.pending = Pending::Flash(UploadSession::new(image, total, chunk_size, test_mode));
        self.emit(Event::EraseStarted { total, test_mode });

        if self.transmit(Operation::Flash, &codec::encode_erase_request(total)) {
            self.arm(TimerPurpose::Erase);
        }
    }

    /// Send the chunk at the session's confirmed offset.
    fn send_next_chunk(&mut self) {
        let Pending::Flash(session) = &self.pending else {
            return;
        };
        let chunk = match codec::encode_data_chunk(session.offset(), session.next_slice()) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("Cannot encode chunk: {e}");
                return self.fail(Operation::Flash, ErrorKind::SendFailure);
            },
        };

        trace!(
            "Sending chunk {}..{} ({} frames)",
            chunk.offset(),
            chunk.end_offset(),
            chunk.frames().len()
        );
        for frame in chunk.frames() {
            if !self.transmit(Operation::Flash, frame) {
                return;
            }
        }
        if let Pending::Flash(session) = &mut self.pending {
            session.chunk_sent(chunk.end_offset());
        }
        self.arm(TimerPurpose::Upload);
    }

    fn start_confirm(&mut self) {
        let Pending::Flash(session) = &self.pending else {
            return;
        };
        let test_mode = session.test_mode();
        debug!("Upload complete, confirming");
        self.phase = Phase::Confirming;
        self.emit(Event::ConfirmStarted { test_mode });
        if self.transmit(Operation::Flash, &codec::encode_confirm_request(test_mode)) {
            self.arm(TimerPurpose::Confirm);
        }
    }

    fn on_link_up(&mut self) {
        if !matches!(self.pending, Pending::Connect(_)) {
            trace!("Ignoring link-up outside a connect");
            return;
        }
        self.timer.cancel();
        if let Pending::Connect(params) = std::mem::take(&mut self.pending) {
            self.link_established(params);
        }
    }

    fn on_link_error(&mut self, detail: String) {
        if self.link == LinkState::Disconnected && !self.is_busy() {
            debug!("Ignoring CAN error on closed link: {detail}");
            return;
        }
        let kind = ErrorKind::CanError { detail };
        let was_connected = self.link == LinkState::Connected;
        match self.pending.operation() {
            Some(operation) => self.fail(operation, kind.clone()),
            None => {
                warn!("CAN link error: {kind}");
                self.transport.close();
                self.link = LinkState::Disconnected;
                self.params = None;
            },
        }
        if was_connected {
            self.emit(Event::ConnectionLost { error: kind });
        }
    }

    fn on_timer(&mut self, token: TimerToken) {
        let Some(timer) = self.timer.fire(token) else {
            trace!("Stale timer {token}");
            return;
        };
        debug!("Timer {token} expired ({:?})", timer.purpose);
        let (operation, kind) = match timer.purpose {
            TimerPurpose::Connect => (Operation::Connect, ErrorKind::ConnectFailure),
            TimerPurpose::Erase => (Operation::Flash, ErrorKind::FlashEraseTimeout),
            TimerPurpose::Upload => (Operation::Flash, ErrorKind::FirmwareUploadTimeout),
            TimerPurpose::Confirm => (Operation::Flash, ErrorKind::ConfirmTimeout),
            TimerPurpose::Version => (Operation::GetVersion, ErrorKind::ReceiveTimeout),
        };
        self.fail(operation, kind);
    }

    fn on_frame(&mut self, frame: &CanFrame) {
        if frame.id() != RESPONSE_ID {
            trace!("Ignoring frame {frame}");
            return;
        }
        let response = match codec::decode_response(frame) {
            Ok(response) => response,
            Err(e) => {
                match self.pending.operation() {
                    Some(operation @ (Operation::Flash | Operation::GetVersion)) => {
                        warn!("Bad response {frame}: {e}");
                        self.fail(operation, ErrorKind::MalformedFrame);
                    },
                    _ => debug!("Ignoring bad response {frame}: {e}"),
                }
                return;
            },
        };
        trace!("Response code {} value {:#010X}", response.code, response.value);

        match self.pending.operation() {
            Some(Operation::GetVersion) => self.on_version_response(response),
            Some(Operation::Flash) => {
                let step = self.flash_step(response);
                self.apply(step);
            },
            _ => trace!("Unsolicited response {frame}"),
        }
    }

    fn on_version_response(&mut self, response: Response) {
        if response.code != code::VERSION {
            trace!("Ignoring response code {} while querying version", response.code);
            return;
        }
        self.timer.cancel();
        self.pending = Pending::None;
        let version = BoardVersion::from(response.value);
        info!("Bootloader version {version}");
        self.emit(Event::VersionReceived { version });
    }

    /// Decide what `response` means for the current flash phase.
    fn flash_step(&mut self, response: Response) -> Step {
        let Pending::Flash(session) = &mut self.pending else {
            return Step::Ignore;
        };
        let Response { code, value } = response;

        // Codes are opaque; anything not listed for a phase fails it.
        match self.phase {
            Phase::Erasing => {
                if code == code::OFFSET && value == 0 {
                    debug!("Erase acknowledged");
                    self.phase = Phase::Uploading;
                    let total = session.total();
                    self.outbox.push_back(Event::UploadStarted { total });
                    if session.is_done() {
                        Step::Confirm
                    } else {
                        Step::NextChunk
                    }
                } else if response.is_upload_ack() || code == code::VERSION {
                    Step::Ignore
                } else {
                    // Nothing has been written yet.
                    Step::Fail(ErrorKind::FlashEraseError { code, offset: 0 })
                }
            },
            Phase::Uploading => {
                if response.is_upload_ack() {
                    if !session.is_awaited(value) {
                        // Intermediate window of a larger chunk, or a duplicate.
                        return Step::Ignore;
                    }
                    session.acknowledge(value);
                    self.outbox.push_back(Event::UploadProgress {
                        offset: value,
                        total: session.total(),
                    });
                    if session.is_done() {
                        Step::Confirm
                    } else {
                        Step::NextChunk
                    }
                } else if code == code::VERSION {
                    Step::Ignore
                } else {
                    Step::Fail(ErrorKind::FirmwareUploadError {
                        code,
                        offset: value,
                    })
                }
            },
            Phase::Confirming => {
                if code == code::CONFIRM && value == CONFIRM_MAGIC {
                    Step::Complete {
                        total: session.total(),
                        test_mode: session.test_mode(),
                    }
                } else if code == code::TRANSFER_ERROR {
                    Step::Fail(ErrorKind::DownloadFailed)
                } else if response.is_upload_ack() || code == code::VERSION {
                    Step::Ignore
                } else {
                    Step::Fail(ErrorKind::ConfirmRejected { code, value })
                }
            },
            Phase::Idle | Phase::Completed | Phase::Failed => Step::Ignore,
        }
    }

    fn apply(&mut self, step: Step) {
        match step {
            Step::Ignore => {},
            Step::NextChunk => {
                self.timer.cancel();
                self.send_next_chunk();
            },
            Step::Confirm => {
                self.timer.cancel();
                self.start_confirm();
            },
            Step::Complete { total, test_mode } => {
                self.timer.cancel();
                self.pending = Pending::None;
                self.phase = Phase::Completed;
                info!("Upgrade of {total} bytes completed");
                self.emit(Event::UpgradeCompleted { total, test_mode });
            },
            Step::Fail(kind) => self.fail(Operation::Flash, kind),
        }
    }
}
