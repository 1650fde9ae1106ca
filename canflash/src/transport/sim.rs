//! In-process simulated bootloader.
//!
//! [`VirtualBoard`] behaves like the board side of the upgrade protocol:
//! it erases on request, buffers data frames into 64-byte write windows and
//! acknowledges each programmed window with the byte count received so far.
//! Responses are pushed into the control loop queue from inside
//! [`Transport::send`], so a flash against the virtual board runs entirely
//! on the caller's thread.
//!
//! The board is a cheap handle: clones share state, which lets a test keep
//! one clone for inspection while the engine owns the other.

use {
    crate::{
        error::{Error, Result},
        event::InputSender,
        protocol::{
            BoardVersion, CanFrame, Command,
            codec::{
                self, BOARD_WRITE_WINDOW, COMMAND_ID, CONFIRM_MAGIC, DATA_ID, code,
            },
        },
        transport::{ChannelEnumerator, LinkParams, OpenStatus, PLUGIN_VIRTUAL, Transport},
    },
    log::{debug, trace, warn},
    std::sync::{Arc, Mutex, MutexGuard, PoisonError},
};

/// Version the virtual board reports unless told otherwise.
pub const DEFAULT_VIRTUAL_VERSION: BoardVersion = BoardVersion {
    major: 1,
    minor: 2,
    patch: 3,
};

/// Misbehaviour to inject into a [`VirtualBoard`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoardFaults {
    /// Never answer anything.
    pub silent: bool,
    /// Answer erase requests with this code instead of an acknowledgement.
    pub erase_error: Option<u32>,
    /// Answer the write window containing `offset` with `code`.
    pub write_error: Option<(u32, u32)>,
    /// Stop answering once this many bytes were received.
    pub stall_at: Option<u32>,
    /// Answer confirm requests with this code instead of the magic.
    pub confirm_error: Option<u32>,
    /// Refuse to open the device.
    pub fail_open: bool,
    /// Bring the link up asynchronously.
    pub open_pending: bool,
    /// Refuse to transmit after this many frames.
    pub refuse_send_after: Option<usize>,
}

#[derive(Debug)]
struct BoardState {
    sink: Option<InputSender>,
    version: u32,
    faults: BoardFaults,
    expected: u32,
    image: Vec<u8>,
    window_fill: usize,
    accepting: bool,
    confirmed: Option<bool>,
    erase_count: u32,
    reboot_count: u32,
    frames_sent: usize,
}

/// Simulated bootloader implementing [`Transport`].
#[derive(Debug, Clone)]
pub struct VirtualBoard {
    state: Arc<Mutex<BoardState>>,
}

impl Default for VirtualBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualBoard {
    /// A well-behaved board.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BoardState {
                sink: None,
                version: u32::from(DEFAULT_VIRTUAL_VERSION),
                faults: BoardFaults::default(),
                expected: 0,
                image: Vec::new(),
                window_fill: 0,
                accepting: false,
                confirmed: None,
                erase_count: 0,
                reboot_count: 0,
                frames_sent: 0,
            })),
        }
    }

    /// Report `version` to version queries.
    #[must_use]
    pub fn with_version(self, version: BoardVersion) -> Self {
        self.lock().version = u32::from(version);
        self
    }

    /// Inject faults.
    #[must_use]
    pub fn with_faults(self, faults: BoardFaults) -> Self {
        self.lock().faults = faults;
        self
    }

    /// Bytes received since the last erase.
    pub fn image(&self) -> Vec<u8> {
        self.lock()
            .image
            .clone()
    }

    /// Test mode flag of the last accepted confirm, if any.
    pub fn confirmed(&self) -> Option<bool> {
        self.lock().confirmed
    }

    /// Number of erase requests seen.
    pub fn erase_count(&self) -> u32 {
        self.lock().erase_count
    }

    /// Number of reboot requests seen.
    pub fn reboot_count(&self) -> u32 {
        self.lock().reboot_count
    }

    /// Whether the link is open.
    pub fn is_open(&self) -> bool {
        self.lock()
            .sink
            .is_some()
    }

    fn lock(&self) -> MutexGuard<'_, BoardState> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl BoardState {
    fn respond(&self, code: u32, value: u32) {
        if self.faults.silent {
            trace!("virtual board muted, dropping response ({code}, {value})");
            return;
        }
        if let Some(sink) = &self.sink {
            sink.frame_received(codec::encode_response(code, value));
        }
    }

    fn received(&self) -> u32 {
        u32::try_from(self.image.len()).unwrap_or(u32::MAX)
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::StartUpdate { size } => {
                self.erase_count += 1;
                if let Some(code) = self.faults.erase_error {
                    debug!("virtual board: erase of {size} bytes fails with code {code}");
                    self.accepting = false;
                    self.respond(code, 0);
                    return;
                }
                debug!("virtual board: erased {size} bytes");
                self.expected = size;
                self.image.clear();
                self.window_fill = 0;
                self.accepting = true;
                self.confirmed = None;
                self.respond(code::OFFSET, 0);
            },
            Command::Confirm { test_mode } => {
                if let Some(code) = self.faults.confirm_error {
                    self.respond(code, 0);
                } else if self.received() != self.expected {
                    debug!(
                        "virtual board: confirm after {} of {} bytes",
                        self.received(),
                        self.expected
                    );
                    self.respond(code::TRANSFER_ERROR, self.received());
                } else {
                    self.confirmed = Some(test_mode);
                    self.respond(code::CONFIRM, CONFIRM_MAGIC);
                }
            },
            Command::Version => self.respond(code::VERSION, self.version),
            Command::Reboot => {
                debug!("virtual board: reboot");
                self.reboot_count += 1;
            },
        }
    }

    fn on_data(&mut self, bytes: &[u8]) {
        if !self.accepting {
            trace!("virtual board: data outside an upload ignored");
            return;
        }
        for &byte in bytes {
            if self.received() >= self.expected {
                warn!("virtual board: {} bytes beyond image end", bytes.len());
                return;
            }
            self.image.push(byte);
            self.window_fill += 1;

            let received = self.received();
            if self.window_fill < BOARD_WRITE_WINDOW && received < self.expected {
                continue;
            }
            let window_start = received - u32::try_from(self.window_fill).unwrap_or(0);
            self.window_fill = 0;

            if self.faults.stall_at.is_some_and(|at| received >= at) {
                trace!("virtual board: stalled at {received}");
                continue;
            }
            if let Some((offset, code)) = self.faults.write_error {
                if (window_start..received).contains(&offset) {
                    debug!("virtual board: write of window at {window_start} fails");
                    self.accepting = false;
                    self.respond(code, offset);
                    return;
                }
            }
            if received == self.expected {
                self.respond(code::UPDATE_SUCCESS, received);
            } else {
                self.respond(code::OFFSET, received);
            }
        }
    }
}

impl Transport for VirtualBoard {
    fn open(&mut self, params: &LinkParams, sink: InputSender) -> Result<OpenStatus> {
        let mut state = self.lock();
        if state.faults.fail_open {
            return Err(Error::DeviceCreate(format!(
                "virtual channel {} unavailable",
                params.channel
            )));
        }
        debug!("virtual board attached on {params}");
        state.frames_sent = 0;
        if state.faults.open_pending {
            sink.link_up();
            state.sink = Some(sink);
            return Ok(OpenStatus::Pending);
        }
        state.sink = Some(sink);
        Ok(OpenStatus::Up)
    }

    fn send(&mut self, frame: &CanFrame) -> Result<()> {
        let mut state = self.lock();
        if state.sink.is_none() {
            return Err(Error::Send("virtual link is closed".into()));
        }
        if state
            .faults
            .refuse_send_after
            .is_some_and(|limit| state.frames_sent >= limit)
        {
            return Err(Error::Send("virtual bus refused the frame".into()));
        }
        state.frames_sent += 1;
        trace!("virtual board <- {frame}");

        match frame.id() {
            COMMAND_ID => match codec::decode_command(frame) {
                Ok(command) => state.on_command(command),
                Err(e) => warn!("virtual board: {e}"),
            },
            DATA_ID => state.on_data(frame.payload()),
            _ => {},
        }
        Ok(())
    }

    fn close(&mut self) {
        if self
            .lock()
            .sink
            .take()
            .is_some()
        {
            debug!("virtual board detached");
        }
    }

    fn name(&self) -> &str {
        PLUGIN_VIRTUAL
    }
}

impl ChannelEnumerator for VirtualBoard {
    fn list_channels() -> Result<Vec<String>> {
        Ok(vec!["vcan0".to_string(), "vcan1".to_string()])
    }
}
