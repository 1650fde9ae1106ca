//! Linux SocketCAN transport.
//!
//! Two raw sockets are opened on the channel: one stays with the transport
//! for transmitting, the other is moved into a reader thread that forwards
//! board responses into the control loop queue. Bitrate is a property of
//! the network interface (`ip link set can0 type can bitrate 250000`) and
//! is not changed from here.

use {
    crate::{
        error::{Error, Result},
        event::InputSender,
        protocol::{CanFrame, codec::RESPONSE_ID},
        transport::{ChannelEnumerator, LinkParams, OpenStatus, PLUGIN_SOCKETCAN, Transport},
    },
    log::{debug, info, trace, warn},
    socketcan::{CanSocket, EmbeddedFrame, Frame, Id, Socket, SocketOptions, StandardId},
    std::{
        fs,
        io,
        path::Path,
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        thread::{self, JoinHandle},
        time::Duration,
    },
};

/// `ARPHRD_CAN` as reported in `/sys/class/net/<if>/type`.
const ARPHRD_CAN: &str = "280";

/// Channels offered when sysfs lists none.
const FALLBACK_CHANNELS: &[&str] = &["can0", "can1", "can2", "can3", "vcan0", "vcan1"];

/// Reader back-off while the socket has nothing to deliver.
const READ_IDLE: Duration = Duration::from_millis(1);

/// SocketCAN transport.
pub struct SocketCanTransport {
    socket: Option<CanSocket>,
    reader: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    channel: String,
}

impl Default for SocketCanTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketCanTransport {
    /// Create a closed transport.
    pub fn new() -> Self {
        Self {
            socket: None,
            reader: None,
            stop: Arc::new(AtomicBool::new(false)),
            channel: String::new(),
        }
    }

    fn spawn_reader(&mut self, socket: CanSocket, sink: InputSender) -> Result<()> {
        let stop = Arc::new(AtomicBool::new(false));
        self.stop = Arc::clone(&stop);
        let channel = self.channel.clone();

        let handle = thread::Builder::new()
            .name(format!("canflash-rx-{channel}"))
            .spawn(move || read_loop(&socket, &sink, &stop, &channel))?;
        self.reader = Some(handle);
        Ok(())
    }
}

/// Nonblocking socket for the reader thread, subscribed to error frames.
///
/// The kernel's default error mask is empty, so bus-off and controller
/// errors are only delivered after the filter is opened.
fn open_reader_socket(channel: &str) -> Result<CanSocket> {
    let connect_err = |e: io::Error| Error::Connect(format!("{channel}: {e}"));
    let rx = CanSocket::open(channel).map_err(connect_err)?;
    rx.set_nonblocking(true)
        .map_err(connect_err)?;
    rx.set_error_filter_accept_all()
        .map_err(connect_err)?;
    Ok(rx)
}

fn read_loop(socket: &CanSocket, sink: &InputSender, stop: &AtomicBool, channel: &str) {
    while !stop.load(Ordering::Relaxed) {
        match socket.read_frame() {
            Ok(frame) if frame.is_error_frame() => {
                warn!("{channel}: error frame 0x{:08X}", frame.raw_id());
                if !sink.link_error(format!("error frame 0x{:08X}", frame.raw_id())) {
                    break;
                }
            },
            Ok(frame) => {
                let Id::Standard(id) = frame.id() else {
                    continue;
                };
                // Our own data and command frames come back through loopback.
                if id.as_raw() != RESPONSE_ID || frame.is_remote_frame() {
                    continue;
                }
                match CanFrame::new(id.as_raw(), frame.data()) {
                    Ok(frame) => {
                        trace!("{channel} -> {frame}");
                        if !sink.frame_received(frame) {
                            break;
                        }
                    },
                    Err(e) => debug!("{channel}: dropping frame: {e}"),
                }
            },
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(READ_IDLE),
            Err(e) => {
                if !stop.load(Ordering::Relaxed) {
                    warn!("{channel}: read failed: {e}");
                    sink.link_error(e.to_string());
                }
                break;
            },
        }
    }
    trace!("{channel}: reader stopped");
}

impl Transport for SocketCanTransport {
    fn open(&mut self, params: &LinkParams, sink: InputSender) -> Result<OpenStatus> {
        self.close();
        self.channel = params
            .channel
            .clone();

        let tx = CanSocket::open(&params.channel)
            .map_err(|e| Error::DeviceCreate(format!("{}: {e}", params.channel)))?;
        let rx = open_reader_socket(&params.channel)?;

        info!(
            "Opened SocketCAN channel {} (bitrate {} kbit/s is set on the interface)",
            params.channel, params.bitrate_kbps
        );
        self.spawn_reader(rx, sink)?;
        self.socket = Some(tx);
        Ok(OpenStatus::Up)
    }

    fn send(&mut self, frame: &CanFrame) -> Result<()> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| Error::Send("SocketCAN channel is closed".into()))?;
        let id = StandardId::new(frame.id())
            .ok_or_else(|| Error::Send(format!("invalid identifier 0x{:X}", frame.id())))?;
        let raw = socketcan::CanFrame::new(id, frame.payload())
            .ok_or_else(|| Error::Send(format!("cannot build frame {frame}")))?;

        trace!("{} <- {frame}", self.channel);
        socket
            .write_frame(&raw)
            .map_err(|e| Error::Send(format!("{}: {e}", self.channel)))
    }

    fn close(&mut self) {
        self.stop
            .store(true, Ordering::Relaxed);
        if let Some(handle) = self.reader.take() {
            if handle.join().is_err() {
                warn!("{}: reader thread panicked", self.channel);
            }
        }
        if self.socket.take().is_some() {
            debug!("Closed SocketCAN channel {}", self.channel);
        }
    }

    fn name(&self) -> &str {
        PLUGIN_SOCKETCAN
    }
}

impl Drop for SocketCanTransport {
    fn drop(&mut self) {
        self.close();
    }
}

impl ChannelEnumerator for SocketCanTransport {
    fn list_channels() -> Result<Vec<String>> {
        let mut channels = scan_sysfs(Path::new("/sys/class/net"));
        if channels.is_empty() {
            debug!("No CAN interfaces in sysfs, offering defaults");
            channels = FALLBACK_CHANNELS
                .iter()
                .map(|c| (*c).to_string())
                .collect();
        }
        Ok(channels)
    }
}

/// CAN network interfaces under a sysfs `class/net` directory.
fn scan_sysfs(root: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(root) else {
        return Vec::new();
    };
    let mut channels: Vec<String> = entries
        .filter_map(std::result::Result::ok)
        .filter(|entry| {
            fs::read_to_string(entry.path().join("type"))
                .is_ok_and(|kind| kind.trim() == ARPHRD_CAN)
        })
        .filter_map(|entry| {
            entry
                .file_name()
                .into_string()
                .ok()
        })
        .collect();
    channels.sort();
    channels
}
