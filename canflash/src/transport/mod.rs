//! CAN transport abstraction.
//!
//! The upgrade engine never touches a CAN driver directly. It talks to a
//! [`Transport`], which opens the link, transmits frames and pushes received
//! frames and link errors back into the control loop through an
//! [`InputSender`].
//!
//! ```text
//! +------------------+
//! |  Upgrade engine  |
//! +--------+---------+
//!          | send(frame)            ^ Input::FrameReceived / LinkError
//!          v                        |
//! +--------+---------+     +--------+---------+
//! | Transport trait  | --> |  InputSender     |
//! +--------+---------+     +------------------+
//!          |
//!    +-----+---------------+
//!    v                     v
//! SocketCAN (Linux)   Virtual board
//! ```
//!
//! Plugins are addressed by name, the way the CLI exposes them:
//! `socketcan` and `virtual`.

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;
pub mod sim;

use {
    crate::{
        error::{Error, Result},
        event::InputSender,
        protocol::CanFrame,
    },
    std::fmt,
};

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub use self::socketcan::SocketCanTransport;
pub use sim::{BoardFaults, VirtualBoard};

/// Plugin name of the Linux SocketCAN adapter.
pub const PLUGIN_SOCKETCAN: &str = "socketcan";

/// Plugin name of the in-process simulated bootloader.
pub const PLUGIN_VIRTUAL: &str = "virtual";

/// Default bitrate in kbit/s.
pub const DEFAULT_BITRATE_KBPS: u32 = 250;

/// Parameters used to open a CAN link.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LinkParams {
    /// Plugin (driver) name, e.g. `socketcan`.
    pub interface: String,
    /// Channel within the plugin, e.g. `can0`.
    pub channel: String,
    /// Nominal bitrate in kbit/s.
    pub bitrate_kbps: u32,
}

impl Default for LinkParams {
    fn default() -> Self {
        Self {
            interface: PLUGIN_SOCKETCAN.to_string(),
            channel: "can0".to_string(),
            bitrate_kbps: DEFAULT_BITRATE_KBPS,
        }
    }
}

impl LinkParams {
    /// Create link parameters.
    pub fn new(interface: impl Into<String>, channel: impl Into<String>, bitrate_kbps: u32) -> Self {
        Self {
            interface: interface.into(),
            channel: channel.into(),
            bitrate_kbps,
        }
    }

    /// Set the bitrate.
    #[must_use]
    pub fn with_bitrate(mut self, bitrate_kbps: u32) -> Self {
        self.bitrate_kbps = bitrate_kbps;
        self
    }
}

impl fmt::Display for LinkParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} @ {} kbit/s",
            self.interface, self.channel, self.bitrate_kbps
        )
    }
}

/// Outcome of [`Transport::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenStatus {
    /// The link is usable right away.
    Up,
    /// The link will report [`InputSender::link_up`] later.
    Pending,
}

/// A CAN link the engine can drive.
///
/// Implementations must not block in [`Transport::send`] waiting for a
/// reply; responses arrive asynchronously through the sink handed to
/// [`Transport::open`].
pub trait Transport: Send {
    /// Open the link and start delivering received frames to `sink`.
    ///
    /// Return [`Error::DeviceCreate`] when the device itself cannot be
    /// created and any other error when it exists but cannot be brought up.
    fn open(&mut self, params: &LinkParams, sink: InputSender) -> Result<OpenStatus>;

    /// Transmit one frame.
    fn send(&mut self, frame: &CanFrame) -> Result<()>;

    /// Close the link. Closing an already closed link is a no-op.
    fn close(&mut self);

    /// Plugin name.
    fn name(&self) -> &str;
}

impl Transport for Box<dyn Transport> {
    fn open(&mut self, params: &LinkParams, sink: InputSender) -> Result<OpenStatus> {
        (**self).open(params, sink)
    }

    fn send(&mut self, frame: &CanFrame) -> Result<()> {
        (**self).send(frame)
    }

    fn close(&mut self) {
        (**self).close();
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Trait for listing channels of a plugin.
///
/// Separate from [`Transport`] because it does not need an open link.
pub trait ChannelEnumerator {
    /// List the channels this plugin can open.
    fn list_channels() -> Result<Vec<String>>;
}

/// Names of the plugins compiled into this build.
pub fn list_plugins() -> Vec<&'static str> {
    let mut plugins = Vec::new();
    #[cfg(all(target_os = "linux", feature = "socketcan"))]
    plugins.push(PLUGIN_SOCKETCAN);
    plugins.push(PLUGIN_VIRTUAL);
    plugins
}

/// Channels available for `plugin`.
///
/// # Errors
///
/// Returns [`Error::Unsupported`] for plugins not compiled into this build.
pub fn list_channels(plugin: &str) -> Result<Vec<String>> {
    match plugin {
        #[cfg(all(target_os = "linux", feature = "socketcan"))]
        PLUGIN_SOCKETCAN => SocketCanTransport::list_channels(),
        PLUGIN_VIRTUAL => VirtualBoard::list_channels(),
        other => Err(unsupported_plugin(other)),
    }
}

/// Create a transport for `plugin`.
///
/// # Errors
///
/// Returns [`Error::Unsupported`] for plugins not compiled into this build.
pub fn create_transport(plugin: &str) -> Result<Box<dyn Transport>> {
    match plugin {
        #[cfg(all(target_os = "linux", feature = "socketcan"))]
        PLUGIN_SOCKETCAN => Ok(Box::new(SocketCanTransport::new())),
        PLUGIN_VIRTUAL => Ok(Box::new(VirtualBoard::new())),
        other => Err(unsupported_plugin(other)),
    }
}

fn unsupported_plugin(name: &str) -> Error {
    Error::Unsupported(format!(
        "CAN plugin '{name}' (available: {})",
        list_plugins().join(", ")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_params_default() {
        let params = LinkParams::default();
        assert_eq!(params.interface, "socketcan");
        assert_eq!(params.channel, "can0");
        assert_eq!(params.bitrate_kbps, 250);
    }

    #[test]
    fn test_link_params_display() {
        let params = LinkParams::new("virtual", "vcan0", 500);
        assert_eq!(params.to_string(), "virtual:vcan0 @ 500 kbit/s");
    }

    #[test]
    fn test_virtual_plugin_always_available() {
        assert!(list_plugins().contains(&PLUGIN_VIRTUAL));
        assert!(!list_channels(PLUGIN_VIRTUAL).unwrap().is_empty());
        assert_eq!(create_transport(PLUGIN_VIRTUAL).unwrap().name(), "virtual");
    }

    #[test]
    fn test_unknown_plugin_rejected() {
        let err = create_transport("peakcan").err().unwrap();
        assert!(matches!(err, Error::Unsupported(_)));
        assert!(err.to_string().contains("peakcan"));
        assert!(list_channels("peakcan").is_err());
    }
}
