//! Firmware images and per-flash upload bookkeeping.

use {
    crate::error::Result,
    std::{fmt, path::Path, sync::Arc},
};

/// An immutable firmware image, cheap to clone.
#[derive(Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    bytes: Arc<[u8]>,
}

impl FirmwareImage {
    /// Wrap image bytes.
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// Read an image from disk.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(Self::new(bytes))
    }

    /// Image bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the image is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl From<Vec<u8>> for FirmwareImage {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<&[u8]> for FirmwareImage {
    fn from(bytes: &[u8]) -> Self {
        Self::new(bytes)
    }
}

impl fmt::Debug for FirmwareImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FirmwareImage")
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Flash session phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Phase {
    /// No flash in progress.
    #[default]
    Idle,
    /// Waiting for the erase acknowledgement.
    Erasing,
    /// Sending chunks.
    Uploading,
    /// Waiting for the confirm acknowledgement.
    Confirming,
    /// Last flash succeeded.
    Completed,
    /// Last flash failed.
    Failed,
}

impl Phase {
    /// Whether a flash is in flight.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Erasing | Self::Uploading | Self::Confirming)
    }
}

/// State of one flash: the image, how far it got and what is outstanding.
#[derive(Debug)]
pub(crate) struct UploadSession {
    image: FirmwareImage,
    total: u32,
    offset: u32,
    chunk_size: u32,
    test_mode: bool,
    awaiting: Option<u32>,
    chunks_sent: u32,
}

impl UploadSession {
    pub(crate) fn new(image: FirmwareImage, total: u32, chunk_size: u32, test_mode: bool) -> Self {
        Self {
            image,
            total,
            offset: 0,
            chunk_size,
            test_mode,
            awaiting: None,
            chunks_sent: 0,
        }
    }

    pub(crate) fn total(&self) -> u32 {
        self.total
    }

    pub(crate) fn offset(&self) -> u32 {
        self.offset
    }

    pub(crate) fn test_mode(&self) -> bool {
        self.test_mode
    }

    pub(crate) fn chunks_sent(&self) -> u32 {
        self.chunks_sent
    }

    pub(crate) fn is_done(&self) -> bool {
        self.offset >= self.total
    }

    /// Next slice to send, starting at the confirmed offset.
    pub(crate) fn next_slice(&self) -> &[u8] {
        let start = self.offset as usize;
        let end = self
            .offset
            .saturating_add(self.chunk_size)
            .min(self.total) as usize;
        &self.image.as_bytes()[start..end]
    }

    /// Record that the chunk ending at `end_offset` went out.
    pub(crate) fn chunk_sent(&mut self, end_offset: u32) {
        self.awaiting = Some(end_offset);
        self.chunks_sent += 1;
    }

    /// Whether `value` acknowledges the outstanding chunk.
    pub(crate) fn is_awaited(&self, value: u32) -> bool {
        self.awaiting == Some(value)
    }

    /// Advance the confirmed offset.
    pub(crate) fn acknowledge(&mut self, end_offset: u32) {
        self.offset = end_offset;
        self.awaiting = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(len: usize, chunk: u32) -> UploadSession {
        let image = FirmwareImage::from((0..len).map(|i| i as u8).collect::<Vec<_>>());
        UploadSession::new(image, len as u32, chunk, false)
    }

    #[test]
    fn test_slices_follow_offset() {
        let mut s = session(100, 64);
        assert_eq!(s.next_slice().len(), 64);
        s.chunk_sent(64);
        assert!(s.is_awaited(64));
        s.acknowledge(64);
        assert_eq!(s.next_slice(), &(64..100).map(|i| i as u8).collect::<Vec<_>>()[..]);
        s.chunk_sent(100);
        s.acknowledge(100);
        assert!(s.is_done());
        assert_eq!(s.chunks_sent(), 2);
    }

    #[test]
    fn test_only_outstanding_end_is_awaited() {
        let mut s = session(256, 128);
        s.chunk_sent(128);
        assert!(!s.is_awaited(64));
        assert!(!s.is_awaited(256));
        assert!(s.is_awaited(128));
    }

    #[test]
    fn test_empty_session_is_done() {
        assert!(session(0, 64).is_done());
    }

    #[test]
    fn test_image_debug_hides_bytes() {
        let image = FirmwareImage::from(vec![0u8; 3]);
        assert_eq!(format!("{image:?}"), "FirmwareImage { len: 3 }");
        assert_eq!(image.len(), 3);
    }

    #[test]
    fn test_phase_activity() {
        assert!(Phase::Uploading.is_active());
        assert!(!Phase::Completed.is_active());
        assert!(!Phase::Idle.is_active());
    }
}
