//! # Line Framing
//!
//! Messages travel over TCP as UTF-8 JSON objects, each followed by a single
//! line feed:
//! ```text
//! {"type":"introduce","username":"alice"}\n{"type":"chat",...}\n
//! ```
//!
//! There is no length prefix, so reads are accumulated in a [`FrameBuffer`]
//! and split on the delimiter. A frame that grows past the configured
//! maximum without a delimiter is rejected instead of buffering forever.

use tokio::io::{AsyncRead, AsyncReadExt};

use super::messages::{encode, EncodeError, Message};

/// Frame delimiter.
pub const DELIMITER: u8 = b'\n';

/// Size of each socket read.
const READ_CHUNK: usize = 4096;

/// Encode a message and append the delimiter, ready for `write_all`.
pub fn encode_frame(message: &Message) -> Result<Vec<u8>, EncodeError> {
    let mut frame = encode(message)?;
    frame.push(DELIMITER);
    Ok(frame)
}

/// A single frame exceeded the size limit.
#[derive(Debug, thiserror::Error)]
#[error("frame exceeds {limit} bytes without a delimiter")]
pub struct FrameTooLarge {
    pub limit: usize,
}

/// Accumulates raw bytes and splits them into delimiter-terminated frames.
#[derive(Debug)]
pub struct FrameBuffer {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already known to hold no delimiter
    scanned: usize,
    max_frame_bytes: usize,
}

impl FrameBuffer {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_frame_bytes,
        }
    }

    /// Append freshly read bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Remove and return the next complete frame body, delimiter stripped.
    ///
    /// Returns `Ok(None)` when no complete frame is buffered yet. A trailing
    /// `\r` before the delimiter is dropped as well. Each byte is searched
    /// once, however many reads a frame is spread over.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameTooLarge> {
        let found = self.buffer[self.scanned..]
            .iter()
            .position(|&b| b == DELIMITER)
            .map(|offset| self.scanned + offset);

        match found {
            Some(end) => {
                if end > self.max_frame_bytes {
                    return Err(FrameTooLarge {
                        limit: self.max_frame_bytes,
                    });
                }
                let mut frame: Vec<u8> = self.buffer.drain(..=end).collect();
                self.scanned = 0;
                frame.pop();
                if frame.last() == Some(&b'\r') {
                    frame.pop();
                }
                Ok(Some(frame))
            }
            None => {
                self.scanned = self.buffer.len();
                if self.buffer.len() > self.max_frame_bytes {
                    return Err(FrameTooLarge {
                        limit: self.max_frame_bytes,
                    });
                }
                Ok(None)
            }
        }
    }

    /// Bytes buffered but not yet returned as a frame.
    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Outcome of one [`fill`] call.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadStatus {
    /// New bytes were appended to the buffer
    Data(usize),
    /// The remote end closed the stream
    Closed,
}

/// Perform one read from `reader` into `frames`.
pub async fn fill<R>(reader: &mut R, frames: &mut FrameBuffer) -> std::io::Result<ReadStatus>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];
    let n = reader.read(&mut chunk).await?;
    if n == 0 {
        return Ok(ReadStatus::Closed);
    }
    frames.extend(&chunk[..n]);
    Ok(ReadStatus::Data(n))
}

/// Read until one complete frame is available and return it.
///
/// Returns `Ok(None)` if the stream closes first. Bytes that arrive after
/// the frame stay in `frames` for the caller's read loop.
pub async fn read_frame<R>(
    reader: &mut R,
    frames: &mut FrameBuffer,
) -> anyhow::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(frame) = frames.next_frame()? {
            return Ok(Some(frame));
        }
        if fill(reader, frames).await? == ReadStatus::Closed {
            return Ok(None);
        }
    }
}
