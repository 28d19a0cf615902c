//! Zlib decompression for gateway payloads.
//!
//! With transport compression the gateway sends every message through one
//! shared zlib context; a message is complete when the accumulated bytes end
//! with the SYNC_FLUSH suffix (`0x00 0x00 0xFF 0xFF`). Frames that do not
//! decode to UTF-8 text are dropped by the caller.

use flate2::{Decompress, FlushDecompress, Status};
use std::io;

/// Trailing bytes marking the end of a complete zlib-stream message.
const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// Shared-context zlib-stream decompressor.
///
/// The context carries the dictionary across messages, so it must live for
/// the whole connection and be reset when a new connection opens.
pub struct Inflater {
    /// Compressed bytes accumulated from frames.
    buffer: Vec<u8>,
    /// Reusable output buffer.
    output: Vec<u8>,
    /// The zlib stream state.
    decompress: Decompress,
}

impl Inflater {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(8 * 1024),
            output: Vec::with_capacity(32 * 1024),
            decompress: Decompress::new(true),
        }
    }

    /// Feed a frame. Returns the decoded message once the SYNC_FLUSH suffix
    /// arrives, `None` while the message is still partial.
    pub fn extend(&mut self, data: &[u8]) -> io::Result<Option<String>> {
        self.buffer.extend_from_slice(data);

        if self.buffer.len() < 4 || self.buffer[self.buffer.len() - 4..] != ZLIB_SUFFIX {
            return Ok(None);
        }

        self.inflate()?;
        self.buffer.clear();

        let text = std::str::from_utf8(&self.output)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
            .to_string();
        Ok(Some(text))
    }

    /// Drop buffered data and restart the stream context.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.output.clear();
        self.decompress.reset(true);
    }

    fn inflate(&mut self) -> io::Result<()> {
        self.output.clear();
        let mut offset = 0usize;

        loop {
            self.output.reserve(16 * 1024);

            let before_in = self.decompress.total_in();
            let status = self
                .decompress
                .decompress_vec(&self.buffer[offset..], &mut self.output, FlushDecompress::Sync)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            offset += (self.decompress.total_in() - before_in) as usize;

            match status {
                Status::Ok if offset >= self.buffer.len() => break,
                // Needs more output space or has more input; loop.
                Status::Ok | Status::BufError => continue,
                Status::StreamEnd => break,
            }
        }

        Ok(())
    }
}

impl Default for Inflater {
    fn default() -> Self {
        Self::new()
    }
}

/// Decompress a standalone zlib-compressed payload.
pub(crate) fn inflate_message(data: &[u8]) -> io::Result<String> {
    let mut decompress = Decompress::new(true);
    let mut out = Vec::with_capacity(data.len().saturating_mul(4).max(1024));

    loop {
        out.reserve(16 * 1024);
        let before_in = decompress.total_in();
        let status = decompress
            .decompress_vec(&data[decompress.total_in() as usize..], &mut out, FlushDecompress::Finish)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        match status {
            Status::StreamEnd => break,
            Status::Ok | Status::BufError => {
                if decompress.total_in() == before_in && status == Status::BufError {
                    continue;
                }
                if decompress.total_in() as usize >= data.len() {
                    break;
                }
            }
        }
    }

    String::from_utf8(out).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
