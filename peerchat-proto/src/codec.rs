//! Length-prefixed framing for the peer and file-transfer wire protocol.
//!
//! Wire format: `[u32 length (BE)][payload bytes]`
//!
//! Peer connections are plain byte streams, so message boundaries are
//! carried by the 4-byte prefix. Older peers wrote a bare payload and closed
//! the stream; [`read_frame_or_legacy`] accepts both.

use std::io::{self, Read, Write};

/// Largest payload a single frame may declare (100 MiB).
pub const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// Upper bound on an unframed legacy payload read until end of stream.
pub const MAX_LEGACY_LEN: usize = 64 * 1024;

/// Size of the length prefix in bytes.
const PREFIX_LEN: usize = 4;

/// Error type for frame read/write operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The stream ended before any byte of the next frame arrived.
    #[error("connection closed")]
    ConnectionClosed,
    /// The length prefix declares more than [`MAX_FRAME_LEN`] bytes.
    #[error("frame too large: {len} bytes (max {max})")]
    FrameTooLarge {
        /// Declared (or attempted) payload length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },
    /// The stream ended in the middle of a frame.
    #[error("truncated frame: expected {expected} bytes, got {got}")]
    Truncated {
        /// Bytes the frame should have contained.
        expected: usize,
        /// Bytes actually received before end of stream.
        got: usize,
    },
    /// An underlying I/O error occurred.
    #[error("frame I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Writes `payload` as one length-prefixed frame and flushes the writer.
///
/// # Errors
///
/// Returns [`CodecError::FrameTooLarge`] if the payload exceeds
/// [`MAX_FRAME_LEN`], or [`CodecError::Io`] if the write fails.
pub fn write_frame<W: Write + ?Sized>(writer: &mut W, payload: &[u8]) -> Result<(), CodecError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge {
            len: payload.len(),
            max: MAX_FRAME_LEN,
        });
    }
    // Bounded by MAX_FRAME_LEN above, fits in u32.
    #[allow(clippy::cast_possible_truncation)]
    let len = payload.len() as u32;

    let mut frame = Vec::with_capacity(PREFIX_LEN + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Reads exactly one length-prefixed frame.
///
/// # Errors
///
/// Returns [`CodecError::ConnectionClosed`] if the stream is already at end,
/// [`CodecError::Truncated`] if it ends mid-frame,
/// [`CodecError::FrameTooLarge`] if the prefix exceeds [`MAX_FRAME_LEN`],
/// or [`CodecError::Io`] on any other read failure.
pub fn read_frame<R: Read + ?Sized>(reader: &mut R) -> Result<Vec<u8>, CodecError> {
    let mut prefix = [0u8; PREFIX_LEN];
    let got = read_up_to(reader, &mut prefix)?;
    if got == 0 {
        return Err(CodecError::ConnectionClosed);
    }
    if got < PREFIX_LEN {
        return Err(CodecError::Truncated {
            expected: PREFIX_LEN,
            got,
        });
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    read_payload(reader, len)
}

/// Reads one frame, falling back to the unframed legacy format.
///
/// A legacy peer writes its payload without a prefix and closes the stream.
/// That case is recognised when the stream ends before a full prefix, or
/// when the first four bytes decode to a length above [`MAX_FRAME_LEN`]
/// (ASCII text such as `PEER...` always does). The bytes already consumed
/// become the start of the payload and the rest of the stream is read to
/// end, capped at [`MAX_LEGACY_LEN`].
///
/// # Errors
///
/// Returns [`CodecError::ConnectionClosed`] for an empty stream,
/// [`CodecError::Truncated`] if a well-formed prefix is followed by too few
/// bytes, or [`CodecError::Io`] on read failure.
pub fn read_frame_or_legacy<R: Read + ?Sized>(reader: &mut R) -> Result<Vec<u8>, CodecError> {
    let mut prefix = [0u8; PREFIX_LEN];
    let got = read_up_to(reader, &mut prefix)?;
    if got == 0 {
        return Err(CodecError::ConnectionClosed);
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if got == PREFIX_LEN && len <= MAX_FRAME_LEN {
        return read_payload(reader, len);
    }

    let mut payload = prefix[..got].to_vec();
    if got == PREFIX_LEN {
        let limit = (MAX_LEGACY_LEN - PREFIX_LEN) as u64;
        reader.take(limit).read_to_end(&mut payload)?;
    }
    Ok(payload)
}

/// Reads a `len`-byte payload, mapping a short read to [`CodecError::Truncated`].
fn read_payload<R: Read + ?Sized>(reader: &mut R, len: usize) -> Result<Vec<u8>, CodecError> {
    let mut payload = vec![0u8; len];
    let got = read_up_to(reader, &mut payload)?;
    if got < len {
        return Err(CodecError::Truncated { expected: len, got });
    }
    Ok(payload)
}

/// Fills `buf` as far as the stream allows, returning the number of bytes read.
///
/// Unlike [`Read::read_exact`], a short count is returned rather than an
/// error so callers can distinguish a clean close from a truncated frame.
fn read_up_to<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<usize, io::Error> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
