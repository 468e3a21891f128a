//! Length-prefixed framing over a byte stream: each frame is a
//! 4-byte big-endian length followed by that many bytes of UTF-8 JSON.
//! Reads and writes tolerate short system calls; oversized frames are
//! fatal to the connection, never merely rejected, since a declared
//! length larger than the ceiling means the stream can no longer be
//! trusted to resynchronise on the next frame boundary.

use crate::error::{ExecutorError, Result};
use std::io::{Read, Write};

/// Default frame-size ceiling, overridable via
/// `EXECUTOR_MAX_FRAME_BYTES`.
pub const DEFAULT_MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

pub fn max_frame_bytes() -> u32 {
    std::env::var("EXECUTOR_MAX_FRAME_BYTES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_MAX_FRAME_BYTES)
}

/// Reads one length-prefixed frame, or `Ok(None)` on a clean EOF
/// between frames (the connection's normal close).
pub fn read_frame<R: Read>(reader: &mut R, ceiling: u32) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    if let Err(err) = reader.read_exact(&mut len_buf) {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(ExecutorError::Io(err));
    }
    let declared = u32::from_be_bytes(len_buf);
    if declared > ceiling {
        return Err(ExecutorError::FrameTooLarge {
            declared,
            ceiling,
        });
    }
    let mut body = vec![0u8; declared as usize];
    reader.read_exact(&mut body)?;
    Ok(Some(body))
}

/// Writes one length-prefixed frame.
pub fn write_frame<W: Write>(writer: &mut W, body: &[u8]) -> Result<()> {
    let len = u32::try_from(body.len())
        .map_err(|_| ExecutorError::FrameTooLarge {
            declared: u32::MAX,
            ceiling: u32::MAX,
        })?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(body)?;
    writer.flush()?;
    Ok(())
}
