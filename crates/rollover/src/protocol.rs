//! Byte-level wire protocol spoken over the per-owner upgrade socket.
//!
//! One session is a single exchange:
//!
//! ```text
//! successor -> predecessor   REQUEST
//! predecessor -> successor   pair count (u32, big-endian)
//! repeated per pair:         name length (u32, BE) | name bytes
//!                            FD_MARKER byte carrying one descriptor
//! predecessor -> successor   PAYLOAD_END
//! successor -> predecessor   READY            (once the caller is ready)
//! ```
//!
//! The name length is validated against [`MAX_NAME_LEN`] before any
//! allocation happens, so a corrupt or hostile peer cannot force an
//! oversized buffer.

use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

/// First byte sent by a successor to ask for the descriptor payload.
pub(crate) const REQUEST: u8 = 0x01;
/// Marker byte each transferred descriptor rides on.
pub(crate) const FD_MARKER: u8 = 0x02;
/// Sent by the predecessor after the final pair.
pub(crate) const PAYLOAD_END: u8 = 0x03;
/// Sent by the successor once it is serving traffic.
pub(crate) const READY: u8 = 0x04;

/// Longest descriptor name accepted on the wire.
pub(crate) const MAX_NAME_LEN: usize = 4096;

/// Write a length-prefixed descriptor name.
pub(crate) async fn write_name(stream: &mut UnixStream, name: &str) -> io::Result<()> {
    if name.len() > MAX_NAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("descriptor name is {} bytes, cap is {MAX_NAME_LEN}", name.len()),
        ));
    }
    #[allow(clippy::cast_possible_truncation)] // Validated above
    let len = name.len() as u32;
    stream.write_u32(len).await?;
    stream.write_all(name.as_bytes()).await?;
    Ok(())
}

/// Read a length-prefixed descriptor name, validating the length before
/// allocating.
pub(crate) async fn read_name(stream: &mut UnixStream) -> io::Result<String> {
    let len = stream.read_u32().await? as usize;
    if len > MAX_NAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("descriptor name length {len} exceeds cap {MAX_NAME_LEN}"),
        ));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidData, "descriptor name is not valid UTF-8")
    })
}

/// Read a single control byte and check it against `expected`.
pub(crate) async fn expect_byte(
    stream: &mut UnixStream,
    expected: u8,
    what: &str,
) -> io::Result<()> {
    let got = stream.read_u8().await?;
    if got == expected {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected {what} byte {expected:#04x}, got {got:#04x}"),
        ))
    }
}
