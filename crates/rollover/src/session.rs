//! One rendezvous with the current owner: the successor's view of a
//! handoff, plus the predecessor-side transfer routine.

use std::fmt::Display;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::coordinator::{Coordinator, DirLock};
use crate::error::Error;
use crate::fdpass;
use crate::protocol;

fn transfer_err(context: &str, e: impl Display) -> Error {
    Error::Transfer(format!("{context}: {e}"))
}

/// A successor's one-shot session with the coordination directory and,
/// when one exists, the current owner.
///
/// Holds the coordination-directory lock from construction until either
/// [`send_ready`](Self::send_ready) / [`become_owner`](Self::become_owner)
/// claims ownership or the session is dropped. Dropping releases the lock
/// and closes the connection.
pub(crate) struct UpgradeSession {
    coord: Arc<Coordinator>,
    conn: Option<UnixStream>,
    lock: Option<DirLock>,
}

impl UpgradeSession {
    /// Rendezvous through `coord`: observe whether an owner exists and, if
    /// so, connect to it.
    pub(crate) async fn connect(
        coord: Arc<Coordinator>,
        cancel: &CancellationToken,
    ) -> Result<Self, Error> {
        let (lock, conn) = coord.connect(cancel).await?;
        Ok(Self {
            coord,
            conn,
            lock: Some(lock),
        })
    }

    /// Whether an existing owner was observed at connect time.
    pub(crate) fn has_owner(&self) -> bool {
        self.conn.is_some()
    }

    /// Request and receive the predecessor's descriptor payload, one pair
    /// at a time. Immediately empty when no owner exists.
    pub(crate) async fn get_files(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Vec<(String, OwnedFd)>, Error> {
        let Some(conn) = self.conn.as_mut() else {
            return Ok(Vec::new());
        };
        tokio::select! {
            res = receive_files(conn) => res,
            () = cancel.cancelled() => {
                Err(Error::Cancelled("receiving descriptors from the current owner"))
            }
        }
    }

    /// Register as the new owner and signal the predecessor to drain.
    ///
    /// Ownership is claimed (and the directory lock released) before the
    /// ready byte goes out, so by the time the predecessor commits, the
    /// directory already names this process.
    pub(crate) async fn send_ready(mut self) -> Result<(), Error> {
        let Some(mut conn) = self.conn.take() else {
            return Err(Error::Transfer("no connection to signal ready on".into()));
        };
        if let Some(lock) = self.lock.take() {
            self.coord.claim_ownership(lock)?;
        }
        conn.write_u8(protocol::READY)
            .await
            .map_err(|e| transfer_err("sending ready", e))?;
        info!("signalled ready to the predecessor");
        Ok(())
    }

    /// Bootstrap: no predecessor exists, register as the first owner.
    pub(crate) fn become_owner(mut self) -> Result<(), Error> {
        debug_assert!(self.conn.is_none(), "become_owner with a live predecessor");
        if let Some(lock) = self.lock.take() {
            self.coord.claim_ownership(lock)?;
        }
        info!("no previous owner, bootstrapped as the first owner");
        Ok(())
    }
}

/// Successor side of the wire exchange.
pub(crate) async fn receive_files(
    conn: &mut UnixStream,
) -> Result<Vec<(String, OwnedFd)>, Error> {
    conn.write_u8(protocol::REQUEST)
        .await
        .map_err(|e| transfer_err("requesting payload", e))?;
    let count = conn
        .read_u32()
        .await
        .map_err(|e| transfer_err("reading pair count", e))? as usize;

    let mut files = Vec::with_capacity(count.min(128));
    for _ in 0..count {
        let name = protocol::read_name(conn)
            .await
            .map_err(|e| transfer_err("reading descriptor name", e))?;
        let (marker, fd) = fdpass::recv_fd(conn)
            .await
            .map_err(|e| transfer_err("receiving descriptor", e))?;
        if marker != protocol::FD_MARKER {
            return Err(Error::Transfer(format!(
                "expected descriptor marker, got {marker:#04x}"
            )));
        }
        debug!(name, "received descriptor");
        files.push((name, fd));
    }

    protocol::expect_byte(conn, protocol::PAYLOAD_END, "end-of-payload")
        .await
        .map_err(|e| transfer_err("finishing payload", e))?;
    Ok(files)
}

/// Predecessor side: stream the snapshot to a connected successor, then
/// wait for its ready byte. The caller races this against the ready timer.
pub(crate) async fn pass_files_to_successor(
    conn: &mut UnixStream,
    files: &[(String, OwnedFd)],
) -> Result<(), Error> {
    protocol::expect_byte(conn, protocol::REQUEST, "request")
        .await
        .map_err(|e| transfer_err("awaiting request", e))?;

    let count = u32::try_from(files.len())
        .map_err(|_| Error::Transfer(format!("{} descriptors exceed the payload cap", files.len())))?;
    conn.write_u32(count)
        .await
        .map_err(|e| transfer_err("writing pair count", e))?;

    for (name, fd) in files {
        protocol::write_name(conn, name)
            .await
            .map_err(|e| transfer_err("writing descriptor name", e))?;
        fdpass::send_fd(conn, protocol::FD_MARKER, fd.as_fd())
            .await
            .map_err(|e| transfer_err("sending descriptor", e))?;
        debug!(name, "sent descriptor");
    }

    conn.write_u8(protocol::PAYLOAD_END)
        .await
        .map_err(|e| transfer_err("writing end-of-payload", e))?;

    protocol::expect_byte(conn, protocol::READY, "ready")
        .await
        .map_err(|e| transfer_err("awaiting ready", e))?;
    Ok(())
}
