//! Filesystem rendezvous: the coordination-directory lock, the owner pid
//! record, and the per-owner upgrade socket.
//!
//! The directory layout is shared state between every process in an
//! upgrade chain and must stay bit-compatible across versions:
//!
//! - `coordination.lock`: empty file carrying an exclusive advisory lock.
//! - `owner.pid`: ASCII decimal pid of the current owner; absent when no
//!   owner exists.
//! - `${pid}.sock`: Unix stream socket the owner with that pid accepts
//!   upgrade requests on.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fs2::FileExt;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Error;
use crate::os::Os;

pub(crate) const LOCK_FILE: &str = "coordination.lock";
pub(crate) const PID_FILE: &str = "owner.pid";

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// Serializes access to one coordination directory and mediates the
/// predecessor/successor rendezvous.
pub(crate) struct Coordinator {
    os: Arc<dyn Os>,
    dir: PathBuf,
}

/// Exclusive hold on `coordination.lock`. Dropping the value releases the
/// advisory lock.
#[derive(Debug)]
pub(crate) struct DirLock {
    _file: File,
}

impl Coordinator {
    pub(crate) fn new(os: Arc<dyn Os>, dir: impl Into<PathBuf>) -> Self {
        Self { os, dir: dir.into() }
    }

    fn sock_path(&self, pid: u32) -> PathBuf {
        self.dir.join(format!("{pid}.sock"))
    }

    /// Acquire the directory lock, retrying until it is free.
    ///
    /// Fails with [`Error::LockContended`] if `cancel` fires first.
    pub(crate) async fn lock(&self, cancel: &CancellationToken) -> Result<DirLock, Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.dir.join(LOCK_FILE))?;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(DirLock { _file: file }),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
            tokio::select! {
                () = tokio::time::sleep(LOCK_RETRY_INTERVAL) => {}
                () = cancel.cancelled() => return Err(Error::LockContended),
            }
        }
    }

    /// Bind this process's upgrade socket, under the directory lock.
    ///
    /// A socket file left behind by an earlier process that happened to
    /// have the same pid is unlinked first; binding must succeed under pid
    /// reuse.
    pub(crate) async fn listen(&self, cancel: &CancellationToken) -> Result<UnixListener, Error> {
        let lock = self.lock(cancel).await?;
        if let Some(owner) = self.read_owner_pid()? {
            debug!(owner, "coordination directory already has a registered owner");
        }
        let sock = self.sock_path(self.os.pid());
        match fs::remove_file(&sock) {
            Ok(()) => debug!(path = %sock.display(), "unlinked stale upgrade socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let listener = UnixListener::bind(&sock)?;
        drop(lock);
        Ok(listener)
    }

    /// Dial the current owner, holding the directory lock across the dial.
    ///
    /// Returns the held lock and, when a live owner exists, a connection to
    /// it. The lock must stay held until the session either claims
    /// ownership or closes: a successor has to talk to the existing owner
    /// or atomically observe that there is none.
    ///
    /// A registered owner whose socket is gone or refuses the connection is
    /// stale (the pid was never ours to trust across restarts) and is
    /// treated as no owner.
    pub(crate) async fn connect(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(DirLock, Option<UnixStream>), Error> {
        let lock = self.lock(cancel).await?;
        let Some(owner) = self.read_owner_pid()? else {
            return Ok((lock, None));
        };
        let sock = self.sock_path(owner);
        let stream = tokio::select! {
            res = UnixStream::connect(&sock) => res,
            () = cancel.cancelled() => return Err(Error::Cancelled("dialling the current owner")),
        };
        match stream {
            Ok(stream) => {
                debug!(owner, "connected to the current owner");
                Ok((lock, Some(stream)))
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound
                ) =>
            {
                warn!(owner, "owner.pid names an unreachable process, assuming stale owner");
                Ok((lock, None))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Record this process in `owner.pid`, then release the directory lock.
    pub(crate) fn claim_ownership(&self, lock: DirLock) -> Result<(), Error> {
        self.write_pid_file()?;
        drop(lock);
        Ok(())
    }

    /// Atomic replace: write to a temp file in the same directory, then
    /// rename over `owner.pid`. A crash mid-claim leaves either the old
    /// record or the new one, never a torn write.
    fn write_pid_file(&self) -> io::Result<()> {
        let tmp = self.dir.join(".owner.pid.tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(self.os.pid().to_string().as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, self.dir.join(PID_FILE))
    }

    fn read_owner_pid(&self) -> Result<Option<u32>, Error> {
        let contents = match fs::read_to_string(self.dir.join(PID_FILE)) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match contents.trim().parse::<u32>() {
            Ok(pid) => Ok(Some(pid)),
            Err(_) => {
                warn!(contents = %contents.trim(), "owner.pid is unparseable, assuming stale owner");
                Ok(None)
            }
        }
    }
}
