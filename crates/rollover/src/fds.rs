//! Named file-descriptor store.
//!
//! The store owns one descriptor per name; callers always receive
//! duplicates, so a caller-held socket keeps working no matter what the
//! store does afterwards. Lookups, insertions, the transfer snapshot, and
//! the mutation block all go through one mutex, which makes the snapshot
//! linearizable with concurrent mutations: a mutation either lands before
//! the block (and is in the snapshot) or fails with the block reason.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::net::{TcpListener as StdTcpListener, ToSocketAddrs};
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, UnixListener};
use tracing::debug;

use crate::error::Error;
use crate::os::Os;

/// Why mutations are currently refused.
///
/// A later block overrides an earlier one, so an in-progress block becomes
/// a completed block the moment the handoff commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockReason {
    /// A handoff is streaming; it may still roll back.
    UpgradeInProgress,
    /// The handoff committed; this process no longer owns the descriptors.
    UpgradeCompleted,
    /// The upgrader was stopped.
    Stopped,
}

impl BlockReason {
    fn to_error(self) -> Error {
        match self {
            Self::UpgradeInProgress => Error::UpgradeInProgress,
            Self::UpgradeCompleted => Error::UpgradeCompleted,
            Self::Stopped => Error::UpgraderStopped,
        }
    }
}

struct Inner {
    fds: HashMap<String, OwnedFd>,
    blocked: Option<BlockReason>,
}

/// Named file descriptors shared across an upgrade chain.
///
/// Obtained from [`Upgrader::fds`](crate::Upgrader::fds). Names are the
/// only key used to reassociate descriptors after a handoff, so both sides
/// of an upgrade must agree on them; the store itself treats them as
/// opaque.
pub struct Fds {
    os: Arc<dyn Os>,
    inner: Mutex<Inner>,
}

impl Fds {
    pub(crate) fn new(os: Arc<dyn Os>) -> Self {
        Self {
            os,
            inner: Mutex::new(Inner {
                fds: HashMap::new(),
                blocked: None,
            }),
        }
    }

    /// Insert descriptors inherited from a predecessor. Used once, during
    /// construction, before the store is reachable by callers.
    pub(crate) fn adopt(&self, files: Vec<(String, OwnedFd)>) {
        let mut inner = self.inner.lock();
        for (name, fd) in files {
            inner.fds.insert(name, fd);
        }
    }

    /// Open `path` under `name`, or return the descriptor already bound to
    /// `name`. Idempotent.
    ///
    /// # Errors
    ///
    /// Fails with the block reason while an upgrade is in flight, has
    /// completed, or the upgrader is stopped, and with [`Error::Io`] if the
    /// open or duplication fails.
    pub fn open(&self, name: &str, path: impl AsRef<Path>) -> Result<File, Error> {
        let path = path.as_ref();
        self.insert_with(name, |os| os.open(path))
    }

    /// Like [`open`](Self::open), with a caller-supplied opener invoked
    /// with `arg` only when `name` is not yet bound.
    ///
    /// # Errors
    ///
    /// Fails with the block reason while mutations are refused, and with
    /// [`Error::Io`] if the opener or duplication fails.
    pub fn open_with(
        &self,
        name: &str,
        arg: &str,
        opener: impl FnOnce(&str) -> io::Result<File>,
    ) -> Result<File, Error> {
        self.insert_with(name, |_| opener(arg))
    }

    fn insert_with(
        &self,
        name: &str,
        open: impl FnOnce(&dyn Os) -> io::Result<File>,
    ) -> Result<File, Error> {
        let mut inner = self.inner.lock();
        if let Some(reason) = inner.blocked {
            return Err(reason.to_error());
        }
        if let Some(existing) = inner.fds.get(name) {
            return Ok(File::from(self.os.dup(existing.as_fd())?));
        }
        let file = open(self.os.as_ref())?;
        let dup = self.os.dup(file.as_fd())?;
        inner.fds.insert(name.to_owned(), OwnedFd::from(file));
        Ok(File::from(dup))
    }

    /// Listen on a TCP address under `name`, inheriting the listening
    /// socket from a predecessor when one was transferred under that name.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails with the block reason while mutations are refused, and with
    /// [`Error::Io`] if binding or registering the listener fails.
    pub fn listen_tcp(&self, name: &str, addr: impl ToSocketAddrs) -> Result<TcpListener, Error> {
        self.listen_tcp_with(name, || StdTcpListener::bind(addr))
    }

    /// Like [`listen_tcp`](Self::listen_tcp) with a caller-supplied binder,
    /// for sockets that need options set before `bind` (reuse flags, accept
    /// backlog, and so on). The binder runs only when `name` is not
    /// inherited.
    ///
    /// # Errors
    ///
    /// Fails with the block reason while mutations are refused, and with
    /// [`Error::Io`] if the binder or listener registration fails.
    pub fn listen_tcp_with(
        &self,
        name: &str,
        bind: impl FnOnce() -> io::Result<StdTcpListener>,
    ) -> Result<TcpListener, Error> {
        let listener = StdTcpListener::from(self.listener_fd(name, bind)?);
        listener.set_nonblocking(true)?;
        Ok(TcpListener::from_std(listener)?)
    }

    /// Listen on a Unix socket path under `name`, inheriting from a
    /// predecessor when possible.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails with the block reason while mutations are refused, and with
    /// [`Error::Io`] if binding or registering the listener fails.
    pub fn listen_unix(&self, name: &str, path: impl AsRef<Path>) -> Result<UnixListener, Error> {
        let path = path.as_ref();
        let listener = StdUnixListener::from(self.listener_fd(name, || StdUnixListener::bind(path))?);
        listener.set_nonblocking(true)?;
        Ok(UnixListener::from_std(listener)?)
    }

    /// Inherit-or-bind: duplicate the stored descriptor for `name`, or run
    /// the binder and store a duplicate of its result.
    fn listener_fd<L: Into<OwnedFd>>(
        &self,
        name: &str,
        bind: impl FnOnce() -> io::Result<L>,
    ) -> Result<OwnedFd, Error> {
        let mut inner = self.inner.lock();
        if let Some(reason) = inner.blocked {
            return Err(reason.to_error());
        }
        if let Some(existing) = inner.fds.get(name) {
            debug!(name, "reusing inherited listener");
            return Ok(self.os.dup(existing.as_fd())?);
        }
        let listener = bind()?.into();
        let dup = self.os.dup(listener.as_fd())?;
        inner.fds.insert(name.to_owned(), listener);
        Ok(dup)
    }

    /// Delete `name` and close the store's descriptor. Descriptors handed
    /// out earlier stay open. Removing an unbound name is a no-op.
    ///
    /// # Errors
    ///
    /// Fails with the block reason while mutations are refused.
    pub fn remove(&self, name: &str) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        if let Some(reason) = inner.blocked {
            return Err(reason.to_error());
        }
        if inner.fds.remove(name).is_some() {
            debug!(name, "removed descriptor from store");
        }
        Ok(())
    }

    /// Duplicate the descriptor bound to `name`, if any. Lookups succeed
    /// regardless of the mutation block.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Io`] only if duplication fails.
    pub fn file(&self, name: &str) -> Result<Option<File>, Error> {
        let inner = self.inner.lock();
        match inner.fds.get(name) {
            Some(fd) => Ok(Some(File::from(self.os.dup(fd.as_fd())?))),
            None => Ok(None),
        }
    }

    /// Duplicate every descriptor for transfer. The duplicates have their
    /// own lifetime, so the transfer stays valid even if this store is
    /// closed before the successor commits.
    pub(crate) fn snapshot(&self) -> io::Result<Vec<(String, OwnedFd)>> {
        let inner = self.inner.lock();
        inner
            .fds
            .iter()
            .map(|(name, fd)| Ok((name.clone(), self.os.dup(fd.as_fd())?)))
            .collect()
    }

    /// Refuse subsequent mutations with `reason`. Idempotent; a later call
    /// overrides the stored reason.
    pub(crate) fn lock_mutations(&self, reason: BlockReason) {
        self.inner.lock().blocked = Some(reason);
    }

    /// Allow mutations again, after an upgrade rolled back.
    pub(crate) fn unlock_mutations(&self) {
        self.inner.lock().blocked = None;
    }

    /// Close every descriptor still in the store. Called once, at stop.
    pub(crate) fn close_all(&self) {
        let mut inner = self.inner.lock();
        inner.fds.clear();
    }

    #[cfg(test)]
    pub(crate) fn names(&self) -> Vec<String> {
        self.inner.lock().fds.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;
    use crate::os::RealOs;

    fn store() -> Fds {
        Fds::new(Arc::new(RealOs))
    }

    /// Opener that hands out the write end of a fresh pipe.
    fn pipe_opener(_arg: &str) -> io::Result<File> {
        let (_r, w) = nix::unistd::pipe()?;
        Ok(File::from(w))
    }

    #[test]
    fn open_with_is_idempotent() {
        let fds = store();
        let _first = fds.open_with("a", "a", pipe_opener).expect("first open");
        let _second = fds
            .open_with("a", "a", |_| panic!("opener must not run for a bound name"))
            .expect("second open returns the existing descriptor");
        assert_eq!(fds.names(), vec!["a".to_owned()]);
    }

    #[test]
    fn open_reads_a_path_backed_descriptor() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("data");
        std::fs::write(&path, b"payload").expect("seed file");

        let fds = store();
        let mut file = fds.open("data", &path).expect("open");
        let mut contents = String::new();
        file.read_to_string(&mut contents).expect("read");
        assert_eq!(contents, "payload");

        // The bound name wins over the path on a second open.
        let _again = fds
            .open("data", dir.path().join("missing"))
            .expect("idempotent open");
    }

    #[test]
    fn blocked_store_refuses_mutations_with_the_stored_reason() {
        let fds = store();
        fds.open_with("a", "a", pipe_opener).expect("open");

        fds.lock_mutations(BlockReason::UpgradeInProgress);
        assert!(matches!(
            fds.open_with("b", "b", pipe_opener),
            Err(Error::UpgradeInProgress)
        ));
        assert!(matches!(fds.remove("a"), Err(Error::UpgradeInProgress)));

        // Commit overrides the reason.
        fds.lock_mutations(BlockReason::UpgradeCompleted);
        assert!(matches!(fds.remove("a"), Err(Error::UpgradeCompleted)));

        fds.unlock_mutations();
        fds.remove("a").expect("remove after unlock");
    }

    #[test]
    fn lookups_ignore_the_mutation_block() {
        let fds = store();
        fds.open_with("a", "a", pipe_opener).expect("open");
        fds.lock_mutations(BlockReason::UpgradeInProgress);

        assert!(fds.file("a").expect("lookup").is_some());
        assert!(fds.file("missing").expect("lookup").is_none());
    }

    #[test]
    fn remove_closes_the_stores_descriptor_only() {
        let fds = store();
        let (r, w) = nix::unistd::pipe().expect("pipe");
        let held = fds
            .open_with("a", "a", move |_| Ok(File::from(w)))
            .expect("open");

        fds.remove("a").expect("remove");
        // The caller's duplicate still holds the pipe open.
        drop(held);

        let mut buf = Vec::new();
        File::from(r).read_to_end(&mut buf).expect("read");
        assert!(buf.is_empty());
    }

    #[test]
    fn snapshot_duplicates_survive_close_all() {
        let fds = store();
        fds.open_with("a", "a", pipe_opener).expect("open");

        let snapshot = fds.snapshot().expect("snapshot");
        fds.close_all();

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].0, "a");
        // The duplicate is still a valid descriptor.
        let dup = snapshot[0].1.try_clone().expect("dup of snapshot fd");
        drop(dup);
    }

    #[tokio::test]
    async fn listen_tcp_binds_and_then_inherits() {
        let fds = store();
        let first = fds.listen_tcp("http", "127.0.0.1:0").expect("bind");
        let addr = first.local_addr().expect("addr");

        // Same name resolves to the same listening socket, not a new bind.
        let second = fds.listen_tcp("http", "127.0.0.1:0").expect("inherit");
        assert_eq!(second.local_addr().expect("addr"), addr);
    }

    #[tokio::test]
    async fn listen_unix_binds_under_a_name() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let fds = store();
        let path = dir.path().join("svc.sock");
        let _listener = fds.listen_unix("svc", &path).expect("bind");
        assert!(path.exists());
    }
}
