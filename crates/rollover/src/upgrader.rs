//! The upgrader: accept loop, handoff state machine, and the public
//! lifecycle.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::coordinator::Coordinator;
use crate::error::Error;
use crate::fds::{BlockReason, Fds};
use crate::os::{Os, RealOs};
use crate::session::{self, UpgradeSession};
use crate::state::UpgraderState;

/// How long the predecessor waits for a successor's ready signal before
/// rolling the handoff back.
pub const DEFAULT_UPGRADE_TIMEOUT: Duration = Duration::from_secs(60);

const fn default_upgrade_timeout() -> Duration {
    DEFAULT_UPGRADE_TIMEOUT
}

/// Upgrader configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgraderConfig {
    /// Time a successor gets between connecting and signalling ready.
    /// Zero means [`DEFAULT_UPGRADE_TIMEOUT`].
    #[serde(default = "default_upgrade_timeout")]
    #[serde(with = "humantime_serde")]
    pub upgrade_timeout: Duration,

    /// Governs only the bootstrap rendezvous with a predecessor during
    /// construction. Upgrades served later are bounded by
    /// [`upgrade_timeout`](Self::upgrade_timeout) and ended by
    /// [`Upgrader::stop`].
    #[serde(skip, default)]
    pub bootstrap_cancel: CancellationToken,
}

impl Default for UpgraderConfig {
    fn default() -> Self {
        Self {
            upgrade_timeout: DEFAULT_UPGRADE_TIMEOUT,
            bootstrap_cancel: CancellationToken::new(),
        }
    }
}

impl UpgraderConfig {
    fn normalized(mut self) -> Self {
        if self.upgrade_timeout.is_zero() {
            self.upgrade_timeout = DEFAULT_UPGRADE_TIMEOUT;
        }
        self
    }
}

struct Inner {
    upgrade_timeout: Duration,
    fds: Arc<Fds>,
    state: Mutex<UpgraderState>,
    /// Fires when `stop` is called; exits the accept loop, which drops the
    /// upgrade socket and with it the loop's handle on this struct.
    stop: CancellationToken,
    /// Fires exactly once: successful handoff or stop, whichever first.
    complete: CancellationToken,
}

impl Inner {
    fn transition_to(&self, next: UpgraderState) -> Result<(), Error> {
        self.state.lock().transition_to(next)
    }
}

/// Hands file descriptors between an outgoing process and its successor
/// with zero downtime for the shared listeners.
///
/// Every process in an upgrade chain constructs an `Upgrader` over the
/// same coordination directory. Construction rendezvouses with the current
/// owner (if any) and inherits its descriptors; [`ready`](Self::ready)
/// completes the takeover. From then on the upgrader serves handoff
/// requests from future successors until [`stop`](Self::stop).
pub struct Upgrader {
    inner: Arc<Inner>,
    session: tokio::sync::Mutex<Option<UpgradeSession>>,
}

impl std::fmt::Debug for Upgrader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upgrader").finish_non_exhaustive()
    }
}

impl Upgrader {
    /// Construct an upgrader coordinating through `dir` with default
    /// configuration.
    ///
    /// All processes in one upgrade chain must use the same directory,
    /// which must exist and be writeable. Canonically
    /// `/run/${program}/upgrade/`.
    ///
    /// # Errors
    ///
    /// Fails if the coordination directory is unusable, the directory lock
    /// cannot be acquired ([`Error::LockContended`] once
    /// `bootstrap_cancel` fires), or receiving the predecessor's
    /// descriptors fails.
    pub async fn new(dir: impl AsRef<Path>) -> Result<Self, Error> {
        Self::with_config(dir, UpgraderConfig::default()).await
    }

    /// Construct an upgrader with explicit configuration.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub async fn with_config(dir: impl AsRef<Path>, config: UpgraderConfig) -> Result<Self, Error> {
        Self::build(Arc::new(RealOs), dir.as_ref(), config).await
    }

    pub(crate) async fn build(
        os: Arc<dyn Os>,
        dir: &Path,
        config: UpgraderConfig,
    ) -> Result<Self, Error> {
        let config = config.normalized();
        let coord = Arc::new(Coordinator::new(Arc::clone(&os), dir));
        let listener = coord.listen(&config.bootstrap_cancel).await?;

        let inner = Arc::new(Inner {
            upgrade_timeout: config.upgrade_timeout,
            fds: Arc::new(Fds::new(os)),
            state: Mutex::new(UpgraderState::CheckingOwner),
            stop: CancellationToken::new(),
            complete: CancellationToken::new(),
        });
        tokio::spawn(serve_upgrades(listener, Arc::clone(&inner)));

        let upgrader = Self {
            inner,
            session: tokio::sync::Mutex::new(None),
        };
        match upgrader.rendezvous(coord, &config.bootstrap_cancel).await {
            Ok(()) => Ok(upgrader),
            Err(e) => {
                // The caller never sees this upgrader; tear the accept loop
                // down so the socket does not linger.
                upgrader.inner.stop.cancel();
                Err(e)
            }
        }
    }

    async fn rendezvous(
        &self,
        coord: Arc<Coordinator>,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let mut session = UpgradeSession::connect(coord, cancel).await?;
        let files = session.get_files(cancel).await?;
        self.inner.fds.adopt(files);
        *self.session.lock().await = Some(session);
        Ok(())
    }

    /// The shared descriptor store.
    #[must_use]
    pub fn fds(&self) -> Arc<Fds> {
        Arc::clone(&self.inner.fds)
    }

    /// Signal that this process is serving traffic, completing its side of
    /// the takeover.
    ///
    /// With a live predecessor this sends the ready byte, at which point
    /// the predecessor commits and starts draining. Without one, this
    /// process registers itself as the first owner. Either way the
    /// upgrader transitions to owner and starts honouring upgrade
    /// requests.
    ///
    /// # Errors
    ///
    /// [`Error::IllegalTransition`] when called twice or after `stop`;
    /// [`Error::Transfer`] / [`Error::Io`] if signalling the predecessor
    /// fails, in which case the state is left unchanged.
    pub async fn ready(&self) -> Result<(), Error> {
        {
            let state = self.inner.state.lock();
            if *state != UpgraderState::CheckingOwner {
                return Err(Error::IllegalTransition {
                    from: *state,
                    to: UpgraderState::Owner,
                });
            }
        }
        let mut slot = self.session.lock().await;
        let Some(session) = slot.take() else {
            return Err(Error::IllegalTransition {
                from: UpgraderState::CheckingOwner,
                to: UpgraderState::Owner,
            });
        };
        if session.has_owner() {
            session.send_ready().await?;
        } else {
            session.become_owner()?;
        }
        self.inner.transition_to(UpgraderState::Owner)
    }

    /// Resolves once ownership has been handed to a successor, or once
    /// [`stop`](Self::stop) is called, whichever happens first.
    ///
    /// The signal latches and fires exactly once per upgrader: every
    /// observer, including those arriving after the fact, resolves
    /// immediately thereafter.
    pub async fn upgrade_complete(&self) {
        self.inner.complete.cancelled().await;
    }

    /// Stop serving upgrades, signal [`upgrade_complete`](Self::upgrade_complete)
    /// if it has not fired yet, and close every descriptor still in the
    /// store. Idempotent.
    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.transition_to(UpgraderState::Stopped).is_err() {
                // Already stopped.
                return;
            }
        }
        self.inner.fds.lock_mutations(BlockReason::Stopped);
        self.inner.stop.cancel();
        self.inner.complete.cancel();
        // Release the bootstrap session, and with it any still-held
        // coordination-directory lock, if ready was never called.
        if let Ok(mut slot) = self.session.try_lock() {
            slot.take();
        }
        info!("closing stored file descriptors");
        self.inner.fds.close_all();
    }
}

/// Accept loop on the `${pid}.sock` upgrade socket.
async fn serve_upgrades(listener: UnixListener, inner: Arc<Inner>) {
    loop {
        tokio::select! {
            () = inner.stop.cancelled() => {
                info!("upgrade socket closed, no longer listening for upgrades");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((conn, _addr)) => {
                    tokio::spawn(handle_upgrade_request(Arc::clone(&inner), conn));
                }
                Err(e) => error!(error = %e, "error accepting an upgrade request"),
            },
        }
    }
}

/// One incoming handoff: stream the snapshot, then race transfer failure,
/// the ready timer, and the successor's ready byte.
async fn handle_upgrade_request(inner: Arc<Inner>, mut conn: UnixStream) {
    if let Err(e) = inner.transition_to(UpgraderState::TransferringOwnership) {
        info!(reason = %e, "cannot serve an upgrade request right now");
        return;
    }
    info!("serving an upgrade request from a successor");
    inner.fds.lock_mutations(BlockReason::UpgradeInProgress);

    let files = match inner.fds.snapshot() {
        Ok(files) => files,
        Err(e) => {
            roll_back(&inner, &format!("snapshotting descriptors: {e}"));
            return;
        }
    };

    let outcome = tokio::time::timeout(
        inner.upgrade_timeout,
        session::pass_files_to_successor(&mut conn, &files),
    )
    .await;

    match outcome {
        Ok(Ok(())) => {
            info!("successor is ready, draining");
            inner.fds.lock_mutations(BlockReason::UpgradeCompleted);
            // Stop may have raced the commit; the store lock and the
            // completion signal stand either way.
            let _ = inner.transition_to(UpgraderState::Draining);
            inner.complete.cancel();
        }
        Ok(Err(e)) => roll_back(&inner, &e.to_string()),
        Err(_) => roll_back(&inner, "successor did not signal ready in time"),
    }
}

fn roll_back(inner: &Inner, reason: &str) {
    error!(reason, "handoff failed, rolling back");
    if let Err(e) = inner.transition_to(UpgraderState::Owner) {
        // Stop was called while the transfer ran. There is no ownership to
        // resume; the store stays locked and the process is on its way out.
        error!(error = %e, "unable to remain owner after a failed handoff");
        return;
    }
    inner.fds.unlock_mutations();
}
