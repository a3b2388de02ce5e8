//! Error taxonomy for upgrade coordination.

use std::io;

use crate::state::UpgraderState;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by an [`Upgrader`](crate::Upgrader) and its
/// file-descriptor store.
///
/// Transfer failures and ready-timeouts observed while handing descriptors
/// to a successor are handled internally by rolling the upgrade back; they
/// never appear here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A store mutation was attempted while a handoff to a successor is
    /// streaming. The caller may retry once the upgrade resolves.
    #[error("upgrade in progress: file descriptor store is locked")]
    UpgradeInProgress,

    /// A store mutation was attempted after this process handed its
    /// descriptors to a successor. Terminal for the caller's intent.
    #[error("upgrade completed: file descriptors now belong to the successor")]
    UpgradeCompleted,

    /// A store mutation was attempted after [`Upgrader::stop`] was called.
    ///
    /// [`Upgrader::stop`]: crate::Upgrader::stop
    #[error("upgrader is stopped")]
    UpgraderStopped,

    /// The lifecycle does not allow this state transition. Indicates a bug
    /// in the caller (for example, signalling ready twice).
    #[error("illegal upgrader state transition: {from} -> {to}")]
    IllegalTransition {
        /// State the upgrader was in.
        from: UpgraderState,
        /// State the transition aimed for.
        to: UpgraderState,
    },

    /// The coordination-directory lock could not be acquired before the
    /// cancellation token fired.
    #[error("coordination directory lock is held by another process")]
    LockContended,

    /// A cancellation token fired while waiting on the named operation.
    #[error("cancelled while {0}")]
    Cancelled(&'static str),

    /// Wire-protocol violation or I/O failure during descriptor transfer.
    /// The session is one-shot; the peer is presumed gone.
    #[error("descriptor transfer failed: {0}")]
    Transfer(String),

    /// I/O error outside the transfer protocol (coordination directory,
    /// descriptor duplication, socket setup).
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_transition() {
        let err = Error::IllegalTransition {
            from: UpgraderState::Stopped,
            to: UpgraderState::Owner,
        };
        assert_eq!(
            err.to_string(),
            "illegal upgrader state transition: stopped -> owner"
        );
    }

    #[test]
    fn io_errors_convert() {
        let err = Error::from(io::Error::new(io::ErrorKind::Other, "boom"));
        assert!(matches!(err, Error::Io(_)));
    }
}
