//! Upgrader lifecycle states and the legal transitions between them.

use std::fmt;

use crate::error::Error;

/// Lifecycle state of an [`Upgrader`](crate::Upgrader).
///
/// Exactly one state is held at a time; transitions outside the table
/// below fail with [`Error::IllegalTransition`]:
///
/// ```text
/// CheckingOwner         -> Owner | Stopped
/// Owner                 -> TransferringOwnership | Stopped
/// TransferringOwnership -> Owner | Draining | Stopped
/// Draining              -> Stopped
/// Stopped               -> (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgraderState {
    /// Initial state: rendezvousing with the coordination directory to
    /// find out whether an owner already exists.
    CheckingOwner,
    /// This process owns the shared descriptors and serves upgrade
    /// requests from future successors.
    Owner,
    /// A successor is connected and the descriptor payload is streaming
    /// to it.
    TransferringOwnership,
    /// Ownership was committed to a successor; in-flight work drains but
    /// no further upgrades are served.
    Draining,
    /// Terminal state.
    Stopped,
}

impl UpgraderState {
    /// Whether the lifecycle permits moving from `self` to `next`.
    #[must_use]
    pub(crate) fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::CheckingOwner, Self::Owner | Self::Stopped)
                | (Self::Owner, Self::TransferringOwnership | Self::Stopped)
                | (
                    Self::TransferringOwnership,
                    Self::Owner | Self::Draining | Self::Stopped
                )
                | (Self::Draining, Self::Stopped)
        )
    }

    /// Move to `next`, or fail leaving `self` untouched.
    pub(crate) fn transition_to(&mut self, next: Self) -> Result<(), Error> {
        if self.can_transition_to(next) {
            *self = next;
            Ok(())
        } else {
            Err(Error::IllegalTransition {
                from: *self,
                to: next,
            })
        }
    }
}

impl fmt::Display for UpgraderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CheckingOwner => write!(f, "checking_owner"),
            Self::Owner => write!(f, "owner"),
            Self::TransferringOwnership => write!(f, "transferring_ownership"),
            Self::Draining => write!(f, "draining"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use UpgraderState::{CheckingOwner, Draining, Owner, Stopped, TransferringOwnership};

    const ALL: [UpgraderState; 5] = [CheckingOwner, Owner, TransferringOwnership, Draining, Stopped];

    #[test]
    fn transition_table_is_exact() {
        let allowed = [
            (CheckingOwner, Owner),
            (CheckingOwner, Stopped),
            (Owner, TransferringOwnership),
            (Owner, Stopped),
            (TransferringOwnership, Owner),
            (TransferringOwnership, Draining),
            (TransferringOwnership, Stopped),
            (Draining, Stopped),
        ];
        for from in ALL {
            for to in ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "transition {from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn stopped_is_terminal() {
        for to in ALL {
            let mut state = Stopped;
            let err = state.transition_to(to).unwrap_err();
            assert!(matches!(err, Error::IllegalTransition { .. }));
            assert_eq!(state, Stopped);
        }
    }

    #[test]
    fn failed_transition_leaves_state_untouched() {
        let mut state = Draining;
        assert!(state.transition_to(Owner).is_err());
        assert_eq!(state, Draining);
    }
}
