//! # rollover
//!
//! Zero-downtime process upgrades for long-lived Unix servers: an
//! outgoing process hands its named file descriptors (listening sockets
//! included) to an incoming successor over a Unix-domain socket, then
//! drains. External clients of the shared listeners never notice.
//!
//! Sibling processes rendezvous through a shared coordination directory
//! holding an advisory lock file, the current owner's pid record, and a
//! per-owner upgrade socket. Any process can be both a server to a future
//! successor and a client of the current owner; the bootstrap case (no
//! owner yet) is handled.
//!
//! ## Example
//!
//! ```no_run
//! use rollover::Upgrader;
//!
//! # async fn run() -> Result<(), rollover::Error> {
//! let upgrader = Upgrader::new("/run/myapp/upgrade").await?;
//! // Inherits the socket from a predecessor, or binds it on first start.
//! let listener = upgrader.fds().listen_tcp("http", "0.0.0.0:8080")?;
//! // ... spawn the server on `listener`, then:
//! upgrader.ready().await?;
//!
//! // Much later, a successor takes over:
//! upgrader.upgrade_complete().await;
//! // ... finish in-flight work, then:
//! upgrader.stop();
//! # Ok(()) }
//! ```
//!
//! What is deliberately out of scope: starting the successor process
//! (that is a supervisor's job), transferring any state beyond
//! descriptors and their names, and cross-host handoff.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod coordinator;
mod error;
mod fdpass;
mod fds;
mod os;
mod protocol;
mod session;
mod state;
mod upgrader;


pub use error::{Error, Result};
pub use fds::Fds;
pub use state::UpgraderState;
/// Re-exported for [`UpgraderConfig::bootstrap_cancel`].
pub use tokio_util::sync::CancellationToken;
pub use upgrader::{Upgrader, UpgraderConfig, DEFAULT_UPGRADE_TIMEOUT};
