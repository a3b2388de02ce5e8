//! Process-identity and descriptor primitives behind a small trait, so
//! tests can run several upgraders with distinct pids inside one process.
//!
//! Descriptor transfer over a socket lives in [`crate::fdpass`]; it
//! operates on real socketpairs in tests and needs no substitution.

use std::fs::File;
use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::path::Path;

/// Capabilities the upgrader needs from the operating system.
pub(crate) trait Os: Send + Sync + 'static {
    /// Identifier under which this process registers in the coordination
    /// directory. Not unique across time; pid reuse is expected.
    fn pid(&self) -> u32;

    /// Open a file by path for insertion into the descriptor store.
    fn open(&self, path: &Path) -> io::Result<File>;

    /// Duplicate a descriptor. The duplicate is close-on-exec.
    fn dup(&self, fd: BorrowedFd<'_>) -> io::Result<OwnedFd> {
        fd.try_clone_to_owned()
    }
}

/// The live operating system.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RealOs;

impl Os for RealOs {
    fn pid(&self) -> u32 {
        std::process::id()
    }

    fn open(&self, path: &Path) -> io::Result<File> {
        File::open(path)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::os::fd::AsFd;

    use super::*;

    #[test]
    fn dup_outlives_the_original() {
        let (reader, writer) = nix::unistd::pipe().expect("pipe");
        let dup = RealOs.dup(writer.as_fd()).expect("dup");
        drop(writer);

        let mut dup = File::from(dup);
        dup.write_all(b"x").expect("write via dup");
        drop(dup);

        let mut buf = Vec::new();
        File::from(reader).read_to_end(&mut buf).expect("read");
        assert_eq!(buf, b"x");
    }
}
