//! Intel RDT (resource director) manager surface.
//!
//! Consumed as an opaque capability object; a container may or may not have
//! RDT configuration, and the manager implementation lives with the
//! embedding runtime.

use std::io;

use nix::unistd::Pid;

/// RDT manager operations consumed by the launch pipeline.
pub trait RdtManager: Send {
    /// Place `pid` in the container's resctrl group.
    fn apply(&mut self, pid: Pid) -> io::Result<()>;

    /// Install the container's RDT schemata.
    fn set(&mut self) -> io::Result<()>;

    /// Tear down the resctrl group.
    fn destroy(&mut self) -> io::Result<()>;
}
