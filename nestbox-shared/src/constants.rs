//! Shared constants between the runtime core and the container bootstrapper.
//!
//! These values must be identical on both sides of the parent-child boundary.

/// User-namespace ID mapping constants.
pub mod idmap {
    /// Minimum number of uids/gids a system container must be mapped to.
    pub const ID_RANGE_MIN: u32 = 65536;

    /// Fallback host uid for the container's root when no manager is present.
    pub const DEFAULT_UID: u32 = 231072;

    /// Fallback host gid for the container's root when no manager is present.
    pub const DEFAULT_GID: u32 = 231072;
}

/// Filesystem-virtualizer constants.
pub mod vfs {
    /// Default mountpoint of the filesystem virtualizer on the host.
    ///
    /// Mount tables reference sources under this prefix; the prefix is
    /// rewritten to `<mountpoint>/<container-id>` during spec conversion.
    pub const DEFAULT_MOUNTPOINT: &str = "/var/lib/nestbox-vfs";
}

/// Sync-socket protocol constants.
pub mod sync {
    /// Out-of-band byte that unblocks the child's cgroup-namespace unshare.
    ///
    /// The same value is hardcoded in the native bootstrapper.
    pub const CREATE_CGROUP_NS: u8 = 0x80;
}

/// Environment variables used to hand file descriptors to the bootstrapper.
pub mod child {
    /// Fd number of the child side of the sync socket.
    pub const SYNC_FD_ENV: &str = "_NESTBOX_SYNCFD";

    /// Fd number of the write side of the log pipe.
    pub const LOG_FD_ENV: &str = "_NESTBOX_LOGFD";
}
