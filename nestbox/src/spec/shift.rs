//! Rootfs uid-shift detection.
//!
//! Container images are normally root-owned on disk. When the container
//! maps to a non-root host id range, the rootfs must be mounted through an
//! id-shifting filesystem or chowned; this module detects whether shifting
//! is needed and whether the kernel can do it.

use oci_spec::runtime::{Linux, Root};

use nestbox_shared::errors::SpecError;

use super::ConvertOutcome;

/// Host capability probe for id-shifting mounts.
pub trait ShiftProbe: Sync {
    fn id_shift_supported(&self) -> bool;
}

/// Probe backed by the running kernel's filesystem registry.
pub struct KernelShiftProbe;

impl ShiftProbe for KernelShiftProbe {
    fn id_shift_supported(&self) -> bool {
        std::fs::read_to_string("/proc/filesystems")
            .map(|s| s.lines().any(|line| line.trim_end().ends_with("shiftfs")))
            .unwrap_or(false)
    }
}

pub(crate) fn check(
    root: &Root,
    linux: &Linux,
    probe: &dyn ShiftProbe,
) -> Result<ConvertOutcome, SpecError> {
    let uid_map = linux
        .uid_mappings()
        .as_ref()
        .and_then(|m| m.first())
        .ok_or(SpecError::NoUserNsMapping)?;
    let gid_map = linux
        .gid_mappings()
        .as_ref()
        .and_then(|m| m.first())
        .ok_or(SpecError::NoUserNsMapping)?;

    let host_uid = uid_map.host_id();
    let host_gid = gid_map.host_id();

    let st = nix::sys::stat::stat(root.path().as_path())
        .map_err(|e| SpecError::stat(root.path().clone(), e.into()))?;

    let rootfs_needs_shift = st.st_uid == 0
        && st.st_gid == 0
        && host_uid != 0
        && host_gid != 0
        && host_uid == host_gid;

    Ok(ConvertOutcome {
        uid_shift_supported: probe.id_shift_supported(),
        rootfs_needs_shift,
    })
}
