//! Masked and read-only path reconciliation.
//!
//! Container managers hand us path lists written for regular containers.
//! In a system container several of those paths are either virtualized
//! (and must stay reachable) or needed read-write by the init system, so
//! they are dropped from the lists here.

use oci_spec::runtime::{Linux, Process};

use crate::util::string_slice_remove;

use super::systemd_init;

/// Paths that must not be masked in a system container. The /proc entries
/// are either virtualized or rendered harmless by the user namespace.
const EXPOSED_PATHS: &[&str] = &[
    "/proc",
    "/proc/sys",
    "/proc/kcore",
    "/proc/kallsyms",
    "/proc/kmsg",
];

/// Additional paths that must not be masked when init is systemd.
const SYSTEMD_EXPOSED_PATHS: &[&str] = &[
    "/run",
    "/run/lock",
    "/tmp",
    "/sys/kernel/config",
    "/sys/kernel/debug",
    "/sys/kernel/tracing",
];

/// Paths that must stay read-write in a system container.
const RW_PATHS: &[&str] = &["/proc", "/proc/sys"];

/// Additional read-write paths when init is systemd.
const SYSTEMD_RW_PATHS: &[&str] = &[
    "/run",
    "/run/lock",
    "/tmp",
    "/sys/kernel/config",
    "/sys/kernel/debug",
    "/sys/kernel/tracing",
];

pub(crate) fn configure_masked(linux: &mut Linux, process: &Process) {
    let mut masked = linux.masked_paths().clone().unwrap_or_default();
    if systemd_init(process) {
        masked = string_slice_remove(&masked, SYSTEMD_EXPOSED_PATHS);
    }
    masked = string_slice_remove(&masked, EXPOSED_PATHS);
    linux.set_masked_paths(Some(masked));
}

pub(crate) fn configure_readonly(linux: &mut Linux, process: &Process) {
    let mut readonly = linux.readonly_paths().clone().unwrap_or_default();
    if systemd_init(process) {
        readonly = string_slice_remove(&readonly, SYSTEMD_RW_PATHS);
    }
    readonly = string_slice_remove(&readonly, RW_PATHS);
    linux.set_readonly_paths(Some(readonly));
}
