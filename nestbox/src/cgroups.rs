//! Cgroup manager surface and placement helpers.
//!
//! The cgroup manager itself (v1 fs, v1 systemd, v2 fs, v2 systemd) is
//! owned by the embedding runtime and consumed through [`CgroupManager`].
//! This module adds the placement helpers the launch pipeline needs: pid
//! entry into a set of cgroup paths, and the cgroup-v2 unified fallback
//! used when direct entry fails with EBUSY under nesting.

use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use nix::unistd::Pid;

use nestbox_shared::errors::CgroupError;

/// Mountpoint of the unified (v2) cgroup hierarchy.
pub const UNIFIED_MOUNTPOINT: &str = "/sys/fs/cgroup";

/// Flavor of the cgroup manager backing a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupKind {
    V1Fs,
    V1Systemd,
    V2Fs,
    V2Systemd,
}

impl CgroupKind {
    pub fn is_v1(self) -> bool {
        matches!(self, CgroupKind::V1Fs | CgroupKind::V1Systemd)
    }

    pub fn is_v2(self) -> bool {
        matches!(self, CgroupKind::V2Fs | CgroupKind::V2Systemd)
    }
}

/// Cgroup manager operations consumed by the launch pipeline.
///
/// Besides the container's own cgroup, system containers get a nested
/// *child* cgroup that serves as the cgroup root visible inside the
/// container; creation/entry ordering differs between v1 and v2 and is
/// sequenced by the launch pipeline.
pub trait CgroupManager: Send {
    /// Place `pid` in the container's cgroup and apply pending config.
    fn apply(&mut self, pid: Pid) -> Result<(), CgroupError>;

    /// Install the container's resource limits.
    fn set(&mut self) -> Result<(), CgroupError>;

    /// Create the nested child cgroup (inherits the resources set above).
    fn create_child_cgroup(&mut self) -> Result<(), CgroupError>;

    /// Place `pid` in the nested child cgroup.
    fn apply_child_cgroup(&mut self, pid: Pid) -> Result<(), CgroupError>;

    /// Manager flavor; decides child-cgroup ordering.
    fn kind(&self) -> CgroupKind;

    /// Tear down everything `apply`/`create_child_cgroup` created.
    fn destroy(&mut self) -> Result<(), CgroupError>;
}

/// True when the host runs a unified (v2-only) cgroup hierarchy.
pub fn is_unified_hierarchy() -> bool {
    nix::sys::statfs::statfs(UNIFIED_MOUNTPOINT)
        .map(|fs| fs.filesystem_type() == nix::sys::statfs::CGROUP2_SUPER_MAGIC)
        .unwrap_or(false)
}

/// Write `pid` into each of the given cgroup directories.
pub fn enter_pid(paths: &HashMap<String, PathBuf>, pid: Pid) -> Result<(), CgroupError> {
    for path in paths.values() {
        write_cgroup_proc(path, pid)?;
    }
    Ok(())
}

/// Append `pid` to `<dir>/cgroup.procs`.
pub fn write_cgroup_proc(dir: &Path, pid: Pid) -> Result<(), CgroupError> {
    let procs = dir.join("cgroup.procs");
    let write = || -> io::Result<()> {
        let mut f = std::fs::OpenOptions::new().append(true).open(&procs)?;
        f.write_all(pid.as_raw().to_string().as_bytes())?;
        Ok(())
    };
    write().map_err(|source| CgroupError::Enter {
        path: procs,
        source,
    })
}

/// Join the cgroup of an already-running process, v2-unified only.
///
/// This is the one local recovery in the launch pipeline: entering a pid
/// into nested cgroups with domain controllers can fail with EBUSY, in
/// which case the pid joins the init process's own cgroup instead.
pub fn join_process_cgroup(init_pid: Pid, pid: Pid) -> Result<(), CgroupError> {
    let cgroup_file = format!("/proc/{}/cgroup", init_pid.as_raw());
    let content = std::fs::read_to_string(&cgroup_file)
        .map_err(CgroupError::UnifiedFallback)?;
    let entries = parse_cgroup_file(&content);

    let unified = entries.get("").ok_or_else(|| {
        CgroupError::UnifiedFallback(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no unified entry in {cgroup_file}"),
        ))
    })?;

    let dirpath = Path::new(UNIFIED_MOUNTPOINT).join(unified.trim_start_matches('/'));
    tracing::debug!(
        pid = pid.as_raw(),
        cgroup = %dirpath.display(),
        "joining init process cgroup after EBUSY"
    );
    write_cgroup_proc(&dirpath, pid)
}

/// Parse `/proc/<pid>/cgroup` content into subsystem → path. The unified
/// hierarchy appears under the empty-string key.
pub fn parse_cgroup_file(content: &str) -> HashMap<String, String> {
    let mut entries = HashMap::new();
    for line in content.lines() {
        // hierarchy-ID:controller-list:cgroup-path
        let mut parts = line.splitn(3, ':');
        let (Some(_id), Some(controllers), Some(path)) =
            (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        if controllers.is_empty() {
            entries.insert(String::new(), path.to_string());
        } else {
            for controller in controllers.split(',') {
                entries.insert(controller.to_string(), path.to_string());
            }
        }
    }
    entries
}
