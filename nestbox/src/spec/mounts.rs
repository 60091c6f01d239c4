//! Mount planning for system containers.
//!
//! Injects the mounts a system container cannot run without (proc, sysfs,
//! cgroup, dev, dummy kernel filesystems), the virtualized proc/sys files
//! served by the filesystem virtualizer, the host-backed special
//! directories provisioned by the manager, the systemd tmpfs set, and the
//! host kernel module/header trees. Conflicting user mounts are resolved
//! with fixed priorities and the final list is sorted parents-first.
//!
//! The tables below are constants; read-only rewrites and virtualizer
//! source substitution always happen on the per-conversion copy.

use std::collections::BTreeMap;
use std::io;
use std::mem;
use std::path::{Path, PathBuf};

use oci_spec::runtime::{Linux, Mount, MountBuilder, Process, Root};

use nestbox_shared::constants::vfs;
use nestbox_shared::errors::{MountError, NestboxResult, SpecError};

use crate::services::manager::{Manager, MountKind, MountPrep, MountReq};
use crate::services::virtualizer::Virtualizer;
use crate::util::mount_slice_remove;

use super::{build_err, systemd_init};

// ============================================================================
// Mount Tables
// ============================================================================

/// Mounts every system container must have.
fn base_mounts() -> Result<Vec<Mount>, SpecError> {
    Ok(vec![
        mk("/sys", "sysfs", "sysfs", &["noexec", "nosuid", "nodev"])?,
        mk(
            "/sys/fs/cgroup",
            "cgroup",
            "cgroup",
            &["noexec", "nosuid", "nodev"],
        )?,
        // configfs is not virtualized; cover it with a dummy tmpfs.
        mk(
            "/sys/kernel/config",
            "tmpfs",
            "tmpfs",
            &["rw", "rprivate", "noexec", "nosuid", "nodev", "size=1m"],
        )?,
        // debugfs is not virtualized; dummy tmpfs.
        mk(
            "/sys/kernel/debug",
            "tmpfs",
            "tmpfs",
            &["rw", "rprivate", "noexec", "nosuid", "nodev", "size=1m"],
        )?,
        // tracefs is not virtualized; dummy tmpfs.
        mk(
            "/sys/kernel/tracing",
            "tmpfs",
            "tmpfs",
            &["rw", "rprivate", "noexec", "nosuid", "nodev", "size=1m"],
        )?,
        mk("/proc", "proc", "proc", &["noexec", "nosuid", "nodev"])?,
        mk(
            "/dev",
            "tmpfs",
            "tmpfs",
            &["nosuid", "strictatime", "mode=755", "size=65536k"],
        )?,
        // /dev/kmsg is not virtualized; bind a dummy from /dev/null.
        mk("/dev/kmsg", "bind", "/dev/null", &["rbind", "rprivate"])?,
    ])
}

/// Proc/sys files served by the filesystem virtualizer. Sources are under
/// the default virtualizer mountpoint and get rewritten per container.
fn virtualized_mounts() -> Result<Vec<Mount>, SpecError> {
    let src = |tail: &str| format!("{}/{}", vfs::DEFAULT_MOUNTPOINT, tail);
    Ok(vec![
        mk("/proc/sys", "bind", &src("proc/sys"), &["rbind", "rprivate"])?,
        mk(
            "/proc/swaps",
            "bind",
            &src("proc/swaps"),
            &["rbind", "rprivate"],
        )?,
        mk(
            "/proc/uptime",
            "bind",
            &src("proc/uptime"),
            &["rbind", "rprivate"],
        )?,
        mk(
            "/sys/devices/virtual/dmi/id/product_uuid",
            "bind",
            &src("sys/devices/virtual/dmi/id/product_uuid"),
            &["rbind", "rprivate"],
        )?,
        mk(
            "/sys/module/nf_conntrack/parameters/hashsize",
            "bind",
            &src("sys/module/nf_conntrack/parameters/hashsize"),
            &["rbind", "rprivate"],
        )?,
    ])
}

/// Tmpfs mounts systemd requires over its runtime directories.
fn systemd_mounts() -> Result<Vec<Mount>, SpecError> {
    Ok(vec![
        mk(
            "/run",
            "tmpfs",
            "tmpfs",
            &["rw", "rprivate", "nosuid", "nodev", "mode=755", "size=64m"],
        )?,
        mk(
            "/run/lock",
            "tmpfs",
            "tmpfs",
            &["rw", "rprivate", "noexec", "nosuid", "nodev", "size=4m"],
        )?,
    ])
}

/// Container directories backed by host dirs the manager provisions.
fn special_dirs() -> BTreeMap<&'static str, MountKind> {
    BTreeMap::from([
        ("/var/lib/docker", MountKind::VarLibDocker),
        ("/var/lib/kubelet", MountKind::VarLibKubelet),
        ("/var/lib/rancher/k3s", MountKind::VarLibK3s),
        (
            "/var/lib/containerd/io.containerd.snapshotter.v1.overlayfs",
            MountKind::VarLibContainerdOverlayfs,
        ),
    ])
}

fn mk(dest: &str, typ: &str, source: &str, options: &[&str]) -> Result<Mount, SpecError> {
    MountBuilder::default()
        .destination(dest)
        .typ(typ)
        .source(source)
        .options(options.iter().map(|o| o.to_string()).collect::<Vec<_>>())
        .build()
        .map_err(build_err)
}

// ============================================================================
// Planner
// ============================================================================

pub(crate) fn configure(
    mounts: &mut Vec<Mount>,
    linux: &mut Linux,
    process: &Process,
    root: &Root,
    mgr: &Manager,
    virtualizer: &Virtualizer,
    shift_uids: bool,
) -> NestboxResult<()> {
    let readonly = root.readonly().unwrap_or(false);

    configure_base(mounts, readonly)?;

    if virtualizer.enabled() {
        configure_virtualized(mounts, linux, virtualizer, readonly)?;
    }

    if mgr.enabled() {
        configure_special_dirs(mounts, linux, root, mgr, readonly, shift_uids)?;
    }

    if systemd_init(process) {
        configure_systemd(mounts)?;
    }

    configure_kernel_dirs(mounts)?;

    sort_mounts(mounts);
    Ok(())
}

/// Inject the base mount set, displacing conflicting user mounts.
fn configure_base(mounts: &mut Vec<Mount>, readonly: bool) -> Result<(), SpecError> {
    // Everything under /sys/fs/cgroup/ is set up by the runtime; user
    // mounts there are disallowed.
    let reserved = [mk("/sys/fs/cgroup/", "", "", &[])?];
    *mounts = mount_slice_remove(mem::take(mounts), &reserved, |m, r| {
        m.destination()
            .to_string_lossy()
            .starts_with(&*r.destination().to_string_lossy())
    });

    let mut base = base_mounts()?;

    *mounts = mount_slice_remove(mem::take(mounts), &base, |m, b| {
        m.destination() == b.destination()
    });

    // A read-only rootfs makes /sys and below read-only as well.
    if readonly {
        for m in &mut base {
            if m.destination().starts_with("/sys") {
                set_readonly(m);
            }
        }
    }

    mounts.extend(base);
    Ok(())
}

/// Inject the virtualized proc/sys file mounts.
fn configure_virtualized(
    mounts: &mut Vec<Mount>,
    linux: &mut Linux,
    virtualizer: &Virtualizer,
    readonly: bool,
) -> Result<(), SpecError> {
    let mut vmounts = virtualized_mounts()?;

    *mounts = mount_slice_remove(mem::take(mounts), &vmounts, |m, v| {
        m.destination() == v.destination()
    });

    // Rewrite sources from the default mountpoint to this container's
    // subtree under the virtualizer.
    let subtree = virtualizer.mountpoint().join(virtualizer.id());
    for m in &mut vmounts {
        if let Some(source) = m.source() {
            let rewritten = source
                .to_string_lossy()
                .replacen(vfs::DEFAULT_MOUNTPOINT, &subtree.to_string_lossy(), 1);
            m.set_source(Some(PathBuf::from(rewritten)));
        }
    }

    // On a read-only rootfs these mounts stay read-write during container
    // setup (networking setup writes under /proc/sys) and are remounted
    // read-only via the readonly-paths list right before init starts.
    if readonly {
        let mut ro_paths = linux.readonly_paths().clone().unwrap_or_default();
        ro_paths.extend(
            vmounts
                .iter()
                .map(|m| m.destination().to_string_lossy().into_owned()),
        );
        linux.set_readonly_paths(Some(ro_paths));
    }

    mounts.extend(vmounts);
    Ok(())
}

/// Ask the manager to back the special container directories.
fn configure_special_dirs(
    mounts: &mut Vec<Mount>,
    linux: &Linux,
    root: &Root,
    mgr: &Manager,
    readonly: bool,
    shift_uids: bool,
) -> NestboxResult<()> {
    let Some(rpc) = mgr.rpc() else {
        return Ok(());
    };

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
    let (uid, gid) = (uid_map.host_id(), gid_map.host_id());

    let mut special = special_dirs();

    // A user bind over a special dir wins; the manager only prepares its
    // source (ownership must match the container's host ids).
    let mut prep = Vec::new();
    for m in mounts.iter().rev() {
        let dest = m.destination().to_string_lossy();
        if m.typ().as_deref() == Some("bind") && special.contains_key(dest.as_ref()) {
            prep.push(MountPrep {
                source: m.source().clone().unwrap_or_default(),
                exclusive: true,
            });
            special.remove(dest.as_ref());
        }
    }

    if !prep.is_empty() {
        rpc.prep_mounts(uid, gid, shift_uids, &prep)
            .map_err(|e| MountError::SpecialDir {
                dest: prep
                    .iter()
                    .map(|p| p.source.to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join(", "),
                source: e,
            })?;
    }

    // The remaining special dirs get manager-provisioned backing dirs.
    let reqs: Vec<MountReq> = special
        .iter()
        .map(|(dest, kind)| MountReq {
            kind: *kind,
            dest: PathBuf::from(dest),
        })
        .collect();

    let rootfs = std::path::absolute(root.path()).map_err(|e| MountError::Stat {
        path: root.path().clone(),
        source: e,
    })?;

    let extra = rpc
        .req_mounts(&rootfs, uid, gid, shift_uids, &reqs)
        .map_err(MountError::Rpc)?;

    // Spec mounts take priority over manager mounts at the same destination.
    let mut extra = mount_slice_remove(extra, mounts, |e, m| e.destination() == m.destination());

    if readonly {
        for m in &mut extra {
            set_readonly(m);
        }
    }

    mounts.extend(extra);
    Ok(())
}

/// Inject the systemd tmpfs mounts. A user tmpfs at the same destination
/// wins; any other user mount there is displaced.
fn configure_systemd(mounts: &mut Vec<Mount>) -> Result<(), SpecError> {
    let sysd = systemd_mounts()?;

    *mounts = mount_slice_remove(mem::take(mounts), &sysd, |m, s| {
        m.destination() == s.destination() && m.typ().as_deref() != Some("tmpfs")
    });

    let sysd = mount_slice_remove(sysd, mounts, |s, m| {
        s.destination() == m.destination() && m.typ().as_deref() == Some("tmpfs")
    });

    mounts.extend(sysd);
    Ok(())
}

/// Bind the host kernel module and header trees into the container, so
/// in-container tooling that compiles against the running kernel works.
fn configure_kernel_dirs(mounts: &mut Vec<Mount>) -> NestboxResult<()> {
    let uts = nix::sys::utsname::uname()
        .map_err(|e| MountError::KernelRelease(io::Error::from(e)))?;
    let release = uts.release().to_string_lossy().into_owned();

    let mut kmounts = Vec::new();

    let modules = PathBuf::from(format!("/lib/modules/{release}"));
    match std::fs::symlink_metadata(&modules) {
        Ok(_) => kmounts.push(bind_ro(&modules)?),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(MountError::Stat {
                path: modules,
                source: e,
            }
            .into());
        }
    }

    let headers = PathBuf::from(format!("/usr/src/linux-headers-{release}"));
    match std::fs::metadata(&headers) {
        Ok(_) => {
            // Headers are commonly a symlink into another tree under
            // /usr/src; mount the target too so the link resolves inside
            // the container.
            let real = std::fs::canonicalize(&headers).map_err(|e| MountError::Stat {
                path: headers.clone(),
                source: e,
            })?;
            if real != headers {
                kmounts.push(bind_ro(&real)?);
            }
            kmounts.push(bind_ro(&headers)?);
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(MountError::Stat {
                path: headers,
                source: e,
            }
            .into());
        }
    }

    // User mounts at the same destination win.
    let kmounts = mount_slice_remove(kmounts, mounts, |k, m| k.destination() == m.destination());
    mounts.extend(kmounts);
    Ok(())
}

/// Bind a host path read-only at the same path in the container.
fn bind_ro(path: &Path) -> Result<Mount, SpecError> {
    let p = path.to_string_lossy();
    mk(&p, "bind", &p, &["ro", "rbind", "rprivate"])
}

fn set_readonly(m: &mut Mount) {
    let mut options = m.options().clone().unwrap_or_default();
    options.retain(|o| o != "rw");
    options.push("ro".to_string());
    m.set_options(Some(options));
}

/// Sort mounts so that parents come before their children; unrelated paths
/// order lexicographically at the first differing component.
fn sort_mounts(mounts: &mut [Mount]) {
    mounts.sort_by(|a, b| a.destination().components().cmp(b.destination().components()));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dests(mounts: &[Mount]) -> Vec<String> {
        mounts
            .iter()
            .map(|m| m.destination().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_base_mounts_injected() {
        let mut mounts = Vec::new();
        configure_base(&mut mounts, false).unwrap();
        let d = dests(&mounts);
        for want in ["/sys", "/sys/fs/cgroup", "/proc", "/dev", "/dev/kmsg"] {
            assert!(d.contains(&want.to_string()), "missing {want}");
        }
    }

    #[test]
    fn test_user_mount_under_cgroup_dir_removed() {
        let mut mounts = vec![mk("/sys/fs/cgroup/cpu", "cgroup", "cgroup", &[]).unwrap()];
        configure_base(&mut mounts, false).unwrap();
        assert!(!dests(&mounts).contains(&"/sys/fs/cgroup/cpu".to_string()));
    }

    #[test]
    fn test_user_mount_at_required_dest_overridden() {
        let mut mounts = vec![mk("/proc", "bind", "/host/proc", &["rbind"]).unwrap()];
        configure_base(&mut mounts, false).unwrap();

        let procs: Vec<&Mount> = mounts
            .iter()
            .filter(|m| m.destination().to_str() == Some("/proc"))
            .collect();
        assert_eq!(procs.len(), 1);
        assert_eq!(procs[0].typ().as_deref(), Some("proc"));
    }

    #[test]
    fn test_readonly_rootfs_marks_sys_mounts() {
        let mut mounts = Vec::new();
        configure_base(&mut mounts, true).unwrap();

        for m in mounts.iter().filter(|m| m.destination().starts_with("/sys")) {
            let options = m.options().as_ref().unwrap();
            assert!(options.contains(&"ro".to_string()), "{:?}", m.destination());
            assert!(!options.contains(&"rw".to_string()), "{:?}", m.destination());
        }
        // Mounts outside /sys are untouched.
        let dev = mounts
            .iter()
            .find(|m| m.destination().to_str() == Some("/dev"))
            .unwrap();
        assert!(!dev.options().as_ref().unwrap().contains(&"ro".to_string()));
    }

    #[test]
    fn test_systemd_tmpfs_injected() {
        let mut mounts = Vec::new();
        configure_systemd(&mut mounts).unwrap();
        let d = dests(&mounts);
        assert!(d.contains(&"/run".to_string()));
        assert!(d.contains(&"/run/lock".to_string()));
    }

    #[test]
    fn test_user_tmpfs_wins_over_systemd_mount() {
        let user = mk("/run", "tmpfs", "tmpfs", &["size=128m"]).unwrap();
        let mut mounts = vec![user.clone()];
        configure_systemd(&mut mounts).unwrap();

        let runs: Vec<&Mount> = mounts
            .iter()
            .filter(|m| m.destination().to_str() == Some("/run"))
            .collect();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].options(), user.options());
    }

    #[test]
    fn test_non_tmpfs_user_mount_at_run_replaced() {
        let mut mounts = vec![mk("/run", "bind", "/host/run", &["rbind"]).unwrap()];
        configure_systemd(&mut mounts).unwrap();

        let runs: Vec<&Mount> = mounts
            .iter()
            .filter(|m| m.destination().to_str() == Some("/run"))
            .collect();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].typ().as_deref(), Some("tmpfs"));
    }

    #[test]
    fn test_sort_parents_before_children() {
        let mut mounts = vec![
            mk("/sys/fs/cgroup", "cgroup", "cgroup", &[]).unwrap(),
            mk("/dev", "tmpfs", "tmpfs", &[]).unwrap(),
            mk("/sys", "sysfs", "sysfs", &[]).unwrap(),
            mk("/dev/kmsg", "bind", "/dev/null", &[]).unwrap(),
            mk("/proc", "proc", "proc", &[]).unwrap(),
        ];
        sort_mounts(&mut mounts);
        assert_eq!(
            dests(&mounts),
            vec!["/dev", "/dev/kmsg", "/proc", "/sys", "/sys/fs/cgroup"]
        );
    }

    #[test]
    fn test_sort_component_wise() {
        // "/sys-extra" sorts after "/sys/..." because the first component
        // differs ("sys" < "sys-extra").
        let mut mounts = vec![
            mk("/sys-extra", "tmpfs", "tmpfs", &[]).unwrap(),
            mk("/sys/kernel/config", "tmpfs", "tmpfs", &[]).unwrap(),
            mk("/sys", "sysfs", "sysfs", &[]).unwrap(),
        ];
        sort_mounts(&mut mounts);
        assert_eq!(
            dests(&mounts),
            vec!["/sys", "/sys/kernel/config", "/sys-extra"]
        );
    }

    #[test]
    fn test_virtualized_sources_rewritten() {
        let vmounts = virtualized_mounts().unwrap();
        for m in &vmounts {
            assert!(
                m.source()
                    .as_ref()
                    .unwrap()
                    .starts_with(vfs::DEFAULT_MOUNTPOINT),
                "source {:?} not under default mountpoint",
                m.source()
            );
        }
    }
}
