//! Spec conversion pipeline.
//!
//! Takes an ordinary OCI container configuration and transforms it, in a
//! single pass, into a system-container configuration: full namespace set,
//! validated user-ns id mappings, the required mount set (with virtualized
//! proc/sys files), reconciled masked/readonly paths, capabilities, and
//! seccomp profile.
//!
//! The fixed mount and path tables in the submodules are immutable;
//! per-container rewrites (read-only rootfs, virtualizer source paths)
//! always operate on a local copy so concurrent conversions cannot observe
//! each other.

pub mod idmap;
pub mod mounts;
pub mod namespaces;
pub mod paths;
pub mod process;
pub mod seccomp;
pub mod shift;
pub mod syscalls;

pub use shift::{KernelShiftProbe, ShiftProbe};

use oci_spec::runtime::{LinuxNamespaceType, Process, Spec};

use nestbox_shared::errors::{NestboxResult, SpecError};

use crate::services::manager::Manager;
use crate::services::virtualizer::Virtualizer;

static KERNEL_SHIFT_PROBE: KernelShiftProbe = KernelShiftProbe;

/// Facts about uid shifting discovered during conversion.
#[derive(Debug, Clone, Copy)]
pub struct ConvertOutcome {
    /// The host kernel can shift uids/gids at mount time.
    pub uid_shift_supported: bool,
    /// The rootfs is root-owned and the container maps to a non-root host
    /// range, so an id-shifting mount is required to make it usable.
    pub rootfs_needs_shift: bool,
}

/// One-shot converter from a regular container spec to a system-container
/// spec. The manager and virtualizer handles steer the id-mapping and mount
/// stages; the spec is mutated in place.
pub struct SpecConverter<'a> {
    manager: &'a Manager,
    virtualizer: &'a Virtualizer,
    shift_probe: &'a dyn ShiftProbe,
}

impl<'a> SpecConverter<'a> {
    pub fn new(manager: &'a Manager, virtualizer: &'a Virtualizer) -> Self {
        Self {
            manager,
            virtualizer,
            shift_probe: &KERNEL_SHIFT_PROBE,
        }
    }

    /// Replace the kernel id-shift capability probe (used by tests and by
    /// embedders with their own detection).
    pub fn with_shift_probe(mut self, probe: &'a dyn ShiftProbe) -> Self {
        self.shift_probe = probe;
        self
    }

    /// Convert `spec` into a system-container spec.
    pub fn convert(&self, spec: &mut Spec) -> NestboxResult<ConvertOutcome> {
        check_spec(spec)?;

        let mut linux = spec.linux().clone().ok_or(SpecError::NotLinux)?;
        let mut process = spec.process().clone().ok_or(SpecError::NotLinux)?;
        let root = spec.root().clone().ok_or(SpecError::NotLinux)?;
        let mut mounts = spec.mounts().clone().unwrap_or_default();

        namespaces::configure(&mut linux, self.manager)?;
        idmap::configure(&mut linux, self.manager)?;

        // Needs the final id mappings, so it must follow the idmap stage.
        let outcome = shift::check(&root, &linux, self.shift_probe)?;

        mounts::configure(
            &mut mounts,
            &mut linux,
            &process,
            &root,
            self.manager,
            self.virtualizer,
            outcome.rootfs_needs_shift,
        )?;

        paths::configure_masked(&mut linux, &process);
        paths::configure_readonly(&mut linux, &process);
        process::configure_oom_score(&mut process);

        if let Some(mut sc) = linux.seccomp().clone() {
            seccomp::configure(&mut sc)?;
            linux.set_seccomp(Some(sc));
        }

        process::configure(&mut process)?;

        spec.set_linux(Some(linux));
        spec.set_process(Some(process));
        spec.set_mounts(Some(mounts));

        Ok(outcome)
    }

    /// Convert only the process section (used for exec'ing additional
    /// processes into an already-converted container).
    pub fn convert_process(&self, p: &mut Process) -> NestboxResult<()> {
        process::configure(p)?;
        Ok(())
    }
}

/// Basic sanity checks on the incoming spec.
fn check_spec(spec: &Spec) -> Result<(), SpecError> {
    if spec.root().is_none() {
        return Err(SpecError::NotLinux);
    }
    let Some(linux) = spec.linux() else {
        return Err(SpecError::NotLinux);
    };

    // The container's network namespace must not be the host's: isolation
    // rests on the user namespace, which the host netns would bypass.
    for ns in linux.namespaces().iter().flatten() {
        if ns.typ() == LinuxNamespaceType::Network
            && let Some(path) = ns.path()
            && !path.as_os_str().is_empty()
        {
            let own = nix::sys::stat::stat("/proc/self/ns/net")
                .map_err(|e| SpecError::stat("/proc/self/ns/net", e.into()))?;
            let target = nix::sys::stat::stat(path.as_path())
                .map_err(|e| SpecError::stat(path.clone(), e.into()))?;
            if own.st_dev == target.st_dev && own.st_ino == target.st_ino {
                return Err(SpecError::HostNsShared);
            }
            break;
        }
    }

    Ok(())
}

/// True when the container's init is systemd.
pub(crate) fn systemd_init(process: &Process) -> bool {
    process
        .args()
        .as_ref()
        .and_then(|args| args.first())
        .is_some_and(|arg0| arg0 == "/sbin/init")
}

/// Map a builder failure into a spec error.
pub(crate) fn build_err(e: impl std::fmt::Display) -> SpecError {
    SpecError::Build(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use oci_spec::runtime::{ProcessBuilder, RootBuilder, SpecBuilder};

    #[test]
    fn test_check_spec_requires_linux() {
        let spec = SpecBuilder::default()
            .root(RootBuilder::default().path("/rootfs").build().unwrap())
            .build()
            .unwrap();
        assert!(matches!(check_spec(&spec), Err(SpecError::NotLinux)));
    }

    #[test]
    fn test_systemd_init_detection() {
        let p = ProcessBuilder::default()
            .args(vec!["/sbin/init".to_string()])
            .build()
            .unwrap();
        assert!(systemd_init(&p));

        let p = ProcessBuilder::default()
            .args(vec!["/bin/sh".to_string()])
            .build()
            .unwrap();
        assert!(!systemd_init(&p));
    }
}
