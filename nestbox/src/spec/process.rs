//! Process-section hardening: capabilities, apparmor, oom score, and the
//! systemd environment contract.

use std::collections::HashSet;

use oci_spec::runtime::{Capability, LinuxCapabilitiesBuilder, Process};

use nestbox_shared::errors::SpecError;

use crate::util::{env_var_name, string_slice_remove_match};

use super::{build_err, systemd_init};

/// Environment systemd needs to recognize the virtualization mode it runs
/// under (container with a private user namespace).
const SYSTEMD_ENV_VARS: &[&str] = &["container=private-users"];

pub(crate) fn configure(process: &mut Process) -> Result<(), SpecError> {
    configure_capabilities(process)?;

    // Stock apparmor profiles are written for regular containers and break
    // system workloads (mounts, /proc/sys writes); no profile is applied.
    process.set_apparmor_profile(None);

    if systemd_init(process) {
        configure_systemd_env(process);
    }

    Ok(())
}

/// A root-owned init gets every capability, as it would on a real host.
/// Any other uid keeps the full bounding set but starts with the runtime
/// sets empty, again as on a real host.
fn configure_capabilities(process: &mut Process) -> Result<(), SpecError> {
    let full = full_capabilities();
    let none: HashSet<Capability> = HashSet::new();

    let caps = if process.user().uid() == 0 {
        LinuxCapabilitiesBuilder::default()
            .bounding(full.clone())
            .effective(full.clone())
            .inheritable(full.clone())
            .permitted(full.clone())
            .ambient(full)
            .build()
            .map_err(build_err)?
    } else {
        LinuxCapabilitiesBuilder::default()
            .bounding(full)
            .effective(none.clone())
            .inheritable(none.clone())
            .permitted(none.clone())
            .ambient(none)
            .build()
            .map_err(build_err)?
    };

    process.set_capabilities(Some(caps));
    Ok(())
}

/// The -1000 oom score is not settable from within a user namespace; clamp
/// to the closest attainable value.
pub(crate) fn configure_oom_score(process: &mut Process) {
    if let Some(score) = process.oom_score_adj()
        && score < -999
    {
        process.set_oom_score_adj(Some(-999));
    }
}

fn configure_systemd_env(process: &mut Process) {
    let env = process.env().clone().unwrap_or_default();

    // Drop user entries that collide with ours by name, then append ours.
    let mut env = string_slice_remove_match(&env, |entry| {
        let Some(name) = env_var_name(entry) else {
            return false;
        };
        SYSTEMD_ENV_VARS
            .iter()
            .any(|own| env_var_name(own) == Some(name))
    });
    env.extend(SYSTEMD_ENV_VARS.iter().map(|v| v.to_string()));

    process.set_env(Some(env));
}

/// The full Linux capability list granted to a system container's root.
pub(crate) fn full_capabilities() -> HashSet<Capability> {
    HashSet::from([
        Capability::Chown,
        Capability::DacOverride,
        Capability::Fsetid,
        Capability::Fowner,
        Capability::Mknod,
        Capability::NetRaw,
        Capability::Setgid,
        Capability::Setuid,
        Capability::Setfcap,
        Capability::Setpcap,
        Capability::NetBindService,
        Capability::SysChroot,
        Capability::Kill,
        Capability::AuditWrite,
        Capability::DacReadSearch,
        Capability::LinuxImmutable,
        Capability::NetBroadcast,
        Capability::NetAdmin,
        Capability::IpcLock,
        Capability::IpcOwner,
        Capability::SysModule,
        Capability::SysRawio,
        Capability::SysPtrace,
        Capability::SysPacct,
        Capability::SysAdmin,
        Capability::SysBoot,
        Capability::SysNice,
        Capability::SysResource,
        Capability::SysTime,
        Capability::SysTtyConfig,
        Capability::Lease,
        Capability::AuditControl,
        Capability::MacOverride,
        Capability::MacAdmin,
        Capability::Syslog,
        Capability::WakeAlarm,
        Capability::BlockSuspend,
        Capability::AuditRead,
    ])
}
