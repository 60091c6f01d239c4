//! Seccomp profile reconciliation.
//!
//! A system container must be able to issue the syscalls an init system and
//! a nested container engine need (mount, pivot_root, sethostname, setns,
//! unshare, ...). Incoming profiles are written for regular containers, so:
//!
//! - whitelist profiles (default errno/kill) get the system-container
//!   allow-list appended, and argument restrictions stripped except for a
//!   few syscalls where restrictions are known-safe;
//! - blacklist profiles (default allow) get any denied syscall that is on
//!   the allow-list removed from their deny entries.
//!
//! Only x86_64 profiles are reconciled; other architectures pass through.

use std::collections::BTreeSet;

use oci_spec::runtime::{
    Arch, LinuxSeccomp, LinuxSeccompAction, LinuxSyscall, LinuxSyscallBuilder,
};

use nestbox_shared::errors::SpecError;

use super::build_err;
use super::syscalls::{ALLOW_LIST, RESTRICTIONS_ALLOWED};

pub(crate) fn configure(seccomp: &mut LinuxSeccomp) -> Result<(), SpecError> {
    let x86_64 = seccomp
        .architectures()
        .as_ref()
        .is_some_and(|archs| archs.contains(&Arch::ScmpArchX86_64));
    if !x86_64 {
        return Ok(());
    }

    let whitelist = match seccomp.default_action() {
        LinuxSeccompAction::ScmpActErrno | LinuxSeccompAction::ScmpActKill => true,
        LinuxSeccompAction::ScmpActAllow => false,
        other => return Err(SpecError::DefaultSeccompAction(format!("{other:?}"))),
    };

    let mut syscalls = seccomp.syscalls().clone().unwrap_or_default();

    // Categorize the profile's syscalls per action.
    let mut allow_set = BTreeSet::new();
    let mut deny_set = BTreeSet::new();
    for sc in &syscalls {
        for name in sc.names() {
            match sc.action() {
                LinuxSeccompAction::ScmpActAllow => {
                    allow_set.insert(name.clone());
                }
                LinuxSeccompAction::ScmpActErrno | LinuxSeccompAction::ScmpActKill => {
                    deny_set.insert(name.clone());
                }
                _ => {}
            }
        }
    }

    let required: BTreeSet<&str> = ALLOW_LIST.iter().copied().collect();

    if whitelist {
        // Append whatever the profile is missing from the allow-list.
        let missing: Vec<&str> = required
            .iter()
            .filter(|name| !allow_set.contains(**name))
            .copied()
            .collect();
        for name in &missing {
            syscalls.push(
                LinuxSyscallBuilder::default()
                    .names(vec![name.to_string()])
                    .action(LinuxSeccompAction::ScmpActAllow)
                    .build()
                    .map_err(build_err)?,
            );
        }
        tracing::debug!(count = missing.len(), "added syscalls to seccomp profile");

        // Argument restrictions defeat the allow-list; strip them except on
        // the few syscalls where restrictions are tolerated.
        for sc in &mut syscalls {
            if sc
                .names()
                .iter()
                .any(|name| !RESTRICTIONS_ALLOWED.contains(&name.as_str()))
            {
                sc.set_args(None);
            }
        }
    } else {
        // Remove denied syscalls that a system container requires.
        let conflicting: BTreeSet<&str> = deny_set
            .iter()
            .map(String::as_str)
            .filter(|name| required.contains(name))
            .collect();

        syscalls.retain_mut(|sc| {
            let names: Vec<String> = sc
                .names()
                .iter()
                .filter(|n| !conflicting.contains(n.as_str()))
                .cloned()
                .collect();
            if names.is_empty() {
                return false;
            }
            sc.set_names(names);
            true
        });
        tracing::debug!(
            count = conflicting.len(),
            "removed syscalls from seccomp profile"
        );
    }

    seccomp.set_syscalls(Some(syscalls));
    Ok(())
}
