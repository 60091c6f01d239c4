//! Namespace normalization.
//!
//! A system container must run in its own pid, ipc, uts, mount, and network
//! namespaces; those are required of the incoming spec. The user and cgroup
//! namespaces are not required by the OCI spec, but a system container
//! cannot exist without them, so missing entries are appended here.

use std::collections::HashSet;

use oci_spec::runtime::{Linux, LinuxNamespaceBuilder, LinuxNamespaceType};

use nestbox_shared::errors::SpecError;

use crate::services::manager::Manager;

use super::build_err;

const REQUIRED: &[LinuxNamespaceType] = &[
    LinuxNamespaceType::Pid,
    LinuxNamespaceType::Ipc,
    LinuxNamespaceType::Uts,
    LinuxNamespaceType::Mount,
    LinuxNamespaceType::Network,
];

const ENSURED: &[LinuxNamespaceType] = &[
    LinuxNamespaceType::Pid,
    LinuxNamespaceType::Ipc,
    LinuxNamespaceType::Uts,
    LinuxNamespaceType::Mount,
    LinuxNamespaceType::Network,
    LinuxNamespaceType::User,
    LinuxNamespaceType::Cgroup,
];

pub(crate) fn configure(linux: &mut Linux, mgr: &Manager) -> Result<(), SpecError> {
    let mut namespaces = linux.namespaces().clone().unwrap_or_default();

    let present: HashSet<LinuxNamespaceType> = namespaces.iter().map(|ns| ns.typ()).collect();

    let missing: Vec<String> = REQUIRED
        .iter()
        .filter(|t| !present.contains(t))
        .map(|t| ns_name(*t).to_string())
        .collect();
    if !missing.is_empty() {
        return Err(SpecError::MissingNamespaces(missing));
    }

    for t in ENSURED {
        if !present.contains(t) {
            namespaces.push(
                LinuxNamespaceBuilder::default()
                    .typ(*t)
                    .build()
                    .map_err(build_err)?,
            );
            tracing::debug!(namespace = ns_name(*t), "added namespace to spec");
        }
    }

    // The manager can pin the container's user namespace to a peer's.
    if mgr.enabled()
        && let Some(path) = &mgr.config().userns_path
    {
        for ns in &mut namespaces {
            if ns.typ() == LinuxNamespaceType::User {
                ns.set_path(Some(path.clone()));
            }
        }
    }

    linux.set_namespaces(Some(namespaces));
    Ok(())
}

fn ns_name(t: LinuxNamespaceType) -> &'static str {
    match t {
        LinuxNamespaceType::Pid => "pid",
        LinuxNamespaceType::Ipc => "ipc",
        LinuxNamespaceType::Uts => "uts",
        LinuxNamespaceType::Mount => "mount",
        LinuxNamespaceType::Network => "network",
        LinuxNamespaceType::User => "user",
        LinuxNamespaceType::Cgroup => "cgroup",
        LinuxNamespaceType::Time => "time",
    }
}
