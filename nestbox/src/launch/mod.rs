//! Init-process orchestration.
//!
//! Launching a system container is a handshake between this runtime and a
//! native bootstrapper: the bootstrapper enters the container's namespaces
//! (something that must happen before any managed runtime starts its own
//! threads), forks the final init process, and reports its pid back over a
//! socket pair. The parent side drives cgroup placement, network setup,
//! lifecycle hooks, seccomp-fd passing, and virtualizer registration in a
//! strict order, and rolls everything back if any step fails.
//!
//! [`InitLaunch`] starts a new container; [`SetnsLaunch`] launches a
//! process into an already-running one.

mod child;
mod hooks;
mod init;
mod log_forward;
mod rlimits;
mod setns;
#[cfg(test)]
pub(crate) mod testutil;

pub use init::InitLaunch;
pub use log_forward::LogForwarder;
pub use setns::SetnsLaunch;

use std::path::PathBuf;

use oci_spec::runtime::{LinuxIdMapping, LinuxNamespaceType, PosixRlimit, Spec};
use serde::{Deserialize, Serialize};

use nestbox_shared::errors::SpecError;

use crate::container::OciState;
use crate::network::NetworkConfig;

/// How to start the bootstrapper for one container.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Path to the native bootstrapper binary.
    pub bootstrapper: PathBuf,
    /// Arguments passed to the bootstrapper.
    pub args: Vec<String>,
    /// Container id, used for log attribution.
    pub container_id: String,
}

/// Configuration shipped to the container init process over the sync
/// socket, derived from the converted spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitConfig {
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: PathBuf,
    pub hostname: String,
    pub rootfs: PathBuf,
    pub rlimits: Vec<PosixRlimit>,
    pub networks: Vec<NetworkConfig>,
    pub readonly_paths: Vec<String>,
    pub masked_paths: Vec<String>,
    pub uid_mappings: Vec<LinuxIdMapping>,
    pub gid_mappings: Vec<LinuxIdMapping>,
    /// The container gets a mount namespace of its own.
    pub create_mount_ns: bool,
    /// The container gets a fresh (not inherited) cgroup namespace.
    pub create_cgroup_ns: bool,
    /// OCI state snapshot, refreshed right before the config is sent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_state: Option<OciState>,
}

impl InitConfig {
    /// Derive the init configuration from a converted spec.
    pub fn from_spec(
        spec: &Spec,
        networks: Vec<NetworkConfig>,
    ) -> Result<Self, SpecError> {
        let process = spec.process().as_ref().ok_or(SpecError::NotLinux)?;
        let linux = spec.linux().as_ref().ok_or(SpecError::NotLinux)?;
        let root = spec.root().as_ref().ok_or(SpecError::NotLinux)?;

        let namespaces = linux.namespaces().clone().unwrap_or_default();
        let create_mount_ns = namespaces
            .iter()
            .any(|ns| ns.typ() == LinuxNamespaceType::Mount);
        let create_cgroup_ns = namespaces.iter().any(|ns| {
            ns.typ() == LinuxNamespaceType::Cgroup
                && ns.path().as_ref().is_none_or(|p| p.as_os_str().is_empty())
        });

        Ok(Self {
            args: process.args().clone().unwrap_or_default(),
            env: process.env().clone().unwrap_or_default(),
            cwd: process.cwd().clone(),
            hostname: spec.hostname().clone().unwrap_or_default(),
            rootfs: root.path().clone(),
            rlimits: process.rlimits().clone().unwrap_or_default(),
            networks,
            readonly_paths: linux.readonly_paths().clone().unwrap_or_default(),
            masked_paths: linux.masked_paths().clone().unwrap_or_default(),
            uid_mappings: linux.uid_mappings().clone().unwrap_or_default(),
            gid_mappings: linux.gid_mappings().clone().unwrap_or_default(),
            create_mount_ns,
            create_cgroup_ns,
            spec_state: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oci_spec::runtime::{
        LinuxBuilder, LinuxNamespaceBuilder, ProcessBuilder, RootBuilder, SpecBuilder,
    };

    #[test]
    fn test_from_spec_namespace_flags() {
        let namespaces = vec![
            LinuxNamespaceBuilder::default()
                .typ(LinuxNamespaceType::Mount)
                .build()
                .unwrap(),
            LinuxNamespaceBuilder::default()
                .typ(LinuxNamespaceType::Cgroup)
                .path("/proc/1/ns/cgroup")
                .build()
                .unwrap(),
        ];
        let spec = SpecBuilder::default()
            .root(RootBuilder::default().path("/rootfs").build().unwrap())
            .process(
                ProcessBuilder::default()
                    .args(vec!["/bin/sh".to_string()])
                    .build()
                    .unwrap(),
            )
            .linux(
                LinuxBuilder::default()
                    .namespaces(namespaces)
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();

        let config = InitConfig::from_spec(&spec, Vec::new()).unwrap();
        assert!(config.create_mount_ns);
        // Cgroup namespace path is inherited, so no fresh namespace.
        assert!(!config.create_cgroup_ns);
        assert_eq!(config.args, vec!["/bin/sh".to_string()]);
    }

    #[test]
    fn test_from_spec_fresh_cgroup_ns() {
        let namespaces = vec![
            LinuxNamespaceBuilder::default()
                .typ(LinuxNamespaceType::Cgroup)
                .build()
                .unwrap(),
        ];
        let spec = SpecBuilder::default()
            .root(RootBuilder::default().path("/rootfs").build().unwrap())
            .process(ProcessBuilder::default().build().unwrap())
            .linux(
                LinuxBuilder::default()
                    .namespaces(namespaces)
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();

        let config = InitConfig::from_spec(&spec, Vec::new()).unwrap();
        assert!(config.create_cgroup_ns);
        assert!(!config.create_mount_ns);
    }
}
