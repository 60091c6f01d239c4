//! Shared mocks and fixtures for launch-protocol tests.

use std::os::fd::OwnedFd;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};

use nix::unistd::Pid;

use nestbox_shared::errors::{CgroupError, NestboxResult, VirtualizerRpcError};

use crate::cgroups::{CgroupKind, CgroupManager};
use crate::container::{ContainerOps, ContainerStatus, CreatedRecord, OciState, OpRequest};
use crate::services::virtualizer::{Registration, Virtualizer, VirtualizerRpc};

use super::{InitConfig, LaunchConfig};

/// Cgroup manager that records its call sequence.
pub(crate) struct MockCgroup {
    kind: CgroupKind,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockCgroup {
    pub(crate) fn new(kind: CgroupKind) -> Self {
        Self {
            kind,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl CgroupManager for MockCgroup {
    fn apply(&mut self, pid: Pid) -> Result<(), CgroupError> {
        self.record(format!("apply:{pid}"));
        Ok(())
    }

    fn set(&mut self) -> Result<(), CgroupError> {
        self.record("set".to_string());
        Ok(())
    }

    fn create_child_cgroup(&mut self) -> Result<(), CgroupError> {
        self.record("create_child".to_string());
        Ok(())
    }

    fn apply_child_cgroup(&mut self, pid: Pid) -> Result<(), CgroupError> {
        self.record(format!("apply_child:{pid}"));
        Ok(())
    }

    fn kind(&self) -> CgroupKind {
        self.kind
    }

    fn destroy(&mut self) -> Result<(), CgroupError> {
        self.record("destroy".to_string());
        Ok(())
    }
}

/// Container object that records state changes and received resources.
#[derive(Default)]
pub(crate) struct MockContainer {
    pub(crate) created: Option<CreatedRecord>,
    pub(crate) ops: Vec<OpRequest>,
    pub(crate) seccomp_fds: Vec<OwnedFd>,
}

impl ContainerOps for MockContainer {
    fn oci_state(&mut self) -> NestboxResult<OciState> {
        Ok(OciState {
            oci_version: "1.0.2".to_string(),
            id: "test-container".to_string(),
            status: if self.created.is_some() {
                ContainerStatus::Created
            } else {
                ContainerStatus::Creating
            },
            pid: None,
            bundle: "/bundles/test-container".to_string(),
            annotations: Default::default(),
        })
    }

    fn mark_created(&mut self, record: CreatedRecord) -> NestboxResult<()> {
        self.created = Some(record);
        Ok(())
    }

    fn handle_ops(&mut self, _init_pid: Pid, reqs: Vec<OpRequest>) -> NestboxResult<()> {
        self.ops.extend(reqs);
        Ok(())
    }

    fn install_seccomp_fd(&mut self, _init_pid: Pid, fd: OwnedFd) -> NestboxResult<()> {
        self.seccomp_fds.push(fd);
        Ok(())
    }
}

struct RecordingVfsRpc {
    registrations: Arc<Mutex<Vec<Registration>>>,
}

impl VirtualizerRpc for RecordingVfsRpc {
    fn register(&self, info: &Registration) -> Result<(), VirtualizerRpcError> {
        self.registrations.lock().unwrap().push(info.clone());
        Ok(())
    }
}

/// An enabled virtualizer whose registrations land in the returned vec.
pub(crate) fn fake_virtualizer() -> (Virtualizer, Arc<Mutex<Vec<Registration>>>) {
    let registrations = Arc::new(Mutex::new(Vec::new()));
    let vfs = Virtualizer::new(
        "/var/lib/nestbox-vfs".into(),
        "test-container".to_string(),
        Arc::new(RecordingVfsRpc {
            registrations: Arc::clone(&registrations),
        }),
    );
    (vfs, registrations)
}

pub(crate) fn test_config(rootfs: &Path) -> InitConfig {
    InitConfig {
        args: vec!["/bin/sh".to_string()],
        env: vec!["PATH=/bin:/usr/bin".to_string()],
        cwd: "/".into(),
        hostname: "testbox".to_string(),
        rootfs: rootfs.to_path_buf(),
        rlimits: Vec::new(),
        networks: Vec::new(),
        readonly_paths: vec!["/proc/sys".to_string(), "/etc".to_string()],
        masked_paths: vec!["/proc/keys".to_string()],
        uid_mappings: Vec::new(),
        gid_mappings: Vec::new(),
        create_mount_ns: false,
        create_cgroup_ns: false,
        spec_state: None,
    }
}

pub(crate) fn test_launch_config() -> LaunchConfig {
    LaunchConfig {
        bootstrapper: "/proc/self/exe".into(),
        args: Vec::new(),
        container_id: "test-container".to_string(),
    }
}

/// A real process that exits immediately and successfully; stands in for a
/// bootstrapper that has already handed off.
pub(crate) fn spawn_true() -> Child {
    Command::new("/bin/true")
        .stdin(Stdio::null())
        .spawn()
        .expect("spawn /bin/true")
}

/// A real process that stays alive; stands in for the container init. The
/// test (or the rollback under test) is responsible for killing it.
pub(crate) fn spawn_sleeper() -> Child {
    Command::new("/bin/sleep")
        .arg("60")
        .stdin(Stdio::null())
        .spawn()
        .expect("spawn /bin/sleep")
}
