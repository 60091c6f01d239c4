//! Container-side collaborator surface.
//!
//! The launch pipeline drives the container object owned by the embedding
//! runtime: it asks for the current OCI state (for hooks), records the
//! created timestamp, and delegates privileged side-operations and seccomp
//! fd installation requested by the child.

use std::collections::HashMap;
use std::os::fd::OwnedFd;

use chrono::{DateTime, Utc};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use nestbox_shared::errors::NestboxResult;

/// OCI runtime-spec container status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Container is being created.
    Creating,
    /// Container has been created but not started.
    Created,
    /// Container is running.
    Running,
    /// Container has stopped.
    Stopped,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// OCI runtime-spec container state, as passed to lifecycle hooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciState {
    /// OCI version of the state schema.
    pub oci_version: String,
    /// Container ID.
    pub id: String,
    /// Container status.
    pub status: ContainerStatus,
    /// Process ID of the container init (if known).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    /// Absolute path to the bundle directory.
    pub bundle: String,
    /// Annotations from the container config.
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

/// A privileged side-operation requested by the child over the sync socket
/// (e.g., a mount it cannot perform itself). Interpretation is up to the
/// container object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpRequest {
    pub op: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Facts recorded when the launch reaches the created state.
#[derive(Debug, Clone, Copy)]
pub struct CreatedRecord {
    pub created_at: DateTime<Utc>,
    pub init_pid: Pid,
    /// Start time of the init process in clock ticks, read from procfs;
    /// used to detect pid reuse later.
    pub init_start_time: u64,
}

/// The container object the launch pipeline reports into.
pub trait ContainerOps: Send {
    /// Current OCI state of the container.
    fn oci_state(&mut self) -> NestboxResult<OciState>;

    /// Record the created timestamp and init pid, transition the container
    /// to `Created`, and persist its state. Persisting must happen before
    /// the child is released so a killed parent can still be cleaned up.
    fn mark_created(&mut self, record: CreatedRecord) -> NestboxResult<()>;

    /// Execute privileged side-operations on behalf of the child.
    fn handle_ops(&mut self, init_pid: Pid, reqs: Vec<OpRequest>) -> NestboxResult<()>;

    /// Install a seccomp-notify fd received from the child.
    fn install_seccomp_fd(&mut self, init_pid: Pid, fd: OwnedFd) -> NestboxResult<()>;
}
