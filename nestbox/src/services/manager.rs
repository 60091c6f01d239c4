//! Manager daemon client.
//!
//! The manager hands out contiguous subuid/subgid ranges and prepares host
//! directories that back "special" container paths such as
//! `/var/lib/docker`. It can also force a shared user namespace and shared
//! id mappings on a container so it can pair with a peer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use oci_spec::runtime::{LinuxIdMapping, Mount};

use nestbox_shared::errors::ManagerRpcError;

/// Kinds of host-backed special directories the manager can provision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MountKind {
    VarLibDocker,
    VarLibKubelet,
    VarLibK3s,
    VarLibContainerdOverlayfs,
}

/// A user-supplied bind source the manager must prepare (chown to the
/// container's host uid/gid).
#[derive(Debug, Clone)]
pub struct MountPrep {
    pub source: PathBuf,
    /// The source is used by this container only.
    pub exclusive: bool,
}

/// A backing-directory request for a special destination.
#[derive(Debug, Clone)]
pub struct MountReq {
    pub kind: MountKind,
    pub dest: PathBuf,
}

/// Operations the runtime invokes on the manager daemon.
pub trait ManagerRpc: Send + Sync {
    /// Allocate a contiguous subuid/subgid range of `size` ids.
    /// Returns the first host uid and gid of the range.
    fn req_subid(&self, size: u32) -> Result<(u32, u32), ManagerRpcError>;

    /// Prepare user-supplied bind sources (ownership adjustment).
    fn prep_mounts(
        &self,
        uid: u32,
        gid: u32,
        shift_uids: bool,
        prep: &[MountPrep],
    ) -> Result<(), ManagerRpcError>;

    /// Provision backing directories for `reqs` and return the mounts to
    /// append to the container spec (possibly more than requested).
    fn req_mounts(
        &self,
        rootfs: &Path,
        uid: u32,
        gid: u32,
        shift_uids: bool,
        reqs: &[MountReq],
    ) -> Result<Vec<Mount>, ManagerRpcError>;
}

/// Per-container configuration pushed down by the manager.
#[derive(Debug, Clone, Default)]
pub struct ManagerConfig {
    /// Override path for the container's user namespace (set when the
    /// container shares a userns with a peer).
    pub userns_path: Option<PathBuf>,

    /// Override uid mappings (shared-userns case); honored verbatim.
    pub uid_mappings: Vec<LinuxIdMapping>,

    /// Override gid mappings (shared-userns case); honored verbatim.
    pub gid_mappings: Vec<LinuxIdMapping>,
}

/// Handle to the manager daemon; may be disabled, in which case compiled
/// defaults are used where possible.
#[derive(Clone)]
pub struct Manager {
    config: ManagerConfig,
    rpc: Option<Arc<dyn ManagerRpc>>,
}

impl Manager {
    pub fn new(config: ManagerConfig, rpc: Arc<dyn ManagerRpc>) -> Self {
        Self {
            config,
            rpc: Some(rpc),
        }
    }

    /// A manager handle with no daemon behind it.
    pub fn disabled() -> Self {
        Self {
            config: ManagerConfig::default(),
            rpc: None,
        }
    }

    pub fn enabled(&self) -> bool {
        self.rpc.is_some()
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// The RPC surface; callers must check [`Manager::enabled`] first.
    pub fn rpc(&self) -> Option<&dyn ManagerRpc> {
        self.rpc.as_deref()
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("config", &self.config)
            .field("enabled", &self.enabled())
            .finish()
    }
}
