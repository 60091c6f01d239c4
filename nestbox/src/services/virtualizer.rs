//! Filesystem-virtualizer daemon client.
//!
//! The virtualizer serves per-container views of selected `/proc` and `/sys`
//! files from a subtree under its mountpoint. The converter bind-mounts
//! those files into the container; the launch pipeline registers the
//! container once its rootfs is ready so the daemon starts servicing it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use nestbox_shared::errors::{NestboxResult, VirtualizerRpcError};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use crate::launch::InitConfig;

/// Registration record attaching a container to the virtualization tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub hostname: String,
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
    pub id_size: u32,
    /// Read-only paths under `/proc` the daemon must emulate.
    pub proc_ro_paths: Vec<String>,
    /// Masked paths under `/proc` the daemon must emulate.
    pub proc_mask_paths: Vec<String>,
}

/// Operations the runtime invokes on the virtualizer daemon.
pub trait VirtualizerRpc: Send + Sync {
    fn register(&self, info: &Registration) -> Result<(), VirtualizerRpcError>;
}

/// Handle to the filesystem virtualizer for one container.
#[derive(Clone)]
pub struct Virtualizer {
    mountpoint: PathBuf,
    id: String,
    rpc: Option<Arc<dyn VirtualizerRpc>>,
}

impl Virtualizer {
    pub fn new(mountpoint: PathBuf, id: String, rpc: Arc<dyn VirtualizerRpc>) -> Self {
        Self {
            mountpoint,
            id,
            rpc: Some(rpc),
        }
    }

    /// A virtualizer handle with no daemon behind it; the container gets
    /// plain proc/sys mounts only.
    pub fn disabled() -> Self {
        Self {
            mountpoint: PathBuf::new(),
            id: String::new(),
            rpc: None,
        }
    }

    pub fn enabled(&self) -> bool {
        self.rpc.is_some()
    }

    /// Mountpoint of the virtualizer on the host.
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Container id within the virtualization tree.
    pub fn id(&self) -> &str {
        &self.id
    }

    fn rpc(&self) -> Option<&dyn VirtualizerRpc> {
        self.rpc.as_deref()
    }
}

impl std::fmt::Debug for Virtualizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Virtualizer")
            .field("mountpoint", &self.mountpoint)
            .field("id", &self.id)
            .field("enabled", &self.enabled())
            .finish()
    }
}

/// Registers a launched container with the filesystem virtualizer.
///
/// Registration happens after the child reports its rootfs ready and before
/// the prestart hooks run, so the daemon can answer by the time the hooks
/// (and later the workload) touch `/proc`.
pub struct Registrar<'a> {
    vfs: &'a Virtualizer,
}

impl<'a> Registrar<'a> {
    pub fn new(vfs: &'a Virtualizer) -> Self {
        Self { vfs }
    }

    pub fn enabled(&self) -> bool {
        self.vfs.enabled()
    }

    /// Attach the container to the virtualization tree.
    ///
    /// Only the `/proc`-prefixed subset of the readonly and masked path
    /// lists is forwarded; everything else is handled with plain bind
    /// mounts by the bootstrapper.
    pub fn register(&self, config: &InitConfig, init_pid: Pid) -> NestboxResult<()> {
        let Some(rpc) = self.vfs.rpc() else {
            return Ok(());
        };

        let proc_paths = |paths: &[String]| -> Vec<String> {
            paths
                .iter()
                .filter(|p| p.starts_with("/proc"))
                .cloned()
                .collect()
        };

        let (uid, gid, id_size) = match (config.uid_mappings.first(), config.gid_mappings.first()) {
            (Some(u), Some(g)) => (u.host_id(), g.host_id(), u.size()),
            _ => (0, 0, 0),
        };

        let info = Registration {
            hostname: config.hostname.clone(),
            pid: init_pid.as_raw(),
            uid,
            gid,
            id_size,
            proc_ro_paths: proc_paths(&config.readonly_paths),
            proc_mask_paths: proc_paths(&config.masked_paths),
        };

        tracing::debug!(
            pid = info.pid,
            uid = info.uid,
            gid = info.gid,
            "registering container with filesystem virtualizer"
        );

        rpc.register(&info)?;
        Ok(())
    }
}
