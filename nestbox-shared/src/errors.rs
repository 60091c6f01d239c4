//! Hierarchical error types for the nestbox runtime core.
//!
//! Errors are categorized by the subsystem that produced them:
//! - [`SpecError`]: spec validation/conversion failures (user-fixable config)
//! - [`MountError`]: mount planning failures
//! - [`ManagerRpcError`] / [`VirtualizerRpcError`]: external daemon calls
//! - [`CgroupError`]: cgroup manager operations
//! - [`ProtocolError`]: sync-socket protocol violations
//! - [`ChildExitError`]: bootstrapper exit failures
//!
//! Launch-pipeline errors additionally carry the name of the failed phase
//! via [`NestboxError::Launch`].

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type NestboxResult<T> = Result<T, NestboxError>;

// ============================================================================
// Top-Level Error
// ============================================================================

/// Errors surfaced by the runtime core.
#[derive(Debug, Error)]
pub enum NestboxError {
    /// Invalid or unsupported container spec.
    #[error("invalid or unsupported container spec: {0}")]
    Spec(#[from] SpecError),

    /// Invalid mount configuration.
    #[error("invalid mount config: {0}")]
    Mount(#[from] MountError),

    /// Manager daemon call failed.
    #[error("manager rpc: {0}")]
    ManagerRpc(#[from] ManagerRpcError),

    /// Filesystem-virtualizer daemon call failed.
    #[error("virtualizer rpc: {0}")]
    VirtualizerRpc(#[from] VirtualizerRpcError),

    /// Cgroup manager operation failed.
    #[error("cgroup: {0}")]
    Cgroup(#[from] CgroupError),

    /// Sync-socket protocol violation.
    #[error("sync protocol: {0}")]
    Protocol(#[from] ProtocolError),

    /// Bootstrapper exited abnormally.
    #[error("{0}")]
    ChildExit(#[from] ChildExitError),

    /// A launch phase failed; `phase` names the step for the user.
    #[error("{phase}: {source}")]
    Launch {
        phase: &'static str,
        #[source]
        source: Box<NestboxError>,
    },

    /// A lifecycle hook failed.
    #[error("hook {path}: {reason}")]
    Hook { path: String, reason: String },

    /// Generic IO error (catch-all).
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl NestboxError {
    /// Wrap an error with the launch phase it occurred in.
    pub fn in_phase(self, phase: &'static str) -> Self {
        NestboxError::Launch {
            phase,
            source: Box::new(self),
        }
    }
}

/// Extension trait attaching a launch-phase name to a result.
pub trait PhaseContext<T> {
    fn phase(self, phase: &'static str) -> NestboxResult<T>;
}

impl<T, E: Into<NestboxError>> PhaseContext<T> for Result<T, E> {
    fn phase(self, phase: &'static str) -> NestboxResult<T> {
        self.map_err(|e| e.into().in_phase(phase))
    }
}

// ============================================================================
// Spec Errors (conversion/validation, user-fixable)
// ============================================================================

/// Errors detected while converting a container spec.
#[derive(Debug, Error)]
pub enum SpecError {
    /// Spec has no root or linux section.
    #[error("not a linux container spec")]
    NotLinux,

    /// One or more required namespaces are missing.
    #[error("container spec missing namespaces {0:?}")]
    MissingNamespaces(Vec<String>),

    /// Uid/gid mappings do not meet system-container requirements.
    #[error("invalid user-ns ID mapping: {0}")]
    BadMapping(String),

    /// User-ns mappings absent where required.
    #[error("container spec has no user-ns uid/gid mappings")]
    NoUserNsMapping,

    /// The container's network namespace is shared with the host.
    #[error(
        "system containers can't share a network namespace with the host \
         (they rely on the user namespace for isolation)"
    )]
    HostNsShared,

    /// Seccomp default action is not one of allow, errno, kill.
    #[error("seccomp default action {0} is not supported (only allow, errno, and kill are)")]
    DefaultSeccompAction(String),

    /// A filesystem stat required by conversion failed.
    #[error("stat {path}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Constructing a spec object failed.
    #[error("building spec object: {0}")]
    Build(String),
}

impl SpecError {
    /// Create a stat error.
    pub fn stat(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Stat {
            path: path.into(),
            source,
        }
    }
}

// ============================================================================
// Mount Errors
// ============================================================================

/// Errors produced by the mount planner.
#[derive(Debug, Error)]
pub enum MountError {
    /// The host kernel release could not be determined.
    #[error("reading kernel release: {0}")]
    KernelRelease(#[source] io::Error),

    /// Setting up a special container directory failed.
    #[error("setting up special dir {dest}: {source}")]
    SpecialDir {
        dest: String,
        #[source]
        source: ManagerRpcError,
    },

    /// A stat during mount planning failed.
    #[error("stat {path}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A manager call made on behalf of the mount planner failed.
    #[error("manager rpc: {0}")]
    Rpc(#[source] ManagerRpcError),
}

// ============================================================================
// RPC Errors (manager + virtualizer daemons)
// ============================================================================

/// A manager daemon operation failed.
#[derive(Debug, Error)]
#[error("{op}: {source}")]
pub struct ManagerRpcError {
    pub op: &'static str,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync>,
}

impl ManagerRpcError {
    pub fn new(
        op: &'static str,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            op,
            source: source.into(),
        }
    }
}

/// A filesystem-virtualizer daemon operation failed.
#[derive(Debug, Error)]
#[error("{op}: {source}")]
pub struct VirtualizerRpcError {
    pub op: &'static str,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync>,
}

impl VirtualizerRpcError {
    pub fn new(
        op: &'static str,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            op,
            source: source.into(),
        }
    }
}

// ============================================================================
// Cgroup Errors
// ============================================================================

/// Errors from the cgroup manager and cgroup placement helpers.
#[derive(Debug, Error)]
pub enum CgroupError {
    #[error("applying cgroup: {0}")]
    Apply(#[source] io::Error),

    #[error("setting cgroup config: {0}")]
    Set(#[source] io::Error),

    #[error("entering cgroup {path}: {source}")]
    Enter {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("creating child cgroup: {0}")]
    CreateChild(#[source] io::Error),

    #[error("cgroup v2 unified fallback: {0}")]
    UnifiedFallback(#[source] io::Error),

    #[error("destroying cgroup: {0}")]
    Destroy(#[source] io::Error),
}

impl CgroupError {
    /// True if the underlying failure was EBUSY.
    ///
    /// Under cgroup v2 with nesting and domain controllers, entering a pid
    /// into a cgroup can fail with EBUSY and must fall back to joining the
    /// init process's cgroup.
    pub fn is_busy(&self) -> bool {
        let source = match self {
            CgroupError::Apply(e)
            | CgroupError::Set(e)
            | CgroupError::CreateChild(e)
            | CgroupError::UnifiedFallback(e)
            | CgroupError::Destroy(e) => e,
            CgroupError::Enter { source, .. } => source,
        };
        source.raw_os_error() == Some(16) // EBUSY
    }
}

// ============================================================================
// Protocol Errors (sync socket)
// ============================================================================

/// Sync-socket protocol violations.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The child sent a message type the current state cannot accept.
    #[error("unexpected sync message {0:?}")]
    UnexpectedType(String),

    /// A frame payload failed to decode.
    #[error("decoding sync payload: {0}")]
    Decode(#[from] serde_json::Error),

    /// The socket closed mid-frame or before a required message.
    #[error("sync socket closed unexpectedly")]
    ShortRead,

    /// The child never reported ready; the launch cannot complete.
    #[error("container init never signalled readiness")]
    MissingProcReady,

    /// The child created a mount namespace but never ran the hook exchange.
    #[error("could not synchronise after prestart/create-runtime hooks")]
    MissingResume,

    /// IO error on the sync socket.
    #[error("sync socket io: {0}")]
    Io(#[from] io::Error),
}

// ============================================================================
// Child Exit Errors
// ============================================================================

/// The bootstrapper exited abnormally during a launch phase.
#[derive(Debug, Error)]
#[error("bootstrapper exited with status {status} while {phase}")]
pub struct ChildExitError {
    pub status: i32,
    pub phase: &'static str,
}
