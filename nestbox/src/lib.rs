//! Nestbox runtime core.
//!
//! Nestbox turns an ordinary OCI container configuration into a hardened
//! "system container" configuration able to run init systems and nested
//! container engines inside an unprivileged user namespace, then launches
//! the container's init process through a synchronized handshake with a
//! native bootstrapper.
//!
//! The two halves of the crate:
//!
//! - [`spec`]: the conversion pipeline. Normalizes namespaces, allocates and
//!   validates uid/gid mappings, injects the required mount set, reconciles
//!   masked/readonly paths, capabilities, and seccomp profiles.
//! - [`launch`]: the parent-side launch state machine. Drives the
//!   bootstrapper over a sync socket, coordinates cgroup placement, hooks,
//!   seccomp-fd passing, and registration with the filesystem virtualizer.
//!
//! External daemons (the manager that issues subid ranges and backing
//! mounts, and the filesystem virtualizer that serves `/proc` and `/sys`
//! views) are consumed through the traits in [`services`].

pub mod cgroups;
pub mod container;
pub mod launch;
pub mod network;
pub mod rdt;
pub mod services;
pub mod spec;
pub mod util;

pub use container::{ContainerOps, ContainerStatus, OciState, OpRequest};
pub use launch::{InitConfig, InitLaunch, LaunchConfig, SetnsLaunch};
pub use services::manager::{Manager, ManagerConfig, ManagerRpc};
pub use services::virtualizer::{Registrar, Registration, Virtualizer, VirtualizerRpc};
pub use spec::{ConvertOutcome, SpecConverter};

pub use nestbox_shared::errors::{NestboxError, NestboxResult};
