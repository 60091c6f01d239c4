//! Setns launch: starting a process inside a running container.
//!
//! A reduced variant of the init launch. The bootstrapper joins the
//! existing namespaces, forks, reports the final pid, and exits; the parent
//! places the new pid in the container's cgroups (with the v2 unified
//! EBUSY fallback), applies rlimits and RDT, sends the config, and serves a
//! sync loop that only ever sees a seccomp-fd exchange.

use std::collections::HashMap;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::Child;

use nix::sys::signal::{Signal, kill};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;

use nestbox_shared::errors::{
    ChildExitError, NestboxError, NestboxResult, PhaseContext, ProtocolError,
};
use nestbox_shared::sync::{self, ReportedPids, SyncType};

use crate::cgroups;
use crate::container::ContainerOps;

use super::log_forward::LogForwarder;
use super::{InitConfig, LaunchConfig, child, rlimits};

/// Parent side of an exec-into-container launch.
pub struct SetnsLaunch<'a> {
    container: &'a mut dyn ContainerOps,
    /// Cgroup directories of the running container, per subsystem.
    cgroup_paths: HashMap<String, PathBuf>,
    /// Pid of the container's init process; its cgroup is the fallback
    /// placement target under cgroup v2 nesting.
    init_pid: Pid,
    /// Resctrl group directory, when the container has RDT config.
    rdt_path: Option<PathBuf>,
    config: InitConfig,
    launch: LaunchConfig,
    bootstrap_data: Vec<u8>,
    proc_pid: Option<Pid>,
    /// Held for the life of the launch so the reader thread keeps draining.
    #[allow(dead_code)]
    log_forwarder: Option<LogForwarder>,
}

impl<'a> SetnsLaunch<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        container: &'a mut dyn ContainerOps,
        cgroup_paths: HashMap<String, PathBuf>,
        init_pid: Pid,
        rdt_path: Option<PathBuf>,
        config: InitConfig,
        launch: LaunchConfig,
        bootstrap_data: Vec<u8>,
    ) -> Self {
        Self {
            container,
            cgroup_paths,
            init_pid,
            rdt_path,
            config,
            launch,
            bootstrap_data,
            proc_pid: None,
            log_forwarder: None,
        }
    }

    /// Pid of the launched process, once known.
    pub fn pid(&self) -> Option<Pid> {
        self.proc_pid
    }

    /// Run the launch to completion; returns the pid of the new process
    /// inside the container.
    pub fn start(&mut self) -> NestboxResult<Pid> {
        let sockets = child::sync_socketpair().phase("creating sync socket pair")?;
        let (log_read, log_write) = child::log_pipe().phase("creating log pipe")?;

        let bootstrapper = child::spawn_bootstrapper(&self.launch, &sockets.child, &log_write)
            .phase("starting setns bootstrapper")?;

        drop(sockets.child);
        drop(log_write);

        self.log_forwarder = Some(
            LogForwarder::spawn(log_read, &self.launch.container_id)
                .phase("starting log forwarder")?,
        );

        self.launch_inner(sockets.parent, bootstrapper)
    }

    pub(crate) fn launch_inner(
        &mut self,
        mut sock: UnixStream,
        mut bootstrapper: Child,
    ) -> NestboxResult<Pid> {
        match self.run(&mut sock, &mut bootstrapper) {
            Ok(pid) => Ok(pid),
            Err(e) => {
                tracing::warn!(
                    container_id = %self.launch.container_id,
                    error = %e,
                    "setns launch failed, rolling back"
                );
                self.rollback(&mut bootstrapper);
                Err(e)
            }
        }
    }

    fn run(&mut self, sock: &mut UnixStream, bootstrapper: &mut Child) -> NestboxResult<Pid> {
        sock.write_all(&self.bootstrap_data)
            .phase("copying bootstrap data to sync socket")?;

        // The bootstrapper forks the target process and exits once the
        // namespace transitions are done.
        let status = bootstrapper.wait().map_err(NestboxError::Io)?;
        if !status.success() {
            return Err(ChildExitError {
                status: status.code().unwrap_or(-1),
                phase: "entering namespaces",
            }
            .into());
        }

        let pids: ReportedPids = sync::read_payload(sock)
            .phase("reading pid from sync socket")?
            .ok_or(ProtocolError::ShortRead)?;
        let _ = waitpid(Pid::from_raw(pids.first_child), None);
        let pid = Pid::from_raw(pids.pid);
        self.proc_pid = Some(pid);

        self.enter_cgroups(pid)?;

        if let Some(rdt_path) = &self.rdt_path
            && rdt_path.exists()
        {
            let tasks = rdt_path.join("tasks");
            std::fs::write(&tasks, pid.to_string())
                .phase("adding pid to Intel RDT resource control filesystem")?;
        }

        rlimits::apply(pid, &self.config.rlimits).phase("setting rlimits for process")?;

        sync::write_payload(sock, &self.config).phase("sending config to process")?;

        self.sync_loop(sock, pid)?;

        Ok(pid)
    }

    /// Place the new pid in the container's cgroups. Under cgroup v2 with
    /// nesting and domain controllers direct entry can fail with EBUSY; the
    /// pid then joins the init process's own cgroup instead. This is the
    /// only local recovery in the launch pipeline.
    fn enter_cgroups(&self, pid: Pid) -> NestboxResult<()> {
        if self.cgroup_paths.is_empty() {
            return Ok(());
        }

        let Err(e) = cgroups::enter_pid(&self.cgroup_paths, pid) else {
            return Ok(());
        };

        if e.is_busy() && cgroups::is_unified_hierarchy() {
            // Joining may still fail: the init cgroup dir is not guaranteed
            // to exist since the container was never paused.
            cgroups::join_process_cgroup(self.init_pid, pid)
                .phase("adding pid to init process cgroup")?;
            return Ok(());
        }

        Err(NestboxError::from(e).in_phase("adding pid to cgroups"))
    }

    /// Serve the reduced sync loop. A setns child performs no rootfs or
    /// hook phases; anything but a seccomp-fd exchange is a protocol
    /// violation.
    fn sync_loop(&mut self, sock: &mut UnixStream, pid: Pid) -> NestboxResult<()> {
        let mut loop_err: Option<NestboxError> = None;

        loop {
            match sync::read_sync(sock) {
                Ok(Some(msg)) => {
                    if let Err(e) = self.handle_sync(sock, pid, msg.typ) {
                        loop_err = Some(e);
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    loop_err = Some(e.into());
                    break;
                }
            }
        }

        sock.shutdown(std::net::Shutdown::Write)
            .phase("shutting down sync socket")?;

        if let Some(e) = loop_err {
            let _ = waitpid(pid, None);
            return Err(e);
        }
        Ok(())
    }

    fn handle_sync(
        &mut self,
        sock: &mut UnixStream,
        pid: Pid,
        typ: SyncType,
    ) -> NestboxResult<()> {
        match typ {
            SyncType::ProcFd => {
                sync::write_sync(sock, SyncType::SendFd)?;
                let fd = child::recv_seccomp_fd(sock).phase("receiving seccomp fd")?;
                self.container
                    .install_seccomp_fd(pid, fd)
                    .phase("processing seccomp fd")?;
                sync::write_sync(sock, SyncType::ProcFdDone)?;
                Ok(())
            }
            other => Err(ProtocolError::UnexpectedType(format!("{other:?} in setns")).into()),
        }
    }

    fn rollback(&mut self, bootstrapper: &mut Child) {
        if let Some(pid) = self.proc_pid {
            let _ = kill(pid, Signal::SIGKILL);
            let _ = waitpid(pid, None);
        }
        let _ = bootstrapper.kill();
        let _ = bootstrapper.wait();
    }
}
