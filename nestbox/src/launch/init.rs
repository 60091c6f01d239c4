//! Init launch: starting a new container's init process.
//!
//! The parent walks a fixed sequence: spawn the bootstrapper, place it in
//! the container's cgroup, feed it the bootstrap blob, learn the final init
//! pid, reap the intermediate fork, then serve the child's sync messages
//! until it acknowledges the run order. Any failure kills the child tree
//! and destroys the cgroup/RDT state created so far.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::process::Child;

use chrono::Utc;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use oci_spec::runtime::Hooks;

use nestbox_shared::constants::sync::CREATE_CGROUP_NS;
use nestbox_shared::errors::{
    ChildExitError, NestboxError, NestboxResult, PhaseContext, ProtocolError,
};
use nestbox_shared::sync::{self, ReportedPids, SyncType};

use crate::cgroups::CgroupManager;
use crate::container::{ContainerOps, ContainerStatus, CreatedRecord, OpRequest};
use crate::network;
use crate::rdt::RdtManager;
use crate::services::virtualizer::{Registrar, Virtualizer};

use super::log_forward::LogForwarder;
use super::{InitConfig, LaunchConfig, child, hooks, rlimits};

/// Parent side of a new-container launch.
pub struct InitLaunch<'a> {
    container: &'a mut dyn ContainerOps,
    cgroup: &'a mut dyn CgroupManager,
    rdt: Option<&'a mut dyn RdtManager>,
    registrar: Registrar<'a>,
    config: InitConfig,
    hooks: Option<Hooks>,
    launch: LaunchConfig,
    bootstrap_data: Vec<u8>,
    init_pid: Option<Pid>,
    stdio_fds: Vec<String>,
    /// Held for the life of the launch so the reader thread keeps draining.
    #[allow(dead_code)]
    log_forwarder: Option<LogForwarder>,
}

impl<'a> InitLaunch<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        container: &'a mut dyn ContainerOps,
        cgroup: &'a mut dyn CgroupManager,
        rdt: Option<&'a mut dyn RdtManager>,
        virtualizer: &'a Virtualizer,
        config: InitConfig,
        hooks: Option<Hooks>,
        launch: LaunchConfig,
        bootstrap_data: Vec<u8>,
    ) -> Self {
        Self {
            container,
            cgroup,
            rdt,
            registrar: Registrar::new(virtualizer),
            config,
            hooks,
            launch,
            bootstrap_data,
            init_pid: None,
            stdio_fds: Vec::new(),
            log_forwarder: None,
        }
    }

    /// Pid of the container's init process, once known.
    pub fn pid(&self) -> Option<Pid> {
        self.init_pid
    }

    /// Resolved stdio descriptor targets of the init process, captured
    /// before the container can move them (needed at checkpoint time).
    pub fn stdio_fds(&self) -> &[String] {
        &self.stdio_fds
    }

    /// Run the launch to completion. On success the container is in the
    /// `Created` state and the returned pid is its init process.
    pub fn start(&mut self) -> NestboxResult<Pid> {
        let sockets = child::sync_socketpair().phase("creating sync socket pair")?;
        let (log_read, log_write) = child::log_pipe().phase("creating log pipe")?;

        let bootstrapper = child::spawn_bootstrapper(&self.launch, &sockets.child, &log_write)
            .phase("starting bootstrapper")?;

        // The child-side descriptors belong to the bootstrapper now.
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
                    "launch failed, rolling back"
                );
                self.rollback(&mut bootstrapper);
                Err(e)
            }
        }
    }

    fn run(&mut self, sock: &mut UnixStream, bootstrapper: &mut Child) -> NestboxResult<Pid> {
        let boot_pid = Pid::from_raw(bootstrapper.id() as i32);

        // Cgroup first, so no child can escape it.
        self.cgroup
            .apply(boot_pid)
            .phase("applying cgroup configuration for process")?;

        // Resources are set before the child cgroup exists so it inherits
        // them, and before the prestart hooks so they can apply cgroup
        // permissions.
        self.cgroup
            .set()
            .phase("setting cgroup config for process")?;

        let cg_kind = self.cgroup.kind();
        if cg_kind.is_v1() {
            self.cgroup
                .create_child_cgroup()
                .phase("creating container child cgroup")?;
        }

        setup_dev_subdir(&self.config.rootfs).phase("setting up dev subdir under rootfs")?;

        if let Some(rdt) = self.rdt.as_deref_mut() {
            rdt.apply(boot_pid)
                .phase("applying Intel RDT configuration for process")?;
        }

        sock.write_all(&self.bootstrap_data)
            .phase("copying bootstrap data to sync socket")?;

        let init_pid = self
            .await_child_pid(sock)
            .phase("reading init pid from sync socket")?;
        self.init_pid = Some(init_pid);

        // Capture stdio targets now; the container may dup2 them away.
        self.stdio_fds =
            stdio_fds(init_pid).phase("getting stdio descriptors for init process")?;

        if cg_kind.is_v1() {
            self.cgroup
                .apply_child_cgroup(init_pid)
                .phase("applying child cgroup configuration for process")?;
        }

        if let Some(rdt) = self.rdt.as_deref_mut() {
            rdt.apply(init_pid)
                .phase("applying Intel RDT configuration for init process")?;
        }

        // Unblock the child's cgroup-namespace unshare.
        if self.config.create_cgroup_ns {
            sock.write_all(&[CREATE_CGROUP_NS])
                .phase("sending cgroup namespace sync byte")?;
        }

        wait_bootstrapper_exit(bootstrapper).phase("waiting on bootstrapper exit")?;

        network::create_interfaces(&self.config.networks, init_pid)
            .phase("creating network interfaces")?;

        // Refresh the state snapshot handed to the child.
        let state = self
            .container
            .oci_state()
            .phase("reading container state")?;
        self.config.spec_state = Some(state);

        sync::write_payload(sock, &self.config).phase("sending config to init process")?;

        self.sync_loop(sock, init_pid)?;

        Ok(init_pid)
    }

    /// Serve child-initiated sync messages until the socket closes.
    fn sync_loop(&mut self, sock: &mut UnixStream, init_pid: Pid) -> NestboxResult<()> {
        let mut sent_run = false;
        let mut sent_resume = false;
        let mut loop_err: Option<NestboxError> = None;

        loop {
            match sync::read_sync(sock) {
                Ok(Some(msg)) => {
                    if let Err(e) =
                        self.handle_sync(sock, init_pid, msg.typ, &mut sent_run, &mut sent_resume)
                    {
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

        if !sent_run {
            let e = loop_err
                .take()
                .unwrap_or_else(|| ProtocolError::MissingProcReady.into());
            return Err(e.in_phase("container init"));
        }
        if self.config.create_mount_ns && !sent_resume && loop_err.is_none() {
            return Err(ProtocolError::MissingResume.into());
        }

        // Half-close our side; the child sees EOF and proceeds to exec.
        sock.shutdown(std::net::Shutdown::Write)
            .phase("shutting down sync socket")?;

        if let Some(e) = loop_err {
            // Reap before surfacing the child's error.
            let _ = waitpid(init_pid, None);
            return Err(e);
        }
        Ok(())
    }

    fn handle_sync(
        &mut self,
        sock: &mut UnixStream,
        init_pid: Pid,
        typ: SyncType,
        sent_run: &mut bool,
        sent_resume: &mut bool,
    ) -> NestboxResult<()> {
        match typ {
            SyncType::ProcReady => {
                // Rlimits are raised from outside: the child loses the
                // privilege once it joins the user namespace.
                rlimits::apply(init_pid, &self.config.rlimits)
                    .phase("setting rlimits for ready process")?;

                // Without a fresh mount namespace there is no rootfs
                // preparation phase, so the hooks run now.
                if !self.config.create_mount_ns {
                    if let Some(rdt) = self.rdt.as_deref_mut() {
                        rdt.set().phase("setting Intel RDT config for ready process")?;
                    }
                    self.run_create_hooks(init_pid)?;
                }

                let record = CreatedRecord {
                    created_at: Utc::now(),
                    init_pid,
                    init_start_time: process_start_time(init_pid)?,
                };
                // State must be stored before the run order goes out, so a
                // parent killed right after can still be cleaned up.
                self.container
                    .mark_created(record)
                    .phase("storing container state")?;

                sync::write_sync(sock, SyncType::ProcRun)?;
                *sent_run = true;
            }
            SyncType::RootfsReady => {
                // On v2 the child cgroup can only be populated once the
                // child has its rootfs in place.
                if self.cgroup.kind().is_v2() {
                    self.cgroup
                        .create_child_cgroup()
                        .phase("creating container child cgroup")?;
                    self.cgroup
                        .apply_child_cgroup(init_pid)
                        .phase("applying child cgroup configuration for process")?;
                }

                // Register after all container mounts exist and before the
                // hooks run, so the virtualizer answers by the time
                // anything touches /proc.
                self.registrar
                    .register(&self.config, init_pid)
                    .phase("registering with filesystem virtualizer")?;

                sync::write_sync(sock, SyncType::RootfsReadyAck)?;
            }
            SyncType::ProcHooks => {
                if let Some(rdt) = self.rdt.as_deref_mut() {
                    rdt.set()
                        .phase("setting Intel RDT config for procHooks process")?;
                }
                self.run_create_hooks(init_pid)?;
                sync::write_sync(sock, SyncType::ProcResume)?;
                *sent_resume = true;
            }
            SyncType::ReqOp => {
                sync::write_sync(sock, SyncType::SendOpInfo)?;
                let reqs: Vec<OpRequest> =
                    sync::read_payload(sock)?.ok_or(ProtocolError::ShortRead)?;
                self.container
                    .handle_ops(init_pid, reqs)
                    .phase("handling child operation request")?;
                sync::write_sync(sock, SyncType::OpDone)?;
            }
            SyncType::ProcFd => {
                sync::write_sync(sock, SyncType::SendFd)?;
                let fd = child::recv_seccomp_fd(sock).phase("receiving seccomp fd")?;
                self.container
                    .install_seccomp_fd(init_pid, fd)
                    .phase("processing seccomp fd")?;
                sync::write_sync(sock, SyncType::ProcFdDone)?;
            }
            other => {
                return Err(ProtocolError::UnexpectedType(format!("{other:?}")).into());
            }
        }
        Ok(())
    }

    /// Run the prestart and create-runtime hooks with the container in the
    /// creating state and the init pid visible to them.
    #[allow(deprecated)] // prestart hooks are deprecated upstream but still honored
    fn run_create_hooks(&mut self, init_pid: Pid) -> NestboxResult<()> {
        let Some(hook_set) = &self.hooks else {
            return Ok(());
        };

        let mut state = self.container.oci_state()?;
        state.pid = Some(init_pid.as_raw());
        state.status = ContainerStatus::Creating;

        if let Some(prestart) = hook_set.prestart() {
            hooks::run_hooks(prestart, &state).phase("running prestart hooks")?;
        }
        if let Some(create_runtime) = hook_set.create_runtime() {
            hooks::run_hooks(create_runtime, &state).phase("running create-runtime hooks")?;
        }
        Ok(())
    }

    /// Read the final pid from the bootstrapper and reap the intermediate
    /// fork it left behind.
    fn await_child_pid(&mut self, sock: &mut UnixStream) -> NestboxResult<Pid> {
        let pids: ReportedPids = sync::read_payload(sock)?.ok_or(ProtocolError::ShortRead)?;
        // The intermediate may already be gone; reaping is best-effort.
        let _ = waitpid(Pid::from_raw(pids.first_child), None);
        Ok(Pid::from_raw(pids.pid))
    }

    /// Kill whatever part of the child tree exists and release cgroup/RDT
    /// allocations.
    fn rollback(&mut self, bootstrapper: &mut Child) {
        if let Some(pid) = self.init_pid {
            let _ = kill(pid, Signal::SIGKILL);
            let _ = waitpid(pid, None);
        }
        let _ = bootstrapper.kill();
        let _ = bootstrapper.wait();

        if let Err(e) = self.cgroup.destroy() {
            tracing::warn!(error = %e, "unable to destroy cgroup after failed launch");
        }
        if let Some(rdt) = self.rdt.as_deref_mut()
            && let Err(e) = rdt.destroy()
        {
            tracing::warn!(error = %e, "unable to destroy RDT group after failed launch");
        }
    }
}

/// Wait for the bootstrapper to exit cleanly after handing off the final
/// pid. From here on the launch owns the grandchild.
fn wait_bootstrapper_exit(bootstrapper: &mut Child) -> NestboxResult<()> {
    let status = bootstrapper.wait().map_err(NestboxError::Io)?;
    if !status.success() {
        return Err(ChildExitError {
            status: status.code().unwrap_or(-1),
            phase: "entering namespaces",
        }
        .into());
    }
    Ok(())
}

/// Resolve the stdio descriptor symlinks of `pid`. Permission errors are
/// skipped (non-dumpable processes).
pub(crate) fn stdio_fds(pid: Pid) -> std::io::Result<Vec<String>> {
    let mut fds = vec![String::new(); 3];
    let dir = format!("/proc/{}/fd", pid.as_raw());
    for (i, slot) in fds.iter_mut().enumerate() {
        match std::fs::read_link(Path::new(&dir).join(i.to_string())) {
            Ok(target) => *slot = target.to_string_lossy().into_owned(),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(fds)
}

/// Make sure `<rootfs>/dev` exists with mode 0755. The init process needs a
/// subdir it can chdir through to observe its own rootfs mounts, and some
/// images (k8s pause) ship without /dev.
fn setup_dev_subdir(rootfs: &Path) -> std::io::Result<()> {
    let dev = rootfs.join("dev");
    if !dev.exists() {
        std::fs::create_dir_all(&dev)?;
        std::fs::set_permissions(&dev, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

/// Start time of `pid` in clock ticks, for pid-reuse detection.
fn process_start_time(pid: Pid) -> NestboxResult<u64> {
    let proc = procfs::process::Process::new(pid.as_raw())
        .map_err(|e| NestboxError::Io(std::io::Error::other(e)))?;
    let stat = proc
        .stat()
        .map_err(|e| NestboxError::Io(std::io::Error::other(e)))?;
    Ok(stat.starttime)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroups::CgroupKind;
    use crate::launch::testutil::{
        MockCgroup, MockContainer, fake_virtualizer, spawn_sleeper, spawn_true, test_config,
        test_launch_config,
    };
    use nestbox_shared::sync::write_payload;
    use oci_spec::runtime::{HookBuilder, HooksBuilder};
    use std::io::Read;
    use std::thread;

    /// Play the child side of the handshake: consume the bootstrap blob,
    /// report pids, consume the config, then run `script`.
    fn fake_child<F>(
        mut sock: UnixStream,
        bootstrap_len: usize,
        reported_pid: i32,
        script: F,
    ) -> thread::JoinHandle<()>
    where
        F: FnOnce(&mut UnixStream) + Send + 'static,
    {
        thread::spawn(move || {
            let mut blob = vec![0u8; bootstrap_len];
            sock.read_exact(&mut blob).unwrap();

            write_payload(
                &mut sock,
                &ReportedPids {
                    pid: reported_pid,
                    first_child: 999_999,
                },
            )
            .unwrap();

            let _config: InitConfig = sync::read_payload(&mut sock).unwrap().unwrap();

            script(&mut sock);
        })
    }

    fn expect_reply(sock: &mut UnixStream, want: SyncType) {
        let got = sync::read_sync(sock).unwrap().unwrap();
        assert_eq!(got.typ, want);
    }

    #[test]
    fn test_launch_protocol_reaches_created() {
        let rootfs = tempfile::tempdir().unwrap();
        let hook_log = rootfs.path().join("hooks.log");
        let hooks = HooksBuilder::default()
            .create_runtime(vec![
                HookBuilder::default()
                    .path("/bin/sh")
                    .args(vec![
                        "sh".to_string(),
                        "-c".to_string(),
                        format!("cat >> {}", hook_log.display()),
                    ])
                    .build()
                    .unwrap(),
            ])
            .build()
            .unwrap();

        let mut container = MockContainer::default();
        let mut cgroup = MockCgroup::new(CgroupKind::V2Fs);
        let (vfs, registrations) = fake_virtualizer();

        let mut config = test_config(rootfs.path());
        config.create_mount_ns = true;

        let sleeper = spawn_sleeper();
        let init_pid = sleeper.id() as i32;

        let (parent_sock, child_sock) = UnixStream::pair().unwrap();
        let bootstrap = b"bootstrap-blob".to_vec();

        let child_thread = fake_child(child_sock, bootstrap.len(), init_pid, |sock| {
            sync::write_sync(sock, SyncType::ProcReady).unwrap();
            expect_reply(sock, SyncType::ProcRun);

            sync::write_sync(sock, SyncType::RootfsReady).unwrap();
            expect_reply(sock, SyncType::RootfsReadyAck);

            sync::write_sync(sock, SyncType::ProcHooks).unwrap();
            expect_reply(sock, SyncType::ProcResume);
        });

        let pid = {
            let mut launch = InitLaunch::new(
                &mut container,
                &mut cgroup,
                None,
                &vfs,
                config,
                Some(hooks),
                test_launch_config(),
                bootstrap,
            );
            launch
                .launch_inner(parent_sock, spawn_true())
                .expect("launch should succeed")
        };
        child_thread.join().unwrap();

        assert_eq!(pid.as_raw(), init_pid);

        // Container reached Created exactly once.
        let created = container.created.expect("mark_created not called");
        assert_eq!(created.init_pid.as_raw(), init_pid);

        // Hooks ran exactly once, with status creating and the init pid.
        let hook_states = std::fs::read_to_string(&hook_log).unwrap();
        let state: crate::container::OciState = serde_json::from_str(&hook_states).unwrap();
        assert_eq!(state.status, ContainerStatus::Creating);
        assert_eq!(state.pid, Some(init_pid));

        // v2: the child cgroup was created during RootfsReady.
        let calls = cgroup.calls();
        assert!(calls.contains(&"create_child".to_string()));
        assert!(calls.contains(&format!("apply_child:{init_pid}")));
        assert!(!calls.contains(&"destroy".to_string()));

        // Registered with the virtualizer exactly once.
        assert_eq!(registrations.lock().unwrap().len(), 1);

        let _ = kill(pid, Signal::SIGKILL);
        let _ = waitpid(pid, None);
    }

    #[test]
    fn test_v1_child_cgroup_ordering() {
        let rootfs = tempfile::tempdir().unwrap();
        let mut container = MockContainer::default();
        let mut cgroup = MockCgroup::new(CgroupKind::V1Fs);
        let (vfs, _registrations) = fake_virtualizer();

        let config = test_config(rootfs.path());
        let sleeper = spawn_sleeper();
        let init_pid = sleeper.id() as i32;

        let (parent_sock, child_sock) = UnixStream::pair().unwrap();
        let child_thread = fake_child(child_sock, 1, init_pid, |sock| {
            sync::write_sync(sock, SyncType::ProcReady).unwrap();
            expect_reply(sock, SyncType::ProcRun);
        });

        {
            let mut launch = InitLaunch::new(
                &mut container,
                &mut cgroup,
                None,
                &vfs,
                config,
                None,
                test_launch_config(),
                vec![0u8],
            );
            launch.launch_inner(parent_sock, spawn_true()).unwrap();
        }
        child_thread.join().unwrap();

        // v1: the child cgroup exists before the init pid joins it, and
        // both happen before the sync loop.
        let calls = cgroup.calls();
        let create = calls.iter().position(|c| c == "create_child").unwrap();
        let apply_child = calls
            .iter()
            .position(|c| c == &format!("apply_child:{init_pid}"))
            .unwrap();
        assert!(create < apply_child);

        let _ = kill(Pid::from_raw(init_pid), Signal::SIGKILL);
        let _ = waitpid(Pid::from_raw(init_pid), None);
    }

    #[test]
    fn test_missing_proc_ready_is_fatal() {
        let rootfs = tempfile::tempdir().unwrap();
        let mut container = MockContainer::default();
        let mut cgroup = MockCgroup::new(CgroupKind::V2Fs);
        let (vfs, _registrations) = fake_virtualizer();

        let sleeper = spawn_sleeper();
        let init_pid = sleeper.id() as i32;

        let (parent_sock, child_sock) = UnixStream::pair().unwrap();
        // Child closes the socket without ever reporting ready.
        let child_thread = fake_child(child_sock, 1, init_pid, |_sock| {});

        let err = {
            let mut launch = InitLaunch::new(
                &mut container,
                &mut cgroup,
                None,
                &vfs,
                test_config(rootfs.path()),
                None,
                test_launch_config(),
                vec![0u8],
            );
            launch
                .launch_inner(parent_sock, spawn_true())
                .expect_err("launch must fail")
        };
        child_thread.join().unwrap();

        assert!(err.to_string().contains("container init"), "got {err}");
        // Rollback destroyed the cgroup and killed the init process.
        assert!(cgroup.calls().contains(&"destroy".to_string()));
        assert!(container.created.is_none());
        assert_eq!(waitpid(Pid::from_raw(init_pid), None).ok(), None);
    }

    #[test]
    fn test_rollback_on_config_send_failure() {
        let rootfs = tempfile::tempdir().unwrap();
        let mut container = MockContainer::default();
        let mut cgroup = MockCgroup::new(CgroupKind::V2Fs);
        let (vfs, registrations) = fake_virtualizer();

        let sleeper = spawn_sleeper();
        let init_pid = sleeper.id() as i32;

        let (parent_sock, child_sock) = UnixStream::pair().unwrap();
        // Child reports pids then drops the socket; the parent's config
        // send hits a closed peer.
        let child_thread = thread::spawn(move || {
            let mut sock = child_sock;
            let mut blob = [0u8; 1];
            sock.read_exact(&mut blob).unwrap();
            write_payload(
                &mut sock,
                &ReportedPids {
                    pid: init_pid,
                    first_child: 999_999,
                },
            )
            .unwrap();
        });

        let err = {
            let mut launch = InitLaunch::new(
                &mut container,
                &mut cgroup,
                None,
                &vfs,
                test_config(rootfs.path()),
                None,
                test_launch_config(),
                vec![0u8],
            );
            launch
                .launch_inner(parent_sock, spawn_true())
                .expect_err("launch must fail")
        };
        child_thread.join().unwrap();

        assert!(
            err.to_string().contains("sending config")
                || err.to_string().contains("container init"),
            "got {err}"
        );
        assert!(cgroup.calls().contains(&"destroy".to_string()));
        // Never got as far as registration.
        assert!(registrations.lock().unwrap().is_empty());
        assert_eq!(waitpid(Pid::from_raw(init_pid), None).ok(), None);
    }

    #[test]
    fn test_parent_only_message_from_child_is_fatal() {
        let rootfs = tempfile::tempdir().unwrap();
        let mut container = MockContainer::default();
        let mut cgroup = MockCgroup::new(CgroupKind::V2Fs);
        let (vfs, _registrations) = fake_virtualizer();

        let sleeper = spawn_sleeper();
        let init_pid = sleeper.id() as i32;

        let (parent_sock, child_sock) = UnixStream::pair().unwrap();
        let child_thread = fake_child(child_sock, 1, init_pid, |sock| {
            // A reply type the child must never originate.
            let _ = sync::write_sync(sock, SyncType::ProcRun);
        });

        let err = {
            let mut launch = InitLaunch::new(
                &mut container,
                &mut cgroup,
                None,
                &vfs,
                test_config(rootfs.path()),
                None,
                test_launch_config(),
                vec![0u8],
            );
            launch
                .launch_inner(parent_sock, spawn_true())
                .expect_err("launch must fail")
        };
        child_thread.join().unwrap();

        assert!(err.to_string().contains("container init"), "got {err}");
        assert!(cgroup.calls().contains(&"destroy".to_string()));
    }

    #[test]
    fn test_seccomp_fd_exchange() {
        use nix::sys::socket::{ControlMessage, MsgFlags, UnixAddr, sendmsg};
        use std::os::fd::AsRawFd;

        let rootfs = tempfile::tempdir().unwrap();
        let mut container = MockContainer::default();
        let mut cgroup = MockCgroup::new(CgroupKind::V2Fs);
        let (vfs, _registrations) = fake_virtualizer();

        let sleeper = spawn_sleeper();
        let init_pid = sleeper.id() as i32;

        let (parent_sock, child_sock) = UnixStream::pair().unwrap();
        let child_thread = fake_child(child_sock, 1, init_pid, |sock| {
            sync::write_sync(sock, SyncType::ProcFd).unwrap();
            expect_reply(sock, SyncType::SendFd);

            let payload = [0u8; 1];
            let iov = [std::io::IoSlice::new(&payload)];
            let fds = [libc::STDERR_FILENO];
            let cmsg = [ControlMessage::ScmRights(&fds)];
            sendmsg::<UnixAddr>(sock.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None).unwrap();
            expect_reply(sock, SyncType::ProcFdDone);

            sync::write_sync(sock, SyncType::ProcReady).unwrap();
            expect_reply(sock, SyncType::ProcRun);
        });

        {
            let mut launch = InitLaunch::new(
                &mut container,
                &mut cgroup,
                None,
                &vfs,
                test_config(rootfs.path()),
                None,
                test_launch_config(),
                vec![0u8],
            );
            launch.launch_inner(parent_sock, spawn_true()).unwrap();
        }
        child_thread.join().unwrap();

        assert_eq!(container.seccomp_fds.len(), 1);

        let _ = kill(Pid::from_raw(init_pid), Signal::SIGKILL);
        let _ = waitpid(Pid::from_raw(init_pid), None);
    }

    #[test]
    fn test_op_request_exchange() {
        let rootfs = tempfile::tempdir().unwrap();
        let mut container = MockContainer::default();
        let mut cgroup = MockCgroup::new(CgroupKind::V2Fs);
        let (vfs, _registrations) = fake_virtualizer();

        let sleeper = spawn_sleeper();
        let init_pid = sleeper.id() as i32;

        let (parent_sock, child_sock) = UnixStream::pair().unwrap();
        let child_thread = fake_child(child_sock, 1, init_pid, |sock| {
            sync::write_sync(sock, SyncType::ReqOp).unwrap();
            expect_reply(sock, SyncType::SendOpInfo);

            let ops = vec![OpRequest {
                op: "bind-mount".to_string(),
                payload: serde_json::json!({"source": "/a", "dest": "/b"}),
            }];
            write_payload(sock, &ops).unwrap();
            expect_reply(sock, SyncType::OpDone);

            sync::write_sync(sock, SyncType::ProcReady).unwrap();
            expect_reply(sock, SyncType::ProcRun);
        });

        {
            let mut launch = InitLaunch::new(
                &mut container,
                &mut cgroup,
                None,
                &vfs,
                test_config(rootfs.path()),
                None,
                test_launch_config(),
                vec![0u8],
            );
            launch.launch_inner(parent_sock, spawn_true()).unwrap();
        }
        child_thread.join().unwrap();

        assert_eq!(container.ops.len(), 1);
        assert_eq!(container.ops[0].op, "bind-mount");

        let _ = kill(Pid::from_raw(init_pid), Signal::SIGKILL);
        let _ = waitpid(Pid::from_raw(init_pid), None);
    }

    #[test]
    fn test_stdio_fds_resolved_for_self() {
        let fds = stdio_fds(Pid::from_raw(std::process::id() as i32)).unwrap();
        assert_eq!(fds.len(), 3);
    }

    #[test]
    fn test_setup_dev_subdir_creates_dir() {
        let rootfs = tempfile::tempdir().unwrap();
        setup_dev_subdir(rootfs.path()).unwrap();
        let meta = std::fs::metadata(rootfs.path().join("dev")).unwrap();
        assert!(meta.is_dir());
        assert_eq!(meta.permissions().mode() & 0o777, 0o755);
    }
}
