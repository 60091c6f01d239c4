//! Bootstrapper process plumbing: descriptor pairs, spawning, and the
//! SCM_RIGHTS receive used for seccomp-notify fds.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::process::{Child, Command};

use nix::sys::socket::{
    AddressFamily, ControlMessageOwned, MsgFlags, SockFlag, SockType, UnixAddr, recvmsg,
    socketpair,
};

use nestbox_shared::constants::child::{LOG_FD_ENV, SYNC_FD_ENV};
use nestbox_shared::errors::ProtocolError;

use super::LaunchConfig;

/// The sync socket pair. The parent end is close-on-exec; the child end is
/// inherited across the bootstrapper exec and identified by fd number in
/// its environment.
pub(crate) struct SyncSockets {
    pub parent: UnixStream,
    pub child: OwnedFd,
}

pub(crate) fn sync_socketpair() -> io::Result<SyncSockets> {
    let (parent, child) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    )?;
    set_cloexec(parent.as_raw_fd())?;
    Ok(SyncSockets {
        parent: UnixStream::from(parent),
        child,
    })
}

/// The log pipe: child writes records, parent forwards them. Returns
/// (read side, write side).
pub(crate) fn log_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let (read, write) = nix::unistd::pipe()?;
    set_cloexec(read.as_raw_fd())?;
    Ok((read, write))
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Spawn the bootstrapper with the child-side descriptors in its
/// environment. Stdio is inherited; the embedding runtime wires the
/// container's stdio before calling into the launch.
pub(crate) fn spawn_bootstrapper(
    cfg: &LaunchConfig,
    sync_child: &OwnedFd,
    log_child: &OwnedFd,
) -> io::Result<Child> {
    let mut cmd = Command::new(&cfg.bootstrapper);
    cmd.args(&cfg.args);
    cmd.env(SYNC_FD_ENV, sync_child.as_raw_fd().to_string());
    cmd.env(LOG_FD_ENV, log_child.as_raw_fd().to_string());

    let child = cmd.spawn()?;
    tracing::debug!(
        container_id = %cfg.container_id,
        pid = child.id(),
        bootstrapper = %cfg.bootstrapper.display(),
        "bootstrapper spawned"
    );
    Ok(child)
}

/// Receive one file descriptor over an SCM_RIGHTS control message.
pub(crate) fn recv_seccomp_fd(sock: &UnixStream) -> Result<OwnedFd, ProtocolError> {
    let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
    let mut data = [0u8; 1];
    let mut iov = [io::IoSliceMut::new(&mut data)];

    let msg = recvmsg::<UnixAddr>(
        sock.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buf),
        MsgFlags::empty(),
    )
    .map_err(|e| ProtocolError::Io(e.into()))?;

    for cmsg in msg.cmsgs().map_err(|e| ProtocolError::Io(e.into()))? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg
            && let Some(fd) = fds.first()
        {
            // The kernel duplicated the descriptor into this process; we
            // own it from here.
            return Ok(unsafe { OwnedFd::from_raw_fd(*fd) });
        }
    }

    Err(ProtocolError::Io(io::Error::new(
        io::ErrorKind::InvalidData,
        "no file descriptor in control message",
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{ControlMessage, sendmsg};

    #[test]
    fn test_sync_socketpair_parent_is_cloexec() {
        let pair = sync_socketpair().unwrap();
        let flags = unsafe { libc::fcntl(pair.parent.as_raw_fd(), libc::F_GETFD) };
        assert!(flags & libc::FD_CLOEXEC != 0);

        let flags = unsafe { libc::fcntl(pair.child.as_raw_fd(), libc::F_GETFD) };
        assert!(flags & libc::FD_CLOEXEC == 0);
    }

    #[test]
    fn test_recv_seccomp_fd_roundtrip() {
        let (a, b) = UnixStream::pair().unwrap();

        // Send stdin's fd as a stand-in for a seccomp-notify fd.
        let payload = [0u8; 1];
        let iov = [io::IoSlice::new(&payload)];
        let fds = [libc::STDIN_FILENO];
        let cmsg = [ControlMessage::ScmRights(&fds)];
        sendmsg::<UnixAddr>(b.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None).unwrap();

        let received = recv_seccomp_fd(&a).unwrap();
        assert!(received.as_raw_fd() >= 0);
    }

    #[test]
    fn test_recv_seccomp_fd_without_fd_fails() {
        use std::io::Write;
        let (a, mut b) = UnixStream::pair().unwrap();
        b.write_all(&[0u8]).unwrap();
        assert!(recv_seccomp_fd(&a).is_err());
    }
}
