//! Sync-socket wire protocol between the runtime and the bootstrapper.
//!
//! Messages are length-prefixed JSON frames: a 4-byte big-endian payload
//! length followed by the JSON bytes. Typed sync messages use [`SyncMsg`];
//! auxiliary payloads (reported pids, the init config, operation requests)
//! travel as standalone frames via [`write_payload`]/[`read_payload`].
//!
//! One byte is reserved outside the framing: [`crate::constants::sync::CREATE_CGROUP_NS`],
//! written raw on the socket to unblock the child's cgroup-namespace unshare.

use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::ProtocolError;

/// Maximum accepted frame size. A frame above this is a protocol violation,
/// not a legitimate message.
const MAX_FRAME_LEN: u32 = 1 << 20;

/// Message types exchanged on the sync socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncType {
    /// Child finished its setup and is ready to exec; parent replies `ProcRun`.
    ProcReady,
    /// Child requests the prestart/create-runtime hook run; parent replies `ProcResume`.
    ProcHooks,
    /// Parent acknowledges `ProcReady`; the child may exec.
    ProcRun,
    /// Parent acknowledges `ProcHooks`; the child may continue.
    ProcResume,
    /// Child finished preparing the rootfs; parent replies `RootfsReadyAck`.
    RootfsReady,
    /// Parent acknowledges `RootfsReady`.
    RootfsReadyAck,
    /// Child requests privileged side-operations; parent replies `SendOpInfo`.
    ReqOp,
    /// Parent is ready to receive the operation list.
    SendOpInfo,
    /// Parent finished the requested operations.
    OpDone,
    /// Child wants to pass a seccomp-notify fd; parent replies `SendFd`.
    ProcFd,
    /// Parent is ready to receive the fd over SCM_RIGHTS.
    SendFd,
    /// Parent finished installing the seccomp fd.
    ProcFdDone,
}

/// A typed sync message with an optional JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMsg {
    #[serde(rename = "type")]
    pub typ: SyncType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl SyncMsg {
    pub fn new(typ: SyncType) -> Self {
        Self { typ, payload: None }
    }
}

/// Pids reported by the bootstrapper once namespace entry is complete.
///
/// `pid` is the final container init process; `first_child` is the
/// intermediate fork that must be reaped by the parent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReportedPids {
    pub pid: i32,
    #[serde(rename = "pid_first")]
    pub first_child: i32,
}

/// Write one typed sync message.
pub fn write_sync<W: Write>(w: &mut W, typ: SyncType) -> Result<(), ProtocolError> {
    write_payload(w, &SyncMsg::new(typ))
}

/// Read one typed sync message. Returns `None` on clean EOF.
pub fn read_sync<R: Read>(r: &mut R) -> Result<Option<SyncMsg>, ProtocolError> {
    read_payload(r)
}

/// Write an arbitrary value as one length-prefixed JSON frame.
pub fn write_payload<W: Write, T: Serialize>(w: &mut W, value: &T) -> Result<(), ProtocolError> {
    let body = serde_json::to_vec(value)?;
    let len = u32::try_from(body.len()).map_err(|_| {
        ProtocolError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "frame too large",
        ))
    })?;
    w.write_all(&len.to_be_bytes())?;
    w.write_all(&body)?;
    w.flush()?;
    Ok(())
}

/// Read one length-prefixed JSON frame.
///
/// Returns `None` on clean EOF (no bytes before the frame header). EOF in
/// the middle of a frame is [`ProtocolError::ShortRead`].
pub fn read_payload<R: Read, T: DeserializeOwned>(r: &mut R) -> Result<Option<T>, ProtocolError> {
    let mut header = [0u8; 4];
    match read_exact_or_eof(r, &mut header)? {
        ReadOutcome::Eof => return Ok(None),
        ReadOutcome::Partial => return Err(ProtocolError::ShortRead),
        ReadOutcome::Full => {}
    }

    let len = u32::from_be_bytes(header);
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds limit"),
        )));
    }

    let mut body = vec![0u8; len as usize];
    match read_exact_or_eof(r, &mut body)? {
        ReadOutcome::Full => {}
        ReadOutcome::Eof | ReadOutcome::Partial => return Err(ProtocolError::ShortRead),
    }

    Ok(Some(serde_json::from_slice(&body)?))
}

enum ReadOutcome {
    Full,
    Partial,
    Eof,
}

fn read_exact_or_eof<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<ReadOutcome, ProtocolError> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(ReadOutcome::Eof),
            Ok(0) => return Ok(ReadOutcome::Partial),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ProtocolError::Io(e)),
        }
    }
    Ok(ReadOutcome::Full)
}
