//! OCI lifecycle hook execution.
//!
//! Hooks run on the host with the container's OCI state on stdin. A hook
//! that exits non-zero, or overruns its configured timeout, fails the
//! launch.

use std::io::Write;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use oci_spec::runtime::Hook;

use nestbox_shared::errors::{NestboxError, NestboxResult};

use crate::container::OciState;

pub(crate) fn run_hooks(hooks: &[Hook], state: &OciState) -> NestboxResult<()> {
    for hook in hooks {
        run_hook(hook, state)?;
    }
    Ok(())
}

fn run_hook(hook: &Hook, state: &OciState) -> NestboxResult<()> {
    let path = hook.path().to_string_lossy().into_owned();
    let err = |reason: String| NestboxError::Hook {
        path: path.clone(),
        reason,
    };

    let mut cmd = Command::new(hook.path());
    if let Some(args) = hook.args()
        && let Some((argv0, rest)) = args.split_first()
    {
        cmd.arg0(argv0);
        cmd.args(rest);
    }
    if let Some(env) = hook.env() {
        for entry in env {
            if let Some((key, value)) = entry.split_once('=') {
                cmd.env(key, value);
            }
        }
    }
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    let mut child = cmd.spawn().map_err(|e| err(format!("spawn failed: {e}")))?;

    let state_json =
        serde_json::to_vec(state).map_err(|e| err(format!("encoding state: {e}")))?;
    if let Some(mut stdin) = child.stdin.take() {
        // A hook may exit without reading its stdin; that's its business.
        let _ = stdin.write_all(&state_json);
    }

    let status = match hook.timeout() {
        Some(secs) if secs > 0 => wait_timeout(&mut child, Duration::from_secs(secs as u64))
            .map_err(|e| err(e.to_string()))?
            .ok_or_else(|| {
                let _ = child.kill();
                let _ = child.wait();
                err(format!("timed out after {secs}s"))
            })?,
        _ => child.wait().map_err(|e| err(format!("wait failed: {e}")))?,
    };

    if !status.success() {
        return Err(err(format!("exited with {status}")));
    }
    Ok(())
}

/// Poll for child exit up to `limit`; `None` means the deadline passed.
fn wait_timeout(child: &mut Child, limit: Duration) -> std::io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + limit;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}
