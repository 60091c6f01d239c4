//! Log forwarding from the bootstrapper to the parent's tracing system.
//!
//! The child writes JSON records (`{"level": "...", "msg": "..."}`) to its
//! log pipe; a dedicated reader thread re-emits them through `tracing` with
//! a child-specific target. Non-JSON lines are forwarded verbatim at debug
//! level so a crashing child never loses output.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::os::fd::OwnedFd;
use std::thread::{self, JoinHandle};

use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct LogRecord {
    #[serde(default)]
    level: String,
    #[serde(default)]
    msg: String,
}

/// Owns the reader thread draining one child's log pipe.
pub struct LogForwarder {
    thread: Option<JoinHandle<()>>,
}

impl LogForwarder {
    /// Spawn the reader thread. It runs until the child closes its end of
    /// the pipe.
    pub fn spawn(read_side: OwnedFd, container_id: &str) -> std::io::Result<Self> {
        let id = container_id.to_string();
        let reader = BufReader::new(File::from(read_side));

        let thread = thread::Builder::new()
            .name(format!("nestbox-log-{id}"))
            .spawn(move || {
                for line in reader.lines() {
                    match line {
                        Ok(line) => forward_line(&id, &line),
                        Err(e) => {
                            tracing::warn!(
                                target: "nestbox::child",
                                container_id = %id,
                                "failed to read child log pipe: {e}"
                            );
                            break;
                        }
                    }
                }
                tracing::debug!(
                    target: "nestbox::child",
                    container_id = %id,
                    "child log pipe closed"
                );
            })?;

        Ok(Self {
            thread: Some(thread),
        })
    }

    /// Wait for the reader thread; call after the child has exited so the
    /// pipe has hit EOF.
    pub fn shutdown(mut self) {
        self.join();
    }

    fn join(&mut self) {
        if let Some(handle) = self.thread.take()
            && handle.join().is_err()
        {
            tracing::warn!(target: "nestbox::child", "log reader thread panicked");
        }
    }
}

impl Drop for LogForwarder {
    fn drop(&mut self) {
        self.join();
    }
}

fn forward_line(id: &str, line: &str) {
    match serde_json::from_str::<LogRecord>(line) {
        Ok(record) => match record.level.as_str() {
            "error" | "fatal" | "panic" => {
                tracing::error!(target: "nestbox::child", container_id = %id, "{}", record.msg)
            }
            "warning" | "warn" => {
                tracing::warn!(target: "nestbox::child", container_id = %id, "{}", record.msg)
            }
            "info" => {
                tracing::info!(target: "nestbox::child", container_id = %id, "{}", record.msg)
            }
            _ => tracing::debug!(target: "nestbox::child", container_id = %id, "{}", record.msg),
        },
        Err(_) => {
            tracing::debug!(target: "nestbox::child", container_id = %id, "{line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_forwarder_drains_pipe_until_eof() {
        let (read, write) = nix::unistd::pipe().unwrap();
        let forwarder = LogForwarder::spawn(read, "c1").unwrap();

        let mut writer = File::from(write);
        writeln!(writer, "{{\"level\":\"info\",\"msg\":\"setup done\"}}").unwrap();
        writeln!(writer, "plain text line").unwrap();
        drop(writer);

        // Returns only after the thread saw EOF.
        forwarder.shutdown();
    }
}
