//! Parent-side network interface creation.
//!
//! Interfaces are created per strategy keyed by the network type before the
//! child is released. The loopback device needs no parent-side action (the
//! child brings it up inside its namespace); it exists as a strategy so the
//! config surface stays uniform.

use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use nestbox_shared::errors::{NestboxError, NestboxResult};

/// One network attached to a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Strategy name, e.g. `"loopback"`.
    #[serde(rename = "type")]
    pub typ: String,
    /// Interface name inside the container, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

trait Strategy {
    fn create(&self, net: &NetworkConfig, pid: Pid) -> NestboxResult<()>;
}

struct Loopback;

impl Strategy for Loopback {
    fn create(&self, _net: &NetworkConfig, _pid: Pid) -> NestboxResult<()> {
        Ok(())
    }
}

fn strategy_for(typ: &str) -> Option<&'static dyn Strategy> {
    match typ {
        "loopback" => Some(&Loopback),
        _ => None,
    }
}

/// Create the configured network interfaces for the child.
pub fn create_interfaces(networks: &[NetworkConfig], pid: Pid) -> NestboxResult<()> {
    for net in networks {
        let strategy = strategy_for(&net.typ).ok_or_else(|| {
            NestboxError::Io(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                format!("unknown network strategy {:?}", net.typ),
            ))
        })?;
        strategy.create(net, pid)?;
    }
    Ok(())
}
