//! Broker configuration, folded from command-line flags.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::ipc::protocol::{OriginConfig, OriginLogoutConfig};
use crate::session::relay::RelayPolicy;

use super::hierarchy::FixedHierarchy;

pub const DEFAULT_AGENT_PORT: u16 = 8765;

/// Where agents should replay relayed sessions, and how the origin
/// logs a session out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginSettings {
    pub root_url: String,
    pub name: String,
    pub logout_path: String,
    pub logout_method: String,
    /// Cookie carrying the session token in origin login responses.
    pub session_cookie: String,
}

impl Default for OriginSettings {
    fn default() -> Self {
        Self {
            root_url: "http://localhost:5000".into(),
            name: "origin".into(),
            logout_path: "/logout".into(),
            logout_method: "POST".into(),
            session_cookie: "session".into(),
        }
    }
}

impl OriginSettings {
    pub fn relay_config(&self) -> OriginConfig {
        OriginConfig {
            root_url: self.root_url.clone(),
            name: self.name.clone(),
        }
    }

    pub fn logout_config(&self) -> OriginLogoutConfig {
        OriginLogoutConfig {
            url: self.logout_url(),
            method: self.logout_method.clone(),
        }
    }

    pub fn logout_url(&self) -> String {
        join_url(&self.root_url, &self.logout_path)
    }
}

/// Join a base URL and a path without doubling or dropping the slash.
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// TCP address agents connect to.
    pub listen: SocketAddr,
    /// Control socket path. `None` resolves under `$XDG_RUNTIME_DIR`.
    pub control_socket: Option<PathBuf>,
    pub relay: RelayPolicy,
    /// How long logout waits for acks before evicting anyway.
    pub logout_timeout: Duration,
    pub liveness_ttl: Duration,
    pub stale_after: Duration,
    pub sweep_interval: Duration,
    pub origin: OriginSettings,
    /// Static hierarchy placement handed to every bound node.
    pub hierarchy: Option<FixedHierarchy>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_AGENT_PORT)),
            control_socket: None,
            relay: RelayPolicy::default(),
            logout_timeout: Duration::from_secs(10),
            liveness_ttl: Duration::from_secs(2),
            stale_after: Duration::from_secs(90),
            sweep_interval: Duration::from_secs(30),
            origin: OriginSettings::default(),
            hierarchy: None,
        }
    }
}
