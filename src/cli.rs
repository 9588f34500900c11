use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::broker::config::{BrokerConfig, OriginSettings};
use crate::broker::hierarchy::FixedHierarchy;
use crate::session::relay::RelayPolicy;

#[derive(Parser)]
#[command(name = "relayd", about = "Session relay and logout broker for remote agents")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the broker daemon
    Broker(BrokerArgs),

    /// One-shot control client
    Client {
        /// Control socket path [default: $XDG_RUNTIME_DIR/relayd/control.sock]
        #[arg(long)]
        socket: Option<PathBuf>,

        #[command(subcommand)]
        action: ClientAction,
    },
}

#[derive(Args, Debug)]
pub struct BrokerArgs {
    /// TCP address agents connect to
    #[arg(long, default_value = "0.0.0.0:8765")]
    pub listen: SocketAddr,

    /// Control socket path [default: $XDG_RUNTIME_DIR/relayd/control.sock]
    #[arg(long)]
    pub control_socket: Option<PathBuf>,

    /// Relay attempts before giving up
    #[arg(long, default_value_t = 3)]
    pub relay_attempts: u32,

    /// How long each relay attempt waits for acks
    #[arg(long, default_value = "10s", value_parser = parse_duration)]
    pub relay_timeout: Duration,

    /// Pause between relay attempts
    #[arg(long, default_value = "500ms", value_parser = parse_duration)]
    pub relay_backoff: Duration,

    /// How long logout waits for acks before evicting anyway
    #[arg(long, default_value = "10s", value_parser = parse_duration)]
    pub logout_timeout: Duration,

    /// How long a liveness verdict is cached
    #[arg(long, default_value = "2s", value_parser = parse_duration)]
    pub liveness_ttl: Duration,

    /// Inactivity after which a connection is stale
    #[arg(long, default_value = "90s", value_parser = parse_duration)]
    pub stale_after: Duration,

    /// Interval between stale-connection sweeps
    #[arg(long, default_value = "30s", value_parser = parse_duration)]
    pub sweep_interval: Duration,

    /// Origin site root URL
    #[arg(long, default_value = "http://localhost:5000")]
    pub origin_url: String,

    /// Origin site name sent to agents
    #[arg(long, default_value = "origin")]
    pub origin_name: String,

    /// Origin logout path, relative to the root URL
    #[arg(long, default_value = "/logout")]
    pub origin_logout_path: String,

    /// HTTP method agents use for origin logout
    #[arg(long, default_value = "POST")]
    pub origin_logout_method: String,

    /// Cookie carrying the origin session token
    #[arg(long, default_value = "session")]
    pub session_cookie: String,

    /// Domain assigned to every bound node
    #[arg(long)]
    pub domain_id: Option<String>,

    /// Cluster assigned to every bound node
    #[arg(long)]
    pub cluster_id: Option<String>,

    /// Channel assigned to every bound node
    #[arg(long)]
    pub channel_id: Option<String>,
}

impl BrokerArgs {
    pub fn into_config(self) -> BrokerConfig {
        let hierarchy = FixedHierarchy {
            domain_id: self.domain_id,
            cluster_id: self.cluster_id,
            channel_id: self.channel_id,
        };
        BrokerConfig {
            listen: self.listen,
            control_socket: self.control_socket,
            relay: RelayPolicy {
                max_attempts: self.relay_attempts,
                per_attempt_timeout: self.relay_timeout,
                backoff: self.relay_backoff,
            },
            logout_timeout: self.logout_timeout,
            liveness_ttl: self.liveness_ttl,
            stale_after: self.stale_after,
            sweep_interval: self.sweep_interval,
            origin: OriginSettings {
                root_url: self.origin_url,
                name: self.origin_name,
                logout_path: self.origin_logout_path,
                logout_method: self.origin_logout_method,
                session_cookie: self.session_cookie,
            },
            hierarchy: (!hierarchy.is_empty()).then_some(hierarchy),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum ClientAction {
    /// List bound connections
    Connections {
        /// Only this user's connections
        #[arg(long)]
        user: Option<String>,
    },

    /// Relay the user's session to their agents now
    Relay {
        #[arg(long)]
        user: String,
    },

    /// Log the user out on every agent
    Logout {
        #[arg(long)]
        user: String,
    },

    /// Store a captured session for the user
    StoreSession {
        #[arg(long)]
        user: String,

        /// Username on the origin site
        #[arg(long)]
        username: String,

        /// Session token
        #[arg(long)]
        token: String,
    },
}

/// Parse `500ms`, `10s`, `2m`, or a bare number of seconds.
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let n: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration: {s:?}"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(n)),
        "" | "s" => Ok(Duration::from_secs(n)),
        "m" => Ok(Duration::from_secs(n * 60)),
        other => Err(format!("unknown duration unit {other:?} (expected ms, s, m)")),
    }
}
