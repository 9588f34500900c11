//! Wire protocol message types shared by agents, control clients and
//! the broker.
//!
//! All messages are MessagePack-encoded maps tagged on the `type` field.
//! Agent-facing messages carry no request id: acknowledgments are
//! correlated to the connection they arrive on. Control requests carry
//! an `id` that the broker echoes in its `response`.

use serde::{Deserialize, Serialize};

/// All wire protocol messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Message {
    // -- Handshake (any role) --
    #[serde(rename = "hello")]
    Hello { version: u32, role: Role },

    #[serde(rename = "hello_ack")]
    HelloAck {
        status: Status,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    // -- Agent registration --
    #[serde(rename = "register")]
    Register(Registration),

    #[serde(rename = "registration_success")]
    RegistrationSuccess {
        client_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },

    #[serde(rename = "registration_rejected")]
    RegistrationRejected {
        client_id: String,
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        existing_node_id: Option<String>,
    },

    #[serde(rename = "heartbeat")]
    Heartbeat,

    // -- Session relay --
    #[serde(rename = "relay_session")]
    RelaySession {
        user_id: String,
        #[serde(with = "serde_bytes")]
        session_payload: Vec<u8>,
        origin: OriginConfig,
    },

    #[serde(rename = "relay_ack")]
    RelayAck {
        success: bool,
        #[serde(default)]
        message: String,
    },

    // -- Logout fan-out --
    #[serde(rename = "logout")]
    Logout {
        user_id: String,
        username: String,
        origin_logout: OriginLogoutConfig,
    },

    #[serde(rename = "logout_ack")]
    LogoutAck {
        success: bool,
        #[serde(default)]
        message: String,
    },

    // -- Hierarchy (either direction) --
    #[serde(rename = "hierarchy_assigned")]
    HierarchyAssigned(HierarchyAssignment),

    // -- Broker notices --
    #[serde(rename = "close_notice")]
    CloseNotice { reason: String },

    #[serde(rename = "error")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u32>,
        reason: String,
    },

    // -- Control requests --
    #[serde(rename = "list_connections")]
    ListConnections {
        id: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },

    #[serde(rename = "relay_now")]
    RelayNow { id: u32, user_id: String },

    #[serde(rename = "logout_user")]
    LogoutUser { id: u32, user_id: String },

    #[serde(rename = "store_session")]
    StoreSession {
        id: u32,
        user_id: String,
        username: String,
        #[serde(with = "serde_bytes")]
        session_payload: Vec<u8>,
    },

    #[serde(rename = "response")]
    Response {
        id: u32,
        status: Status,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connections: Option<Vec<ConnectionDescriptor>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        outcome: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delivered: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        missing: Option<u32>,
    },
}

impl Message {
    /// Plain `ok` response to a control request.
    pub fn ok(id: u32) -> Self {
        Message::Response {
            id,
            status: Status::Ok,
            error: None,
            connections: None,
            outcome: None,
            delivered: None,
            missing: None,
        }
    }

    /// Error response to a control request.
    pub fn failure(id: u32, reason: impl Into<String>) -> Self {
        Message::Response {
            id,
            status: Status::Error,
            error: Some(reason.into()),
            connections: None,
            outcome: None,
            delivered: None,
            missing: None,
        }
    }

    /// Wire name of the message, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "hello",
            Message::HelloAck { .. } => "hello_ack",
            Message::Register(_) => "register",
            Message::RegistrationSuccess { .. } => "registration_success",
            Message::RegistrationRejected { .. } => "registration_rejected",
            Message::Heartbeat => "heartbeat",
            Message::RelaySession { .. } => "relay_session",
            Message::RelayAck { .. } => "relay_ack",
            Message::Logout { .. } => "logout",
            Message::LogoutAck { .. } => "logout_ack",
            Message::HierarchyAssigned(_) => "hierarchy_assigned",
            Message::CloseNotice { .. } => "close_notice",
            Message::Error { .. } => "error",
            Message::ListConnections { .. } => "list_connections",
            Message::RelayNow { .. } => "relay_now",
            Message::LogoutUser { .. } => "logout_user",
            Message::StoreSession { .. } => "store_session",
            Message::Response { .. } => "response",
        }
    }
}

/// Connection role declared in `hello`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Remote C-Client agent that receives relays and logouts.
    Agent,
    /// Origin application or operator issuing relay/logout requests.
    Control,
}

/// Response status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

/// Body of a `register` message.
///
/// Empty strings in the optional fields are treated as absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Registration {
    pub node_id: String,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
}

/// Domain/cluster/channel placement of a node, produced by the
/// hierarchy collaborator. The broker stores it verbatim.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HierarchyAssignment {
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub is_domain_main: bool,
    #[serde(default)]
    pub is_cluster_main: bool,
    #[serde(default)]
    pub is_channel_main: bool,
}

/// Origin site the relayed session belongs to.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OriginConfig {
    pub root_url: String,
    pub name: String,
}

/// How an agent should log out of the origin site.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OriginLogoutConfig {
    pub url: String,
    pub method: String,
}

/// One bound connection, as reported by `list_connections`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub connection_id: u64,
    pub node_id: String,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    pub closed_by_logout: bool,
}

/// Every `type` tag defined by [`Message`].
pub const MESSAGE_TYPES: &[&str] = &[
    "hello",
    "hello_ack",
    "register",
    "registration_success",
    "registration_rejected",
    "heartbeat",
    "relay_session",
    "relay_ack",
    "logout",
    "logout_ack",
    "hierarchy_assigned",
    "close_notice",
    "error",
    "list_connections",
    "relay_now",
    "logout_user",
    "store_session",
    "response",
];

/// Protocol version spoken by this broker.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Minimal envelope for messages whose `type` is not recognized.
///
/// Lets the broker echo a control request's `id` in the error it sends
/// back. Agent messages have no id, so it is optional.
#[derive(Debug, Deserialize)]
pub struct RawEnvelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub id: Option<u32>,
}
