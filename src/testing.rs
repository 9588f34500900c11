//! Test doubles: an in-process broker loop, agents attached straight to
//! its handle, and a scripted origin site.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::broker::config::BrokerConfig;
use crate::broker::connection::Outgoing;
use crate::broker::handle::BrokerHandle;
use crate::broker::hierarchy::NoHierarchy;
use crate::broker::state::ConnectionId;
use crate::broker::{Broker, Listeners};
use crate::ipc::protocol::{Message, PROTOCOL_VERSION, Registration, Role};
use crate::session::origin::{OriginError, OriginLogin, OriginSiteClient};
use crate::session::relay::RelayPolicy;
use crate::session::service::SessionService;
use crate::session::store::{Credentials, MemorySessionStore};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Broker loop without listeners. Stops when dropped.
pub struct TestBroker {
    pub handle: BrokerHandle,
    pub service: Arc<SessionService>,
    pub store: Arc<MemorySessionStore>,
    pub origin: Arc<FakeOrigin>,
    _shutdown: oneshot::Sender<()>,
}

impl TestBroker {
    pub fn start() -> Self {
        Self::with_config(BrokerConfig {
            relay: RelayPolicy {
                max_attempts: 2,
                per_attempt_timeout: Duration::from_millis(500),
                backoff: Duration::from_millis(20),
            },
            logout_timeout: Duration::from_millis(300),
            ..BrokerConfig::default()
        })
    }

    pub fn with_config(config: BrokerConfig) -> Self {
        let store = Arc::new(MemorySessionStore::new());
        let origin = Arc::new(FakeOrigin::default());
        let broker = Broker::new(config, store.clone(), origin.clone(), Arc::new(NoHierarchy));
        let handle = broker.handle();
        let service = broker.service();
        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(broker.run(Listeners::default(), async move {
            let _ = rx.await;
        }));
        Self {
            handle,
            service,
            store,
            origin,
            _shutdown: tx,
        }
    }
}

/// An agent attached to the broker through its handle, with no socket.
pub struct FakeAgent {
    pub id: ConnectionId,
    handle: BrokerHandle,
    rx: mpsc::UnboundedReceiver<Outgoing>,
}

impl FakeAgent {
    pub async fn connect(handle: &BrokerHandle) -> Self {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        handle.attach(id, tx).unwrap();
        let mut agent = Self {
            id,
            handle: handle.clone(),
            rx,
        };
        agent.send(Message::Hello {
            version: PROTOCOL_VERSION,
            role: Role::Agent,
        });
        assert!(matches!(
            agent.next_message().await,
            Some(Message::HelloAck { .. })
        ));
        agent
    }

    /// Connect and register, waiting for `registration_success`.
    pub async fn register(
        handle: &BrokerHandle,
        node_id: &str,
        client_id: &str,
        user_id: Option<&str>,
    ) -> Self {
        let mut agent = Self::connect(handle).await;
        agent.send(Message::Register(Registration {
            node_id: node_id.into(),
            client_id: client_id.into(),
            user_id: user_id.map(str::to_owned),
            ..Registration::default()
        }));
        match agent.next_message().await {
            Some(Message::RegistrationSuccess { .. }) => agent,
            other => panic!("expected registration_success, got {other:?}"),
        }
    }

    pub fn send(&self, message: Message) {
        self.handle.inbound(self.id, message).unwrap();
    }

    pub fn ack_relay(&self, success: bool) {
        self.send(Message::RelayAck {
            success,
            message: String::new(),
        });
    }

    pub fn ack_logout(&self, success: bool) {
        self.send(Message::LogoutAck {
            success,
            message: String::new(),
        });
    }

    /// Next message queued for this agent. A close with a notice shows up
    /// as `close_notice`; a bare close or a quiet queue yields `None`.
    pub async fn next_message(&mut self) -> Option<Message> {
        match tokio::time::timeout(RECV_TIMEOUT, self.rx.recv()).await {
            Ok(Some(item)) => unwrap_outgoing(item),
            _ => None,
        }
    }

    pub fn try_message(&mut self) -> Option<Message> {
        self.rx.try_recv().ok().and_then(unwrap_outgoing)
    }
}

fn unwrap_outgoing(item: Outgoing) -> Option<Message> {
    match item {
        Outgoing::Message(m) => Some(m),
        Outgoing::Close { notice } => notice.map(|reason| Message::CloseNotice { reason }),
    }
}

#[derive(Debug, Default)]
struct OriginLog {
    sessions: HashMap<String, Vec<u8>>,
    logins: usize,
    logouts: Vec<Vec<u8>>,
}

/// Origin that logs everyone in with token `login-<username>`.
#[derive(Debug, Default)]
pub struct FakeOrigin {
    log: Mutex<OriginLog>,
}

impl FakeOrigin {
    pub fn set_session(&self, username: &str, token: &[u8]) {
        self.log
            .lock()
            .unwrap()
            .sessions
            .insert(username.to_owned(), token.to_vec());
    }

    pub fn logins(&self) -> usize {
        self.log.lock().unwrap().logins
    }

    pub fn logouts(&self) -> Vec<Vec<u8>> {
        self.log.lock().unwrap().logouts.clone()
    }
}

#[async_trait]
impl OriginSiteClient for FakeOrigin {
    async fn fetch_session(&self, username: &str) -> Result<Option<Vec<u8>>, OriginError> {
        Ok(self.log.lock().unwrap().sessions.get(username).cloned())
    }

    async fn login(&self, credentials: &Credentials) -> Result<OriginLogin, OriginError> {
        self.log.lock().unwrap().logins += 1;
        Ok(OriginLogin {
            token: format!("login-{}", credentials.username).into_bytes(),
            user_id: credentials.username.clone(),
            username: credentials.username.clone(),
        })
    }

    async fn logout(&self, token: &[u8]) -> Result<(), OriginError> {
        self.log.lock().unwrap().logouts.push(token.to_vec());
        Ok(())
    }
}
