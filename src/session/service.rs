//! Glue between the broker and its collaborators: the session store and
//! the origin site.

use std::fmt;
use std::sync::Arc;

use crate::broker::config::BrokerConfig;
use crate::broker::handle::{BrokerHandle, HandleError};

use super::logout::{LogoutCoordinator, LogoutSummary};
use super::origin::{OriginError, OriginSiteClient};
use super::relay::SessionRelay;
use super::store::{SessionBlob, SessionStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Origin(#[from] OriginError),
    #[error(transparent)]
    Broker(#[from] HandleError),
}

/// What [`SessionService::relay_for_user`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Delivered,
    NotDelivered,
    /// Nothing cached and no way to log in.
    NoSession,
    /// The account is logged out; auto-relay is suppressed.
    LoggedOut,
}

impl RelayOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RelayOutcome::Delivered => "delivered",
            RelayOutcome::NotDelivered => "not_delivered",
            RelayOutcome::NoSession => "no_session",
            RelayOutcome::LoggedOut => "logged_out",
        }
    }
}

impl fmt::Display for RelayOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct SessionService {
    relay: SessionRelay,
    logout: LogoutCoordinator,
    store: Arc<dyn SessionStore>,
    origin: Arc<dyn OriginSiteClient>,
}

impl SessionService {
    pub fn new(
        handle: BrokerHandle,
        config: &BrokerConfig,
        store: Arc<dyn SessionStore>,
        origin: Arc<dyn OriginSiteClient>,
    ) -> Self {
        Self {
            relay: SessionRelay::new(handle.clone(), config.relay),
            logout: LogoutCoordinator::new(handle, Arc::clone(&store), config.logout_timeout),
            store,
            origin,
        }
    }

    /// Relay the user's session to their connections, logging in on the
    /// origin first if nothing is cached but credentials are. A user with
    /// no connections is never logged in on the origin.
    pub async fn relay_for_user(&self, user_id: &str) -> Result<RelayOutcome, ServiceError> {
        if self.store.is_logged_out(user_id).await? {
            return Ok(RelayOutcome::LoggedOut);
        }
        if !self.relay.has_connections(user_id).await? {
            tracing::debug!(%user_id, "no connections, relay skipped");
            return Ok(RelayOutcome::NotDelivered);
        }
        let blob = match self.store.get_session(user_id).await? {
            Some(blob) => blob,
            None => match self.obtain_session(user_id).await? {
                Some(blob) => blob,
                None => return Ok(RelayOutcome::NoSession),
            },
        };
        if self.relay.deliver(user_id, &blob.payload).await? {
            Ok(RelayOutcome::Delivered)
        } else {
            Ok(RelayOutcome::NotDelivered)
        }
    }

    async fn obtain_session(&self, user_id: &str) -> Result<Option<SessionBlob>, ServiceError> {
        let Some(credentials) = self.store.credentials(user_id).await? else {
            return Ok(None);
        };
        let (payload, username) = match self.origin.fetch_session(&credentials.username).await? {
            Some(token) => (token, credentials.username.clone()),
            None => {
                let login = self.origin.login(&credentials).await?;
                tracing::info!(%user_id, origin_user = %login.user_id, "logged in on origin");
                (login.token, login.username)
            }
        };
        let blob = SessionBlob {
            user_id: user_id.to_owned(),
            username,
            payload,
        };
        self.store.put_session(blob.clone()).await?;
        Ok(Some(blob))
    }

    /// Log the user out on every connection, then on the origin.
    pub async fn logout_user(&self, user_id: &str) -> Result<LogoutSummary, ServiceError> {
        let (summary, session) = self.logout.logout(user_id).await?;
        if let Some(blob) = session {
            let origin = Arc::clone(&self.origin);
            let user_id = user_id.to_owned();
            tokio::spawn(async move {
                if let Err(e) = origin.logout(&blob.payload).await {
                    tracing::warn!(%user_id, error = %e, "origin logout failed");
                }
            });
        }
        Ok(summary)
    }

    /// Store a freshly captured session. Re-enables auto-relay.
    pub async fn store_session(&self, blob: SessionBlob) -> Result<(), ServiceError> {
        let user_id = blob.user_id.clone();
        self.store.put_session(blob).await?;
        self.store.clear_logged_out(&user_id).await?;
        tracing::info!(%user_id, "session stored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::ipc::protocol::Message;
    use crate::session::store::Credentials;
    use crate::testing::{FakeAgent, TestBroker};

    fn blob(user: &str, token: &[u8]) -> SessionBlob {
        SessionBlob {
            user_id: user.into(),
            username: format!("{user}-name"),
            payload: token.to_vec(),
        }
    }

    #[tokio::test]
    async fn no_cached_session_and_no_credentials() {
        let broker = TestBroker::start();
        let out = broker.service.relay_for_user("u1").await.unwrap();
        assert_eq!(out, RelayOutcome::NoSession);
    }

    #[tokio::test]
    async fn cached_session_is_relayed() {
        let broker = TestBroker::start();
        broker.service.store_session(blob("u1", b"tok-123")).await.unwrap();
        let mut agent = FakeAgent::register(&broker.handle, "n1", "c1", Some("u1")).await;

        // Registration already pushed the cached session once.
        assert!(matches!(
            agent.next_message().await,
            Some(Message::RelaySession { .. })
        ));
        agent.ack_relay(true);

        let answering = tokio::spawn(async move {
            let got = agent.next_message().await;
            agent.ack_relay(true);
            got
        });
        let out = broker.service.relay_for_user("u1").await.unwrap();
        assert_eq!(out, RelayOutcome::Delivered);
        assert!(matches!(
            answering.await.unwrap(),
            Some(Message::RelaySession { session_payload, .. }) if session_payload == b"tok-123"
        ));
    }

    #[tokio::test]
    async fn logged_out_account_is_not_relayed() {
        let broker = TestBroker::start();
        broker.service.store_session(blob("u1", b"tok")).await.unwrap();
        broker.service.logout_user("u1").await.unwrap();
        assert_eq!(
            broker.service.relay_for_user("u1").await.unwrap(),
            RelayOutcome::LoggedOut
        );

        broker.service.store_session(blob("u1", b"tok-2")).await.unwrap();
        assert_eq!(
            broker.service.relay_for_user("u1").await.unwrap(),
            RelayOutcome::NotDelivered
        );
    }

    fn alice() -> Credentials {
        Credentials {
            username: "alice".into(),
            password: "pw".into(),
        }
    }

    #[tokio::test]
    async fn no_connections_skips_origin_login() {
        let broker = TestBroker::start();
        broker.store.put_credentials("u1", alice()).await;

        let out = broker.service.relay_for_user("u1").await.unwrap();
        assert_eq!(out, RelayOutcome::NotDelivered);
        assert_eq!(broker.origin.logins(), 0);
        assert!(broker.store.get_session("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn credentials_trigger_origin_login() {
        let broker = TestBroker::start();
        broker.store.put_credentials("u1", alice()).await;

        // Binding runs the auto relay, which logs in and caches the token.
        let mut agent = FakeAgent::register(&broker.handle, "n1", "c1", Some("u1")).await;
        assert!(matches!(
            agent.next_message().await,
            Some(Message::RelaySession { session_payload, .. }) if session_payload == b"login-alice"
        ));
        agent.ack_relay(true);
        assert_eq!(broker.origin.logins(), 1);
        let cached = broker.store.get_session("u1").await.unwrap().unwrap();
        assert_eq!(cached.payload, b"login-alice");
        assert_eq!(cached.username, "alice");

        // Second relay uses the cache.
        let answering = tokio::spawn(async move {
            agent.next_message().await;
            agent.ack_relay(true);
        });
        assert_eq!(
            broker.service.relay_for_user("u1").await.unwrap(),
            RelayOutcome::Delivered
        );
        answering.await.unwrap();
        assert_eq!(broker.origin.logins(), 1);
    }

    #[tokio::test]
    async fn origin_session_preferred_over_login() {
        let broker = TestBroker::start();
        broker.origin.set_session("alice", b"live-token");
        broker.store.put_credentials("u1", alice()).await;

        let mut agent = FakeAgent::register(&broker.handle, "n1", "c1", Some("u1")).await;
        assert!(matches!(
            agent.next_message().await,
            Some(Message::RelaySession { session_payload, .. }) if session_payload == b"live-token"
        ));
        agent.ack_relay(true);
        assert_eq!(broker.origin.logins(), 0);
        let cached = broker.store.get_session("u1").await.unwrap().unwrap();
        assert_eq!(cached.payload, b"live-token");
    }

    #[tokio::test]
    async fn logout_revokes_token_on_origin() {
        let broker = TestBroker::start();
        broker.service.store_session(blob("u1", b"tok")).await.unwrap();
        let summary = broker.service.logout_user("u1").await.unwrap();
        assert_eq!(summary, LogoutSummary::default());

        // Origin logout is fire-and-forget.
        for _ in 0..50 {
            if !broker.origin.logouts().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(broker.origin.logouts(), vec![b"tok".to_vec()]);
    }
}
