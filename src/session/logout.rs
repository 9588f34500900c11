//! Logout fan-out with a bounded acknowledgment wait.
//!
//! Fail-open: once the wait ends, every targeted connection is evicted
//! and the account's cached session is dropped whether or not all the
//! agents answered.

use std::sync::Arc;
use std::time::Duration;

use crate::broker::ack::collect_acks;
use crate::broker::handle::BrokerHandle;

use super::service::ServiceError;
use super::store::{SessionBlob, SessionStore};

/// Close reason sent to agents evicted by logout.
pub const LOGGED_OUT_REASON: &str = "logged out";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogoutSummary {
    /// Connections that answered the logout, successfully or not.
    pub delivered: usize,
    /// Connections that never answered.
    pub missing: usize,
}

pub struct LogoutCoordinator {
    handle: BrokerHandle,
    store: Arc<dyn SessionStore>,
    ack_timeout: Duration,
}

impl LogoutCoordinator {
    pub fn new(handle: BrokerHandle, store: Arc<dyn SessionStore>, ack_timeout: Duration) -> Self {
        Self {
            handle,
            store,
            ack_timeout,
        }
    }

    /// Log `user_id` out everywhere.
    ///
    /// Returns the summary plus the session blob that was cached for the
    /// account, if any, so the caller can revoke it on the origin.
    pub async fn logout(
        &self,
        user_id: &str,
    ) -> Result<(LogoutSummary, Option<SessionBlob>), ServiceError> {
        let pending = self.handle.dispatch_logout(user_id).await?;
        let mut summary = LogoutSummary::default();

        if !pending.is_empty() {
            let targets: Vec<_> = pending.iter().map(|p| p.connection_id).collect();
            let tally = collect_acks(pending, self.ack_timeout).await;
            summary.delivered = tally.answered();
            summary.missing = tally.missing.len();

            let evicted = self.handle.evict(targets, LOGGED_OUT_REASON).await?;
            tracing::debug!(%user_id, evicted, "logout targets evicted");
            for (conn_id, message) in &tally.refused {
                tracing::warn!(%user_id, %conn_id, %message, "agent reported logout failure");
            }
        }

        // Suppress auto-relay even when nobody was connected.
        let session = self.store.invalidate_session(user_id).await?;
        self.store.mark_logged_out(user_id).await?;

        if summary.missing > 0 {
            tracing::warn!(
                %user_id,
                delivered = summary.delivered,
                missing = summary.missing,
                "logout completed without every acknowledgment"
            );
        } else {
            tracing::info!(%user_id, delivered = summary.delivered, "logout completed");
        }
        Ok((summary, session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::ipc::protocol::Message;
    use crate::testing::{FakeAgent, TestBroker};

    fn coordinator(broker: &TestBroker, timeout: Duration) -> LogoutCoordinator {
        LogoutCoordinator::new(broker.handle.clone(), broker.store.clone(), timeout)
    }

    #[tokio::test]
    async fn no_connections_still_marks_account() {
        let broker = TestBroker::start();
        broker
            .store
            .put_session(SessionBlob {
                user_id: "u1".into(),
                username: "alice".into(),
                payload: b"tok".to_vec(),
            })
            .await
            .unwrap();

        let (summary, session) = coordinator(&broker, Duration::from_secs(5))
            .logout("u1")
            .await
            .unwrap();
        assert_eq!(summary, LogoutSummary::default());
        assert_eq!(session.map(|s| s.payload), Some(b"tok".to_vec()));
        assert!(broker.store.is_logged_out("u1").await.unwrap());
        assert!(broker.store.get_session("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn silent_agents_are_still_evicted() {
        let broker = TestBroker::start();
        let mut a = FakeAgent::register(&broker.handle, "n1", "c1", Some("u1")).await;
        let mut b = FakeAgent::register(&broker.handle, "n2", "c2", Some("u1")).await;

        let (summary, _) = coordinator(&broker, Duration::from_millis(100))
            .logout("u1")
            .await
            .unwrap();
        assert_eq!(
            summary,
            LogoutSummary {
                delivered: 0,
                missing: 2
            }
        );
        assert!(broker.handle.list_connections(None).await.unwrap().is_empty());
        assert!(broker.handle.connections_for("u1").await.unwrap().is_empty());

        for agent in [&mut a, &mut b] {
            assert!(matches!(agent.next_message().await, Some(Message::Logout { .. })));
            assert!(matches!(
                agent.next_message().await,
                Some(Message::CloseNotice { reason }) if reason == LOGGED_OUT_REASON
            ));
        }
    }

    #[tokio::test]
    async fn partial_acknowledgment_counts_missing() {
        let broker = TestBroker::start();
        let mut a = FakeAgent::register(&broker.handle, "n1", "c1", Some("u1")).await;
        let _b = FakeAgent::register(&broker.handle, "n2", "c2", Some("u1")).await;

        let answering = tokio::spawn(async move {
            let got = a.next_message().await;
            a.ack_logout(true);
            (a, got)
        });
        let (summary, _) = coordinator(&broker, Duration::from_millis(300))
            .logout("u1")
            .await
            .unwrap();
        let (_a, got) = answering.await.unwrap();

        assert!(matches!(got, Some(Message::Logout { .. })));
        assert_eq!(summary.delivered, 1);
        assert_eq!(summary.missing, 1);
        assert!(broker.handle.list_connections(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn other_users_untouched() {
        let broker = TestBroker::start();
        let _a = FakeAgent::register(&broker.handle, "n1", "c1", Some("u1")).await;
        let other = FakeAgent::register(&broker.handle, "n2", "c2", Some("u2")).await;

        coordinator(&broker, Duration::from_millis(50))
            .logout("u1")
            .await
            .unwrap();
        assert_eq!(
            broker.handle.connections_for("u2").await.unwrap(),
            vec![other.id]
        );
    }
}
