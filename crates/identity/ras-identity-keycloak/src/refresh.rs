//! One token refresh per session at a time.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use ras_identity_core::AuthenticatedUser;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// How long a refreshed session is handed to requests that still carry
/// the replaced cookie.
pub const REFRESH_GRACE_SECONDS: i64 = 30;

#[derive(Debug, Clone)]
pub struct RefreshedSession {
    pub cookie_value: String,
    pub user: AuthenticatedUser,
    refreshed_at: DateTime<Utc>,
}

impl RefreshedSession {
    pub fn new(cookie_value: String, user: AuthenticatedUser) -> Self {
        Self {
            cookie_value,
            user,
            refreshed_at: Utc::now(),
        }
    }

    pub fn is_fresh(&self) -> bool {
        Utc::now() - self.refreshed_at < Duration::seconds(REFRESH_GRACE_SECONDS)
    }
}

type Slot = Arc<Mutex<Option<RefreshedSession>>>;

/// Serializes refreshes of the same session.
///
/// Keycloak may rotate refresh tokens, so a second refresh with the same
/// token fails. Requests that queue behind a successful refresh, or arrive
/// within the grace window with the old cookie, get the new session instead.
#[derive(Default)]
pub struct RefreshCoordinator {
    slots: DashMap<String, Slot>,
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to the refresh slot of `session_id`.
    ///
    /// The slot holds the outcome of an earlier successful refresh, if any.
    pub async fn lock(&self, session_id: &str) -> OwnedMutexGuard<Option<RefreshedSession>> {
        self.prune();
        let slot = self
            .slots
            .entry(session_id.to_string())
            .or_default()
            .clone();
        slot.lock_owned().await
    }

    /// The session that replaced `session_id`, if it was refreshed recently.
    pub async fn recent(&self, session_id: &str) -> Option<RefreshedSession> {
        let slot = self.slots.get(session_id).map(|entry| entry.value().clone())?;
        let refreshed = slot.lock().await;
        (*refreshed).clone().filter(RefreshedSession::is_fresh)
    }

    /// Drops the slot after a failed refresh.
    pub fn forget(&self, session_id: &str) {
        self.slots.remove(session_id);
    }

    // Slots in use are locked and kept
    fn prune(&self) {
        self.slots.retain(|_, slot| match slot.try_lock() {
            Ok(refreshed) => (*refreshed).as_ref().is_none_or(RefreshedSession::is_fresh),
            Err(_) => true,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> AuthenticatedUser {
        AuthenticatedUser {
            access_token: "access-2".to_string(),
            refresh_token: "refresh-2".to_string(),
            user_id: "u-1".to_string(),
            username: "alice".to_string(),
        }
    }

    #[tokio::test]
    async fn test_recent_refresh_is_shared() {
        let coordinator = RefreshCoordinator::new();
        assert!(coordinator.recent("s-1").await.is_none());

        {
            let mut slot = coordinator.lock("s-1").await;
            assert!(slot.is_none());
            *slot = Some(RefreshedSession::new("cookie".to_string(), user()));
        }

        let refreshed = coordinator.recent("s-1").await.unwrap();
        assert_eq!(refreshed.cookie_value, "cookie");
        assert_eq!(refreshed.user, user());
        assert!(coordinator.lock("s-1").await.is_some());
    }

    #[tokio::test]
    async fn test_stale_refreshes_are_pruned() {
        let coordinator = RefreshCoordinator::new();
        {
            let mut slot = coordinator.lock("old").await;
            let mut refreshed = RefreshedSession::new("cookie".to_string(), user());
            refreshed.refreshed_at = Utc::now() - Duration::seconds(REFRESH_GRACE_SECONDS + 1);
            *slot = Some(refreshed);
        }
        assert!(coordinator.recent("old").await.is_none());

        drop(coordinator.lock("other").await);
        assert_eq!(coordinator.slots.len(), 1);
    }

    #[tokio::test]
    async fn test_forget_drops_slot() {
        let coordinator = RefreshCoordinator::new();
        let slot = coordinator.lock("s-1").await;
        coordinator.forget("s-1");
        drop(slot);
        assert!(coordinator.slots.is_empty());
    }
}
