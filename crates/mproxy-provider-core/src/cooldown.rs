//! Per-(client, model) quota cooldowns and suspensions.
//!
//! Quota cooldowns expire on their own: readers compare the hit timestamp
//! against the wall clock, so no clear call is required. Suspensions are
//! sticky until `resume` (or a management reset).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use time::OffsetDateTime;

use crate::client::ClientId;

pub const QUOTA_COOLDOWN: Duration = Duration::from_secs(5 * 60);

/// Suspension reason that keeps the model advertised while the client is
/// skipped for selection.
pub const QUOTA_REASON: &str = "quota";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CooldownState {
    Ready,
    Quota { until: OffsetDateTime },
    Suspended { reason: String },
}

impl CooldownState {
    pub fn is_ready(&self) -> bool {
        matches!(self, CooldownState::Ready)
    }
}

type Key = (ClientId, String);

#[derive(Debug, Default)]
pub struct CooldownTracker {
    quota: RwLock<HashMap<Key, OffsetDateTime>>,
    suspended: RwLock<HashMap<Key, String>>,
}

impl CooldownTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_quota(&self, client: &str, model: &str) {
        let mut quota = self.quota.write().unwrap_or_else(|e| e.into_inner());
        quota.insert(
            (client.to_string(), model.to_string()),
            OffsetDateTime::now_utc(),
        );
    }

    pub fn clear_quota(&self, client: &str, model: &str) {
        let mut quota = self.quota.write().unwrap_or_else(|e| e.into_inner());
        quota.remove(&(client.to_string(), model.to_string()));
    }

    pub fn suspend(&self, client: &str, model: &str, reason: impl Into<String>) {
        let mut suspended = self.suspended.write().unwrap_or_else(|e| e.into_inner());
        suspended.insert((client.to_string(), model.to_string()), reason.into());
    }

    pub fn resume(&self, client: &str, model: &str) {
        let mut suspended = self.suspended.write().unwrap_or_else(|e| e.into_inner());
        suspended.remove(&(client.to_string(), model.to_string()));
    }

    pub fn state(&self, client: &str, model: &str) -> CooldownState {
        let key = (client.to_string(), model.to_string());
        {
            let suspended = self.suspended.read().unwrap_or_else(|e| e.into_inner());
            if let Some(reason) = suspended.get(&key) {
                return CooldownState::Suspended {
                    reason: reason.clone(),
                };
            }
        }
        let quota = self.quota.read().unwrap_or_else(|e| e.into_inner());
        if let Some(hit) = quota.get(&key) {
            let until = *hit + QUOTA_COOLDOWN;
            if OffsetDateTime::now_utc() < until {
                return CooldownState::Quota { until };
            }
        }
        CooldownState::Ready
    }

    /// Active quota hit timestamp for (client, model), if still in window.
    pub fn quota_hit(&self, client: &str, model: &str) -> Option<OffsetDateTime> {
        let quota = self.quota.read().unwrap_or_else(|e| e.into_inner());
        let hit = *quota.get(&(client.to_string(), model.to_string()))?;
        if OffsetDateTime::now_utc() - hit < QUOTA_COOLDOWN {
            Some(hit)
        } else {
            None
        }
    }

    pub fn suspension_reason(&self, client: &str, model: &str) -> Option<String> {
        let suspended = self.suspended.read().unwrap_or_else(|e| e.into_inner());
        suspended
            .get(&(client.to_string(), model.to_string()))
            .cloned()
    }

    /// Nearest quota-cooldown end across the given (client, model) pairs,
    /// used to derive Retry-After hints.
    pub fn nearest_recovery(&self, model: &str, clients: &[ClientId]) -> Option<OffsetDateTime> {
        let quota = self.quota.read().unwrap_or_else(|e| e.into_inner());
        let now = OffsetDateTime::now_utc();
        clients
            .iter()
            .filter_map(|client| {
                quota
                    .get(&(client.clone(), model.to_string()))
                    .map(|hit| *hit + QUOTA_COOLDOWN)
            })
            .filter(|until| *until > now)
            .min()
    }

    pub fn remove_client(&self, client: &str) {
        let mut quota = self.quota.write().unwrap_or_else(|e| e.into_inner());
        quota.retain(|(c, _), _| c != client);
        drop(quota);
        let mut suspended = self.suspended.write().unwrap_or_else(|e| e.into_inner());
        suspended.retain(|(c, _), _| c != client);
    }

    /// Drop quota entries whose window has already passed. Correctness does
    /// not depend on this; it only bounds the map.
    pub fn prune_expired(&self) {
        let now = OffsetDateTime::now_utc();
        let mut quota = self.quota.write().unwrap_or_else(|e| e.into_inner());
        quota.retain(|_, hit| now - *hit < QUOTA_COOLDOWN);
    }

    pub fn spawn_prune_task(self: &Arc<Self>) {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                tracker.prune_expired();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_state_reports_expiry_time() {
        let tracker = CooldownTracker::new();
        tracker.mark_quota("c1", "m");
        match tracker.state("c1", "m") {
            CooldownState::Quota { until } => {
                let remaining = until - OffsetDateTime::now_utc();
                assert!(remaining > time::Duration::minutes(4));
                assert!(remaining <= time::Duration::minutes(5));
            }
            other => panic!("unexpected state: {other:?}"),
        }
    }

    #[test]
    fn quota_cooldown_auto_clears_without_explicit_call() {
        let tracker = CooldownTracker::new();
        // Insert a hit that is already past the window.
        {
            let mut quota = tracker.quota.write().unwrap();
            quota.insert(
                ("c1".to_string(), "m".to_string()),
                OffsetDateTime::now_utc() - time::Duration::minutes(6),
            );
        }
        assert_eq!(tracker.state("c1", "m"), CooldownState::Ready);
    }

    #[test]
    fn suspension_is_sticky_until_resume() {
        let tracker = CooldownTracker::new();
        tracker.suspend("c1", "m", "credential");
        assert!(matches!(
            tracker.state("c1", "m"),
            CooldownState::Suspended { .. }
        ));
        tracker.resume("c1", "m");
        assert_eq!(tracker.state("c1", "m"), CooldownState::Ready);
    }

    #[test]
    fn suspension_shadows_quota() {
        let tracker = CooldownTracker::new();
        tracker.mark_quota("c1", "m");
        tracker.suspend("c1", "m", "banned");
        assert!(matches!(
            tracker.state("c1", "m"),
            CooldownState::Suspended { reason } if reason == "banned"
        ));
    }

    #[test]
    fn prune_drops_only_expired_entries() {
        let tracker = CooldownTracker::new();
        tracker.mark_quota("fresh", "m");
        {
            let mut quota = tracker.quota.write().unwrap();
            quota.insert(
                ("stale".to_string(), "m".to_string()),
                OffsetDateTime::now_utc() - time::Duration::minutes(10),
            );
        }
        tracker.prune_expired();
        assert!(tracker.quota_hit("fresh", "m").is_some());
        assert!(tracker.quota_hit("stale", "m").is_none());
    }
}
