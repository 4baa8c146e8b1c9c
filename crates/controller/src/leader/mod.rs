use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use foreman_common::types::MasterRecord;

use crate::store::StoreClient;

/// Picks exactly one active controller among replicas via heartbeat-based
/// election over shared heartbeat rows.
pub struct LeaderMonitor {
    master_id: String,
    heartbeat_interval: Duration,
    timeout: Duration,
    failover_enabled: bool,
    active: AtomicBool,
    store: Arc<StoreClient>,
}

impl LeaderMonitor {
    pub fn new(
        master_id: String,
        heartbeat_interval: Duration,
        timeout: Duration,
        failover_enabled: bool,
        store: Arc<StoreClient>,
    ) -> Self {
        Self {
            master_id,
            heartbeat_interval,
            timeout,
            failover_enabled,
            active: AtomicBool::new(!failover_enabled),
            store,
        }
    }

    pub fn master_id(&self) -> &str {
        &self.master_id
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// True iff failover is disabled or this replica holds the leadership.
    /// Every external entry point into routing checks this first; a
    /// standby returns a not-leader error so callers retry elsewhere.
    pub fn should_process_request(&self) -> bool {
        !self.failover_enabled || self.active.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// One election tick: write our heartbeat, read all replicas, settle
    /// who leads, and apply self-transitions.
    pub async fn tick(&self) -> Result<(), foreman_common::ForemanError> {
        self.store.upsert_master_heartbeat(&self.master_id).await?;

        if !self.failover_enabled {
            return Ok(());
        }

        let replicas = self.store.get_masters().await?;
        let elected = elect(&replicas, Utc::now(), self.timeout);

        let was_active = self.active.load(Ordering::SeqCst);
        match elected.as_deref() {
            Some(winner) if winner == self.master_id => {
                if !was_active {
                    self.become_active().await?;
                }
            }
            Some(winner) => {
                if was_active {
                    self.become_standby(winner).await;
                }
            }
            None => {
                // Nobody live — nothing to claim yet.
                if was_active {
                    self.become_standby("none").await;
                }
            }
        }

        metrics::gauge!("leader.active").set(if self.is_active() { 1.0 } else { 0.0 });
        Ok(())
    }

    async fn become_active(&self) -> Result<(), foreman_common::ForemanError> {
        self.store.set_active_master(&self.master_id).await?;
        self.active.store(true, Ordering::SeqCst);
        tracing::info!(master_id = %self.master_id, "Elected active controller");
        metrics::counter!("leader.elections").increment(1);
        Ok(())
    }

    async fn become_standby(&self, winner: &str) {
        self.active.store(false, Ordering::SeqCst);
        tracing::warn!(
            master_id = %self.master_id,
            active = winner,
            "Stepping down to standby"
        );
    }

    /// Current active replica id, for health and error responses.
    pub async fn active_master(&self) -> Option<String> {
        match self.store.get_masters().await {
            Ok(replicas) => replicas
                .into_iter()
                .find(|r| r.is_active)
                .map(|r| r.master_id),
            Err(_) => None,
        }
    }
}

/// Pure election over replica heartbeat rows.
///
/// 1. A replica already flagged active whose heartbeat age is inside the
///    timeout keeps the lease.
/// 2. Otherwise the smallest id among live replicas wins.
///
/// Ages are interval arithmetic over stored timestamps; a missing or
/// malformed timestamp means unknown age, which counts as expired. A
/// heartbeat ahead of `now` (clock skew) counts as age zero.
pub fn elect(replicas: &[MasterRecord], now: DateTime<Utc>, timeout: Duration) -> Option<String> {
    let is_live = |r: &MasterRecord| -> bool {
        match r.last_heartbeat {
            Some(hb) => {
                let age = (now - hb).to_std().unwrap_or(Duration::ZERO);
                age < timeout
            }
            None => false,
        }
    };

    if let Some(current) = replicas.iter().find(|r| r.is_active && is_live(r)) {
        return Some(current.master_id.clone());
    }

    replicas
        .iter()
        .filter(|r| is_live(r))
        .map(|r| r.master_id.clone())
        .min()
}

/// Background election loop, one tick per heartbeat interval.
pub fn spawn_leader_loop(
    monitor: Arc<LeaderMonitor>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = monitor.heartbeat_interval();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = monitor.tick().await {
                        tracing::error!(error = %e, "Leader election tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("Leader loop shutting down");
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn record(id: &str, age_secs: i64, active: bool) -> MasterRecord {
        MasterRecord {
            master_id: id.into(),
            last_heartbeat: Some(Utc::now() - TimeDelta::seconds(age_secs)),
            is_active: active,
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(15);

    #[test]
    fn test_live_active_replica_keeps_lease() {
        let replicas = vec![record("master-2", 2, true), record("master-1", 2, false)];
        assert_eq!(
            elect(&replicas, Utc::now(), TIMEOUT).as_deref(),
            Some("master-2")
        );
    }

    #[test]
    fn test_failover_elects_smallest_live_id() {
        // master-1 was active but its heartbeat expired.
        let replicas = vec![
            record("master-1", 60, true),
            record("master-3", 2, false),
            record("master-2", 2, false),
        ];
        assert_eq!(
            elect(&replicas, Utc::now(), TIMEOUT).as_deref(),
            Some("master-2")
        );
    }

    #[test]
    fn test_heartbeat_at_timeout_boundary_is_expired() {
        let replicas = vec![record("master-1", 15, true), record("master-2", 2, false)];
        assert_eq!(
            elect(&replicas, Utc::now(), TIMEOUT).as_deref(),
            Some("master-2")
        );
    }

    #[test]
    fn test_missing_heartbeat_counts_as_expired() {
        let replicas = vec![
            MasterRecord {
                master_id: "master-1".into(),
                last_heartbeat: None,
                is_active: true,
            },
            record("master-2", 1, false),
        ];
        assert_eq!(
            elect(&replicas, Utc::now(), TIMEOUT).as_deref(),
            Some("master-2")
        );
    }

    #[test]
    fn test_future_heartbeat_counts_as_live() {
        // Clock skew: heartbeat a few seconds ahead of us.
        let replicas = vec![record("master-1", -3, false)];
        assert_eq!(
            elect(&replicas, Utc::now(), TIMEOUT).as_deref(),
            Some("master-1")
        );
    }

    #[test]
    fn test_no_live_replicas_elects_nobody() {
        let replicas = vec![record("master-1", 120, false), record("master-2", 90, true)];
        assert_eq!(elect(&replicas, Utc::now(), TIMEOUT), None);
    }
}
