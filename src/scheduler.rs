//! Periodic background re-verification of stored users.
//!
//! Each cycle re-fetches a batch of due users through the shared gateway,
//! applies the results to the guilds, and reschedules. Failures back off
//! exponentially per user; a cycle never aborts because one user failed.

use chrono::Utc;
use poise::serenity_prelude::UserId;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::{AutoRecheckConfig, GuildSyncConfig};
use crate::coordinator::RecheckCoordinator;
use crate::error::BotError;
use crate::platform::{GuildSync, Remediation};
use crate::rsi::SharedRsiGateway;
use crate::storage::SharedVerificationStore;

/// Exponential backoff delay in minutes: `min(base * 2^(fail_count-1), max)`.
pub fn backoff_delay_minutes(fail_count: u32, base_minutes: u64, max_minutes: u64) -> u64 {
    let exponent = fail_count.saturating_sub(1).min(20);
    base_minutes
        .saturating_mul(1u64 << exponent)
        .min(max_minutes)
}

/// Periodic batch driver for re-verification.
pub struct AutoRecheckScheduler {
    gateway: SharedRsiGateway,
    store: SharedVerificationStore,
    guild_sync: Arc<dyn GuildSync>,
    remediation: Arc<dyn Remediation>,
    coordinator: RecheckCoordinator,
    recheck: AutoRecheckConfig,
    sync: GuildSyncConfig,
}

impl AutoRecheckScheduler {
    pub fn new(
        gateway: SharedRsiGateway,
        store: SharedVerificationStore,
        guild_sync: Arc<dyn GuildSync>,
        remediation: Arc<dyn Remediation>,
        coordinator: RecheckCoordinator,
        recheck: AutoRecheckConfig,
        sync: GuildSyncConfig,
    ) -> Self {
        Self {
            gateway,
            store,
            guild_sync,
            remediation,
            coordinator,
            recheck,
            sync,
        }
    }

    /// Spawn the periodic task. Returns the handle so shutdown can abort it;
    /// an in-flight cycle is abandoned, which is fine because all state
    /// lives in the store.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let period = Duration::from_secs(self.recheck.batch.run_every_minutes.max(1) * 60);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so startup is quiet
            interval.tick().await;
            loop {
                interval.tick().await;
                self.run_cycle().await;
            }
        })
    }

    /// One recheck cycle. Defers entirely when a bulk job holds the
    /// coordinator.
    pub async fn run_cycle(&self) {
        let Some(_guard) = self.coordinator.try_acquire() else {
            info!("Bulk verification in progress, deferring auto-recheck cycle");
            return;
        };

        let now = Utc::now();
        let due = match self
            .store
            .get_due_users(now, self.recheck.batch.max_users_per_run)
            .await
        {
            Ok(due) => due,
            Err(e) => {
                error!("Failed to fetch due users: {}", e);
                return;
            }
        };

        if due.is_empty() {
            debug!("Auto-recheck cycle: no users due");
            return;
        }

        info!("Auto-recheck cycle: {} users due", due.len());
        for user_id in due {
            self.recheck_user(user_id).await;
        }
    }

    async fn recheck_user(&self, user_id: UserId) {
        let stored = match self.store.load(user_id).await {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                warn!("User {} was due but has no stored record, skipping", user_id);
                return;
            }
            Err(e) => {
                error!("Failed to load record for {}: {}", user_id, e);
                return;
            }
        };

        match self.gateway.get_snapshot(user_id, &stored.handle, false).await {
            Err(BotError::HandleNotFound { handle }) => {
                if let Err(e) = self.remediation.handle_missing(user_id, &handle).await {
                    error!("Remediation failed for {}: {}", user_id, e);
                }
            }
            Err(e) => {
                self.record_failure(user_id, &e.to_string()).await;
            }
            Ok(snapshot) if !snapshot.is_clean() => {
                let reason = snapshot.error.clone().unwrap_or_else(|| "unknown".to_string());
                self.record_failure(user_id, &reason).await;
            }
            Ok(snapshot) => {
                // Roles are applied before the store so the sync's "before"
                // view still reflects pre-update data
                if let Err(e) = self
                    .guild_sync
                    .apply(&snapshot, self.sync.batch_size, self.sync.max_concurrency)
                    .await
                {
                    warn!("Guild sync failed for {}: {}", user_id, e);
                }

                match self.store.store(&snapshot).await {
                    Ok(()) => {}
                    Err(BotError::HandleConflict { handle, owner }) => {
                        warn!(
                            "Handle '{}' for {} now owned by {}, skipping",
                            handle, user_id, owner
                        );
                        return;
                    }
                    Err(e) => {
                        error!("Failed to store snapshot for {}: {}", user_id, e);
                        return;
                    }
                }

                let next =
                    Utc::now() + chrono::Duration::minutes(self.recheck.recheck_interval_minutes as i64);
                if let Err(e) = self.store.schedule_recheck(user_id, 0, next).await {
                    error!("Failed to schedule next recheck for {}: {}", user_id, e);
                }
                debug!("Recheck complete for {} ({})", user_id, stored.handle);
            }
        }
    }

    async fn record_failure(&self, user_id: UserId, reason: &str) {
        let fail_count = match self.store.get_fail_count(user_id).await {
            Ok(count) => count + 1,
            Err(e) => {
                error!("Failed to read fail count for {}: {}", user_id, e);
                1
            }
        };

        let delay = backoff_delay_minutes(
            fail_count,
            self.recheck.backoff.base_minutes,
            self.recheck.backoff.max_minutes,
        );
        warn!(
            "Recheck failed for {} ({} consecutive), retrying in {} minutes: {}",
            user_id, fail_count, delay, reason
        );

        let next = Utc::now() + chrono::Duration::minutes(delay as i64);
        if let Err(e) = self.store.schedule_recheck(user_id, fail_count, next).await {
            error!("Failed to schedule retry for {}: {}", user_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RsiConfig;
    use crate::error::Result;
    use crate::models::VerificationSnapshot;
    use crate::platform::SyncOutcome;
    use crate::rsi::{HtmlFetcher, RsiGateway};
    use crate::storage::VerificationStore;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use poise::serenity_prelude::GuildId;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    const ORG_HTML: &str = r#"
        <div class="box-content org main">
            <div class="info"><p class="entry"><a class="value">TEST Squadron</a></p></div>
        </div>
    "#;

    struct ScriptedFetcher {
        org_not_found: AtomicBool,
        org_fails: AtomicBool,
    }

    #[async_trait]
    impl HtmlFetcher for ScriptedFetcher {
        async fn fetch_html(&self, url: &str) -> Result<String> {
            if url.ends_with("/organizations") {
                if self.org_not_found.load(Ordering::SeqCst) {
                    return Err(BotError::PageNotFound {
                        url: url.to_string(),
                    });
                }
                if self.org_fails.load(Ordering::SeqCst) {
                    return Err(BotError::Fetch {
                        message: "connection reset".to_string(),
                    });
                }
                Ok(ORG_HTML.to_string())
            } else {
                Ok("<span class=\"moniker\">Tester</span>".to_string())
            }
        }
    }

    #[derive(Clone)]
    struct CallLog(Arc<StdMutex<Vec<String>>>);

    impl CallLog {
        fn new() -> Self {
            Self(Arc::new(StdMutex::new(Vec::new())))
        }

        fn push(&self, entry: impl Into<String>) {
            self.0.lock().unwrap().push(entry.into());
        }

        fn entries(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    struct MemStore {
        records: StdMutex<HashMap<UserId, (String, u32, Option<DateTime<Utc>>)>>,
        conflict_on_store: AtomicBool,
        log: CallLog,
    }

    impl MemStore {
        fn new(log: CallLog) -> Self {
            Self {
                records: StdMutex::new(HashMap::new()),
                conflict_on_store: AtomicBool::new(false),
                log,
            }
        }

        fn insert(&self, user_id: UserId, handle: &str) {
            self.records
                .lock()
                .unwrap()
                .insert(user_id, (handle.to_string(), 0, None));
        }

        fn schedule_of(&self, user_id: UserId) -> Option<(u32, Option<DateTime<Utc>>)> {
            self.records
                .lock()
                .unwrap()
                .get(&user_id)
                .map(|(_, fails, next)| (*fails, *next))
        }
    }

    #[async_trait]
    impl crate::storage::VerificationStore for MemStore {
        async fn store(&self, snapshot: &VerificationSnapshot) -> Result<()> {
            if self.conflict_on_store.load(Ordering::SeqCst) {
                return Err(BotError::HandleConflict {
                    handle: snapshot.handle.clone(),
                    owner: "999".to_string(),
                });
            }
            self.log.push(format!("store:{}", snapshot.user_id));
            let mut records = self.records.lock().unwrap();
            let entry = records
                .entry(snapshot.user_id)
                .or_insert_with(|| (snapshot.handle.clone(), 0, None));
            entry.0 = snapshot.handle.clone();
            Ok(())
        }

        async fn load(&self, user_id: UserId) -> Result<Option<VerificationSnapshot>> {
            Ok(self.records.lock().unwrap().get(&user_id).map(|(handle, _, _)| {
                VerificationSnapshot::new(user_id, handle.clone(), vec![], vec![], None)
            }))
        }

        async fn get_due_users(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<UserId>> {
            let records = self.records.lock().unwrap();
            let mut due: Vec<UserId> = records
                .iter()
                .filter(|(_, (_, _, next))| next.map(|at| at <= now).unwrap_or(true))
                .map(|(id, _)| *id)
                .collect();
            due.sort_by_key(|id| id.get());
            due.truncate(limit);
            Ok(due)
        }

        async fn get_fail_count(&self, user_id: UserId) -> Result<u32> {
            Ok(self
                .records
                .lock()
                .unwrap()
                .get(&user_id)
                .map(|(_, fails, _)| *fails)
                .unwrap_or(0))
        }

        async fn schedule_recheck(
            &self,
            user_id: UserId,
            fail_count: u32,
            next_retry_at: DateTime<Utc>,
        ) -> Result<()> {
            self.log
                .push(format!("schedule:{}:{}", user_id, fail_count));
            let mut records = self.records.lock().unwrap();
            let entry = records.get_mut(&user_id).ok_or(BotError::NotVerified {
                user_id: user_id.to_string(),
            })?;
            entry.1 = fail_count;
            entry.2 = Some(next_retry_at);
            Ok(())
        }

        async fn check_handle_conflict(
            &self,
            _handle: &str,
            _user_id: UserId,
        ) -> Result<Option<UserId>> {
            Ok(None)
        }
    }

    struct MemGuildSync {
        log: CallLog,
    }

    #[async_trait]
    impl GuildSync for MemGuildSync {
        async fn apply(
            &self,
            snapshot: &VerificationSnapshot,
            _batch_size: usize,
            _max_concurrency: usize,
        ) -> Result<Vec<SyncOutcome>> {
            self.log.push(format!("sync:{}", snapshot.user_id));
            Ok(vec![SyncOutcome {
                guild_id: GuildId::new(1),
                changed: true,
                detail: "ok".to_string(),
            }])
        }
    }

    struct MemRemediation {
        log: CallLog,
    }

    #[async_trait]
    impl Remediation for MemRemediation {
        async fn handle_missing(&self, user_id: UserId, handle: &str) -> Result<()> {
            self.log.push(format!("remediate:{}:{}", user_id, handle));
            Ok(())
        }
    }

    struct Fixture {
        scheduler: AutoRecheckScheduler,
        store: Arc<MemStore>,
        fetcher: Arc<ScriptedFetcher>,
        coordinator: RecheckCoordinator,
        log: CallLog,
    }

    fn fixture() -> Fixture {
        let log = CallLog::new();
        let fetcher = Arc::new(ScriptedFetcher {
            org_not_found: AtomicBool::new(false),
            org_fails: AtomicBool::new(false),
        });
        let gateway = Arc::new(RsiGateway::new(
            fetcher.clone(),
            &RsiConfig {
                base_url: "https://example.test".to_string(),
                min_interval_seconds: 0.0,
                ..RsiConfig::default()
            },
        ));
        let store = Arc::new(MemStore::new(log.clone()));
        let coordinator = RecheckCoordinator::new();
        let scheduler = AutoRecheckScheduler::new(
            gateway,
            store.clone(),
            Arc::new(MemGuildSync { log: log.clone() }),
            Arc::new(MemRemediation { log: log.clone() }),
            coordinator.clone(),
            AutoRecheckConfig::default(),
            GuildSyncConfig::default(),
        );
        Fixture {
            scheduler,
            store,
            fetcher,
            coordinator,
            log,
        }
    }

    #[test]
    fn test_backoff_delay_progression() {
        assert_eq!(backoff_delay_minutes(1, 180, 1440), 180);
        assert_eq!(backoff_delay_minutes(2, 180, 1440), 360);
        assert_eq!(backoff_delay_minutes(3, 180, 1440), 720);
        assert_eq!(backoff_delay_minutes(4, 180, 1440), 1440);
        assert_eq!(backoff_delay_minutes(12, 180, 1440), 1440);
    }

    #[tokio::test]
    async fn test_cycle_defers_while_coordinator_held() {
        let fx = fixture();
        fx.store.insert(UserId::new(1), "Foo");

        let _guard = fx.coordinator.acquire().await;
        fx.scheduler.run_cycle().await;

        assert!(fx.log.entries().is_empty());
    }

    #[tokio::test]
    async fn test_success_syncs_before_store_then_resets() {
        let fx = fixture();
        fx.store.insert(UserId::new(1), "Foo");

        fx.scheduler.run_cycle().await;

        assert_eq!(
            fx.log.entries(),
            vec!["sync:1", "store:1", "schedule:1:0"]
        );
        let (fails, next) = fx.store.schedule_of(UserId::new(1)).unwrap();
        assert_eq!(fails, 0);
        assert!(next.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn test_not_found_triggers_remediation_only() {
        let fx = fixture();
        fx.store.insert(UserId::new(1), "Gone");
        fx.fetcher.org_not_found.store(true, Ordering::SeqCst);

        fx.scheduler.run_cycle().await;

        assert_eq!(fx.log.entries(), vec!["remediate:1:Gone"]);
        // No backoff was recorded
        assert_eq!(fx.store.schedule_of(UserId::new(1)).unwrap().0, 0);
    }

    #[tokio::test]
    async fn test_transient_failure_backs_off_exponentially() {
        let fx = fixture();
        fx.store.insert(UserId::new(1), "Foo");
        fx.fetcher.org_fails.store(true, Ordering::SeqCst);

        fx.scheduler.run_cycle().await;
        let (fails, first_next) = fx.store.schedule_of(UserId::new(1)).unwrap();
        assert_eq!(fails, 1);
        let first_next = first_next.unwrap();
        // base_minutes=180: first retry roughly three hours out
        assert!(first_next > Utc::now() + chrono::Duration::minutes(175));
        assert!(first_next < Utc::now() + chrono::Duration::minutes(185));

        // Force the user due again and fail a second time
        fx.store
            .schedule_recheck(UserId::new(1), 1, Utc::now() - chrono::Duration::minutes(1))
            .await
            .unwrap();
        fx.scheduler.run_cycle().await;
        let (fails, second_next) = fx.store.schedule_of(UserId::new(1)).unwrap();
        assert_eq!(fails, 2);
        assert!(second_next.unwrap() > Utc::now() + chrono::Duration::minutes(355));
    }

    #[tokio::test]
    async fn test_conflict_on_store_skips_user_but_not_cycle() {
        let fx = fixture();
        fx.store.insert(UserId::new(1), "Foo");
        fx.store.insert(UserId::new(2), "Bar");
        fx.store.conflict_on_store.store(true, Ordering::SeqCst);

        fx.scheduler.run_cycle().await;

        // Both users were attempted (sync runs first), neither was
        // rescheduled because the store rejected both
        assert_eq!(fx.log.entries(), vec!["sync:1", "sync:2"]);
    }
}
