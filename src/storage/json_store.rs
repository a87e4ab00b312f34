//! JSON-file backend for the verification store.
//!
//! One versioned document holding every user record, saved atomically via a
//! temp file and rename.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use poise::serenity_prelude::UserId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{BotError, Result};
use crate::models::{derive_status, VerificationSnapshot};

use super::VerificationStore;

const DB_VERSION: u32 = 1;

/// Full document persisted to disk
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VerificationDatabase {
    /// Schema version for migrations
    version: u32,

    /// Last update timestamp
    last_updated: DateTime<Utc>,

    /// Map of Discord ID (as string) to record
    records: HashMap<String, UserRecord>,
}

impl Default for VerificationDatabase {
    fn default() -> Self {
        Self {
            version: DB_VERSION,
            last_updated: Utc::now(),
            records: HashMap::new(),
        }
    }
}

/// One user's stored verification state. The snapshot part is overwritten
/// wholesale on each store; the retry fields are owned by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserRecord {
    handle: String,

    main_orgs: Vec<String>,

    affiliate_orgs: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    display_moniker: Option<String>,

    checked_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,

    // Retry schedule, mutated only via schedule_recheck
    #[serde(default)]
    fail_count: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    next_retry_at: Option<DateTime<Utc>>,
}

/// File-backed store implementation
pub struct JsonFileStore {
    path: String,
    db: RwLock<VerificationDatabase>,
}

impl JsonFileStore {
    /// Load from a JSON file, or start empty if the file does not exist.
    pub async fn load(path: &str) -> Result<Self> {
        let db = match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                serde_json::from_str(&content).map_err(|e| BotError::ConfigParse {
                    path: path.to_string(),
                    source: e,
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => VerificationDatabase::default(),
            Err(e) => {
                return Err(BotError::StateLoad {
                    path: path.to_string(),
                    source: e,
                });
            }
        };

        Ok(Self {
            path: path.to_string(),
            db: RwLock::new(db),
        })
    }

    /// Save atomically: write to a temp file, then rename.
    async fn save(&self, db: &VerificationDatabase) -> Result<()> {
        let content = serde_json::to_string_pretty(db)?;

        let temp_path = format!("{}.tmp", self.path);
        tokio::fs::write(&temp_path, &content)
            .await
            .map_err(|e| BotError::StateSave {
                path: self.path.clone(),
                source: e,
            })?;

        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| BotError::StateSave {
                path: self.path.clone(),
                source: e,
            })?;

        Ok(())
    }

    /// Number of stored records.
    pub async fn record_count(&self) -> usize {
        self.db.read().await.records.len()
    }
}

fn parse_user_id(key: &str) -> Option<UserId> {
    key.parse::<u64>().ok().filter(|n| *n != 0).map(UserId::new)
}

fn record_to_snapshot(user_id: UserId, record: &UserRecord) -> VerificationSnapshot {
    VerificationSnapshot {
        user_id,
        handle: record.handle.clone(),
        // Re-derived from the stored lists; a stored status field is never
        // trusted
        status: derive_status(&record.main_orgs, &record.affiliate_orgs),
        main_orgs: record.main_orgs.clone(),
        affiliate_orgs: record.affiliate_orgs.clone(),
        display_moniker: record.display_moniker.clone(),
        checked_at: record.checked_at,
        error: record.error.clone(),
    }
}

#[async_trait]
impl VerificationStore for JsonFileStore {
    async fn store(&self, snapshot: &VerificationSnapshot) -> Result<()> {
        let mut db = self.db.write().await;
        let key = snapshot.user_id.to_string();

        // A handle may belong to at most one Discord account
        for (other, record) in db.records.iter() {
            if other != &key && record.handle.eq_ignore_ascii_case(&snapshot.handle) {
                return Err(BotError::HandleConflict {
                    handle: snapshot.handle.clone(),
                    owner: other.clone(),
                });
            }
        }

        let (fail_count, next_retry_at) = db
            .records
            .get(&key)
            .map(|r| (r.fail_count, r.next_retry_at))
            .unwrap_or((0, None));

        db.records.insert(
            key,
            UserRecord {
                handle: snapshot.handle.clone(),
                main_orgs: snapshot.main_orgs.clone(),
                affiliate_orgs: snapshot.affiliate_orgs.clone(),
                display_moniker: snapshot.display_moniker.clone(),
                checked_at: snapshot.checked_at,
                error: snapshot.error.clone(),
                fail_count,
                next_retry_at,
            },
        );
        db.last_updated = Utc::now();

        self.save(&db).await?;
        debug!("Stored snapshot for {}", snapshot.user_id);
        Ok(())
    }

    async fn load(&self, user_id: UserId) -> Result<Option<VerificationSnapshot>> {
        let db = self.db.read().await;
        Ok(db
            .records
            .get(&user_id.to_string())
            .map(|record| record_to_snapshot(user_id, record)))
    }

    async fn get_due_users(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<UserId>> {
        let db = self.db.read().await;

        let mut due: Vec<(Option<DateTime<Utc>>, UserId)> = db
            .records
            .iter()
            .filter(|(_, record)| record.next_retry_at.map(|at| at <= now).unwrap_or(true))
            .filter_map(|(key, record)| parse_user_id(key).map(|id| (record.next_retry_at, id)))
            .collect();

        // Never-scheduled records sort first, then oldest due time
        due.sort_by_key(|(at, id)| (*at, id.get()));
        due.truncate(limit);

        Ok(due.into_iter().map(|(_, id)| id).collect())
    }

    async fn get_fail_count(&self, user_id: UserId) -> Result<u32> {
        let db = self.db.read().await;
        Ok(db
            .records
            .get(&user_id.to_string())
            .map(|r| r.fail_count)
            .unwrap_or(0))
    }

    async fn schedule_recheck(
        &self,
        user_id: UserId,
        fail_count: u32,
        next_retry_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut db = self.db.write().await;

        let record = db
            .records
            .get_mut(&user_id.to_string())
            .ok_or_else(|| BotError::NotVerified {
                user_id: user_id.to_string(),
            })?;
        record.fail_count = fail_count;
        record.next_retry_at = Some(next_retry_at);
        db.last_updated = Utc::now();

        self.save(&db).await
    }

    async fn check_handle_conflict(
        &self,
        handle: &str,
        user_id: UserId,
    ) -> Result<Option<UserId>> {
        let db = self.db.read().await;
        let own_key = user_id.to_string();
        Ok(db
            .records
            .iter()
            .find(|(key, record)| {
                **key != own_key && record.handle.eq_ignore_ascii_case(handle)
            })
            .and_then(|(key, _)| parse_user_id(key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MembershipStatus;
    use std::sync::atomic::{AtomicU32, Ordering};

    static PATH_COUNTER: AtomicU32 = AtomicU32::new(0);

    fn temp_path() -> String {
        let n = PATH_COUNTER.fetch_add(1, Ordering::SeqCst);
        std::env::temp_dir()
            .join(format!("verifybot_store_{}_{}.json", std::process::id(), n))
            .to_string_lossy()
            .to_string()
    }

    fn snapshot(user_id: u64, handle: &str) -> VerificationSnapshot {
        VerificationSnapshot::new(
            UserId::new(user_id),
            handle.to_string(),
            vec!["test squadron".to_string()],
            vec!["other org".to_string()],
            None,
        )
    }

    #[tokio::test]
    async fn test_store_and_load_roundtrip() {
        let store = JsonFileStore::load(&temp_path()).await.unwrap();

        store.store(&snapshot(1, "Foo")).await.unwrap();
        let loaded = store.load(UserId::new(1)).await.unwrap().unwrap();

        assert_eq!(loaded.handle, "Foo");
        assert_eq!(loaded.status, MembershipStatus::Main);
        assert_eq!(loaded.main_orgs, vec!["test squadron"]);
        assert!(store.load(UserId::new(2)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_rederives_status() {
        let store = JsonFileStore::load(&temp_path()).await.unwrap();

        // Only redacted entries: derivation must yield non-member
        let snap = VerificationSnapshot::new(
            UserId::new(1),
            "Foo".to_string(),
            vec!["redacted".to_string()],
            vec!["redacted".to_string()],
            None,
        );
        store.store(&snap).await.unwrap();

        let loaded = store.load(UserId::new(1)).await.unwrap().unwrap();
        assert_eq!(loaded.status, MembershipStatus::NonMember);
    }

    #[tokio::test]
    async fn test_handle_conflict_rejected_and_record_unchanged() {
        let store = JsonFileStore::load(&temp_path()).await.unwrap();

        store.store(&snapshot(1, "Foo")).await.unwrap();

        // Different user, same handle in a different case
        let err = store.store(&snapshot(2, "foo")).await.unwrap_err();
        assert!(matches!(err, BotError::HandleConflict { ref owner, .. } if owner == "1"));

        let original = store.load(UserId::new(1)).await.unwrap().unwrap();
        assert_eq!(original.handle, "Foo");
        assert!(store.load(UserId::new(2)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_same_user_may_restore_own_handle() {
        let store = JsonFileStore::load(&temp_path()).await.unwrap();

        store.store(&snapshot(1, "Foo")).await.unwrap();
        store.store(&snapshot(1, "Foo")).await.unwrap();
        store.store(&snapshot(1, "NewHandle")).await.unwrap();

        let loaded = store.load(UserId::new(1)).await.unwrap().unwrap();
        assert_eq!(loaded.handle, "NewHandle");
    }

    #[tokio::test]
    async fn test_check_handle_conflict() {
        let store = JsonFileStore::load(&temp_path()).await.unwrap();
        store.store(&snapshot(1, "Foo")).await.unwrap();

        let owner = store
            .check_handle_conflict("FOO", UserId::new(2))
            .await
            .unwrap();
        assert_eq!(owner, Some(UserId::new(1)));

        // The owner itself is not a conflict
        let owner = store
            .check_handle_conflict("Foo", UserId::new(1))
            .await
            .unwrap();
        assert_eq!(owner, None);
    }

    #[tokio::test]
    async fn test_retry_schedule_survives_store() {
        let store = JsonFileStore::load(&temp_path()).await.unwrap();
        store.store(&snapshot(1, "Foo")).await.unwrap();

        let at = Utc::now() + chrono::Duration::minutes(30);
        store.schedule_recheck(UserId::new(1), 2, at).await.unwrap();
        assert_eq!(store.get_fail_count(UserId::new(1)).await.unwrap(), 2);

        // A wholesale snapshot overwrite must not reset the schedule
        store.store(&snapshot(1, "Foo")).await.unwrap();
        assert_eq!(store.get_fail_count(UserId::new(1)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_schedule_for_unknown_user_fails() {
        let store = JsonFileStore::load(&temp_path()).await.unwrap();
        let err = store
            .schedule_recheck(UserId::new(9), 1, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::NotVerified { .. }));
    }

    #[tokio::test]
    async fn test_due_users_filtering_and_limit() {
        let store = JsonFileStore::load(&temp_path()).await.unwrap();
        let now = Utc::now();

        for id in 1..=4u64 {
            store.store(&snapshot(id, &format!("Handle{}", id))).await.unwrap();
        }
        // 1: never scheduled (due), 2: past (due), 3: future (not due),
        // 4: past but later than 2
        store
            .schedule_recheck(UserId::new(2), 0, now - chrono::Duration::minutes(60))
            .await
            .unwrap();
        store
            .schedule_recheck(UserId::new(3), 0, now + chrono::Duration::minutes(60))
            .await
            .unwrap();
        store
            .schedule_recheck(UserId::new(4), 0, now - chrono::Duration::minutes(10))
            .await
            .unwrap();

        let due = store.get_due_users(now, 10).await.unwrap();
        assert_eq!(
            due,
            vec![UserId::new(1), UserId::new(2), UserId::new(4)]
        );

        let due = store.get_due_users(now, 2).await.unwrap();
        assert_eq!(due, vec![UserId::new(1), UserId::new(2)]);
    }

    #[tokio::test]
    async fn test_persists_across_reload() {
        let path = temp_path();
        {
            let store = JsonFileStore::load(&path).await.unwrap();
            store.store(&snapshot(1, "Foo")).await.unwrap();
        }

        let reloaded = JsonFileStore::load(&path).await.unwrap();
        assert_eq!(reloaded.record_count().await, 1);
        let loaded = reloaded.load(UserId::new(1)).await.unwrap().unwrap();
        assert_eq!(loaded.handle, "Foo");
        assert_eq!(loaded.status, MembershipStatus::Main);
    }
}
