//! The single entry point every caller uses to obtain a verification
//! snapshot.
//!
//! The gateway owns the snapshot cache, the fetch permit pool, and the
//! last-fetch timestamp. One instance exists per process and is injected
//! into every caller, so the interactive flow, the scheduler, and the bulk
//! queue all compete for the same fetch budget.

use dashmap::DashMap;
use poise::serenity_prelude::UserId;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use crate::config::RsiConfig;
use crate::error::{BotError, Result};
use crate::models::VerificationSnapshot;
use crate::scrape::{extract_bio, extract_moniker, parse_org_page, token_matches};

use super::client::HtmlFetcher;

/// Cached snapshot plus its expiry. Entries are evicted lazily on the next
/// lookup past expiry, never swept proactively.
struct CacheEntry {
    expires_at: Instant,
    snapshot: VerificationSnapshot,
}

/// Rate-limited, cached access to the RSI directory.
pub struct RsiGateway {
    /// Injected fetch collaborator
    fetcher: Arc<dyn HtmlFetcher>,

    /// Base URL of the directory site
    base_url: String,

    /// TTL for successful snapshots
    cache_ttl: Duration,

    /// Minimum spacing between successive outbound fetches
    min_interval: Duration,

    /// Snapshot cache keyed by (user, lowercased handle)
    cache: DashMap<(UserId, String), CacheEntry>,

    /// Permit pool bounding concurrent fetches process-wide
    permits: Semaphore,

    /// When the last fetch was issued, by any caller
    last_fetch: Mutex<Option<Instant>>,
}

impl RsiGateway {
    pub fn new(fetcher: Arc<dyn HtmlFetcher>, config: &RsiConfig) -> Self {
        Self {
            fetcher,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            cache_ttl: Duration::from_secs(config.cache_ttl_seconds),
            min_interval: Duration::from_secs_f64(config.min_interval_seconds.max(0.0)),
            cache: DashMap::new(),
            permits: Semaphore::new(config.max_concurrent_requests.max(1)),
            last_fetch: Mutex::new(None),
        }
    }

    /// Get a verification snapshot for `(user_id, handle)`, from cache when
    /// fresh, otherwise via a rate-limited fetch.
    ///
    /// A handle the site reports as missing propagates as
    /// [`BotError::HandleNotFound`]; that outcome is never cached and never
    /// treated as transient. Any other fetch failure is folded into the
    /// returned snapshot's `error` field and is not cached, so the next call
    /// retries fresh.
    pub async fn get_snapshot(
        &self,
        user_id: UserId,
        handle: &str,
        force_refresh: bool,
    ) -> Result<VerificationSnapshot> {
        let handle = handle.trim();
        if handle.is_empty() {
            return Ok(VerificationSnapshot::degraded(
                user_id,
                String::new(),
                "No RSI handle on record; the user has not completed initial verification"
                    .to_string(),
            ));
        }

        let key = (user_id, handle.to_lowercase());

        if !force_refresh {
            let mut expired = false;
            if let Some(entry) = self.cache.get(&key) {
                if Instant::now() < entry.expires_at {
                    debug!("Snapshot cache hit for {} ({})", handle, user_id);
                    return Ok(entry.snapshot.clone());
                }
                expired = true;
            }
            if expired {
                self.cache.remove(&key);
            }
        }

        let org_url = format!("{}/citizens/{}/organizations", self.base_url, handle);
        let org_html = match self.fetch_page(&org_url).await {
            Ok(html) => html,
            Err(e) if e.is_not_found() => {
                return Err(BotError::HandleNotFound {
                    handle: handle.to_string(),
                });
            }
            Err(e) => {
                warn!("Org page fetch failed for {}: {}", handle, e);
                return Ok(VerificationSnapshot::degraded(
                    user_id,
                    handle.to_string(),
                    e.to_string(),
                ));
            }
        };
        let parsed = parse_org_page(&org_html);

        let profile_url = format!("{}/citizens/{}", self.base_url, handle);
        let display_moniker = match self.fetch_page(&profile_url).await {
            Ok(html) => extract_moniker(&html),
            Err(e) if e.is_not_found() => {
                return Err(BotError::HandleNotFound {
                    handle: handle.to_string(),
                });
            }
            Err(e) => {
                // Moniker is cosmetic; a failed profile fetch does not
                // degrade the snapshot
                debug!("Profile page fetch failed for {}: {}", handle, e);
                None
            }
        };

        let snapshot = VerificationSnapshot::new(
            user_id,
            handle.to_string(),
            parsed.main_list(),
            parsed.affiliates.clone(),
            display_moniker,
        );

        self.cache.insert(
            key,
            CacheEntry {
                expires_at: Instant::now() + self.cache_ttl,
                snapshot: snapshot.clone(),
            },
        );

        Ok(snapshot)
    }

    /// Fetch the profile page for `handle` and test its bio for a 4-digit
    /// verification token. Goes through the same permit and spacing gates as
    /// snapshot fetches. A missing bio counts as no match.
    pub async fn bio_token_matches(&self, handle: &str, token: &str) -> Result<bool> {
        let handle = handle.trim();
        let profile_url = format!("{}/citizens/{}", self.base_url, handle);
        let html = match self.fetch_page(&profile_url).await {
            Err(e) if e.is_not_found() => {
                return Err(BotError::HandleNotFound {
                    handle: handle.to_string(),
                });
            }
            other => other?,
        };

        Ok(extract_bio(&html)
            .map(|bio| token_matches(&bio, token))
            .unwrap_or(false))
    }

    /// Drop the cached snapshot for `(user, handle)`, if any.
    pub fn invalidate(&self, user_id: UserId, handle: &str) {
        self.cache.remove(&(user_id, handle.trim().to_lowercase()));
    }

    /// One rate-limited fetch: take a permit, honor the minimum spacing
    /// since the last fetch issued by any caller, then hit the collaborator.
    async fn fetch_page(&self, url: &str) -> Result<String> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| BotError::Internal {
                message: "Fetch permit pool closed".to_string(),
            })?;

        {
            // The lock is held across the wait so spacing serializes
            // correctly under concurrent callers
            let mut last_fetch = self.last_fetch.lock().await;
            if let Some(last) = *last_fetch {
                let elapsed = last.elapsed();
                if elapsed < self.min_interval {
                    tokio::time::sleep(self.min_interval - elapsed).await;
                }
            }
            *last_fetch = Some(Instant::now());
        }

        self.fetcher.fetch_html(url).await
    }
}

/// Shared gateway type
pub type SharedRsiGateway = Arc<RsiGateway>;

pub fn create_shared_gateway(fetcher: Arc<dyn HtmlFetcher>, config: &RsiConfig) -> SharedRsiGateway {
    Arc::new(RsiGateway::new(fetcher, config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MembershipStatus;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    const ORG_HTML: &str = r#"
        <div class="box-content org main">
            <div class="info"><p class="entry"><a class="value">TEST Squadron</a></p></div>
        </div>
        <div class="box-content org affiliation">
            <div class="info"><p class="entry"><a class="value">Other Org</a></p></div>
        </div>
    "#;

    const PROFILE_HTML: &str = r#"
        <span class="moniker">Space Tester</span>
        <div class="entry bio"><div class="value">Token 0042 verified</div></div>
    "#;

    struct MockFetcher {
        org_html: String,
        profile_html: String,
        org_not_found: AtomicBool,
        org_fails: AtomicBool,
        delay: Duration,
        fetch_count: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        fetch_times: StdMutex<Vec<Instant>>,
    }

    impl MockFetcher {
        fn new() -> Self {
            Self {
                org_html: ORG_HTML.to_string(),
                profile_html: PROFILE_HTML.to_string(),
                org_not_found: AtomicBool::new(false),
                org_fails: AtomicBool::new(false),
                delay: Duration::from_millis(0),
                fetch_count: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                fetch_times: StdMutex::new(Vec::new()),
            }
        }

        fn fetches(&self) -> usize {
            self.fetch_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HtmlFetcher for MockFetcher {
        async fn fetch_html(&self, url: &str) -> Result<String> {
            self.fetch_count.fetch_add(1, Ordering::SeqCst);
            self.fetch_times.lock().unwrap().push(Instant::now());

            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now_active, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);

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
                Ok(self.org_html.clone())
            } else {
                Ok(self.profile_html.clone())
            }
        }
    }

    fn test_config(max_concurrent: usize, min_interval: f64, ttl_seconds: u64) -> RsiConfig {
        RsiConfig {
            base_url: "https://example.test".to_string(),
            target_org: "TEST Squadron".to_string(),
            cache_ttl_seconds: ttl_seconds,
            max_concurrent_requests: max_concurrent,
            min_interval_seconds: min_interval,
        }
    }

    fn gateway_with(fetcher: Arc<MockFetcher>, config: RsiConfig) -> RsiGateway {
        RsiGateway::new(fetcher, &config)
    }

    #[tokio::test]
    async fn test_empty_handle_short_circuits() {
        let fetcher = Arc::new(MockFetcher::new());
        let gateway = gateway_with(fetcher.clone(), test_config(3, 0.0, 600));

        let snapshot = gateway
            .get_snapshot(UserId::new(1), "   ", false)
            .await
            .unwrap();

        assert_eq!(snapshot.status, MembershipStatus::NonMember);
        assert!(snapshot.error.is_some());
        assert_eq!(fetcher.fetches(), 0);
    }

    #[tokio::test]
    async fn test_successful_snapshot() {
        let fetcher = Arc::new(MockFetcher::new());
        let gateway = gateway_with(fetcher.clone(), test_config(3, 0.0, 600));

        let snapshot = gateway
            .get_snapshot(UserId::new(1), "SomeHandle", false)
            .await
            .unwrap();

        assert_eq!(snapshot.status, MembershipStatus::Main);
        assert_eq!(snapshot.main_orgs, vec!["test squadron"]);
        assert_eq!(snapshot.affiliate_orgs, vec!["other org"]);
        assert_eq!(snapshot.display_moniker.as_deref(), Some("Space Tester"));
        assert_eq!(snapshot.handle, "SomeHandle");
        assert!(snapshot.is_clean());
        // One org page fetch plus one profile page fetch
        assert_eq!(fetcher.fetches(), 2);
    }

    #[tokio::test]
    async fn test_cache_hit_within_ttl() {
        let fetcher = Arc::new(MockFetcher::new());
        let gateway = gateway_with(fetcher.clone(), test_config(3, 0.0, 600));

        let first = gateway
            .get_snapshot(UserId::new(1), "SomeHandle", false)
            .await
            .unwrap();
        // Same handle in a different case must hit the same entry
        let second = gateway
            .get_snapshot(UserId::new(1), "somehandle", false)
            .await
            .unwrap();

        assert_eq!(fetcher.fetches(), 2);
        assert_eq!(first.checked_at, second.checked_at);
    }

    #[tokio::test]
    async fn test_force_refresh_bypasses_cache() {
        let fetcher = Arc::new(MockFetcher::new());
        let gateway = gateway_with(fetcher.clone(), test_config(3, 0.0, 600));

        gateway
            .get_snapshot(UserId::new(1), "SomeHandle", false)
            .await
            .unwrap();
        gateway
            .get_snapshot(UserId::new(1), "SomeHandle", true)
            .await
            .unwrap();

        assert_eq!(fetcher.fetches(), 4);
    }

    #[tokio::test]
    async fn test_expired_entry_is_refetched() {
        let fetcher = Arc::new(MockFetcher::new());
        let config = RsiConfig {
            cache_ttl_seconds: 0,
            ..test_config(3, 0.0, 0)
        };
        let gateway = gateway_with(fetcher.clone(), config);

        gateway
            .get_snapshot(UserId::new(1), "SomeHandle", false)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        gateway
            .get_snapshot(UserId::new(1), "SomeHandle", false)
            .await
            .unwrap();

        assert_eq!(fetcher.fetches(), 4);
    }

    #[tokio::test]
    async fn test_not_found_propagates_and_is_not_cached() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.org_not_found.store(true, Ordering::SeqCst);
        let gateway = gateway_with(fetcher.clone(), test_config(3, 0.0, 600));

        let err = gateway
            .get_snapshot(UserId::new(1), "GoneHandle", false)
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::HandleNotFound { ref handle } if handle == "GoneHandle"));

        // A second call must try the site again
        let _ = gateway
            .get_snapshot(UserId::new(1), "GoneHandle", false)
            .await
            .unwrap_err();
        assert_eq!(fetcher.fetches(), 2);
    }

    #[tokio::test]
    async fn test_transient_failure_yields_degraded_uncached_snapshot() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.org_fails.store(true, Ordering::SeqCst);
        let gateway = gateway_with(fetcher.clone(), test_config(3, 0.0, 600));

        let degraded = gateway
            .get_snapshot(UserId::new(1), "SomeHandle", false)
            .await
            .unwrap();
        assert_eq!(degraded.status, MembershipStatus::NonMember);
        assert!(degraded.error.is_some());
        assert_eq!(fetcher.fetches(), 1);

        // Next call retries fresh and succeeds
        fetcher.org_fails.store(false, Ordering::SeqCst);
        let clean = gateway
            .get_snapshot(UserId::new(1), "SomeHandle", false)
            .await
            .unwrap();
        assert!(clean.is_clean());
        assert_eq!(clean.status, MembershipStatus::Main);
        assert_eq!(fetcher.fetches(), 3);
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_permit_pool() {
        let mut fetcher = MockFetcher::new();
        fetcher.delay = Duration::from_millis(20);
        let fetcher = Arc::new(fetcher);
        let gateway = Arc::new(gateway_with(fetcher.clone(), test_config(2, 0.0, 600)));

        let mut handles = Vec::new();
        for i in 1..=6u64 {
            let gateway = gateway.clone();
            handles.push(tokio::spawn(async move {
                gateway
                    .get_snapshot(UserId::new(i), &format!("Handle{}", i), false)
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(fetcher.fetches(), 12);
        assert!(fetcher.max_active.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_min_interval_spacing() {
        let fetcher = Arc::new(MockFetcher::new());
        let gateway = gateway_with(fetcher.clone(), test_config(3, 0.05, 600));

        gateway
            .get_snapshot(UserId::new(1), "SomeHandle", false)
            .await
            .unwrap();

        let times = fetcher.fetch_times.lock().unwrap();
        assert_eq!(times.len(), 2);
        // Allow a little slop under the 50ms configured spacing
        assert!(times[1].duration_since(times[0]) >= Duration::from_millis(45));
    }

    #[tokio::test]
    async fn test_bio_token_check() {
        let fetcher = Arc::new(MockFetcher::new());
        let gateway = gateway_with(fetcher.clone(), test_config(3, 0.0, 600));

        assert!(gateway.bio_token_matches("SomeHandle", "42").await.unwrap());
        assert!(!gateway.bio_token_matches("SomeHandle", "9999").await.unwrap());
    }

    #[tokio::test]
    async fn test_bio_token_check_missing_bio() {
        let mut fetcher = MockFetcher::new();
        fetcher.profile_html = "<p>no bio block</p>".to_string();
        let fetcher = Arc::new(fetcher);
        let gateway = gateway_with(fetcher.clone(), test_config(3, 0.0, 600));

        assert!(!gateway.bio_token_matches("SomeHandle", "42").await.unwrap());
    }

    #[tokio::test]
    async fn test_invalidate_drops_cache_entry() {
        let fetcher = Arc::new(MockFetcher::new());
        let gateway = gateway_with(fetcher.clone(), test_config(3, 0.0, 600));

        gateway
            .get_snapshot(UserId::new(1), "SomeHandle", false)
            .await
            .unwrap();
        gateway.invalidate(UserId::new(1), "somehandle");
        gateway
            .get_snapshot(UserId::new(1), "SomeHandle", false)
            .await
            .unwrap();

        assert_eq!(fetcher.fetches(), 4);
    }
}
