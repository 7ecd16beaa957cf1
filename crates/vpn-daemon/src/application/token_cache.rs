//! Per-account access token cache with request coalescing.
//!
//! At most one token refresh is in flight per account.  Callers that ask for
//! a token while a refresh is running are parked on a oneshot channel and all
//! receive the same result when it finishes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{Duration, Utc};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use vpn_core::{AccountToken, ApiError, RetryPolicy};

use super::account_api::{AccessToken, AccountApi};
use super::cancellable::{CancellableOperation, Outcome};

type Waiter = oneshot::Sender<Result<AccessToken, ApiError>>;

enum Entry {
    Ready(AccessToken),
    Refreshing {
        /// Distinguishes this refresh from a later one for the same account.
        id: u64,
        waiters: Vec<Waiter>,
    },
}

type Entries = Arc<Mutex<HashMap<AccountToken, Entry>>>;

fn lock(entries: &Entries) -> MutexGuard<'_, HashMap<AccountToken, Entry>> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct AccessTokenCache {
    api: Arc<dyn AccountApi>,
    /// Tokens closer than this to expiry are refreshed before use.
    refresh_margin: Duration,
    entries: Entries,
    next_refresh_id: AtomicU64,
}

impl AccessTokenCache {
    pub fn new(api: Arc<dyn AccountApi>, refresh_margin: Duration) -> Self {
        Self {
            api,
            refresh_margin,
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_refresh_id: AtomicU64::new(1),
        }
    }

    /// Returns a fresh access token for `account`, fetching one if needed.
    ///
    /// Concurrent calls for the same account share one fetch.  `policy`
    /// applies only when this call starts the fetch.
    pub async fn get_token(
        &self,
        account: &AccountToken,
        policy: RetryPolicy,
    ) -> Result<AccessToken, ApiError> {
        let rx = {
            let mut entries = lock(&self.entries);
            match entries.get_mut(account) {
                Some(Entry::Ready(token)) if token.is_fresh_at(Utc::now(), self.refresh_margin) => {
                    return Ok(token.clone());
                }
                Some(Entry::Refreshing { waiters, .. }) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    rx
                }
                _ => {
                    let (tx, rx) = oneshot::channel();
                    let id = self.next_refresh_id.fetch_add(1, Ordering::Relaxed);
                    // The completion runs on another task and blocks on this
                    // lock until the entry below is fully installed.
                    self.start_refresh(account.clone(), id, policy);
                    entries.insert(
                        account.clone(),
                        Entry::Refreshing {
                            id,
                            waiters: vec![tx],
                        },
                    );
                    rx
                }
            }
        };
        rx.await.unwrap_or(Err(ApiError::Cancelled))
    }

    /// Drops the cached token for `account` if it is still `stale`.
    ///
    /// A token that another caller has already replaced is left alone, so a
    /// burst of 401s triggers a single refresh.
    pub fn invalidate_token(&self, account: &AccountToken, stale: &AccessToken) {
        let mut entries = lock(&self.entries);
        if matches!(entries.get(account), Some(Entry::Ready(token)) if token == stale) {
            entries.remove(account);
            debug!(account = %account, "access token invalidated");
        }
    }

    /// Drops any cached token for `account`.
    pub fn invalidate(&self, account: &AccountToken) {
        let mut entries = lock(&self.entries);
        if matches!(entries.get(account), Some(Entry::Ready(_))) {
            entries.remove(account);
            debug!(account = %account, "access token invalidated");
        }
    }

    fn start_refresh(&self, account: AccountToken, id: u64, policy: RetryPolicy) {
        let api = Arc::clone(&self.api);
        let entries = Arc::clone(&self.entries);
        let fetch_account = account.clone();
        debug!(account = %account, "fetching access token");
        // Nobody cancels a refresh: callers that lose interest just drop
        // their receiver.
        let _ = CancellableOperation::start(
            policy,
            move |_| {
                let api = Arc::clone(&api);
                let account = fetch_account.clone();
                async move { api.fetch_access_token(&account).await }
            },
            move |outcome: Outcome<AccessToken, ApiError>| {
                let result = outcome.into_result(|| ApiError::Cancelled);
                let waiters = {
                    let mut entries = lock(&entries);
                    let current = matches!(
                        entries.get(&account),
                        Some(Entry::Refreshing { id: current, .. }) if *current == id
                    );
                    if !current {
                        Vec::new()
                    } else {
                        let waiters = match entries.remove(&account) {
                            Some(Entry::Refreshing { waiters, .. }) => waiters,
                            _ => Vec::new(),
                        };
                        if let Ok(token) = &result {
                            entries.insert(account.clone(), Entry::Ready(token.clone()));
                        }
                        waiters
                    }
                };
                match &result {
                    Ok(_) => debug!(account = %account, waiters = waiters.len(), "access token refreshed"),
                    Err(ApiError::Cancelled) => {}
                    Err(e) => warn!(account = %account, error = %e, "access token refresh failed"),
                }
                for waiter in waiters {
                    let _ = waiter.send(result.clone());
                }
            },
        );
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::account_api::MockAccountApi;
    use std::time::Duration as StdDuration;

    fn account() -> AccountToken {
        AccountToken::new("1234567890")
    }

    fn token(value: &str, ttl_minutes: i64) -> AccessToken {
        AccessToken::new(value, Utc::now() + Duration::minutes(ttl_minutes))
    }

    fn cache(api: MockAccountApi) -> AccessTokenCache {
        AccessTokenCache::new(Arc::new(api), Duration::minutes(1))
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_fetch() {
        // Arrange
        let mut api = MockAccountApi::new();
        api.expect_fetch_access_token()
            .times(1)
            .returning(|_| Ok(token("shared", 60)));
        let cache = cache(api);
        let account = account();

        // Act
        let (a, b, c, d, e) = tokio::join!(
            cache.get_token(&account, RetryPolicy::never()),
            cache.get_token(&account, RetryPolicy::never()),
            cache.get_token(&account, RetryPolicy::never()),
            cache.get_token(&account, RetryPolicy::never()),
            cache.get_token(&account, RetryPolicy::never()),
        );

        // Assert
        for result in [a, b, c, d, e] {
            assert_eq!(result.unwrap().value(), "shared");
        }
    }

    #[tokio::test]
    async fn test_fresh_token_is_served_from_cache() {
        let mut api = MockAccountApi::new();
        api.expect_fetch_access_token()
            .times(1)
            .returning(|_| Ok(token("cached", 60)));
        let cache = cache(api);

        let first = cache.get_token(&account(), RetryPolicy::never()).await.unwrap();
        let second = cache.get_token(&account(), RetryPolicy::never()).await.unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_token_within_margin_is_refreshed() {
        let mut api = MockAccountApi::new();
        let mut seq = mockall::Sequence::new();
        api.expect_fetch_access_token()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(AccessToken::new("nearly-expired", Utc::now() + Duration::seconds(30))));
        api.expect_fetch_access_token()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(token("renewed", 60)));
        let cache = cache(api);

        let _ = cache.get_token(&account(), RetryPolicy::never()).await.unwrap();
        let renewed = cache.get_token(&account(), RetryPolicy::never()).await.unwrap();

        assert_eq!(renewed.value(), "renewed");
    }

    #[tokio::test]
    async fn test_failure_is_shared_and_not_cached() {
        // Arrange
        let mut api = MockAccountApi::new();
        let mut seq = mockall::Sequence::new();
        api.expect_fetch_access_token()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(ApiError::InvalidAccount));
        api.expect_fetch_access_token()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(token("later", 60)));
        let cache = cache(api);
        let account = account();

        // Act
        let (a, b) = tokio::join!(
            cache.get_token(&account, RetryPolicy::never()),
            cache.get_token(&account, RetryPolicy::never()),
        );
        let later = cache.get_token(&account, RetryPolicy::never()).await;

        // Assert
        assert_eq!(a, Err(ApiError::InvalidAccount));
        assert_eq!(b, Err(ApiError::InvalidAccount));
        assert_eq!(later.unwrap().value(), "later");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_errors_are_retried_per_policy() {
        let mut api = MockAccountApi::new();
        let mut seq = mockall::Sequence::new();
        api.expect_fetch_access_token()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Err(ApiError::Transport("reset".to_string())));
        api.expect_fetch_access_token()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(token("third-time", 60)));
        let cache = cache(api);
        let policy = RetryPolicy::fixed(3, StdDuration::from_millis(100));

        let result = cache.get_token(&account(), policy).await;

        assert_eq!(result.unwrap().value(), "third-time");
    }

    #[tokio::test]
    async fn test_invalidate_token_forces_refetch() {
        let mut api = MockAccountApi::new();
        let mut seq = mockall::Sequence::new();
        api.expect_fetch_access_token()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(token("old", 60)));
        api.expect_fetch_access_token()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(token("new", 60)));
        let cache = cache(api);

        let old = cache.get_token(&account(), RetryPolicy::never()).await.unwrap();
        cache.invalidate_token(&account(), &old);
        let new = cache.get_token(&account(), RetryPolicy::never()).await.unwrap();

        assert_eq!(new.value(), "new");
    }

    #[tokio::test]
    async fn test_invalidating_a_replaced_token_keeps_the_new_one() {
        let mut api = MockAccountApi::new();
        let mut seq = mockall::Sequence::new();
        api.expect_fetch_access_token()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(token("old", 60)));
        api.expect_fetch_access_token()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(token("new", 60)));
        let cache = cache(api);
        let old = cache.get_token(&account(), RetryPolicy::never()).await.unwrap();
        cache.invalidate(&account());
        let new = cache.get_token(&account(), RetryPolicy::never()).await.unwrap();

        // Act: a late 401 for the old token
        cache.invalidate_token(&account(), &old);

        // Assert: served from cache, no third fetch
        let again = cache.get_token(&account(), RetryPolicy::never()).await.unwrap();
        assert_eq!(again, new);
    }
}
