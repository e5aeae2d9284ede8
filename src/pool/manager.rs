use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

use super::token::{Credential, Token, TokenId, TokenSnapshot, TokenState};
use crate::config::PoolConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("credential pool is empty")]
    Empty,

    #[error("no healthy credentials available")]
    NoHealthyCredentials,

    #[error("every healthy credential was already tried")]
    AllTried,

    #[error("unknown token id {0}")]
    UnknownToken(TokenId),
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolSummary {
    pub total: usize,
    pub available: usize,
    pub cooling: usize,
    pub disabled: usize,
    pub tokens: Vec<TokenSnapshot>,
}

/// Owns every upstream token and its health state.
///
/// All bookkeeping happens under one mutex that is never held across an
/// await point, so network calls made with an acquired token never block
/// other acquisitions.
#[derive(Debug)]
pub struct CredentialPool {
    tokens: Mutex<Vec<Token>>,
    cooldown_base: Duration,
    cooldown_cap: u32,
    failure_threshold: Option<u32>,
}

impl CredentialPool {
    pub fn new(config: &PoolConfig) -> Result<Self, PoolError> {
        if config.tokens.is_empty() {
            return Err(PoolError::Empty);
        }

        let tokens = config
            .tokens
            .iter()
            .enumerate()
            .map(|(id, secret)| Token::new(id, secret.clone()))
            .collect();

        Ok(Self {
            tokens: Mutex::new(tokens),
            cooldown_base: config.cooldown_base(),
            cooldown_cap: config.cooldown_cap.max(1),
            failure_threshold: config.failure_threshold,
        })
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Token>> {
        // Bookkeeping stays consistent even if a holder panicked mid-update
        self.tokens.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Select the least-used Available token, oldest last use first.
    pub fn acquire(self: &Arc<Self>) -> Result<TokenLease, PoolError> {
        self.acquire_excluding(&HashSet::new())
    }

    /// Like [`acquire`](Self::acquire) but never returns a token in `excluded`.
    ///
    /// Fails with `AllTried` when the only Available tokens are excluded, and
    /// with `NoHealthyCredentials` when none is Available at all.
    pub fn acquire_excluding(
        self: &Arc<Self>,
        excluded: &HashSet<TokenId>,
    ) -> Result<TokenLease, PoolError> {
        let now = Instant::now();
        let mut tokens = self.lock();

        let recovered = Self::recover_locked(&mut tokens, now);
        if recovered > 0 {
            tracing::debug!(recovered, "Cooldown elapsed for tokens");
        }

        let index = match tokens
            .iter()
            .enumerate()
            .filter(|(_, t)| t.state == TokenState::Available && !excluded.contains(&t.id))
            .min_by_key(|(_, t)| (t.usage_count, t.last_used_at, t.id))
            .map(|(i, _)| i)
        {
            Some(index) => index,
            None if tokens.iter().any(|t| t.state == TokenState::Available) => {
                return Err(PoolError::AllTried)
            }
            None => return Err(PoolError::NoHealthyCredentials),
        };
        let token = &mut tokens[index];

        token.usage_count += 1;
        token.last_used_at = Some(now);
        token.last_used_wall = Some(Utc::now());
        token.in_flight += 1;

        let credential = Credential {
            id: token.id,
            secret: token.secret.clone(),
        };

        tracing::debug!(
            token_id = credential.id,
            token = %credential.masked(),
            usage_count = token.usage_count,
            "Acquired token"
        );

        Ok(TokenLease {
            pool: Arc::clone(self),
            credential,
            settled: false,
        })
    }

    /// Record a successful attempt.
    pub fn release(&self, id: TokenId) {
        let mut tokens = self.lock();
        if let Some(token) = tokens.get_mut(id) {
            if token.consecutive_failures > 0 {
                tracing::info!(token_id = id, "Token recovered after successful use");
            }
            token.consecutive_failures = 0;
        }
    }

    /// Record a failed attempt: cool the token down, or disable it once it
    /// exceeds the failure threshold.
    pub fn mark_failed(&self, id: TokenId) {
        let now = Instant::now();
        let mut tokens = self.lock();
        let Some(token) = tokens.get_mut(id) else {
            return;
        };

        token.consecutive_failures += 1;

        if token.state == TokenState::Disabled {
            return;
        }

        let over_threshold = self
            .failure_threshold
            .is_some_and(|threshold| token.consecutive_failures > threshold);

        if over_threshold {
            token.state = TokenState::Disabled;
            token.cooldown_until = None;
            tracing::error!(
                token_id = id,
                consecutive_failures = token.consecutive_failures,
                "Token disabled after repeated failures"
            );
        } else {
            let cooldown = self.cooldown_for(token.consecutive_failures);
            token.state = TokenState::Cooling;
            token.cooldown_until = Some(now + cooldown);
            tracing::warn!(
                token_id = id,
                consecutive_failures = token.consecutive_failures,
                cooldown_secs = cooldown.as_secs(),
                "Token cooling down"
            );
        }
    }

    /// Return Cooling tokens whose cooldown elapsed to Available.
    pub fn recover_expired(&self) -> usize {
        let now = Instant::now();
        let mut tokens = self.lock();
        Self::recover_locked(&mut tokens, now)
    }

    fn recover_locked(tokens: &mut [Token], now: Instant) -> usize {
        let mut recovered = 0;
        for token in tokens
            .iter_mut()
            .filter(|t| t.state == TokenState::Cooling && t.cooldown_elapsed(now))
        {
            token.state = TokenState::Available;
            token.cooldown_until = None;
            recovered += 1;
        }
        recovered
    }

    /// Operator re-enable of a Disabled or Cooling token.
    pub fn reset(&self, id: TokenId) -> Result<(), PoolError> {
        let mut tokens = self.lock();
        let token = tokens.get_mut(id).ok_or(PoolError::UnknownToken(id))?;

        token.state = TokenState::Available;
        token.cooldown_until = None;
        token.consecutive_failures = 0;

        tracing::info!(token_id = id, "Token reset by operator");
        Ok(())
    }

    /// Read-only view for health reporting. Does not run recovery.
    pub fn summary(&self) -> PoolSummary {
        let now = Instant::now();
        let tokens = self.lock();
        let snapshots: Vec<TokenSnapshot> = tokens.iter().map(|t| t.snapshot(now)).collect();

        let count = |state| snapshots.iter().filter(|s| s.state == state).count();

        PoolSummary {
            total: snapshots.len(),
            available: count(TokenState::Available),
            cooling: count(TokenState::Cooling),
            disabled: count(TokenState::Disabled),
            tokens: snapshots,
        }
    }

    fn cooldown_for(&self, consecutive_failures: u32) -> Duration {
        self.cooldown_base * consecutive_failures.clamp(1, self.cooldown_cap)
    }

    fn finish(&self, id: TokenId) {
        let mut tokens = self.lock();
        if let Some(token) = tokens.get_mut(id) {
            token.in_flight = token.in_flight.saturating_sub(1);
        }
    }
}

/// A token checked out of the pool for one attempt.
///
/// Settle it with [`succeed`](Self::succeed) or [`fail`](Self::fail).
/// Dropping an unsettled lease (cancellation, truncated stream) returns the
/// token without rewarding or penalizing it.
#[derive(Debug)]
pub struct TokenLease {
    pool: Arc<CredentialPool>,
    credential: Credential,
    settled: bool,
}

impl TokenLease {
    pub fn id(&self) -> TokenId {
        self.credential.id
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn succeed(mut self) {
        self.pool.release(self.credential.id);
        self.settled = true;
    }

    pub fn fail(mut self) {
        self.pool.mark_failed(self.credential.id);
        self.settled = true;
    }
}

impl Drop for TokenLease {
    fn drop(&mut self) {
        if !self.settled {
            tracing::debug!(
                token_id = self.credential.id,
                "Lease returned without outcome"
            );
        }
        self.pool.finish(self.credential.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_config(n: usize, cooldown_seconds: u64) -> PoolConfig {
        PoolConfig {
            tokens: (0..n).map(|i| format!("secret-token-{}", i)).collect(),
            cooldown_seconds,
            cooldown_cap: 3,
            failure_threshold: Some(2),
        }
    }

    fn pool(n: usize, cooldown_seconds: u64) -> Arc<CredentialPool> {
        Arc::new(CredentialPool::new(&pool_config(n, cooldown_seconds)).unwrap())
    }

    fn usage_counts(pool: &CredentialPool) -> Vec<u64> {
        pool.summary().tokens.iter().map(|t| t.usage_count).collect()
    }

    #[test]
    fn test_empty_pool_rejected() {
        let result = CredentialPool::new(&pool_config(0, 10));
        assert_eq!(result.unwrap_err(), PoolError::Empty);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_converges_to_even_usage() {
        for n in 1..=6 {
            let pool = pool(n, 10);
            for _ in 0..n {
                pool.acquire().unwrap().succeed();
            }
            let counts = usage_counts(&pool);
            let max = counts.iter().max().unwrap();
            let min = counts.iter().min().unwrap();
            assert!(max - min <= 1, "uneven usage {:?}", counts);
            assert!(counts.iter().all(|&c| c == 1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_usage_is_counted_at_acquisition() {
        let pool = pool(3, 10);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let c = pool.acquire().unwrap();

        // Concurrent holders spread across all tokens
        let ids: HashSet<_> = [a.id(), b.id(), c.id()].into_iter().collect();
        assert_eq!(ids.len(), 3);
        assert_eq!(pool.summary().tokens[0].in_flight, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tie_broken_by_oldest_last_use() {
        let pool = pool(2, 10);
        let first = pool.acquire().unwrap();
        assert_eq!(first.id(), 0);
        first.succeed();

        tokio::time::advance(Duration::from_millis(10)).await;
        let second = pool.acquire().unwrap();
        assert_eq!(second.id(), 1);
        second.succeed();

        // Equal usage again; token 0 was used longest ago
        tokio::time::advance(Duration::from_millis(10)).await;
        assert_eq!(pool.acquire().unwrap().id(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_token_skipped_until_cooldown_elapses() {
        let pool = pool(2, 10);
        pool.mark_failed(0);

        for _ in 0..5 {
            let lease = pool.acquire().unwrap();
            assert_eq!(lease.id(), 1);
        }

        tokio::time::advance(Duration::from_secs(10)).await;
        // Token 0 is back and has the lower usage count
        assert_eq!(pool.acquire().unwrap().id(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquisitions_avoid_cooling_token() {
        let pool = pool(2, 10);
        pool.acquire().unwrap().fail();

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let pool = Arc::clone(&pool);
                tokio::spawn(async move {
                    let lease = pool.acquire().unwrap();
                    let id = lease.id();
                    tokio::task::yield_now().await;
                    lease.succeed();
                    id
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), 1);
        }

        let summary = pool.summary();
        assert_eq!(summary.cooling, 1);
        assert_eq!(summary.tokens[1].usage_count, 5);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(pool.recover_expired(), 1);
        assert_eq!(pool.summary().available, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_healthy_credentials() {
        let pool = pool(1, 10);
        pool.mark_failed(0);
        assert_eq!(
            pool.acquire().unwrap_err(),
            PoolError::NoHealthyCredentials
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_grows_with_failures_up_to_cap() {
        let pool = Arc::new(
            CredentialPool::new(&PoolConfig {
                failure_threshold: None,
                ..pool_config(1, 10)
            })
            .unwrap(),
        );

        // 1st failure: 10s, 2nd: 20s, 3rd and later: capped at 30s
        for expected in [10, 20, 30, 30] {
            pool.mark_failed(0);
            let remaining = pool.summary().tokens[0].cooldown_remaining_secs;
            assert_eq!(remaining, Some(expected));
            tokio::time::advance(Duration::from_secs(expected)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_after_exceeding_threshold() {
        let pool = pool(2, 1);
        for _ in 0..2 {
            pool.mark_failed(0);
            tokio::time::advance(Duration::from_secs(5)).await;
        }
        assert_eq!(pool.summary().disabled, 0);

        pool.mark_failed(0);
        let summary = pool.summary();
        assert_eq!(summary.disabled, 1);
        assert_eq!(summary.tokens[0].state, TokenState::Disabled);

        // Disabled tokens never come back on their own
        tokio::time::advance(Duration::from_secs(3600)).await;
        for _ in 0..3 {
            assert_eq!(pool.acquire().unwrap().id(), 1);
        }

        pool.reset(0).unwrap();
        assert_eq!(pool.summary().tokens[0].state, TokenState::Available);
        assert_eq!(pool.summary().tokens[0].consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_resets_consecutive_failures() {
        let pool = pool(1, 1);
        pool.mark_failed(0);
        tokio::time::advance(Duration::from_secs(1)).await;

        let lease = pool.acquire().unwrap();
        assert_eq!(pool.summary().tokens[0].consecutive_failures, 1);
        lease.succeed();
        assert_eq!(pool.summary().tokens[0].consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_lease_is_neutral() {
        let pool = pool(1, 10);
        let lease = pool.acquire().unwrap();
        assert_eq!(pool.summary().tokens[0].in_flight, 1);
        drop(lease);

        let snapshot = &pool.summary().tokens[0];
        assert_eq!(snapshot.in_flight, 0);
        assert_eq!(snapshot.state, TokenState::Available);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.usage_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_excluding() {
        let pool = pool(2, 0);
        let excluded: HashSet<TokenId> = [0].into_iter().collect();
        assert_eq!(pool.acquire_excluding(&excluded).unwrap().id(), 1);

        let all: HashSet<TokenId> = [0, 1].into_iter().collect();
        assert_eq!(pool.acquire_excluding(&all).unwrap_err(), PoolError::AllTried);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_excluding_with_nothing_available() {
        let pool = pool(2, 30);
        pool.mark_failed(0);
        pool.mark_failed(1);

        // Excluded or not, a pool with no Available token is unhealthy
        let tried: HashSet<TokenId> = [0].into_iter().collect();
        assert_eq!(
            pool.acquire_excluding(&tried).unwrap_err(),
            PoolError::NoHealthyCredentials
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_summary_does_not_mutate() {
        let pool = pool(2, 10);
        pool.mark_failed(1);
        tokio::time::advance(Duration::from_secs(10)).await;

        // Reported as available but stored state is still Cooling until acquire
        assert_eq!(pool.summary().available, 2);
        assert_eq!(pool.lock()[1].state, TokenState::Cooling);
        assert_eq!(pool.recover_expired(), 1);
    }

    #[test]
    fn test_reset_unknown_token() {
        let pool = pool(1, 10);
        assert_eq!(pool.reset(7).unwrap_err(), PoolError::UnknownToken(7));
    }
}
