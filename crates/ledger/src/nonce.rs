//! Per-account nonce sequencing.
//!
//! Each signing account has one ordering point. Nonces start at 1. The
//! confirmed watermark only moves across a contiguous run of consumed nonces,
//! so an unresolved low nonce holds back everything above it, the same rule
//! the ledger itself applies.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

/// How a claimed nonce was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceRelease {
    /// The ledger included a transaction with this nonce (confirmed or reverted).
    Consumed,
    /// The transaction never reached the ledger or was dropped. The nonce is
    /// handed out again by the next claim.
    Void,
}

/// An account whose lowest outstanding nonce is holding back later ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeadOfLineBlock {
    pub account: String,
    pub blocking_nonce: u64,
    /// Nonces above the blocker that are claimed or already consumed.
    pub waiting: usize,
}

/// Result of comparing local state with the ledger's nonce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NonceDrift {
    pub account: String,
    pub local_confirmed: u64,
    pub on_chain: u64,
    /// The watermark was moved forward to the on-chain value.
    pub advanced: bool,
}

/// Read-only view of one account, for status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NonceSnapshot {
    pub account: String,
    pub claimed: u64,
    pub confirmed: u64,
    pub outstanding: Vec<u64>,
}

#[derive(Debug, Default)]
struct AccountNonces {
    /// Highest nonce of the contiguous consumed prefix.
    confirmed: u64,
    /// Highest nonce ever handed out.
    claimed: u64,
    /// Claimed and not yet released.
    outstanding: BTreeSet<u64>,
    /// Consumed above the watermark, waiting for the gap below to close.
    consumed_ahead: BTreeSet<u64>,
    /// Voided nonces above the watermark, reused lowest first.
    free: BTreeSet<u64>,
}

impl AccountNonces {
    fn claim(&mut self) -> u64 {
        let nonce = match self.free.pop_first() {
            Some(n) => n,
            None => {
                self.claimed += 1;
                self.claimed
            }
        };
        self.outstanding.insert(nonce);
        nonce
    }

    fn adopt(&mut self, nonce: u64) {
        if nonce <= self.confirmed {
            return;
        }
        for skipped in self.claimed + 1..nonce {
            self.free.insert(skipped);
        }
        self.claimed = self.claimed.max(nonce);
        self.free.remove(&nonce);
        self.outstanding.insert(nonce);
    }

    /// Hand `nonce` out again if it was voided, else the next free nonce.
    fn reclaim(&mut self, nonce: u64) -> u64 {
        if nonce > self.confirmed && self.free.remove(&nonce) {
            self.outstanding.insert(nonce);
            return nonce;
        }
        self.claim()
    }

    fn release(&mut self, nonce: u64, how: NonceRelease) {
        let was_outstanding = self.outstanding.remove(&nonce);
        if nonce <= self.confirmed {
            return;
        }
        match how {
            NonceRelease::Consumed => {
                self.free.remove(&nonce);
                self.claimed = self.claimed.max(nonce);
                self.consumed_ahead.insert(nonce);
                self.advance();
            }
            NonceRelease::Void if was_outstanding => {
                self.free.insert(nonce);
                self.trim_trailing_free();
            }
            // Already voided, or reclaimed by someone else since.
            NonceRelease::Void => {}
        }
    }

    fn advance(&mut self) {
        while self.consumed_ahead.remove(&(self.confirmed + 1)) {
            self.confirmed += 1;
        }
    }

    /// Voided nonces at the top of the claimed range are simply given back.
    fn trim_trailing_free(&mut self) {
        while self.claimed > self.confirmed && self.free.remove(&self.claimed) {
            self.claimed -= 1;
        }
    }

    fn head_of_line(&self) -> Option<(u64, usize)> {
        let head = self.confirmed + 1;
        if head > self.claimed || self.consumed_ahead.contains(&head) {
            return None;
        }
        let waiting = self.outstanding.range(head + 1..).count()
            + self.consumed_ahead.range(head + 1..).count();
        if waiting == 0 {
            None
        } else {
            Some((head, waiting))
        }
    }
}

/// Hands out nonces per signing account.
///
/// State for different accounts lives behind separate locks; the map lock is
/// only held long enough to find or create an account's entry.
#[derive(Debug, Default)]
pub struct NonceSequencer {
    accounts: RwLock<HashMap<String, Arc<Mutex<AccountNonces>>>>,
}

impl NonceSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, account: &str) -> Arc<Mutex<AccountNonces>> {
        if let Some(entry) = self.accounts.read().await.get(account) {
            return Arc::clone(entry);
        }
        let mut accounts = self.accounts.write().await;
        Arc::clone(accounts.entry(account.to_string()).or_default())
    }

    /// Start an account from the ledger's current nonce. Only takes effect
    /// for an account with nothing claimed yet.
    pub async fn seed(&self, account: &str, on_chain: u64) {
        let entry = self.entry(account).await;
        let mut state = entry.lock().await;
        if state.claimed == 0 && state.outstanding.is_empty() {
            state.confirmed = on_chain;
            state.claimed = on_chain;
        }
    }

    /// Mark `nonce` as claimed and in flight, for transactions sent before a
    /// restart. Unclaimed nonces below it become reusable.
    pub async fn adopt(&self, account: &str, nonce: u64) {
        let entry = self.entry(account).await;
        entry.lock().await.adopt(nonce);
    }

    /// Next nonce for `account`. No two callers receive the same nonce
    /// unless one of them released it as [`NonceRelease::Void`] first.
    pub async fn claim(&self, account: &str) -> u64 {
        let entry = self.entry(account).await;
        let nonce = entry.lock().await.claim();
        tracing::debug!(account, nonce, "nonce claimed");
        nonce
    }

    /// Claim `nonce` again for a resend of the transaction that held it.
    /// Falls back to [`claim`](Self::claim) when the nonce is no longer free.
    pub async fn reclaim(&self, account: &str, nonce: u64) -> u64 {
        let entry = self.entry(account).await;
        let claimed = entry.lock().await.reclaim(nonce);
        tracing::debug!(account, nonce = claimed, previous = nonce, "nonce reclaimed");
        claimed
    }

    /// Release a claimed nonce. Voiding a nonce that is not outstanding
    /// does nothing.
    pub async fn release(&self, account: &str, nonce: u64, how: NonceRelease) {
        let entry = self.entry(account).await;
        let mut state = entry.lock().await;
        let before = state.confirmed;
        state.release(nonce, how);
        tracing::debug!(
            account,
            nonce,
            release = ?how,
            confirmed = state.confirmed,
            advanced = state.confirmed > before,
            "nonce released"
        );
    }

    /// Compare with the ledger's consumed nonce. When the ledger is ahead
    /// (something confirmed on a path this process never observed), move the
    /// watermark up to it and forget local bookkeeping below it. A ledger
    /// that reports less than the local watermark is lagging; the watermark
    /// never moves back.
    pub async fn reconcile_from_chain(&self, account: &str, on_chain: u64) -> NonceDrift {
        let entry = self.entry(account).await;
        let mut state = entry.lock().await;
        let local_confirmed = state.confirmed;
        let advanced = on_chain > local_confirmed;
        if advanced {
            state.confirmed = on_chain;
            state.claimed = state.claimed.max(on_chain);
            state.free = state.free.split_off(&(on_chain + 1));
            state.consumed_ahead = state.consumed_ahead.split_off(&(on_chain + 1));
            state.advance();
            state.trim_trailing_free();
            tracing::warn!(
                account,
                local_confirmed,
                on_chain,
                "nonce watermark behind ledger, advanced"
            );
        } else if on_chain < local_confirmed {
            tracing::warn!(account, local_confirmed, on_chain, "ledger nonce lags local watermark");
        }
        NonceDrift {
            account: account.to_string(),
            local_confirmed,
            on_chain,
            advanced,
        }
    }

    /// Accounts where an unresolved nonce holds back later ones.
    pub async fn blocked_accounts(&self) -> Vec<HeadOfLineBlock> {
        let entries: Vec<(String, Arc<Mutex<AccountNonces>>)> = self
            .accounts
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        let mut blocked = Vec::new();
        for (account, entry) in entries {
            if let Some((blocking_nonce, waiting)) = entry.lock().await.head_of_line() {
                blocked.push(HeadOfLineBlock {
                    account,
                    blocking_nonce,
                    waiting,
                });
            }
        }
        blocked.sort_by(|a, b| a.account.cmp(&b.account));
        blocked
    }

    pub async fn snapshot(&self, account: &str) -> NonceSnapshot {
        let entry = self.entry(account).await;
        let state = entry.lock().await;
        NonceSnapshot {
            account: account.to_string(),
            claimed: state.claimed,
            confirmed: state.confirmed,
            outstanding: state.outstanding.iter().copied().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const ACCT: &str = "0xaaaa";

    #[tokio::test]
    async fn claims_are_strictly_increasing_from_one() {
        let seq = NonceSequencer::new();
        assert_eq!(seq.claim(ACCT).await, 1);
        assert_eq!(seq.claim(ACCT).await, 2);
        assert_eq!(seq.claim(ACCT).await, 3);
    }

    #[tokio::test]
    async fn accounts_are_independent() {
        let seq = NonceSequencer::new();
        assert_eq!(seq.claim("0xa").await, 1);
        assert_eq!(seq.claim("0xb").await, 1);
        assert_eq!(seq.claim("0xa").await, 2);
    }

    #[tokio::test]
    async fn concurrent_claims_never_collide() {
        let seq = Arc::new(NonceSequencer::new());
        let mut handles = Vec::new();
        for _ in 0..50 {
            let seq = Arc::clone(&seq);
            handles.push(tokio::spawn(async move { seq.claim(ACCT).await }));
        }
        let mut seen = HashSet::new();
        for h in handles {
            assert!(seen.insert(h.await.unwrap()));
        }
        assert_eq!(seen, (1..=50).collect::<HashSet<u64>>());
    }

    #[tokio::test]
    async fn watermark_waits_for_lowest_nonce() {
        let seq = NonceSequencer::new();
        for _ in 0..3 {
            seq.claim(ACCT).await;
        }
        seq.release(ACCT, 2, NonceRelease::Consumed).await;
        seq.release(ACCT, 3, NonceRelease::Consumed).await;
        assert_eq!(seq.snapshot(ACCT).await.confirmed, 0);

        let blocked = seq.blocked_accounts().await;
        assert_eq!(
            blocked,
            vec![HeadOfLineBlock {
                account: ACCT.to_string(),
                blocking_nonce: 1,
                waiting: 2,
            }]
        );

        seq.release(ACCT, 1, NonceRelease::Consumed).await;
        assert_eq!(seq.snapshot(ACCT).await.confirmed, 3);
        assert!(seq.blocked_accounts().await.is_empty());
    }

    #[tokio::test]
    async fn voided_nonce_is_reused_first() {
        let seq = NonceSequencer::new();
        let a = seq.claim(ACCT).await;
        let b = seq.claim(ACCT).await;
        seq.release(ACCT, a, NonceRelease::Void).await;
        assert_eq!(seq.claim(ACCT).await, a);
        assert_eq!(seq.claim(ACCT).await, b + 1);
    }

    #[tokio::test]
    async fn voided_top_nonce_is_given_back() {
        let seq = NonceSequencer::new();
        let n = seq.claim(ACCT).await;
        seq.release(ACCT, n, NonceRelease::Void).await;
        let snap = seq.snapshot(ACCT).await;
        assert_eq!(snap.claimed, 0);
        assert!(snap.outstanding.is_empty());
        assert_eq!(seq.claim(ACCT).await, 1);
    }

    #[tokio::test]
    async fn voiding_twice_does_not_hand_a_nonce_out_twice() {
        let seq = NonceSequencer::new();
        let n = seq.claim(ACCT).await;
        seq.release(ACCT, n, NonceRelease::Void).await;
        seq.release(ACCT, n, NonceRelease::Void).await;
        assert_eq!(seq.claim(ACCT).await, 1);
        assert_eq!(seq.claim(ACCT).await, 2);
        assert_eq!(seq.snapshot(ACCT).await.outstanding, vec![1, 2]);
    }

    #[tokio::test]
    async fn reclaim_prefers_the_voided_nonce() {
        let seq = NonceSequencer::new();
        for _ in 0..3 {
            seq.claim(ACCT).await;
        }
        seq.release(ACCT, 1, NonceRelease::Void).await;
        seq.release(ACCT, 2, NonceRelease::Void).await;
        assert_eq!(seq.reclaim(ACCT, 2).await, 2);
        assert_eq!(seq.claim(ACCT).await, 1);
        // Taken by someone else: the next free nonce instead.
        assert_eq!(seq.reclaim(ACCT, 1).await, 4);
    }

    #[tokio::test]
    async fn late_consumption_of_a_voided_nonce_counts() {
        let seq = NonceSequencer::new();
        let n = seq.claim(ACCT).await;
        seq.release(ACCT, n, NonceRelease::Void).await;
        seq.release(ACCT, n, NonceRelease::Consumed).await;
        let snap = seq.snapshot(ACCT).await;
        assert_eq!(snap.confirmed, 1);
        assert_eq!(snap.claimed, 1);
        assert_eq!(seq.claim(ACCT).await, 2);
    }

    #[tokio::test]
    async fn claimed_never_below_confirmed() {
        let seq = NonceSequencer::new();
        for _ in 0..4 {
            seq.claim(ACCT).await;
        }
        seq.release(ACCT, 1, NonceRelease::Consumed).await;
        seq.release(ACCT, 4, NonceRelease::Void).await;
        seq.release(ACCT, 2, NonceRelease::Consumed).await;
        seq.release(ACCT, 3, NonceRelease::Void).await;
        let snap = seq.snapshot(ACCT).await;
        assert!(snap.claimed >= snap.confirmed);
        assert_eq!(snap.confirmed, 2);
        assert_eq!(snap.claimed, 2);
    }

    #[tokio::test]
    async fn reconcile_unblocks_when_chain_is_ahead() {
        let seq = NonceSequencer::new();
        for _ in 0..3 {
            seq.claim(ACCT).await;
        }
        seq.release(ACCT, 3, NonceRelease::Consumed).await;
        // Nonces 1 and 2 were included by a path this process never saw.
        let drift = seq.reconcile_from_chain(ACCT, 2).await;
        assert!(drift.advanced);
        assert_eq!(drift.local_confirmed, 0);
        assert_eq!(seq.snapshot(ACCT).await.confirmed, 3);
        assert!(seq.blocked_accounts().await.is_empty());
    }

    #[tokio::test]
    async fn reconcile_never_moves_watermark_back() {
        let seq = NonceSequencer::new();
        let n = seq.claim(ACCT).await;
        seq.release(ACCT, n, NonceRelease::Consumed).await;
        let drift = seq.reconcile_from_chain(ACCT, 0).await;
        assert!(!drift.advanced);
        assert_eq!(seq.snapshot(ACCT).await.confirmed, 1);
    }

    #[tokio::test]
    async fn adopted_nonce_is_outstanding_and_gap_is_reusable() {
        let seq = NonceSequencer::new();
        seq.seed(ACCT, 2).await;
        seq.adopt(ACCT, 5).await;
        let snap = seq.snapshot(ACCT).await;
        assert_eq!(snap.claimed, 5);
        assert_eq!(snap.outstanding, vec![5]);
        assert_eq!(seq.claim(ACCT).await, 3);
        assert_eq!(seq.claim(ACCT).await, 4);
        assert_eq!(seq.claim(ACCT).await, 6);
    }

    #[tokio::test]
    async fn seed_starts_after_chain_nonce() {
        let seq = NonceSequencer::new();
        seq.seed(ACCT, 41).await;
        assert_eq!(seq.claim(ACCT).await, 42);
        // A second seed after claims is ignored.
        seq.seed(ACCT, 7).await;
        assert_eq!(seq.claim(ACCT).await, 43);
    }
}
