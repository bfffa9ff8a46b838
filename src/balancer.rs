//! Least-served-first stimulus assignment.
//!
//! Each new session claims the items with the lowest usage counters. The
//! claim (counter increment) happens before the items are handed back, so a
//! participant connecting a moment later already sees the updated counts.
//! Claims are compare-and-set against the counter value observed during
//! selection; an item that lost a race is excluded and selection is retried.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::{AssignCount, BalancerConfig};
use crate::error::{AssignmentError, AssignmentResult};
use crate::storage::{PoolFilter, StimulusItem, Storage};

/// Selects and claims stimuli for new sessions.
#[derive(Clone)]
pub struct StimulusBalancer {
    storage: Arc<dyn Storage>,
    max_retries: u32,
    fairness_slack: i64,
}

impl StimulusBalancer {
    /// Create a balancer over the given storage.
    pub fn new(storage: Arc<dyn Storage>, config: &BalancerConfig) -> Self {
        Self {
            storage,
            max_retries: config.max_retries,
            fairness_slack: config.fairness_slack.max(0),
        }
    }

    /// Select and claim stimuli from `pool_id` for `session_id`.
    ///
    /// Returns the claimed items in selection order with their counters
    /// already bumped. A pool with fewer items than requested yields all of
    /// them.
    pub async fn assign(
        &self,
        pool_id: &str,
        session_id: &str,
        count: AssignCount,
    ) -> AssignmentResult<Vec<StimulusItem>> {
        let items = match count {
            AssignCount::Limit(n) => self.assign_least_used(pool_id, session_id, n).await?,
            AssignCount::All => self.assign_all(pool_id, session_id).await?,
        };

        info!(
            pool_id = %pool_id,
            session_id = %session_id,
            assigned = items.len(),
            "Stimuli assigned"
        );

        Ok(items)
    }

    /// Undo the claims `session_id` holds on `items`.
    ///
    /// Failures are logged and skipped so the remaining claims still get
    /// released.
    pub async fn release(&self, session_id: &str, items: &[StimulusItem]) {
        // A named fn keeps the iterator higher-ranked so the future stays `Send`.
        fn item_id(item: &StimulusItem) -> &str {
            item.id.as_str()
        }
        self.release_ids(session_id, items.iter().map(item_id))
            .await;
    }

    async fn release_ids<'a>(&self, session_id: &str, ids: impl IntoIterator<Item = &'a str>) {
        let mut released = 0usize;
        for item_id in ids {
            match self.storage.release_usage(item_id, session_id).await {
                Ok(true) => released += 1,
                Ok(false) => {
                    warn!(item_id = %item_id, session_id = %session_id, "No claim to release")
                }
                Err(e) => {
                    error!(item_id = %item_id, session_id = %session_id, error = %e, "Failed to release claim")
                }
            }
        }
        if released > 0 {
            debug!(session_id = %session_id, released, "Claims released");
        }
    }

    async fn assign_least_used(
        &self,
        pool_id: &str,
        session_id: &str,
        wanted: usize,
    ) -> AssignmentResult<Vec<StimulusItem>> {
        let mut claimed = Vec::new();
        match self
            .claim_least_used(pool_id, session_id, wanted, &mut claimed)
            .await
        {
            Ok(()) => Ok(claimed),
            Err(e) => {
                self.release(session_id, &claimed).await;
                Err(e)
            }
        }
    }

    /// Claim into `claimed` until `wanted` items are held or the pool runs out.
    async fn claim_least_used(
        &self,
        pool_id: &str,
        session_id: &str,
        wanted: usize,
        claimed: &mut Vec<StimulusItem>,
    ) -> AssignmentResult<()> {
        let mut excluded: HashSet<String> = HashSet::new();
        let mut conflicts = 0u32;
        let mut attempt = 0u32;

        while claimed.len() < wanted {
            let filter = PoolFilter::pool(pool_id).excluding(excluded.iter().cloned());
            let candidates = self
                .storage
                .least_used(&filter, wanted - claimed.len())
                .await?;

            if candidates.is_empty() {
                break;
            }

            let mut lost_race = false;
            for mut item in candidates {
                excluded.insert(item.id.clone());
                let ceiling = item.usage_count + self.fairness_slack;

                if self
                    .storage
                    .increment_usage(&item.id, session_id, Some(ceiling))
                    .await?
                {
                    item.mark_claimed(session_id);
                    claimed.push(item);
                } else {
                    let conflict = AssignmentError::AssignmentConflict {
                        item_id: item.id.clone(),
                    };
                    debug!(session_id = %session_id, attempt, error = %conflict, "Retrying selection");
                    conflicts += 1;
                    lost_race = true;
                }
            }

            if !lost_race {
                break;
            }

            attempt += 1;
            if attempt > self.max_retries {
                warn!(
                    pool_id = %pool_id,
                    session_id = %session_id,
                    conflicts,
                    "Stimulus assignment exhausted retries"
                );
                return Err(AssignmentError::AssignmentFailed {
                    pool_id: pool_id.to_string(),
                    attempts: attempt,
                });
            }
        }

        if claimed.is_empty() {
            if conflicts > 0 {
                return Err(AssignmentError::AssignmentFailed {
                    pool_id: pool_id.to_string(),
                    attempts: attempt,
                });
            }
            return Err(AssignmentError::EmptyPool {
                pool_id: pool_id.to_string(),
            });
        }

        Ok(())
    }

    /// Whole-pool assignment: every item, in insertion order, each counted.
    async fn assign_all(
        &self,
        pool_id: &str,
        session_id: &str,
    ) -> AssignmentResult<Vec<StimulusItem>> {
        let mut items = self.storage.load(&PoolFilter::pool(pool_id)).await?;
        if items.is_empty() {
            return Err(AssignmentError::EmptyPool {
                pool_id: pool_id.to_string(),
            });
        }

        let mut held: Vec<String> = Vec::new();
        for item in &mut items {
            match self.storage.increment_usage(&item.id, session_id, None).await {
                Ok(true) => {
                    item.mark_claimed(session_id);
                    held.push(item.id.clone());
                }
                Ok(false) => {
                    warn!(item_id = %item.id, "Item vanished while counting whole-pool usage")
                }
                Err(e) => {
                    self.release_ids(session_id, held.iter().map(String::as_str))
                        .await;
                    return Err(e.into());
                }
            }
        }

        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;
    use serde_json::json;

    async fn balancer_with_pool(ids: &[&str]) -> (StimulusBalancer, Arc<SqliteStorage>) {
        let storage = Arc::new(SqliteStorage::new_in_memory().await.unwrap());
        for id in ids {
            let item = StimulusItem::new("pool", json!({"stim_url": format!("{}.mp4", id)}))
                .with_id(*id);
            storage.insert_stimulus(&item).await.unwrap();
        }
        let balancer = StimulusBalancer::new(storage.clone(), &BalancerConfig::default());
        (balancer, storage)
    }

    #[tokio::test]
    async fn test_assign_prefers_least_used_then_insertion_order() {
        let (balancer, _storage) = balancer_with_pool(&["a", "b", "c"]).await;

        let first = balancer.assign("pool", "s1", AssignCount::Limit(1)).await.unwrap();
        let second = balancer.assign("pool", "s2", AssignCount::Limit(1)).await.unwrap();
        let third = balancer.assign("pool", "s3", AssignCount::Limit(1)).await.unwrap();
        let fourth = balancer.assign("pool", "s4", AssignCount::Limit(1)).await.unwrap();

        assert_eq!(first[0].id, "a");
        assert_eq!(second[0].id, "b");
        assert_eq!(third[0].id, "c");
        assert_eq!(fourth[0].id, "a");
        assert_eq!(fourth[0].usage_count, 2);
        assert_eq!(fourth[0].claimed_by, vec!["s1", "s4"]);
    }

    #[tokio::test]
    async fn test_assign_empty_pool() {
        let (balancer, _storage) = balancer_with_pool(&[]).await;
        let result = balancer.assign("pool", "s1", AssignCount::Limit(1)).await;
        assert!(matches!(result, Err(AssignmentError::EmptyPool { .. })));

        let result = balancer.assign("pool", "s1", AssignCount::All).await;
        assert!(matches!(result, Err(AssignmentError::EmptyPool { .. })));
    }

    #[tokio::test]
    async fn test_assign_more_than_pool_returns_whole_pool() {
        let (balancer, _storage) = balancer_with_pool(&["a", "b"]).await;
        let items = balancer.assign("pool", "s1", AssignCount::Limit(5)).await.unwrap();
        let ids: Vec<_> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_assign_all_counts_every_item() {
        let (balancer, storage) = balancer_with_pool(&["a", "b", "c"]).await;
        balancer.assign("pool", "s0", AssignCount::Limit(1)).await.unwrap();

        let items = balancer.assign("pool", "s1", AssignCount::All).await.unwrap();
        let ids: Vec<_> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        let stored = storage.load(&PoolFilter::pool("pool")).await.unwrap();
        let counts: Vec<_> = stored.iter().map(|i| i.usage_count).collect();
        assert_eq!(counts, vec![2, 1, 1]);
    }

    #[tokio::test]
    async fn test_huge_count_yields_whole_pool() {
        let (balancer, _storage) = balancer_with_pool(&["a", "b"]).await;
        let items = balancer
            .assign("pool", "s1", AssignCount::Limit(usize::MAX))
            .await
            .unwrap();
        assert_eq!(items.len(), 2);
    }

    #[tokio::test]
    async fn test_release_returns_items_to_the_pool() {
        let (balancer, storage) = balancer_with_pool(&["a", "b"]).await;
        let items = balancer.assign("pool", "s1", AssignCount::All).await.unwrap();

        balancer.release("s1", &items).await;

        let stored = storage.load(&PoolFilter::pool("pool")).await.unwrap();
        assert!(stored.iter().all(|i| i.usage_count == 0 && i.claimed_by.is_empty()));

        // A second release finds nothing to undo.
        balancer.release("s1", &items).await;
        let stored = storage.load(&PoolFilter::pool("pool")).await.unwrap();
        assert!(stored.iter().all(|i| i.usage_count == 0));
    }

    #[tokio::test]
    async fn test_negative_slack_is_clamped() {
        let storage = Arc::new(SqliteStorage::new_in_memory().await.unwrap());
        let config = BalancerConfig {
            max_retries: 1,
            fairness_slack: -5,
        };
        let balancer = StimulusBalancer::new(storage, &config);
        assert_eq!(balancer.fairness_slack, 0);
    }
}
