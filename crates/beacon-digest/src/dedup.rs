use std::collections::HashSet;
use std::sync::Arc;

use beacon_core::{OpportunityRecord, UserId};
use beacon_storage::{DigestStore, StoreError};
use tracing::{debug, warn};

/// Set difference between filtered candidates and the per-user sent ledger.
#[derive(Clone)]
pub struct DedupGate {
    store: Arc<dyn DigestStore>,
}

impl DedupGate {
    pub fn new(store: Arc<dyn DigestStore>) -> Self {
        Self { store }
    }

    /// Records never sent to `user_id`, in fetch order, each notice at most once.
    pub async fn net_new(
        &self,
        user_id: UserId,
        records: Vec<OpportunityRecord>,
    ) -> Result<Vec<OpportunityRecord>, StoreError> {
        if records.is_empty() {
            return Ok(records);
        }
        let ids = records
            .iter()
            .map(|r| r.notice_id.clone())
            .collect::<Vec<_>>();
        let sent = self.store.already_sent(user_id, &ids).await?;

        let mut seen = HashSet::new();
        let candidates = records.len();
        let fresh = records
            .into_iter()
            .filter(|r| !sent.contains(&r.notice_id) && seen.insert(r.notice_id.clone()))
            .collect::<Vec<_>>();
        debug!(
            user_id,
            candidates,
            already_sent = sent.len(),
            net_new = fresh.len(),
            "dedup gate"
        );
        Ok(fresh)
    }

    /// Persists delivery of `records`. Pairs already present are skipped by
    /// the store; returns the count newly written.
    pub async fn commit(
        &self,
        user_id: UserId,
        records: &[OpportunityRecord],
    ) -> Result<u64, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let ids = records
            .iter()
            .map(|r| r.notice_id.clone())
            .collect::<Vec<_>>();
        let inserted = self.store.record_sent(user_id, &ids).await?;
        let skipped = ids.len() as u64 - inserted.min(ids.len() as u64);
        if skipped > 0 {
            warn!(user_id, skipped, "notice ids already on the sent ledger; skipped");
        }
        Ok(inserted)
    }
}
