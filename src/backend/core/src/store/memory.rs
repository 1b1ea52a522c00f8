//! In-process job store.
//!
//! Used in tests, local runs, and as the last tier behind the networked
//! stores. Records live only as long as the process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;

use super::{order_eligible, order_stale, JobStore};
use crate::error::{ErrorCode, QueueError, Result};
use crate::jobs::job::{JobId, JobPriority, JobRecord, JobStatus, JobUpdate};

#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: DashMap<JobId, JobRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn create(&self, job: &JobRecord) -> Result<JobId> {
        match self.jobs.entry(job.id) {
            Entry::Occupied(_) => Err(QueueError::new(
                ErrorCode::DuplicateRecord,
                format!("Job already exists: {}", job.id),
            )),
            Entry::Vacant(slot) => {
                slot.insert(job.clone());
                Ok(job.id)
            }
        }
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>> {
        Ok(self.jobs.get(&id).map(|entry| entry.value().clone()))
    }

    async fn update(&self, id: JobId, update: &JobUpdate) -> Result<JobRecord> {
        let mut entry = self
            .jobs
            .get_mut(&id)
            .ok_or_else(|| QueueError::job_not_found(id))?;
        entry.apply(update);
        Ok(entry.clone())
    }

    async fn claim(&self, id: JobId, now: DateTime<Utc>) -> Result<Option<JobRecord>> {
        // get_mut holds the shard write lock, so check-and-set is atomic.
        let Some(mut entry) = self.jobs.get_mut(&id) else {
            return Ok(None);
        };
        if !entry.is_claimable(now) {
            return Ok(None);
        }
        let attempts = entry.attempts + 1;
        entry.apply(&JobUpdate::processing(attempts, now));
        Ok(Some(entry.clone()))
    }

    async fn list_eligible(
        &self,
        limit: usize,
        priority_order: &[JobPriority],
        now: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>> {
        let eligible = self
            .jobs
            .iter()
            .filter(|entry| entry.is_eligible(now))
            .map(|entry| entry.value().clone())
            .collect();
        Ok(order_eligible(eligible, limit, priority_order))
    }

    async fn list_stale(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<JobRecord>> {
        let stale = self
            .jobs
            .iter()
            .filter(|entry| entry.status == JobStatus::Processing && entry.updated_at < cutoff)
            .map(|entry| entry.value().clone())
            .collect();
        Ok(order_stale(stale, limit))
    }

    async fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>> {
        let mut counts = HashMap::new();
        for entry in self.jobs.iter() {
            *counts.entry(entry.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>, statuses: &[JobStatus]) -> Result<u64> {
        let before = self.jobs.len();
        self.jobs
            .retain(|_, job| !(statuses.contains(&job.status) && job.updated_at < cutoff));
        Ok((before - self.jobs.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::payload::ResearchRequest;
    use chrono::Duration;
    use std::sync::Arc;

    fn job(owner: &str, priority: JobPriority) -> JobRecord {
        let payload = ResearchRequest::new(format!("query from {}", owner)).validate(1000).unwrap();
        JobRecord::new(owner, payload, priority, 3)
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = MemoryStore::new();
        let record = job("u1", JobPriority::Normal);
        let id = store.create(&record).await.unwrap();

        let fetched = store.get(id).await.unwrap().unwrap();
        assert_eq!(fetched, record);
        assert!(store.create(&record).await.is_err());
        assert!(store.get(JobId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_unknown_job() {
        let store = MemoryStore::new();
        let err = store
            .update(JobId::new(), &JobUpdate::at(Utc::now()))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_list_eligible_orders_by_priority_then_age() {
        let store = MemoryStore::new();
        let mut low = job("low", JobPriority::Low);
        let mut normal = job("normal", JobPriority::Normal);
        let mut high_old = job("high-old", JobPriority::High);
        let mut high_new = job("high-new", JobPriority::High);
        let base = Utc::now() - Duration::minutes(10);
        low.created_at = base;
        normal.created_at = base + Duration::seconds(1);
        high_old.created_at = base + Duration::seconds(2);
        high_new.created_at = base + Duration::seconds(3);
        for j in [&high_new, &low, &normal, &high_old] {
            store.create(j).await.unwrap();
        }

        let listed = store
            .list_eligible(10, &JobPriority::DESCENDING, Utc::now())
            .await
            .unwrap();
        let owners: Vec<_> = listed.iter().map(|j| j.owner_id.as_str()).collect();
        assert_eq!(owners, vec!["high-old", "high-new", "normal", "low"]);

        let limited = store
            .list_eligible(2, &JobPriority::DESCENDING, Utc::now())
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
        assert!(limited.iter().all(|j| j.priority == JobPriority::High));
    }

    #[tokio::test]
    async fn test_retry_timer_excludes_until_due() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut record = job("u1", JobPriority::Normal);
        record.status = JobStatus::Failed;
        record.attempts = 1;
        record.next_retry_at = Some(now + Duration::seconds(10));
        store.create(&record).await.unwrap();

        let listed = store.list_eligible(10, &JobPriority::DESCENDING, now).await.unwrap();
        assert!(listed.is_empty());

        let later = now + Duration::seconds(10);
        let listed = store.list_eligible(10, &JobPriority::DESCENDING, later).await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn test_list_eligible_includes_exhausted_jobs() {
        let store = MemoryStore::new();
        let mut failed = job("failed", JobPriority::Normal);
        failed.status = JobStatus::Failed;
        failed.attempts = 3;
        let mut pending = job("pending", JobPriority::Normal);
        pending.max_attempts = 0;
        for j in [&failed, &pending] {
            store.create(j).await.unwrap();
        }

        let listed = store.list_eligible(10, &JobPriority::DESCENDING, Utc::now()).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|j| j.attempts_exhausted()));
    }

    #[tokio::test]
    async fn test_list_stale_returns_old_processing_jobs() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut stuck = job("stuck", JobPriority::Low);
        stuck.status = JobStatus::Processing;
        stuck.updated_at = now - Duration::minutes(10);
        let mut running = job("running", JobPriority::Low);
        running.status = JobStatus::Processing;
        let mut old_pending = job("old-pending", JobPriority::Low);
        old_pending.updated_at = now - Duration::minutes(10);
        for j in [&stuck, &running, &old_pending] {
            store.create(j).await.unwrap();
        }

        let stale = store.list_stale(now - Duration::minutes(5), 10).await.unwrap();
        let owners: Vec<_> = stale.iter().map(|j| j.owner_id.as_str()).collect();
        assert_eq!(owners, vec!["stuck"]);
    }

    #[tokio::test]
    async fn test_claim_is_single_owner() {
        let store = Arc::new(MemoryStore::new());
        let record = job("u1", JobPriority::High);
        store.create(&record).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            let id = record.id;
            handles.push(tokio::spawn(async move { store.claim(id, Utc::now()).await.unwrap() }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        let claimed = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Processing);
        assert_eq!(claimed.attempts, 1);

        let listed = store.list_eligible(10, &JobPriority::DESCENDING, Utc::now()).await.unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn test_claim_refuses_exhausted_job() {
        let store = MemoryStore::new();
        let mut record = job("u1", JobPriority::Normal);
        record.status = JobStatus::Failed;
        record.attempts = 3;
        store.create(&record).await.unwrap();

        assert!(store.claim(record.id, Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_count_and_delete() {
        let store = MemoryStore::new();
        let old = Utc::now() - Duration::days(8);

        let mut completed = job("a", JobPriority::Normal);
        completed.status = JobStatus::Completed;
        completed.updated_at = old;
        let mut dead = job("b", JobPriority::Normal);
        dead.status = JobStatus::DeadLetter;
        dead.updated_at = old;
        let pending = job("c", JobPriority::Normal);
        for j in [&completed, &dead, &pending] {
            store.create(j).await.unwrap();
        }

        let counts = store.count_by_status().await.unwrap();
        assert_eq!(counts.get(&JobStatus::Completed), Some(&1));
        assert_eq!(counts.get(&JobStatus::Pending), Some(&1));

        let cutoff = Utc::now() - Duration::days(7);
        let deleted = store
            .delete_older_than(cutoff, &[JobStatus::Completed, JobStatus::Failed])
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.len(), 2);
    }
}
