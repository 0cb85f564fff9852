use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;

use super::{InMemoryCoordinationStore, StoreState};
use crate::domain::{
    GroupId, JobCounts, JobId, JobRecord, JobStatus, QueueType, Result, WardenError,
};
use crate::ports::{IdGenerator, JobQueueClient, KeepAlive};

/// chrono の範囲を超える Duration は設定エラー
fn to_chrono(d: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(d).map_err(|e| WardenError::Config(format!("duration: {e}")))
}

/// Heartbeat/complete are only valid against the exact Running row the caller holds.
fn check_version(stored: &JobRecord, presented: &JobRecord) -> Result<()> {
    if stored.status != JobStatus::Running || stored.version != presented.version {
        return Err(WardenError::StaleVersion {
            job_id: presented.job_id,
            expected: presented.version,
            actual: stored.version,
        });
    }
    Ok(())
}

#[async_trait]
impl JobQueueClient for InMemoryCoordinationStore {
    async fn enqueue(
        &self,
        queue_type: &QueueType,
        definitions: Vec<serde_json::Value>,
        group_id: Option<GroupId>,
        force_one_active_job_group: bool,
    ) -> Result<Vec<JobRecord>> {
        let mut state = self.state.lock().await;
        state.check_fault("enqueue")?;
        let now = self.now();

        if force_one_active_job_group
            && state
                .jobs
                .values()
                .any(|j| &j.queue_type == queue_type && !j.status.is_terminal())
        {
            return Err(WardenError::JobGroupConflict {
                queue_type: queue_type.to_string(),
            });
        }

        let group_id = group_id.unwrap_or_else(|| self.ids.generate_group_id());
        let mut created = Vec::with_capacity(definitions.len());
        for definition in definitions {
            let existing = state.jobs.values().find(|j| {
                &j.queue_type == queue_type
                    && !j.status.is_terminal()
                    && j.definition == definition
            });
            if let Some(existing) = existing {
                created.push(existing.clone());
                continue;
            }
            let job_id = self.ids.generate_job_id();
            let record = JobRecord::new(queue_type.clone(), group_id, job_id, definition, now);
            state.jobs.insert(job_id, record.clone());
            created.push(record);
        }
        Ok(created)
    }

    async fn enqueue_unique(
        &self,
        queue_type: &QueueType,
        key: &str,
        definition: serde_json::Value,
    ) -> Result<JobRecord> {
        let mut state = self.state.lock().await;
        state.check_fault("enqueue_unique")?;
        let now = self.now();

        let index = (queue_type.clone(), key.to_string());
        if let Some(existing) = state.unique_keys.get(&index).and_then(|id| state.jobs.get(id)) {
            return Ok(existing.clone());
        }
        let job_id = self.ids.generate_job_id();
        let mut record = JobRecord::new(
            queue_type.clone(),
            self.ids.generate_group_id(),
            job_id,
            definition,
            now,
        );
        record.unique_key = Some(key.to_string());
        state.jobs.insert(job_id, record.clone());
        state.unique_keys.insert(index, job_id);
        Ok(record)
    }

    async fn dequeue(
        &self,
        queue_type: &QueueType,
        worker_id: &str,
        heartbeat_timeout: Duration,
        job_id: Option<JobId>,
    ) -> Result<Option<JobRecord>> {
        let mut state = self.state.lock().await;
        state.check_fault("dequeue")?;
        let now = self.now();
        let timeout = to_chrono(heartbeat_timeout)?;

        for job in state.jobs.values_mut() {
            if &job.queue_type != queue_type
                || job_id.is_some_and(|id| id != job.job_id)
                || !job.is_claimable(now, timeout)
            {
                continue;
            }
            // An abandoned job whose group was cancelled is not handed out again.
            if job.cancel_requested {
                job.finish(JobStatus::Cancelled, now);
                continue;
            }
            job.start_attempt(worker_id, now);
            return Ok(Some(job.clone()));
        }
        Ok(None)
    }

    async fn keep_alive(&self, job: &JobRecord) -> Result<KeepAlive> {
        let mut state = self.state.lock().await;
        state.check_fault("keep_alive")?;
        let now = self.now();

        let stored = state
            .jobs
            .get_mut(&job.job_id)
            .ok_or_else(|| WardenError::NotFound(job.job_id.to_string()))?;
        check_version(stored, job)?;
        stored.heartbeat(now);
        Ok(KeepAlive {
            job: stored.clone(),
            cancel_requested: stored.cancel_requested,
        })
    }

    async fn complete_job(&self, job: &JobRecord, failed: bool) -> Result<JobRecord> {
        let mut state = self.state.lock().await;
        state.check_fault("complete_job")?;
        let now = self.now();

        let stored = state
            .jobs
            .get_mut(&job.job_id)
            .ok_or_else(|| WardenError::NotFound(job.job_id.to_string()))?;
        check_version(stored, job)?;
        let status = match (failed, stored.cancel_requested) {
            (_, true) => JobStatus::Cancelled,
            (true, false) => JobStatus::Failed,
            (false, false) => JobStatus::Completed,
        };
        stored.finish(status, now);
        Ok(stored.clone())
    }

    async fn archive_expired_groups(
        &self,
        queue_type: &QueueType,
        retention: Duration,
    ) -> Result<usize> {
        let mut state = self.state.lock().await;
        state.check_fault("archive_expired_groups")?;
        // A retention reaching past the representable range keeps everything.
        let Some(cutoff) = self.now().checked_sub_signed(to_chrono(retention)?) else {
            return Ok(0);
        };

        // group -> still eligible for archival
        let mut groups: HashMap<GroupId, bool> = HashMap::new();
        for job in state.jobs.values().filter(|j| &j.queue_type == queue_type) {
            let expired = job.status.is_terminal() && job.ended_at.is_some_and(|t| t < cutoff);
            let eligible = groups.entry(job.group_id).or_insert(true);
            *eligible &= expired;
        }
        let archived: HashSet<GroupId> = groups
            .into_iter()
            .filter_map(|(group, eligible)| eligible.then_some(group))
            .collect();
        let StoreState {
            jobs, unique_keys, ..
        } = &mut *state;
        jobs.retain(|_, j| {
            let keep = &j.queue_type != queue_type || !archived.contains(&j.group_id);
            if !keep {
                if let Some(key) = &j.unique_key {
                    unique_keys.remove(&(j.queue_type.clone(), key.clone()));
                }
            }
            keep
        });
        Ok(archived.len())
    }

    async fn get_jobs_by_group(
        &self,
        queue_type: &QueueType,
        group_id: GroupId,
    ) -> Result<Vec<JobRecord>> {
        let mut state = self.state.lock().await;
        state.check_fault("get_jobs_by_group")?;
        Ok(state
            .jobs
            .values()
            .filter(|j| &j.queue_type == queue_type && j.group_id == group_id)
            .cloned()
            .collect())
    }

    async fn cancel_group(&self, queue_type: &QueueType, group_id: GroupId) -> Result<usize> {
        let mut state = self.state.lock().await;
        state.check_fault("cancel_group")?;
        let now = self.now();

        let mut touched = 0;
        for job in state
            .jobs
            .values_mut()
            .filter(|j| &j.queue_type == queue_type && j.group_id == group_id)
        {
            match job.status {
                JobStatus::Created => {
                    job.finish(JobStatus::Cancelled, now);
                    touched += 1;
                }
                JobStatus::Running => {
                    job.cancel_requested = true;
                    touched += 1;
                }
                _ => {}
            }
        }
        Ok(touched)
    }

    async fn counts_by_status(&self, queue_type: &QueueType) -> Result<JobCounts> {
        let mut state = self.state.lock().await;
        state.check_fault("counts_by_status")?;
        let mut counts = JobCounts::default();
        for job in state.jobs.values().filter(|j| &j.queue_type == queue_type) {
            counts.add(job.status);
        }
        Ok(counts)
    }
}
