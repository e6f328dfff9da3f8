//! Tenant-partitioned job queue with round-robin fairness, per-tenant
//! in-flight caps and retry backoff.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{EngineError, Result};
use crate::tenant::TenantId;
use crate::types::{Job, JobId, NodeId, Outcome, RunId};

/// What the queue did with an acknowledged job
#[derive(Debug, Clone, PartialEq)]
pub enum Ack {
    /// Re-enqueued for another attempt after `delay`
    Retry { attempt: u32, delay: Duration },
    /// The job is finished; the outcome is final
    Done(Outcome),
}

/// Point-in-time view of one tenant partition
#[derive(Debug, Clone, Serialize)]
pub struct TenantQueueStats {
    pub tenant_id: TenantId,
    pub depth: usize,
    pub in_flight: u32,
    pub in_flight_cap: u32,
}

/// Point-in-time view of the whole queue
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub total_depth: usize,
    pub total_in_flight: u32,
    pub tenants: Vec<TenantQueueStats>,
}

struct QueuedJob {
    job: Job,
    not_before: Option<Instant>,
}

struct Partition {
    jobs: VecDeque<QueuedJob>,
    in_flight: u32,
    cap: u32,
}

impl Partition {
    fn new(cap: u32) -> Self {
        Self {
            jobs: VecDeque::new(),
            in_flight: 0,
            cap: cap.max(1),
        }
    }

    fn has_capacity(&self) -> bool {
        self.in_flight < self.cap
    }
}

enum Next {
    Job(Job),
    /// Nothing eligible; wake at the earliest backoff deadline, if any
    Wait(Option<Instant>),
}

struct QueueInner {
    partitions: HashMap<TenantId, Partition>,
    /// Round-robin order of tenants (provisioning order)
    order: Vec<TenantId>,
    cursor: usize,
    /// (run, node) pairs with a queued or dispatched job
    live: HashSet<(RunId, NodeId)>,
    /// Dispatched jobs and the tenant slot they hold
    leased: HashMap<JobId, TenantId>,
    closed: bool,
}

impl QueueInner {
    fn take_next(&mut self, now: Instant) -> Next {
        let tenants = self.order.len();
        let mut earliest: Option<Instant> = None;

        for offset in 0..tenants {
            let idx = (self.cursor + offset) % tenants;
            let tenant_id = &self.order[idx];
            let Some(partition) = self.partitions.get_mut(tenant_id) else {
                continue;
            };
            if !partition.has_capacity() {
                continue;
            }

            let eligible = partition
                .jobs
                .iter()
                .position(|queued| queued.not_before.map_or(true, |at| at <= now));

            match eligible {
                Some(pos) => {
                    let Some(queued) = partition.jobs.remove(pos) else {
                        continue;
                    };
                    partition.in_flight += 1;
                    self.leased.insert(queued.job.id, tenant_id.clone());
                    self.cursor = (idx + 1) % tenants;
                    return Next::Job(queued.job);
                }
                None => {
                    let pending = partition.jobs.iter().filter_map(|q| q.not_before).min();
                    earliest = match (earliest, pending) {
                        (Some(a), Some(b)) => Some(a.min(b)),
                        (a, b) => a.or(b),
                    };
                }
            }
        }

        Next::Wait(earliest)
    }

    /// Give back the tenant slot held by a dispatched job
    fn unlease(&mut self, job_id: &JobId) -> bool {
        let Some(tenant_id) = self.leased.remove(job_id) else {
            return false;
        };
        if let Some(partition) = self.partitions.get_mut(&tenant_id) {
            partition.in_flight = partition.in_flight.saturating_sub(1);
        }
        true
    }
}

/// Job queue shared by the controller (producer) and the worker pool (consumers)
pub struct JobQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    max_backoff: Duration,
}

impl JobQueue {
    pub fn new(max_backoff: Duration) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                partitions: HashMap::new(),
                order: Vec::new(),
                cursor: 0,
                live: HashSet::new(),
                leased: HashMap::new(),
                closed: false,
            }),
            notify: Notify::new(),
            max_backoff,
        }
    }

    /// Create the tenant's partition, or update its in-flight cap
    pub fn provision(&self, tenant_id: &TenantId, in_flight_cap: u32) {
        let mut inner = self.inner.lock();
        match inner.partitions.get_mut(tenant_id) {
            Some(partition) => partition.cap = in_flight_cap.max(1),
            None => {
                inner
                    .partitions
                    .insert(tenant_id.clone(), Partition::new(in_flight_cap));
                inner.order.push(tenant_id.clone());
            }
        }
        drop(inner);

        tracing::debug!(tenant = %tenant_id, cap = in_flight_cap, "Provisioned queue partition");
        self.notify.notify_waiters();
    }

    /// Append a job to the tenant's partition
    pub fn enqueue(&self, tenant_id: &TenantId, job: Job) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.partitions.contains_key(tenant_id) {
            return Err(EngineError::UnknownTenant(tenant_id.clone()));
        }

        let key = (job.run_id, job.node_id.clone());
        if inner.live.contains(&key) {
            return Err(EngineError::DuplicateJob {
                run_id: job.run_id,
                node_id: job.node_id,
            });
        }
        inner.live.insert(key);

        tracing::debug!(
            tenant = %tenant_id,
            run_id = %job.run_id,
            node_id = %job.node_id,
            "Enqueued job"
        );

        if let Some(partition) = inner.partitions.get_mut(tenant_id) {
            partition.jobs.push_back(QueuedJob {
                job,
                not_before: None,
            });
        }
        drop(inner);

        self.notify.notify_waiters();
        Ok(())
    }

    /// Wait for the next eligible job. Returns `None` once the queue is closed.
    pub async fn dequeue(&self) -> Option<Job> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return None;
                }
                inner.take_next(Instant::now())
            };

            match next {
                Next::Job(job) => return Some(job),
                Next::Wait(Some(deadline)) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                Next::Wait(None) => notified.await,
            }
        }
    }

    /// Record the outcome of a dispatched job. Retryable failures with
    /// attempts left go back to the end of the partition with backoff.
    pub fn acknowledge(&self, job: &Job, outcome: &Outcome) -> Ack {
        let mut inner = self.inner.lock();
        inner.unlease(&job.id);

        let ack = match outcome {
            Outcome::RetryableFailure { reason } if job.attempt < job.retry.max_attempts => {
                let delay = self.backoff(job.retry.backoff_ms, job.attempt);
                let mut retry = job.clone();
                retry.attempt += 1;

                let attempt = retry.attempt;
                match inner.partitions.get_mut(&job.tenant_id) {
                    Some(partition) => {
                        partition.jobs.push_back(QueuedJob {
                            job: retry,
                            not_before: Some(Instant::now() + delay),
                        });
                        Ack::Retry { attempt, delay }
                    }
                    None => {
                        inner.live.remove(&(job.run_id, job.node_id.clone()));
                        Ack::Done(Outcome::permanent(reason.clone()))
                    }
                }
            }
            Outcome::RetryableFailure { reason } => {
                inner.live.remove(&(job.run_id, job.node_id.clone()));
                Ack::Done(Outcome::permanent(format!(
                    "retries exhausted after {} attempts: {}",
                    job.attempt, reason
                )))
            }
            other => {
                inner.live.remove(&(job.run_id, job.node_id.clone()));
                Ack::Done(other.clone())
            }
        };
        drop(inner);

        self.notify.notify_waiters();
        ack
    }

    /// Return a dequeued job that was never dispatched
    pub fn release(&self, job: &Job) {
        let mut inner = self.inner.lock();
        inner.unlease(&job.id);
        inner.live.remove(&(job.run_id, job.node_id.clone()));
        drop(inner);

        self.notify.notify_waiters();
    }

    /// Remove every queued (not dispatched) job of a run
    pub fn purge_run(&self, run_id: RunId) -> Vec<Job> {
        let mut inner = self.inner.lock();
        let mut purged = Vec::new();

        for partition in inner.partitions.values_mut() {
            let (matching, kept): (VecDeque<QueuedJob>, VecDeque<QueuedJob>) = partition
                .jobs
                .drain(..)
                .partition(|queued| queued.job.run_id == run_id);
            partition.jobs = kept;
            purged.extend(matching.into_iter().map(|queued| queued.job));
        }

        for job in &purged {
            inner.live.remove(&(job.run_id, job.node_id.clone()));
        }

        if !purged.is_empty() {
            tracing::debug!(run_id = %run_id, purged = purged.len(), "Purged queued jobs");
        }
        purged
    }

    /// Stop handing out jobs; every waiting worker gets `None`
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Queued jobs across all tenants
    pub fn depth(&self) -> usize {
        self.inner
            .lock()
            .partitions
            .values()
            .map(|p| p.jobs.len())
            .sum()
    }

    pub fn tenant_depth(&self, tenant_id: &TenantId) -> usize {
        self.inner
            .lock()
            .partitions
            .get(tenant_id)
            .map(|p| p.jobs.len())
            .unwrap_or(0)
    }

    pub fn in_flight(&self, tenant_id: &TenantId) -> u32 {
        self.inner
            .lock()
            .partitions
            .get(tenant_id)
            .map(|p| p.in_flight)
            .unwrap_or(0)
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        let tenants: Vec<TenantQueueStats> = inner
            .order
            .iter()
            .filter_map(|tenant_id| {
                inner.partitions.get(tenant_id).map(|p| TenantQueueStats {
                    tenant_id: tenant_id.clone(),
                    depth: p.jobs.len(),
                    in_flight: p.in_flight,
                    in_flight_cap: p.cap,
                })
            })
            .collect();

        QueueStats {
            total_depth: tenants.iter().map(|t| t.depth).sum(),
            total_in_flight: tenants.iter().map(|t| t.in_flight).sum(),
            tenants,
        }
    }

    fn backoff(&self, backoff_ms: u64, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let millis = backoff_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(millis).min(self.max_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActionRef, RetryPolicy};

    fn job(tenant: &str, run_id: RunId, node: &str) -> Job {
        Job::new(
            TenantId::new(tenant),
            run_id,
            NodeId::new(node),
            ActionRef::new("core.echo"),
            serde_json::json!({}),
            RetryPolicy {
                max_attempts: 3,
                backoff_ms: 100,
            },
        )
    }

    async fn try_dequeue(queue: &JobQueue) -> Option<Job> {
        tokio::time::timeout(Duration::from_millis(50), queue.dequeue())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_unknown_tenant_rejected() {
        let queue = JobQueue::new(Duration::from_secs(30));
        let result = queue.enqueue(&TenantId::new("ghost"), job("ghost", RunId::new(), "a"));
        assert!(matches!(result, Err(EngineError::UnknownTenant(_))));
    }

    #[tokio::test]
    async fn test_duplicate_job_rejected() {
        let queue = JobQueue::new(Duration::from_secs(30));
        let tenant = TenantId::new("acme");
        queue.provision(&tenant, 2);

        let run_id = RunId::new();
        queue.enqueue(&tenant, job("acme", run_id, "a")).unwrap();
        let result = queue.enqueue(&tenant, job("acme", run_id, "a"));
        assert!(matches!(result, Err(EngineError::DuplicateJob { .. })));

        // Still live while dispatched
        let leased = queue.dequeue().await.unwrap();
        assert!(queue.enqueue(&tenant, job("acme", run_id, "a")).is_err());

        queue.acknowledge(&leased, &Outcome::success(serde_json::json!(1)));
        assert!(queue.enqueue(&tenant, job("acme", run_id, "a")).is_ok());
    }

    #[tokio::test]
    async fn test_round_robin_across_tenants() {
        let queue = JobQueue::new(Duration::from_secs(30));
        let a = TenantId::new("a");
        let b = TenantId::new("b");
        queue.provision(&a, 10);
        queue.provision(&b, 10);

        let run_a = RunId::new();
        let run_b = RunId::new();
        for i in 0..4 {
            queue.enqueue(&a, job("a", run_a, &format!("n{}", i))).unwrap();
        }
        for i in 0..2 {
            queue.enqueue(&b, job("b", run_b, &format!("n{}", i))).unwrap();
        }

        let mut order = Vec::new();
        for _ in 0..6 {
            order.push(queue.dequeue().await.unwrap().tenant_id.0);
        }
        assert_eq!(order, vec!["a", "b", "a", "b", "a", "a"]);
    }

    #[tokio::test]
    async fn test_in_flight_cap_skips_saturated_tenant() {
        let queue = JobQueue::new(Duration::from_secs(30));
        let a = TenantId::new("a");
        let b = TenantId::new("b");
        queue.provision(&a, 1);
        queue.provision(&b, 1);

        let run_a = RunId::new();
        queue.enqueue(&a, job("a", run_a, "x")).unwrap();
        queue.enqueue(&a, job("a", run_a, "y")).unwrap();
        queue.enqueue(&b, job("b", RunId::new(), "z")).unwrap();

        let first = queue.dequeue().await.unwrap();
        let second = queue.dequeue().await.unwrap();
        assert_eq!(first.tenant_id, a);
        assert_eq!(second.tenant_id, b);
        assert_eq!(queue.in_flight(&a), 1);

        // Tenant a is at its cap, b is empty
        assert!(try_dequeue(&queue).await.is_none());

        queue.acknowledge(&first, &Outcome::success(serde_json::Value::Null));
        let third = queue.dequeue().await.unwrap();
        assert_eq!(third.node_id, NodeId::new("y"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_waits_for_backoff() {
        let queue = JobQueue::new(Duration::from_secs(30));
        let tenant = TenantId::new("acme");
        queue.provision(&tenant, 1);
        queue.enqueue(&tenant, job("acme", RunId::new(), "a")).unwrap();

        let first = queue.dequeue().await.unwrap();
        let ack = queue.acknowledge(&first, &Outcome::retryable("connection reset"));
        assert_eq!(
            ack,
            Ack::Retry {
                attempt: 2,
                delay: Duration::from_millis(100)
            }
        );

        let before = Instant::now();
        let second = queue.dequeue().await.unwrap();
        assert_eq!(second.attempt, 2);
        assert_eq!(second.id, first.id);
        assert!(before.elapsed() >= Duration::from_millis(100));

        let ack = queue.acknowledge(&second, &Outcome::retryable("connection reset"));
        assert_eq!(
            ack,
            Ack::Retry {
                attempt: 3,
                delay: Duration::from_millis(200)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_becomes_permanent() {
        let queue = JobQueue::new(Duration::from_secs(30));
        let tenant = TenantId::new("acme");
        queue.provision(&tenant, 1);
        queue.enqueue(&tenant, job("acme", RunId::new(), "a")).unwrap();

        let mut last = None;
        for _ in 0..3 {
            let leased = queue.dequeue().await.unwrap();
            last = Some(queue.acknowledge(&leased, &Outcome::retryable("503")));
        }

        assert_eq!(
            last,
            Some(Ack::Done(Outcome::permanent(
                "retries exhausted after 3 attempts: 503"
            )))
        );
        assert_eq!(queue.depth(), 0);
        assert_eq!(queue.in_flight(&tenant), 0);
    }

    #[test]
    fn test_backoff_is_capped() {
        let queue = JobQueue::new(Duration::from_millis(1000));
        assert_eq!(queue.backoff(100, 1), Duration::from_millis(100));
        assert_eq!(queue.backoff(100, 3), Duration::from_millis(400));
        assert_eq!(queue.backoff(100, 10), Duration::from_millis(1000));
        assert_eq!(queue.backoff(u64::MAX, 40), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_purge_run_and_release() {
        let queue = JobQueue::new(Duration::from_secs(30));
        let tenant = TenantId::new("acme");
        queue.provision(&tenant, 4);

        let stopped = RunId::new();
        let other = RunId::new();
        queue.enqueue(&tenant, job("acme", stopped, "a")).unwrap();
        queue.enqueue(&tenant, job("acme", stopped, "b")).unwrap();
        queue.enqueue(&tenant, job("acme", other, "a")).unwrap();

        let purged = queue.purge_run(stopped);
        assert_eq!(purged.len(), 2);
        assert_eq!(queue.tenant_depth(&tenant), 1);

        let leased = queue.dequeue().await.unwrap();
        assert_eq!(leased.run_id, other);
        assert_eq!(queue.in_flight(&tenant), 1);

        queue.release(&leased);
        queue.release(&leased);
        assert_eq!(queue.in_flight(&tenant), 0);
        assert!(queue.enqueue(&tenant, job("acme", other, "a")).is_ok());
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_workers() {
        let queue = std::sync::Arc::new(JobQueue::new(Duration::from_secs(30)));
        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };

        tokio::task::yield_now().await;
        queue.close();

        let result = tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_none());
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn test_stats() {
        let queue = JobQueue::new(Duration::from_secs(30));
        let tenant = TenantId::new("acme");
        queue.provision(&tenant, 3);
        queue.enqueue(&tenant, job("acme", RunId::new(), "a")).unwrap();
        queue.enqueue(&tenant, job("acme", RunId::new(), "a")).unwrap();
        let _leased = queue.dequeue().await.unwrap();

        let stats = queue.stats();
        assert_eq!(stats.total_depth, 1);
        assert_eq!(stats.total_in_flight, 1);
        assert_eq!(stats.tenants[0].in_flight_cap, 3);
    }
}
