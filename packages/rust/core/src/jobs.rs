//! Job tracker: runs pipeline requests in the background and keeps their
//! records.
//!
//! Each job's live record sits in a `watch` channel so callers can poll
//! ([`JobTracker::get_status`]), subscribe ([`JobTracker::subscribe`]) or
//! block until it finishes ([`JobTracker::wait`]). Every transition is
//! written through to the [`JobStore`] before watchers see it.
//!
//! Several processes may track jobs in one database. A tracker holding a
//! [`TrackerLease`] only recovers abandoned jobs when the lease says no other
//! tracker is alive.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};
use varnika_shared::{
    ErrorKind, Job, JobError, JobId, JobsConfig, Result, Stage, Transition, VarnikaError,
};
use varnika_storage::{JobPage, JobStore, TrackerLease};

use crate::pipeline::{Pipeline, PipelineOutput, PipelineRequest, ProgressReporter};

/// Attempts per job save before a transition gives up on persisting.
const SAVE_ATTEMPTS: u32 = 3;
const SAVE_RETRY_DELAY: Duration = Duration::from_millis(100);

struct Tracked {
    tx: Arc<watch::Sender<Job>>,
    cancel: CancellationToken,
}

struct Inner {
    pipeline: Arc<Pipeline>,
    store: Arc<dyn JobStore>,
    jobs: Mutex<HashMap<JobId, Tracked>>,
    lease: Mutex<Option<TrackerLease>>,
    job_timeout: Duration,
    max_retained: usize,
}

#[derive(Clone)]
pub struct JobTracker {
    inner: Arc<Inner>,
}

impl JobTracker {
    pub fn new(
        pipeline: Arc<Pipeline>,
        store: Arc<dyn JobStore>,
        job_timeout: Duration,
        max_retained: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                pipeline,
                store,
                jobs: Mutex::new(HashMap::new()),
                lease: Mutex::new(None),
                job_timeout,
                max_retained: max_retained.max(1),
            }),
        }
    }

    pub fn from_config(pipeline: Arc<Pipeline>, store: Arc<dyn JobStore>, config: &JobsConfig) -> Self {
        Self::new(
            pipeline,
            store,
            Duration::from_secs(config.job_timeout_secs),
            config.max_retained,
        )
    }

    /// Hold `lease` for as long as this tracker lives.
    pub fn with_lease(self, lease: TrackerLease) -> Self {
        *self.inner.lease.lock().unwrap_or_else(PoisonError::into_inner) = Some(lease);
        self
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.inner.pipeline
    }

    /// Validate `req`, record a pending job and start it in the background.
    #[instrument(skip_all, fields(stages = %req.stages))]
    pub async fn submit(&self, req: PipelineRequest) -> Result<JobId> {
        let req = req.validate()?;
        let job = Job::new(req.stages.clone(), req.query.clone());
        let id = job.id();
        self.inner.store.save(&job).await?;

        let (tx, _) = watch::channel(job);
        let tx = Arc::new(tx);
        let cancel = CancellationToken::new();
        self.inner.lock_jobs().insert(
            id,
            Tracked {
                tx: Arc::clone(&tx),
                cancel: cancel.clone(),
            },
        );

        let span = info_span!("job", job_id = %id);
        tokio::spawn(run_job(Arc::clone(&self.inner), tx, cancel, req).instrument(span));
        info!(job_id = %id, "job submitted");
        Ok(id)
    }

    /// Current record for `id`.
    pub async fn get_status(&self, id: JobId) -> Result<Job> {
        if let Some(job) = self.inner.snapshot(id) {
            return Ok(job);
        }
        self.inner
            .store
            .load(id)
            .await?
            .ok_or_else(|| unknown_job(id))
    }

    /// Jobs newest first.
    pub async fn list(&self, limit: usize, offset: usize) -> Result<JobPage> {
        self.inner.store.list(limit, offset).await
    }

    /// Ask a running job to stop. It ends `failed` with kind `cancelled`.
    pub async fn cancel(&self, id: JobId) -> Result<()> {
        let tracked = {
            let jobs = self.inner.lock_jobs();
            jobs.get(&id)
                .map(|t| (t.cancel.clone(), t.tx.borrow().status()))
        };

        match tracked {
            Some((_, status)) if status.is_terminal() => Err(VarnikaError::validation(format!(
                "job {id} already {status}"
            ))),
            Some((cancel, _)) => {
                cancel.cancel();
                info!(job_id = %id, "cancellation requested");
                Ok(())
            }
            None => match self.inner.store.load(id).await? {
                Some(job) => Err(VarnikaError::validation(format!(
                    "job {id} is {} and not running in this process",
                    job.status()
                ))),
                None => Err(unknown_job(id)),
            },
        }
    }

    /// Receive every published snapshot of a job tracked by this process.
    pub fn subscribe(&self, id: JobId) -> Result<watch::Receiver<Job>> {
        self.inner
            .lock_jobs()
            .get(&id)
            .map(|t| t.tx.subscribe())
            .ok_or_else(|| unknown_job(id))
    }

    /// Resolve once the job reaches `completed` or `failed`.
    pub async fn wait(&self, id: JobId) -> Result<Job> {
        let Ok(mut rx) = self.subscribe(id) else {
            return self.get_status(id).await;
        };
        let job = rx
            .wait_for(Job::is_terminal)
            .await
            .map(|job| job.clone())
            .map_err(|_| VarnikaError::Storage(format!("job {id} was dropped while running")))?;
        Ok(job)
    }

    /// Mark jobs a previous process left pending or processing as failed.
    /// Returns how many were marked.
    ///
    /// With a lease, nothing is touched unless this tracker held it alone; the
    /// lease is shared afterwards so other trackers can start.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let sole = self
            .inner
            .lock_lease()
            .as_ref()
            .is_none_or(TrackerLease::is_sole);
        if !sole {
            info!("other trackers share the job database, leaving unfinished jobs alone");
            return Ok(0);
        }

        let recovered = self.fail_abandoned().await;
        if let Some(lease) = self.inner.lock_lease().as_mut() {
            lease.share();
        }
        let recovered = recovered?;
        if recovered > 0 {
            warn!(recovered, "marked interrupted jobs as failed");
        }
        Ok(recovered)
    }

    async fn fail_abandoned(&self) -> Result<usize> {
        let page = self.inner.store.list(u32::MAX as usize, 0).await?;
        let mut recovered = 0;
        for mut job in page.jobs.into_iter().filter(|j| !j.is_terminal()) {
            if self.inner.snapshot(job.id()).is_some() {
                continue;
            }
            job.apply(Transition::Fail {
                error: JobError {
                    kind: ErrorKind::Cancelled,
                    message: "interrupted before completion".into(),
                },
                partial: None,
            })?;
            match self.inner.store.save(&job).await {
                Ok(()) => recovered += 1,
                Err(e) if e.kind() == ErrorKind::ValidationError => {
                    debug!(job_id = %job.id(), "job finished while recovering");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(recovered)
    }
}

fn unknown_job(id: JobId) -> VarnikaError {
    VarnikaError::not_found(format!("job {id}"))
}

impl Inner {
    fn lock_jobs(&self) -> MutexGuard<'_, HashMap<JobId, Tracked>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_lease(&self) -> MutexGuard<'_, Option<TrackerLease>> {
        self.lease.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self, id: JobId) -> Option<Job> {
        self.lock_jobs().get(&id).map(|t| t.tx.borrow().clone())
    }

    /// Apply `transition`, persist the result, then publish it.
    ///
    /// Only the job's own task calls this, so read-modify-publish does not race.
    async fn transition(&self, tx: &watch::Sender<Job>, transition: Transition) {
        let mut next = tx.borrow().clone();
        if let Err(e) = next.apply(transition) {
            warn!(error = %e, "rejected job transition");
            return;
        }
        if let Err(e) = self.persist(&next).await {
            if next.is_terminal() {
                error!(
                    job_id = %next.id(),
                    status = %next.status(),
                    error = %e,
                    "final job state was not persisted"
                );
            } else {
                warn!(job_id = %next.id(), error = %e, "failed to persist job");
            }
        }
        tx.send_replace(next);
    }

    /// Save `job`, retrying storage failures such as a busy database.
    async fn persist(&self, job: &Job) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.store.save(job).await {
                Err(e) if e.kind() == ErrorKind::Storage && attempt < SAVE_ATTEMPTS => {
                    debug!(job_id = %job.id(), attempt, error = %e, "retrying job save");
                    tokio::time::sleep(SAVE_RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Drop the oldest terminal jobs beyond `max_retained`.
    async fn evict(&self) {
        let doomed: Vec<JobId> = {
            let mut jobs = self.lock_jobs();
            let mut terminal: Vec<_> = jobs
                .iter()
                .filter_map(|(id, t)| {
                    let job = t.tx.borrow();
                    job.is_terminal().then(|| (job.created_at(), *id))
                })
                .collect();
            if terminal.len() <= self.max_retained {
                return;
            }
            terminal.sort();
            let excess = terminal.len() - self.max_retained;
            let ids: Vec<JobId> = terminal.into_iter().take(excess).map(|(_, id)| id).collect();
            for id in &ids {
                jobs.remove(id);
            }
            ids
        };

        for id in doomed {
            match self.store.remove(id).await {
                Ok(_) => debug!(job_id = %id, "evicted job"),
                Err(e) => warn!(job_id = %id, error = %e, "failed to evict job"),
            }
        }
    }
}

/// Forwards stage boundaries into the job record.
struct JobProgress<'a> {
    inner: &'a Inner,
    tx: &'a watch::Sender<Job>,
}

#[async_trait]
impl ProgressReporter for JobProgress<'_> {
    async fn stage(&self, stage: Stage, progress: u8, message: String) {
        self.inner
            .transition(
                self.tx,
                Transition::Advance {
                    stage,
                    progress,
                    message,
                },
            )
            .await;
    }
}

async fn run_job(
    inner: Arc<Inner>,
    tx: Arc<watch::Sender<Job>>,
    cancel: CancellationToken,
    req: PipelineRequest,
) {
    if cancel.is_cancelled() {
        let error = JobError::from(&VarnikaError::Cancelled);
        inner
            .transition(&tx, Transition::Fail { error, partial: None })
            .await;
        inner.evict().await;
        return;
    }

    inner
        .transition(
            &tx,
            Transition::Start {
                message: "Starting".into(),
            },
        )
        .await;

    let reporter = JobProgress {
        inner: &inner,
        tx: &tx,
    };
    let mut out = PipelineOutput::default();
    let outcome = {
        let run = inner.pipeline.run(&req, &reporter, &cancel, &mut out);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(VarnikaError::Cancelled),
            result = tokio::time::timeout(inner.job_timeout, run) => {
                result.unwrap_or_else(|_| Err(VarnikaError::Timeout(format!(
                    "job exceeded {}s",
                    inner.job_timeout.as_secs()
                ))))
            }
        }
    };

    match outcome {
        Ok(()) => {
            info!("job completed");
            inner
                .transition(
                    &tx,
                    Transition::Complete {
                        result: out.to_value(),
                    },
                )
                .await;
        }
        Err(e) => {
            warn!(error = %e, "job failed");
            let partial = (!out.is_empty()).then(|| out.to_value());
            inner
                .transition(
                    &tx,
                    Transition::Fail {
                        error: JobError::from(&e),
                        partial,
                    },
                )
                .await;
        }
    }
    inner.evict().await;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use varnika_shared::{JobStatus, SourceEntry, StageSet};
    use varnika_storage::{MemoryJobStore, SqlJobStore};

    use super::*;
    use crate::testing::{self, URL_A_FAILS, URL_B_OK};

    const LEASE_WAIT: Duration = Duration::from_secs(1);

    fn tracker(pipeline: Pipeline, timeout: Duration, max_retained: usize) -> JobTracker {
        JobTracker::new(
            Arc::new(pipeline),
            Arc::new(MemoryJobStore::new()),
            timeout,
            max_retained,
        )
    }

    fn discover_fetch(query: &str) -> PipelineRequest {
        PipelineRequest::new(StageSet::new([Stage::Discover, Stage::Fetch]).expect("stages"))
            .with_query(query)
    }

    fn slow_request() -> PipelineRequest {
        PipelineRequest::new(StageSet::new([Stage::Fetch, Stage::Summarize]).expect("stages"))
            .with_urls([URL_B_OK])
    }

    #[tokio::test]
    async fn discover_and_fetch_completes_with_partial_failures() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tracker = tracker(
            testing::pipeline(dir.path(), &[URL_A_FAILS, URL_B_OK]),
            Duration::from_secs(60),
            10,
        );

        let id = tracker
            .submit(discover_fetch("quantum computing"))
            .await
            .expect("submit");
        let job = tracker.wait(id).await.expect("wait");

        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(job.progress(), 100);
        let fetched = job.result().expect("result")["fetched"]
            .as_array()
            .expect("fetched array")
            .clone();
        assert_eq!(fetched.len(), 2);
        let successes = fetched.iter().filter(|r| r["success"] == true).count();
        assert_eq!(successes, 1);
        let failed = fetched
            .iter()
            .find(|r| r["success"] == false)
            .expect("failure entry");
        assert_eq!(failed["url"], URL_A_FAILS);
        assert!(failed["error"].as_str().unwrap_or_default().contains("connection refused"));

        let listed = tracker.list(10, 0).await.expect("list");
        assert_eq!(listed.total, 1);
        assert_eq!(listed.jobs[0].status(), JobStatus::Completed);
    }

    #[tokio::test]
    async fn subscribers_see_monotonic_progress() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tracker = tracker(
            testing::pipeline(dir.path(), &[URL_B_OK]),
            Duration::from_secs(60),
            10,
        );
        let req = PipelineRequest::new(StageSet::all()).with_query("qubits");
        let id = tracker.submit(req).await.expect("submit");
        let mut rx = tracker.subscribe(id).expect("subscribe");

        let mut seen = vec![rx.borrow_and_update().progress()];
        while !rx.borrow().is_terminal() {
            if rx.changed().await.is_err() {
                break;
            }
            seen.push(rx.borrow_and_update().progress());
        }

        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {seen:?}");
        assert_eq!(seen.last(), Some(&100));
        assert_eq!(tracker.get_status(id).await.expect("status").status(), JobStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_keeps_partial_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tracker = tracker(
            testing::pipeline_with_delay(dir.path(), &[], Duration::from_secs(600)),
            Duration::from_secs(3600),
            10,
        );
        let id = tracker.submit(slow_request()).await.expect("submit");

        let mut rx = tracker.subscribe(id).expect("subscribe");
        rx.wait_for(|j| j.stage() == Some(Stage::Summarize))
            .await
            .expect("reaches summarize");
        tracker.cancel(id).await.expect("cancel");

        let job = tracker.wait(id).await.expect("wait");
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.error().expect("error").kind, ErrorKind::Cancelled);
        let fetched = &job.result().expect("partial output")["fetched"];
        assert_eq!(fetched.as_array().map(Vec::len), Some(1));

        let err = tracker.cancel(id).await.unwrap_err();
        assert!(matches!(err, VarnikaError::Validation { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_job_times_out() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tracker = tracker(
            testing::pipeline_with_delay(dir.path(), &[], Duration::from_secs(600)),
            Duration::from_secs(30),
            10,
        );
        let id = tracker.submit(slow_request()).await.expect("submit");

        let job = tracker.wait(id).await.expect("wait");
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.error().expect("error").kind, ErrorKind::Timeout);
        assert!(job.result().is_some(), "fetch output survives the timeout");
    }

    #[tokio::test]
    async fn unknown_jobs_are_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tracker = tracker(testing::pipeline(dir.path(), &[]), Duration::from_secs(5), 10);
        let id = JobId::new();

        assert!(matches!(
            tracker.get_status(id).await.unwrap_err(),
            VarnikaError::NotFound { .. }
        ));
        assert!(matches!(
            tracker.cancel(id).await.unwrap_err(),
            VarnikaError::NotFound { .. }
        ));
        assert!(tracker.subscribe(id).is_err());
    }

    #[tokio::test]
    async fn invalid_requests_never_create_jobs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tracker = tracker(testing::pipeline(dir.path(), &[]), Duration::from_secs(5), 10);

        let err = tracker
            .submit(PipelineRequest::new(StageSet::all()))
            .await
            .unwrap_err();
        assert!(matches!(err, VarnikaError::Validation { .. }));
        assert_eq!(tracker.list(10, 0).await.expect("list").total, 0);
    }

    #[tokio::test]
    async fn oldest_terminal_jobs_are_evicted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tracker = tracker(
            testing::pipeline(dir.path(), &[]),
            Duration::from_secs(60),
            2,
        );

        let mut ids = Vec::new();
        for _ in 0..4 {
            let req = PipelineRequest::new(StageSet::single(Stage::Fetch)).with_urls([URL_B_OK]);
            let id = tracker.submit(req).await.expect("submit");
            tracker.wait(id).await.expect("wait");
            ids.push(id);
        }

        // Eviction runs just after the final state is published.
        for _ in 0..100 {
            if tracker.list(10, 0).await.expect("list").total == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(tracker.list(10, 0).await.expect("list").total, 2);
        assert!(tracker.get_status(ids[0]).await.is_err());
        assert!(tracker.get_status(ids[1]).await.is_err());
        assert!(tracker.get_status(ids[3]).await.is_ok());
    }

    #[tokio::test]
    async fn concurrent_jobs_share_the_ledger_safely() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tracker = tracker(
            testing::pipeline(dir.path(), &[]),
            Duration::from_secs(60),
            10,
        );

        let mut ids = Vec::new();
        for i in 0..4 {
            let req = PipelineRequest::new(StageSet::single(Stage::Fetch))
                .with_query("shared topic")
                .with_urls([format!("https://site{i}.example/ok")]);
            ids.push(tracker.submit(req).await.expect("submit"));
        }
        for id in ids {
            assert_eq!(
                tracker.wait(id).await.expect("wait").status(),
                JobStatus::Completed
            );
        }

        let records = tracker.pipeline().ledger().records().await.expect("records");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].entries.len(), 4);
    }

    #[tokio::test]
    async fn sql_store_sees_final_state_and_recovers_stale_jobs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = dir.path().join("jobs.db");
        let store = Arc::new(SqlJobStore::open(&db).await.expect("open"));

        let stale = Job::new(StageSet::single(Stage::Write), None);
        store.save(&stale).await.expect("seed stale job");

        // Another tracker is still alive, so the job is not ours to fail.
        let mut other = TrackerLease::acquire(&db, LEASE_WAIT).await.expect("other lease");
        other.share();
        let lease = TrackerLease::acquire(&db, LEASE_WAIT).await.expect("lease");
        let bystander = JobTracker::new(
            Arc::new(testing::pipeline(dir.path(), &[])),
            store.clone(),
            Duration::from_secs(60),
            10,
        )
        .with_lease(lease);
        assert_eq!(bystander.recover_interrupted().await.expect("recover"), 0);
        drop(bystander);
        drop(other);

        let lease = TrackerLease::acquire(&db, LEASE_WAIT).await.expect("sole lease");
        let tracker = JobTracker::new(
            Arc::new(testing::pipeline(dir.path(), &[])),
            store.clone(),
            Duration::from_secs(60),
            10,
        )
        .with_lease(lease);
        assert_eq!(tracker.recover_interrupted().await.expect("recover"), 1);
        let recovered = tracker.get_status(stale.id()).await.expect("status");
        assert_eq!(recovered.status(), JobStatus::Failed);

        tracker
            .pipeline()
            .ledger()
            .append("Saved", &[SourceEntry::new(URL_B_OK)])
            .await
            .expect("seed ledger");
        let req = PipelineRequest::new(StageSet::single(Stage::Fetch)).with_query("saved");
        let id = tracker.submit(req).await.expect("submit");
        tracker.wait(id).await.expect("wait");

        let stored = store.load(id).await.expect("load").expect("present");
        assert_eq!(stored.status(), JobStatus::Completed);
    }

    #[tokio::test]
    async fn second_tracker_leaves_running_jobs_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = dir.path().join("jobs.db");

        let owner_lease = TrackerLease::acquire(&db, LEASE_WAIT).await.expect("owner lease");
        let owner = JobTracker::new(
            Arc::new(testing::pipeline_with_delay(
                dir.path(),
                &[],
                Duration::from_millis(500),
            )),
            Arc::new(SqlJobStore::open(&db).await.expect("open")),
            Duration::from_secs(60),
            10,
        )
        .with_lease(owner_lease);
        assert_eq!(owner.recover_interrupted().await.expect("recover"), 0);

        let id = owner.submit(slow_request()).await.expect("submit");
        let mut rx = owner.subscribe(id).expect("subscribe");
        rx.wait_for(|j| j.stage() == Some(Stage::Summarize))
            .await
            .expect("reaches summarize");

        let other_store = Arc::new(SqlJobStore::open(&db).await.expect("open again"));
        let other_lease = TrackerLease::acquire(&db, LEASE_WAIT).await.expect("other lease");
        assert!(!other_lease.is_sole());
        let other = JobTracker::new(
            Arc::new(testing::pipeline(dir.path(), &[])),
            other_store.clone(),
            Duration::from_secs(60),
            10,
        )
        .with_lease(other_lease);
        assert_eq!(other.recover_interrupted().await.expect("recover"), 0);
        let seen = other_store.load(id).await.expect("load").expect("present");
        assert_eq!(seen.status(), JobStatus::Processing);

        let finished = owner.wait(id).await.expect("wait");
        assert_eq!(finished.status(), JobStatus::Completed);
        let stored = other_store.load(id).await.expect("load").expect("present");
        assert_eq!(stored.status(), JobStatus::Completed);
    }

    /// Rejects the first `failures` saves of a final job state as busy.
    struct BusyStore {
        inner: MemoryJobStore,
        failures: AtomicU32,
    }

    #[async_trait]
    impl JobStore for BusyStore {
        async fn save(&self, job: &Job) -> Result<()> {
            let busy = job.is_terminal()
                && self
                    .failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
            if busy {
                return Err(VarnikaError::Storage("database is locked".into()));
            }
            self.inner.save(job).await
        }

        async fn load(&self, id: JobId) -> Result<Option<Job>> {
            self.inner.load(id).await
        }

        async fn list(&self, limit: usize, offset: usize) -> Result<JobPage> {
            self.inner.list(limit, offset).await
        }

        async fn remove(&self, id: JobId) -> Result<bool> {
            self.inner.remove(id).await
        }
    }

    #[tokio::test]
    async fn busy_store_still_records_the_final_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(BusyStore {
            inner: MemoryJobStore::new(),
            failures: AtomicU32::new(SAVE_ATTEMPTS - 1),
        });
        let tracker = JobTracker::new(
            Arc::new(testing::pipeline(dir.path(), &[])),
            store.clone(),
            Duration::from_secs(60),
            10,
        );

        let req = PipelineRequest::new(StageSet::single(Stage::Fetch)).with_urls([URL_B_OK]);
        let id = tracker.submit(req).await.expect("submit");
        assert_eq!(tracker.wait(id).await.expect("wait").status(), JobStatus::Completed);

        assert_eq!(store.failures.load(Ordering::SeqCst), 0);
        let stored = store.inner.load(id).await.expect("load").expect("present");
        assert_eq!(stored.status(), JobStatus::Completed);
    }
}
