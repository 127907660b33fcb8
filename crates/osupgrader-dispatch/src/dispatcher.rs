//! Bounded worker pool over upgrade jobs
//!
//! Jobs go onto a queue sized to the job count. `workers` tasks pull from
//! it until it is drained, each running one workflow at a time, and send
//! exactly one outcome per job. A supervisor task joins the workers and
//! then closes the outcome stream.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use osupgrader_workflow::{UpgradeExecutor, UpgradeJob, WorkflowOutcome};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Workers used when the configured parallelism is zero or negative
pub const DEFAULT_PARALLELISM: usize = 10;

/// Worker count for `jobs` jobs: `max(1, min(configured, jobs))`
///
/// A configured value of zero or less falls back to
/// [`DEFAULT_PARALLELISM`] first.
pub fn effective_workers(configured: i64, jobs: usize) -> usize {
    let configured = if configured <= 0 {
        DEFAULT_PARALLELISM
    } else {
        usize::try_from(configured).unwrap_or(usize::MAX)
    };
    configured.min(jobs).max(1)
}

/// Runs upgrade jobs on a bounded pool of workers
#[derive(Debug, Clone)]
pub struct Dispatcher {
    executor: Arc<UpgradeExecutor>,
    parallelism: i64,
    cancel: CancellationToken,
    /// Parent of the runs started since the last [`cancel`](Self::cancel)
    generation: Arc<std::sync::Mutex<CancellationToken>>,
}

impl Dispatcher {
    pub fn new(executor: Arc<UpgradeExecutor>) -> Self {
        let cancel = CancellationToken::new();
        Self {
            executor,
            parallelism: DEFAULT_PARALLELISM as i64,
            generation: Arc::new(std::sync::Mutex::new(cancel.child_token())),
            cancel,
        }
    }

    /// Configured parallelism; clamped per run by [`effective_workers`]
    pub fn with_workers(mut self, parallelism: i64) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Cancel every workflow of every run when `cancel` fires
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.generation = Arc::new(std::sync::Mutex::new(cancel.child_token()));
        self.cancel = cancel;
        self
    }

    /// The external token every run derives from
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel all in-flight workflows; each still yields an outcome
    ///
    /// Runs started afterwards are unaffected.
    pub fn cancel(&self) {
        let mut generation = self.generation.lock().unwrap_or_else(|p| p.into_inner());
        generation.cancel();
        *generation = self.cancel.child_token();
    }

    fn run_token(&self) -> CancellationToken {
        self.generation
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .child_token()
    }

    /// Start running `jobs` and return the stream of their outcomes
    ///
    /// Must be called from within a tokio runtime.
    pub fn run(&self, jobs: Vec<UpgradeJob>) -> OutcomeStream {
        let total = jobs.len();
        let workers = effective_workers(self.parallelism, total);
        info!(jobs = total, workers, "Dispatching upgrade jobs");

        let cancel = self.run_token();

        let (job_tx, job_rx) = mpsc::channel(total.max(1));
        let (outcome_tx, outcome_rx) = mpsc::channel(total.max(1));

        tokio::spawn(async move {
            for job in jobs {
                if job_tx.send(job).await.is_err() {
                    break;
                }
            }
            // job_tx drops here: no more jobs
        });

        let queue = Arc::new(Mutex::new(job_rx));
        let mut pool = JoinSet::new();
        for id in 0..workers {
            pool.spawn(worker(
                id,
                self.executor.clone(),
                queue.clone(),
                outcome_tx.clone(),
                cancel.clone(),
            ));
        }

        tokio::spawn(async move {
            while let Some(joined) = pool.join_next().await {
                if let Err(err) = joined {
                    error!(error = %err, "Worker task failed");
                }
            }
            drop(outcome_tx);
            debug!("All workers finished, outcome stream closed");
        });

        OutcomeStream {
            receiver: outcome_rx,
            total,
            workers,
            cancel,
        }
    }
}

async fn worker(
    id: usize,
    executor: Arc<UpgradeExecutor>,
    queue: Arc<Mutex<mpsc::Receiver<UpgradeJob>>>,
    outcomes: mpsc::Sender<WorkflowOutcome>,
    cancel: CancellationToken,
) {
    loop {
        let next = queue.lock().await.recv().await;
        let Some(job) = next else {
            break;
        };

        let machine = job.name().to_string();
        debug!(worker = id, machine = %machine, "Worker picked up job");

        let run = {
            let executor = executor.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { executor.run(job, &cancel).await })
        };
        let outcome = match run.await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(worker = id, machine = %machine, error = %err, "Workflow aborted");
                WorkflowOutcome::aborted(&machine, format!("workflow aborted: {}", err))
            }
        };

        if outcomes.send(outcome).await.is_err() {
            debug!(worker = id, "Outcome stream dropped, worker stopping");
            break;
        }
    }
}

/// Outcomes of one dispatch run, in completion order
///
/// Ends once every job has produced its outcome.
#[derive(Debug)]
pub struct OutcomeStream {
    receiver: mpsc::Receiver<WorkflowOutcome>,
    total: usize,
    workers: usize,
    cancel: CancellationToken,
}

impl OutcomeStream {
    pub async fn next(&mut self) -> Option<WorkflowOutcome> {
        self.receiver.recv().await
    }

    /// Number of jobs submitted
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Cancel only the workflows of this run
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for every outcome
    pub async fn collect_all(mut self) -> Vec<WorkflowOutcome> {
        let mut outcomes = Vec::with_capacity(self.total);
        while let Some(outcome) = self.next().await {
            outcomes.push(outcome);
        }
        outcomes
    }
}

impl Stream for OutcomeStream {
    type Item = WorkflowOutcome;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::StreamExt;
    use osupgrader_hypervisor::{DatastorePath, GuestCredentials, MachineRef};
    use osupgrader_workflow::{
        NoopPhase, OutcomeStatus, Phase, PhasePlan, PhaseReport, SimBehavior, SimulatedFleet,
        SleepPhase, UpgradeContext, UpgradePhase,
    };

    use super::*;

    fn job_for(machine: &MachineRef) -> UpgradeJob {
        UpgradeJob::new(
            machine.clone(),
            GuestCredentials::new("Administrator", "P@ssw0rd"),
            DatastorePath::parse("[datastore1] iso/windows-server-2022.iso").unwrap(),
        )
    }

    fn fleet_jobs(count: usize) -> (Arc<SimulatedFleet>, Vec<UpgradeJob>) {
        let fleet = Arc::new(SimulatedFleet::new());
        let jobs = (1..=count)
            .map(|i| job_for(&fleet.add_machine(&format!("srv{:03}", i), SimBehavior::default())))
            .collect();
        (fleet, jobs)
    }

    /// Tracks how many workflows are inside it at once
    struct GaugePhase {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl UpgradePhase for GaugePhase {
        fn phase(&self) -> Phase {
            Phase::Precondition
        }

        fn description(&self) -> &str {
            "Concurrency gauge"
        }

        async fn execute(
            &self,
            _ctx: &mut UpgradeContext,
        ) -> osupgrader_workflow::Result<PhaseReport> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(5)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(PhaseReport::new("measured"))
        }
    }

    struct PanicPhase;

    #[async_trait]
    impl UpgradePhase for PanicPhase {
        fn phase(&self) -> Phase {
            Phase::MountMedia
        }

        fn description(&self) -> &str {
            "Panics"
        }

        async fn execute(
            &self,
            ctx: &mut UpgradeContext,
        ) -> osupgrader_workflow::Result<PhaseReport> {
            if ctx.name() == "srv002" {
                panic!("simulated bug");
            }
            Ok(PhaseReport::new("fine"))
        }
    }

    #[test]
    fn test_effective_workers() {
        assert_eq!(effective_workers(3, 10), 3);
        assert_eq!(effective_workers(20, 4), 4);
        assert_eq!(effective_workers(0, 50), DEFAULT_PARALLELISM);
        assert_eq!(effective_workers(-2, 4), 4);
        assert_eq!(effective_workers(5, 0), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_outcome_per_job() {
        let (fleet, jobs) = fleet_jobs(7);
        let executor = Arc::new(UpgradeExecutor::new(fleet.session()));
        let dispatcher = Dispatcher::new(executor).with_workers(3);

        let stream = dispatcher.run(jobs);
        assert_eq!(stream.total(), 7);
        assert_eq!(stream.workers(), 3);

        let outcomes = stream.collect_all().await;
        assert_eq!(outcomes.len(), 7);
        let machines: HashSet<_> = outcomes.iter().map(|o| o.machine.clone()).collect();
        assert_eq!(machines.len(), 7);
        assert!(outcomes.iter().all(|o| o.success));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_concurrency() {
        let (fleet, jobs) = fleet_jobs(10);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let plan = PhasePlan::new().with(GaugePhase {
            active: active.clone(),
            peak: peak.clone(),
        });
        let executor = Arc::new(UpgradeExecutor::new(fleet.session()).with_plan(plan));

        let outcomes = Dispatcher::new(executor)
            .with_workers(3)
            .run(jobs)
            .collect_all()
            .await;

        assert_eq!(outcomes.len(), 10);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_becomes_failed_outcome() {
        let (fleet, jobs) = fleet_jobs(3);
        let plan = PhasePlan::new()
            .with(NoopPhase::new(Phase::Precondition))
            .with(PanicPhase);
        let executor = Arc::new(UpgradeExecutor::new(fleet.session()).with_plan(plan));

        let mut outcomes: Vec<_> = Dispatcher::new(executor)
            .with_workers(2)
            .run(jobs)
            .collect()
            .await;
        outcomes.sort_by(|a, b| a.machine.cmp(&b.machine));

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].success);
        assert!(!outcomes[1].success);
        assert_eq!(outcomes[1].machine, "srv002");
        assert!(outcomes[1].error.as_ref().unwrap().phase.is_none());
        assert!(outcomes[2].success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_yields_cancelled_outcomes() {
        let (fleet, jobs) = fleet_jobs(4);
        let plan = PhasePlan::new().with(SleepPhase::new(
            Phase::AwaitScriptExit,
            Duration::from_secs(3600),
        ));
        let executor = Arc::new(UpgradeExecutor::new(fleet.session()).with_plan(plan));
        let dispatcher = Dispatcher::new(executor).with_workers(2);

        let stream = dispatcher.run(jobs);
        tokio::time::sleep(Duration::from_secs(10)).await;
        dispatcher.cancel();

        let outcomes = stream.collect_all().await;
        assert_eq!(outcomes.len(), 4);
        assert!(outcomes
            .iter()
            .all(|o| o.status() == OutcomeStatus::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_after_cancel_start_fresh() {
        let (fleet, jobs) = fleet_jobs(2);
        let plan = PhasePlan::new().with(SleepPhase::new(
            Phase::AwaitScriptExit,
            Duration::from_secs(60),
        ));
        let executor = Arc::new(UpgradeExecutor::new(fleet.session()).with_plan(plan));
        let dispatcher = Dispatcher::new(executor).with_workers(2);

        let first = dispatcher.run(jobs.clone());
        tokio::time::sleep(Duration::from_secs(1)).await;
        dispatcher.cancel();
        assert!(first
            .collect_all()
            .await
            .iter()
            .all(|o| o.status() == OutcomeStatus::Cancelled));

        let second = dispatcher.run(jobs).collect_all().await;
        assert_eq!(second.len(), 2);
        assert!(second.iter().all(|o| o.status() == OutcomeStatus::Succeeded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_cancel_leaves_other_runs() {
        let (fleet, jobs) = fleet_jobs(2);
        let plan = PhasePlan::new().with(SleepPhase::new(
            Phase::AwaitScriptExit,
            Duration::from_secs(60),
        ));
        let executor = Arc::new(UpgradeExecutor::new(fleet.session()).with_plan(plan));
        let dispatcher = Dispatcher::new(executor).with_workers(1);

        let first = dispatcher.run(vec![jobs[0].clone()]);
        let second = dispatcher.run(vec![jobs[1].clone()]);
        tokio::time::sleep(Duration::from_secs(1)).await;
        first.cancel();

        let first = first.collect_all().await;
        let second = second.collect_all().await;
        assert_eq!(first[0].status(), OutcomeStatus::Cancelled);
        assert_eq!(second[0].status(), OutcomeStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_empty_job_list() {
        let fleet = Arc::new(SimulatedFleet::new());
        let executor = Arc::new(UpgradeExecutor::new(fleet.session()));

        let stream = Dispatcher::new(executor).run(Vec::new());
        assert_eq!(stream.workers(), 1);
        assert!(stream.collect_all().await.is_empty());
    }
}
