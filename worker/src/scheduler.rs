//! Task scheduling and firing
//!
//! Translates the worker's set of assigned tasks into timed plugin
//! invocations: one ticker per task, gated by an `is_running` flag so a task
//! never fires concurrently with itself. Grounded directly on the teacher's
//! `TaskScheduler`/`TaskHandle` pair — same overall shape (a
//! `running_tasks: HashMap<String, JobHandle>`, an mpsc ready/result channel
//! pair, per-task tickers spawned with `tokio::spawn`, graceful shutdown
//! draining in-flight firings up to a timeout) retargeted from fixed
//! monitoring intervals to the two assigned-task trigger kinds of §4.5.

use shared::{ExecutionStatus, Task, TaskKind, TaskStatus};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::client::CoordinatorClient;
use crate::plugins::PluginRegistry;
use crate::response::ResponseProcessor;

/// Minimum spacing between newly registered jobs' first tick, staggered to
/// avoid a thundering herd of simultaneous firings — the same rationale as
/// the teacher's `calculate_minimum_start_delay`, simplified here since jobs
/// register incrementally (one sync at a time) rather than all at once.
const REGISTRATION_STAGGER: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy)]
enum JobTrigger {
    OneShot,
    Interval {
        period: Duration,
        end: Option<Instant>,
    },
}

struct JobHandle {
    kind: TaskKind,
    is_running: bool,
    ticker: tokio::task::JoinHandle<()>,
}

/// Sent back from a completed firing so the main loop can reset the job's
/// `is_running` flag (or deregister it, for a one-shot task).
pub struct FiringResult {
    pub task_id: String,
    pub is_adhoc: bool,
}

/// Drives timed firings of the tasks currently assigned to this worker.
pub struct Scheduler {
    running_tasks: HashMap<String, JobHandle>,
    ready_sender: mpsc::Sender<Task>,
    pub ready_receiver: mpsc::Receiver<Task>,
    result_sender: mpsc::Sender<FiringResult>,
    pub result_receiver: mpsc::Receiver<FiringResult>,
    client: CoordinatorClient,
    plugins: Arc<PluginRegistry>,
    response_processor: Arc<ResponseProcessor>,
    hostname: String,
    graceful_shutdown_timeout: Duration,
    misfire_grace: Duration,
    stagger_count: u32,
}

impl Scheduler {
    pub fn new(
        client: CoordinatorClient,
        plugins: Arc<PluginRegistry>,
        response_processor: Arc<ResponseProcessor>,
        hostname: String,
        channel_buffer_size: usize,
        graceful_shutdown_timeout_secs: u64,
        misfire_grace_seconds: u64,
    ) -> Self {
        let (ready_sender, ready_receiver) = mpsc::channel(channel_buffer_size);
        let (result_sender, result_receiver) = mpsc::channel(channel_buffer_size);

        Self {
            running_tasks: HashMap::new(),
            ready_sender,
            ready_receiver,
            result_sender,
            result_receiver,
            client,
            plugins,
            response_processor,
            hostname,
            graceful_shutdown_timeout: Duration::from_secs(graceful_shutdown_timeout_secs),
            misfire_grace: Duration::from_secs(misfire_grace_seconds),
            stagger_count: 0,
        }
    }

    /// Reconciles registered jobs against the worker's current assignment
    /// list. Run every 10s from the main loop (§4.5 sync algorithm).
    pub fn sync(&mut self, assigned: &[Task]) {
        let assigned_ids: HashSet<&str> = assigned
            .iter()
            .filter(|t| t.status == TaskStatus::Active)
            .map(|t| t.id.as_str())
            .collect();

        let stale: Vec<String> = self
            .running_tasks
            .keys()
            .filter(|id| !assigned_ids.contains(id.as_str()))
            .cloned()
            .collect();
        for id in stale {
            self.deregister(&id);
        }

        for task in assigned {
            if task.status != TaskStatus::Active || self.running_tasks.contains_key(&task.id) {
                continue;
            }
            self.register(task.clone());
        }
    }

    fn register(&mut self, task: Task) {
        let now_epoch = shared::utils::current_timestamp();
        let overdue = (now_epoch - task.updated_at).max(0.0);

        if matches!(task.kind, TaskKind::Adhoc) && overdue > self.misfire_grace.as_secs_f64() {
            debug!(
                task_id = %task.id,
                overdue_seconds = overdue,
                "Dropping missed one-shot firing past grace window"
            );
            return;
        }

        let stagger = REGISTRATION_STAGGER * self.stagger_count;
        self.stagger_count = self.stagger_count.wrapping_add(1);
        let start = Instant::now() + stagger;

        let trigger = match task.kind {
            TaskKind::Adhoc => JobTrigger::OneShot,
            TaskKind::Schedule => {
                let period = Duration::from_secs(task.interval_seconds.unwrap_or(60).max(1));
                let end = task.end_of_window.map(|eow| {
                    let remaining = (eow - now_epoch).max(0.0);
                    Instant::now() + Duration::from_secs_f64(remaining)
                });
                JobTrigger::Interval { period, end }
            }
        };

        let task_id = task.id.clone();
        let kind = task.kind;
        let ready_sender = self.ready_sender.clone();

        let ticker = match trigger {
            JobTrigger::OneShot => {
                let task = task.clone();
                tokio::spawn(async move {
                    tokio::time::sleep_until(start).await;
                    if ready_sender.send(task).await.is_err() {
                        debug!("ready channel closed before one-shot task could fire");
                    }
                })
            }
            JobTrigger::Interval { period, end } => {
                let misfire_grace = self.misfire_grace;
                tokio::spawn(async move {
                    let mut interval = tokio::time::interval_at(start, period);
                    let mut expected = start;
                    loop {
                        interval.tick().await;
                        if let Some(end) = end {
                            if Instant::now() >= end {
                                break;
                            }
                        }

                        let drift = Instant::now().saturating_duration_since(expected);
                        expected += period;
                        if drift > misfire_grace {
                            debug!(
                                task_id = %task.id,
                                drift_secs = drift.as_secs(),
                                "Dropping missed interval firing past grace window"
                            );
                            continue;
                        }

                        if ready_sender.send(task.clone()).await.is_err() {
                            break;
                        }
                    }
                })
            }
        };

        self.running_tasks.insert(
            task_id,
            JobHandle {
                kind,
                is_running: false,
                ticker,
            },
        );
    }

    fn deregister(&mut self, task_id: &str) {
        if let Some(handle) = self.running_tasks.remove(task_id) {
            handle.ticker.abort();
        }
    }

    /// Handles a task the ready channel yielded: enforces the
    /// exactly-one-running invariant, then spawns the firing algorithm
    /// (§4.5) on a background task so the scheduler loop stays responsive.
    pub fn fire_ready_task(&mut self, task: Task) {
        let Some(handle) = self.running_tasks.get_mut(&task.id) else {
            return;
        };
        if handle.is_running {
            warn!(task_id = %task.id, "Skipping firing, previous run still in flight");
            return;
        }
        handle.is_running = true;

        let client = self.client.clone();
        let plugins = self.plugins.clone();
        let response_processor = self.response_processor.clone();
        let hostname = self.hostname.clone();
        let result_sender = self.result_sender.clone();
        let task_id = task.id.clone();
        let is_adhoc = matches!(task.kind, TaskKind::Adhoc);

        tokio::spawn(async move {
            Self::run_firing(&client, &plugins, &response_processor, &hostname, &task).await;
            let _ = result_sender.send(FiringResult { task_id, is_adhoc }).await;
        });
    }

    /// The firing algorithm (§4.5): post a `running` execution record,
    /// invoke the resolved plugin, translate its outcome via the response
    /// processor, then post the terminal execution record and patch the
    /// task. The status-guard on the coordinator's `PUT /tasks/{id}`
    /// prevents a mid-window recurring task from being wrongly finalized.
    async fn run_firing(
        client: &CoordinatorClient,
        plugins: &PluginRegistry,
        response_processor: &ResponseProcessor,
        hostname: &str,
        task: &Task,
    ) {
        let execution_id = shared::utils::make_execution_id(&task.id, hostname);

        if let Err(e) = client
            .post_execution_result(&execution_id, &task.id, ExecutionStatus::Running, "")
            .await
        {
            warn!(task_id = %task.id, "Failed to post running execution: {}", e);
        }

        let (status, result) = match plugins.resolve(&task.plugin) {
            Some(plugin) => {
                response_processor
                    .process(plugin, &task.id, &task.action, &task.args, &task.kwargs)
                    .await
            }
            None => (
                ExecutionStatus::Failed,
                format!("unknown plugin '{}'", task.plugin),
            ),
        };

        if let Err(e) = client
            .post_execution_result(&execution_id, &task.id, status, &result)
            .await
        {
            warn!(task_id = %task.id, "Failed to post terminal execution: {}", e);
        }

        let task_status = match status {
            ExecutionStatus::Success => "done",
            _ => "failed",
        };
        if let Err(e) = client.update_task(&task.id, task_status, &result).await {
            warn!(task_id = %task.id, "Failed to update task status: {}", e);
        }
    }

    /// Processes a completed firing: resets `is_running`, deregistering
    /// one-shot jobs entirely (step 9 of §4.5).
    pub fn handle_result(&mut self, result: FiringResult) {
        if result.is_adhoc {
            self.deregister(&result.task_id);
            return;
        }
        if let Some(handle) = self.running_tasks.get_mut(&result.task_id) {
            handle.is_running = false;
        }
    }

    pub fn running_task_count(&self) -> usize {
        self.running_tasks.values().filter(|h| h.is_running).count()
    }

    /// Stops every ticker, waiting up to the configured timeout for
    /// in-flight firings to settle and draining their results.
    pub async fn shutdown(&mut self) {
        info!("Stopping scheduler");
        let deadline = Instant::now() + self.graceful_shutdown_timeout;
        let mut check = tokio::time::interval(Duration::from_millis(100));

        loop {
            check.tick().await;
            while let Ok(result) = self.result_receiver.try_recv() {
                self.handle_result(result);
            }
            if self.running_task_count() == 0 || Instant::now() >= deadline {
                break;
            }
        }

        for (_, handle) in self.running_tasks.drain() {
            handle.ticker.abort();
        }
        info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::Owner;

    fn make_task(id: &str, kind: TaskKind, interval_seconds: Option<u64>) -> Task {
        Task {
            id: id.to_string(),
            name: id.to_string(),
            kind,
            owner: Owner::Anyone,
            plugin: "echo".to_string(),
            action: "echo".to_string(),
            args: vec![],
            kwargs: serde_json::Map::new(),
            interval_seconds,
            end_of_window: None,
            status: TaskStatus::Active,
            result: String::new(),
            created_at: shared::utils::current_timestamp(),
            updated_at: shared::utils::current_timestamp(),
        }
    }

    fn scheduler() -> Scheduler {
        let client = CoordinatorClient::new(
            "http://127.0.0.1:1".to_string(),
            "worker-01".to_string(),
            1,
            10,
            20,
        )
        .unwrap();
        let dir = tempfile::TempDir::new().unwrap();
        let plugins = Arc::new(PluginRegistry::new(dir.path()).unwrap());
        let response_processor = Arc::new(ResponseProcessor::new(
            client.clone(),
            dir.path().to_path_buf(),
            "worker-01".to_string(),
        ));
        Scheduler::new(client, plugins, response_processor, "worker-01".to_string(), 16, 5, 60)
    }

    #[tokio::test]
    async fn test_sync_registers_and_deregisters() {
        let mut scheduler = scheduler();
        let task = make_task("t1", TaskKind::Adhoc, None);
        scheduler.sync(&[task.clone()]);
        assert!(scheduler.running_tasks.contains_key("t1"));

        scheduler.sync(&[]);
        assert!(!scheduler.running_tasks.contains_key("t1"));
    }

    #[tokio::test]
    async fn test_sync_skips_already_registered_task() {
        let mut scheduler = scheduler();
        let task = make_task("t1", TaskKind::Schedule, Some(30));
        scheduler.sync(&[task.clone()]);
        scheduler.sync(&[task]);
        assert_eq!(scheduler.running_tasks.len(), 1);
    }

    #[tokio::test]
    async fn test_fire_ready_task_enforces_exactly_one_running() {
        let mut scheduler = scheduler();
        let task = make_task("t1", TaskKind::Adhoc, None);
        scheduler.sync(&[task.clone()]);

        scheduler.fire_ready_task(task.clone());
        assert!(scheduler.running_tasks.get("t1").unwrap().is_running);

        // A second concurrent firing attempt is a no-op while the first is in flight.
        scheduler.fire_ready_task(task);
        assert_eq!(scheduler.running_task_count(), 1);
    }

    #[tokio::test]
    async fn test_handle_result_deregisters_adhoc_and_resets_schedule() {
        let mut scheduler = scheduler();
        scheduler.sync(&[make_task("adhoc-1", TaskKind::Adhoc, None)]);
        scheduler.sync(&[make_task("sched-1", TaskKind::Schedule, Some(30))]);

        scheduler.running_tasks.get_mut("sched-1").unwrap().is_running = true;

        scheduler.handle_result(FiringResult {
            task_id: "adhoc-1".to_string(),
            is_adhoc: true,
        });
        assert!(!scheduler.running_tasks.contains_key("adhoc-1"));

        scheduler.handle_result(FiringResult {
            task_id: "sched-1".to_string(),
            is_adhoc: false,
        });
        assert!(!scheduler.running_tasks.get("sched-1").unwrap().is_running);
    }
}
