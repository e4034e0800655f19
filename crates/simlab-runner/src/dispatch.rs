use crate::supervisor::{RunReport, Supervisor};
use simlab_core::{Result, RunDescriptor, SimlabError};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Hands a run to something that will supervise it, tagged with the task id
/// the caller uses to track it.
pub trait TaskDispatch {
    fn execute(&self, run: RunDescriptor, task_id: String) -> Result<()>;
}

#[derive(Debug)]
pub struct TaskResult {
    pub task_id: String,
    pub run_id: Uuid,
    pub run: RunDescriptor,
    pub result: Result<RunReport>,
}

struct Job {
    run: RunDescriptor,
    task_id: String,
}

/// Fixed set of threads, each supervising one run at a time.
pub struct WorkerPool {
    sender: Option<mpsc::Sender<Job>>,
    results: mpsc::Receiver<TaskResult>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(supervisor: Arc<Supervisor>, workers: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let (result_tx, results) = mpsc::channel::<TaskResult>();
        let receiver = Arc::new(Mutex::new(receiver));
        let workers = (0..workers.max(1))
            .map(|worker| {
                let receiver = Arc::clone(&receiver);
                let supervisor = Arc::clone(&supervisor);
                let cancel = supervisor.cancel_token();
                let result_tx = result_tx.clone();
                thread::spawn(move || loop {
                    let job = {
                        let guard = receiver.lock().unwrap_or_else(PoisonError::into_inner);
                        guard.recv()
                    };
                    let Ok(Job { mut run, task_id }) = job else {
                        break;
                    };
                    let result = if cancel.is_cancelled() {
                        warn!(worker, task_id = %task_id, run_id = %run.id, "dropping queued run");
                        Err(SimlabError::Cancelled(run.id))
                    } else {
                        info!(worker, task_id = %task_id, run_id = %run.id, "worker picked up run");
                        supervisor.run(&mut run, Some(&task_id))
                    };
                    match &result {
                        Err(SimlabError::Cancelled(_)) | Ok(_) => {}
                        Err(e) => error!(
                            worker,
                            task_id = %task_id,
                            run_id = %run.id,
                            error = %e,
                            "run failed"
                        ),
                    }
                    let done = TaskResult {
                        task_id,
                        run_id: run.id,
                        run,
                        result,
                    };
                    if result_tx.send(done).is_err() {
                        break;
                    }
                })
            })
            .collect();
        Self {
            sender: Some(sender),
            results,
            workers,
        }
    }

    /// Stops accepting work, waits for queued runs and returns their
    /// results in completion order. After the supervisor's token is
    /// cancelled, runs still queued come back as `Cancelled` without being
    /// started.
    pub fn join(mut self) -> Vec<TaskResult> {
        self.sender.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        self.results.try_iter().collect()
    }
}

impl TaskDispatch for WorkerPool {
    fn execute(&self, run: RunDescriptor, task_id: String) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| SimlabError::Config("worker pool is shut down".into()))?;
        sender
            .send(Job { run, task_id })
            .map_err(|_| SimlabError::Config("worker pool has no live workers".into()))
    }
}
