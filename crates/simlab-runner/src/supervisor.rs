use crate::archive::archive_output;
use crate::cancel::CancelToken;
use crate::checkpoint::write_checkpoint;
use crate::lock::acquire_run_lock;
use chrono::Utc;
use serde::Serialize;
use simlab_artifact::{check_fresh, load_artifact, register, NewArtifact, DIRECTORY_TYPE};
use simlab_core::{
    KillReason, Record, Result, RunDescriptor, RunOutcome, RunState, SimlabError, SupervisorConfig,
};
use simlab_store::{Key, ProvenanceStore};
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const RESULTS_ARTIFACT_NAME: &str = "results";
pub const RESULTS_DOCUMENTATION: &str = "Compressed version of the results directory";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunReport {
    /// A run with the same hash is already recorded; nothing was spawned.
    Skipped {
        run_id: Uuid,
        hash: String,
        existing_run_id: Uuid,
    },
    Completed {
        run_id: Uuid,
        outcome: RunOutcome,
        kill_reason: KillReason,
        exit_code: Option<i32>,
        result_artifact_id: Uuid,
    },
}

/// Drives one run descriptor from `Created` to a persisted record.
pub struct Supervisor {
    store: Arc<dyn ProvenanceStore>,
    config: SupervisorConfig,
    cancel: CancelToken,
}

/// True when the last line of the final `tail_bytes` of `path` contains
/// `marker`. A missing file never matches.
pub fn tail_contains_marker(path: &Path, tail_bytes: u64, marker: &str) -> bool {
    let mut file = match fs::File::open(path) {
        Ok(f) => f,
        Err(_) => return false,
    };
    let len = match file.metadata() {
        Ok(m) => m.len(),
        Err(_) => return false,
    };
    if file
        .seek(SeekFrom::Start(len.saturating_sub(tail_bytes)))
        .is_err()
    {
        return false;
    }
    let mut buf = Vec::new();
    if file.read_to_end(&mut buf).is_err() {
        return false;
    }
    String::from_utf8_lossy(&buf)
        .lines()
        .last()
        .map(|line| line.contains(marker))
        .unwrap_or(false)
}

impl Supervisor {
    pub fn new(store: Arc<dyn ProvenanceStore>, config: SupervisorConfig) -> Self {
        Self::with_cancel(store, config, CancelToken::new())
    }

    pub fn with_cancel(
        store: Arc<dyn ProvenanceStore>,
        config: SupervisorConfig,
        cancel: CancelToken,
    ) -> Self {
        Self {
            store,
            config,
            cancel,
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    fn checkpoint(&self, run: &RunDescriptor) -> Result<()> {
        write_checkpoint(run, &self.config.checkpoint_name)
    }

    pub fn run(&self, run: &mut RunDescriptor, task_id: Option<&str>) -> Result<RunReport> {
        let _lock = acquire_run_lock(&run.output_directory)?;

        if let Some(Record::Run(existing)) = self.store.get(&Key::Hash(run.hash.clone()))? {
            run.state = RunState::Skipped;
            info!(
                run_id = %run.id,
                existing_run_id = %existing.id,
                hash = %run.hash,
                "run already recorded; skipping: {}",
                run.command.join(" ")
            );
            return Ok(RunReport::Skipped {
                run_id: run.id,
                hash: run.hash.clone(),
                existing_run_id: existing.id,
            });
        }

        self.ensure_not_cancelled(run)?;
        run.state = RunState::ValidatingArtifacts;
        self.checkpoint(run)?;
        if let Err(e) = self.validate_artifacts(run) {
            warn!(run_id = %run.id, error = %e, "artifact validation failed; not spawning");
            self.checkpoint(run)?;
            return Err(e);
        }

        self.ensure_not_cancelled(run)?;
        run.state = RunState::Spawning;
        run.start_time = Some(Utc::now());
        run.task_id = task_id.map(str::to_string);
        self.checkpoint(run)?;
        let mut child = self.spawn(run)?;
        run.pid = Some(child.id());
        run.running = true;
        self.checkpoint(run)?;
        info!(run_id = %run.id, pid = child.id(), "spawned: {}", run.command.join(" "));

        let status = self.poll_until_exit(run, &mut child)?;

        run.running = false;
        run.end_time = Some(Utc::now());
        run.exit_code = status.code();
        let outcome = RunOutcome::from_exit_code(run.exit_code);
        run.outcome = Some(outcome);
        run.state = outcome.state();
        self.checkpoint(run)?;
        info!(
            run_id = %run.id,
            outcome = ?outcome,
            exit_code = ?run.exit_code,
            kill_reason = run.kill_reason.as_str(),
            "run exited"
        );

        run.state = RunState::Archiving;
        self.checkpoint(run)?;
        let result_id = match self.save_results(run) {
            Ok(id) => id,
            Err(e) => {
                run.state = outcome.state();
                self.checkpoint(run)?;
                return Err(e);
            }
        };
        run.result_artifact_id = Some(result_id);

        run.state = RunState::Completed;
        self.checkpoint(run)?;
        self.store.put(run.id, &Record::Run(run.clone()))?;
        info!(run_id = %run.id, hash = %run.hash, result_artifact_id = %result_id, "run recorded");

        Ok(RunReport::Completed {
            run_id: run.id,
            outcome,
            kill_reason: run.kill_reason,
            exit_code: run.exit_code,
            result_artifact_id: result_id,
        })
    }

    /// Once cancelled, runs not yet spawned are neither spawned nor recorded.
    fn ensure_not_cancelled(&self, run: &RunDescriptor) -> Result<()> {
        if self.cancel.is_cancelled() {
            info!(run_id = %run.id, state = run.state.as_str(), "cancelled before spawn");
            return Err(SimlabError::Cancelled(run.id));
        }
        Ok(())
    }

    fn validate_artifacts(&self, run: &RunDescriptor) -> Result<()> {
        for id in run.all_artifact_ids() {
            let artifact = load_artifact(self.store.as_ref(), id)?;
            check_fresh(&artifact)?;
            debug!(run_id = %run.id, artifact_id = %id, "artifact unchanged");
        }
        Ok(())
    }

    fn spawn(&self, run: &RunDescriptor) -> Result<Child> {
        let (program, args) = run
            .command
            .split_first()
            .ok_or_else(|| SimlabError::Config(format!("run {} has an empty command", run.id)))?;
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .spawn()?;
        Ok(child)
    }

    fn kill(&self, run: &mut RunDescriptor, child: &mut Child, reason: KillReason) {
        if let Err(e) = child.kill() {
            warn!(run_id = %run.id, error = %e, "kill failed; child may have exited");
        }
        run.kill_reason = reason;
        run.state = RunState::Killed;
        warn!(run_id = %run.id, kill_reason = reason.as_str(), "killed simulator");
    }

    fn poll_until_exit(&self, run: &mut RunDescriptor, child: &mut Child) -> Result<ExitStatus> {
        let started = Instant::now();
        let timeout = Duration::from_secs(run.timeout_seconds);
        let console = run.output_directory.join(&self.config.console_log);
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            run.state = RunState::Running;
            run.last_poll_time = Some(Utc::now());

            if self.cancel.is_cancelled() {
                self.kill(run, child, KillReason::Signal);
                self.checkpoint(run)?;
                return Ok(child.wait()?);
            }
            let reason = if started.elapsed() > timeout {
                Some(KillReason::Timeout)
            } else if tail_contains_marker(
                &console,
                self.config.panic_tail_bytes,
                &self.config.panic_marker,
            ) {
                Some(KillReason::Panic)
            } else {
                None
            };
            if let Some(reason) = reason {
                self.kill(run, child, reason);
                self.checkpoint(run)?;
                return Ok(child.wait()?);
            }
            self.checkpoint(run)?;

            self.cancel.wait_timeout(self.config.poll_interval());
        }
    }

    fn save_results(&self, run: &RunDescriptor) -> Result<Uuid> {
        let archive = archive_output(&run.output_directory, &self.config.archive_name)?;
        let registration = register(
            self.store.as_ref(),
            NewArtifact {
                command: format!(
                    "zip {} -r {}",
                    self.config.archive_name,
                    run.output_directory.display()
                ),
                name: RESULTS_ARTIFACT_NAME.to_string(),
                working_directory: run.output_directory.clone(),
                kind: DIRECTORY_TYPE.to_string(),
                path: archive,
                documentation: RESULTS_DOCUMENTATION.to_string(),
                inputs: vec![],
            },
        )?;
        Ok(registration.artifact.id)
    }
}
