#![cfg(unix)]

use chrono::Utc;
use serde_json::Value;
use simlab_artifact::{
    load_artifact, register, NewArtifact, BINARY_TYPE, SIMULATOR_BINARY_TYPE,
};
use simlab_core::{
    sha256_file, KillReason, RunDescriptor, RunOutcome, RunState, SimlabError, SupervisorConfig,
};
use simlab_runner::{
    create_run, load_checkpoint, runs, runs_by_name, RunReport, RunSpec, Supervisor, TaskDispatch,
    WorkerPool,
};
use simlab_store::{InMemoryStore, ProvenanceStore};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

const FAKE_SIMULATOR: &str = r#"#!/bin/sh
# invoked as: <bin> -re --outdir=<dir> <script> <mode>
outdir="${2#--outdir=}"
echo spawned >> "$outdir/spawns.log"
echo "simSeconds 0.000001" > "$outdir/stats.txt"
case "$4" in
  sleep) exec sleep 30 ;;
  panic)
    printf 'booting\nKernel panic - not syncing: VFS: Unable to mount root fs\n' > "$outdir/system.pc.com_1.device"
    exec sleep 30 ;;
  fail) exit 3 ;;
  peek)
    sleep 1
    cp "$outdir/info.json" "$outdir/seen_by_child.json" ;;
esac
exit 0
"#;

/// Written once, before any test spawns, so no test ever execs a file another
/// thread still holds open for writing.
fn simulator() -> &'static Path {
    static SIM: OnceLock<PathBuf> = OnceLock::new();
    SIM.get_or_init(|| {
        let dir = std::env::temp_dir()
            .join(format!("simlab_it_sim_{}", std::process::id()))
            .join("X86");
        fs::create_dir_all(&dir).expect("sim dir");
        let path = dir.join("gem5.opt");
        fs::write(&path, FAKE_SIMULATOR).expect("write sim");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
        path
    })
}

struct Fixture {
    root: PathBuf,
    mem: InMemoryStore,
    store: Arc<dyn ProvenanceStore>,
    script: PathBuf,
    artifacts: Vec<Uuid>,
}

impl Fixture {
    fn new(label: &str) -> Self {
        let sim = simulator();
        let root = std::env::temp_dir().join(format!(
            "simlab_it_{}_{}_{}",
            label,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let configs = root.join("configs");
        fs::create_dir_all(&configs).expect("configs");
        let script = configs.join("run_exit.py");
        fs::write(&script, format!("# {}\nprint('exit')\n", label)).expect("script");

        let mem = InMemoryStore::new();
        let store: Arc<dyn ProvenanceStore> = Arc::new(mem.clone());
        let binary = register(
            store.as_ref(),
            NewArtifact {
                command: "scons build/X86/gem5.opt -j8".into(),
                name: "gem5.opt".into(),
                working_directory: root.clone(),
                kind: SIMULATOR_BINARY_TYPE.into(),
                path: sim.to_path_buf(),
                documentation: "fake simulator build for supervisor tests".into(),
                inputs: vec![],
            },
        )
        .expect("register binary");
        let script_artifact = register(
            store.as_ref(),
            NewArtifact {
                command: "cp run_exit.py configs/".into(),
                name: "run_exit.py".into(),
                working_directory: root.clone(),
                kind: BINARY_TYPE.into(),
                path: script.clone(),
                documentation: "run script that exits immediately".into(),
                inputs: vec![],
            },
        )
        .expect("register script");
        Self {
            root,
            mem,
            store,
            script,
            artifacts: vec![binary.artifact.id, script_artifact.artifact.id],
        }
    }

    fn run(&self, mode: &str, timeout_seconds: u64) -> RunDescriptor {
        create_run(
            self.store.as_ref(),
            RunSpec {
                name: format!("test-{}", mode),
                binary_path: simulator().to_path_buf(),
                script_path: self.script.clone(),
                results_root: self.root.join("results"),
                referenced_artifacts: self.artifacts.clone(),
                extra_params: vec![mode.to_string()],
                full_system: None,
                timeout_seconds,
            },
            "info.json",
        )
        .expect("create run")
    }

    fn supervisor(&self) -> Supervisor {
        Supervisor::new(Arc::clone(&self.store), fast_config())
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

fn fast_config() -> SupervisorConfig {
    SupervisorConfig {
        poll_interval_ms: 50,
        ..SupervisorConfig::default()
    }
}

fn spawn_count(run: &RunDescriptor) -> usize {
    fs::read_to_string(run.output_directory.join("spawns.log"))
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

fn checkpoint(run: &RunDescriptor) -> Value {
    let raw = fs::read_to_string(run.output_directory.join("info.json")).expect("checkpoint");
    serde_json::from_str(&raw).expect("checkpoint json")
}

#[test]
fn successful_run_is_archived_and_recorded() {
    let fx = Fixture::new("ok");
    let mut run = fx.run("ok", 60);
    let report = fx.supervisor().run(&mut run, Some("task-1")).expect("run");

    let result_id = match report {
        RunReport::Completed {
            outcome,
            kill_reason,
            exit_code,
            result_artifact_id,
            ..
        } => {
            assert_eq!(outcome, RunOutcome::Finished);
            assert_eq!(kill_reason, KillReason::None);
            assert_eq!(exit_code, Some(0));
            result_artifact_id
        }
        other => panic!("unexpected report {:?}", other),
    };
    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.result_artifact_id, Some(result_id));
    assert_eq!(run.task_id.as_deref(), Some("task-1"));
    assert!(!run.running);
    assert_eq!(spawn_count(&run), 1);

    let cp = checkpoint(&run);
    assert_eq!(cp["state"], "Completed");
    assert_eq!(cp["result_artifact_id"], Value::String(result_id.to_string()));
    assert_eq!(cp["task_id"], "task-1");
    assert_eq!(load_checkpoint(&run.output_directory.join("info.json")).expect("reload"), run);

    let archive_path = run.output_directory.join("results.zip");
    let result = load_artifact(fx.store.as_ref(), result_id).expect("result artifact");
    assert_eq!(result.name, "results");
    assert_eq!(result.kind, "directory");
    assert_eq!(result.content_hash, sha256_file(&archive_path).expect("hash"));

    let mut archive =
        zip::ZipArchive::new(fs::File::open(&archive_path).expect("open")).expect("zip");
    let names: Vec<String> = (0..archive.len())
        .map(|i| archive.by_index(i).expect("entry").name().to_string())
        .collect();
    assert!(names.iter().any(|n| n == "stats.txt"), "entries: {:?}", names);
    assert!(names.iter().any(|n| n == "info.json"), "entries: {:?}", names);
    assert!(!names.iter().any(|n| n.ends_with("results.zip")), "entries: {:?}", names);

    let recorded: Vec<RunDescriptor> = runs(fx.store.as_ref(), false, 0)
        .expect("query")
        .collect::<Result<_, _>>()
        .expect("runs");
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].id, run.id);
    assert_eq!(runs(fx.store.as_ref(), true, 0).expect("query").count(), 0);
    assert_eq!(runs_by_name(fx.store.as_ref(), "test-ok", 0).expect("query").count(), 1);
    assert_eq!(runs_by_name(fx.store.as_ref(), "results", 0).expect("query").count(), 0);
}

#[test]
fn duplicate_run_is_skipped_without_spawning() {
    let fx = Fixture::new("skip");
    let supervisor = fx.supervisor();
    let mut first = fx.run("ok", 60);
    supervisor.run(&mut first, None).expect("first run");
    let records_after_first = fx.mem.len();

    let mut second = fx.run("ok", 60);
    assert_eq!(second.hash, first.hash);
    assert_ne!(second.id, first.id);
    let report = supervisor.run(&mut second, None).expect("second run");
    assert_eq!(
        report,
        RunReport::Skipped {
            run_id: second.id,
            hash: second.hash.clone(),
            existing_run_id: first.id,
        }
    );
    assert_eq!(second.state, RunState::Skipped);
    assert_eq!(spawn_count(&second), 1);
    assert_eq!(fx.mem.len(), records_after_first);
}

#[test]
fn nonzero_exit_is_failed_but_still_archived() {
    let fx = Fixture::new("fail");
    let mut run = fx.run("fail", 60);
    let report = fx.supervisor().run(&mut run, None).expect("run");
    assert!(
        matches!(
            report,
            RunReport::Completed {
                outcome: RunOutcome::Failed,
                exit_code: Some(3),
                kill_reason: KillReason::None,
                ..
            }
        ),
        "got {:?}",
        report
    );
    assert!(run.output_directory.join("results.zip").is_file());
}

#[test]
fn timeout_kills_within_a_poll_interval() {
    let fx = Fixture::new("timeout");
    let mut run = fx.run("sleep", 1);
    let started = Instant::now();
    let report = fx.supervisor().run(&mut run, None).expect("run");
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "took {:?}",
        started.elapsed()
    );
    assert!(
        matches!(
            report,
            RunReport::Completed {
                outcome: RunOutcome::Failed,
                kill_reason: KillReason::Timeout,
                exit_code: None,
                ..
            }
        ),
        "got {:?}",
        report
    );
    assert_eq!(checkpoint(&run)["kill_reason"], "timeout");
}

#[test]
fn kernel_panic_on_console_kills_the_run() {
    let fx = Fixture::new("panic");
    let mut run = fx.run("panic", 60);
    let started = Instant::now();
    let report = fx.supervisor().run(&mut run, None).expect("run");
    assert!(started.elapsed() < Duration::from_secs(20));
    assert_eq!(run.kill_reason, KillReason::Panic);
    assert!(
        matches!(
            report,
            RunReport::Completed {
                outcome: RunOutcome::Failed,
                kill_reason: KillReason::Panic,
                ..
            }
        ),
        "got {:?}",
        report
    );
}

#[test]
fn cancellation_kills_and_records_signal() {
    let fx = Fixture::new("signal");
    let mut run = fx.run("sleep", 120);
    let supervisor = fx.supervisor();
    let token = supervisor.cancel_token();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        token.cancel();
    });
    let started = Instant::now();
    let report = supervisor.run(&mut run, None).expect("run");
    canceller.join().expect("join");
    assert!(started.elapsed() < Duration::from_secs(20));
    assert!(
        matches!(
            report,
            RunReport::Completed {
                kill_reason: KillReason::Signal,
                outcome: RunOutcome::Failed,
                ..
            }
        ),
        "got {:?}",
        report
    );
    assert_eq!(checkpoint(&run)["kill_reason"], "signal");
    assert_eq!(runs(fx.store.as_ref(), false, 0).expect("query").count(), 1);
}

#[test]
fn cancelled_supervisor_starts_nothing_and_records_nothing() {
    let fx = Fixture::new("precancel");
    let supervisor = fx.supervisor();
    supervisor.cancel_token().cancel();
    let mut run = fx.run("ok", 60);

    let err = supervisor.run(&mut run, None).expect_err("cancelled");
    assert!(matches!(err, SimlabError::Cancelled(id) if id == run.id), "got {:?}", err);
    assert_eq!(err.code(), "cancelled");
    assert_eq!(spawn_count(&run), 0);
    assert_eq!(run.pid, None);
    assert_eq!(checkpoint(&run)["state"], "Created");
    assert_eq!(fx.mem.len(), 2);

    let mut retry = fx.run("ok", 60);
    assert_eq!(retry.hash, run.hash);
    let report = fx.supervisor().run(&mut retry, None).expect("retry");
    assert!(
        matches!(
            report,
            RunReport::Completed {
                outcome: RunOutcome::Finished,
                kill_reason: KillReason::None,
                ..
            }
        ),
        "got {:?}",
        report
    );
    assert_eq!(spawn_count(&retry), 1);
}

#[test]
fn cancelled_pool_drains_queued_runs_without_starting_them() {
    let fx = Fixture::new("pooldrain");
    let supervisor = Arc::new(fx.supervisor());
    supervisor.cancel_token().cancel();
    let pool = WorkerPool::new(Arc::clone(&supervisor), 2);
    let a = fx.run("ok", 60);
    let b = fx.run("fail", 60);
    pool.execute(a.clone(), "task-a".into()).expect("dispatch");
    pool.execute(b.clone(), "task-b".into()).expect("dispatch");

    let results = pool.join();
    assert_eq!(results.len(), 2);
    for r in &results {
        assert!(
            matches!(r.result, Err(SimlabError::Cancelled(id)) if id == r.run_id),
            "task {} got {:?}",
            r.task_id,
            r.result
        );
    }
    assert_eq!(spawn_count(&a), 0);
    assert_eq!(spawn_count(&b), 0);
    assert_eq!(runs(fx.store.as_ref(), false, 0).expect("query").count(), 0);
}

#[test]
fn archive_failure_keeps_process_state_and_records_no_run() {
    let fx = Fixture::new("archivefail");
    let mut run = fx.run("ok", 60);
    fs::create_dir_all(run.output_directory.join("results.zip")).expect("block archive path");

    let err = fx.supervisor().run(&mut run, None).expect_err("archive must fail");
    assert!(matches!(err, SimlabError::Archive { .. }), "got {:?}", err);
    assert_eq!(err.code(), "archive_error");
    assert_eq!(spawn_count(&run), 1);
    assert_eq!(run.state, RunState::Finished);
    assert_eq!(run.result_artifact_id, None);

    let cp = checkpoint(&run);
    assert_eq!(cp["state"], "Finished");
    assert_eq!(cp["result_artifact_id"], Value::Null);
    assert_eq!(runs(fx.store.as_ref(), false, 0).expect("query").count(), 0);
    assert_eq!(fx.mem.len(), 2);
}

#[test]
fn pid_is_checkpointed_while_the_child_runs() {
    let fx = Fixture::new("pid");
    let mut run = fx.run("peek", 60);
    fx.supervisor().run(&mut run, None).expect("run");
    let pid = run.pid.expect("pid recorded");

    let raw = fs::read_to_string(run.output_directory.join("seen_by_child.json"))
        .expect("child copied checkpoint");
    let seen: Value = serde_json::from_str(&raw).expect("json");
    assert_eq!(seen["pid"], Value::from(pid));
    assert_eq!(seen["running"], Value::Bool(true));
    assert!(!seen["start_time"].is_null());
}

#[test]
fn drifted_artifact_blocks_the_spawn() {
    let fx = Fixture::new("drift");
    let mut run = fx.run("ok", 60);
    fs::write(&fx.script, "print('edited after registration')\n").expect("edit script");

    let err = fx.supervisor().run(&mut run, None).expect_err("drift");
    assert!(matches!(err, SimlabError::ArtifactDrift { .. }), "got {:?}", err);
    assert_eq!(spawn_count(&run), 0);
    assert_eq!(run.state, RunState::ValidatingArtifacts);
    assert_eq!(checkpoint(&run)["state"], "ValidatingArtifacts");
    assert_eq!(runs(fx.store.as_ref(), false, 0).expect("query").count(), 0);
}

#[test]
fn worker_pool_runs_every_dispatched_task() {
    let fx = Fixture::new("pool");
    let supervisor = Arc::new(fx.supervisor());
    let pool = WorkerPool::new(supervisor, 2);
    let ok = fx.run("ok", 60);
    let fail = fx.run("fail", 60);
    pool.execute(ok.clone(), "task-ok".into()).expect("dispatch");
    pool.execute(fail.clone(), "task-fail".into()).expect("dispatch");

    let mut results = pool.join();
    results.sort_by(|a, b| a.task_id.cmp(&b.task_id));
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].task_id, "task-fail");
    assert_eq!(results[0].run_id, fail.id);
    assert_eq!(results[1].run.task_id.as_deref(), Some("task-ok"));
    for r in &results {
        assert!(r.result.is_ok(), "task {} failed: {:?}", r.task_id, r.result);
    }
    assert_eq!(runs(fx.store.as_ref(), false, 0).expect("query").count(), 2);
}
