use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use uuid::Uuid;

pub const STANDALONE_RUN_TYPE: &str = "simulator run";
pub const FULL_SYSTEM_RUN_TYPE: &str = "simulator run fs";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitProvenance {
    pub origin_url: Option<String>,
    pub commit_id: String,
    pub repo_root: PathBuf,
}

/// An identity-tracked build product.
///
/// Two artifacts are equal when their `id` and `content_hash` agree; the
/// remaining fields are provenance metadata and never affect equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub documentation: String,
    pub command: String,
    pub path: PathBuf,
    pub content_hash: String,
    #[serde(default)]
    pub git: Option<GitProvenance>,
    pub working_directory: PathBuf,
    #[serde(default)]
    pub inputs: Vec<Uuid>,
}

impl Artifact {
    pub fn is_git_backed(&self) -> bool {
        self.git.is_some()
    }

    /// The value recorded at registration that a later freshness check must
    /// reproduce.
    pub fn verification_value(&self) -> &str {
        match &self.git {
            Some(git) => &git.commit_id,
            None => &self.content_hash,
        }
    }
}

impl PartialEq for Artifact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.content_hash == other.content_hash
    }
}

impl Eq for Artifact {}

impl Hash for Artifact {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.name)?;
        writeln!(f, "    id: {}", self.id)?;
        writeln!(f, "    type: {}", self.kind)?;
        writeln!(f, "    path: {}", self.path.display())?;
        let inputs = self
            .inputs
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        writeln!(f, "    inputs: {}", inputs)?;
        write!(f, "    {}", self.documentation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Created,
    ValidatingArtifacts,
    Spawning,
    Running,
    Killed,
    Finished,
    Failed,
    Archiving,
    Completed,
    Skipped,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Created => "Created",
            RunState::ValidatingArtifacts => "ValidatingArtifacts",
            RunState::Spawning => "Spawning",
            RunState::Running => "Running",
            RunState::Killed => "Killed",
            RunState::Finished => "Finished",
            RunState::Failed => "Failed",
            RunState::Archiving => "Archiving",
            RunState::Completed => "Completed",
            RunState::Skipped => "Skipped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillReason {
    #[default]
    None,
    Timeout,
    Signal,
    Panic,
}

impl KillReason {
    pub fn as_str(self) -> &'static str {
        match self {
            KillReason::None => "none",
            KillReason::Timeout => "timeout",
            KillReason::Signal => "signal",
            KillReason::Panic => "panic",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    Finished,
    Failed,
}

impl RunOutcome {
    pub fn from_exit_code(code: Option<i32>) -> Self {
        match code {
            Some(0) => RunOutcome::Finished,
            _ => RunOutcome::Failed,
        }
    }

    pub fn state(self) -> RunState {
        match self {
            RunOutcome::Finished => RunState::Finished,
            RunOutcome::Failed => RunState::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "snake_case")]
pub enum RunVariant {
    Standalone,
    FullSystem {
        kernel_artifact_id: Uuid,
        disk_image_artifact_id: Uuid,
        kernel_path: PathBuf,
        disk_image_path: PathBuf,
    },
}

/// One simulator invocation. Created once, then mutated in place by the
/// supervisor until it is persisted as a terminal record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDescriptor {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub variant: RunVariant,
    pub binary_path: PathBuf,
    pub script_path: PathBuf,
    pub extra_params: Vec<String>,
    pub referenced_artifacts: Vec<Uuid>,
    pub binary_tag: String,
    pub script_name: String,
    pub output_directory: PathBuf,
    pub command: Vec<String>,
    pub hash: String,
    pub timeout_seconds: u64,
    pub state: RunState,
    #[serde(default)]
    pub outcome: Option<RunOutcome>,
    #[serde(default)]
    pub kill_reason: KillReason,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub result_artifact_id: Option<Uuid>,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub task_id: Option<String>,
    pub enqueue_time: DateTime<Utc>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_poll_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
}

impl RunDescriptor {
    pub fn is_full_system(&self) -> bool {
        matches!(self.variant, RunVariant::FullSystem { .. })
    }

    /// Every artifact whose freshness gates the spawn, in hash order.
    pub fn all_artifact_ids(&self) -> Vec<Uuid> {
        let mut ids = self.referenced_artifacts.clone();
        if let RunVariant::FullSystem {
            kernel_artifact_id,
            disk_image_artifact_id,
            ..
        } = &self.variant
        {
            ids.push(*kernel_artifact_id);
            ids.push(*disk_image_artifact_id);
        }
        ids
    }

    pub fn display_string(&self) -> String {
        let mut parts = vec![self.binary_tag.clone(), self.script_name.clone()];
        if let RunVariant::FullSystem {
            kernel_path,
            disk_image_path,
            ..
        } = &self.variant
        {
            parts.push(file_name_lossy(kernel_path));
            parts.push(file_name_lossy(disk_image_path));
        }
        parts.extend(self.extra_params.iter().cloned());
        parts.join(" ")
    }
}

impl fmt::Display for RunDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.display_string(), self.state.as_str())
    }
}

pub fn file_name_lossy(path: &std::path::Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// A document held by the provenance store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum Record {
    Artifact(Artifact),
    Run(RunDescriptor),
}

impl Record {
    pub fn id(&self) -> Uuid {
        match self {
            Record::Artifact(a) => a.id,
            Record::Run(r) => r.id,
        }
    }

    /// Content hash for artifacts, run hash for runs.
    pub fn hash(&self) -> &str {
        match self {
            Record::Artifact(a) => &a.content_hash,
            Record::Run(r) => &r.hash,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Record::Artifact(a) => &a.name,
            Record::Run(r) => &r.name,
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Record::Artifact(a) => &a.kind,
            Record::Run(r) => &r.kind,
        }
    }

    pub fn into_artifact(self) -> Option<Artifact> {
        match self {
            Record::Artifact(a) => Some(a),
            Record::Run(_) => None,
        }
    }

    pub fn into_run(self) -> Option<RunDescriptor> {
        match self {
            Record::Run(r) => Some(r),
            Record::Artifact(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn artifact(hash: &str, doc: &str) -> Artifact {
        Artifact {
            id: Uuid::nil(),
            name: "vmlinux".into(),
            kind: "kernel".into(),
            documentation: doc.into(),
            command: "make vmlinux".into(),
            path: PathBuf::from("/build/vmlinux"),
            content_hash: hash.into(),
            git: None,
            working_directory: PathBuf::from("/build"),
            inputs: vec![],
        }
    }

    fn run(variant: RunVariant) -> RunDescriptor {
        RunDescriptor {
            id: Uuid::new_v4(),
            name: "boot".into(),
            kind: FULL_SYSTEM_RUN_TYPE.into(),
            variant,
            binary_path: PathBuf::from("/gem5/build/X86/gem5.opt"),
            script_path: PathBuf::from("/cfg/run_exit.py"),
            extra_params: vec!["kvm".into(), "1".into()],
            referenced_artifacts: vec![Uuid::new_v4()],
            binary_tag: "X86".into(),
            script_name: "run_exit".into(),
            output_directory: PathBuf::from("/results/X86/run_exit"),
            command: vec![],
            hash: "abc".into(),
            timeout_seconds: 60,
            state: RunState::Created,
            outcome: None,
            kill_reason: KillReason::None,
            exit_code: None,
            result_artifact_id: None,
            running: false,
            pid: None,
            task_id: None,
            enqueue_time: Utc::now(),
            start_time: None,
            last_poll_time: None,
            end_time: None,
        }
    }

    #[test]
    fn artifact_equality_ignores_metadata() {
        let a = artifact("h1", "first description");
        let b = artifact("h1", "another description");
        let c = artifact("h2", "first description");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn run_variant_fields_are_flattened_into_the_document() {
        let kernel = Uuid::new_v4();
        let disk = Uuid::new_v4();
        let r = run(RunVariant::FullSystem {
            kernel_artifact_id: kernel,
            disk_image_artifact_id: disk,
            kernel_path: PathBuf::from("/k/vmlinux-5.4"),
            disk_image_path: PathBuf::from("/d/ubuntu.img"),
        });
        let v = serde_json::to_value(&r).expect("serialize");
        assert_eq!(v["variant"], "full_system");
        assert_eq!(v["kernel_artifact_id"], json!(kernel.to_string()));
        assert_eq!(v["kill_reason"], "none");
        assert_eq!(v["state"], "Created");

        let back: RunDescriptor = serde_json::from_value(v).expect("deserialize");
        assert_eq!(back, r);
        assert_eq!(back.all_artifact_ids().len(), 3);
        assert_eq!(back.all_artifact_ids()[1], kernel);
    }

    #[test]
    fn record_tag_distinguishes_artifacts_and_runs() {
        let rec = Record::Run(run(RunVariant::Standalone));
        let v = serde_json::to_value(&rec).expect("serialize");
        assert_eq!(v["record"], "run");
        assert_eq!(v["variant"], "standalone");
        let back: Record = serde_json::from_value(v).expect("deserialize");
        assert_eq!(back.hash(), "abc");
        assert!(back.into_run().is_some());

        let rec = Record::Artifact(artifact("h1", "a kernel image"));
        let back: Record =
            serde_json::from_value(serde_json::to_value(&rec).expect("ser")).expect("de");
        assert_eq!(back.kind(), "kernel");
    }

    #[test]
    fn display_string_lists_full_system_inputs() {
        let r = run(RunVariant::FullSystem {
            kernel_artifact_id: Uuid::nil(),
            disk_image_artifact_id: Uuid::nil(),
            kernel_path: PathBuf::from("/k/vmlinux-5.4"),
            disk_image_path: PathBuf::from("/d/ubuntu.img"),
        });
        assert_eq!(r.display_string(), "X86 run_exit vmlinux-5.4 ubuntu.img kvm 1");
        assert_eq!(r.to_string(), "X86 run_exit vmlinux-5.4 ubuntu.img kvm 1 -> Created");
    }
}
