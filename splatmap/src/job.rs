//! External reconstruction and training jobs.
//!
//! Both engines are opaque: they receive a dataset directory and typed
//! parameters and hand back the path of the artifact they produced. Every
//! process is spawned with `kill_on_drop`, bounded by a deadline and
//! cancellable, so no child outlives the attempt that started it.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{id_type, CancelToken};
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{MatcherMode, PipelineConfig};
use crate::dataset::{DatasetId, IMAGES_DIR, SPARSE_DIR, SPLAT_FILE};

/// Stderr lines kept for an error report.
const STDERR_TAIL_LINES: usize = 20;
const STDERR_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum JobError {
    #[error("'{program}' did not finish within {}s", .timeout.as_secs())]
    Timeout { program: String, timeout: Duration },

    #[error("'{program}' was cancelled")]
    Cancelled { program: String },

    #[error("Failed to run '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("'{program}' exited with {status}: {stderr}")]
    Exit {
        program: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("Failed to prepare '{}': {source}", .path.display())]
    Workspace {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Job finished but produced no artifact at '{}'", .0.display())]
    MissingArtifact(PathBuf),
}

pub type JobResult<T> = std::result::Result<T, JobError>;

// === Job records ===

id_type!(RunId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobKind {
    Reconstruction,
    Training,
}

/// Typed parameters handed to the external engines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParams {
    pub max_features: u32,
    pub matcher_mode: MatcherMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vocab_tree_path: Option<PathBuf>,
    pub training_iterations: u32,
}

impl From<&PipelineConfig> for JobParams {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            max_features: config.max_features,
            matcher_mode: config.matcher_mode,
            vocab_tree_path: config.vocab_tree_path.clone(),
            training_iterations: config.training_iterations,
        }
    }
}

/// The artifact path exists exactly when the run succeeded.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Succeeded { artifact: PathBuf },
    Failed { error: String },
}

/// One invocation of an external engine against a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconstructionRun {
    pub id: RunId,
    pub kind: JobKind,
    pub dataset: DatasetId,
    pub params: JobParams,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ReconstructionRun {
    pub fn new(kind: JobKind, dataset: DatasetId, params: JobParams) -> Self {
        Self {
            id: RunId::unique(),
            kind,
            dataset,
            params,
            status: RunStatus::Pending,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn start(&mut self) {
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn finish(&mut self, result: &JobResult<PathBuf>) {
        self.status = match result {
            Ok(artifact) => RunStatus::Succeeded {
                artifact: artifact.clone(),
            },
            Err(err) => RunStatus::Failed {
                error: err.to_string(),
            },
        };
        self.finished_at = Some(Utc::now());
    }

    pub fn artifact(&self) -> Option<&Path> {
        match &self.status {
            RunStatus::Succeeded { artifact } => Some(artifact),
            _ => None,
        }
    }
}

// === Engines ===

/// Everything an engine needs for one run.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub dataset_dir: PathBuf,
    pub params: JobParams,
    pub timeout: Duration,
    pub cancel: CancelToken,
}

pub type JobFuture<'a> = Pin<Box<dyn Future<Output = JobResult<PathBuf>> + Send + 'a>>;

/// Derives camera poses and a sparse model from `<dataset>/images`.
/// Resolves to the directory of the text sparse model.
pub trait ReconstructionEngine: Send + Sync {
    fn reconstruct(&self, request: JobRequest) -> JobFuture<'_>;
}

/// Trains a splat from a reconstructed dataset. Resolves to the splat file.
pub trait SplatTrainer: Send + Sync {
    fn train(&self, request: JobRequest) -> JobFuture<'_>;
}

#[derive(Debug, Clone)]
pub struct ColmapEngine {
    binary: PathBuf,
}

impl ColmapEngine {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self, subcommand: &str) -> Command {
        let mut command = Command::new(&self.binary);
        command.arg(subcommand);
        command
    }

    async fn run(&self, request: JobRequest) -> JobResult<PathBuf> {
        let deadline = Instant::now() + request.timeout;
        let dataset = &request.dataset_dir;
        let database = dataset.join("database.db");
        let images = dataset.join(IMAGES_DIR);
        let sparse = dataset.join(SPARSE_DIR);
        let model = sparse.join("0");

        tokio::fs::create_dir_all(&sparse)
            .await
            .map_err(|source| JobError::Workspace {
                path: sparse.clone(),
                source,
            })?;

        let mut extract = self.command("feature_extractor");
        extract
            .arg("--database_path")
            .arg(&database)
            .arg("--image_path")
            .arg(&images)
            .arg("--SiftExtraction.max_num_features")
            .arg(request.params.max_features.to_string());
        run_until(extract, deadline, &request.cancel).await?;

        let mut matcher = match request.params.matcher_mode {
            MatcherMode::Exhaustive => self.command("exhaustive_matcher"),
            MatcherMode::Sequential => self.command("sequential_matcher"),
            MatcherMode::VocabTree => {
                let mut command = self.command("vocab_tree_matcher");
                if let Some(tree) = &request.params.vocab_tree_path {
                    command.arg("--VocabTreeMatching.vocab_tree_path").arg(tree);
                }
                command
            }
        };
        matcher.arg("--database_path").arg(&database);
        run_until(matcher, deadline, &request.cancel).await?;

        let mut mapper = self.command("mapper");
        mapper
            .arg("--database_path")
            .arg(&database)
            .arg("--image_path")
            .arg(&images)
            .arg("--output_path")
            .arg(&sparse);
        run_until(mapper, deadline, &request.cancel).await?;

        if !model.is_dir() {
            return Err(JobError::MissingArtifact(model));
        }

        let mut convert = self.command("model_converter");
        convert
            .arg("--input_path")
            .arg(&model)
            .arg("--output_path")
            .arg(&model)
            .arg("--output_type")
            .arg("TXT");
        run_until(convert, deadline, &request.cancel).await?;

        if !model.join("images.txt").is_file() {
            return Err(JobError::MissingArtifact(model.join("images.txt")));
        }

        Ok(model)
    }
}

impl ReconstructionEngine for ColmapEngine {
    fn reconstruct(&self, request: JobRequest) -> JobFuture<'_> {
        Box::pin(self.run(request))
    }
}

#[derive(Debug, Clone)]
pub struct OpenSplatTrainer {
    binary: PathBuf,
}

impl OpenSplatTrainer {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, request: JobRequest) -> JobResult<PathBuf> {
        let output = request.dataset_dir.join(SPLAT_FILE);

        let mut command = Command::new(&self.binary);
        command
            .arg(&request.dataset_dir)
            .arg("-n")
            .arg(request.params.training_iterations.to_string())
            .arg("-o")
            .arg(&output);
        run_command(command, request.timeout, &request.cancel).await?;

        if !output.is_file() {
            return Err(JobError::MissingArtifact(output));
        }
        Ok(output)
    }
}

impl SplatTrainer for OpenSplatTrainer {
    fn train(&self, request: JobRequest) -> JobFuture<'_> {
        Box::pin(self.run(request))
    }
}

// === Process runner ===

enum Finished {
    Exited(io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

async fn run_until(command: Command, deadline: Instant, cancel: &CancelToken) -> JobResult<()> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    run_command(command, remaining, cancel).await
}

/// Runs `command` to completion. On timeout or cancellation the child is
/// killed and reaped before returning.
pub async fn run_command(
    mut command: Command,
    timeout: Duration,
    cancel: &CancelToken,
) -> JobResult<()> {
    let program = describe(&command);
    debug!("Running {program}");

    if cancel.is_cancelled() {
        return Err(JobError::Cancelled { program });
    }

    command
        .kill_on_drop(true)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    let mut child = command.spawn().map_err(|source| JobError::Spawn {
        program: program.clone(),
        source,
    })?;

    let stderr = child.stderr.take();
    let mut stderr_task = tokio::spawn(async move {
        let mut bytes = Vec::new();
        if let Some(mut stderr) = stderr {
            // the text is diagnostics only; a read failure just truncates it
            let _ = stderr.read_to_end(&mut bytes).await;
        }
        String::from_utf8_lossy(&bytes).into_owned()
    });

    let finished = tokio::select! {
        status = child.wait() => Finished::Exited(status),
        _ = tokio::time::sleep(timeout) => Finished::TimedOut,
        _ = cancel.cancelled() => Finished::Cancelled,
    };

    let status = match finished {
        Finished::Exited(status) => status.map_err(|source| JobError::Spawn {
            program: program.clone(),
            source,
        })?,
        Finished::TimedOut => {
            kill(&mut child, &program).await;
            stderr_task.abort();
            return Err(JobError::Timeout { program, timeout });
        }
        Finished::Cancelled => {
            kill(&mut child, &program).await;
            stderr_task.abort();
            return Err(JobError::Cancelled { program });
        }
    };

    // a grandchild may still hold the pipe open after the tool exited
    let stderr = match tokio::time::timeout(STDERR_GRACE, &mut stderr_task).await {
        Ok(text) => text.unwrap_or_default(),
        Err(_) => {
            debug!("{program} exited with stderr still open");
            stderr_task.abort();
            String::new()
        }
    };
    if !status.success() {
        return Err(JobError::Exit {
            program,
            status,
            stderr: tail(&stderr, STDERR_TAIL_LINES),
        });
    }

    info!("Finished {program}");
    Ok(())
}

async fn kill(child: &mut tokio::process::Child, program: &str) {
    if let Err(err) = child.kill().await {
        warn!("Failed to kill {program}: {err}");
    }
}

fn describe(command: &Command) -> String {
    let std = command.as_std();
    std::iter::once(std.get_program())
        .chain(std.get_args())
        .map(|part| part.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        command
    }

    #[tokio::test]
    async fn successful_command() -> anyhow::Result<()> {
        run_command(shell("exit 0"), Duration::from_secs(5), &CancelToken::new()).await?;
        Ok(())
    }

    #[tokio::test]
    async fn failing_command_reports_stderr() {
        let result = run_command(
            shell("echo first >&2; echo boom >&2; exit 3"),
            Duration::from_secs(5),
            &CancelToken::new(),
        )
        .await;

        match result {
            Err(JobError::Exit { status, stderr, .. }) => {
                assert_eq!(status.code(), Some(3));
                assert!(stderr.ends_with("boom"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_utf8_stderr_is_kept_lossily() {
        let result = run_command(
            shell("printf 'bad \\377 byte\\n' >&2; exit 2"),
            Duration::from_secs(5),
            &CancelToken::new(),
        )
        .await;

        match result {
            Err(JobError::Exit { stderr, .. }) => {
                assert!(stderr.starts_with("bad "));
                assert!(stderr.ends_with(" byte"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn lingering_grandchild_does_not_hold_the_job() -> anyhow::Result<()> {
        let started = std::time::Instant::now();
        run_command(
            shell("sleep 30 >&2 & exit 0"),
            Duration::from_secs(20),
            &CancelToken::new(),
        )
        .await?;

        assert!(started.elapsed() < Duration::from_secs(10));
        Ok(())
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let started = std::time::Instant::now();
        let result = run_command(
            shell("sleep 30"),
            Duration::from_millis(100),
            &CancelToken::new(),
        )
        .await;

        assert!(matches!(result, Err(JobError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancel_stops_the_child() {
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = run_command(shell("sleep 30"), Duration::from_secs(20), &cancel).await;
        assert!(matches!(result, Err(JobError::Cancelled { .. })));
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_error() {
        let result = run_command(
            Command::new("/definitely/not/a/binary"),
            Duration::from_secs(1),
            &CancelToken::new(),
        )
        .await;
        assert!(matches!(result, Err(JobError::Spawn { .. })));
    }

    #[tokio::test]
    async fn trainer_without_output_is_missing_artifact() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let trainer = OpenSplatTrainer::new("true");
        let request = JobRequest {
            dataset_dir: dir.path().to_path_buf(),
            params: JobParams::from(&PipelineConfig::default()),
            timeout: Duration::from_secs(5),
            cancel: CancelToken::new(),
        };

        let result = trainer.train(request).await;
        assert!(matches!(result, Err(JobError::MissingArtifact(_))));
        Ok(())
    }

    #[test]
    fn run_records_artifact_only_on_success() {
        let params = JobParams::from(&PipelineConfig::default());
        let mut run = ReconstructionRun::new(JobKind::Reconstruction, DatasetId::unique(), params);
        assert_eq!(run.status, RunStatus::Pending);

        run.start();
        assert_eq!(run.status, RunStatus::Running);
        run.finish(&Err(JobError::MissingArtifact(PathBuf::from("sparse/0"))));
        assert!(run.artifact().is_none());

        run.finish(&Ok(PathBuf::from("sparse/0")));
        assert_eq!(run.artifact(), Some(Path::new("sparse/0")));
    }
}
