pub mod variables;

pub use variables::resolve_variables;

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, watch};

use crate::paths;
use crate::types::{DeploymentStepTask, LogLevel, ScriptLogLine, VariableValue};

#[cfg(unix)]
const SCRIPT_FILE: &str = "deploy.sh";
#[cfg(windows)]
const SCRIPT_FILE: &str = "deploy.ps1";

/// Materializes a step script under the installation root, spawns it, and
/// streams classified output lines through a fan-in channel. The stdout and
/// stderr drains share one atomic counter, so `line` numbers form a total
/// order across both streams.
pub struct ScriptRunner {
    installations_root: PathBuf,
}

impl ScriptRunner {
    pub fn new(installations_root: impl Into<PathBuf>) -> Self {
        Self {
            installations_root: installations_root.into(),
        }
    }

    /// Run the script to completion (or cancellation) and return the
    /// transcript ordered by line number. A nonzero exit status is an
    /// error; the exit code itself is not surfaced.
    pub async fn run(
        &self,
        script_body: &str,
        task: &DeploymentStepTask,
        variables: &HashMap<String, VariableValue>,
        lines: mpsc::Sender<ScriptLogLine>,
        cancel: watch::Receiver<bool>,
    ) -> Result<String> {
        let script_path = self.materialize(script_body, task).await?;

        let mut command = build_command(&script_path);
        for (name, value) in variables {
            command.env(name, &value.value);
        }
        for param in &task.step_parameters {
            if let Some(meta) = param.artifact_metadata.as_ref().filter(|_| param.is_artifact()) {
                command.env(format!("Kraken.Step.{}.Name", param.name), &meta.name);
                command.env(format!("Kraken.Step.{}.Version", param.name), &meta.version);
                command.env(format!("Kraken.Step.{}.Url", param.name), &meta.url);
                command.env(format!("Kraken.Step.{}.BasePath", param.name), &meta.base_path);
            } else {
                command.env(format!("Kraken.Step.{}", param.name), &param.value);
            }
        }

        let mut child = command.spawn().context("spawning deploy script")?;
        let stdout = child.stdout.take().context("capturing stdout")?;
        let stderr = child.stderr.take().context("capturing stderr")?;

        let counter = AtomicU64::new(0);
        let transcript: StdMutex<Vec<(u64, String)>> = StdMutex::new(Vec::new());

        // Drains run concurrently with wait() so a chatty script cannot
        // deadlock on a full pipe buffer.
        let status = tokio::select! {
            status = async {
                let (status, _, _) = tokio::join!(
                    child.wait(),
                    drain(stdout, LogLevel::Info, &counter, &lines, &transcript),
                    drain(stderr, LogLevel::Error, &counter, &lines, &transcript),
                );
                status
            } => status.context("waiting for deploy script")?,
            _ = cancelled(cancel) => {
                let _ = child.kill().await;
                anyhow::bail!("step execution cancelled");
            }
        };

        let mut collected = transcript.into_inner().unwrap_or_else(|e| e.into_inner());
        collected.sort_by_key(|(line, _)| *line);
        let text = collected
            .into_iter()
            .map(|(_, message)| message)
            .collect::<Vec<_>>()
            .join("\n");

        anyhow::ensure!(status.success(), "script exited with {status}");
        Ok(text)
    }

    /// Write `deploy.sh`/`deploy.ps1` (UTF-8, no BOM) unless a previous run
    /// already materialized it. Executable on unix.
    async fn materialize(&self, script_body: &str, task: &DeploymentStepTask) -> Result<PathBuf> {
        let dir = paths::step_script_dir(
            &self.installations_root,
            task.agent_id,
            &task.environment,
            &task.release_version,
            task.step_order,
        );
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        let script_path = dir.join(SCRIPT_FILE);
        if !script_path.exists() {
            tokio::fs::write(&script_path, script_body)
                .await
                .with_context(|| format!("writing {}", script_path.display()))?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                tokio::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755))
                    .await
                    .with_context(|| format!("marking {} executable", script_path.display()))?;
            }
        }
        Ok(script_path)
    }
}

#[cfg(unix)]
fn build_command(script_path: &Path) -> tokio::process::Command {
    let mut command = tokio::process::Command::new("bash");
    command
        .arg(script_path)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    command
}

#[cfg(windows)]
fn build_command(script_path: &Path) -> tokio::process::Command {
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    let mut command = tokio::process::Command::new("powershell");
    command
        .arg("-ExecutionPolicy")
        .arg("Bypass")
        .arg("-File")
        .arg(script_path)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .creation_flags(CREATE_NO_WINDOW)
        .kill_on_drop(true);
    command
}

async fn drain<R: AsyncRead + Unpin>(
    stream: R,
    default_level: LogLevel,
    counter: &AtomicU64,
    lines: &mpsc::Sender<ScriptLogLine>,
    transcript: &StdMutex<Vec<(u64, String)>>,
) {
    let mut reader = BufReader::new(stream).lines();
    while let Ok(Some(raw)) = reader.next_line().await {
        let line = ScriptLogLine {
            line: counter.fetch_add(1, Ordering::SeqCst) + 1,
            timestamp: chrono::Utc::now(),
            level: classify_line(&raw, default_level),
            message: raw,
        };
        if let Ok(mut t) = transcript.lock() {
            t.push((line.line, line.message.clone()));
        }
        // a dropped receiver only stops streaming, not the transcript
        let _ = lines.send(line).await;
    }
}

/// Case-insensitive substring classification, first match wins:
/// error|fail → ERROR, warn → WARN, info → INFO, else the stream default.
pub fn classify_line(raw: &str, default_level: LogLevel) -> LogLevel {
    let lower = raw.to_lowercase();
    if lower.contains("error") || lower.contains("fail") {
        LogLevel::Error
    } else if lower.contains("warn") {
        LogLevel::Warn
    } else if lower.contains("info") {
        LogLevel::Info
    } else {
        default_level
    }
}

async fn cancelled(mut cancel: watch::Receiver<bool>) {
    if cancel.wait_for(|c| *c).await.is_err() {
        // sender dropped without firing: cancellation can no longer happen
        std::future::pending::<()>().await;
    }
}
