//! Deployment step execution:
//!
//! ```text
//! report-started → download artifacts → resolve + wrap script
//!     → run → final flush → report-finished(Successful|Failed)
//! ```
//!
//! Log lines stream from the runner through a fan-in channel into a pump
//! that batches uploads: a batch goes out once 10 lines are pending or 2
//! seconds have passed since the last attempt, and a failed upload retains
//! the batch for the next attempt so no line is ever dropped.

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use uuid::Uuid;

use crate::client::ControlPlaneApi;
use crate::paths;
use crate::runner::{resolve_variables, ScriptRunner};
use crate::types::{
    DeployLogBatch, DeploymentStepTask, ScriptLogLine, StepResultReport, StepStatus, VariableValue,
};

const FLUSH_MAX_LINES: usize = 10;
const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct DeployConfig {
    pub artifacts_root: PathBuf,
    pub installations_root: PathBuf,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            artifacts_root: paths::default_artifacts_root(),
            installations_root: paths::default_installations_root(),
        }
    }
}

pub struct DeployHandler {
    client: Arc<dyn ControlPlaneApi>,
    http: reqwest::Client,
    config: DeployConfig,
}

impl DeployHandler {
    pub fn new(client: Arc<dyn ControlPlaneApi>, config: DeployConfig) -> Result<Self> {
        // no total timeout: artifact bodies can be arbitrarily large
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("building artifact download client")?;
        Ok(Self {
            client,
            http,
            config,
        })
    }

    /// Run one step to completion and report the outcome. The returned
    /// error (if any) is the step failure, propagated after reporting.
    pub async fn handle(
        &self,
        task: DeploymentStepTask,
        cancel: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut task = task;
        if let Err(e) = self
            .client
            .report_step_started(task.deployment_id, task.step_order)
            .await
        {
            log::warn!("step-started report failed: {e:#}");
        }

        let (outcome, mut lines) = self.execute(&mut task, cancel).await;

        lines.sort_by_key(|l| l.line);
        let transcript = lines
            .iter()
            .map(|l| l.message.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let report = StepResultReport {
            deployment_id: task.deployment_id,
            agent_id: task.agent_id,
            status: if outcome.is_ok() {
                StepStatus::Successful
            } else {
                StepStatus::Failed
            },
            step_id: task.step_order,
            logs: transcript,
        };
        if let Err(e) = self.client.post_step_result(&report).await {
            log::warn!("step-result report failed: {e:#}");
        }

        outcome
    }

    async fn execute(
        &self,
        task: &mut DeploymentStepTask,
        cancel: watch::Receiver<bool>,
    ) -> (Result<()>, Vec<ScriptLogLine>) {
        let mut variables = task.variables.clone();
        if let Err(e) = self.prepare_artifacts(task, &mut variables).await {
            return (Err(e), Vec::new());
        }

        let resolved = resolve_variables(&task.script_to_execute, &variables);
        let wrapped = wrap_script(&resolved);

        let (tx, rx) = mpsc::channel(256);
        let runner = ScriptRunner::new(&self.config.installations_root);
        let pump = LogPump {
            client: self.client.clone(),
            deployment_id: task.deployment_id,
            step_id: task.step_order,
            agent_id: task.agent_id,
        };

        let (run_result, lines) = tokio::join!(
            runner.run(&wrapped, task, &variables, tx, cancel),
            pump.run(rx),
        );
        (run_result.map(|_transcript| ()), lines)
    }

    /// Download every SelectArtifact parameter and rewrite its BasePath to
    /// the local version directory, exposing the four `Kraken.Step.*`
    /// entries for both resolution and the subprocess environment.
    async fn prepare_artifacts(
        &self,
        task: &mut DeploymentStepTask,
        variables: &mut HashMap<String, VariableValue>,
    ) -> Result<()> {
        let agent_id = task.agent_id;
        for param in &mut task.step_parameters {
            if !param.is_artifact() {
                continue;
            }
            let meta = param
                .artifact_metadata
                .as_mut()
                .ok_or_else(|| anyhow!("SelectArtifact parameter {} has no metadata", param.name))?;

            let dir = paths::artifact_version_dir(
                &self.config.artifacts_root,
                agent_id,
                &meta.name,
                &meta.version,
            );
            self.download_artifact(&meta.url, &dir).await?;
            meta.base_path = dir.display().to_string();

            for (suffix, value) in [
                ("Name", meta.name.clone()),
                ("Version", meta.version.clone()),
                ("Url", meta.url.clone()),
                ("BasePath", meta.base_path.clone()),
            ] {
                variables.insert(
                    format!("Kraken.Step.{}.{suffix}", param.name),
                    VariableValue::text(value),
                );
            }
        }
        Ok(())
    }

    async fn download_artifact(&self, url: &str, dir: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        let response = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("downloading artifact {url}"))?;
        anyhow::ensure!(
            response.status().is_success(),
            "artifact download {url} returned {}",
            response.status()
        );

        let filename = response_filename(&response, url)?;
        let target = dir.join(&filename);
        if target.exists() {
            log::debug!("artifact {} already present, skipping", target.display());
            return Ok(target);
        }

        super::stream_to_file(response, &target).await?;
        log::info!("downloaded artifact {}", target.display());
        Ok(target)
    }
}

/// File name from `Content-Disposition`, falling back to the URL's last
/// path segment.
fn response_filename(response: &reqwest::Response, url: &str) -> Result<String> {
    if let Some(disposition) = response
        .headers()
        .get(reqwest::header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(name) = parse_disposition_filename(disposition) {
            return Ok(name);
        }
    }
    url_filename(url).ok_or_else(|| anyhow!("cannot derive a file name from {url}"))
}

fn parse_disposition_filename(disposition: &str) -> Option<String> {
    let part = disposition
        .split(';')
        .map(str::trim)
        .find(|p| p.to_ascii_lowercase().starts_with("filename="))?;
    let value = part.splitn(2, '=').nth(1)?.trim().trim_matches('"');
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn url_filename(url: &str) -> Option<String> {
    let without_query = url.split(['?', '#']).next()?;
    let segment = without_query.rsplit('/').next()?;
    if segment.is_empty() || segment.contains(':') {
        None
    } else {
        Some(segment.to_string())
    }
}

#[cfg(unix)]
fn wrap_script(body: &str) -> String {
    format!("#!/bin/bash\nset -euo pipefail\n( {body} )")
}

#[cfg(windows)]
fn wrap_script(body: &str) -> String {
    format!(
        "$ErrorActionPreference = \"Stop\"\ntry {{ {body} }} catch {{ Write-Host 'ERROR: ' + $_.Exception.Message; exit 1 }}\nexit 0"
    )
}

/// Consumes runner lines, owns the batching policy, and returns every line
/// seen for the final step-result transcript.
struct LogPump {
    client: Arc<dyn ControlPlaneApi>,
    deployment_id: Uuid,
    step_id: i32,
    agent_id: Uuid,
}

impl LogPump {
    async fn run(self, mut rx: mpsc::Receiver<ScriptLogLine>) -> Vec<ScriptLogLine> {
        let mut all = Vec::new();
        let mut buffer: Vec<ScriptLogLine> = Vec::new();
        let mut last_attempt = Instant::now();

        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(line) => {
                        all.push(line.clone());
                        buffer.push(line);
                        if buffer.len() >= FLUSH_MAX_LINES
                            || last_attempt.elapsed() >= FLUSH_INTERVAL
                        {
                            self.flush(&mut buffer).await;
                            last_attempt = Instant::now();
                        }
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(last_attempt + FLUSH_INTERVAL),
                    if !buffer.is_empty() =>
                {
                    self.flush(&mut buffer).await;
                    last_attempt = Instant::now();
                }
            }
        }

        // final flush on both success and failure paths
        if !buffer.is_empty() {
            self.flush(&mut buffer).await;
        }
        all
    }

    async fn flush(&self, buffer: &mut Vec<ScriptLogLine>) {
        let batch = DeployLogBatch {
            deployment_id: self.deployment_id,
            step_id: self.step_id,
            agent_id: self.agent_id,
            logs: buffer.clone(),
        };
        match self.client.post_logs(&batch).await {
            Ok(()) => buffer.clear(),
            Err(e) => {
                log::warn!("log upload failed, retaining {} lines: {e:#}", buffer.len());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::PollResponse;
    use crate::types::{LogLevel, StatusEnvelope};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingControlPlane {
        batches: StdMutex<Vec<usize>>,
        fail_uploads: StdMutex<bool>,
    }

    #[async_trait]
    impl ControlPlaneApi for RecordingControlPlane {
        async fn next_task(&self, _envelope: &StatusEnvelope) -> Result<PollResponse> {
            Ok(PollResponse::NoWork)
        }

        async fn report_step_started(&self, _deployment_id: Uuid, _step: i32) -> Result<()> {
            Ok(())
        }

        async fn post_logs(&self, batch: &DeployLogBatch) -> Result<()> {
            if *self.fail_uploads.lock().unwrap() {
                anyhow::bail!("upload rejected");
            }
            self.batches.lock().unwrap().push(batch.logs.len());
            Ok(())
        }

        async fn post_step_result(&self, _report: &StepResultReport) -> Result<()> {
            Ok(())
        }

        async fn set_offline(&self) -> Result<()> {
            Ok(())
        }
    }

    fn line(n: u64) -> ScriptLogLine {
        ScriptLogLine {
            line: n,
            timestamp: chrono::Utc::now(),
            level: LogLevel::Info,
            message: format!("line {n}"),
        }
    }

    fn pump_for(client: Arc<RecordingControlPlane>) -> LogPump {
        LogPump {
            client,
            deployment_id: Uuid::new_v4(),
            step_id: 1,
            agent_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn twenty_five_fast_lines_produce_three_batches() {
        let client = Arc::new(RecordingControlPlane::default());
        let pump = pump_for(client.clone());

        let (tx, rx) = mpsc::channel(64);
        for n in 1..=25 {
            tx.send(line(n)).await.unwrap();
        }
        drop(tx);

        let all = pump.run(rx).await;
        assert_eq!(all.len(), 25);
        assert_eq!(*client.batches.lock().unwrap(), vec![10, 10, 5]);
    }

    #[tokio::test]
    async fn failed_uploads_retain_the_buffer() {
        let client = Arc::new(RecordingControlPlane::default());
        *client.fail_uploads.lock().unwrap() = true;
        let pump = pump_for(client.clone());

        let (tx, rx) = mpsc::channel(64);
        let feeder = async {
            for n in 1..=12 {
                tx.send(line(n)).await.unwrap();
            }
            // let the first (failing) flush happen, then allow the retry
            tokio::time::sleep(Duration::from_millis(50)).await;
            *client.fail_uploads.lock().unwrap() = false;
            drop(tx);
        };
        let (_, all) = tokio::join!(feeder, pump.run(rx));

        assert_eq!(all.len(), 12);
        // everything arrives in the single successful final flush
        assert_eq!(*client.batches.lock().unwrap(), vec![12]);
    }

    #[test]
    fn disposition_filename_parsing() {
        assert_eq!(
            parse_disposition_filename("attachment; filename=\"myapp-1.2.3.tar.gz\""),
            Some("myapp-1.2.3.tar.gz".to_string())
        );
        assert_eq!(
            parse_disposition_filename("attachment; filename=plain.zip"),
            Some("plain.zip".to_string())
        );
        assert_eq!(parse_disposition_filename("inline"), None);
    }

    #[test]
    fn url_filename_fallback() {
        assert_eq!(
            url_filename("https://x.example/files/app.tar.gz?sig=abc"),
            Some("app.tar.gz".to_string())
        );
        assert_eq!(url_filename("https://x.example/"), None);
    }

    #[cfg(unix)]
    #[test]
    fn wrapped_script_fails_fast() {
        let wrapped = wrap_script("echo hi");
        assert!(wrapped.starts_with("#!/bin/bash\nset -euo pipefail\n"));
        assert!(wrapped.contains("( echo hi )"));
    }
}
