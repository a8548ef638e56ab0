//! Self-update: fetch the installer archive, unpack it, hand control to the
//! installer process. Stopping and replacing this agent is the installer's
//! job; the runtime exits its loop right after this handler returns.

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use crate::types::UpdateTask;

#[cfg(unix)]
const INSTALLER_BIN: &str = "kraken-installer";
#[cfg(windows)]
const INSTALLER_BIN: &str = "kraken-installer.exe";

const ARCHIVE_FILE: &str = "installer.zip";

pub struct UpdateHandler {
    http: reqwest::Client,
    workspace_id: String,
    agent_id: Uuid,
}

impl UpdateHandler {
    pub fn new(workspace_id: impl Into<String>, agent_id: Uuid) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("building installer download client")?;
        Ok(Self {
            http,
            workspace_id: workspace_id.into(),
            agent_id,
        })
    }

    pub async fn handle(&self, task: UpdateTask) -> Result<()> {
        let work_dir = std::env::temp_dir().join(format!("kraken-update-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&work_dir)
            .await
            .with_context(|| format!("creating {}", work_dir.display()))?;

        let archive = work_dir.join(ARCHIVE_FILE);
        let response = self
            .http
            .get(&task.installer_url)
            .send()
            .await
            .with_context(|| format!("downloading installer from {}", task.installer_url))?;
        anyhow::ensure!(
            response.status().is_success(),
            "installer download returned {}",
            response.status()
        );
        super::stream_to_file(response, &archive).await?;

        extract_archive(&archive, &work_dir).await?;

        let installer = work_dir.join(INSTALLER_BIN);
        anyhow::ensure!(
            installer.exists(),
            "archive did not contain {INSTALLER_BIN}"
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&installer, std::fs::Permissions::from_mode(0o755))
                .await
                .with_context(|| format!("marking {} executable", installer.display()))?;
        }

        tokio::process::Command::new(&installer)
            .arg("--agentId")
            .arg(self.agent_id.to_string())
            .arg("--workspaceId")
            .arg(&self.workspace_id)
            .arg("--debug")
            .current_dir(&work_dir)
            .spawn()
            .with_context(|| format!("spawning {}", installer.display()))?;

        log::info!("installer spawned from {}, handing over", work_dir.display());
        Ok(())
    }
}

/// Unpack with the platform archiver; the agent itself does not link an
/// archive codec.
#[cfg(unix)]
async fn extract_archive(archive: &Path, dest: &Path) -> Result<()> {
    let status = tokio::process::Command::new("unzip")
        .arg("-o")
        .arg(archive)
        .arg("-d")
        .arg(dest)
        .status()
        .await
        .context("running unzip")?;
    if !status.success() {
        return Err(anyhow!("unzip exited with {status}"));
    }
    Ok(())
}

#[cfg(windows)]
async fn extract_archive(archive: &Path, dest: &Path) -> Result<()> {
    let status = tokio::process::Command::new("powershell")
        .arg("-NoProfile")
        .arg("-Command")
        .arg(format!(
            "Expand-Archive -Force -Path '{}' -DestinationPath '{}'",
            archive.display(),
            dest.display()
        ))
        .status()
        .await
        .context("running Expand-Archive")?;
    if !status.success() {
        return Err(anyhow!("Expand-Archive exited with {status}"));
    }
    Ok(())
}
