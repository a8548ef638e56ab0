pub mod cleanup;
pub mod deploy;
pub mod update;

pub use cleanup::CleanupHandler;
pub use deploy::DeployHandler;
pub use update::UpdateHandler;

use anyhow::{Context, Result};
use std::path::Path;
use tokio::io::AsyncWriteExt;

/// Stream a response body straight to disk without buffering it whole.
pub(crate) async fn stream_to_file(mut response: reqwest::Response, target: &Path) -> Result<()> {
    let mut file = tokio::fs::File::create(target)
        .await
        .with_context(|| format!("creating {}", target.display()))?;
    while let Some(chunk) = response
        .chunk()
        .await
        .with_context(|| format!("reading body for {}", target.display()))?
    {
        file.write_all(&chunk)
            .await
            .with_context(|| format!("writing {}", target.display()))?;
    }
    file.flush()
        .await
        .with_context(|| format!("flushing {}", target.display()))?;
    Ok(())
}
