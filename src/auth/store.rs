//! Rotating refresh-token persistence. The at-rest encoding is a black box
//! behind [`TokenStore`]; the only contract the rest of the agent relies on
//! is `load(save(t)) == t` on the same host.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::path::{Path, PathBuf};

const BLOB_FILE: &str = "refresh.blob";

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn save(&self, token: &str) -> Result<()>;
    async fn load(&self) -> Result<Option<String>>;
}

/// Stores the token under `<root>/refresh.blob`, folded with a pad derived
/// from the platform tag and root path so the file is opaque at rest, and
/// readable only by the owning principal.
pub struct FileTokenStore {
    platform_tag: String,
    root: PathBuf,
}

impl FileTokenStore {
    pub fn new(platform_tag: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            platform_tag: platform_tag.into(),
            root: root.into(),
        }
    }

    pub fn blob_path(&self) -> PathBuf {
        self.root.join(BLOB_FILE)
    }

    fn pad(&self) -> Vec<u8> {
        // FNV-1a over tag + path, expanded into a repeating pad.
        let seed = format!("{}:{}", self.platform_tag, self.root.display());
        let mut h: u64 = 0xcbf2_9ce4_8422_2325;
        let mut pad = Vec::with_capacity(64);
        for b in seed.bytes() {
            h ^= b as u64;
            h = h.wrapping_mul(0x0000_0100_0000_01b3);
        }
        let mut x = h;
        for _ in 0..64 {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            pad.extend_from_slice(&x.to_le_bytes());
        }
        pad
    }

    fn fold(&self, data: &[u8]) -> Vec<u8> {
        let pad = self.pad();
        data.iter()
            .enumerate()
            .map(|(i, b)| b ^ pad[i % pad.len()])
            .collect()
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn save(&self, token: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating {}", self.root.display()))?;
        let blob = BASE64.encode(self.fold(token.as_bytes()));
        let path = self.blob_path();
        tokio::fs::write(&path, blob)
            .await
            .with_context(|| format!("writing {}", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&path, perms)
                .await
                .with_context(|| format!("restricting {}", path.display()))?;
        }

        Ok(())
    }

    async fn load(&self) -> Result<Option<String>> {
        let path = self.blob_path();
        let blob = match tokio::fs::read_to_string(&path).await {
            Ok(blob) => blob,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        let folded = BASE64
            .decode(blob.trim())
            .with_context(|| format!("decoding {}", path.display()))?;
        let token = String::from_utf8(self.fold(&folded))
            .with_context(|| format!("decoding {}", path.display()))?;
        Ok(Some(token))
    }
}
