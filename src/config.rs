use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use uuid::Uuid;

/// Identity assigned by the installer at registration time. Immutable for
/// the lifetime of the process.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentIdentity {
    pub id: Uuid,
    pub workspace_id: String,
    pub organization_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Endpoint {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(rename = "Agent")]
    pub agent: AgentIdentity,
    #[serde(rename = "AgentApi")]
    pub agent_api: Endpoint,
    #[serde(rename = "Auth")]
    pub auth: Endpoint,
}

/// Partial settings used for `agentsettings.<env>.json` overlays. Any
/// section present in the overlay replaces the base section wholesale.
#[derive(Debug, Default, Deserialize)]
struct SettingsOverlay {
    #[serde(rename = "Agent")]
    agent: Option<AgentIdentity>,
    #[serde(rename = "AgentApi")]
    agent_api: Option<Endpoint>,
    #[serde(rename = "Auth")]
    auth: Option<Endpoint>,
}

impl Settings {
    /// Load `agentsettings.json` from `dir`, then layer the optional
    /// `agentsettings.<env>.json` overlay on top. A missing or unparseable
    /// base file is fatal: an agent without registration cannot poll.
    pub fn load(dir: &Path, overlay_env: Option<&str>) -> Result<Self> {
        let base_path = dir.join("agentsettings.json");
        let raw = std::fs::read_to_string(&base_path)
            .with_context(|| format!("reading {}", base_path.display()))?;
        let mut settings: Settings = serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", base_path.display()))?;

        if let Some(env) = overlay_env {
            let overlay_path = dir.join(format!("agentsettings.{env}.json"));
            if overlay_path.exists() {
                let raw = std::fs::read_to_string(&overlay_path)
                    .with_context(|| format!("reading {}", overlay_path.display()))?;
                let overlay: SettingsOverlay = serde_json::from_str(&raw)
                    .with_context(|| format!("parsing {}", overlay_path.display()))?;
                settings.apply(overlay);
            } else {
                log::warn!("settings overlay {} not found, ignoring", overlay_path.display());
            }
        }

        settings.agent_api.url = trim_base_url(&settings.agent_api.url);
        settings.auth.url = trim_base_url(&settings.auth.url);
        Ok(settings)
    }

    fn apply(&mut self, overlay: SettingsOverlay) {
        if let Some(agent) = overlay.agent {
            self.agent = agent;
        }
        if let Some(agent_api) = overlay.agent_api {
            self.agent_api = agent_api;
        }
        if let Some(auth) = overlay.auth {
            self.auth = auth;
        }
    }
}

fn trim_base_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, body: &str) {
        std::fs::write(dir.join(name), body).unwrap();
    }

    const BASE: &str = r#"{
        "Agent": {
            "Id": "7b6e8b54-3a3e-4a56-9c1a-2a64d31a9f55",
            "WorkspaceId": "ws-main",
            "OrganizationId": "org-42"
        },
        "AgentApi": { "Url": "https://agents.example.com/" },
        "Auth": { "Url": "https://auth.example.com" }
    }"#;

    #[test]
    fn loads_base_settings_and_trims_trailing_slash() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "agentsettings.json", BASE);

        let settings = Settings::load(dir.path(), None).unwrap();
        assert_eq!(settings.agent.workspace_id, "ws-main");
        assert_eq!(settings.agent_api.url, "https://agents.example.com");
        assert_eq!(settings.auth.url, "https://auth.example.com");
    }

    #[test]
    fn overlay_replaces_present_sections_only() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "agentsettings.json", BASE);
        write(
            dir.path(),
            "agentsettings.staging.json",
            r#"{ "AgentApi": { "Url": "https://staging.example.com/" } }"#,
        );

        let settings = Settings::load(dir.path(), Some("staging")).unwrap();
        assert_eq!(settings.agent_api.url, "https://staging.example.com");
        assert_eq!(settings.auth.url, "https://auth.example.com");
        assert_eq!(settings.agent.organization_id, "org-42");
    }

    #[test]
    fn missing_overlay_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "agentsettings.json", BASE);
        assert!(Settings::load(dir.path(), Some("nope")).is_ok());
    }

    #[test]
    fn missing_base_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Settings::load(dir.path(), None).is_err());
    }
}
