use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A unit of work handed out by the control plane. The payload stays opaque
/// until the handler selected by `task_type` decodes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentTask {
    pub id: Uuid,
    #[serde(rename = "Type")]
    pub task_type: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeploymentStepTask {
    pub agent_id: Uuid,
    pub deployment_id: Uuid,
    pub step_order: i32,
    pub environment: String,
    pub release_version: String,
    #[serde(default)]
    pub variables: HashMap<String, VariableValue>,
    #[serde(default)]
    pub step_parameters: Vec<StepParameter>,
    pub script_to_execute: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VariableValue {
    pub value: String,
    #[serde(rename = "Type", default)]
    pub kind: VariableKind,
}

impl VariableValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            kind: VariableKind::Text,
        }
    }

    pub fn is_secret(&self) -> bool {
        self.kind == VariableKind::Secret
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VariableKind {
    #[default]
    Text,
    Secret,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StepParameter {
    pub name: String,
    pub control_type: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub artifact_metadata: Option<ArtifactMetadata>,
}

impl StepParameter {
    pub fn is_artifact(&self) -> bool {
        self.control_type == "SelectArtifact"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ArtifactMetadata {
    pub name: String,
    pub version: String,
    pub url: String,
    #[serde(default)]
    pub base_path: String,
}

/// Retention limits negotiated per environment. Negative values are treated
/// as zero during aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RetentionPolicy {
    pub enabled: bool,
    #[serde(default)]
    pub environment: Option<Uuid>,
    pub retain_deployed_versions: i64,
    pub retain_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CleanupTask {
    #[serde(default)]
    pub retention_policies: Vec<RetentionPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpdateTask {
    pub installer_url: String,
}
