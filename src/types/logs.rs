use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{AgentState, AgentStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Debug,
}

impl LogLevel {
    pub fn as_str(&self) -> &str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// One line of script output. `line` is assigned from a counter shared by
/// the stdout and stderr drains, so it is a total order within a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScriptLogLine {
    pub line: u64,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeployLogBatch {
    pub deployment_id: Uuid,
    pub step_id: i32,
    pub agent_id: Uuid,
    pub logs: Vec<ScriptLogLine>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Successful,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StepResultReport {
    pub deployment_id: Uuid,
    pub agent_id: Uuid,
    pub status: StepStatus,
    pub step_id: i32,
    pub logs: String,
}

/// Point-in-time host report attached to every next-task poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatusEnvelope {
    pub agent_version: String,
    pub status: AgentStatus,
    pub state: AgentState,
    pub cpu_usage_percent: f64,
    pub ram_usage_mb: u64,
    pub total_ram_mb: u64,
    pub disk_total_gb: f64,
    pub disk_free_gb: f64,
    pub agent_uptime: String,
    pub ip_address: String,
    pub operating_system: String,
}
