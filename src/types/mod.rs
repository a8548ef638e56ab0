pub mod logs;
pub mod task;

pub use logs::{DeployLogBatch, LogLevel, ScriptLogLine, StatusEnvelope, StepResultReport, StepStatus};
pub use task::{
    AgentTask, ArtifactMetadata, CleanupTask, DeploymentStepTask, RetentionPolicy, StepParameter,
    UpdateTask, VariableKind, VariableValue,
};

use serde::{Deserialize, Serialize};

/// Health as reported to the control plane with every poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentStatus {
    Healthy,
    Unhealthy,
    Offline,
    Updating,
}

/// Whether the agent is between tasks or executing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentState {
    Waiting,
    Busy,
}

impl AgentStatus {
    pub fn as_str(&self) -> &str {
        match self {
            AgentStatus::Healthy => "Healthy",
            AgentStatus::Unhealthy => "Unhealthy",
            AgentStatus::Offline => "Offline",
            AgentStatus::Updating => "Updating",
        }
    }
}

impl AgentState {
    pub fn as_str(&self) -> &str {
        match self {
            AgentState::Waiting => "Waiting",
            AgentState::Busy => "Busy",
        }
    }
}
