//! Authenticated control-plane calls. Every request goes out with a fresh
//! client, the current bearer token, and a 30 s timeout; a 401 triggers one
//! reactive refresh and exactly one retry.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::auth::AuthManager;
use crate::types::{AgentTask, DeployLogBatch, StatusEnvelope, StepResultReport};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// What a poll produced. Transport-level failures surface as `Err` instead.
#[derive(Debug)]
pub enum PollResponse {
    Task(AgentTask),
    /// 204: nothing to do; the caller resets the polling interval.
    NoWork,
    /// 409: benign conflict, treated as no work without touching status.
    Conflict,
    /// Any other non-2xx: the caller marks itself Offline.
    ServerError(u16),
}

#[async_trait]
pub trait ControlPlaneApi: Send + Sync {
    async fn next_task(&self, envelope: &StatusEnvelope) -> Result<PollResponse>;
    async fn report_step_started(&self, deployment_id: Uuid, step_order: i32) -> Result<()>;
    async fn post_logs(&self, batch: &DeployLogBatch) -> Result<()>;
    async fn post_step_result(&self, report: &StepResultReport) -> Result<()>;
    async fn set_offline(&self) -> Result<()>;
}

pub struct ControlPlaneClient {
    auth: Arc<AuthManager>,
    agent_api_url: String,
    organization_id: String,
    workspace_id: String,
    agent_id: Uuid,
}

impl ControlPlaneClient {
    pub fn new(
        auth: Arc<AuthManager>,
        agent_api_url: impl Into<String>,
        organization_id: impl Into<String>,
        workspace_id: impl Into<String>,
        agent_id: Uuid,
    ) -> Self {
        Self {
            auth,
            agent_api_url: agent_api_url.into(),
            organization_id: organization_id.into(),
            workspace_id: workspace_id.into(),
            agent_id,
        }
    }

    fn agent_url(&self, suffix: &str) -> String {
        format!(
            "{}/organization/{}/workspaces/{}/agents/{}/{}",
            self.agent_api_url, self.organization_id, self.workspace_id, self.agent_id, suffix
        )
    }

    async fn issue(
        &self,
        method: Method,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("building http client")?;
        // token read and header construction happen in one step, so a
        // concurrent rotation cannot split them
        let token = self.auth.bearer_token().await;
        client
            .request(method, url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .with_context(|| format!("requesting {url}"))
    }

    /// Send with proactive validation and a single retry after a reactive
    /// refresh on 401.
    async fn send(
        &self,
        method: Method,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response> {
        self.auth.ensure_valid().await;
        let response = self.issue(method.clone(), url, body).await?;
        if response.status() == StatusCode::UNAUTHORIZED && self.auth.refresh().await {
            return self.issue(method, url, body).await;
        }
        Ok(response)
    }

    /// 2xx or error, for endpoints with no interesting body.
    async fn send_expect_success(
        &self,
        method: Method,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<()> {
        let response = self.send(method, url, body).await?;
        anyhow::ensure!(
            response.status().is_success(),
            "{url} returned {}",
            response.status()
        );
        Ok(())
    }
}

#[async_trait]
impl ControlPlaneApi for ControlPlaneClient {
    async fn next_task(&self, envelope: &StatusEnvelope) -> Result<PollResponse> {
        let url = self.agent_url("next-task");
        let body = serde_json::to_value(envelope)?;
        let response = self.send(Method::POST, &url, &body).await?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(PollResponse::NoWork),
            StatusCode::CONFLICT => Ok(PollResponse::Conflict),
            status if status.is_success() => {
                let task: AgentTask = response.json().await.context("decoding next-task body")?;
                Ok(PollResponse::Task(task))
            }
            status => Ok(PollResponse::ServerError(status.as_u16())),
        }
    }

    async fn report_step_started(&self, deployment_id: Uuid, step_order: i32) -> Result<()> {
        // historical URL shape: no separator before the deployment id
        let url = self.agent_url(&format!("deployment{deployment_id}/step/{step_order}/started"));
        self.send_expect_success(Method::PUT, &url, &serde_json::Value::Null)
            .await
    }

    async fn post_logs(&self, batch: &DeployLogBatch) -> Result<()> {
        let url = self.agent_url("post-logs");
        self.send_expect_success(Method::POST, &url, &serde_json::to_value(batch)?)
            .await
    }

    async fn post_step_result(&self, report: &StepResultReport) -> Result<()> {
        let url = self.agent_url("step-result");
        self.send_expect_success(Method::POST, &url, &serde_json::to_value(report)?)
            .await
    }

    async fn set_offline(&self) -> Result<()> {
        let url = self.agent_url("set-offline");
        self.send_expect_success(Method::PUT, &url, &serde_json::Value::Null)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::FileTokenStore;

    fn client_for(base: &str) -> ControlPlaneClient {
        let dir = std::env::temp_dir();
        let store = Arc::new(FileTokenStore::new("test", dir));
        let auth = Arc::new(AuthManager::new(store, "http://127.0.0.1:1", Uuid::nil()).unwrap());
        ControlPlaneClient::new(auth, base, "org-42", "ws-main", Uuid::nil())
    }

    #[test]
    fn url_templates_are_bit_exact() {
        let client = client_for("https://api.example.com");
        assert_eq!(
            client.agent_url("next-task"),
            format!(
                "https://api.example.com/organization/org-42/workspaces/ws-main/agents/{}/next-task",
                Uuid::nil()
            )
        );

        let dep = Uuid::nil();
        let started = client.agent_url(&format!("deployment{dep}/step/4/started"));
        assert!(started.ends_with(&format!("agents/{}/deployment{}/step/4/started", Uuid::nil(), dep)));
        assert!(!started.contains("/deployment/"));
    }
}
