use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::TokenStore;

const REFRESH_TIMEOUT: Duration = Duration::from_secs(15);
const EXPIRY_SLACK_SECS: i64 = 60;

/// The sole in-memory copy of the agent's credentials. Only [`AuthManager`]
/// mutates it; everything else reads through the manager's accessors.
#[derive(Debug, Clone)]
pub struct AuthState {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    pub refresh_token: String,
}

impl AuthState {
    fn empty() -> Self {
        Self {
            access_token: String::new(),
            expires_at: Utc::now(),
            refresh_token: String::new(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
    agent_id: Uuid,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
}

pub struct AuthManager {
    state: Mutex<AuthState>,
    store: Arc<dyn TokenStore>,
    http: reqwest::Client,
    auth_url: String,
    agent_id: Uuid,
}

impl AuthManager {
    pub fn new(store: Arc<dyn TokenStore>, auth_url: impl Into<String>, agent_id: Uuid) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(REFRESH_TIMEOUT).build()?;
        Ok(Self {
            state: Mutex::new(AuthState::empty()),
            store,
            http,
            auth_url: auth_url.into(),
            agent_id,
        })
    }

    /// Current bearer token. May be stale by the time it is used; callers
    /// that get a 401 back are expected to call [`refresh`] and retry once.
    pub async fn bearer_token(&self) -> String {
        self.state.lock().await.access_token.clone()
    }

    /// Refresh proactively when the access token is within 60 s of expiry.
    pub async fn ensure_valid(&self) {
        let needs_refresh = {
            let state = self.state.lock().await;
            state.access_token.is_empty()
                || state.expires_at <= Utc::now() + ChronoDuration::seconds(EXPIRY_SLACK_SECS)
        };
        if needs_refresh {
            self.refresh().await;
        }
    }

    /// Exchange the rotating refresh token for a fresh access token.
    /// Never propagates an error: failures are logged and reported as
    /// `false`, leaving `AuthState` untouched so the next poll can either
    /// recover reactively on 401 or report Unhealthy.
    pub async fn refresh(&self) -> bool {
        match self.try_refresh().await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("token refresh failed: {e:#}");
                false
            }
        }
    }

    async fn try_refresh(&self) -> Result<()> {
        let refresh_token = match self.store.load().await {
            Ok(Some(token)) => token,
            Ok(None) => self.state.lock().await.refresh_token.clone(),
            Err(e) => {
                log::warn!("token store read failed, using in-memory token: {e:#}");
                self.state.lock().await.refresh_token.clone()
            }
        };
        anyhow::ensure!(!refresh_token.is_empty(), "no refresh token available");

        let response = self
            .http
            .post(format!("{}/agent/refresh", self.auth_url))
            .json(&RefreshRequest {
                refresh_token: &refresh_token,
                agent_id: self.agent_id,
            })
            .send()
            .await?;

        anyhow::ensure!(
            response.status().is_success(),
            "auth server returned {}",
            response.status()
        );
        let parsed: RefreshResponse = response.json().await?;

        let rotated = parsed.refresh_token.filter(|t| !t.is_empty());
        {
            let mut state = self.state.lock().await;
            state.access_token = parsed.access_token;
            state.expires_at = Utc::now() + ChronoDuration::seconds(parsed.expires_in);
            if let Some(token) = &rotated {
                state.refresh_token = token.clone();
            } else if state.refresh_token.is_empty() {
                state.refresh_token = refresh_token;
            }
        }

        if let Some(token) = rotated {
            if let Err(e) = self.store.save(&token).await {
                log::warn!("persisting rotated refresh token failed: {e:#}");
            }
        }

        Ok(())
    }

    /// Snapshot for diagnostics and tests.
    pub async fn state(&self) -> AuthState {
        self.state.lock().await.clone()
    }
}
