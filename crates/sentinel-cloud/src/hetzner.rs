use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{CloudError, CloudProvider, CloudResult};
use sentinel_proto::{InstanceStatus, VmEvent, VmEventKind};

const EVENT_POLL_INTERVAL_SECS: u64 = 15;

/// Hetzner Cloud adapter. Hetzner has no GCP-style "spot" tier, but a host
/// can still be force-stopped by the provider; a `stop_server` action whose
/// error detail mentions "preempt" is surfaced as `preempted`, any other
/// `stop_server` as a plain `stopped`.
#[derive(Debug, Clone)]
pub struct HetznerProvider {
    api_token: String,
    server_id: u64,
    base_url: String,
    client: reqwest::Client,
}

impl HetznerProvider {
    pub fn new(api_token: String, server_id: u64) -> Self {
        Self {
            api_token,
            server_id,
            base_url: "https://api.hetzner.cloud/v1".to_string(),
            client: build_client(),
        }
    }

    /// Point at a non-default API base URL — used by integration tests that
    /// run against a local mock server.
    pub fn with_base_url(api_token: String, server_id: u64, base_url: String) -> Self {
        Self {
            api_token,
            server_id,
            base_url,
            client: build_client(),
        }
    }

    async fn fetch_server(&self) -> CloudResult<serde_json::Value> {
        let url = format!("{}/servers/{}", self.base_url, self.server_id);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.api_token)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(CloudError::Api(format!(
                "GET {} returned {}",
                url,
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| CloudError::Decode(e.to_string()))
    }

    async fn fetch_actions(&self, since: Option<DateTime<Utc>>) -> CloudResult<Vec<serde_json::Value>> {
        let url = format!(
            "{}/actions?sort=id:desc&page=1&per_page=25",
            self.base_url
        );
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.api_token)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(CloudError::Api(format!(
                "GET {} returned {}",
                url,
                resp.status()
            )));
        }
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CloudError::Decode(e.to_string()))?;
        let actions = body["actions"].as_array().cloned().unwrap_or_default();
        let server_id = self.server_id;
        Ok(actions
            .into_iter()
            .filter(|a| {
                let targets_server = a["resources"]
                    .as_array()
                    .map(|resources| {
                        resources.iter().any(|r| {
                            r["type"] == "server" && r["id"].as_u64() == Some(server_id)
                        })
                    })
                    .unwrap_or(false);
                let completed = a["status"] == "success" || a["status"] == "error";
                let command = a["command"].as_str().unwrap_or("");
                let relevant = matches!(command, "stop_server" | "start_server" | "delete_server" | "create_server");
                targets_server && completed && relevant
            })
            .filter(|a| match (since, parse_action_time(a)) {
                (Some(since), Some(t)) => t > since,
                _ => true,
            })
            .collect())
    }
}

fn parse_action_time(action: &serde_json::Value) -> Option<DateTime<Utc>> {
    action["finished"]
        .as_str()
        .or_else(|| action["started"].as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn classify_action(action: &serde_json::Value) -> Option<(VmEventKind, String)> {
    let command = action["command"].as_str().unwrap_or("");
    let error_message = action["error"]["message"].as_str().unwrap_or("");
    let detail = format!("command={command} error={error_message}");
    let kind = match command {
        "stop_server" => {
            if detail.to_lowercase().contains("preempt") {
                VmEventKind::Preempted
            } else {
                VmEventKind::Stopped
            }
        }
        "delete_server" => VmEventKind::Terminated,
        "start_server" => VmEventKind::Started,
        "create_server" => VmEventKind::Provisioning,
        _ => return None,
    };
    Some((kind, detail))
}

fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()
        .expect("failed to build reqwest client")
}

#[async_trait]
impl CloudProvider for HetznerProvider {
    fn name(&self) -> &str {
        "hetzner"
    }

    async fn get_instance_status(&self) -> CloudResult<InstanceStatus> {
        let body = self.fetch_server().await?;
        let status = body["server"]["status"].as_str().unwrap_or("unknown");
        Ok(match status {
            "running" => InstanceStatus::Running,
            "off" => InstanceStatus::Stopped,
            "deleting" => InstanceStatus::Terminated,
            "initializing" | "starting" | "migrating" | "rebuilding" => InstanceStatus::Provisioning,
            other => {
                debug!(status = other, "unrecognized Hetzner server status");
                InstanceStatus::Unknown
            }
        })
    }

    async fn get_instance_ip(&self) -> CloudResult<String> {
        let body = self.fetch_server().await?;
        body["server"]["private_net"]
            .as_array()
            .and_then(|nets| nets.first())
            .and_then(|net| net["ip"].as_str())
            .map(|ip| ip.to_string())
            .ok_or_else(|| CloudError::Decode("server has no private_net entry".to_string()))
    }

    async fn start_instance(&self) -> CloudResult<()> {
        let url = format!(
            "{}/servers/{}/actions/poweron",
            self.base_url, self.server_id
        );
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_token)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(CloudError::Api(format!(
                "POST {} returned {}",
                url,
                resp.status()
            )));
        }
        Ok(())
    }

    fn supports_events(&self) -> bool {
        true
    }

    async fn watch_events(
        &self,
        sink: mpsc::Sender<VmEvent>,
        cancel: CancellationToken,
    ) -> CloudResult<()> {
        let mut last_seen: Option<DateTime<Utc>> = None;
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(EVENT_POLL_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("event watcher cancelled");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    match self.fetch_actions(last_seen).await {
                        Ok(mut actions) => {
                            actions.sort_by_key(|a| parse_action_time(a).unwrap_or(DateTime::<Utc>::MIN_UTC));
                            for action in actions {
                                let Some(timestamp) = parse_action_time(&action) else { continue };
                                if let Some((kind, detail)) = classify_action(&action) {
                                    if sink
                                        .send(VmEvent { kind, timestamp, detail })
                                        .await
                                        .is_err()
                                    {
                                        return Ok(());
                                    }
                                }
                                last_seen = Some(last_seen.map_or(timestamp, |prev| prev.max(timestamp)));
                            }
                        }
                        Err(e) => warn!(error = %e, "failed to poll Hetzner action log"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_stop_with_preempt_detail_is_preempted() {
        let action = serde_json::json!({
            "command": "stop_server",
            "error": { "message": "server preempted by provider" }
        });
        let (kind, _) = classify_action(&action).unwrap();
        assert_eq!(kind, VmEventKind::Preempted);
    }

    #[test]
    fn classify_plain_stop_is_stopped() {
        let action = serde_json::json!({ "command": "stop_server", "error": serde_json::Value::Null });
        let (kind, _) = classify_action(&action).unwrap();
        assert_eq!(kind, VmEventKind::Stopped);
    }

    #[test]
    fn classify_stop_with_maintenance_detail_but_no_preempt_substring_is_stopped() {
        let action = serde_json::json!({
            "command": "stop_server",
            "error": { "message": "scheduled outage window, evacuating server" }
        });
        let (kind, _) = classify_action(&action).unwrap();
        assert_eq!(kind, VmEventKind::Stopped);
    }

    #[test]
    fn classify_delete_is_terminated() {
        let action = serde_json::json!({ "command": "delete_server" });
        let (kind, _) = classify_action(&action).unwrap();
        assert_eq!(kind, VmEventKind::Terminated);
    }

    #[test]
    fn classify_unrelated_command_is_none() {
        let action = serde_json::json!({ "command": "attach_iso" });
        assert!(classify_action(&action).is_none());
    }

    #[test]
    fn parse_action_time_prefers_finished_over_started() {
        let action = serde_json::json!({
            "started": "2026-01-01T00:00:00Z",
            "finished": "2026-01-01T00:05:00Z",
        });
        let t = parse_action_time(&action).unwrap();
        assert_eq!(t.to_rfc3339(), "2026-01-01T00:05:00+00:00");
    }
}
