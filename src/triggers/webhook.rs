//! Webhook WebSocket trigger: one long-lived socket per workflow.
//!
//! The connection manager owns every socket and tears them down when a
//! workflow no longer qualifies for one. A socket reconnects with a fixed
//! 2s backoff; incoming messages are matched against the workflow's enabled
//! webhook triggers and deduped per trigger.

use crate::triggers::TriggerFire;
use crate::workflow::manager::WorkflowManager;
use crate::workflow::runner::StartContext;
use crate::workflow::schema::{now_ms, TriggerConfig, WebhookWsConfig, Workflow};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

/// Fixed reconnect backoff after a close or error.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Endpoint placeholder shown in fresh settings; never connected to.
const PLACEHOLDER_ENDPOINT: &str = "wss://your-server.com/ws";

struct SocketHandle {
    endpoint: String,
    task: tokio::task::JoinHandle<()>,
}

/// Owns the webhook sockets, keyed by workflow id.
pub struct ConnectionManager {
    manager: Arc<WorkflowManager>,
    fire: Arc<TriggerFire>,
    sockets: Mutex<HashMap<String, SocketHandle>>,
}

impl ConnectionManager {
    pub fn new(manager: Arc<WorkflowManager>, fire: Arc<TriggerFire>) -> Self {
        Self {
            manager,
            fire,
            sockets: Mutex::new(HashMap::new()),
        }
    }

    /// Does this workflow qualify for a socket right now?
    pub fn should_connect(workflow: &Workflow) -> bool {
        let endpoint = workflow
            .settings
            .ws_endpoint
            .as_deref()
            .unwrap_or("")
            .trim();
        if endpoint.is_empty() || endpoint == PLACEHOLDER_ENDPOINT {
            return false;
        }
        let has_ws_trigger = workflow
            .triggers
            .iter()
            .any(|t| t.enabled && matches!(t.config, TriggerConfig::WebhookWs(_)));
        let requested = workflow.settings.ws_connect_requested;
        (has_ws_trigger || requested) && (workflow.is_active() || requested)
    }

    /// Reconcile one workflow's socket with its current settings.
    pub fn sync(&self, workflow: &Workflow) {
        let endpoint = workflow
            .settings
            .ws_endpoint
            .as_deref()
            .unwrap_or("")
            .trim()
            .to_string();

        let mut sockets = self.sockets.lock();
        let existing = sockets.get(&workflow.id);

        if !Self::should_connect(workflow) {
            if let Some(handle) = sockets.remove(&workflow.id) {
                handle.task.abort();
                self.manager.set_ws_connected(&workflow.id, false);
                tracing::info!(workflow = %workflow.id, "webhook socket closed");
            }
            return;
        }

        let stale = match existing {
            Some(handle) => handle.endpoint != endpoint || handle.task.is_finished(),
            None => true,
        };
        if !stale {
            return;
        }

        if let Some(handle) = sockets.remove(&workflow.id) {
            handle.task.abort();
        }

        let task = tokio::spawn(socket_loop(
            workflow.id.clone(),
            endpoint.clone(),
            self.manager.clone(),
            self.fire.clone(),
        ));
        sockets.insert(workflow.id.clone(), SocketHandle { endpoint, task });
        tracing::info!(workflow = %workflow.id, "webhook socket opened");
    }

    /// Close one socket (used by explicit restart requests).
    pub fn close(&self, workflow_id: &str) {
        if let Some(handle) = self.sockets.lock().remove(workflow_id) {
            handle.task.abort();
            self.manager.set_ws_connected(workflow_id, false);
        }
    }

    /// Tear down every socket.
    pub fn dispose_all(&self) {
        let mut sockets = self.sockets.lock();
        for (workflow_id, handle) in sockets.drain() {
            handle.task.abort();
            self.manager.set_ws_connected(&workflow_id, false);
        }
    }

    pub fn open_count(&self) -> usize {
        self.sockets.lock().len()
    }
}

/// Connect, read, reconnect forever (until aborted).
async fn socket_loop(
    workflow_id: String,
    endpoint: String,
    manager: Arc<WorkflowManager>,
    fire: Arc<TriggerFire>,
) {
    let mut dedupe: HashMap<String, u64> = HashMap::new();

    loop {
        match connect_async(&endpoint).await {
            Ok((ws, _)) => {
                manager.set_ws_connected(&workflow_id, true);
                tracing::info!(workflow = %workflow_id, endpoint = %endpoint, "webhook connected");

                let (_, mut stream) = ws.split();
                while let Some(msg) = stream.next().await {
                    match msg {
                        Ok(WsMessage::Text(text)) => {
                            handle_message(&manager, &fire, &workflow_id, &text, &mut dedupe);
                        }
                        Ok(WsMessage::Binary(data)) => {
                            if let Ok(text) = String::from_utf8(data) {
                                handle_message(&manager, &fire, &workflow_id, &text, &mut dedupe);
                            }
                        }
                        Ok(WsMessage::Close(_)) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
                tracing::warn!(workflow = %workflow_id, "webhook disconnected");
            }
            Err(e) => {
                tracing::warn!(workflow = %workflow_id, "webhook connect failed: {e}");
            }
        }

        manager.set_ws_connected(&workflow_id, false);
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

#[derive(Deserialize)]
struct WsEnvelope {
    event: String,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

/// Match one incoming message against the workflow's enabled webhook
/// triggers.
fn handle_message(
    manager: &WorkflowManager,
    fire: &TriggerFire,
    workflow_id: &str,
    raw: &str,
    dedupe: &mut HashMap<String, u64>,
) {
    let Some(workflow) = manager.get(workflow_id) else {
        return;
    };
    let triggers: Vec<_> = workflow
        .triggers
        .iter()
        .filter(|t| t.enabled && matches!(t.config, TriggerConfig::WebhookWs(_)))
        .collect();
    if triggers.is_empty() {
        return;
    }

    let text = raw.trim();
    if text.is_empty() {
        return;
    }

    // Structured messages carry {event, channel?, token?}; anything else is
    // treated as a bare event name.
    let (event_name, channel, token) = match serde_json::from_str::<WsEnvelope>(text) {
        Ok(envelope) => (envelope.event, envelope.channel, envelope.token),
        Err(_) => (text.to_string(), None, None),
    };
    if event_name.is_empty() {
        return;
    }

    let now = now_ms();
    for trigger in triggers {
        let TriggerConfig::WebhookWs(cfg) = &trigger.config else {
            continue;
        };
        if !message_matches(cfg, &event_name, channel.as_deref(), token.as_deref()) {
            tracing::debug!(trigger = %trigger.id, event = %event_name, "webhook message did not match");
            continue;
        }

        let last = dedupe.get(&trigger.id).copied().unwrap_or(0);
        if cfg.dedupe_window_ms > 0 && now.saturating_sub(last) < cfg.dedupe_window_ms {
            tracing::debug!(trigger = %trigger.id, "webhook message deduped");
            continue;
        }

        dedupe.insert(trigger.id.clone(), now);
        fire.fire(workflow_id, trigger, StartContext::default());
    }
}

/// Event name must match exactly; channel matches when unset, equal, or
/// configured as "default" against an empty incoming channel; the auth
/// token must match exactly when configured.
fn message_matches(
    cfg: &WebhookWsConfig,
    event_name: &str,
    channel: Option<&str>,
    token: Option<&str>,
) -> bool {
    if cfg.event_name.trim() != event_name {
        return false;
    }

    let cfg_channel = cfg.channel.as_deref().unwrap_or("").trim();
    let incoming_channel = channel.unwrap_or("").trim();
    let channel_ok = cfg_channel.is_empty()
        || cfg_channel == incoming_channel
        || (cfg_channel == "default" && incoming_channel.is_empty());
    if !channel_ok {
        return false;
    }

    match cfg.auth_token.as_deref().filter(|t| !t.is_empty()) {
        Some(expected) => token == Some(expected),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(event: &str, channel: Option<&str>, token: Option<&str>) -> WebhookWsConfig {
        WebhookWsConfig {
            event_name: event.to_string(),
            channel: channel.map(|s| s.to_string()),
            auth_token: token.map(|s| s.to_string()),
            dedupe_window_ms: 0,
        }
    }

    #[test]
    fn test_event_name_exact_match() {
        let c = cfg("deploy", None, None);
        assert!(message_matches(&c, "deploy", None, None));
        assert!(!message_matches(&c, "deploy:done", None, None));
    }

    #[test]
    fn test_channel_matching() {
        let open = cfg("go", None, None);
        assert!(message_matches(&open, "go", Some("anything"), None));

        let scoped = cfg("go", Some("builds"), None);
        assert!(message_matches(&scoped, "go", Some("builds"), None));
        assert!(!message_matches(&scoped, "go", Some("other"), None));
        assert!(!message_matches(&scoped, "go", None, None));

        // "default" stands in for an empty incoming channel.
        let default = cfg("go", Some("default"), None);
        assert!(message_matches(&default, "go", None, None));
        assert!(message_matches(&default, "go", Some("default"), None));
    }

    #[test]
    fn test_token_matching() {
        let locked = cfg("go", None, Some("secret"));
        assert!(message_matches(&locked, "go", None, Some("secret")));
        assert!(!message_matches(&locked, "go", None, Some("wrong")));
        assert!(!message_matches(&locked, "go", None, None));
    }

    #[test]
    fn test_should_connect_gate() {
        use crate::workflow::schema::{Trigger, TriggerConfig, Workflow, WorkflowStatus};

        let mut workflow = Workflow::new("WS");
        assert!(!ConnectionManager::should_connect(&workflow));

        workflow.settings.ws_endpoint = Some(PLACEHOLDER_ENDPOINT.to_string());
        assert!(!ConnectionManager::should_connect(&workflow));

        workflow.settings.ws_endpoint = Some("wss://hooks.a.test/ws".to_string());
        // Paused and nothing requested: no socket.
        assert!(!ConnectionManager::should_connect(&workflow));

        workflow.triggers.push(Trigger {
            id: "t1".to_string(),
            name: "hook".to_string(),
            enabled: true,
            config: TriggerConfig::WebhookWs(cfg("go", None, None)),
            last_event: None,
        });
        // Still paused; triggers alone are not enough.
        assert!(!ConnectionManager::should_connect(&workflow));

        workflow.status = WorkflowStatus::Idle;
        assert!(ConnectionManager::should_connect(&workflow));

        // Paused again, but the user explicitly requested the connection.
        workflow.status = WorkflowStatus::Paused;
        workflow.settings.ws_connect_requested = true;
        assert!(ConnectionManager::should_connect(&workflow));
    }
}
