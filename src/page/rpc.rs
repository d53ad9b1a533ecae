//! Typed request/response client over a message transport.
//!
//! Requests carry a generated id; the matching response resolves a oneshot
//! waiter. Every call is bounded by the client timeout, and a timed-out
//! waiter is removed from the pending map so late responses are dropped.
//! Push messages (browser events) fan out on a broadcast channel.

use crate::page::controller::{PageController, PageError};
use crate::page::protocol::{PageCommand, PageEvent, PageReply};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};

/// Buffered page events per subscriber.
const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Sends raw text frames toward the page side.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send(&self, text: String) -> Result<(), PageError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RpcRequest<'a> {
    request_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    tab_id: Option<i64>,
    payload: &'a PageCommand,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcIncoming {
    #[serde(default)]
    request_id: Option<String>,
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    reply: Option<PageReply>,
    #[serde(default)]
    push: bool,
    #[serde(default)]
    event: Option<PageEvent>,
}

/// PageController implementation speaking the RPC protocol.
pub struct RpcPageController {
    transport: Arc<dyn MessageTransport>,
    pending: Mutex<HashMap<String, oneshot::Sender<Result<PageReply, PageError>>>>,
    events_tx: broadcast::Sender<PageEvent>,
    timeout: Duration,
}

impl RpcPageController {
    pub fn new(transport: Arc<dyn MessageTransport>, timeout: Duration) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            transport,
            pending: Mutex::new(HashMap::new()),
            events_tx,
            timeout,
        }
    }

    /// Feed one raw frame from the transport's read side.
    pub fn handle_incoming(&self, text: &str) {
        let incoming: RpcIncoming = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("Dropping unparseable bridge frame: {e}");
                return;
            }
        };

        if incoming.push {
            if let Some(event) = incoming.event {
                let _ = self.events_tx.send(event);
            }
            return;
        }

        let Some(request_id) = incoming.request_id else {
            tracing::warn!("Bridge response without requestId");
            return;
        };

        let waiter = self.pending.lock().remove(&request_id);
        let Some(waiter) = waiter else {
            tracing::debug!(request_id = %request_id, "Late bridge response dropped");
            return;
        };

        let result = if incoming.ok {
            Ok(incoming.reply.unwrap_or(PageReply::Ack))
        } else {
            Err(PageError::Failed(
                incoming.error.unwrap_or_else(|| "Page command failed".to_string()),
            ))
        };
        let _ = waiter.send(result);
    }

    /// Number of in-flight requests (used by tests and shutdown logging).
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

#[async_trait]
impl PageController for RpcPageController {
    async fn execute(
        &self,
        tab: Option<i64>,
        command: PageCommand,
    ) -> Result<PageReply, PageError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), tx);

        let frame = serde_json::to_string(&RpcRequest {
            request_id: &request_id,
            tab_id: tab,
            payload: &command,
        })
        .map_err(|e| PageError::Transport(e.to_string()))?;

        if let Err(e) = self.transport.send(frame).await {
            self.pending.lock().remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                self.pending.lock().remove(&request_id);
                Err(PageError::Transport("Response channel closed".to_string()))
            }
            Err(_) => {
                self.pending.lock().remove(&request_id);
                Err(PageError::Timeout)
            }
        }
    }

    fn subscribe_events(&self) -> broadcast::Receiver<PageEvent> {
        self.events_tx.subscribe()
    }
}
