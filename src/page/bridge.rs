//! WebSocket transport to the page bridge.
//!
//! The bridge relays engine commands into the browser side and forwards
//! page responses and push events back. One socket per engine process.

use crate::page::controller::PageError;
use crate::page::rpc::{MessageTransport, RpcPageController};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

/// Transport writing frames through an outbound channel owned by the
/// writer task.
pub struct WsBridgeTransport {
    tx: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl MessageTransport for WsBridgeTransport {
    async fn send(&self, text: String) -> Result<(), PageError> {
        self.tx
            .send(text)
            .map_err(|_| PageError::Transport("Bridge connection closed".to_string()))
    }
}

/// Connect to the bridge and return a ready page controller.
///
/// Spawns a writer task (channel -> sink) and a reader task feeding
/// responses and push events into the controller. Both tasks end when the
/// socket closes; subsequent commands fail with a transport error.
pub async fn connect_bridge(
    endpoint: &str,
    rpc_timeout: Duration,
) -> Result<Arc<RpcPageController>, PageError> {
    let (ws, _) = connect_async(endpoint)
        .await
        .map_err(|e| PageError::Transport(format!("Failed to connect bridge: {e}")))?;
    let (mut sink, mut stream) = ws.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let controller = Arc::new(RpcPageController::new(
        Arc::new(WsBridgeTransport { tx }),
        rpc_timeout,
    ));

    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(WsMessage::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    let reader_controller = controller.clone();
    tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(WsMessage::Text(text)) => reader_controller.handle_incoming(&text),
                Ok(WsMessage::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
        tracing::warn!("Bridge connection closed");
    });

    Ok(controller)
}
