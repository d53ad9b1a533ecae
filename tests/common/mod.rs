//! Shared test double: a scriptable in-memory PageController.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tabflow_lib::page::{PageCommand, PageController, PageError, PageEvent, PageReply, TabInfo};
use tabflow_lib::workflow::schema::BrowserEventKind;
use tokio::sync::{broadcast, Notify};

/// In-memory page controller driven by the tests.
pub struct MockPage {
    events_tx: broadcast::Sender<PageEvent>,
    /// Every executed command, in order.
    pub commands: Mutex<Vec<PageCommand>>,
    /// Current tab URL reported by queries and updated by Navigate.
    pub current_url: Mutex<String>,
    /// Selector -> remaining failure count; a command touching the selector
    /// fails while the count is positive.
    pub failures: Mutex<HashMap<String, u32>>,
    /// Scripted result for condition checks.
    pub condition_result: Mutex<bool>,
    /// Extracted value handed back by extract commands.
    pub extract_value: Mutex<serde_json::Value>,
    /// When set, click commands signal `entered` and then wait for `proceed`.
    pub gate_clicks: Mutex<bool>,
    pub entered: Arc<Notify>,
    pub proceed: Arc<Notify>,
}

impl Default for MockPage {
    fn default() -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            events_tx,
            commands: Mutex::new(Vec::new()),
            current_url: Mutex::new("https://a.test/".to_string()),
            failures: Mutex::new(HashMap::new()),
            condition_result: Mutex::new(true),
            extract_value: Mutex::new(serde_json::json!("hello")),
            gate_clicks: Mutex::new(false),
            entered: Arc::new(Notify::new()),
            proceed: Arc::new(Notify::new()),
        }
    }
}

impl MockPage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_times(&self, selector: &str, times: u32) {
        self.failures.lock().insert(selector.to_string(), times);
    }

    /// Push a browser event as if the page side had broadcast it.
    pub fn push_event(&self, event: PageEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn command_count(&self) -> usize {
        self.commands.lock().len()
    }

    fn take_failure(&self, selector: &str) -> bool {
        let mut failures = self.failures.lock();
        match failures.get_mut(selector) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl PageController for MockPage {
    async fn execute(
        &self,
        _tab: Option<i64>,
        command: PageCommand,
    ) -> Result<PageReply, PageError> {
        self.commands.lock().push(command.clone());

        match command {
            PageCommand::QueryTabs { .. } => Ok(PageReply::Tabs {
                tabs: vec![TabInfo {
                    id: 1,
                    url: Some(self.current_url.lock().clone()),
                    active: true,
                }],
            }),
            PageCommand::Navigate { url } => {
                *self.current_url.lock() = url.clone();
                let _ = self.events_tx.send(PageEvent {
                    event: BrowserEventKind::NavigationCompleted,
                    tab_id: Some(1),
                    url: Some(url),
                    active: Some(true),
                });
                Ok(PageReply::Ack)
            }
            PageCommand::Click { selector, .. } => {
                if *self.gate_clicks.lock() {
                    self.entered.notify_one();
                    self.proceed.notified().await;
                }
                if self.take_failure(&selector) {
                    Err(PageError::Failed("Element not found".to_string()))
                } else {
                    Ok(PageReply::Ack)
                }
            }
            PageCommand::TypeText { selector, .. } | PageCommand::Select { selector, .. } => {
                if self.take_failure(&selector) {
                    Err(PageError::Failed("Element not found".to_string()))
                } else {
                    Ok(PageReply::Ack)
                }
            }
            PageCommand::Extract { extract, .. } => {
                if self.take_failure(&extract.selector) {
                    Err(PageError::Failed("Extracted value is empty".to_string()))
                } else {
                    let value = self.extract_value.lock().clone();
                    Ok(PageReply::Extracted {
                        value: value.clone(),
                        values: vec![value],
                        raw_values: vec!["hello".to_string()],
                        used_default: false,
                    })
                }
            }
            PageCommand::CheckCondition { .. } => Ok(PageReply::Condition {
                result: *self.condition_result.lock(),
            }),
            PageCommand::RunFallback { .. } => Ok(PageReply::Ack),
            PageCommand::Screenshot { .. } => Ok(PageReply::Screenshot {
                data_url: "data:image/png;base64,ZmFrZQ==".to_string(),
                base64: Some("ZmFrZQ==".to_string()),
                width: Some(800),
                height: Some(600),
            }),
            PageCommand::GetCookies { .. } => Ok(PageReply::Cookies { cookies: vec![] }),
            PageCommand::GetPageSource => Ok(PageReply::PageSource {
                html: "<html></html>".to_string(),
            }),
            PageCommand::Wait { .. }
            | PageCommand::Scroll { .. }
            | PageCommand::Download { .. } => Ok(PageReply::Ack),
            PageCommand::Evaluate { .. } => Ok(PageReply::Evaluated {
                result: serde_json::json!(true),
            }),
        }
    }

    fn subscribe_events(&self) -> broadcast::Receiver<PageEvent> {
        self.events_tx.subscribe()
    }
}
