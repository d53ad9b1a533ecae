//! The PageController seam.
//!
//! Everything that touches a real page goes through this trait; the engine
//! never reaches into the DOM itself. Production uses the RPC client over
//! the bridge transport, tests plug in mocks.

use crate::page::protocol::{Cookie, PageCommand, PageEvent, PageReply, TabInfo, TabQuery};
use crate::workflow::schema::Condition;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Error, Debug, Clone)]
pub enum PageError {
    #[error("Page command timed out")]
    Timeout,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("No tab available to run this step")]
    NoTab,

    #[error("{0}")]
    Failed(String),
}

/// Executes atomic commands against the target browser.
#[async_trait]
pub trait PageController: Send + Sync {
    /// Run one command against `tab` (or the session when `tab` is None).
    async fn execute(
        &self,
        tab: Option<i64>,
        command: PageCommand,
    ) -> Result<PageReply, PageError>;

    /// Stream of browser events (navigation, tab updates/activation).
    fn subscribe_events(&self) -> broadcast::Receiver<PageEvent>;

    async fn query_tabs(&self, query: TabQuery) -> Result<Vec<TabInfo>, PageError> {
        match self.execute(None, PageCommand::QueryTabs { query }).await? {
            PageReply::Tabs { tabs } => Ok(tabs),
            other => Err(unexpected_reply("tabs", &other)),
        }
    }

    /// First tab matching the query, if any.
    async fn find_tab(&self, query: TabQuery) -> Result<Option<TabInfo>, PageError> {
        Ok(self.query_tabs(query).await?.into_iter().next())
    }

    async fn check_condition(
        &self,
        tab: Option<i64>,
        condition: Condition,
    ) -> Result<bool, PageError> {
        match self
            .execute(tab, PageCommand::CheckCondition { condition })
            .await?
        {
            PageReply::Condition { result } => Ok(result),
            other => Err(unexpected_reply("condition", &other)),
        }
    }

    async fn run_fallback(&self, tab: Option<i64>, code: String) -> Result<(), PageError> {
        self.execute(tab, PageCommand::RunFallback { code })
            .await
            .map(|_| ())
    }

    async fn get_cookies(
        &self,
        tab: Option<i64>,
        all: bool,
        domain: Option<String>,
        names: Vec<String>,
    ) -> Result<Vec<Cookie>, PageError> {
        match self
            .execute(tab, PageCommand::GetCookies { all, domain, names })
            .await?
        {
            PageReply::Cookies { cookies } => Ok(cookies),
            other => Err(unexpected_reply("cookies", &other)),
        }
    }

    async fn get_page_source(&self, tab: Option<i64>) -> Result<String, PageError> {
        match self.execute(tab, PageCommand::GetPageSource).await? {
            PageReply::PageSource { html } => Ok(html),
            other => Err(unexpected_reply("page source", &other)),
        }
    }
}

fn unexpected_reply(expected: &str, got: &PageReply) -> PageError {
    PageError::Transport(format!("expected {expected} reply, got {got:?}"))
}
